//! REST API types and router for the escrow orchestrator.
//!
//! This module contains the shared state, handlers and router builder used by
//! the `api` binary and the integration tests.

use crate::lovelace_from_ada;
use crate::sdk::{
    EscrowError, EscrowOrchestrator, EscrowStatus, LockReceipt, LockRequest, LockedOutput,
    Network, OrderStatus, OutputLookup, TxId, WalletConnector, WalletSessionGuard, address,
};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

// ─── App State ───────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<EscrowOrchestrator>,
    pub session: Arc<WalletSessionGuard>,
    /// Wallets a client may connect to, by name.
    pub wallets: Arc<HashMap<String, Arc<dyn WalletConnector>>>,
}

impl AppState {
    fn network(&self) -> Network {
        self.orchestrator.script().network()
    }
}

// ─── Request / Response DTOs ─────────────────────────────────

#[derive(Deserialize)]
struct ConnectReq {
    wallet: String,
}

#[derive(Serialize)]
struct SessionResponse {
    connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    account_address: Option<String>,
    network: Network,
}

#[derive(Deserialize)]
struct LockReq {
    #[serde(default)]
    amount_lovelace: Option<u64>,
    #[serde(default)]
    amount_ada: Option<f64>,
    buyer_address: String,
    seller_address: String,
    /// Raw deadline, read in the configured unit.
    #[serde(default)]
    deadline: Option<u64>,
}

#[derive(Deserialize)]
struct OutpointReq {
    tx_id: String,
    output_index: u32,
}

#[derive(Deserialize)]
struct ReleaseReq {
    seller_address: String,
    #[serde(default)]
    buyer_address: Option<String>,
    #[serde(default)]
    output: Option<OutpointReq>,
}

#[derive(Deserialize)]
struct RefundReq {
    buyer_address: String,
    #[serde(default)]
    output: Option<OutpointReq>,
}

#[derive(Serialize)]
struct StatusResponse {
    order_id: String,
    #[serde(flatten)]
    chain: EscrowStatus,
    local: OrderStatus,
}

#[derive(Serialize)]
struct CreatedResponse {
    order_id: String,
    #[serde(flatten)]
    receipt: LockReceipt,
}

#[derive(Serialize)]
struct TxResponse {
    tx_id: TxId,
    status: &'static str,
}

#[derive(Serialize)]
struct ScriptResponse {
    script_hash: String,
    script_address: String,
    plutus_version: crate::sdk::PlutusVersion,
    network: Network,
    script_cbor: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    error: String,
    /// Set for escrow failures: whether the same request may simply be sent again.
    #[serde(skip_serializing_if = "Option::is_none")]
    retryable: Option<bool>,
}

// ─── Error helpers ───────────────────────────────────────────

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<(StatusCode, Json<T>), ApiError>;

fn error(status: StatusCode, msg: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: msg.into(),
            retryable: None,
        }),
    )
}

fn bad_request(msg: impl Into<String>) -> ApiError {
    error(StatusCode::BAD_REQUEST, msg)
}

fn not_found(msg: impl Into<String>) -> ApiError {
    error(StatusCode::NOT_FOUND, msg)
}

pub fn status_for(e: &EscrowError) -> StatusCode {
    match e {
        EscrowError::InvalidInput(_) | EscrowError::DatumDecodeFailure(_) => {
            StatusCode::BAD_REQUEST
        }
        EscrowError::SessionUnavailable(_) => StatusCode::UNAUTHORIZED,
        EscrowError::InsufficientFunds(_) => StatusCode::PAYMENT_REQUIRED,
        EscrowError::SigningRejected(_) => StatusCode::FORBIDDEN,
        EscrowError::ScriptMismatch(_) | EscrowError::OutputAlreadySpent { .. } => {
            StatusCode::CONFLICT
        }
        EscrowError::SubmissionFailure(_)
        | EscrowError::ConfirmationTimeout { .. }
        | EscrowError::Indexer(_) => StatusCode::BAD_GATEWAY,
        EscrowError::InvalidConfig(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn escrow_error(e: EscrowError) -> ApiError {
    let status = status_for(&e);
    if status.is_server_error() {
        warn!(%status, "request failed: {e}");
    }
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            retryable: Some(e.is_retryable()),
        }),
    )
}

// ─── Helpers ─────────────────────────────────────────────────

fn parse_address(state: &AppState, text: &str, field: &str) -> Result<address::Address, ApiError> {
    address::normalize(text, Some(state.network()))
        .map_err(|e| bad_request(format!("{field}: {e}")))
}

fn resolve_amount(req: &LockReq) -> Result<u64, ApiError> {
    match (req.amount_lovelace, req.amount_ada) {
        (Some(lovelace), None) => Ok(lovelace),
        (None, Some(ada)) => lovelace_from_ada(ada).map_err(escrow_error),
        _ => Err(bad_request(
            "exactly one of amount_lovelace or amount_ada is required",
        )),
    }
}

/// The output to spend: the requested outpoint, or the first one whose datum
/// names the order.
async fn resolve_output(
    state: &AppState,
    order_id: &str,
    outpoint: Option<&OutpointReq>,
) -> Result<LockedOutput, ApiError> {
    let Some(outpoint) = outpoint else {
        return state
            .orchestrator
            .find_exact(order_id)
            .await
            .map_err(escrow_error)?
            .into_iter()
            .next()
            .ok_or_else(|| not_found(format!("no escrow output for order {order_id}")));
    };

    let tx_id: TxId = outpoint
        .tx_id
        .parse()
        .map_err(|e| bad_request(format!("tx_id: {e}")))?;
    let output = state
        .orchestrator
        .find_all()
        .await
        .map_err(escrow_error)?
        .into_iter()
        .find(|o| o.same_outpoint(&tx_id, outpoint.output_index))
        .ok_or_else(|| not_found(format!("{tx_id}#{} is not at the script address", outpoint.output_index)))?;
    if let Some(datum) = &output.datum
        && !datum.matches_order(order_id)
    {
        return Err(bad_request(format!(
            "output belongs to order {}",
            datum.order_id_lossy()
        )));
    }
    Ok(output)
}

// ─── Session ─────────────────────────────────────────────────

fn session_response(state: &AppState) -> SessionResponse {
    let current = state.session.current();
    SessionResponse {
        connected: current.is_some(),
        account_address: current.map(|s| s.account_address.to_string()),
        network: state.network(),
    }
}

async fn connect_session(
    State(state): State<AppState>,
    Json(req): Json<ConnectReq>,
) -> ApiResult<SessionResponse> {
    let connector = state
        .wallets
        .get(&req.wallet)
        .cloned()
        .ok_or_else(|| not_found(format!("unknown wallet {}", req.wallet)))?;
    state
        .session
        .connect(connector.as_ref(), state.network())
        .await
        .map_err(escrow_error)?;
    Ok((StatusCode::OK, Json(session_response(&state))))
}

async fn disconnect_session(State(state): State<AppState>) -> ApiResult<SessionResponse> {
    state.session.disconnect();
    Ok((StatusCode::OK, Json(session_response(&state))))
}

async fn get_session(State(state): State<AppState>) -> ApiResult<SessionResponse> {
    Ok((StatusCode::OK, Json(session_response(&state))))
}

// ─── POST /escrow/{order_id}/lock ────────────────────────────

async fn lock_order(state: &AppState, order_id: String, req: LockReq) -> Result<LockReceipt, ApiError> {
    let amount = resolve_amount(&req)?;
    let buyer = parse_address(state, &req.buyer_address, "buyer_address")?;
    let seller = parse_address(state, &req.seller_address, "seller_address")?;
    let unit = state.orchestrator.settings().deadline_unit;

    state
        .orchestrator
        .lock(
            &state.session,
            LockRequest {
                order_id,
                amount,
                buyer,
                seller,
                deadline: req.deadline.map(|d| unit.wrap(d)),
            },
        )
        .await
        .map_err(escrow_error)
}

async fn lock_escrow(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
    Json(req): Json<LockReq>,
) -> ApiResult<LockReceipt> {
    let receipt = lock_order(&state, order_id, req).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

// ─── POST /escrow ────────────────────────────────────────────

/// Lock under a freshly generated order id.
async fn create_escrow(
    State(state): State<AppState>,
    Json(req): Json<LockReq>,
) -> ApiResult<CreatedResponse> {
    let order_id = Uuid::new_v4().to_string();
    let receipt = lock_order(&state, order_id.clone(), req).await?;
    Ok((StatusCode::CREATED, Json(CreatedResponse { order_id, receipt })))
}

// ─── GET /escrow/{order_id} ──────────────────────────────────

async fn get_escrow(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> ApiResult<StatusResponse> {
    let chain = state
        .orchestrator
        .check_status(&order_id)
        .await
        .map_err(escrow_error)?;
    let local = state.orchestrator.order_status(&order_id);
    Ok((
        StatusCode::OK,
        Json(StatusResponse {
            order_id,
            chain,
            local,
        }),
    ))
}

async fn get_outputs(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> ApiResult<OutputLookup> {
    let lookup = state
        .orchestrator
        .find_locked_outputs(&order_id)
        .await
        .map_err(escrow_error)?;
    Ok((StatusCode::OK, Json(lookup)))
}

// ─── POST /escrow/{order_id}/release ─────────────────────────

async fn release_escrow(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
    Json(req): Json<ReleaseReq>,
) -> ApiResult<TxResponse> {
    let seller = parse_address(&state, &req.seller_address, "seller_address")?;
    let buyer = req
        .buyer_address
        .as_deref()
        .map(|b| parse_address(&state, b, "buyer_address"))
        .transpose()?;
    let output = resolve_output(&state, &order_id, req.output.as_ref()).await?;

    let tx_id = state
        .orchestrator
        .release(&state.session, &output, &seller, buyer.as_ref())
        .await
        .map_err(escrow_error)?;
    Ok((
        StatusCode::OK,
        Json(TxResponse {
            tx_id,
            status: "released",
        }),
    ))
}

// ─── POST /escrow/{order_id}/refund ──────────────────────────

async fn refund_escrow(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
    Json(req): Json<RefundReq>,
) -> ApiResult<TxResponse> {
    let buyer = parse_address(&state, &req.buyer_address, "buyer_address")?;
    let output = resolve_output(&state, &order_id, req.output.as_ref()).await?;

    let tx_id = state
        .orchestrator
        .refund(&state.session, &output, &buyer)
        .await
        .map_err(escrow_error)?;
    Ok((
        StatusCode::OK,
        Json(TxResponse {
            tx_id,
            status: "refunded",
        }),
    ))
}

// ─── GET /script ─────────────────────────────────────────────

async fn get_script(State(state): State<AppState>) -> ApiResult<ScriptResponse> {
    let script = state.orchestrator.script();
    Ok((
        StatusCode::OK,
        Json(ScriptResponse {
            script_hash: script.script_hash.to_string(),
            script_address: script.derived_address.to_string(),
            plutus_version: script.version,
            network: script.network(),
            script_cbor: hex::encode(&script.script_bytes),
        }),
    ))
}

// ─── Router builder ──────────────────────────────────────────

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/session", get(get_session))
        .route("/session/connect", post(connect_session))
        .route("/session/disconnect", post(disconnect_session))
        .route("/escrow", post(create_escrow))
        .route("/escrow/{order_id}", get(get_escrow))
        .route("/escrow/{order_id}/outputs", get(get_outputs))
        .route("/escrow/{order_id}/lock", post(lock_escrow))
        .route("/escrow/{order_id}/release", post(release_escrow))
        .route("/escrow/{order_id}/refund", post(refund_escrow))
        .route("/script", get(get_script))
        .with_state(state)
}

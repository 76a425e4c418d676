//! REST API for the escrow orchestrator, backed by the in-memory ledger.
//!
//! Usage:
//!   ESCROW_SCRIPT_CBOR=<validator hex> cargo run --bin api
//!
//! Two demo wallets, `buyer` and `seller`, are registered on start-up.

use cardano_escrow_lab::api::{AppState, build_router};
use cardano_escrow_lab::config::EscrowSettings;
use cardano_escrow_lab::generate_key_hash;
use cardano_escrow_lab::sdk::{
    Clock, EscrowOrchestrator, MemoryLedger, SystemClock, WalletConnector, WalletSessionGuard,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEMO_FUNDS: u64 = 1_000_000_000;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = EscrowSettings::from_env()?;
    info!(
        network = %settings.network,
        script_hash = %settings.script.script_hash,
        script_address = %settings.script.derived_address,
        "escrow validator loaded"
    );

    let ledger = MemoryLedger::new(settings.network, SystemClock.now_secs());
    start_ledger_clock(ledger.clone());
    let mut wallets: HashMap<String, Arc<dyn WalletConnector>> = HashMap::new();
    for label in ["buyer", "seller"] {
        let address = ledger.add_wallet(label, generate_key_hash(), DEMO_FUNDS);
        info!(wallet = label, %address, "demo wallet funded");
        wallets.insert(label.to_string(), Arc::new(ledger.connector(label)));
    }

    let orchestrator = EscrowOrchestrator::new(
        settings.script.clone(),
        Arc::new(ledger.clone()),
        Arc::new(ledger),
        settings.orchestrator,
    );
    let state = AppState {
        orchestrator: Arc::new(orchestrator),
        session: Arc::new(WalletSessionGuard::new()),
        wallets: Arc::new(wallets),
    };

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.listen_addr).await?;
    info!("listening on http://{}", settings.listen_addr);
    info!("  POST /session/connect               Connect a wallet {{\"wallet\": \"buyer\"}}");
    info!("  POST /escrow                        Lock under a generated order id");
    info!("  POST /escrow/{{order_id}}/lock         Lock funds at the script address");
    info!("  GET  /escrow/{{order_id}}              Chain status + local mirror");
    info!("  POST /escrow/{{order_id}}/release      Release to seller");
    info!("  POST /escrow/{{order_id}}/refund       Refund to buyer after the deadline");
    info!("  GET  /script                        Validator hash and address");

    axum::serve(listener, app).await?;

    Ok(())
}

/// Keep the simulated ledger's slot time in step with the wall clock.
fn start_ledger_clock(ledger: MemoryLedger) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            interval.tick().await;
            ledger.set_time(SystemClock.now_secs());
        }
    })
}

pub mod address;
pub mod balance;
pub mod cbor;
pub mod chain;
pub mod datum;
pub mod error;
pub mod memory;
pub mod orchestrator;
pub mod plutus;
pub mod script;
pub mod tx;
pub mod wallet;

pub use address::{Address, Credential, Network};
pub use chain::{ChainIndexer, Clock, KeyHash, LockedOutput, ScriptHash, SystemClock, TxId, Utxo};
pub use datum::{Deadline, DeadlineUnit, EscrowRecord, EscrowRedeemer};
pub use error::{AddressError, ConsistencyError, DecodeError, EscrowError, WalletError};
pub use memory::MemoryLedger;
pub use orchestrator::{
    EscrowOrchestrator, EscrowPhase, EscrowStatus, LockReceipt, LockRequest, MatchKind,
    OrchestratorSettings, OrderStatus, OutputLookup,
};
pub use plutus::PlutusData;
pub use script::{PlutusVersion, ScriptIdentity};
pub use tx::{TxDraft, TxKind, ValidityInterval};
pub use wallet::{AccountPolicy, SigningHandle, WalletConnector, WalletSession, WalletSessionGuard};

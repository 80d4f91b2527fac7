//! Stake ledger core: entities, storage, and the settlement engine.

pub mod error;
pub mod memory;
pub mod pg;
pub mod service;
pub mod store;
pub mod types;

pub use error::StakeError;
pub use memory::MemoryLedgerStore;
pub use pg::PgLedgerStore;
pub use service::{EscrowAccounts, StakeService};
pub use store::{LedgerStore, StoreError};
pub use types::{
    OperationId, Pool, PoolSummary, RefundOutcome, SettlementOutcome, Stake, StakeStatus,
    StakeWithTransfers, Transfer, TransferDirection, User,
};

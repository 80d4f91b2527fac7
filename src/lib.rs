//! FlowStake - Stake Ledger & Settlement Engine
//!
//! Escrows user funds as stakes, pushes partial refunds back to user cards
//! over the payment network, and sweeps unreturned balances into a shared
//! pool when a stake closes.
//!
//! # Modules
//!
//! - [`ledger`] - Entities, storage contract and the settlement engine
//! - [`visa`] - Payment network client (Visa Direct + simulated backend)
//! - [`gateway`] - Axum HTTP surface
//! - [`db`] - PostgreSQL connection pool
//! - [`config`] / [`logging`] - Runtime wiring

pub mod config;
pub mod db;
pub mod gateway;
pub mod ledger;
pub mod logging;
pub mod visa;

// Convenient re-exports at crate root
pub use ledger::{
    EscrowAccounts, LedgerStore, MemoryLedgerStore, PgLedgerStore, StakeError, StakeService,
    StoreError,
};
pub use visa::{CardVault, MockPaymentNetwork, PaymentNetworkClient, VisaDirectClient};

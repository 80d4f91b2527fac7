//! FlowStake - Stake Ledger & Settlement Engine
//!
//! Wiring:
//!
//! ```text
//! ┌──────────┐    ┌──────────────┐    ┌──────────────┐    ┌──────────┐
//! │  Config  │───▶│ LedgerStore  │───▶│ StakeService │───▶│ Gateway  │
//! │  (YAML)  │    │ (PG/memory)  │    │ (settlement) │    │  (axum)  │
//! └──────────┘    └──────────────┘    └──────────────┘    └──────────┘
//! ```
//!
//! Without a `postgres_url` the engine runs in simulation mode: in-memory
//! ledger plus the mock payment network, enough for local development.

use std::sync::Arc;

use flowstake::config::AppConfig;
use flowstake::db::Database;
use flowstake::gateway;
use flowstake::ledger::{EscrowAccounts, LedgerStore, MemoryLedgerStore, PgLedgerStore, StakeService};
use flowstake::visa::{
    CardCredential, MockPaymentNetwork, PaymentNetworkClient, StaticCardVault, VisaDirectClient,
};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

/// Get port override from command line (--port argument)
fn get_port_override() -> Option<u16> {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if args[i] == "--port" && i + 1 < args.len() {
            return args[i + 1].parse().ok();
        }
    }
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env);
    let _log_guard = flowstake::logging::init_logging(&config);

    tracing::info!("Starting FlowStake settlement engine in {} mode", env);

    let store: Arc<dyn LedgerStore> = match &config.postgres_url {
        Some(url) => {
            let db = Database::connect(url).await?;
            db.health_check().await?;
            Arc::new(PgLedgerStore::new(db.pool().clone()))
        }
        None => {
            println!("⚠️  No postgres_url configured: in-memory ledger (simulation mode)");
            Arc::new(MemoryLedgerStore::new())
        }
    };

    let network: Arc<dyn PaymentNetworkClient> = if config.visa.mock {
        if !cfg!(feature = "mock-network") {
            anyhow::bail!("visa.mock requested but the mock-network feature is disabled");
        }
        println!("⚠️  Simulated payment network: no real funds move");
        Arc::new(MockPaymentNetwork::new())
    } else {
        Arc::new(VisaDirectClient::new(&config.visa).map_err(|e| anyhow::anyhow!("{e}"))?)
    };
    tracing::info!("Payment network backend: {}", network.name());

    // Dev vault: every user refunds to the configured recipient test card,
    // never the escrow sender itself. A real deployment swaps this for the
    // tokenization service client.
    let vault = Arc::new(StaticCardVault::new(
        config.vault.pan.clone(),
        config.vault.expiry.clone(),
    ));

    let service = Arc::new(StakeService::new(
        store,
        network,
        vault,
        EscrowAccounts {
            escrow_card: CardCredential {
                pan: config.escrow.pan.clone(),
                expiry: config.escrow.expiry.clone(),
            },
            pool_pan: config.escrow.pool_pan.clone(),
        },
        config.policy.recipient_validation,
    ));

    let port = get_port_override().unwrap_or(config.gateway.port);
    gateway::run_server(&config.gateway.host, port, service).await;
    Ok(())
}

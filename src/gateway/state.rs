//! Shared gateway state

use std::sync::Arc;

use crate::ledger::StakeService;

/// State shared across all gateway handlers.
pub struct AppState {
    pub service: Arc<StakeService>,
}

impl AppState {
    pub fn new(service: Arc<StakeService>) -> Self {
        Self { service }
    }
}

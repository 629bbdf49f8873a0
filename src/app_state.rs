use std::sync::Arc;

use crate::{
    config::Config, db::LedgerStore, lightning::PaymentBackend, payment::PaymentOrchestrator,
    withdraw::WithdrawSession,
};

#[derive(Clone)]
pub struct AppState {
    pub store: LedgerStore,
    pub config: Arc<Config>,
    pub backend: Arc<dyn PaymentBackend>,
}

impl AppState {
    pub fn withdraw_session(&self) -> WithdrawSession {
        WithdrawSession::new(self.store.clone(), self.config.clone())
    }

    pub fn payment_orchestrator(&self) -> PaymentOrchestrator {
        PaymentOrchestrator::new(self.store.clone(), self.config.clone(), self.backend.clone())
    }
}

#[cfg(test)]
impl AppState {
    pub fn for_tests(store: LedgerStore, backend: Arc<dyn PaymentBackend>) -> Self {
        Self {
            store,
            config: Arc::new(Config::for_tests()),
            backend,
        }
    }
}

use std::sync::Arc;

use crate::services::ledger::CheckoutLedger;

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<CheckoutLedger>,
    pub jwt_secret: Arc<str>,
}

impl AppState {
    pub fn new(ledger: CheckoutLedger, jwt_secret: &str) -> Self {
        Self {
            ledger: Arc::new(ledger),
            jwt_secret: Arc::from(jwt_secret),
        }
    }
}

use std::sync::Arc;

use crate::auth::TokenVerifier;
use crate::config::Config;
use crate::hub::Hub;

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(hub: Arc<Hub>, verifier: Arc<dyn TokenVerifier>, config: Arc<Config>) -> Self {
        Self {
            hub,
            verifier,
            config,
        }
    }
}

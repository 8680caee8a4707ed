//! Server state

use std::sync::Arc;

use crate::app::state::ActivityTracker;
use crate::jobs::JobLauncher;
use crate::server::auth::AuthPolicy;

/// Server state shared across handlers
pub struct ServerState {
    pub launcher: Arc<dyn JobLauncher>,
    pub auth: AuthPolicy,
    pub activity_tracker: Arc<ActivityTracker>,
}

impl ServerState {
    pub fn new(
        launcher: Arc<dyn JobLauncher>,
        auth: AuthPolicy,
        activity_tracker: Arc<ActivityTracker>,
    ) -> Self {
        Self {
            launcher,
            auth,
            activity_tracker,
        }
    }
}

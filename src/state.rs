//! Application state shared across request handlers.

use std::sync::Arc;

use crate::config::Config;
use crate::fleet::FleetController;
use crate::matches::MatchStore;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor; the
/// reconciler holds its own clones of the inner Arcs.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    fleet: Arc<FleetController>,
    matches: Arc<MatchStore>,
}

impl AppState {
    pub fn new(config: Config, fleet: Arc<FleetController>, matches: Arc<MatchStore>) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                config,
                fleet,
                matches,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn fleet(&self) -> &Arc<FleetController> {
        &self.inner.fleet
    }

    pub fn matches(&self) -> &Arc<MatchStore> {
        &self.inner.matches
    }
}

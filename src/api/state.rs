//! Shared application state handed to every axum handler.

use std::sync::Arc;
use std::time::Instant;

use crate::config::EngineConfig;
use crate::engine::Scheduler;
use crate::registry::RegistryClient;

/// Explicit collaborators passed into the router at construction time,
/// replacing the teacher's global-singleton download service/logger.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub config: Arc<EngineConfig>,
    started_at: Instant,
}

impl AppState {
    pub fn new(scheduler: Arc<Scheduler>, config: Arc<EngineConfig>) -> Self {
        Self { scheduler, config, started_at: Instant::now() }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// A throwaway, unauthenticated client for the size-probe endpoint,
    /// built fresh per request since it only issues one manifest GET.
    pub fn probe_client(&self, source: &crate::coord::Source) -> crate::error::Result<RegistryClient> {
        let source_config = self.config.resolve_source(source)?;
        RegistryClient::new(source_config, false)
    }
}

//! Remote module-status overlay (`GET /api/modules`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use modgate_core::{FetchError, ModuleId};

use crate::ModuleRegistry;

/// One entry of the remote module-status list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleStatus {
    pub id: ModuleId,
    pub enabled: bool,
}

impl ModuleStatus {
    pub fn new(id: impl Into<ModuleId>, enabled: bool) -> Self {
        Self {
            id: id.into(),
            enabled,
        }
    }
}

/// Source of the remote module-status list.
#[async_trait]
pub trait ModuleStatusSource: Send + Sync {
    async fn fetch_statuses(&self) -> Result<Vec<ModuleStatus>, FetchError>;
}

/// Fixed answer, for tests and for running without a backend.
#[derive(Debug, Clone)]
pub struct StaticStatusSource {
    result: Result<Vec<ModuleStatus>, FetchError>,
}

impl StaticStatusSource {
    pub fn ok(statuses: Vec<ModuleStatus>) -> Self {
        Self { result: Ok(statuses) }
    }

    pub fn failing(error: FetchError) -> Self {
        Self { result: Err(error) }
    }
}

#[async_trait]
impl ModuleStatusSource for StaticStatusSource {
    async fn fetch_statuses(&self) -> Result<Vec<ModuleStatus>, FetchError> {
        self.result.clone()
    }
}

impl ModuleRegistry {
    /// Merge this (static) registry with the remote overlay.
    ///
    /// If the fetch fails the static flags are used unchanged; nothing from a
    /// failed fetch is ever applied.
    pub async fn load(&self, source: &dyn ModuleStatusSource) -> ModuleRegistry {
        match source.fetch_statuses().await {
            Ok(statuses) => {
                tracing::info!(
                    version = self.version(),
                    statuses = statuses.len(),
                    "module overlay applied"
                );
                self.with_overlay(&statuses)
            }
            Err(err) => {
                tracing::warn!(error = %err, "module overlay unavailable; using static registry");
                self.clone()
            }
        }
    }
}

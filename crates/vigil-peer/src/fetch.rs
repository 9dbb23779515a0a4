use async_trait::async_trait;
use thiserror::Error;
use vigil_core::activity::ActivityItem;
use vigil_core::state::EntityProfile;

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("entity not found: {0}")]
    NotFound(String),
    #[error("upstream returned status {0}")]
    Status(u16),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Outcome of one fetch cycle for one entity.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// Fresh item list (recency-sorted, already normalized) plus the
    /// entity's current profile.
    Items {
        profile: EntityProfile,
        items: Vec<ActivityItem>,
    },
    /// Cheap freshness probe says nothing changed since the last cycle; the
    /// coordinator skips change detection entirely.
    Unchanged { profile: EntityProfile },
}

/// The external collaborator that talks to the upstream service. Only the
/// leader ever calls this; implementations decide how `Unchanged` is
/// detected (typically by comparing profile recency against their own last
/// observation).
#[async_trait]
pub trait ActivityFetcher: Send + Sync {
    async fn fetch(&self, entity: &str) -> Result<FetchOutcome, FetchError>;
}

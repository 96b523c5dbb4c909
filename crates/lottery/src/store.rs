use async_trait::async_trait;
use thiserror::Error;

use txevents_core::DomainError;

use crate::winner::Winner;

/// Winner store operation error.
///
/// Every variant means the whole call was rolled back: neither the winner
/// row nor its outbox event is visible afterwards.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("winner {0} not found")]
    NotFound(i64),

    /// A constraint rejected the write (e.g. the lottery id is taken).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid winner: {0}")]
    Invalid(String),

    /// The event payload could not be serialized.
    #[error("event serialization failed: {0}")]
    Serialization(String),

    /// Connectivity or any other storage failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<DomainError> for StoreError {
    fn from(err: DomainError) -> Self {
        StoreError::Invalid(err.to_string())
    }
}

/// Transactional writer for winners.
///
/// `insert_winner` writes the winner and a `LotteryConcluded` outbox event in
/// one transaction. It never talks to the bus: forwarding is the relay's job.
#[async_trait]
pub trait WinnerStore: Send + Sync {
    async fn insert_winner(&self, winner: Winner) -> Result<Winner, StoreError>;

    async fn get_winner_by_id(&self, id: i64) -> Result<Winner, StoreError>;
}

#[async_trait]
impl<S> WinnerStore for std::sync::Arc<S>
where
    S: WinnerStore + ?Sized,
{
    async fn insert_winner(&self, winner: Winner) -> Result<Winner, StoreError> {
        (**self).insert_winner(winner).await
    }

    async fn get_winner_by_id(&self, id: i64) -> Result<Winner, StoreError> {
        (**self).get_winner_by_id(id).await
    }
}

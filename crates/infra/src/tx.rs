//! Scoped transaction helper.
//!
//! `in_transaction` begins a transaction, hands it to the body, then commits
//! on `Ok` and rolls back on `Err`. If the body panics, the sqlx
//! `Transaction` is dropped during unwinding, which rolls it back, and the
//! panic keeps propagating.

use std::future::Future;
use std::pin::Pin;

use sqlx::{PgPool, Postgres, Transaction};
use thiserror::Error;
use tracing::warn;

/// Boxed future returned by a transaction body.
pub type TxFuture<'t, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 't>>;

/// Why a transaction did not commit.
#[derive(Debug, Error)]
pub enum TxError<E> {
    #[error("failed to begin transaction: {0}")]
    Begin(#[source] sqlx::Error),

    #[error("failed to commit transaction: {0}")]
    Commit(#[source] sqlx::Error),

    /// The body failed; the transaction was rolled back.
    #[error(transparent)]
    Body(E),
}

/// Run `body` inside one transaction on `pool`.
///
/// ```ignore
/// in_transaction(&pool, move |tx| Box::pin(async move {
///     sqlx::query("INSERT ...").execute(&mut **tx).await.map_err(MyError::from)?;
///     Ok(())
/// })).await?;
/// ```
pub async fn in_transaction<F, T, E>(pool: &PgPool, body: F) -> Result<T, TxError<E>>
where
    F: for<'t> FnOnce(&'t mut Transaction<'static, Postgres>) -> TxFuture<'t, T, E>,
    E: std::fmt::Display,
{
    let mut tx = pool.begin().await.map_err(TxError::Begin)?;

    match body(&mut tx).await {
        Ok(value) => {
            tx.commit().await.map_err(TxError::Commit)?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                // The connection is discarded either way; the body error is the one that matters.
                warn!(error = %err, rollback_error = %rollback_err, "transaction rollback failed");
            }
            Err(TxError::Body(err))
        }
    }
}

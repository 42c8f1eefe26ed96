use super::LockKey;
use sqlx::{Postgres, Transaction};
use thiserror::Error;
use tracing::debug;

/// SQLSTATE raised when `lock_timeout` expires
const LOCK_NOT_AVAILABLE: &str = "55P03";

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock is already held by another transaction")]
    AlreadyHeld,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Lock timeout after {0} seconds")]
    Timeout(u64),
}

/// Transaction-scoped PostgreSQL advisory locks
///
/// Locks taken here belong to the surrounding transaction and are released by
/// PostgreSQL on commit or rollback, so a dropped transaction can never leak one.
pub struct AdvisoryLock;

impl AdvisoryLock {
    /// Block until the lock for `key` is held by `tx`, waiting at most `timeout_secs`.
    pub async fn lock_in_transaction(
        tx: &mut Transaction<'_, Postgres>,
        key: LockKey,
        timeout_secs: u64,
    ) -> Result<(), LockError> {
        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}s", timeout_secs))
            .execute(&mut **tx)
            .await?;

        match sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(key.value())
            .execute(&mut **tx)
            .await
        {
            Ok(_) => {
                debug!("Acquired transaction advisory lock {}", key);
                Ok(())
            }
            Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some(LOCK_NOT_AVAILABLE) => {
                Err(LockError::Timeout(timeout_secs))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Try to take the lock for `key` without waiting.
    pub async fn try_lock_in_transaction(
        tx: &mut Transaction<'_, Postgres>,
        key: LockKey,
    ) -> Result<(), LockError> {
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
            .bind(key.value())
            .fetch_one(&mut **tx)
            .await?;

        if acquired {
            debug!("Acquired transaction advisory lock {}", key);
            Ok(())
        } else {
            debug!("Advisory lock {} already held", key);
            Err(LockError::AlreadyHeld)
        }
    }
}

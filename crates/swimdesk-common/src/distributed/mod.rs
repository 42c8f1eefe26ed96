mod key;

#[cfg(feature = "postgres")]
pub mod postgres_lock;

pub use key::LockKey;

#[cfg(feature = "postgres")]
pub use postgres_lock::{AdvisoryLock, LockError};

//! Store error type.

use thiserror::Error;

/// Alias used within the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Persistence-layer failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying `SQLite` failure.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool exhaustion or build failure.
    #[error("pool: {0}")]
    Pool(#[from] r2d2::Error),

    /// A stored value failed to (de)serialize.
    #[error("corrupt row in {table}: {message}")]
    Corrupt {
        /// Table holding the bad row.
        table: &'static str,
        /// What went wrong.
        message: String,
    },
}

impl From<StoreError> for swarm_core::HubError {
    fn from(err: StoreError) -> Self {
        Self::Internal(format!("store: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_display() {
        let err = StoreError::Corrupt {
            table: "workers",
            message: "bad json".into(),
        };
        assert_eq!(err.to_string(), "corrupt row in workers: bad json");
    }

    #[test]
    fn converts_to_hub_error() {
        let err = StoreError::Corrupt {
            table: "user_profiles",
            message: "x".into(),
        };
        let hub: swarm_core::HubError = err.into();
        assert_eq!(hub.code(), "INTERNAL");
    }
}

//! Error types for database lookups.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DbError {
    #[error("no self row in the minion table")]
    NoMinionSelf,

    #[error("no cluster row")]
    NoCluster,
}

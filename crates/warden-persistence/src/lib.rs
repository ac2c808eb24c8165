//! ---
//! warden_section: "03-persistence-logging"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Persistence abstractions and storage bindings."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Storage contract shared by the election, the policy engine and the fencing path.

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// The addressed record does not exist.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Record kind (host, host state, fencer).
        kind: &'static str,
        /// Identifier that was looked up.
        id: String,
    },
    /// A uniqueness constraint rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The backing store could not be reached or failed the operation.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for PersistenceError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                PersistenceError::Conflict(db.message().to_owned())
            }
            _ => PersistenceError::Backend(err.to_string()),
        }
    }
}

pub mod admin;
pub mod memory;
pub mod model;
pub mod sql;
pub mod store;

pub use admin::{disable_host, enable_host};
pub use memory::MemoryStore;
pub use model::{
    ElectionRecord, FencerConfig, FencerKind, Host, HostId, HostState, HostStatus, NewFencer,
};
pub use sql::{SqlDialect, SqlStore};
pub use store::{SharedStore, Store};

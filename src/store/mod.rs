//! Storage collaborators: player credentials, maps and replays

pub mod blobs;
pub mod players;

pub use blobs::{MapData, MapStore, ReplayStore};
pub use players::{PlayerRepository, PlayerStore};

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse metadata: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(&'static str),

    #[error("Already exists")]
    AlreadyExists,

    #[error("Invalid input: {0}")]
    Invalid(String),
}

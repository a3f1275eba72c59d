//! Process-wide state

pub mod state;

pub use state::AppState;

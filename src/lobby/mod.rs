//! Lobby: accounts, rooms and match launch

pub mod events;
pub mod login;
pub mod match_client;
pub mod room;
pub mod service;

pub use events::{LobbyEvent, LobbyEvents, LobbyStats};
pub use match_client::{HttpClientConfig, HttpMatchClientFactory, MatchClientFactory};
pub use service::{LobbyConfig, LobbyContext, LobbyCoordinator};

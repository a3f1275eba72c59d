//! HTTP surface: health, WebSocket upgrades and the match RPC endpoint

pub mod middleware;
pub mod routes;

pub use routes::build_router;

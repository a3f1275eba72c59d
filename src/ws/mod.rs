//! Client-facing WebSocket surface: wire types and the socket adapter

pub mod handler;
pub mod protocol;
pub mod value;

//! Match hosting: coordinator, engine seam, replays and failover

pub mod bot_control;
pub mod engine;
pub mod host;
pub mod r#match;
pub mod ping_timer;
pub mod replay;

pub use engine::{EngineFactory, LockstepEngineFactory, MatchEngine};
pub use host::{MatchHost, MatchHostConfig, MatchRegistry};
pub use r#match::{MatchConfig, MatchCoordinator, MatchPhase};

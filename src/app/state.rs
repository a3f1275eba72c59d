//! Application state shared across routes

use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::info;

use crate::config::{Config, ServerRole};
use crate::game::{LockstepEngineFactory, MatchConfig, MatchHost, MatchHostConfig};
use crate::lobby::{
    HttpClientConfig, HttpMatchClientFactory, LobbyConfig, LobbyContext, LobbyCoordinator,
    LobbyEvents, LobbyStats,
};
use crate::store::{MapStore, PlayerStore, ReplayStore};
use crate::transport::{Transport, TransportConfig};
use crate::util::time::{SharedClock, SystemClock};

/// The lobby transport plus the counters fed by its events
#[derive(Clone)]
pub struct LobbyHandle {
    pub transport: Arc<Transport<LobbyCoordinator>>,
    pub stats: Arc<LobbyStats>,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub clock: SharedClock,
    /// Set in the lobby role
    pub lobby: Option<LobbyHandle>,
    /// Set in the match role
    pub match_host: Option<Arc<MatchHost>>,
}

impl AppState {
    /// Open the stores and start the coordinator threads for the configured
    /// role. Must run inside the tokio runtime.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let clock = SystemClock::shared();

        let maps = MapStore::open(&config.data_root)?;
        maps.seed_default()?;

        let mut state = Self {
            config: config.clone(),
            clock: clock.clone(),
            lobby: None,
            match_host: None,
        };

        match config.role {
            ServerRole::Lobby => {
                let replays = ReplayStore::open(&config.data_root)?;
                let players = Arc::new(PlayerStore::open(&config.data_root)?);
                let matches = Arc::new(HttpMatchClientFactory::new(
                    match_client_config(&config),
                    Handle::current(),
                    clock.clone(),
                )?);

                let transport = Arc::new(Transport::new(TransportConfig {
                    name: "lobby".to_string(),
                    poll_interval: config.transport_poll,
                }));
                let events = LobbyEvents::new();
                let stats = LobbyStats::attach(&events);

                let ctx = LobbyContext {
                    outbox: transport.outbox(),
                    scheduler: transport.scheduler(),
                    clock,
                    players,
                    maps,
                    replays,
                    matches,
                    events,
                };
                transport.start(LobbyCoordinator::new(lobby_config(&config), ctx))?;
                info!(server_id = %config.server_id, "Lobby coordinator running");

                state.lobby = Some(LobbyHandle { transport, stats });
            }
            ServerRole::Match => {
                let host = MatchHost::new(
                    maps,
                    Arc::new(LockstepEngineFactory),
                    clock,
                    MatchHostConfig {
                        matches: match_config(&config),
                        poll_interval: config.transport_poll,
                    },
                );
                info!("Match host ready");
                state.match_host = Some(Arc::new(host));
            }
        }

        Ok(state)
    }

    /// Stop the lobby threads and every hosted match
    pub fn shutdown(&self) {
        if let Some(lobby) = &self.lobby {
            lobby.transport.stop();
        }
        if let Some(host) = &self.match_host {
            host.shutdown();
        }
    }
}

pub fn lobby_config(config: &Config) -> LobbyConfig {
    LobbyConfig {
        max_local_players: config.max_local_players,
        liveness_interval: config.liveness_interval,
        liveness_max_failures: config.liveness_max_failures,
        match_public_url: config.match_public_url.clone(),
    }
}

pub fn match_config(config: &Config) -> MatchConfig {
    MatchConfig {
        tick_duration: config.tick,
        ping_samples: config.ping_samples,
        ping_interval: config.ping_interval,
        bot_control_timeout: config.bot_control_timeout,
    }
}

pub fn match_client_config(config: &Config) -> HttpClientConfig {
    HttpClientConfig {
        base_url: config.match_server_url.clone(),
        server_id: config.server_id.clone(),
        secret: config.match_rpc_secret.clone(),
        timeout: config.rpc_timeout,
    }
}

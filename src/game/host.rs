//! Match hosting: one transport + coordinator per launched room

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::engine::EngineFactory;
use super::r#match::{MatchConfig, MatchContext, MatchCoordinator};
use super::replay::ReplayData;
use crate::error::{Error, RpcResult};
use crate::store::MapStore;
use crate::transport::{Transport, TransportConfig};
use crate::util::time::{unix_millis, SharedClock};
use crate::ws::protocol::{GameMode, RoomId, RoomSnapshot, Status};

/// `cmd` query parameter of the lobby -> match RPC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchCommand {
    Create,
    IsAlive,
    Destroy,
}

impl MatchCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchCommand::Create => "create",
            MatchCommand::IsAlive => "isalive",
            MatchCommand::Destroy => "destroy",
        }
    }
}

/// Body of a `create` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateMatchRequest {
    pub snapshot: RoomSnapshot,
    /// Base64 of a bincode `ReplayData`, for replay rooms
    #[serde(default)]
    pub replay: Option<String>,
}

impl CreateMatchRequest {
    pub fn new(snapshot: RoomSnapshot, replay: Option<&[u8]>) -> Self {
        Self {
            snapshot,
            replay: replay.map(|bytes| STANDARD.encode(bytes)),
        }
    }

    pub fn replay_data(&self) -> RpcResult<Option<ReplayData>> {
        let Some(encoded) = &self.replay else {
            return Ok(None);
        };
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| Error::Unhandled(format!("replay payload: {}", e)))?;
        ReplayData::from_bytes(&bytes).map(Some)
    }
}

/// Answer to every match RPC
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRpcResponse {
    pub status: Status,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub alive: bool,
}

impl MatchRpcResponse {
    pub fn ok(alive: bool) -> Self {
        Self {
            status: Status::Ok,
            message: None,
            alive,
        }
    }

    pub fn error(error: &Error) -> Self {
        Self {
            status: error.status(),
            message: error.wire_message(),
            alive: false,
        }
    }

    pub fn into_result(self) -> RpcResult<bool> {
        match Error::from_status(self.status, self.message) {
            None => Ok(self.alive),
            Some(e) => Err(e),
        }
    }
}

/// Handle to a live match
#[derive(Clone)]
pub struct MatchHandle {
    pub room_id: RoomId,
    pub transport: Arc<Transport<MatchCoordinator>>,
    pub alive: Arc<AtomicBool>,
    pub created_at: u64,
}

impl MatchHandle {
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && self.transport.is_running()
    }

    pub fn client_count(&self) -> usize {
        self.transport.connection_count()
    }
}

/// Registry of live matches
pub struct MatchRegistry {
    matches: DashMap<RoomId, MatchHandle>,
}

impl MatchRegistry {
    pub fn new() -> Self {
        Self {
            matches: DashMap::new(),
        }
    }

    pub fn get(&self, id: &RoomId) -> Option<MatchHandle> {
        self.matches.get(id).map(|m| m.value().clone())
    }

    pub fn contains(&self, id: &RoomId) -> bool {
        self.matches.contains_key(id)
    }

    pub fn insert(&self, handle: MatchHandle) {
        self.matches.insert(handle.room_id, handle);
    }

    pub fn remove(&self, id: &RoomId) -> Option<MatchHandle> {
        self.matches.remove(id).map(|(_, h)| h)
    }

    pub fn active_matches(&self) -> usize {
        self.matches.len()
    }

    pub fn total_clients(&self) -> usize {
        self.matches.iter().map(|m| m.value().client_count()).sum()
    }

    pub fn room_ids(&self) -> Vec<RoomId> {
        self.matches.iter().map(|m| *m.key()).collect()
    }
}

impl Default for MatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything needed to spin up a match
#[derive(Clone)]
pub struct MatchHostConfig {
    pub matches: MatchConfig,
    pub poll_interval: Duration,
}

/// Creates, polls and tears down matches on behalf of the lobby
pub struct MatchHost {
    registry: MatchRegistry,
    maps: MapStore,
    engines: Arc<dyn EngineFactory>,
    clock: SharedClock,
    config: MatchHostConfig,
}

impl MatchHost {
    pub fn new(
        maps: MapStore,
        engines: Arc<dyn EngineFactory>,
        clock: SharedClock,
        config: MatchHostConfig,
    ) -> Self {
        Self {
            registry: MatchRegistry::new(),
            maps,
            engines,
            clock,
            config,
        }
    }

    pub fn registry(&self) -> &MatchRegistry {
        &self.registry
    }

    /// Run one RPC command. `request` is only read for `create`.
    pub fn handle(
        &self,
        room_id: RoomId,
        cmd: MatchCommand,
        request: Option<CreateMatchRequest>,
    ) -> MatchRpcResponse {
        let result = match cmd {
            MatchCommand::Create => request
                .ok_or(Error::NotAllowed("create needs a room snapshot"))
                .and_then(|request| self.create(room_id, request))
                .map(|()| true),
            MatchCommand::IsAlive => Ok(self.is_alive(room_id)),
            MatchCommand::Destroy => self.destroy(room_id).map(|()| false),
        };
        match result {
            Ok(alive) => MatchRpcResponse::ok(alive),
            Err(e) => {
                warn!(room_id = %room_id, cmd = cmd.as_str(), error = %e, "Match RPC failed");
                MatchRpcResponse::error(&e)
            }
        }
    }

    pub fn create(&self, room_id: RoomId, request: CreateMatchRequest) -> RpcResult<()> {
        if self.registry.contains(&room_id) {
            return Err(Error::AlreadyExists);
        }
        if request.snapshot.room.id != room_id {
            return Err(Error::NotAllowed("room id does not match the snapshot"));
        }

        let replay = request.replay_data()?;
        if request.snapshot.room.mode == GameMode::Replay && replay.is_none() {
            return Err(Error::NotAllowed("replay room without replay data"));
        }

        let transport = Arc::new(Transport::new(TransportConfig {
            name: format!("match-{}", short_id(room_id)),
            poll_interval: self.config.poll_interval,
        }));
        let alive = Arc::new(AtomicBool::new(true));
        let ctx = MatchContext {
            outbox: transport.outbox(),
            clock: self.clock.clone(),
            maps: self.maps.clone(),
            engines: self.engines.clone(),
            alive: alive.clone(),
        };

        let seed = rand::random();
        let mut coordinator = MatchCoordinator::new(
            request.snapshot,
            replay,
            seed,
            self.config.matches.clone(),
            ctx,
        );
        coordinator.open()?;
        transport
            .start(coordinator)
            .map_err(|e| Error::Unhandled(format!("failed to start match threads: {}", e)))?;

        self.registry.insert(MatchHandle {
            room_id,
            transport,
            alive,
            created_at: unix_millis(),
        });
        info!(room_id = %room_id, active = self.registry.active_matches(), "Match created");
        Ok(())
    }

    /// Liveness as seen by the lobby. Finished matches are reaped here.
    pub fn is_alive(&self, room_id: RoomId) -> bool {
        let Some(handle) = self.registry.get(&room_id) else {
            return false;
        };
        if handle.is_alive() {
            return true;
        }
        let _ = self.destroy(room_id);
        false
    }

    pub fn destroy(&self, room_id: RoomId) -> RpcResult<()> {
        let handle = self
            .registry
            .remove(&room_id)
            .ok_or(Error::NotFound("match"))?;
        handle.alive.store(false, Ordering::SeqCst);
        if let Some(mut coordinator) = handle.transport.stop() {
            coordinator.destroy();
        }
        info!(room_id = %room_id, active = self.registry.active_matches(), "Match destroyed");
        Ok(())
    }

    /// Stop every match, e.g. on process shutdown
    pub fn shutdown(&self) {
        for room_id in self.registry.room_ids() {
            let _ = self.destroy(room_id);
        }
    }
}

fn short_id(room_id: RoomId) -> String {
    room_id.to_string().chars().take(8).collect()
}

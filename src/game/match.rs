//! Match session coordinator and authoritative tick loop
//!
//! One `MatchCoordinator` per launched room, driven by its own transport.
//! Phases:
//!
//! ```text
//! Created -> WaitingForReady -> Initializing -> WaitingForPingBarrier -> Running <-> Paused -> Destroyed
//! ```
//!
//! Replay sessions initialize when opened and wait in `WaitingForViewer`;
//! the tick clock starts when the first viewer registers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::bot_control::{BotControlManager, Slot};
use super::engine::{EngineFactory, EngineSetup, MatchEngine};
use super::ping_timer::PingTimer;
use super::replay::{ReplayData, ReplayPlayer, ReplayRecorder, ReplaySystem};
use crate::error::{Error, RpcResult};
use crate::store::MapStore;
use crate::transport::dispatch::{Call, DispatchTable, Reply};
use crate::transport::{Outbox, Request, Service, Targets};
use crate::util::time::SharedClock;
use crate::ws::protocol::{
    ClientEvent, ClientId, Command, CommandCode, GameMode, Player, Proc, RoomInfo, RoomSnapshot,
    ServerEvent,
};
use crate::ws::value::Value;

/// Match phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPhase {
    Created,
    /// Waiting for every registered client to call `ReadyToPlay`
    WaitingForReady,
    Initializing,
    /// Engine exists, sampling RTT before the first tick
    WaitingForPingBarrier,
    /// Replay loaded, nobody connected yet
    WaitingForViewer,
    Running,
    Paused,
    Destroyed,
}

/// Match timing settings
#[derive(Debug, Clone)]
pub struct MatchConfig {
    pub tick_duration: Duration,
    pub ping_samples: usize,
    pub ping_interval: Duration,
    pub bot_control_timeout: Duration,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            tick_duration: Duration::from_millis(100),
            ping_samples: 4,
            ping_interval: Duration::from_secs(1),
            bot_control_timeout: Duration::from_secs(5),
        }
    }
}

/// Services a coordinator needs from its host
#[derive(Clone)]
pub struct MatchContext {
    pub outbox: Outbox,
    pub clock: SharedClock,
    pub maps: MapStore,
    pub engines: Arc<dyn EngineFactory>,
    /// Cleared once the session is over; read by the host's liveness check
    pub alive: Arc<AtomicBool>,
}

pub struct MatchCoordinator {
    room: RoomInfo,
    players: Vec<Player>,
    /// Lobby seating: which client may claim each slot
    seats: Vec<Option<ClientId>>,
    /// Live ownership: slot -> connected client
    owners: Vec<Option<ClientId>>,
    left: Vec<bool>,
    bots: HashSet<usize>,
    seed: u64,
    replay_mode: bool,

    config: MatchConfig,
    ctx: MatchContext,
    dispatch: Arc<DispatchTable<MatchCoordinator>>,

    phase: MatchPhase,
    registered: HashSet<ClientId>,
    ready: HashSet<ClientId>,
    pending_leaves: Vec<usize>,

    engine: Option<Box<dyn MatchEngine>>,
    replay: Box<dyn ReplaySystem>,
    ping_timer: Option<PingTimer>,
    bot_control: BotControlManager,

    tick: u64,
    last_tick_at: Duration,
    paused_at: Option<Duration>,
    next_ping_at: Duration,
    running_pings: HashMap<ClientId, (u32, Duration)>,
    next_ping_seq: u32,
}

impl MatchCoordinator {
    /// Live session seated from `snapshot`, or a replay session when
    /// `replay` is given (slots then come from the recording).
    pub fn new(
        snapshot: RoomSnapshot,
        replay: Option<ReplayData>,
        seed: u64,
        config: MatchConfig,
        ctx: MatchContext,
    ) -> Self {
        let replay_mode = replay.is_some();
        let (room, players, seats, seed, replay) = match replay {
            Some(data) => {
                let mut room = snapshot.room;
                room.map_id = data.room.map_id;
                let players = data.players.clone();
                let seats = vec![None; players.len()];
                let seed = data.seed;
                let player: Box<dyn ReplaySystem> = Box::new(ReplayPlayer::new(data));
                (room, players, seats, seed, player)
            }
            None => {
                let players: Vec<Player> = snapshot.seats.iter().map(|s| s.player.clone()).collect();
                let seats: Vec<Option<ClientId>> = snapshot.seats.iter().map(|s| s.client_id).collect();
                let recorder: Box<dyn ReplaySystem> =
                    Box::new(ReplayRecorder::new(seed, snapshot.room.clone(), players.clone()));
                (snapshot.room, players, seats, seed, recorder)
            }
        };

        let slot_count = players.len();
        Self {
            room,
            players,
            seats,
            owners: vec![None; slot_count],
            left: vec![false; slot_count],
            bots: HashSet::new(),
            seed,
            replay_mode,
            bot_control: BotControlManager::new(config.bot_control_timeout),
            config,
            ctx,
            dispatch: Arc::new(Self::dispatch_table()),
            phase: MatchPhase::Created,
            registered: HashSet::new(),
            ready: HashSet::new(),
            pending_leaves: Vec::new(),
            engine: None,
            replay,
            ping_timer: None,
            tick: 0,
            last_tick_at: Duration::ZERO,
            paused_at: None,
            next_ping_at: Duration::ZERO,
            running_pings: HashMap::new(),
            next_ping_seq: 0,
        }
    }

    fn dispatch_table() -> DispatchTable<Self> {
        DispatchTable::new()
            .on(Proc::ReadyToPlay, Self::ready_to_play)
            .on(Proc::Submit, Self::submit)
            .on(Proc::Pause, Self::pause)
            .on(Proc::GetReplay, Self::get_replay)
            .on(Proc::GetMatchPlayers, Self::get_match_players)
    }

    /// Leave `Created`. Replay sessions initialize immediately.
    pub fn open(&mut self) -> RpcResult<()> {
        if self.phase != MatchPhase::Created {
            return Ok(());
        }
        self.phase = MatchPhase::WaitingForReady;
        info!(room_id = %self.room.id, replay = self.replay_mode, slots = self.players.len(), "Match session opened");
        if self.replay_mode {
            self.initialize()?;
        }
        Ok(())
    }

    pub fn phase(&self) -> MatchPhase {
        self.phase
    }

    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    pub fn is_enabled(&self) -> bool {
        self.phase == MatchPhase::Running
    }

    pub fn is_initialized(&self) -> bool {
        self.engine.is_some()
    }

    pub fn mode(&self) -> GameMode {
        if self.replay_mode {
            GameMode::Replay
        } else {
            self.room.mode
        }
    }

    pub fn is_alive(&self) -> bool {
        self.ctx.alive.load(Ordering::SeqCst)
    }

    pub fn state_hash(&self) -> Option<u64> {
        self.engine.as_ref().map(|e| e.state_hash())
    }

    /// Final teardown by the host
    pub fn destroy(&mut self) {
        self.phase = MatchPhase::Destroyed;
        self.ctx.alive.store(false, Ordering::SeqCst);
        info!(room_id = %self.room.id, ticks = self.tick, "Match session destroyed");
    }

    fn slots(&self) -> Vec<Slot> {
        self.owners
            .iter()
            .enumerate()
            .map(|(i, owner)| Slot {
                owner: *owner,
                is_bot: self.bots.contains(&i),
            })
            .collect()
    }

    fn require_registered(&self, client_id: ClientId) -> RpcResult<()> {
        if self.registered.contains(&client_id) {
            Ok(())
        } else {
            Err(Error::NotRegistered)
        }
    }

    fn register_client(&mut self, client_id: ClientId) {
        if !self.registered.insert(client_id) {
            return;
        }
        for (i, seat) in self.seats.iter().enumerate() {
            if *seat == Some(client_id) && !self.left[i] {
                self.owners[i] = Some(client_id);
            }
        }
        debug!(room_id = %self.room.id, client_id = %client_id, "Client joined match");

        if self.phase == MatchPhase::WaitingForViewer {
            self.start_running();
            return;
        }

        if self.phase == MatchPhase::WaitingForPingBarrier {
            if let Some(timer) = self.ping_timer.as_mut() {
                timer.add(client_id);
            }
            self.send_barrier_ping(client_id);
        }
    }

    fn unregister_client(&mut self, client_id: ClientId) {
        if !self.registered.remove(&client_id) {
            return;
        }
        self.ready.remove(&client_id);
        self.running_pings.remove(&client_id);

        let owned: Vec<usize> = self
            .owners
            .iter()
            .enumerate()
            .filter(|(_, owner)| **owner == Some(client_id))
            .map(|(i, _)| i)
            .collect();
        for &i in &owned {
            self.owners[i] = None;
        }
        debug!(room_id = %self.room.id, client_id = %client_id, slots = ?owned, "Client left match");

        if self.engine.is_none() {
            if !self.replay_mode {
                self.pending_leaves.extend(owned);
            }
        } else {
            for index in owned {
                self.submit_leave(index);
            }
            let now = self.ctx.clock.now();
            let slots = self.slots();
            if let Some(engine) = self.engine.as_mut() {
                self.bot_control.on_disconnected(client_id, engine.as_mut());
                if matches!(self.phase, MatchPhase::Running | MatchPhase::Paused) && !self.replay_mode {
                    self.bot_control.activate_next(&slots, engine.as_mut(), now);
                }
            }
        }

        if let Some(timer) = self.ping_timer.as_mut() {
            timer.remove(client_id);
        }
        self.check_barrier();

        if self.phase == MatchPhase::WaitingForReady && self.everyone_ready() {
            if let Err(e) = self.initialize() {
                error!(room_id = %self.room.id, error = %e, "Match initialization failed");
            }
        }

        if self.engine.is_some() && self.registered.is_empty() {
            self.ctx.alive.store(false, Ordering::SeqCst);
            info!(room_id = %self.room.id, "Every client left, match is over");
        }
    }

    fn everyone_ready(&self) -> bool {
        !self.registered.is_empty() && self.registered.is_subset(&self.ready)
    }

    fn ready_to_play(&mut self, call: &Call<'_>) -> RpcResult<Reply> {
        let client_id = call.client_id;
        self.require_registered(client_id)?;
        if !self.replay_mode && self.phase == MatchPhase::WaitingForReady {
            self.ready.insert(client_id);
            if self.everyone_ready() {
                self.initialize()?;
            }
        }
        Ok(vec![Value::Bool(self.is_initialized())].into())
    }

    fn initialize(&mut self) -> RpcResult<()> {
        self.phase = MatchPhase::Initializing;

        let engine = self
            .ctx
            .maps
            .load(self.room.map_id)
            .map_err(Error::from)
            .and_then(|map| {
                let setup = EngineSetup {
                    seed: self.seed,
                    player_count: self.players.len(),
                };
                self.ctx
                    .engines
                    .create(&map, &setup)
                    .map_err(|e| Error::Unhandled(e.to_string()))
            });
        let mut engine = match engine {
            Ok(engine) => engine,
            Err(e) => {
                self.phase = MatchPhase::WaitingForReady;
                return Err(e);
            }
        };

        for (i, player) in self.players.iter().enumerate() {
            engine.register_player(i, player);
        }
        if !self.replay_mode {
            self.bots = self
                .players
                .iter()
                .enumerate()
                .filter(|(_, p)| p.is_bot())
                .map(|(i, _)| i)
                .collect();
        }
        self.engine = Some(engine);
        info!(room_id = %self.room.id, slots = self.players.len(), bots = self.bots.len(), "Match engine initialized");

        for index in std::mem::take(&mut self.pending_leaves) {
            self.submit_leave(index);
        }

        if self.replay_mode {
            if self.registered.is_empty() {
                self.phase = MatchPhase::WaitingForViewer;
            } else {
                self.start_running();
            }
            return Ok(());
        }

        self.phase = MatchPhase::WaitingForPingBarrier;
        let mut timer = PingTimer::new(self.config.ping_samples);
        for client_id in &self.registered {
            timer.add(*client_id);
        }
        self.ping_timer = Some(timer);
        self.next_ping_at = self.ctx.clock.now() + self.config.ping_interval;

        let clients: Vec<ClientId> = self.registered.iter().copied().collect();
        for client_id in clients {
            self.send_barrier_ping(client_id);
        }
        self.check_barrier();
        Ok(())
    }

    fn send_barrier_ping(&mut self, client_id: ClientId) {
        let now = self.ctx.clock.now();
        let seq = self.ping_timer.as_mut().and_then(|t| t.ping(client_id, now));
        if let Some(seq) = seq {
            self.ctx.outbox.send(client_id, &ServerEvent::Ping { seq });
        }
    }

    fn check_barrier(&mut self) {
        if self.phase != MatchPhase::WaitingForPingBarrier {
            return;
        }
        let Some(mut timer) = self.ping_timer.take() else {
            return;
        };
        if !timer.complete_with(self, Self::start_running) {
            self.ping_timer = Some(timer);
        }
    }

    fn start_running(&mut self) {
        let now = self.ctx.clock.now();
        self.ping_timer = None;
        self.phase = MatchPhase::Running;
        self.tick = 0;
        self.last_tick_at = now;
        self.next_ping_at = now + self.config.ping_interval;

        if !self.replay_mode {
            let slots = self.slots();
            if let Some(engine) = self.engine.as_mut() {
                self.bot_control.activate_next(&slots, engine.as_mut(), now);
            }
        }
        info!(room_id = %self.room.id, "Match running");
    }

    fn submit(&mut self, call: &Call<'_>) -> RpcResult<Reply> {
        let client_id = call.client_id;
        let index = call.args.get::<usize>(0)?;
        let command = call.args.get::<Command>(1)?;
        self.require_registered(client_id)?;
        if self.engine.is_none() {
            return Err(Error::NotAllowed("match is not initialized"));
        }
        if self.phase == MatchPhase::Paused {
            return Err(Error::NotAllowed("match is paused"));
        }
        if self.replay_mode {
            return Err(Error::NotAllowed("replay sessions do not accept commands"));
        }
        if self.phase != MatchPhase::Running {
            return Err(Error::NotAllowed("match has not started"));
        }
        if command.code == CommandCode::LEAVE_ROOM {
            return Err(Error::NotAllowed("leave command is reserved"));
        }
        if index >= self.players.len() {
            return Err(Error::IndexOutOfRange(index));
        }

        let slots = self.slots();
        let owns = self.owners[index] == Some(client_id);
        if !owns && !self.bot_control.has_control(client_id, index, &slots) {
            return Err(Error::NotAuthorized);
        }

        let engine = self
            .engine
            .as_mut()
            .ok_or(Error::NotAllowed("match is not initialized"))?;
        engine
            .submit(index, command.clone())
            .map_err(|e| Error::Unhandled(e.to_string()))?;
        self.replay.record(self.tick, index, command);
        Ok(Reply::empty())
    }

    /// Synthetic leave for a slot whose client went away
    fn submit_leave(&mut self, index: usize) {
        if self.replay_mode || self.left.get(index).copied().unwrap_or(true) {
            return;
        }
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        let command = Command::leave_room();
        match engine.submit(index, command.clone()) {
            Ok(()) => {
                self.left[index] = true;
                self.replay.record(self.tick, index, command);
                debug!(room_id = %self.room.id, player_index = index, "Leave submitted");
            }
            Err(e) => warn!(room_id = %self.room.id, player_index = index, error = %e, "Leave rejected by engine"),
        }
    }

    fn pause(&mut self, call: &Call<'_>) -> RpcResult<Reply> {
        let client_id = call.client_id;
        let paused = call.args.get::<bool>(0)?;
        self.require_registered(client_id)?;
        let now = self.ctx.clock.now();
        match (self.phase, paused) {
            (MatchPhase::Running, true) => {
                self.phase = MatchPhase::Paused;
                self.paused_at = Some(now);
            }
            (MatchPhase::Paused, false) => {
                let paused_for = self
                    .paused_at
                    .take()
                    .map(|at| now.saturating_sub(at))
                    .unwrap_or_default();
                self.last_tick_at += paused_for;
                self.phase = MatchPhase::Running;
            }
            (MatchPhase::Running, false) | (MatchPhase::Paused, true) => return Ok(Reply::empty()),
            _ => return Err(Error::NotAllowed("match is not running")),
        }

        info!(room_id = %self.room.id, client_id = %client_id, paused, "Match pause toggled");
        self.ctx
            .outbox
            .broadcast(Targets::AllExcept(None), &ServerEvent::Paused { paused });
        Ok(Reply::empty())
    }

    fn get_replay(&mut self, call: &Call<'_>) -> RpcResult<Reply> {
        self.require_registered(call.client_id)?;
        if self.engine.is_none() {
            return Err(Error::NotAllowed("match never initialized"));
        }
        let bytes = self.replay.save().to_bytes()?;
        Ok(vec![Value::Bytes(bytes), Value::from(self.room.clone())].into())
    }

    fn get_match_players(&mut self, call: &Call<'_>) -> RpcResult<Reply> {
        let client_id = call.client_id;
        self.require_registered(client_id)?;
        let owned: Vec<_> = self
            .owners
            .iter()
            .zip(&self.players)
            .filter(|(owner, _)| **owner == Some(client_id))
            .map(|(_, p)| p.id)
            .collect();
        Ok(vec![Value::from(self.players.clone()), Value::from(owned)].into())
    }

    fn on_pong(&mut self, client_id: ClientId, seq: u32) {
        let now = self.ctx.clock.now();

        if let Some(timer) = self.ping_timer.as_mut() {
            if timer.pong(client_id, seq, now).is_none() {
                return;
            }
            let initialized = timer.is_initialized(client_id);
            let rtt = timer.rtt(client_id).unwrap_or_default();
            self.broadcast_rtt(client_id, rtt);
            if !initialized {
                self.send_barrier_ping(client_id);
            }
            self.check_barrier();
            return;
        }

        match self.running_pings.get(&client_id) {
            Some(&(expected, sent_at)) if expected == seq => {
                self.running_pings.remove(&client_id);
                self.bot_control.ping(client_id, now);
                self.broadcast_rtt(client_id, now.saturating_sub(sent_at));
            }
            _ => {}
        }
    }

    fn broadcast_rtt(&self, client_id: ClientId, rtt: Duration) {
        let rtt_ms = u32::try_from(rtt.as_millis()).unwrap_or(u32::MAX);
        self.ctx.outbox.broadcast(
            Targets::AllExcept(None),
            &ServerEvent::RttChanged { client_id, rtt_ms },
        );
    }

    fn ping_running_clients(&mut self, now: Duration) {
        let clients: Vec<ClientId> = self.registered.iter().copied().collect();
        for client_id in clients {
            let seq = self.next_ping_seq;
            self.next_ping_seq = self.next_ping_seq.wrapping_add(1);
            self.running_pings.insert(client_id, (seq, now));
            self.ctx.outbox.send(client_id, &ServerEvent::Ping { seq });
        }
    }

    /// Step the engine once and publish its bundle
    fn step(&mut self) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        self.replay.tick(self.tick, engine.as_mut());
        if let Some(mut bundle) = engine.tick() {
            bundle.tick = self.tick;
            self.ctx
                .outbox
                .broadcast(Targets::AllExcept(None), &ServerEvent::Tick(bundle));
        }
        self.tick += 1;
    }

    fn update(&mut self) {
        let now = self.ctx.clock.now();
        match self.phase {
            MatchPhase::Running => {
                let tick_duration = self.config.tick_duration;
                if !tick_duration.is_zero() {
                    while now.saturating_sub(self.last_tick_at) >= tick_duration {
                        self.last_tick_at += tick_duration;
                        self.step();
                    }
                }

                if !self.replay_mode {
                    let slots = self.slots();
                    if let Some(engine) = self.engine.as_mut() {
                        self.bot_control.update(&slots, engine.as_mut(), now);
                    }
                }

                if now >= self.next_ping_at {
                    self.ping_running_clients(now);
                    self.next_ping_at = now + self.config.ping_interval;
                }
            }
            MatchPhase::WaitingForPingBarrier if now >= self.next_ping_at => {
                let pending = self
                    .ping_timer
                    .as_ref()
                    .map(|t| t.pending_clients())
                    .unwrap_or_default();
                for client_id in pending {
                    self.send_barrier_ping(client_id);
                }
                self.next_ping_at = now + self.config.ping_interval;
            }
            _ => {}
        }
    }
}

impl Service for MatchCoordinator {
    fn on_register(&mut self, client_id: ClientId) {
        self.register_client(client_id);
    }

    fn on_unregister(&mut self, client_id: ClientId) {
        self.unregister_client(client_id);
    }

    fn on_request(&mut self, request: Request) {
        let dispatch = self.dispatch.clone();
        let outbox = self.ctx.outbox.clone();
        dispatch.serve(self, &request, &outbox);
    }

    fn on_message(&mut self, client_id: ClientId, event: ClientEvent) {
        if !self.registered.contains(&client_id) {
            return;
        }
        match event {
            ClientEvent::Pong { seq } => self.on_pong(client_id, seq),
        }
    }

    fn on_tick(&mut self) {
        self.update();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::engine::LockstepEngineFactory;
    use crate::store::blobs::temp_root;
    use crate::transport::testing::RecordingConnection;
    use crate::transport::{Transport, TransportConfig};
    use crate::util::time::ManualClock;
    use crate::ws::protocol::{
        CommandsBundle, MapId, MapInfo, RemoteCall, RoomId, Seat, ServerFrame, Status,
    };

    const TICK: Duration = Duration::from_millis(100);

    struct Harness {
        transport: Transport<MatchCoordinator>,
        coordinator: MatchCoordinator,
        clock: Arc<ManualClock>,
        connections: Vec<(ClientId, Arc<RecordingConnection>)>,
        next_request: u32,
    }

    impl Harness {
        fn new(seats: Vec<Seat>, replay: Option<ReplayData>, maps: MapStore, map_id: MapId) -> Self {
            let transport = Transport::new(TransportConfig::default());
            let clock = ManualClock::new();
            let ctx = MatchContext {
                outbox: transport.outbox(),
                clock: clock.clone(),
                maps,
                engines: Arc::new(LockstepEngineFactory),
                alive: Arc::new(AtomicBool::new(true)),
            };
            let room = RoomInfo {
                id: RoomId::new(),
                creator: seats.iter().find_map(|s| s.client_id).unwrap_or_default(),
                map_id,
                mode: if replay.is_some() {
                    GameMode::Replay
                } else {
                    GameMode::Normal
                },
                players: seats.iter().map(|s| s.player.id).collect(),
                ready_to_launch: seats.iter().map(|s| s.player.id).collect(),
                launched: true,
                replay_id: None,
            };
            let config = MatchConfig {
                tick_duration: TICK,
                ping_samples: 2,
                ping_interval: Duration::from_secs(1),
                bot_control_timeout: Duration::from_secs(5),
            };
            let mut coordinator =
                MatchCoordinator::new(RoomSnapshot { room, seats }, replay, 42, config, ctx);
            coordinator.open().unwrap();

            Self {
                transport,
                coordinator,
                clock,
                connections: Vec::new(),
                next_request: 0,
            }
        }

        fn connect(&mut self, client_id: ClientId) -> Arc<RecordingConnection> {
            let connection = RecordingConnection::new();
            self.transport
                .register_connection(client_id, connection.clone())
                .unwrap();
            self.connections.push((client_id, connection.clone()));
            self.pump();
            connection
        }

        fn disconnect(&mut self, client_id: ClientId) {
            self.transport.unregister_connection(client_id);
            self.pump();
        }

        fn pump(&mut self) {
            self.transport.pump(&mut self.coordinator);
            self.transport.flush();
        }

        fn call(&mut self, client_id: ClientId, proc: Proc, args: Vec<Value>) -> RpcResult<Vec<Value>> {
            self.next_request += 1;
            let id = self.next_request;
            self.transport.on_incoming_request(Request {
                client_id,
                id,
                call: RemoteCall::new(proc, client_id, args),
            });
            self.pump();
            let connection = self
                .connections
                .iter()
                .find(|(c, _)| *c == client_id)
                .map(|(_, conn)| conn.clone())
                .expect("connected client");
            connection.response(id).expect("response").into_result()
        }

        /// Answer every outstanding ping until the barrier opens
        fn answer_pings(&mut self) {
            for _ in 0..10 {
                if self.coordinator.phase() != MatchPhase::WaitingForPingBarrier {
                    return;
                }
                self.clock.advance(Duration::from_millis(20));
                for (client_id, connection) in self.connections.clone() {
                    let pings: Vec<u32> = connection
                        .events()
                        .into_iter()
                        .filter_map(|e| match e {
                            ServerEvent::Ping { seq } => Some(seq),
                            _ => None,
                        })
                        .collect();
                    connection.clear();
                    for seq in pings {
                        self.transport
                            .on_incoming_message(client_id, ClientEvent::Pong { seq });
                    }
                }
                self.pump();
            }
        }

        fn run_ticks(&mut self, ticks: u32) {
            for _ in 0..ticks {
                self.clock.advance(TICK);
                self.coordinator.on_tick();
                self.transport.flush();
            }
        }
    }

    fn bundles(connection: &RecordingConnection) -> Vec<CommandsBundle> {
        connection
            .frames()
            .into_iter()
            .filter_map(|f| match f {
                ServerFrame::Event(ServerEvent::Tick(bundle)) => Some(bundle),
                _ => None,
            })
            .collect()
    }

    fn map_store(label: &str) -> (MapStore, MapId) {
        let maps = MapStore::open(&temp_root(label)).unwrap();
        let info = MapInfo {
            id: MapId::new(),
            name: "Arena".into(),
            max_players: 4,
            modes: vec![GameMode::Normal, GameMode::Replay],
        };
        maps.save(&info, b"terrain").unwrap();
        (maps, info.id)
    }

    fn seat(client_id: Option<ClientId>, player: Player) -> Seat {
        Seat { player, client_id }
    }

    fn running_pair(label: &str) -> (Harness, ClientId, ClientId) {
        let (maps, map_id) = map_store(label);
        let (a, b) = (ClientId::new(), ClientId::new());
        let seats = vec![
            seat(Some(a), Player::human("alice")),
            seat(Some(b), Player::human("bob")),
        ];
        let mut h = Harness::new(seats, None, maps, map_id);
        h.connect(a);
        h.connect(b);
        assert_eq!(h.call(a, Proc::ReadyToPlay, vec![]).unwrap(), vec![Value::Bool(false)]);
        assert_eq!(h.call(b, Proc::ReadyToPlay, vec![]).unwrap(), vec![Value::Bool(true)]);
        assert_eq!(h.coordinator.phase(), MatchPhase::WaitingForPingBarrier);
        h.answer_pings();
        assert_eq!(h.coordinator.phase(), MatchPhase::Running);
        (h, a, b)
    }

    fn submit_args(index: usize, code: CommandCode) -> Vec<Value> {
        vec![Value::from(index), Value::from(Command::new(code, 1))]
    }

    #[test]
    fn ready_and_ping_barrier_start_the_match() {
        let (h, a, _) = running_pair("barrier");
        assert!(h.coordinator.is_enabled());
        assert_eq!(h.coordinator.current_tick(), 0);
        assert_eq!(h.coordinator.bot_control.holder().unwrap().client_id, a);
    }

    #[test]
    fn submit_before_initialization_is_not_allowed() {
        let (maps, map_id) = map_store("early");
        let a = ClientId::new();
        let mut h = Harness::new(vec![seat(Some(a), Player::human("a"))], None, maps, map_id);
        h.connect(a);

        let err = h.call(a, Proc::Submit, submit_args(0, CommandCode::MOVE)).unwrap_err();
        assert_eq!(err.status(), Status::NotAllowed);
        let err = h.call(a, Proc::GetReplay, vec![]).unwrap_err();
        assert_eq!(err.status(), Status::NotAllowed);
    }

    #[test]
    fn submit_waits_for_the_ping_barrier() {
        let (maps, map_id) = map_store("barrier-submit");
        let a = ClientId::new();
        let mut h = Harness::new(vec![seat(Some(a), Player::human("a"))], None, maps, map_id);
        h.connect(a);
        h.call(a, Proc::ReadyToPlay, vec![]).unwrap();
        assert_eq!(h.coordinator.phase(), MatchPhase::WaitingForPingBarrier);
        let before = h.coordinator.state_hash();

        let err = h.call(a, Proc::Submit, submit_args(0, CommandCode::MOVE)).unwrap_err();
        assert_eq!(err.status(), Status::NotAllowed);
        assert_eq!(h.coordinator.state_hash(), before);

        h.answer_pings();
        h.call(a, Proc::Submit, submit_args(0, CommandCode::MOVE)).unwrap();
    }

    #[test]
    fn tick_numbers_are_consecutive() {
        let (mut h, a, _) = running_pair("ticks");
        h.call(a, Proc::Submit, submit_args(0, CommandCode::MOVE)).unwrap();
        h.run_ticks(3);
        // Catching up after a stall still steps one tick at a time
        h.clock.advance(TICK * 4);
        h.coordinator.on_tick();
        h.transport.flush();

        let conn = h.connections[0].1.clone();
        let ticks: Vec<u64> = bundles(&conn).iter().map(|b| b.tick).collect();
        assert_eq!(ticks, (0..7).collect::<Vec<u64>>());
        assert_eq!(bundles(&conn)[0].commands[0].len(), 1);
    }

    #[test]
    fn unauthorized_submit_leaves_the_engine_untouched() {
        let (mut h, _, b) = running_pair("unauthorized");
        let before = h.coordinator.state_hash();

        let err = h.call(b, Proc::Submit, submit_args(0, CommandCode::ATTACK)).unwrap_err();
        assert_eq!(err, Error::NotAuthorized);
        assert_eq!(h.coordinator.state_hash(), before);

        let err = h.call(b, Proc::Submit, submit_args(9, CommandCode::ATTACK)).unwrap_err();
        assert_eq!(err.status(), Status::NotFound);

        let err = h
            .call(b, Proc::Submit, vec![Value::from(1usize), Value::from(Command::leave_room())])
            .unwrap_err();
        assert_eq!(err.status(), Status::NotAllowed);
        assert_eq!(h.coordinator.state_hash(), before);
    }

    #[test]
    fn pause_suppresses_catch_up() {
        let (mut h, a, _) = running_pair("pause");
        h.run_ticks(2);
        h.call(a, Proc::Pause, vec![Value::Bool(true)]).unwrap();

        let err = h.call(a, Proc::Submit, submit_args(0, CommandCode::MOVE)).unwrap_err();
        assert_eq!(err.status(), Status::NotAllowed);

        h.run_ticks(10);
        assert_eq!(h.coordinator.current_tick(), 2);

        h.call(a, Proc::Pause, vec![Value::Bool(false)]).unwrap();
        h.run_ticks(1);
        assert_eq!(h.coordinator.current_tick(), 3);

        let events = h.connections[1].1.events();
        assert!(events.contains(&ServerEvent::Paused { paused: true }));
        assert!(events.contains(&ServerEvent::Paused { paused: false }));
    }

    #[test]
    fn disconnect_submits_leave_and_hands_slot_to_bot_control() {
        let (mut h, a, b) = running_pair("leave");
        let holder = h.coordinator.bot_control.holder().unwrap().client_id;
        let (gone, stays) = if holder == a { (a, b) } else { (b, a) };
        let gone_index = if gone == a { 0 } else { 1 };

        h.disconnect(gone);
        assert_eq!(h.coordinator.bot_control.holder().unwrap().client_id, stays);

        h.run_ticks(1);
        let conn = h.connections.iter().find(|(c, _)| *c == stays).unwrap().1.clone();
        let last = bundles(&conn).pop().unwrap();
        assert_eq!(last.commands[gone_index], vec![Command::leave_room()]);
        assert!(h.coordinator.is_alive());

        h.disconnect(stays);
        assert!(!h.coordinator.is_alive());
    }

    #[test]
    fn leave_before_initialization_is_queued() {
        let (maps, map_id) = map_store("queued");
        let (a, b) = (ClientId::new(), ClientId::new());
        let seats = vec![
            seat(Some(a), Player::human("a")),
            seat(Some(b), Player::human("b")),
        ];
        let mut h = Harness::new(seats, None, maps, map_id);
        h.connect(a);
        h.connect(b);
        h.call(a, Proc::ReadyToPlay, vec![]).unwrap();
        h.disconnect(b);

        assert!(h.coordinator.is_initialized(), "remaining clients were all ready");
        h.answer_pings();
        h.run_ticks(1);
        let first = bundles(&h.connections[0].1).remove(0);
        assert_eq!(first.commands[1], vec![Command::leave_room()]);
    }

    #[test]
    fn bot_slots_are_driven_by_the_holder() {
        let (maps, map_id) = map_store("bots");
        let a = ClientId::new();
        let seats = vec![
            seat(Some(a), Player::human("a")),
            seat(None, Player::bot("bot", crate::ws::protocol::BotType::Default)),
        ];
        let mut h = Harness::new(seats, None, maps, map_id);
        h.connect(a);
        h.call(a, Proc::ReadyToPlay, vec![]).unwrap();
        h.answer_pings();

        h.call(a, Proc::Submit, submit_args(1, CommandCode::MOVE)).unwrap();
        let players = h.call(a, Proc::GetMatchPlayers, vec![]).unwrap();
        assert_eq!(players.len(), 2);
    }

    #[test]
    fn recorded_match_replays_the_same_bundles() {
        let (mut h, a, b) = running_pair("record");
        h.call(a, Proc::Submit, submit_args(0, CommandCode::MOVE)).unwrap();
        h.run_ticks(1);
        h.call(b, Proc::Submit, submit_args(1, CommandCode::SPLIT)).unwrap();
        h.call(a, Proc::Submit, submit_args(0, CommandCode::CONVERT)).unwrap();
        h.run_ticks(2);
        h.call(b, Proc::Submit, submit_args(1, CommandCode::ATTACK)).unwrap();
        h.run_ticks(2);
        let live = bundles(&h.connections[0].1);
        assert_eq!(live.len(), 5);

        let values = h.call(a, Proc::GetReplay, vec![]).unwrap();
        let Value::Bytes(bytes) = &values[0] else {
            panic!("replay bytes expected");
        };
        let data = ReplayData::from_bytes(bytes).unwrap();

        let viewer = ClientId::new();
        let maps = h.coordinator.ctx.maps.clone();
        let map_id = h.coordinator.room.map_id;
        let mut replay = Harness::new(vec![seat(Some(viewer), Player::human("v"))], Some(data), maps, map_id);
        assert_eq!(replay.coordinator.phase(), MatchPhase::WaitingForViewer);

        // The viewer needs a while to get the URL and connect
        replay.clock.advance(Duration::from_millis(250));
        replay.coordinator.on_tick();
        assert_eq!(replay.coordinator.current_tick(), 0);

        let viewer_conn = replay.connect(viewer);
        assert_eq!(replay.coordinator.phase(), MatchPhase::Running);
        replay.run_ticks(5);

        assert_eq!(bundles(&viewer_conn), live);
        assert_eq!(replay.coordinator.state_hash(), h.coordinator.state_hash());

        let err = replay
            .call(viewer, Proc::Submit, submit_args(0, CommandCode::MOVE))
            .unwrap_err();
        assert_eq!(err.status(), Status::NotAllowed);
    }

    #[test]
    fn running_pings_report_rtt() {
        let (mut h, a, _) = running_pair("rtt");
        for (_, conn) in &h.connections {
            conn.clear();
        }
        h.clock.advance(Duration::from_secs(1));
        h.coordinator.on_tick();
        h.transport.flush();

        let seq = h.connections[0]
            .1
            .events()
            .into_iter()
            .find_map(|e| match e {
                ServerEvent::Ping { seq } => Some(seq),
                _ => None,
            })
            .unwrap();
        h.clock.advance(Duration::from_millis(30));
        h.transport.on_incoming_message(a, ClientEvent::Pong { seq });
        h.pump();

        let events = h.connections[1].1.events();
        assert!(events.contains(&ServerEvent::RttChanged {
            client_id: a,
            rtt_ms: 30
        }));
    }
}

//! Lobby coordinator: sessions, rooms, launch and liveness
//!
//! Runs on the lobby transport's consumer thread. Match server RPCs complete
//! on tokio and come back through the transport scheduler, so every state
//! change happens on that one thread.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::events::{LobbyEvent, LobbyEvents};
use super::login::{LoginMode, SessionDirectory, ValidateCredentials};
use super::match_client::{MatchClientFactory, MatchServerClient};
use super::room::{Liveness, Room};
use crate::error::{Error, RpcResult};
use crate::game::host::CreateMatchRequest;
use crate::game::replay::ReplayData;
use crate::store::{MapStore, PlayerRepository, ReplayStore};
use crate::transport::dispatch::{Call, DispatchTable, Reply};
use crate::transport::{Outbox, ReplyTo, Request, Scheduler, Service, Targets};
use crate::util::time::SharedClock;
use crate::ws::protocol::{
    BotType, ClientEvent, ClientId, GameMode, MapId, Player, PlayerId, Proc, RemoteResult,
    ReplayId, ReplayInfo, RoomId, RoomSnapshot, Seat, ServerEvent,
};
use crate::ws::value::Value;

#[derive(Debug, Clone)]
pub struct LobbyConfig {
    pub max_local_players: usize,
    pub liveness_interval: Duration,
    pub liveness_max_failures: u32,
    /// Base of the URL handed to clients on launch
    pub match_public_url: String,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            max_local_players: 4,
            liveness_interval: Duration::from_secs(30),
            liveness_max_failures: 3,
            match_public_url: "ws://localhost:8081/match".to_string(),
        }
    }
}

/// Collaborators handed to the lobby at construction
pub struct LobbyContext {
    pub outbox: Outbox,
    pub scheduler: Scheduler<LobbyCoordinator>,
    pub clock: SharedClock,
    pub players: Arc<dyn PlayerRepository>,
    pub maps: MapStore,
    pub replays: ReplayStore,
    pub matches: Arc<dyn MatchClientFactory>,
    pub events: Arc<LobbyEvents>,
}

struct Session {
    player: Player,
    client_id: ClientId,
}

#[derive(Default)]
struct ClientState {
    /// Logged-in players, in login order
    players: Vec<PlayerId>,
    room: Option<RoomId>,
}

pub struct LobbyCoordinator {
    config: LobbyConfig,
    ctx: LobbyContext,
    dispatch: Arc<DispatchTable<LobbyCoordinator>>,

    clients: HashMap<ClientId, ClientState>,
    sessions: HashMap<PlayerId, Session>,
    rooms: HashMap<RoomId, Room>,
    match_clients: HashMap<RoomId, Arc<dyn MatchServerClient>>,
}

impl LobbyCoordinator {
    pub fn new(config: LobbyConfig, ctx: LobbyContext) -> Self {
        Self {
            config,
            ctx,
            dispatch: Arc::new(Self::dispatch_table()),
            clients: HashMap::new(),
            sessions: HashMap::new(),
            rooms: HashMap::new(),
            match_clients: HashMap::new(),
        }
    }

    fn dispatch_table() -> DispatchTable<Self> {
        DispatchTable::new()
            .on(Proc::Login, Self::login)
            .on(Proc::SignUp, Self::sign_up)
            .on(Proc::Logoff, Self::logoff)
            .on(Proc::GetPlayers, Self::get_players)
            .on(Proc::GetRooms, Self::get_rooms)
            .on(Proc::GetMaps, Self::get_maps)
            .on(Proc::CreateRoom, Self::create_room)
            .on(Proc::JoinRoom, Self::join_room)
            .on(Proc::LeaveRoom, Self::leave_room)
            .on(Proc::CreateBot, Self::create_bot)
            .on(Proc::CreateBots, Self::create_bots)
            .on(Proc::DestroyBot, Self::destroy_bot)
            .on(Proc::SetReadyToLaunch, Self::set_ready_to_launch)
            .on(Proc::Launch, Self::launch)
            .on(Proc::GetReplays, Self::get_replays)
            .on(Proc::SaveReplay, Self::save_replay)
            .on(Proc::SetReplay, Self::set_replay)
            .on(Proc::SendChatMessage, Self::send_chat_message)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn room(&self, room_id: RoomId) -> Option<&Room> {
        self.rooms.get(&room_id)
    }

    /// URL a client uses to join the launched match
    pub fn match_url(&self, room_id: RoomId) -> String {
        format!("{}?roomId={}", self.config.match_public_url, room_id)
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    pub fn register_client(&mut self, client_id: ClientId) {
        self.clients.entry(client_id).or_default();
        debug!(client_id = %client_id, clients = self.clients.len(), "Lobby client registered");
    }

    /// Log off every player of the client, with the room cleanup that implies
    pub fn unregister_client(&mut self, client_id: ClientId) {
        let players = self
            .clients
            .get(&client_id)
            .map(|c| c.players.clone())
            .unwrap_or_default();
        for player_id in players {
            self.logoff_player(client_id, player_id);
        }
        self.clients.remove(&client_id);
        debug!(client_id = %client_id, clients = self.clients.len(), "Lobby client unregistered");
    }

    fn registered(&self, client_id: ClientId) -> RpcResult<&ClientState> {
        self.clients.get(&client_id).ok_or(Error::NotRegistered)
    }

    /// Registered and at least one player logged in
    fn authenticated(&self, client_id: ClientId) -> RpcResult<&ClientState> {
        let client = self.registered(client_id)?;
        if client.players.is_empty() {
            return Err(Error::NotAuthenticated);
        }
        Ok(client)
    }

    /// The caller's room
    fn current_room(&self, client_id: ClientId) -> RpcResult<&Room> {
        let room_id = self
            .authenticated(client_id)?
            .room
            .ok_or(Error::NotFound("room"))?;
        self.rooms.get(&room_id).ok_or(Error::NotFound("room"))
    }

    /// The caller's room, which it must have created and not yet launched
    fn owned_open_room(&self, client_id: ClientId) -> RpcResult<&Room> {
        let room = self.current_room(client_id)?;
        if room.creator != client_id {
            return Err(Error::NotAuthorized);
        }
        if room.launched {
            return Err(Error::AlreadyLaunched);
        }
        Ok(room)
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    fn login(&mut self, call: &Call<'_>) -> RpcResult<Reply> {
        self.run_login(call, LoginMode::Login)
    }

    fn sign_up(&mut self, call: &Call<'_>) -> RpcResult<Reply> {
        self.run_login(call, LoginMode::SignUp)
    }

    fn run_login(&mut self, call: &Call<'_>, mode: LoginMode) -> RpcResult<Reply> {
        let name: String = call.args.get(0)?;
        let password: String = call.args.get(1)?;
        let players = self.ctx.players.clone();

        let player = ValidateCredentials::new(call.client_id, name, password, mode)
            .validate(&*self, players.as_ref(), self.config.max_local_players)?
            .force_logoff(self)
            .commit(self);
        Ok(vec![Value::from(player)].into())
    }

    fn logoff(&mut self, call: &Call<'_>) -> RpcResult<Reply> {
        self.registered(call.client_id)?;
        let player_id: PlayerId = call.args.get(0)?;
        match self.sessions.get(&player_id) {
            None => return Err(Error::NotFound("player session")),
            Some(session) if session.client_id != call.client_id => {
                return Err(Error::NotAuthorized)
            }
            Some(_) => {}
        }
        self.logoff_player(call.client_id, player_id);
        Ok(Reply::empty())
    }

    fn logoff_player(&mut self, client_id: ClientId, player_id: PlayerId) {
        self.remove_from_room(client_id, &[player_id]);
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.players.retain(|p| *p != player_id);
        }
        if self.sessions.remove(&player_id).is_none() {
            return;
        }

        info!(client_id = %client_id, player_id = %player_id, "Player logged off");
        self.ctx.outbox.broadcast(
            Targets::AllExcept(None),
            &ServerEvent::LoggedOff { player_id },
        );
        self.ctx.events.emit(LobbyEvent::PlayerLoggedOff(player_id));
    }

    fn get_players(&mut self, call: &Call<'_>) -> RpcResult<Reply> {
        let players: Vec<Player> = self
            .registered(call.client_id)?
            .players
            .iter()
            .filter_map(|id| self.sessions.get(id))
            .map(|s| s.player.clone())
            .collect();
        Ok(vec![Value::from(players)].into())
    }

    // ------------------------------------------------------------------
    // Catalogue
    // ------------------------------------------------------------------

    fn get_rooms(&mut self, call: &Call<'_>) -> RpcResult<Reply> {
        self.registered(call.client_id)?;
        let mut rooms: Vec<_> = self.rooms.values().map(Room::info).collect();
        rooms.sort_by_key(|r| r.id);
        Ok(vec![Value::from(rooms)].into())
    }

    fn get_maps(&mut self, call: &Call<'_>) -> RpcResult<Reply> {
        self.registered(call.client_id)?;
        Ok(vec![Value::from(self.ctx.maps.list()?)].into())
    }

    fn get_replays(&mut self, call: &Call<'_>) -> RpcResult<Reply> {
        self.registered(call.client_id)?;
        Ok(vec![Value::from(self.ctx.replays.list()?)].into())
    }

    fn save_replay(&mut self, call: &Call<'_>) -> RpcResult<Reply> {
        self.authenticated(call.client_id)?;
        let name: String = call.args.get(0)?;
        let bytes: Vec<u8> = call.args.get(1)?;
        if name.trim().is_empty() {
            return Err(Error::NotAllowed("replay name is empty"));
        }

        let data = ReplayData::from_bytes(&bytes)?;
        let info = ReplayInfo {
            id: data.id,
            name: name.trim().to_string(),
            map_id: data.room.map_id,
            player_count: data.players.len(),
            created_at: chrono::Utc::now(),
        };
        self.ctx.replays.save(&info, &bytes)?;
        info!(client_id = %call.client_id, replay_id = %info.id, "Replay saved");
        Ok(vec![Value::from(info)].into())
    }

    // ------------------------------------------------------------------
    // Rooms
    // ------------------------------------------------------------------

    fn create_room(&mut self, call: &Call<'_>) -> RpcResult<Reply> {
        let map_id: MapId = call.args.get(0)?;
        let mode: GameMode = call.args.get(1)?;

        let client = self.authenticated(call.client_id)?;
        if self.rooms.values().any(|r| r.creator == call.client_id) {
            return Err(Error::AlreadyExists);
        }
        if client.room.is_some() {
            return Err(Error::AlreadyJoined);
        }
        let map = self.ctx.maps.info(map_id)?;
        if !map.supports(mode) {
            return Err(Error::NotAllowed("map does not support this mode"));
        }

        let mut room = Room::new(call.client_id, map, mode);
        let seated: Vec<PlayerId> = client
            .players
            .iter()
            .take(room.capacity())
            .copied()
            .collect();
        room.seat(&seated)?;

        let room_id = room.id;
        let info = room.info();
        self.match_clients
            .insert(room_id, self.ctx.matches.connect(room_id));
        self.rooms.insert(room_id, room);
        if let Some(client) = self.clients.get_mut(&call.client_id) {
            client.room = Some(room_id);
        }

        info!(client_id = %call.client_id, room_id = %room_id, mode = ?mode, "Room created");
        self.ctx.events.emit(LobbyEvent::RoomCreated(room_id));
        self.rooms_changed();
        Ok(vec![Value::from(info)].into())
    }

    fn join_room(&mut self, call: &Call<'_>) -> RpcResult<Reply> {
        let room_id: RoomId = call.args.get(0)?;

        let client = self.authenticated(call.client_id)?;
        if client.room.is_some() {
            return Err(Error::AlreadyJoined);
        }
        let players = client.players.clone();
        let room = self.rooms.get_mut(&room_id).ok_or(Error::NotFound("room"))?;
        if room.launched {
            return Err(Error::AlreadyLaunched);
        }
        if room.mode == GameMode::Replay {
            return Err(Error::NotAllowed("replay rooms cannot be joined"));
        }
        room.seat(&players)?;

        let info = room.info();
        if let Some(client) = self.clients.get_mut(&call.client_id) {
            client.room = Some(room_id);
        }

        info!(client_id = %call.client_id, room_id = %room_id, players = players.len(), "Joined room");
        self.notify_room(
            room_id,
            Some(call.client_id),
            &ServerEvent::JoinedRoom { room_id, players },
        );
        self.rooms_changed();
        Ok(vec![Value::from(info)].into())
    }

    fn leave_room(&mut self, call: &Call<'_>) -> RpcResult<Reply> {
        let room = self.current_room(call.client_id)?;
        let mine: Vec<PlayerId> = room
            .players()
            .iter()
            .filter(|id| {
                self.sessions
                    .get(id)
                    .map(|s| s.client_id == call.client_id)
                    .unwrap_or(false)
            })
            .copied()
            .collect();
        self.remove_from_room(call.client_id, &mine);
        if let Some(client) = self.clients.get_mut(&call.client_id) {
            client.room = None;
        }
        Ok(Reply::empty())
    }

    /// Unseat some of `client_id`'s players and apply the destroy rules:
    /// the creator leaving before launch, an empty room, or a room with only
    /// bots left.
    fn remove_from_room(&mut self, client_id: ClientId, ids: &[PlayerId]) {
        let Some(room_id) = self.clients.get(&client_id).and_then(|c| c.room) else {
            return;
        };
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return;
        };

        let removed = room.unseat(ids);
        let still_seated = self
            .clients
            .get(&client_id)
            .map(|c| {
                c.players
                    .iter()
                    .any(|p| !ids.contains(p) && room.contains(p))
            })
            .unwrap_or(false);
        let creator_left = room.creator == client_id && !still_seated && !room.launched;
        let destroy = creator_left || room.is_empty() || room.only_bots();

        if !still_seated {
            if let Some(client) = self.clients.get_mut(&client_id) {
                client.room = None;
            }
        }
        if removed.is_empty() {
            return;
        }

        info!(client_id = %client_id, room_id = %room_id, players = removed.len(), "Left room");
        if destroy {
            self.destroy_room(room_id, Some(client_id), true);
        } else {
            self.notify_room(
                room_id,
                Some(client_id),
                &ServerEvent::LeftRoom {
                    room_id,
                    players: removed,
                },
            );
            self.rooms_changed();
        }
    }

    /// Remove the room and tell each remaining member client once.
    /// `tear_down` also asks the match server to drop a launched match.
    fn destroy_room(&mut self, room_id: RoomId, except: Option<ClientId>, tear_down: bool) {
        let Some(room) = self.rooms.remove(&room_id) else {
            return;
        };
        let members = self.member_clients(&room);

        for client_id in members.iter().chain(except.iter()) {
            if let Some(client) = self.clients.get_mut(client_id) {
                if client.room == Some(room_id) {
                    client.room = None;
                }
            }
        }

        let targets: Vec<ClientId> = members.into_iter().filter(|c| Some(*c) != except).collect();
        self.ctx.outbox.broadcast(
            Targets::Clients(targets),
            &ServerEvent::RoomDestroyed { room_id },
        );

        let match_client = self.match_clients.remove(&room_id);
        if room.launched && tear_down {
            self.tear_down_match(room_id, match_client);
        }

        info!(room_id = %room_id, launched = room.launched, "Room destroyed");
        self.ctx.events.emit(LobbyEvent::RoomDestroyed(room_id));
        self.rooms_changed();
    }

    /// Ask the match server to drop `room_id`. A client still waiting on
    /// another call cannot take the request, so a fresh one is used.
    fn tear_down_match(&self, room_id: RoomId, match_client: Option<Arc<dyn MatchServerClient>>) {
        let match_client = match match_client {
            Some(client) if !client.is_busy() => client,
            _ => self.ctx.matches.connect(room_id),
        };
        let result = match_client.destroy_match(
            room_id,
            Box::new(move |result| {
                if let Err(e) = result {
                    warn!(room_id = %room_id, error = %e, "Match teardown failed");
                }
            }),
        );
        if let Err(e) = result {
            warn!(room_id = %room_id, error = %e, "Match teardown not sent");
        }
    }

    /// Distinct clients with a player seated in `room`, in seat order
    fn member_clients(&self, room: &Room) -> Vec<ClientId> {
        let mut members = Vec::new();
        for session in room.players().iter().filter_map(|id| self.sessions.get(id)) {
            if !members.contains(&session.client_id) {
                members.push(session.client_id);
            }
        }
        members
    }

    fn notify_room(&self, room_id: RoomId, except: Option<ClientId>, event: &ServerEvent) {
        let Some(room) = self.rooms.get(&room_id) else {
            return;
        };
        let targets: Vec<ClientId> = self
            .member_clients(room)
            .into_iter()
            .filter(|c| Some(*c) != except)
            .collect();
        self.ctx.outbox.broadcast(Targets::Clients(targets), event);
    }

    fn rooms_changed(&self) {
        self.ctx
            .outbox
            .broadcast(Targets::AllExcept(None), &ServerEvent::RoomsChanged);
    }

    // ------------------------------------------------------------------
    // Bots
    // ------------------------------------------------------------------

    fn create_bot(&mut self, call: &Call<'_>) -> RpcResult<Reply> {
        let bot_type: BotType = call.args.get(0)?;
        let name: Option<String> = call.args.opt(1)?;
        let bots = self.add_bots(call.client_id, 1, bot_type, name)?;
        Ok(vec![Value::from(bots.into_iter().next())].into())
    }

    fn create_bots(&mut self, call: &Call<'_>) -> RpcResult<Reply> {
        let count: usize = call.args.get(0)?;
        let bot_type: BotType = call.args.get(1)?;
        let bots = self.add_bots(call.client_id, count, bot_type, None)?;
        Ok(vec![Value::from(bots)].into())
    }

    fn add_bots(
        &mut self,
        client_id: ClientId,
        count: usize,
        bot_type: BotType,
        name: Option<String>,
    ) -> RpcResult<Vec<Player>> {
        if !bot_type.is_bot() {
            return Err(Error::NotAllowed("bot type required"));
        }
        let room_id = self.owned_open_room(client_id)?.id;
        let room = self.rooms.get_mut(&room_id).ok_or(Error::NotFound("room"))?;
        if count > room.free_seats() {
            return Err(Error::TooMuchPlayersInRoom);
        }

        let mut bots = Vec::with_capacity(count);
        for _ in 0..count {
            let name = name
                .clone()
                .unwrap_or_else(|| format!("Bot {}", room.bot_count() + 1));
            let bot = Player::bot(name, bot_type);
            room.add_bot(bot.clone())?;
            bots.push(bot);
        }

        debug!(room_id = %room_id, count, bot_type = ?bot_type, "Bots added");
        let players = bots.iter().map(|b| b.id).collect();
        self.notify_room(
            room_id,
            Some(client_id),
            &ServerEvent::JoinedRoom { room_id, players },
        );
        self.rooms_changed();
        Ok(bots)
    }

    fn destroy_bot(&mut self, call: &Call<'_>) -> RpcResult<Reply> {
        let bot_id: PlayerId = call.args.get(0)?;
        let room_id = self.owned_open_room(call.client_id)?.id;
        let room = self.rooms.get_mut(&room_id).ok_or(Error::NotFound("room"))?;
        room.remove_bot(bot_id).ok_or(Error::NotFound("bot"))?;

        self.notify_room(
            room_id,
            Some(call.client_id),
            &ServerEvent::LeftRoom {
                room_id,
                players: vec![bot_id],
            },
        );
        self.rooms_changed();
        Ok(Reply::empty())
    }

    // ------------------------------------------------------------------
    // Launch
    // ------------------------------------------------------------------

    fn set_ready_to_launch(&mut self, call: &Call<'_>) -> RpcResult<Reply> {
        let ready: bool = call.args.get(0)?;
        let room = self.current_room(call.client_id)?;
        if room.launched {
            return Err(Error::AlreadyLaunched);
        }
        let room_id = room.id;
        let mine = self
            .clients
            .get(&call.client_id)
            .map(|c| c.players.clone())
            .unwrap_or_default();

        let room = self.rooms.get_mut(&room_id).ok_or(Error::NotFound("room"))?;
        let players = room.set_ready(&mine, ready);
        debug!(room_id = %room_id, ready, state = ?room.state(), "Readiness changed");

        self.notify_room(
            room_id,
            None,
            &ServerEvent::ReadyToLaunch {
                room_id,
                players,
                ready,
            },
        );
        Ok(Reply::empty())
    }

    fn set_replay(&mut self, call: &Call<'_>) -> RpcResult<Reply> {
        let replay_id: ReplayId = call.args.get(0)?;
        let room = self.owned_open_room(call.client_id)?;
        if room.mode != GameMode::Replay {
            return Err(Error::NotAllowed("room is not a replay room"));
        }
        let room_id = room.id;
        self.ctx.replays.info(replay_id)?;

        let room = self.rooms.get_mut(&room_id).ok_or(Error::NotFound("room"))?;
        room.replay_id = Some(replay_id);
        let info = room.info();
        self.rooms_changed();
        Ok(vec![Value::from(info)].into())
    }

    fn snapshot(&self, room: &Room) -> RpcResult<RoomSnapshot> {
        let seats = room
            .players()
            .iter()
            .map(|id| match room.bot(id) {
                Some(bot) => Ok(Seat {
                    player: bot.clone(),
                    client_id: None,
                }),
                None => self
                    .sessions
                    .get(id)
                    .map(|s| Seat {
                        player: s.player.clone(),
                        client_id: Some(s.client_id),
                    })
                    .ok_or(Error::NotFound("player session")),
            })
            .collect::<RpcResult<Vec<_>>>()?;
        Ok(RoomSnapshot {
            room: room.info(),
            seats,
        })
    }

    /// Ask the match server to create the match; answered from the RPC
    /// completion.
    fn launch(&mut self, call: &Call<'_>) -> RpcResult<Reply> {
        let room = self.owned_open_room(call.client_id)?;
        if room.launching {
            return Err(Error::NotAllowed("launch already in progress"));
        }
        if !room.is_ready_to_launch() {
            return Err(Error::NotReady);
        }
        let room_id = room.id;

        let replay = match room.mode {
            GameMode::Replay => {
                let replay_id = room
                    .replay_id
                    .ok_or(Error::NotAllowed("no replay selected"))?;
                Some(self.ctx.replays.load(replay_id)?)
            }
            GameMode::Normal => None,
        };
        let request = CreateMatchRequest::new(self.snapshot(room)?, replay.as_deref());

        let match_client = self
            .match_clients
            .get(&room_id)
            .cloned()
            .ok_or(Error::NotFound("match server client"))?;
        let scheduler = self.ctx.scheduler.clone();
        let reply_to = call.reply_to;
        match_client
            .create_match(
                room_id,
                request,
                Box::new(move |result| {
                    scheduler.post(move |lobby: &mut LobbyCoordinator| {
                        lobby.on_match_created(room_id, reply_to, result)
                    })
                }),
            )
            .map_err(Error::from)?;

        if let Some(room) = self.rooms.get_mut(&room_id) {
            room.launching = true;
        }
        info!(client_id = %call.client_id, room_id = %room_id, "Launch requested");
        Ok(Reply::Deferred)
    }

    fn on_match_created(&mut self, room_id: RoomId, reply_to: ReplyTo, result: RpcResult<()>) {
        let now = self.ctx.clock.now();
        let interval = self.config.liveness_interval;

        let Some(room) = self.rooms.get_mut(&room_id) else {
            // room went away while the match was being created
            if result.is_ok() {
                self.tear_down_match(room_id, None);
            }
            self.ctx
                .outbox
                .respond(reply_to, RemoteResult::error(&Error::NotFound("room")));
            return;
        };
        room.launching = false;

        if let Err(e) = result {
            warn!(room_id = %room_id, error = %e, "Match creation failed");
            self.ctx.outbox.respond(reply_to, RemoteResult::error(&e));
            return;
        }

        room.launched = true;
        room.liveness = Liveness {
            next_check: now + interval,
            failures: 0,
        };

        let url = self.match_url(room_id);
        info!(room_id = %room_id, url = %url, "Room launched");
        self.notify_room(
            room_id,
            None,
            &ServerEvent::Launched {
                room_id,
                url: url.clone(),
            },
        );
        self.ctx
            .outbox
            .respond(reply_to, RemoteResult::ok(vec![Value::Str(url)]));
        self.ctx.events.emit(LobbyEvent::RoomLaunched(room_id));
        self.rooms_changed();
    }

    // ------------------------------------------------------------------
    // Liveness
    // ------------------------------------------------------------------

    /// Issue an `isalive` check for every launched room that is due and
    /// whose match client is idle
    fn poll_liveness(&mut self) {
        let now = self.ctx.clock.now();
        let due: Vec<RoomId> = self
            .rooms
            .values()
            .filter(|r| r.launched && now >= r.liveness.next_check)
            .map(|r| r.id)
            .collect();

        for room_id in due {
            let Some(match_client) = self.match_clients.get(&room_id).cloned() else {
                continue;
            };
            if match_client.is_busy() {
                continue;
            }
            if let Some(room) = self.rooms.get_mut(&room_id) {
                room.liveness.next_check = now + self.config.liveness_interval;
            }

            let scheduler = self.ctx.scheduler.clone();
            let sent = match_client.is_alive(
                room_id,
                Box::new(move |result| {
                    scheduler.post(move |lobby: &mut LobbyCoordinator| {
                        lobby.on_liveness(room_id, result)
                    })
                }),
            );
            if let Err(e) = sent {
                warn!(room_id = %room_id, error = %e, "Liveness check not sent");
            }
        }
    }

    fn on_liveness(&mut self, room_id: RoomId, result: RpcResult<bool>) {
        let max_failures = self.config.liveness_max_failures;
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return;
        };

        match result {
            Ok(true) => room.liveness.failures = 0,
            Ok(false) => {
                info!(room_id = %room_id, "Match reported finished");
                self.destroy_room(room_id, None, false);
            }
            Err(e) => {
                room.liveness.failures += 1;
                warn!(
                    room_id = %room_id,
                    failures = room.liveness.failures,
                    error = %e,
                    "Liveness check failed"
                );
                if room.liveness.failures >= max_failures {
                    self.destroy_room(room_id, None, false);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Chat
    // ------------------------------------------------------------------

    fn send_chat_message(&mut self, call: &Call<'_>) -> RpcResult<Reply> {
        let sender: PlayerId = call.args.get(0)?;
        let text: String = call.args.get(1)?;

        let client = self.authenticated(call.client_id)?;
        if !client.players.contains(&sender) {
            return Err(Error::NotAuthorized);
        }
        if text.trim().is_empty() {
            return Err(Error::NotAllowed("message is empty"));
        }

        let room_id = client.room;
        let event = ServerEvent::ChatMessage {
            sender,
            room_id,
            text,
        };
        match room_id {
            Some(room_id) => self.notify_room(room_id, None, &event),
            None => self.ctx.outbox.broadcast(Targets::AllExcept(None), &event),
        }
        Ok(Reply::empty())
    }
}

impl SessionDirectory for LobbyCoordinator {
    fn is_registered(&self, client_id: ClientId) -> bool {
        self.clients.contains_key(&client_id)
    }

    fn local_player_count(&self, client_id: ClientId) -> usize {
        self.clients
            .get(&client_id)
            .map(|c| c.players.len())
            .unwrap_or(0)
    }

    fn session_owner(&self, player_id: PlayerId) -> Option<ClientId> {
        self.sessions.get(&player_id).map(|s| s.client_id)
    }

    fn force_logoff(&mut self, client_id: ClientId, player_id: PlayerId) {
        self.logoff_player(client_id, player_id);
    }

    fn commit_login(&mut self, client_id: ClientId, player: Player) {
        let player_id = player.id;
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.players.push(player_id);
        }
        self.sessions.insert(
            player_id,
            Session {
                player: player.clone(),
                client_id,
            },
        );

        info!(client_id = %client_id, player_id = %player_id, name = %player.name, "Player logged in");
        self.ctx
            .outbox
            .broadcast(Targets::AllExcept(None), &ServerEvent::LoggedIn { player });
        self.ctx.events.emit(LobbyEvent::PlayerLoggedIn(player_id));
    }
}

impl Service for LobbyCoordinator {
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
        debug!(client_id = %client_id, event = ?event, "Ignoring lobby message");
    }

    fn on_tick(&mut self) {
        self.poll_liveness();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lobby::match_client::fake::FakeMatchServer;
    use crate::store::blobs::temp_root;
    use crate::store::PlayerStore;
    use crate::transport::testing::RecordingConnection;
    use crate::transport::{Transport, TransportConfig};
    use crate::util::time::ManualClock;
    use crate::ws::protocol::{MapInfo, RemoteCall, RoomInfo};

    const LIVENESS: Duration = Duration::from_secs(30);

    struct Harness {
        transport: Transport<LobbyCoordinator>,
        lobby: LobbyCoordinator,
        clock: Arc<ManualClock>,
        server: Arc<FakeMatchServer>,
        events: Arc<LobbyEvents>,
        replays: ReplayStore,
        map: MapInfo,
        connections: HashMap<ClientId, Arc<RecordingConnection>>,
        next_request: u32,
    }

    impl Harness {
        fn new(map_capacity: usize) -> Self {
            let root = temp_root("lobby");
            let maps = MapStore::open(&root).unwrap();
            let replays = ReplayStore::open(&root).unwrap();
            let map = MapInfo {
                id: MapId::new(),
                name: "Crater".into(),
                max_players: map_capacity,
                modes: vec![GameMode::Normal, GameMode::Replay],
            };
            maps.save(&map, &[1u8; 16]).unwrap();

            let transport = Transport::new(TransportConfig::default());
            let clock = ManualClock::new();
            let server = FakeMatchServer::new();
            let events = LobbyEvents::new();
            let ctx = LobbyContext {
                outbox: transport.outbox(),
                scheduler: transport.scheduler(),
                clock: clock.clone(),
                players: Arc::new(PlayerStore::in_memory()),
                maps,
                replays: replays.clone(),
                matches: Arc::new(server.clone()),
                events: events.clone(),
            };
            let config = LobbyConfig {
                max_local_players: 2,
                liveness_interval: LIVENESS,
                liveness_max_failures: 3,
                match_public_url: "ws://match.test/match".into(),
            };

            Self {
                transport,
                lobby: LobbyCoordinator::new(config, ctx),
                clock,
                server,
                events,
                replays,
                map,
                connections: HashMap::new(),
                next_request: 0,
            }
        }

        fn connect(&mut self) -> ClientId {
            let client_id = ClientId::new();
            let connection = RecordingConnection::new();
            self.transport
                .register_connection(client_id, connection.clone())
                .unwrap();
            self.connections.insert(client_id, connection);
            self.pump();
            client_id
        }

        fn disconnect(&mut self, client_id: ClientId) {
            self.transport.unregister_connection(client_id);
            self.pump();
        }

        fn pump(&mut self) {
            self.transport.pump(&mut self.lobby);
            self.transport.flush();
        }

        fn send(&mut self, client_id: ClientId, proc: Proc, args: Vec<Value>) -> u32 {
            self.next_request += 1;
            let id = self.next_request;
            self.transport.on_incoming_request(Request {
                client_id,
                id,
                call: RemoteCall::new(proc, client_id, args),
            });
            self.pump();
            id
        }

        fn call(&mut self, client_id: ClientId, proc: Proc, args: Vec<Value>) -> RpcResult<Vec<Value>> {
            let id = self.send(client_id, proc, args);
            self.connection(client_id)
                .response(id)
                .expect("response")
                .into_result()
        }

        fn connection(&self, client_id: ClientId) -> Arc<RecordingConnection> {
            self.connections[&client_id].clone()
        }

        fn events(&self, client_id: ClientId) -> Vec<ServerEvent> {
            self.connection(client_id).events()
        }

        fn clear(&self) {
            for connection in self.connections.values() {
                connection.clear();
            }
        }

        fn sign_up(&mut self, client_id: ClientId, name: &str) -> Player {
            let values = self
                .call(client_id, Proc::SignUp, vec![name.into(), "pw".into()])
                .unwrap();
            match values.into_iter().next() {
                Some(Value::Player(player)) => player,
                other => panic!("expected player, got {:?}", other),
            }
        }

        fn create_room(&mut self, client_id: ClientId) -> RoomInfo {
            let map_id = self.map.id;
            let values = self
                .call(
                    client_id,
                    Proc::CreateRoom,
                    vec![map_id.into(), GameMode::Normal.into()],
                )
                .unwrap();
            room_of(values)
        }

        fn join(&mut self, client_id: ClientId, room_id: RoomId) -> RpcResult<Vec<Value>> {
            self.call(client_id, Proc::JoinRoom, vec![room_id.into()])
        }

        fn ready(&mut self, client_id: ClientId) {
            self.call(client_id, Proc::SetReadyToLaunch, vec![true.into()])
                .unwrap();
        }
    }

    fn room_of(values: Vec<Value>) -> RoomInfo {
        match values.into_iter().next() {
            Some(Value::Room(room)) => room,
            other => panic!("expected room, got {:?}", other),
        }
    }

    fn destroyed_count(events: &[ServerEvent], room_id: RoomId) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, ServerEvent::RoomDestroyed { room_id: r } if *r == room_id))
            .count()
    }

    #[test]
    fn two_clients_launch_a_match() {
        let mut h = Harness::new(2);
        let (a, b) = (h.connect(), h.connect());
        let pa = h.sign_up(a, "ann");
        let pb = h.sign_up(b, "bob");

        let room = h.create_room(a);
        assert_eq!(room.players, vec![pa.id]);

        h.clear();
        let joined = room_of(h.join(b, room.id).unwrap());
        assert_eq!(joined.players, vec![pa.id, pb.id]);
        assert!(h.events(a).contains(&ServerEvent::JoinedRoom {
            room_id: room.id,
            players: vec![pb.id],
        }));

        assert_eq!(h.call(a, Proc::Launch, vec![]), Err(Error::NotReady));
        h.ready(a);
        h.ready(b);

        h.clear();
        let url = match h.call(a, Proc::Launch, vec![]).unwrap().as_slice() {
            [Value::Str(url)] => url.clone(),
            other => panic!("expected url, got {:?}", other),
        };
        assert_eq!(url, format!("ws://match.test/match?roomId={}", room.id));

        let launched = ServerEvent::Launched {
            room_id: room.id,
            url: url.clone(),
        };
        assert!(h.events(a).contains(&launched));
        assert!(h.events(b).contains(&launched));

        let created = h.server.created.lock();
        let (room_id, request) = &created[0];
        assert_eq!(*room_id, room.id);
        let seats: Vec<_> = request
            .snapshot
            .seats
            .iter()
            .map(|s| (s.player.id, s.client_id))
            .collect();
        assert_eq!(seats, vec![(pa.id, Some(a)), (pb.id, Some(b))]);
        assert!(request.replay.is_none());
        drop(created);

        assert!(h.lobby.room(room.id).unwrap().launched);
        assert_eq!(h.call(a, Proc::Launch, vec![]), Err(Error::AlreadyLaunched));
        let late = h.connect();
        assert_eq!(h.join(late, room.id), Err(Error::NotAuthenticated));
        h.sign_up(late, "cat");
        assert_eq!(h.join(late, room.id), Err(Error::AlreadyLaunched));
    }

    #[test]
    fn creator_logoff_destroys_room_and_tells_each_member_once() {
        let mut h = Harness::new(4);
        let (a, b, c) = (h.connect(), h.connect(), h.connect());
        let pa = h.sign_up(a, "ann");
        h.sign_up(b, "bob");
        h.sign_up(c, "cat");
        h.sign_up(c, "cid");

        let room = h.create_room(a);
        h.join(b, room.id).unwrap();
        let joined = room_of(h.join(c, room.id).unwrap());
        assert_eq!(joined.players.len(), 4);

        h.clear();
        h.call(a, Proc::Logoff, vec![pa.id.into()]).unwrap();

        assert_eq!(destroyed_count(&h.events(a), room.id), 0);
        assert_eq!(destroyed_count(&h.events(b), room.id), 1);
        assert_eq!(destroyed_count(&h.events(c), room.id), 1, "one per client, not per player");
        assert_eq!(h.lobby.room_count(), 0);

        // former members are free again
        let fresh = h.create_room(b);
        assert_eq!(fresh.creator, b);
    }

    #[test]
    fn non_creator_leaving_keeps_the_room() {
        let mut h = Harness::new(3);
        let (a, b) = (h.connect(), h.connect());
        h.sign_up(a, "ann");
        let pb = h.sign_up(b, "bob");
        let room = h.create_room(a);
        h.join(b, room.id).unwrap();

        h.clear();
        h.call(b, Proc::LeaveRoom, vec![]).unwrap();
        assert!(h.events(a).contains(&ServerEvent::LeftRoom {
            room_id: room.id,
            players: vec![pb.id],
        }));
        assert_eq!(h.lobby.room(room.id).unwrap().len(), 1);
        assert_eq!(h.call(b, Proc::LeaveRoom, vec![]), Err(Error::NotFound("room")));
    }

    #[test]
    fn disconnect_cascades_to_logoff_and_room_cleanup() {
        let mut h = Harness::new(2);
        let (a, b) = (h.connect(), h.connect());
        let pa = h.sign_up(a, "ann");
        h.sign_up(b, "bob");
        let room = h.create_room(a);
        h.join(b, room.id).unwrap();

        h.clear();
        h.disconnect(a);
        let events = h.events(b);
        assert!(events.contains(&ServerEvent::LoggedOff { player_id: pa.id }));
        assert_eq!(destroyed_count(&events, room.id), 1);
        assert_eq!(h.lobby.session_count(), 1);
    }

    #[test]
    fn join_errors() {
        let mut h = Harness::new(2);
        let (a, b, c) = (h.connect(), h.connect(), h.connect());
        h.sign_up(a, "ann");
        h.sign_up(b, "bob");
        h.sign_up(b, "bea");
        h.sign_up(c, "cat");
        let room = h.create_room(a);

        assert_eq!(h.join(a, room.id), Err(Error::AlreadyJoined));
        assert_eq!(h.join(c, RoomId::new()), Err(Error::NotFound("room")));
        assert_eq!(h.join(b, room.id), Err(Error::TooMuchPlayersInRoom));
        assert_eq!(h.lobby.room(room.id).unwrap().len(), 1, "rejected join seats nobody");

        h.join(c, room.id).unwrap();
        let map_id = h.map.id;
        assert_eq!(
            h.call(a, Proc::CreateRoom, vec![map_id.into(), GameMode::Normal.into()]),
            Err(Error::AlreadyExists)
        );
        assert_eq!(
            h.call(c, Proc::CreateRoom, vec![map_id.into(), GameMode::Normal.into()]),
            Err(Error::AlreadyJoined)
        );
        assert_eq!(
            h.call(b, Proc::CreateRoom, vec![MapId::new().into(), GameMode::Normal.into()]),
            Err(Error::NotFound("map"))
        );
    }

    #[test]
    fn room_never_exceeds_map_capacity() {
        let mut h = Harness::new(3);
        let creator = h.connect();
        h.sign_up(creator, "owner");
        let room = h.create_room(creator);

        let mut others = Vec::new();
        for i in 0..6 {
            let client = h.connect();
            h.sign_up(client, &format!("p{}", i));
            if i % 2 == 0 {
                h.sign_up(client, &format!("q{}", i));
            }
            others.push(client);
        }

        for step in 0..24 {
            let client = others[step % others.len()];
            match step % 4 {
                0 | 1 => {
                    let _ = h.join(client, room.id);
                }
                2 => {
                    let _ = h.call(
                        creator,
                        Proc::CreateBots,
                        vec![Value::from(step % 3), BotType::Default.into()],
                    );
                }
                _ => {
                    let _ = h.call(client, Proc::LeaveRoom, vec![]);
                }
            }
            let room = h.lobby.room(room.id).expect("creator keeps the room alive");
            assert!(room.len() <= room.capacity(), "step {}: {} seated", step, room.len());
        }
    }

    #[test]
    fn only_the_creator_manages_bots_and_bots_are_ready() {
        let mut h = Harness::new(4);
        let (a, b) = (h.connect(), h.connect());
        h.sign_up(a, "ann");
        h.sign_up(b, "bob");
        let room = h.create_room(a);
        h.join(b, room.id).unwrap();

        assert_eq!(
            h.call(b, Proc::CreateBot, vec![BotType::Passive.into()]),
            Err(Error::NotAuthorized)
        );
        assert_eq!(
            h.call(a, Proc::CreateBots, vec![Value::from(3usize), BotType::Default.into()]),
            Err(Error::TooMuchPlayersInRoom)
        );
        assert_eq!(
            h.call(a, Proc::CreateBot, vec![BotType::None.into()]),
            Err(Error::NotAllowed("bot type required"))
        );

        let bot = match h
            .call(a, Proc::CreateBot, vec![BotType::Aggressive.into(), "Zed".into()])
            .unwrap()
            .remove(0)
        {
            Value::Player(bot) => bot,
            other => panic!("expected player, got {:?}", other),
        };
        assert_eq!(bot.name, "Zed");
        assert!(bot.is_bot());

        let info = h.lobby.room(room.id).unwrap().info();
        assert_eq!(info.ready_to_launch, vec![bot.id]);

        assert_eq!(
            h.call(b, Proc::DestroyBot, vec![bot.id.into()]),
            Err(Error::NotAuthorized)
        );
        h.call(a, Proc::DestroyBot, vec![bot.id.into()]).unwrap();
        assert_eq!(
            h.call(a, Proc::DestroyBot, vec![bot.id.into()]),
            Err(Error::NotFound("bot"))
        );
    }

    #[test]
    fn launched_room_left_with_only_bots_is_torn_down() {
        let mut h = Harness::new(3);
        let a = h.connect();
        let pa = h.sign_up(a, "ann");
        let room = h.create_room(a);
        h.call(a, Proc::CreateBots, vec![Value::from(2usize), BotType::Default.into()])
            .unwrap();
        h.ready(a);
        h.call(a, Proc::Launch, vec![]).unwrap();

        let request = h.server.created.lock()[0].1.clone();
        assert_eq!(request.snapshot.seats.len(), 3);
        assert!(request.snapshot.seats[1..].iter().all(|s| s.client_id.is_none()));

        h.call(a, Proc::Logoff, vec![pa.id.into()]).unwrap();
        assert!(h.lobby.room(room.id).is_none());
        assert_eq!(*h.server.destroyed.lock(), vec![room.id]);
    }

    #[test]
    fn teardown_goes_through_while_a_liveness_check_is_in_flight() {
        let mut h = Harness::new(3);
        let a = h.connect();
        let pa = h.sign_up(a, "ann");
        let room = h.create_room(a);
        h.call(a, Proc::CreateBots, vec![Value::from(2usize), BotType::Default.into()])
            .unwrap();
        h.ready(a);
        h.call(a, Proc::Launch, vec![]).unwrap();

        h.server.hold_alive.store(true, std::sync::atomic::Ordering::SeqCst);
        advance_liveness(&mut h);
        assert_eq!(*h.server.alive_checks.lock(), vec![room.id]);

        h.call(a, Proc::Logoff, vec![pa.id.into()]).unwrap();
        assert!(h.lobby.room(room.id).is_none());
        assert_eq!(*h.server.destroyed.lock(), vec![room.id]);

        // the late answer finds no room
        h.server.release_alive(Ok(true));
        h.pump();
        assert_eq!(h.lobby.room_count(), 0);
    }

    #[test]
    fn create_room_rejects_a_mode_the_map_lacks() {
        let mut h = Harness::new(2);
        let (a, b) = (h.connect(), h.connect());
        h.sign_up(a, "ann");
        h.sign_up(b, "bob");

        let skirmish = MapInfo {
            id: MapId::new(),
            name: "Skirmish".into(),
            max_players: 2,
            modes: vec![GameMode::Normal],
        };
        h.lobby.ctx.maps.save(&skirmish, &[2u8; 16]).unwrap();

        h.clear();
        assert_eq!(
            h.call(a, Proc::CreateRoom, vec![skirmish.id.into(), GameMode::Replay.into()]),
            Err(Error::NotAllowed("map does not support this mode"))
        );
        assert_eq!(h.lobby.room_count(), 0);
        assert!(!h.events(b).contains(&ServerEvent::RoomsChanged));

        // the creator is still free to open a supported room
        let room = room_of(
            h.call(a, Proc::CreateRoom, vec![skirmish.id.into(), GameMode::Normal.into()])
                .unwrap(),
        );
        assert_eq!(room.map_id, skirmish.id);
        assert!(h.events(b).contains(&ServerEvent::RoomsChanged));
    }

    #[test]
    fn second_launch_while_pending_is_rejected() {
        let mut h = Harness::new(2);
        let a = h.connect();
        h.sign_up(a, "ann");
        h.create_room(a);
        h.ready(a);

        h.server.hold_create.store(true, std::sync::atomic::Ordering::SeqCst);
        let pending = h.send(a, Proc::Launch, vec![]);
        assert!(h.connection(a).response(pending).is_none());
        assert_eq!(
            h.call(a, Proc::Launch, vec![]),
            Err(Error::NotAllowed("launch already in progress"))
        );

        h.server.release_create(Err(Error::RequestTimeout));
        h.pump();
        let result = h.connection(a).response(pending).unwrap().into_result();
        assert_eq!(result, Err(Error::RequestTimeout));

        // a failed launch can be retried
        h.server.hold_create.store(false, std::sync::atomic::Ordering::SeqCst);
        assert!(h.call(a, Proc::Launch, vec![]).is_ok());
    }

    fn launched_pair(h: &mut Harness) -> (ClientId, ClientId, RoomId) {
        let (a, b) = (h.connect(), h.connect());
        h.sign_up(a, "ann");
        h.sign_up(b, "bob");
        let room = h.create_room(a);
        h.join(b, room.id).unwrap();
        h.ready(a);
        h.ready(b);
        h.call(a, Proc::Launch, vec![]).unwrap();
        (a, b, room.id)
    }

    fn advance_liveness(h: &mut Harness) {
        h.clock.advance(LIVENESS);
        h.lobby.on_tick();
        h.pump();
    }

    #[test]
    fn liveness_failures_destroy_the_room_after_the_limit() {
        let mut h = Harness::new(2);
        let (a, b, room_id) = launched_pair(&mut h);
        {
            let mut answers = h.server.alive_answers.lock();
            answers.push_back(Err(Error::RequestTimeout));
            answers.push_back(Ok(true));
            answers.push_back(Err(Error::ConnectionClosed));
            answers.push_back(Err(Error::RequestTimeout));
            answers.push_back(Err(Error::ConnectionError("refused".into())));
        }

        h.lobby.on_tick();
        assert!(h.server.alive_checks.lock().is_empty(), "not due yet");

        for _ in 0..4 {
            advance_liveness(&mut h);
            assert!(h.lobby.room(room_id).is_some());
        }
        h.clear();
        advance_liveness(&mut h);

        assert!(h.lobby.room(room_id).is_none());
        assert_eq!(h.server.alive_checks.lock().len(), 5);
        assert_eq!(destroyed_count(&h.events(a), room_id), 1);
        assert_eq!(destroyed_count(&h.events(b), room_id), 1);
        assert!(h.server.destroyed.lock().is_empty());
    }

    #[test]
    fn finished_match_destroys_the_room() {
        let mut h = Harness::new(2);
        let (a, _, room_id) = launched_pair(&mut h);
        h.server.alive_answers.lock().push_back(Ok(false));

        advance_liveness(&mut h);
        assert!(h.lobby.room(room_id).is_none());
        // the creator may open a new room now
        h.create_room(a);
    }

    #[test]
    fn login_elsewhere_forces_logoff() {
        let mut h = Harness::new(2);
        let (a, b) = (h.connect(), h.connect());
        let ann = h.sign_up(a, "ann");
        h.create_room(a);

        h.clear();
        let again = h
            .call(b, Proc::Login, vec!["ann".into(), "pw".into()])
            .unwrap();
        assert_eq!(again, vec![Value::Player(ann.clone())]);
        assert!(h.events(a).contains(&ServerEvent::LoggedOff { player_id: ann.id }));
        assert_eq!(h.lobby.room_count(), 0, "creator left pre-launch");

        assert_eq!(
            h.call(a, Proc::GetPlayers, vec![]).unwrap(),
            vec![Value::Players(vec![])]
        );
        assert_eq!(
            h.call(b, Proc::GetPlayers, vec![]).unwrap(),
            vec![Value::Players(vec![ann])]
        );
    }

    #[test]
    fn local_player_cap_and_registration_are_enforced() {
        let mut h = Harness::new(2);
        let a = h.connect();
        h.sign_up(a, "ann");
        h.sign_up(a, "bob");
        assert_eq!(
            h.call(a, Proc::SignUp, vec!["cat".into(), "pw".into()]),
            Err(Error::TooMuchLocalPlayers)
        );
        assert_eq!(
            h.call(a, Proc::Login, vec!["ann".into(), "nope".into()]),
            Err(Error::NotAuthenticated)
        );

        h.lobby.unregister_client(a);
        assert_eq!(
            h.call(a, Proc::SignUp, vec!["dan".into(), "pw".into()]),
            Err(Error::NotRegistered)
        );
    }

    #[test]
    fn lobby_events_follow_the_room_lifecycle() {
        let mut h = Harness::new(2);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let token = h.events.subscribe(move |e| sink.lock().push(*e));

        let (a, _, room_id) = launched_pair(&mut h);
        h.server.alive_answers.lock().push_back(Ok(false));
        advance_liveness(&mut h);
        h.events.unsubscribe(token);
        h.disconnect(a);

        let seen = seen.lock();
        let rooms: Vec<_> = seen
            .iter()
            .filter(|e| {
                !matches!(e, LobbyEvent::PlayerLoggedIn(_) | LobbyEvent::PlayerLoggedOff(_))
            })
            .copied()
            .collect();
        assert_eq!(
            rooms,
            vec![
                LobbyEvent::RoomCreated(room_id),
                LobbyEvent::RoomLaunched(room_id),
                LobbyEvent::RoomDestroyed(room_id),
            ]
        );
        let logins = seen
            .iter()
            .filter(|e| matches!(e, LobbyEvent::PlayerLoggedIn(_)))
            .count();
        assert_eq!(logins, 2);
        assert!(!seen.iter().any(|e| matches!(e, LobbyEvent::PlayerLoggedOff(_))));
    }

    #[test]
    fn chat_stays_inside_the_room() {
        let mut h = Harness::new(2);
        let (a, b, c) = (h.connect(), h.connect(), h.connect());
        let pa = h.sign_up(a, "ann");
        let pb = h.sign_up(b, "bob");
        h.sign_up(c, "cat");
        let room = h.create_room(a);
        h.join(b, room.id).unwrap();

        h.clear();
        h.call(a, Proc::SendChatMessage, vec![pa.id.into(), "gl hf".into()])
            .unwrap();
        let message = ServerEvent::ChatMessage {
            sender: pa.id,
            room_id: Some(room.id),
            text: "gl hf".into(),
        };
        assert!(h.events(a).contains(&message));
        assert!(h.events(b).contains(&message));
        assert!(h.events(c).is_empty());

        assert_eq!(
            h.call(a, Proc::SendChatMessage, vec![pb.id.into(), "spoof".into()]),
            Err(Error::NotAuthorized)
        );
    }

    #[test]
    fn replay_rooms_need_a_saved_replay_and_reject_joins() {
        use crate::game::replay::{ReplayRecorder, ReplaySystem};

        let mut h = Harness::new(2);
        let (a, b) = (h.connect(), h.connect());
        let pa = h.sign_up(a, "ann");
        h.sign_up(b, "bob");

        let map_id = h.map.id;
        let room = room_of(
            h.call(a, Proc::CreateRoom, vec![map_id.into(), GameMode::Replay.into()])
                .unwrap(),
        );
        assert_eq!(
            h.join(b, room.id),
            Err(Error::NotAllowed("replay rooms cannot be joined"))
        );

        h.ready(a);
        assert_eq!(
            h.call(a, Proc::Launch, vec![]),
            Err(Error::NotAllowed("no replay selected"))
        );

        let recorder = ReplayRecorder::new(7, room.clone(), vec![pa.clone()]);
        let bytes = recorder.save().to_bytes().unwrap();
        let saved = match h
            .call(a, Proc::SaveReplay, vec!["first".into(), Value::Bytes(bytes.clone())])
            .unwrap()
            .remove(0)
        {
            Value::Replay(info) => info,
            other => panic!("expected replay, got {:?}", other),
        };
        assert_eq!(h.replays.list().unwrap(), vec![saved.clone()]);

        assert_eq!(
            h.call(a, Proc::SetReplay, vec![ReplayId::new().into()]),
            Err(Error::NotFound("replay"))
        );
        let updated = room_of(h.call(a, Proc::SetReplay, vec![saved.id.into()]).unwrap());
        assert_eq!(updated.replay_id, Some(saved.id));

        h.call(a, Proc::Launch, vec![]).unwrap();
        let request = h.server.created.lock()[0].1.clone();
        let data = request.replay_data().unwrap().expect("replay attached");
        assert_eq!(data.to_bytes().unwrap(), bytes);
    }
}

//! Binary wire protocol for lobby and match transports
//! These are the wire types for client-server communication. Frames are
//! bincode-encoded; requests carry a numeric procedure selector and a
//! positional argument list, responses a status plus positional values.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, RpcResult};
use crate::ws::value::Value;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Opaque per-connection identifier chosen by the client
    ClientId
);
uuid_id!(PlayerId);
uuid_id!(RoomId);
uuid_id!(MapId);
uuid_id!(ReplayId);

/// Closed status taxonomy carried by every RPC result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    NotRegistered,
    NotAuthenticated,
    NotAuthorized,
    NotFound,
    AlreadyExists,
    AlreadyJoined,
    AlreadyLaunched,
    TooMuchLocalPlayers,
    TooMuchPlayersInRoom,
    NotAllowed,
    NotReady,
    Paused,
    ConnectionError,
    RequestTimeout,
    ConnectionClosed,
    UnhandledException,
}

/// Game mode a room is created for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameMode {
    Normal,
    Replay,
}

/// Bot flavour; `None` marks a human account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BotType {
    #[default]
    None,
    Default,
    Passive,
    Aggressive,
}

impl BotType {
    pub fn is_bot(self) -> bool {
        self != BotType::None
    }
}

/// Cumulative player statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlayerStats {
    pub matches: u32,
    pub wins: u32,
    pub losses: u32,
}

/// Persistent player identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub id: PlayerId,
    pub name: String,
    pub bot_type: BotType,
    pub stats: PlayerStats,
}

impl Player {
    pub fn human(name: impl Into<String>) -> Self {
        Self {
            id: PlayerId::new(),
            name: name.into(),
            bot_type: BotType::None,
            stats: PlayerStats::default(),
        }
    }

    pub fn bot(name: impl Into<String>, bot_type: BotType) -> Self {
        Self {
            id: PlayerId::new(),
            name: name.into(),
            bot_type,
            stats: PlayerStats::default(),
        }
    }

    pub fn is_bot(&self) -> bool {
        self.bot_type.is_bot()
    }
}

/// Room snapshot as seen by clients and by the match host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub id: RoomId,
    pub creator: ClientId,
    pub map_id: MapId,
    pub mode: GameMode,
    pub players: Vec<PlayerId>,
    pub ready_to_launch: Vec<PlayerId>,
    pub launched: bool,
    pub replay_id: Option<ReplayId>,
}

/// Map metadata (the payload lives next to it in storage)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapInfo {
    pub id: MapId,
    pub name: String,
    pub max_players: usize,
    pub modes: Vec<GameMode>,
}

impl MapInfo {
    pub fn supports(&self, mode: GameMode) -> bool {
        self.modes.contains(&mode)
    }
}

/// Replay metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayInfo {
    pub id: ReplayId,
    pub name: String,
    pub map_id: MapId,
    pub player_count: usize,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// One player slot handed to the match host; bots have no client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seat {
    pub player: Player,
    pub client_id: Option<ClientId>,
}

/// Launched room plus its seating, in slot order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room: RoomInfo,
    pub seats: Vec<Seat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinate {
    pub row: i32,
    pub col: i32,
}

/// Numeric command code understood by the match engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandCode(pub u16);

impl CommandCode {
    pub const MOVE: CommandCode = CommandCode(1);
    pub const ATTACK: CommandCode = CommandCode(2);
    pub const CONVERT: CommandCode = CommandCode(3);
    pub const SPLIT: CommandCode = CommandCode(4);
    /// Reserved: emitted by the match coordinator when a player goes away
    pub const LEAVE_ROOM: CommandCode = CommandCode(u16::MAX);
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandParam {
    Int(i64),
    Bool(bool),
    Coord(Coordinate),
    Unit(u64),
}

/// A player-issued action
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Command {
    pub code: CommandCode,
    pub unit_id: u64,
    pub params: Vec<CommandParam>,
}

impl Command {
    pub fn new(code: CommandCode, unit_id: u64) -> Self {
        Self {
            code,
            unit_id,
            params: Vec::new(),
        }
    }

    pub fn with_param(mut self, param: CommandParam) -> Self {
        self.params.push(param);
        self
    }

    pub fn leave_room() -> Self {
        Self::new(CommandCode::LEAVE_ROOM, 0)
    }
}

/// Tick-stamped batch of commands, one list per player slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandsBundle {
    pub tick: u64,
    pub commands: Vec<Vec<Command>>,
}

impl CommandsBundle {
    pub fn is_empty(&self) -> bool {
        self.commands.iter().all(|c| c.is_empty())
    }
}

/// Remote procedure selector. Encoded on the wire as its `u16` code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
#[repr(u16)]
pub enum Proc {
    // Lobby
    Login = 1,
    SignUp = 2,
    Logoff = 3,
    GetPlayers = 4,
    GetRooms = 5,
    GetMaps = 6,
    CreateRoom = 7,
    JoinRoom = 8,
    LeaveRoom = 9,
    CreateBot = 10,
    CreateBots = 11,
    DestroyBot = 12,
    SetReadyToLaunch = 13,
    Launch = 14,
    GetReplays = 15,
    SaveReplay = 16,
    SetReplay = 17,
    SendChatMessage = 18,

    // Match
    ReadyToPlay = 100,
    Submit = 101,
    Pause = 102,
    GetReplay = 103,
    GetMatchPlayers = 104,
}

impl Proc {
    pub const ALL: [Proc; 23] = [
        Proc::Login,
        Proc::SignUp,
        Proc::Logoff,
        Proc::GetPlayers,
        Proc::GetRooms,
        Proc::GetMaps,
        Proc::CreateRoom,
        Proc::JoinRoom,
        Proc::LeaveRoom,
        Proc::CreateBot,
        Proc::CreateBots,
        Proc::DestroyBot,
        Proc::SetReadyToLaunch,
        Proc::Launch,
        Proc::GetReplays,
        Proc::SaveReplay,
        Proc::SetReplay,
        Proc::SendChatMessage,
        Proc::ReadyToPlay,
        Proc::Submit,
        Proc::Pause,
        Proc::GetReplay,
        Proc::GetMatchPlayers,
    ];
}

impl From<Proc> for u16 {
    fn from(proc: Proc) -> u16 {
        proc as u16
    }
}

impl TryFrom<u16> for Proc {
    type Error = String;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        Proc::ALL
            .into_iter()
            .find(|p| *p as u16 == code)
            .ok_or_else(|| format!("unknown procedure code {}", code))
    }
}

/// Request envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCall {
    pub proc: Proc,
    pub client_id: ClientId,
    pub args: Vec<Value>,
}

impl RemoteCall {
    pub fn new(proc: Proc, client_id: ClientId, args: Vec<Value>) -> Self {
        Self {
            proc,
            client_id,
            args,
        }
    }
}

/// Result envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteResult {
    pub status: Status,
    pub message: Option<String>,
    pub values: Vec<Value>,
}

impl RemoteResult {
    pub fn ok(values: Vec<Value>) -> Self {
        Self {
            status: Status::Ok,
            message: None,
            values,
        }
    }

    pub fn error(error: &Error) -> Self {
        Self {
            status: error.status(),
            message: error.wire_message(),
            values: Vec::new(),
        }
    }

    pub fn from_result(result: RpcResult<Vec<Value>>) -> Self {
        match result {
            Ok(values) => Self::ok(values),
            Err(e) => Self::error(&e),
        }
    }

    pub fn into_result(self) -> RpcResult<Vec<Value>> {
        match Error::from_status(self.status, self.message) {
            None => Ok(self.values),
            Some(e) => Err(e),
        }
    }
}

/// Unsolicited server → client push events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerEvent {
    LoggedIn {
        player: Player,
    },
    LoggedOff {
        player_id: PlayerId,
    },
    RoomsChanged,
    JoinedRoom {
        room_id: RoomId,
        players: Vec<PlayerId>,
    },
    LeftRoom {
        room_id: RoomId,
        players: Vec<PlayerId>,
    },
    RoomDestroyed {
        room_id: RoomId,
    },
    ReadyToLaunch {
        room_id: RoomId,
        players: Vec<PlayerId>,
        ready: bool,
    },
    Launched {
        room_id: RoomId,
        url: String,
    },
    Tick(CommandsBundle),
    Paused {
        paused: bool,
    },
    Ping {
        seq: u32,
    },
    RttChanged {
        client_id: ClientId,
        rtt_ms: u32,
    },
    ChatMessage {
        sender: PlayerId,
        room_id: Option<RoomId>,
        text: String,
    },
}

/// Client → server one-way messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientEvent {
    Pong { seq: u32 },
}

/// Everything a client can put on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientFrame {
    /// Must be the first frame on a connection
    Register { client_id: ClientId },
    Request { id: u32, call: RemoteCall },
    Message(ClientEvent),
}

/// Everything a server can put on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerFrame {
    Response { id: u32, result: RemoteResult },
    Event(ServerEvent),
}

pub fn encode<T: Serialize>(frame: &T) -> RpcResult<Bytes> {
    Ok(Bytes::from(bincode::serialize(frame)?))
}

pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> RpcResult<T> {
    Ok(bincode::deserialize(bytes)?)
}

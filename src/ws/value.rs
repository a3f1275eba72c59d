//! Positional RPC argument and return values

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, RpcResult};
use crate::ws::protocol::{
    BotType, ClientId, Command, CommandsBundle, GameMode, MapId, MapInfo, Player, PlayerId,
    ReplayId, ReplayInfo, RoomId, RoomInfo,
};

/// One positional argument or return value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
    Id(Uuid),
    Ids(Vec<Uuid>),
    Mode(GameMode),
    BotType(BotType),
    Player(Player),
    Players(Vec<Player>),
    Room(RoomInfo),
    Rooms(Vec<RoomInfo>),
    Map(MapInfo),
    Maps(Vec<MapInfo>),
    Replay(ReplayInfo),
    Replays(Vec<ReplayInfo>),
    Command(Command),
    Bundle(CommandsBundle),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Id(_) => "id",
            Value::Ids(_) => "ids",
            Value::Mode(_) => "mode",
            Value::BotType(_) => "bot type",
            Value::Player(_) => "player",
            Value::Players(_) => "players",
            Value::Room(_) => "room",
            Value::Rooms(_) => "rooms",
            Value::Map(_) => "map",
            Value::Maps(_) => "maps",
            Value::Replay(_) => "replay",
            Value::Replays(_) => "replays",
            Value::Command(_) => "command",
            Value::Bundle(_) => "bundle",
        }
    }
}

/// Conversion out of a positional `Value`
pub trait FromValue: Sized {
    const EXPECTED: &'static str;

    fn from_value(value: Value) -> Option<Self>;
}

macro_rules! value_conversions {
    ($($ty:ty => $variant:ident, $expected:literal;)*) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }

            impl FromValue for $ty {
                const EXPECTED: &'static str = $expected;

                fn from_value(value: Value) -> Option<Self> {
                    match value {
                        Value::$variant(v) => Some(v),
                        _ => None,
                    }
                }
            }
        )*
    };
}

value_conversions! {
    bool => Bool, "bool";
    i64 => Int, "int";
    String => Str, "string";
    Vec<u8> => Bytes, "bytes";
    Uuid => Id, "id";
    GameMode => Mode, "mode";
    BotType => BotType, "bot type";
    Player => Player, "player";
    Vec<Player> => Players, "players";
    RoomInfo => Room, "room";
    Vec<RoomInfo> => Rooms, "rooms";
    MapInfo => Map, "map";
    Vec<MapInfo> => Maps, "maps";
    ReplayInfo => Replay, "replay";
    Vec<ReplayInfo> => Replays, "replays";
    Command => Command, "command";
    CommandsBundle => Bundle, "bundle";
}

macro_rules! id_conversions {
    ($($ty:ident),*) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::Id(v.0)
                }
            }

            impl FromValue for $ty {
                const EXPECTED: &'static str = "id";

                fn from_value(value: Value) -> Option<Self> {
                    match value {
                        Value::Id(v) => Some($ty(v)),
                        _ => None,
                    }
                }
            }
        )*
    };
}

id_conversions!(ClientId, PlayerId, RoomId, MapId, ReplayId);

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Int(v as i64)
    }
}

impl FromValue for usize {
    const EXPECTED: &'static str = "non-negative int";

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Int(v) => usize::try_from(v).ok(),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<Vec<PlayerId>> for Value {
    fn from(v: Vec<PlayerId>) -> Self {
        Value::Ids(v.into_iter().map(|id| id.0).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Borrowed view over a call's positional arguments
pub struct Args<'a>(&'a [Value]);

impl<'a> Args<'a> {
    pub fn new(values: &'a [Value]) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Typed argument at `index`; malformed or missing input is reported as
    /// an unhandled error naming the position.
    pub fn get<T: FromValue>(&self, index: usize) -> RpcResult<T> {
        let value = self.0.get(index).ok_or_else(|| {
            Error::Unhandled(format!("argument {}: missing, expected {}", index, T::EXPECTED))
        })?;
        let kind = value.kind();
        T::from_value(value.clone()).ok_or_else(|| {
            Error::Unhandled(format!(
                "argument {}: expected {}, got {}",
                index,
                T::EXPECTED,
                kind
            ))
        })
    }

    /// Optional trailing argument; absent or `Null` yields `None`
    pub fn opt<T: FromValue>(&self, index: usize) -> RpcResult<Option<T>> {
        match self.0.get(index) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.get(index).map(Some),
        }
    }
}

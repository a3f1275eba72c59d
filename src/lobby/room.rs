//! Pre-match room roster

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::error::{Error, RpcResult};
use crate::ws::protocol::{
    ClientId, GameMode, MapInfo, Player, PlayerId, ReplayId, RoomId, RoomInfo,
};

/// Derived room state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    Open,
    /// Every seated player is ready
    ReadyPending,
    Launched,
}

/// Liveness polling state of a launched room
#[derive(Debug, Clone, Default)]
pub struct Liveness {
    pub next_check: Duration,
    pub failures: u32,
}

pub struct Room {
    pub id: RoomId,
    pub creator: ClientId,
    pub map: MapInfo,
    pub mode: GameMode,
    /// Seat order is slot order in the match
    players: Vec<PlayerId>,
    ready: HashSet<PlayerId>,
    bots: HashMap<PlayerId, Player>,
    pub launched: bool,
    pub launching: bool,
    pub replay_id: Option<ReplayId>,
    pub liveness: Liveness,
}

impl Room {
    pub fn new(creator: ClientId, map: MapInfo, mode: GameMode) -> Self {
        Self {
            id: RoomId::new(),
            creator,
            map,
            mode,
            players: Vec::new(),
            ready: HashSet::new(),
            bots: HashMap::new(),
            launched: false,
            launching: false,
            replay_id: None,
            liveness: Liveness::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.map.max_players
    }

    pub fn free_seats(&self) -> usize {
        self.capacity().saturating_sub(self.players.len())
    }

    pub fn players(&self) -> &[PlayerId] {
        &self.players
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn contains(&self, player_id: &PlayerId) -> bool {
        self.players.contains(player_id)
    }

    /// Seat every id or none of them
    pub fn seat(&mut self, ids: &[PlayerId]) -> RpcResult<()> {
        let new: Vec<PlayerId> = ids.iter().filter(|id| !self.contains(id)).copied().collect();
        if new.len() > self.free_seats() {
            return Err(Error::TooMuchPlayersInRoom);
        }
        self.players.extend(new);
        Ok(())
    }

    /// Remove the given ids; returns the ones that were seated
    pub fn unseat(&mut self, ids: &[PlayerId]) -> Vec<PlayerId> {
        let removed: Vec<PlayerId> = self
            .players
            .iter()
            .filter(|id| ids.contains(id))
            .copied()
            .collect();
        self.players.retain(|id| !ids.contains(id));
        for id in &removed {
            self.ready.remove(id);
            self.bots.remove(id);
        }
        removed
    }

    /// Seat a bot; bots are always ready
    pub fn add_bot(&mut self, bot: Player) -> RpcResult<()> {
        self.seat(&[bot.id])?;
        self.ready.insert(bot.id);
        self.bots.insert(bot.id, bot);
        Ok(())
    }

    pub fn remove_bot(&mut self, id: PlayerId) -> Option<Player> {
        let bot = self.bots.remove(&id)?;
        self.players.retain(|p| *p != id);
        self.ready.remove(&id);
        Some(bot)
    }

    pub fn bot(&self, id: &PlayerId) -> Option<&Player> {
        self.bots.get(id)
    }

    pub fn bot_count(&self) -> usize {
        self.bots.len()
    }

    pub fn is_bot(&self, id: &PlayerId) -> bool {
        self.bots.contains_key(id)
    }

    /// Seated, but nobody human left
    pub fn only_bots(&self) -> bool {
        !self.players.is_empty() && self.players.iter().all(|id| self.bots.contains_key(id))
    }

    /// Toggle readiness for the seated subset of `ids`; returns that subset
    pub fn set_ready(&mut self, ids: &[PlayerId], ready: bool) -> Vec<PlayerId> {
        let seated: Vec<PlayerId> = ids.iter().filter(|id| self.contains(id)).copied().collect();
        for id in &seated {
            if ready {
                self.ready.insert(*id);
            } else {
                self.ready.remove(id);
            }
        }
        seated
    }

    pub fn is_ready_to_launch(&self) -> bool {
        !self.players.is_empty() && self.players.iter().all(|id| self.ready.contains(id))
    }

    pub fn state(&self) -> RoomState {
        if self.launched {
            RoomState::Launched
        } else if self.is_ready_to_launch() {
            RoomState::ReadyPending
        } else {
            RoomState::Open
        }
    }

    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            id: self.id,
            creator: self.creator,
            map_id: self.map.id,
            mode: self.mode,
            players: self.players.clone(),
            ready_to_launch: self
                .players
                .iter()
                .filter(|id| self.ready.contains(id))
                .copied()
                .collect(),
            launched: self.launched,
            replay_id: self.replay_id,
        }
    }
}

//! Match engine collaborator
//!
//! The voxel rules are opaque to the coordinator: it only registers players,
//! forwards authorized commands, steps the engine once per tick and routes
//! bot-control grants. `LockstepEngine` is the reference implementation used
//! by the match host: it bundles every command submitted since the previous
//! tick into one `CommandsBundle` and folds them into a deterministic state
//! hash.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::store::MapData;
use crate::ws::protocol::{Command, CommandCode, CommandsBundle, Player};

/// Engine-side rejection
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Player slot {0} does not exist")]
    UnknownSlot(usize),

    #[error("Player slot {0} has left the match")]
    SlotLeft(usize),

    #[error("Map payload is empty")]
    EmptyMap,
}

pub trait MatchEngine: Send {
    fn register_player(&mut self, index: usize, player: &Player);

    fn submit(&mut self, index: usize, command: Command) -> Result<(), EngineError>;

    /// Advance one step. `None` means there is nothing left to simulate.
    /// The coordinator stamps the tick number on the returned bundle.
    fn tick(&mut self) -> Option<CommandsBundle>;

    /// The client playing `index` now drives the bots
    fn grant_bot_ctrl(&mut self, index: usize);

    fn deny_bot_ctrl(&mut self, index: usize);

    /// Digest of the simulation state, used to compare runs
    fn state_hash(&self) -> u64;
}

/// Parameters for building an engine
#[derive(Debug, Clone)]
pub struct EngineSetup {
    pub seed: u64,
    pub player_count: usize,
}

pub trait EngineFactory: Send + Sync {
    fn create(
        &self,
        map: &MapData,
        setup: &EngineSetup,
    ) -> Result<Box<dyn MatchEngine>, EngineError>;
}

/// Reference lockstep engine
pub struct LockstepEngine {
    players: Vec<Option<Player>>,
    pending: Vec<Vec<Command>>,
    left: Vec<bool>,
    bot_controller: Option<usize>,
    rng: ChaCha8Rng,
    hash: u64,
    ticks: u64,
}

impl LockstepEngine {
    pub fn new(map: &MapData, setup: &EngineSetup) -> Self {
        let mut hasher = DefaultHasher::new();
        map.payload.hash(&mut hasher);
        setup.seed.hash(&mut hasher);

        Self {
            players: vec![None; setup.player_count],
            pending: vec![Vec::new(); setup.player_count],
            left: vec![false; setup.player_count],
            bot_controller: None,
            rng: ChaCha8Rng::seed_from_u64(setup.seed),
            hash: hasher.finish(),
            ticks: 0,
        }
    }

    pub fn bot_controller(&self) -> Option<usize> {
        self.bot_controller
    }

    pub fn has_left(&self, index: usize) -> bool {
        self.left.get(index).copied().unwrap_or(false)
    }

    fn finished(&self) -> bool {
        self.players
            .iter()
            .zip(&self.left)
            .filter(|(p, _)| p.as_ref().map(|p| !p.is_bot()).unwrap_or(false))
            .all(|(_, left)| *left)
    }
}

impl MatchEngine for LockstepEngine {
    fn register_player(&mut self, index: usize, player: &Player) {
        if index >= self.players.len() {
            self.players.resize(index + 1, None);
            self.pending.resize(index + 1, Vec::new());
            self.left.resize(index + 1, false);
        }
        self.players[index] = Some(player.clone());
    }

    fn submit(&mut self, index: usize, command: Command) -> Result<(), EngineError> {
        if index >= self.players.len() {
            return Err(EngineError::UnknownSlot(index));
        }
        if self.left[index] {
            return Err(EngineError::SlotLeft(index));
        }
        if command.code == CommandCode::LEAVE_ROOM {
            self.left[index] = true;
        }
        self.pending[index].push(command);
        Ok(())
    }

    fn tick(&mut self) -> Option<CommandsBundle> {
        let had_commands = self.pending.iter().any(|c| !c.is_empty());
        if self.finished() && !had_commands {
            return None;
        }

        let commands: Vec<Vec<Command>> = self
            .pending
            .iter_mut()
            .map(std::mem::take)
            .collect();

        let mut hasher = DefaultHasher::new();
        self.hash.hash(&mut hasher);
        self.ticks.hash(&mut hasher);
        commands.hash(&mut hasher);
        // Per-tick entropy stands in for the simulation's own randomness
        self.rng.gen::<u64>().hash(&mut hasher);
        self.hash = hasher.finish();
        self.ticks += 1;

        Some(CommandsBundle { tick: 0, commands })
    }

    fn grant_bot_ctrl(&mut self, index: usize) {
        self.bot_controller = Some(index);
    }

    fn deny_bot_ctrl(&mut self, index: usize) {
        if self.bot_controller == Some(index) {
            self.bot_controller = None;
        }
    }

    fn state_hash(&self) -> u64 {
        self.hash
    }
}

/// Builds `LockstepEngine`s
#[derive(Debug, Clone, Copy, Default)]
pub struct LockstepEngineFactory;

impl EngineFactory for LockstepEngineFactory {
    fn create(
        &self,
        map: &MapData,
        setup: &EngineSetup,
    ) -> Result<Box<dyn MatchEngine>, EngineError> {
        if map.payload.is_empty() {
            return Err(EngineError::EmptyMap);
        }
        Ok(Box::new(LockstepEngine::new(map, setup)))
    }
}

#[cfg(test)]
pub(crate) fn test_map(max_players: usize) -> MapData {
    use crate::ws::protocol::{GameMode, MapId, MapInfo};

    MapData {
        info: MapInfo {
            id: MapId::new(),
            name: "Test Map".into(),
            max_players,
            modes: vec![GameMode::Normal, GameMode::Replay],
        },
        payload: vec![1, 2, 3, 4],
    }
}

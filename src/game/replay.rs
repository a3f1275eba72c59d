//! Replay recording and playback

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::RpcResult;
use crate::game::engine::MatchEngine;
use crate::ws::protocol::{Command, Player, ReplayId, RoomInfo};

/// One recorded command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayRecord {
    pub tick: u64,
    pub player_index: usize,
    pub command: Command,
}

/// Ordered command log of one match plus what is needed to rebuild it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayData {
    pub id: ReplayId,
    pub seed: u64,
    pub room: RoomInfo,
    pub players: Vec<Player>,
    pub records: Vec<ReplayRecord>,
}

impl ReplayData {
    pub fn to_bytes(&self) -> RpcResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> RpcResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

pub trait ReplaySystem: Send {
    /// Note a command accepted at `tick`
    fn record(&mut self, tick: u64, player_index: usize, command: Command);

    /// Called once per step, before the engine ticks
    fn tick(&mut self, tick: u64, engine: &mut dyn MatchEngine);

    fn save(&self) -> ReplayData;

    fn load(&mut self, data: ReplayData);
}

/// Records a live match
pub struct ReplayRecorder {
    data: ReplayData,
    last_tick: u64,
}

impl ReplayRecorder {
    pub fn new(seed: u64, room: RoomInfo, players: Vec<Player>) -> Self {
        Self {
            data: ReplayData {
                id: ReplayId::new(),
                seed,
                room,
                players,
                records: Vec::new(),
            },
            last_tick: 0,
        }
    }

    pub fn last_tick(&self) -> u64 {
        self.last_tick
    }
}

impl ReplaySystem for ReplayRecorder {
    fn record(&mut self, tick: u64, player_index: usize, command: Command) {
        self.data.records.push(ReplayRecord {
            tick,
            player_index,
            command,
        });
    }

    fn tick(&mut self, tick: u64, _engine: &mut dyn MatchEngine) {
        self.last_tick = tick;
    }

    fn save(&self) -> ReplayData {
        self.data.clone()
    }

    fn load(&mut self, data: ReplayData) {
        self.data = data;
    }
}

/// Feeds a recorded log back into an engine, tick for tick
pub struct ReplayPlayer {
    data: ReplayData,
    cursor: usize,
}

impl ReplayPlayer {
    pub fn new(mut data: ReplayData) -> Self {
        data.records.sort_by_key(|r| r.tick);
        Self { data, cursor: 0 }
    }

    pub fn is_finished(&self) -> bool {
        self.cursor >= self.data.records.len()
    }
}

impl ReplaySystem for ReplayPlayer {
    fn record(&mut self, _tick: u64, _player_index: usize, _command: Command) {}

    fn tick(&mut self, tick: u64, engine: &mut dyn MatchEngine) {
        while let Some(record) = self.data.records.get(self.cursor) {
            if record.tick > tick {
                break;
            }
            if let Err(e) = engine.submit(record.player_index, record.command.clone()) {
                warn!(tick = record.tick, player_index = record.player_index, error = %e, "Replayed command rejected");
            }
            self.cursor += 1;
        }
    }

    fn save(&self) -> ReplayData {
        self.data.clone()
    }

    fn load(&mut self, data: ReplayData) {
        *self = Self::new(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::engine::{test_map, EngineSetup, LockstepEngine};
    use crate::ws::protocol::{ClientId, CommandCode, GameMode, MapId, RoomId};

    fn room() -> RoomInfo {
        RoomInfo {
            id: RoomId::new(),
            creator: ClientId::new(),
            map_id: MapId::new(),
            mode: GameMode::Normal,
            players: vec![],
            ready_to_launch: vec![],
            launched: true,
            replay_id: None,
        }
    }

    fn engine() -> LockstepEngine {
        let mut engine = LockstepEngine::new(
            &test_map(2),
            &EngineSetup {
                seed: 3,
                player_count: 2,
            },
        );
        engine.register_player(0, &Player::human("a"));
        engine.register_player(1, &Player::human("b"));
        engine
    }

    #[test]
    fn player_resubmits_records_at_their_tick() {
        let mut recorder = ReplayRecorder::new(3, room(), vec![]);
        recorder.record(0, 0, Command::new(CommandCode::MOVE, 1));
        recorder.record(2, 1, Command::new(CommandCode::ATTACK, 2));

        let mut player = ReplayPlayer::new(recorder.save());
        let mut engine = engine();

        player.tick(0, &mut engine);
        assert_eq!(engine.tick().unwrap().commands[0].len(), 1);

        player.tick(1, &mut engine);
        assert!(engine.tick().unwrap().is_empty());

        player.tick(2, &mut engine);
        assert_eq!(engine.tick().unwrap().commands[1].len(), 1);
        assert!(player.is_finished());
    }

    #[test]
    fn replay_data_survives_bytes() {
        let mut recorder = ReplayRecorder::new(9, room(), vec![Player::human("a")]);
        recorder.record(4, 0, Command::leave_room());
        let data = recorder.save();

        let bytes = data.to_bytes().unwrap();
        assert_eq!(ReplayData::from_bytes(&bytes).unwrap(), data);
    }
}

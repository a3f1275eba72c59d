//! File-based map and replay storage
//!
//! Layout under the data root:
//!
//! ```text
//! <data_root>/Maps/<id>.meta      JSON `MapInfo`
//! <data_root>/Maps/<id>.data      opaque map payload
//! <data_root>/Replays/<id>.meta   JSON `ReplayInfo`
//! <data_root>/Replays/<id>.data   bincode `ReplayData`
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};

use super::StoreError;
use crate::ws::protocol::{GameMode, MapId, MapInfo, ReplayId, ReplayInfo};

const META_EXT: &str = "meta";
const DATA_EXT: &str = "data";

/// Directory of `<id>.meta` + `<id>.data` pairs
#[derive(Debug, Clone)]
struct BlobDir {
    dir: PathBuf,
}

impl BlobDir {
    fn open(dir: PathBuf) -> Result<Self, StoreError> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, id: &str, ext: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", id, ext))
    }

    fn write<M: Serialize>(&self, id: &str, meta: &M, data: &[u8]) -> Result<(), StoreError> {
        // Payload first so a visible .meta always has its data next to it
        fs::write(self.path(id, DATA_EXT), data)?;
        fs::write(self.path(id, META_EXT), serde_json::to_vec_pretty(meta)?)?;
        Ok(())
    }

    fn read_meta<M: DeserializeOwned>(&self, id: &str, what: &'static str) -> Result<M, StoreError> {
        let path = self.path(id, META_EXT);
        if !path.exists() {
            return Err(StoreError::NotFound(what));
        }
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }

    fn read_data(&self, id: &str, what: &'static str) -> Result<Vec<u8>, StoreError> {
        let path = self.path(id, DATA_EXT);
        if !path.exists() {
            return Err(StoreError::NotFound(what));
        }
        Ok(fs::read(path)?)
    }

    fn remove(&self, id: &str, what: &'static str) -> Result<(), StoreError> {
        let meta = self.path(id, META_EXT);
        if !meta.exists() {
            return Err(StoreError::NotFound(what));
        }
        fs::remove_file(meta)?;
        let data = self.path(id, DATA_EXT);
        if data.exists() {
            fs::remove_file(data)?;
        }
        Ok(())
    }

    /// All readable metadata entries; unreadable ones are skipped with a warning
    fn list<M: DeserializeOwned>(&self) -> Result<Vec<M>, StoreError> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(META_EXT) {
                continue;
            }
            match fs::read(&path)
                .map_err(StoreError::from)
                .and_then(|bytes| serde_json::from_slice(&bytes).map_err(StoreError::from))
            {
                Ok(meta) => entries.push(meta),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable metadata"),
            }
        }
        Ok(entries)
    }
}

/// Opaque map payload handed to the match engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapData {
    pub info: MapInfo,
    pub payload: Vec<u8>,
}

/// Maps under `<data_root>/Maps`
#[derive(Debug, Clone)]
pub struct MapStore {
    blobs: BlobDir,
}

impl MapStore {
    pub fn open(data_root: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            blobs: BlobDir::open(data_root.join("Maps"))?,
        })
    }

    pub fn save(&self, info: &MapInfo, payload: &[u8]) -> Result<(), StoreError> {
        self.blobs.write(&info.id.to_string(), info, payload)?;
        debug!(map_id = %info.id, name = %info.name, "Map saved");
        Ok(())
    }

    pub fn info(&self, id: MapId) -> Result<MapInfo, StoreError> {
        self.blobs.read_meta(&id.to_string(), "map")
    }

    pub fn load(&self, id: MapId) -> Result<MapData, StoreError> {
        let info = self.info(id)?;
        let payload = self.blobs.read_data(&id.to_string(), "map data")?;
        Ok(MapData { info, payload })
    }

    pub fn list(&self) -> Result<Vec<MapInfo>, StoreError> {
        let mut maps: Vec<MapInfo> = self.blobs.list()?;
        maps.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(maps)
    }

    /// Make sure at least one playable map exists
    pub fn seed_default(&self) -> Result<(), StoreError> {
        if !self.list()?.is_empty() {
            return Ok(());
        }
        let info = MapInfo {
            id: MapId::new(),
            name: "Default Arena".to_string(),
            max_players: 4,
            modes: vec![GameMode::Normal, GameMode::Replay],
        };
        self.save(&info, &[0u8; 64])?;
        info!(map_id = %info.id, "Seeded default map");
        Ok(())
    }
}

/// Replays under `<data_root>/Replays`
#[derive(Debug, Clone)]
pub struct ReplayStore {
    blobs: BlobDir,
}

impl ReplayStore {
    pub fn open(data_root: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            blobs: BlobDir::open(data_root.join("Replays"))?,
        })
    }

    pub fn save(&self, info: &ReplayInfo, data: &[u8]) -> Result<(), StoreError> {
        self.blobs.write(&info.id.to_string(), info, data)?;
        debug!(replay_id = %info.id, name = %info.name, bytes = data.len(), "Replay saved");
        Ok(())
    }

    pub fn info(&self, id: ReplayId) -> Result<ReplayInfo, StoreError> {
        self.blobs.read_meta(&id.to_string(), "replay")
    }

    pub fn load(&self, id: ReplayId) -> Result<Vec<u8>, StoreError> {
        self.blobs.read_data(&id.to_string(), "replay data")
    }

    pub fn remove(&self, id: ReplayId) -> Result<(), StoreError> {
        self.blobs.remove(&id.to_string(), "replay")
    }

    pub fn list(&self) -> Result<Vec<ReplayInfo>, StoreError> {
        let mut replays: Vec<ReplayInfo> = self.blobs.list()?;
        replays.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(replays)
    }
}

#[cfg(test)]
pub(crate) fn temp_root(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("arena-{}-{}", label, uuid::Uuid::new_v4()))
}

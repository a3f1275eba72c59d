//! Player credential repository

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::StoreError;
use crate::ws::protocol::{Player, PlayerId};

/// Credential lookup and account creation
pub trait PlayerRepository: Send + Sync {
    /// Player whose name and password match, if any
    fn find_by_credentials(&self, name: &str, password: &str)
        -> Result<Option<Player>, StoreError>;

    /// Create a new account; fails with `AlreadyExists` for a taken name
    fn create(&self, name: &str, password: &str) -> Result<Player, StoreError>;

    fn get(&self, id: PlayerId) -> Result<Option<Player>, StoreError>;
}

/// Stored account record
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PlayerRecord {
    player: Player,
    salt: String,
    password_hash: String,
}

/// In-memory player repository, optionally persisted to a JSON file
pub struct PlayerStore {
    path: Option<PathBuf>,
    records: Mutex<HashMap<String, PlayerRecord>>,
}

impl PlayerStore {
    /// Store that lives only for the process lifetime
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Open (or start) the store at `<data_root>/Players/players.json`
    pub fn open(data_root: &Path) -> Result<Self, StoreError> {
        let dir = data_root.join("Players");
        fs::create_dir_all(&dir)?;
        let path = dir.join("players.json");

        let records: Vec<PlayerRecord> = if path.exists() {
            serde_json::from_slice(&fs::read(&path)?)?
        } else {
            Vec::new()
        };

        info!(path = %path.display(), accounts = records.len(), "Player store opened");

        Ok(Self {
            path: Some(path),
            records: Mutex::new(
                records
                    .into_iter()
                    .map(|r| (name_key(&r.player.name), r))
                    .collect(),
            ),
        })
    }

    fn persist(&self, records: &HashMap<String, PlayerRecord>) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let list: Vec<&PlayerRecord> = records.values().collect();
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&list)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl PlayerRepository for PlayerStore {
    fn find_by_credentials(
        &self,
        name: &str,
        password: &str,
    ) -> Result<Option<Player>, StoreError> {
        let records = self.records.lock();
        Ok(records
            .get(&name_key(name))
            .filter(|r| hash_password(&r.salt, password) == r.password_hash)
            .map(|r| r.player.clone()))
    }

    fn create(&self, name: &str, password: &str) -> Result<Player, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::Invalid("player name is empty".into()));
        }
        if password.is_empty() {
            return Err(StoreError::Invalid("password is empty".into()));
        }

        let mut records = self.records.lock();
        let key = name_key(name);
        if records.contains_key(&key) {
            return Err(StoreError::AlreadyExists);
        }

        let salt = new_salt();
        let record = PlayerRecord {
            player: Player::human(name),
            password_hash: hash_password(&salt, password),
            salt,
        };
        let player = record.player.clone();
        records.insert(key.clone(), record);

        if let Err(e) = self.persist(&records) {
            records.remove(&key);
            return Err(e);
        }

        debug!(player_id = %player.id, name = %player.name, "Player account created");
        Ok(player)
    }

    fn get(&self, id: PlayerId) -> Result<Option<Player>, StoreError> {
        Ok(self
            .records
            .lock()
            .values()
            .find(|r| r.player.id == id)
            .map(|r| r.player.clone()))
    }
}

fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

fn new_salt() -> String {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    hex::encode(salt)
}

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

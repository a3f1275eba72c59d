//! Login / sign-up as an explicit three-step saga
//!
//! `ValidateCredentials` → `ForceLogoffExisting` → `Commit`. Each step
//! consumes the previous one, so a login can only be committed after its
//! credentials were checked and any stale session elsewhere was torn down.

use tracing::{debug, info};

use crate::error::{Error, RpcResult};
use crate::store::PlayerRepository;
use crate::ws::protocol::{ClientId, Player, PlayerId};

/// Lobby session bookkeeping the saga reads and mutates
pub trait SessionDirectory {
    fn is_registered(&self, client_id: ClientId) -> bool;

    /// Players currently logged in through this client
    fn local_player_count(&self, client_id: ClientId) -> usize;

    /// Client the player is currently logged in through
    fn session_owner(&self, player_id: PlayerId) -> Option<ClientId>;

    /// Log the player off its current client, with the usual cascade
    fn force_logoff(&mut self, client_id: ClientId, player_id: PlayerId);

    fn commit_login(&mut self, client_id: ClientId, player: Player);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginMode {
    Login,
    SignUp,
}

pub struct ValidateCredentials {
    client_id: ClientId,
    name: String,
    password: String,
    mode: LoginMode,
}

impl ValidateCredentials {
    pub fn new(client_id: ClientId, name: String, password: String, mode: LoginMode) -> Self {
        Self {
            client_id,
            name,
            password,
            mode,
        }
    }

    pub fn validate<D: SessionDirectory>(
        self,
        directory: &D,
        players: &dyn PlayerRepository,
        max_local_players: usize,
    ) -> RpcResult<ForceLogoffExisting> {
        if !directory.is_registered(self.client_id) {
            return Err(Error::NotRegistered);
        }
        if self.name.trim().is_empty() {
            return Err(Error::NotAuthenticated);
        }

        let player = match self.mode {
            LoginMode::Login => players
                .find_by_credentials(&self.name, &self.password)?
                .ok_or(Error::NotAuthenticated)?,
            LoginMode::SignUp => {
                check_local_cap(directory, self.client_id, max_local_players)?;
                players.create(&self.name, &self.password)?
            }
        };

        let owner = directory.session_owner(player.id);
        if self.mode == LoginMode::Login && owner != Some(self.client_id) {
            check_local_cap(directory, self.client_id, max_local_players)?;
        }

        debug!(client_id = %self.client_id, player_id = %player.id, "Credentials accepted");
        Ok(ForceLogoffExisting {
            client_id: self.client_id,
            player,
            owner,
        })
    }
}

fn check_local_cap<D: SessionDirectory>(
    directory: &D,
    client_id: ClientId,
    max_local_players: usize,
) -> RpcResult<()> {
    if directory.local_player_count(client_id) >= max_local_players {
        return Err(Error::TooMuchLocalPlayers);
    }
    Ok(())
}

pub struct ForceLogoffExisting {
    client_id: ClientId,
    player: Player,
    owner: Option<ClientId>,
}

impl ForceLogoffExisting {
    /// End a session the same player holds on another client
    pub fn force_logoff<D: SessionDirectory>(self, directory: &mut D) -> Commit {
        let displaced = match self.owner {
            Some(other) if other != self.client_id => {
                info!(
                    player_id = %self.player.id,
                    from = %other,
                    to = %self.client_id,
                    "Forcing logoff of existing session"
                );
                directory.force_logoff(other, self.player.id);
                Some(other)
            }
            _ => None,
        };
        Commit {
            client_id: self.client_id,
            player: self.player,
            displaced,
            already_local: self.owner == Some(self.client_id),
        }
    }
}

pub struct Commit {
    client_id: ClientId,
    player: Player,
    displaced: Option<ClientId>,
    already_local: bool,
}

impl Commit {
    pub fn displaced(&self) -> Option<ClientId> {
        self.displaced
    }

    /// Record the session. Logging in again on the same client is a no-op.
    pub fn commit<D: SessionDirectory>(self, directory: &mut D) -> Player {
        if !self.already_local {
            directory.commit_login(self.client_id, self.player.clone());
        }
        self.player
    }
}

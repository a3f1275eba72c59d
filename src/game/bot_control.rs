//! Bot-control failover
//!
//! At most one client at a time holds the authority to submit commands for
//! bot slots and for slots whose owner disconnected. The holder keeps it
//! while it keeps answering pings; on timeout or disconnect the next eligible
//! human client in round-robin order takes over.

use std::time::Duration;

use tracing::{debug, info};

use crate::game::engine::MatchEngine;
use crate::ws::protocol::ClientId;

/// Ownership view of one player slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    /// Connected client playing this slot
    pub owner: Option<ClientId>,
    pub is_bot: bool,
}

/// Current authority holder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Holder {
    pub client_id: ClientId,
    pub player_index: usize,
}

#[derive(Debug)]
pub struct BotControlManager {
    timeout: Duration,
    holder: Option<Holder>,
    deadline: Duration,
    cursor: Option<usize>,
}

impl BotControlManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            holder: None,
            deadline: Duration::ZERO,
            cursor: None,
        }
    }

    pub fn holder(&self) -> Option<Holder> {
        self.holder
    }

    /// Hand authority to the next eligible client after the cursor. If there
    /// is none the current holder keeps it while still connected.
    pub fn activate_next(
        &mut self,
        slots: &[Slot],
        engine: &mut dyn MatchEngine,
        now: Duration,
    ) -> Option<Holder> {
        let count = slots.len();
        let start = self.cursor.map(|c| c + 1).unwrap_or(0);
        let current = self.holder.map(|h| h.client_id);

        let next = (0..count)
            .map(|step| (start + step) % count)
            .find_map(|i| match slots[i] {
                Slot {
                    owner: Some(owner),
                    is_bot: false,
                } if Some(owner) != current => Some((i, owner)),
                _ => None,
            });

        match next {
            Some((index, client_id)) => {
                if let Some(previous) = self.holder.take() {
                    engine.deny_bot_ctrl(previous.player_index);
                }
                let holder = Holder {
                    client_id,
                    player_index: index,
                };
                engine.grant_bot_ctrl(index);
                self.holder = Some(holder);
                self.cursor = Some(index);
                self.deadline = now + self.timeout;
                info!(client_id = %client_id, player_index = index, "Bot control granted");
            }
            None => {
                let still_connected = self
                    .holder
                    .map(|h| slots.iter().any(|s| s.owner == Some(h.client_id)))
                    .unwrap_or(false);
                if still_connected {
                    self.deadline = now + self.timeout;
                } else if let Some(previous) = self.holder.take() {
                    engine.deny_bot_ctrl(previous.player_index);
                    debug!(client_id = %previous.client_id, "Bot control dropped, no eligible client");
                }
            }
        }
        self.holder
    }

    /// The holder answered a ping
    pub fn ping(&mut self, client_id: ClientId, now: Duration) {
        if self.holder.map(|h| h.client_id) == Some(client_id) {
            self.deadline = now + self.timeout;
        }
    }

    /// Re-elect on timeout, or when nobody holds authority
    pub fn update(&mut self, slots: &[Slot], engine: &mut dyn MatchEngine, now: Duration) {
        match self.holder {
            Some(holder) if now >= self.deadline => {
                debug!(client_id = %holder.client_id, "Bot control timed out");
                self.activate_next(slots, engine, now);
            }
            None => {
                self.activate_next(slots, engine, now);
            }
            _ => {}
        }
    }

    pub fn on_disconnected(&mut self, client_id: ClientId, engine: &mut dyn MatchEngine) {
        if let Some(holder) = self.holder {
            if holder.client_id == client_id {
                engine.deny_bot_ctrl(holder.player_index);
                self.holder = None;
                debug!(client_id = %client_id, "Bot control holder disconnected");
            }
        }
    }

    /// May `client_id` submit on behalf of slot `index`?
    pub fn has_control(&self, client_id: ClientId, index: usize, slots: &[Slot]) -> bool {
        let Some(holder) = self.holder else {
            return false;
        };
        holder.client_id == client_id
            && slots
                .get(index)
                .map(|s| s.is_bot || s.owner.is_none())
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::engine::{test_map, EngineSetup, LockstepEngine};

    fn engine() -> LockstepEngine {
        LockstepEngine::new(
            &test_map(4),
            &EngineSetup {
                seed: 1,
                player_count: 4,
            },
        )
    }

    fn human(owner: ClientId) -> Slot {
        Slot {
            owner: Some(owner),
            is_bot: false,
        }
    }

    fn bot() -> Slot {
        Slot {
            owner: None,
            is_bot: true,
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn first_activation_picks_the_first_human() {
        let (a, b) = (ClientId::new(), ClientId::new());
        let slots = [bot(), human(a), human(b)];
        let mut engine = engine();
        let mut manager = BotControlManager::new(TIMEOUT);

        let holder = manager.activate_next(&slots, &mut engine, Duration::ZERO).unwrap();
        assert_eq!(holder.client_id, a);
        assert_eq!(engine.bot_controller(), Some(1));
        assert!(manager.has_control(a, 0, &slots));
        assert!(!manager.has_control(a, 2, &slots), "humans keep their own slots");
        assert!(!manager.has_control(b, 0, &slots));
    }

    #[test]
    fn timeout_rotates_to_the_next_client() {
        let (a, b) = (ClientId::new(), ClientId::new());
        let slots = [human(a), human(b), bot()];
        let mut engine = engine();
        let mut manager = BotControlManager::new(TIMEOUT);
        manager.activate_next(&slots, &mut engine, Duration::ZERO);

        manager.ping(a, Duration::from_secs(4));
        manager.update(&slots, &mut engine, Duration::from_secs(8));
        assert_eq!(manager.holder().unwrap().client_id, a);

        manager.update(&slots, &mut engine, Duration::from_secs(9));
        assert_eq!(manager.holder().unwrap().client_id, b);
        assert_eq!(engine.bot_controller(), Some(1));

        manager.update(&slots, &mut engine, Duration::from_secs(14));
        assert_eq!(manager.holder().unwrap().client_id, a, "round robin wraps");
    }

    #[test]
    fn sole_holder_keeps_control_when_nobody_else_is_eligible() {
        let a = ClientId::new();
        let slots = [human(a), bot()];
        let mut engine = engine();
        let mut manager = BotControlManager::new(TIMEOUT);
        manager.activate_next(&slots, &mut engine, Duration::ZERO);

        manager.update(&slots, &mut engine, Duration::from_secs(6));
        assert_eq!(manager.holder().unwrap().client_id, a);
        assert_eq!(engine.bot_controller(), Some(0));
    }

    #[test]
    fn disconnect_clears_and_update_reelects() {
        let (a, b) = (ClientId::new(), ClientId::new());
        let mut slots = [human(a), human(b), bot()];
        let mut engine = engine();
        let mut manager = BotControlManager::new(TIMEOUT);
        manager.activate_next(&slots, &mut engine, Duration::ZERO);

        slots[0].owner = None;
        manager.on_disconnected(a, &mut engine);
        assert!(manager.holder().is_none());
        assert_eq!(engine.bot_controller(), None);

        manager.update(&slots, &mut engine, Duration::from_secs(1));
        assert_eq!(manager.holder().unwrap().client_id, b);
        assert!(manager.has_control(b, 0, &slots), "orphaned slot is now driven by b");
    }

    #[test]
    fn no_humans_means_no_authority() {
        let slots = [bot(), bot()];
        let mut engine = engine();
        let mut manager = BotControlManager::new(TIMEOUT);
        assert!(manager.activate_next(&slots, &mut engine, Duration::ZERO).is_none());
        assert_eq!(engine.bot_controller(), None);
    }
}

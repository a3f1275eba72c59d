//! Round-trip sampling that gates match start
//!
//! Each registered client gets a fixed-length ring of RTT samples. Every
//! answered ping writes the slot at the current index and advances it; when
//! the index wraps back to zero the client counts as initialized. The match
//! may only start once every remaining client is initialized. Removing a
//! client (disconnect) also counts toward completion.

use std::collections::HashMap;
use std::time::Duration;

use crate::ws::protocol::ClientId;

#[derive(Debug, Clone)]
struct RttSamples {
    samples: Vec<Duration>,
    index: usize,
    filled: usize,
    initialized: bool,
    in_flight: Option<(u32, Duration)>,
}

#[derive(Debug)]
pub struct PingTimer {
    sample_count: usize,
    clients: HashMap<ClientId, RttSamples>,
    next_seq: u32,
    fired: bool,
}

impl PingTimer {
    pub fn new(sample_count: usize) -> Self {
        Self {
            sample_count: sample_count.max(1),
            clients: HashMap::new(),
            next_seq: 0,
            fired: false,
        }
    }

    pub fn add(&mut self, client_id: ClientId) {
        let samples = vec![Duration::ZERO; self.sample_count];
        self.clients.entry(client_id).or_insert(RttSamples {
            samples,
            index: 0,
            filled: 0,
            initialized: false,
            in_flight: None,
        });
    }

    pub fn remove(&mut self, client_id: ClientId) {
        self.clients.remove(&client_id);
    }

    pub fn contains(&self, client_id: ClientId) -> bool {
        self.clients.contains_key(&client_id)
    }

    /// Start a ping to `client_id`; returns the sequence number to send
    pub fn ping(&mut self, client_id: ClientId, now: Duration) -> Option<u32> {
        let state = self.clients.get_mut(&client_id)?;
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        state.in_flight = Some((seq, now));
        Some(seq)
    }

    /// Record the answer to an outstanding ping. Stale or unknown pongs are
    /// ignored.
    pub fn pong(&mut self, client_id: ClientId, seq: u32, now: Duration) -> Option<Duration> {
        let state = self.clients.get_mut(&client_id)?;
        let (expected, sent_at) = state.in_flight?;
        if expected != seq {
            return None;
        }
        state.in_flight = None;

        let rtt = now.saturating_sub(sent_at);
        let len = state.samples.len();
        state.samples[state.index] = rtt;
        state.index = (state.index + 1) % len;
        state.filled = (state.filled + 1).min(len);
        if state.index == 0 {
            state.initialized = true;
        }
        Some(rtt)
    }

    pub fn is_initialized(&self, client_id: ClientId) -> bool {
        self.clients
            .get(&client_id)
            .map(|s| s.initialized)
            .unwrap_or(false)
    }

    /// Clients still rotating their first buffer
    pub fn pending_clients(&self) -> Vec<ClientId> {
        self.clients
            .iter()
            .filter(|(_, s)| !s.initialized)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Mean of the recorded samples
    pub fn rtt(&self, client_id: ClientId) -> Option<Duration> {
        let state = self.clients.get(&client_id)?;
        if state.filled == 0 {
            return None;
        }
        let recorded = if state.initialized {
            &state.samples[..]
        } else {
            &state.samples[..state.filled]
        };
        Some(recorded.iter().sum::<Duration>() / recorded.len() as u32)
    }

    /// One-shot latch. The first time every remaining client is
    /// initialized, `on_complete` runs against `target`; later calls never
    /// run it again. Returns whether it fired on this call.
    pub fn complete_with<C: ?Sized, F>(&mut self, target: &mut C, on_complete: F) -> bool
    where
        F: FnOnce(&mut C),
    {
        if self.fired || !self.clients.values().all(|s| s.initialized) {
            return false;
        }
        self.fired = true;
        on_complete(target);
        true
    }

    pub fn has_completed(&self) -> bool {
        self.fired
    }
}

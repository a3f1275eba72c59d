//! Outbound queue shared between the consumer and sender threads

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::error;

use crate::ws::protocol::{encode, ClientId, RemoteResult, ServerEvent, ServerFrame};

/// Broadcast addressing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Targets {
    /// Exactly these clients (unknown ids are skipped)
    Clients(Vec<ClientId>),
    /// Every registered client, optionally minus one
    AllExcept(Option<ClientId>),
}

/// Where a deferred response goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyTo {
    pub client_id: ClientId,
    pub request_id: u32,
}

/// One encoded frame waiting for the sender thread
#[derive(Debug, Clone)]
pub enum Outgoing {
    Direct { client_id: ClientId, frame: Bytes },
    Broadcast { targets: Targets, frame: Bytes },
}

struct Queue {
    items: Mutex<VecDeque<Outgoing>>,
    ready: Condvar,
}

/// Cloneable handle the coordinators use to talk to clients. Frames are
/// encoded on the calling (consumer) thread; the sender thread only writes.
#[derive(Clone)]
pub struct Outbox {
    queue: Arc<Queue>,
}

impl Outbox {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(Queue {
                items: Mutex::new(VecDeque::new()),
                ready: Condvar::new(),
            }),
        }
    }

    pub fn send(&self, client_id: ClientId, event: &ServerEvent) {
        if let Some(frame) = encode_frame(&ServerFrame::Event(event.clone())) {
            self.push(Outgoing::Direct { client_id, frame });
        }
    }

    pub fn broadcast(&self, targets: Targets, event: &ServerEvent) {
        if let Targets::Clients(ids) = &targets {
            if ids.is_empty() {
                return;
            }
        }
        if let Some(frame) = encode_frame(&ServerFrame::Event(event.clone())) {
            self.push(Outgoing::Broadcast { targets, frame });
        }
    }

    pub fn respond(&self, reply_to: ReplyTo, result: RemoteResult) {
        let frame = ServerFrame::Response {
            id: reply_to.request_id,
            result,
        };
        if let Some(frame) = encode_frame(&frame) {
            self.push(Outgoing::Direct {
                client_id: reply_to.client_id,
                frame,
            });
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.items.lock().len()
    }

    fn push(&self, item: Outgoing) {
        let mut items = self.queue.items.lock();
        items.push_back(item);
        self.queue.ready.notify_one();
    }

    pub(super) fn wait_next(&self, timeout: Duration) -> Option<Outgoing> {
        let mut items = self.queue.items.lock();
        if items.is_empty() {
            self.queue.ready.wait_for(&mut items, timeout);
        }
        items.pop_front()
    }

    pub(super) fn take_all(&self) -> Vec<Outgoing> {
        self.queue.items.lock().drain(..).collect()
    }

    pub(super) fn wake_all(&self) {
        let _items = self.queue.items.lock();
        self.queue.ready.notify_all();
    }
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_frame(frame: &ServerFrame) -> Option<Bytes> {
    match encode(frame) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            error!(error = %e, "Failed to encode server frame");
            None
        }
    }
}

//! Test doubles for driving coordinators through a transport without sockets

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use super::{Connection, TransportError};
use crate::ws::protocol::{decode, RemoteResult, ServerEvent, ServerFrame};

/// Connection that keeps every frame it is asked to send
#[derive(Default)]
pub struct RecordingConnection {
    frames: Mutex<Vec<Bytes>>,
    closed: AtomicBool,
}

impl RecordingConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn frames(&self) -> Vec<ServerFrame> {
        self.frames
            .lock()
            .iter()
            .map(|bytes| decode(bytes).expect("valid server frame"))
            .collect()
    }

    pub fn events(&self) -> Vec<ServerEvent> {
        self.frames()
            .into_iter()
            .filter_map(|frame| match frame {
                ServerFrame::Event(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    pub fn response(&self, request_id: u32) -> Option<RemoteResult> {
        self.frames().into_iter().find_map(|frame| match frame {
            ServerFrame::Response { id, result } if id == request_id => Some(result),
            _ => None,
        })
    }

    pub fn clear(&self) {
        self.frames.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Connection for RecordingConnection {
    fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.frames.lock().push(frame);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

//! Two-thread network pipeline
//!
//! Producers (socket reader tasks) push requests and messages into one FIFO.
//! A single consumer thread (`<name>-main`) owns the coordinator and feeds it
//! one item at a time, calling `on_tick` after every item and once per idle
//! pass, so coordinator code never needs internal locking. A second thread
//! (`<name>-send`) drains the outbound queue and performs the blocking sends.
//!
//! The inbound queue and the client → connection registry share one lock, so
//! a send can never observe a half-registered client.

pub mod dispatch;
mod outbox;

#[cfg(test)]
pub mod testing;

pub use outbox::{Outbox, Outgoing, ReplyTo, Targets};

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::ws::protocol::{ClientEvent, ClientId, RemoteCall};

/// A live client connection. `send` may block; it is only ever called from
/// the sender thread.
pub trait Connection: Send + Sync {
    fn send(&self, frame: Bytes) -> Result<(), TransportError>;
    fn close(&self);
}

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Client {0} is already registered")]
    AlreadyRegistered(ClientId),

    #[error("Connection closed")]
    Closed,

    #[error("Send failed: {0}")]
    Send(String),
}

/// Coordinator driven by the consumer thread
pub trait Service: Send + 'static {
    fn on_register(&mut self, client_id: ClientId);
    fn on_unregister(&mut self, client_id: ClientId);
    fn on_request(&mut self, request: Request);
    fn on_message(&mut self, client_id: ClientId, event: ClientEvent);
    fn on_tick(&mut self);
}

/// Inbound RPC request bound to the connection it arrived on
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub client_id: ClientId,
    pub id: u32,
    pub call: RemoteCall,
}

impl Request {
    pub fn reply_to(&self) -> ReplyTo {
        ReplyTo {
            client_id: self.client_id,
            request_id: self.id,
        }
    }
}

type Callback<S> = Box<dyn FnOnce(&mut S) + Send>;

enum Item<S> {
    Register(ClientId),
    Unregister(ClientId),
    Request(Request),
    Message(ClientId, ClientEvent),
    Callback(Callback<S>),
}

struct Inbound<S> {
    queue: VecDeque<Item<S>>,
    connections: HashMap<ClientId, Arc<dyn Connection>>,
}

struct Shared<S> {
    inbound: Mutex<Inbound<S>>,
    inbound_ready: Condvar,
    running: AtomicBool,
}

impl<S> Shared<S> {
    fn push(&self, item: Item<S>) {
        let mut inbound = self.inbound.lock();
        inbound.queue.push_back(item);
        self.inbound_ready.notify_one();
    }
}

/// Posts closures onto the consumer thread. Used to deliver async results
/// (e.g. match server RPC completions) back into coordinator state.
pub struct Scheduler<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for Scheduler<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<S: Service> Scheduler<S> {
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.shared.push(Item::Callback(Box::new(f)));
    }
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Thread name prefix
    pub name: String,
    /// Upper bound on how long the consumer waits before an idle tick
    pub poll_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            name: "transport".to_string(),
            poll_interval: Duration::from_millis(10),
        }
    }
}

pub struct Transport<S: Service> {
    config: TransportConfig,
    shared: Arc<Shared<S>>,
    outbox: Outbox,
    main_thread: Mutex<Option<JoinHandle<S>>>,
    send_thread: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Service> Transport<S> {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                inbound: Mutex::new(Inbound {
                    queue: VecDeque::new(),
                    connections: HashMap::new(),
                }),
                inbound_ready: Condvar::new(),
                running: AtomicBool::new(false),
            }),
            outbox: Outbox::new(),
            main_thread: Mutex::new(None),
            send_thread: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Handle used by the coordinator to send responses and events
    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    pub fn scheduler(&self) -> Scheduler<S> {
        Scheduler {
            shared: self.shared.clone(),
        }
    }

    /// Start the consumer and sender threads. The service moves onto the
    /// consumer thread and is handed back by `stop`.
    pub fn start(&self, service: S) -> std::io::Result<()> {
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        let poll = self.config.poll_interval;
        let name = self.config.name.clone();
        let main = thread::Builder::new()
            .name(format!("{}-main", self.config.name))
            .spawn(move || run_consumer(name, shared, service, poll))?;
        *self.main_thread.lock() = Some(main);

        let shared = self.shared.clone();
        let outbox = self.outbox.clone();
        let send = thread::Builder::new()
            .name(format!("{}-send", self.config.name))
            .spawn(move || run_sender(shared, outbox))?;
        *self.send_thread.lock() = Some(send);

        info!(transport = %self.config.name, "Transport started");
        Ok(())
    }

    /// Stop both threads, close every connection and return the service
    pub fn stop(&self) -> Option<S> {
        self.shared.running.store(false, Ordering::SeqCst);
        {
            let _inbound = self.shared.inbound.lock();
            self.shared.inbound_ready.notify_all();
        }
        self.outbox.wake_all();

        let service = self
            .main_thread
            .lock()
            .take()
            .and_then(|handle| handle.join().ok());
        if let Some(handle) = self.send_thread.lock().take() {
            let _ = handle.join();
        }

        let connections: Vec<_> = self
            .shared
            .inbound
            .lock()
            .connections
            .drain()
            .map(|(_, c)| c)
            .collect();
        for connection in connections {
            connection.close();
        }

        info!(transport = %self.config.name, "Transport stopped");
        service
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Attach a connection. The coordinator sees `on_register` in order with
    /// every other inbound item.
    pub fn register_connection(
        &self,
        client_id: ClientId,
        connection: Arc<dyn Connection>,
    ) -> Result<(), TransportError> {
        let mut inbound = self.shared.inbound.lock();
        if inbound.connections.contains_key(&client_id) {
            return Err(TransportError::AlreadyRegistered(client_id));
        }
        inbound.connections.insert(client_id, connection);
        inbound.queue.push_back(Item::Register(client_id));
        self.shared.inbound_ready.notify_one();
        debug!(transport = %self.config.name, client_id = %client_id, "Connection registered");
        Ok(())
    }

    /// Detach a connection; unknown clients are ignored
    pub fn unregister_connection(&self, client_id: ClientId) {
        let mut inbound = self.shared.inbound.lock();
        if inbound.connections.remove(&client_id).is_some() {
            inbound.queue.push_back(Item::Unregister(client_id));
            self.shared.inbound_ready.notify_one();
            debug!(transport = %self.config.name, client_id = %client_id, "Connection unregistered");
        }
    }

    pub fn is_registered(&self, client_id: ClientId) -> bool {
        self.shared.inbound.lock().connections.contains_key(&client_id)
    }

    pub fn connection_count(&self) -> usize {
        self.shared.inbound.lock().connections.len()
    }

    pub fn on_incoming_request(&self, request: Request) {
        self.shared.push(Item::Request(request));
    }

    pub fn on_incoming_message(&self, client_id: ClientId, event: ClientEvent) {
        self.shared.push(Item::Message(client_id, event));
    }

    /// Dispatch everything currently queued on the calling thread. Returns the
    /// number of items processed. Only meaningful while the threads are not
    /// running.
    pub fn pump(&self, service: &mut S) -> usize {
        let mut processed = 0;
        loop {
            let item = self.shared.inbound.lock().queue.pop_front();
            let Some(item) = item else { break };
            dispatch(&self.config.name, service, item);
            guarded(&self.config.name, || service.on_tick());
            processed += 1;
        }
        processed
    }

    /// Deliver everything in the outbound queue on the calling thread
    pub fn flush(&self) -> usize {
        let items = self.outbox.take_all();
        let count = items.len();
        for item in items {
            deliver(&self.shared, item);
        }
        count
    }
}

impl<S: Service> Drop for Transport<S> {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}

fn run_consumer<S: Service>(
    name: String,
    shared: Arc<Shared<S>>,
    mut service: S,
    poll: Duration,
) -> S {
    while shared.running.load(Ordering::SeqCst) {
        let item = {
            let mut inbound = shared.inbound.lock();
            if inbound.queue.is_empty() {
                shared.inbound_ready.wait_for(&mut inbound, poll);
            }
            inbound.queue.pop_front()
        };

        if !shared.running.load(Ordering::SeqCst) {
            break;
        }

        if let Some(item) = item {
            dispatch(&name, &mut service, item);
        }
        guarded(&name, || service.on_tick());
    }
    debug!(transport = %name, "Consumer thread exiting");
    service
}

fn run_sender<S>(shared: Arc<Shared<S>>, outbox: Outbox) {
    while shared.running.load(Ordering::SeqCst) {
        match outbox.wait_next(Duration::from_millis(100)) {
            Some(item) => deliver(&shared, item),
            None => continue,
        }
    }
}

fn deliver<S>(shared: &Shared<S>, item: Outgoing) {
    let (targets, frame) = {
        let inbound = shared.inbound.lock();
        match item {
            Outgoing::Direct { client_id, frame } => (
                inbound
                    .connections
                    .get(&client_id)
                    .map(|c| vec![(client_id, c.clone())])
                    .unwrap_or_default(),
                frame,
            ),
            Outgoing::Broadcast { targets, frame } => {
                let resolved: Vec<(ClientId, Arc<dyn Connection>)> = match targets {
                    Targets::Clients(ids) => ids
                        .into_iter()
                        .filter_map(|id| inbound.connections.get(&id).map(|c| (id, c.clone())))
                        .collect(),
                    Targets::AllExcept(except) => inbound
                        .connections
                        .iter()
                        .filter(|(id, _)| Some(**id) != except)
                        .map(|(id, c)| (*id, c.clone()))
                        .collect(),
                };
                (resolved, frame)
            }
        }
    };

    for (client_id, connection) in targets {
        if let Err(e) = connection.send(frame.clone()) {
            warn!(client_id = %client_id, error = %e, "Failed to send frame");
        }
    }
}

fn dispatch<S: Service>(name: &str, service: &mut S, item: Item<S>) {
    guarded(name, move || match item {
        Item::Register(client_id) => service.on_register(client_id),
        Item::Unregister(client_id) => service.on_unregister(client_id),
        Item::Request(request) => service.on_request(request),
        Item::Message(client_id, event) => service.on_message(client_id, event),
        Item::Callback(callback) => callback(service),
    });
}

/// Run coordinator code so that one bad message cannot take the process
/// down. Debug builds re-raise to surface the bug.
fn guarded<F: FnOnce()>(name: &str, f: F) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(f)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!(transport = %name, error = %message, "Unhandled panic during dispatch");
        if cfg!(debug_assertions) {
            panic::resume_unwind(panic);
        }
    }
}

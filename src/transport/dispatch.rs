//! Procedure-code dispatch table shared by the coordinators

use std::collections::HashMap;

use tracing::debug;

use super::{Outbox, ReplyTo, Request};
use crate::error::{Error, RpcResult};
use crate::ws::protocol::{ClientId, Proc, RemoteResult};
use crate::ws::value::{Args, Value};

/// What a handler produced
#[derive(Debug)]
pub enum Reply {
    /// Respond immediately
    Values(Vec<Value>),
    /// The handler kept the `ReplyTo` and will respond later
    Deferred,
}

impl Reply {
    pub fn empty() -> Self {
        Reply::Values(Vec::new())
    }
}

impl From<Vec<Value>> for Reply {
    fn from(values: Vec<Value>) -> Self {
        Reply::Values(values)
    }
}

/// One inbound call as seen by a handler
pub struct Call<'a> {
    pub client_id: ClientId,
    pub args: Args<'a>,
    pub reply_to: ReplyTo,
}

pub type Handler<S> = fn(&mut S, &Call<'_>) -> RpcResult<Reply>;

pub struct DispatchTable<S> {
    handlers: HashMap<Proc, Handler<S>>,
}

impl<S> Default for DispatchTable<S> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<S> DispatchTable<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, proc: Proc, handler: Handler<S>) -> Self {
        self.handlers.insert(proc, handler);
        self
    }

    pub fn handles(&self, proc: Proc) -> bool {
        self.handlers.contains_key(&proc)
    }

    /// Run the handler for `request` and answer it unless deferred.
    /// Unknown procedures are rejected with `NotAllowed`.
    pub fn serve(&self, service: &mut S, request: &Request, outbox: &Outbox) {
        let reply_to = request.reply_to();
        let call = Call {
            client_id: request.client_id,
            args: Args::new(&request.call.args),
            reply_to,
        };

        let result = match self.handlers.get(&request.call.proc) {
            Some(handler) => handler(service, &call),
            None => Err(Error::NotAllowed("procedure is not served here")),
        };

        match result {
            Ok(Reply::Values(values)) => outbox.respond(reply_to, RemoteResult::ok(values)),
            Ok(Reply::Deferred) => {}
            Err(e) => {
                debug!(
                    client_id = %request.client_id,
                    proc = ?request.call.proc,
                    status = ?e.status(),
                    error = %e,
                    "Request rejected"
                );
                outbox.respond(reply_to, RemoteResult::error(&e));
            }
        }
    }
}

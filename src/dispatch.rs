//! Adapters that route a received message to a handler on a target object. Deserializing the
//!  message's parameters is up to the handler, which typically reads them through
//!  [Message::reader].

use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use anyhow::anyhow;
use tracing::debug;

use crate::message::Message;
use crate::message_header::MsgId;

pub fn dispatch<T>(_msg: &Message, obj: &mut T, f: impl FnOnce(&mut T)) -> bool {
    f(obj);
    true
}

pub fn dispatch_const<T>(_msg: &Message, obj: &T, f: impl FnOnce(&T)) -> bool {
    f(obj);
    true
}

pub fn dispatch_with_message<T>(msg: &Message, obj: &mut T, f: impl FnOnce(&mut T, &Message)) -> bool {
    f(obj, msg);
    true
}

pub fn dispatch_with_message_const<T>(msg: &Message, obj: &T, f: impl FnOnce(&T, &Message)) -> bool {
    f(obj, msg);
    true
}


#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DispatchResult {
    Handled,
    /// there is no handler for the message's type
    NotKnown,
}

type Handler<T> = Box<dyn Fn(&mut T, &Message) + Send + Sync>;

/// Handlers for the message types an actor understands, keyed by message type
pub struct DispatchTable<T> {
    handlers: FxHashMap<MsgId, Handler<T>>,
}

impl<T> Default for DispatchTable<T> {
    fn default() -> Self {
        DispatchTable {
            handlers: Default::default(),
        }
    }
}

impl<T> DispatchTable<T> {
    pub fn register(&mut self, msg_type: MsgId, handler: impl Fn(&mut T, &Message) + Send + Sync + 'static) -> anyhow::Result<()> {
        match self.handlers.entry(msg_type) {
            Entry::Occupied(_) => {
                Err(anyhow!("registering a second handler for message type {:#x}", msg_type))
            }
            Entry::Vacant(e) => {
                e.insert(Box::new(handler));
                Ok(())
            }
        }
    }

    pub fn deregister(&mut self, msg_type: MsgId) -> anyhow::Result<()> {
        if self.handlers.remove(&msg_type).is_none() {
            return Err(anyhow!("deregistering a handler that was not previously registered: {:#x}", msg_type));
        }
        Ok(())
    }

    pub fn dispatch(&self, msg: &Message, obj: &mut T) -> DispatchResult {
        match self.handlers.get(&msg.msg_type()) {
            Some(handler) => {
                dispatch_with_message(msg, obj, |obj, msg| handler(obj, msg));
                DispatchResult::Handled
            }
            None => {
                debug!("no handler for message type {:#x} - ignoring", msg.msg_type());
                DispatchResult::NotKnown
            }
        }
    }
}

//! Sequencing of synchronous calls between the two ends of a channel.
//!
//! While one side waits for the reply to a synchronous call, messages keep arriving. Some of them
//!  must be dispatched right away (nested calls that the reply depends on), others must wait until
//!  the call completed. The decision is based on the messages' nested levels, and on which side
//!  of the channel we are when both sides send a call of the same level at the same time.

use std::collections::VecDeque;
use anyhow::bail;
use tracing::{debug, trace};

use crate::header_flags::NestedLevel;
use crate::message::Message;

/// Races between calls of the same nested level are resolved in favor of the parent
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Side {
    Parent,
    Child,
}

#[derive(Debug)]
pub enum IncomingAction {
    /// hand the message to its actor
    Dispatch(Message),
    /// the reply to our pending call
    Reply(Message),
    /// the peer could not dispatch our pending call
    ReplyError(Message),
    /// the message was queued until the pending call completes, see [SyncCallTracker::take_deferred]
    Deferred,
}

#[derive(Debug, Clone, Copy)]
struct Transaction {
    txid: i32,
    level: NestedLevel,
    /// true for our own calls that wait for a reply, false for the peer's calls we are handling
    outgoing: bool,
}

pub struct SyncCallTracker {
    side: Side,
    last_seqno: i32,
    transactions: Vec<Transaction>,
    deferred: VecDeque<Message>,
}

impl SyncCallTracker {
    pub fn new(side: Side) -> SyncCallTracker {
        SyncCallTracker {
            side,
            last_seqno: 0,
            transactions: Vec::new(),
            deferred: VecDeque::new(),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn is_awaiting_reply(&self) -> bool {
        self.awaited_call().is_some()
    }

    /// The innermost transaction, whether it is our call or one of the peer's calls we are
    ///  currently handling
    pub fn current_transaction(&self) -> Option<i32> {
        self.transactions.last().map(|t| t.txid)
    }

    /// the innermost transaction if it is nested inside a sync call, the only kind of
    ///  transaction that a racing call of the same level can join
    fn current_nested_inside_sync_transaction(&self) -> Option<i32> {
        self.transactions.last()
            .filter(|t| t.level == NestedLevel::NestedInsideSync)
            .map(|t| t.txid)
    }

    fn awaited_call(&self) -> Option<&Transaction> {
        self.transactions.iter().rev().find(|t| t.outgoing)
    }

    /// Assigns sequence number and transaction id to an outgoing message. Replies keep the numbers
    ///  of the call they answer, and sync replies complete the peer's transaction.
    pub fn prepare_send(&mut self, msg: &mut Message) -> anyhow::Result<()> {
        if msg.is_reply() && !msg.is_sync() {
            return Ok(());
        }
        if msg.is_reply() {
            return match self.transactions.last() {
                Some(t) if !t.outgoing && t.txid == msg.transaction_id() => {
                    self.transactions.pop();
                    Ok(())
                }
                _ => bail!("reply for transaction {} does not answer the call that is being handled", msg.transaction_id()),
            };
        }

        // parent seqnos are positive, child seqnos negative
        self.last_seqno = match self.side {
            Side::Parent => self.last_seqno.wrapping_add(1),
            Side::Child => self.last_seqno.wrapping_sub(1),
        };
        msg.set_seqno(self.last_seqno);

        if msg.is_sync() {
            if let Some(current) = self.transactions.last() {
                if msg.nested_level() < current.level {
                    bail!("cannot send a sync message with level {:?} inside a transaction of level {:?}", msg.nested_level(), current.level);
                }
            }

            let txid = self.current_transaction().unwrap_or(self.last_seqno);
            msg.set_transaction_id(txid);
            self.transactions.push(Transaction {
                txid,
                level: msg.nested_level(),
                outgoing: true,
            });
            trace!("sending sync call with seqno {} in transaction {}", msg.seqno(), txid);
        }
        Ok(())
    }

    /// Replies to async calls are not part of a transaction, they are deferred or dispatched like
    ///  any other async message.
    pub fn on_incoming(&mut self, msg: Message) -> anyhow::Result<IncomingAction> {
        if msg.is_reply() && msg.is_sync() {
            return match self.transactions.last() {
                Some(t) if t.outgoing && t.txid == msg.transaction_id() => {
                    self.transactions.pop();
                    if msg.is_reply_error() {
                        debug!("peer failed to dispatch the call in transaction {}", msg.transaction_id());
                        Ok(IncomingAction::ReplyError(msg))
                    }
                    else {
                        Ok(IncomingAction::Reply(msg))
                    }
                }
                Some(t) if t.outgoing => bail!("received reply for transaction {} while awaiting transaction {}", msg.transaction_id(), t.txid),
                _ => bail!("received reply for transaction {} without a pending call", msg.transaction_id()),
            };
        }

        if let Some(awaited) = self.awaited_call() {
            if self.should_defer(&msg, awaited.level) {
                debug!("deferring message {:?} while awaiting a reply in transaction {}", msg, awaited.txid);
                self.deferred.push_back(msg);
                return Ok(IncomingAction::Deferred);
            }
        }

        if msg.is_sync() {
            self.transactions.push(Transaction {
                txid: msg.transaction_id(),
                level: msg.nested_level(),
                outgoing: false,
            });
        }
        Ok(IncomingAction::Dispatch(msg))
    }

    fn should_defer(&self, msg: &Message, awaited_level: NestedLevel) -> bool {
        let level = msg.nested_level();

        if level == NestedLevel::NestedInsideCpow {
            return false;
        }
        if !msg.is_sync() {
            return true;
        }
        if level != awaited_level {
            return level < awaited_level;
        }

        // both sides sent a call of the same level at the same time
        match self.side {
            Side::Parent => Some(msg.transaction_id()) != self.current_nested_inside_sync_transaction(),
            Side::Child => false,
        }
    }

    /// Drains the messages that were deferred, in arrival order, once no call is pending. They
    ///  should be passed to [SyncCallTracker::on_incoming] again.
    pub fn take_deferred(&mut self) -> Vec<Message> {
        if self.is_awaiting_reply() {
            return Vec::new();
        }
        self.deferred.drain(..).collect()
    }
}

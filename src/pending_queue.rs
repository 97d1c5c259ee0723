use std::collections::VecDeque;
use crate::header_flags::Priority;
use crate::message::Message;

const NUM_PRIORITIES: usize = Priority::Control as usize + 1;

/// Received messages waiting to be dispatched locally. A message's priority only influences the
///  order in this queue, it is never visible to the peer.
#[derive(Default)]
pub struct PendingQueue {
    queues: [VecDeque<Message>; NUM_PRIORITIES],
}

impl PendingQueue {
    pub fn push(&mut self, msg: Message) {
        let idx = msg.priority() as usize;
        self.queues[idx].push_back(msg);
    }

    /// the oldest message of the highest priority
    pub fn pop(&mut self) -> Option<Message> {
        self.queues.iter_mut()
            .rev()
            .find_map(|q| q.pop_front())
    }

    pub fn len(&self) -> usize {
        self.queues.iter()
            .map(|q| q.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(|q| q.is_empty())
    }
}

//! Per-device outbound message queue.
//!
//! Requests travel to the provider in strict FIFO order across every client
//! of the device. The provider drains the queue with two-phase reads: a
//! header read marks the front message as peeked, and the matching payload
//! read (or the header read alone, for payload-less messages) is what
//! actually dequeues it. The queue itself is always manipulated under the
//! device mutex; waking the provider is the caller's job.

use std::collections::VecDeque;

use userdev_proto::Msg;

/// One queued provider-bound message.
pub(crate) struct QueuedMsg {
    pub msg: Msg,
    /// Set once the header half has been read.
    pub peeked: bool,
}

#[derive(Default)]
pub(crate) struct MsgQueue {
    q: VecDeque<QueuedMsg>,
}

impl MsgQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message for the provider.
    pub fn push(&mut self, msg: Msg) {
        self.q.push_back(QueuedMsg { msg, peeked: false });
    }

    /// The message the next provider read will see, if any.
    pub fn front_mut(&mut self) -> Option<&mut QueuedMsg> {
        self.q.front_mut()
    }

    /// Drop the front message once its final read phase completed.
    pub fn pop(&mut self) -> Option<QueuedMsg> {
        self.q.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    pub fn clear(&mut self) {
        self.q.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use userdev_proto::Subcommand;

    #[test]
    fn fifo_order_is_preserved() {
        let mut q = MsgQueue::new();
        for subcmd in [Subcommand::Open, Subcommand::Read, Subcommand::Close] {
            q.push(Msg::call(subcmd));
        }
        assert_eq!(q.pop().unwrap().msg.subcmd, Subcommand::Open);
        assert_eq!(q.pop().unwrap().msg.subcmd, Subcommand::Read);
        assert_eq!(q.pop().unwrap().msg.subcmd, Subcommand::Close);
        assert!(q.is_empty());
    }

    #[test]
    fn peek_flag_survives_until_pop() {
        let mut q = MsgQueue::new();
        q.push(Msg::call(Subcommand::Write));
        q.front_mut().unwrap().peeked = true;
        assert!(q.front_mut().unwrap().peeked);
        q.pop().unwrap();
        assert!(q.is_empty());
    }
}

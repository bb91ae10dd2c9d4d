//! Pending-reply table for correlated request/response over one channel.

use dashmap::DashMap;
use tokio::sync::oneshot;

use overlay_wire::Message;

/// Outstanding requests awaiting a correlated reply, keyed by the sequence
/// number stamped on the request.
#[derive(Debug, Default)]
pub(crate) struct ReplyWaiters {
    slots: DashMap<u32, oneshot::Sender<Message>>,
}

impl ReplyWaiters {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Open a slot for a request about to be transmitted.
    ///
    /// The slot must exist before the bytes can reach the wire, otherwise a
    /// fast reply could arrive with nobody waiting for it.
    pub(crate) fn register(&self, sequence: u32) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.slots.insert(sequence, tx);
        rx
    }

    /// Hand a reply to the slot matching its reply-for sequence.
    ///
    /// Returns false when no request is waiting on that sequence.
    pub(crate) fn resolve(&self, reply_for: u32, msg: Message) -> bool {
        match self.slots.remove(&reply_for) {
            Some((_, tx)) => {
                let _ = tx.send(msg);
                true
            }
            None => false,
        }
    }

    /// Drop a slot whose request never made it onto the wire
    pub(crate) fn discard(&self, sequence: u32) {
        self.slots.remove(&sequence);
    }

    /// Fail every outstanding slot by dropping its sender
    pub(crate) fn fail_all(&self) {
        self.slots.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}

use std::collections::VecDeque;

use crate::protocol::Envelope;

/// Messages held for a client that is not yet ready for them, in arrival
/// order.
#[derive(Debug, Default)]
pub struct MessageQueue {
    entries: VecDeque<Envelope>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, envelope: Envelope) {
        self.entries.push_back(envelope);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Envelope> {
        self.entries.iter()
    }

    /// The most recently queued entry matching `predicate`.
    pub fn find_latest_mut(
        &mut self,
        mut predicate: impl FnMut(&Envelope) -> bool,
    ) -> Option<&mut Envelope> {
        self.entries.iter_mut().rev().find(|envelope| predicate(envelope))
    }

    /// Removes and returns every entry for which `take` returns true, keeping
    /// the relative order of both the taken and the remaining entries.
    pub fn extract(&mut self, mut take: impl FnMut(&Envelope) -> bool) -> Vec<Envelope> {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for envelope in self.entries.drain(..) {
            if take(&envelope) {
                taken.push(envelope);
            } else {
                kept.push_back(envelope);
            }
        }
        self.entries = kept;
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::payload::Passthrough;
    use crate::protocol::{Message, Payload, PayloadType};

    #[test_timeout::timeout]
    fn extract_preserves_order_on_both_sides() {
        let mut queue = MessageQueue::new();
        for payload in [
            Payload::Trace(Passthrough::default()),
            Payload::SyncComplete(Passthrough::default()),
            Payload::Trace(Passthrough::default()),
            Payload::Heartbeat(Passthrough::default()),
        ] {
            queue.push(Envelope::new(Message::new(payload)));
        }
        let taken = queue.extract(|envelope| envelope.payload_type() != PayloadType::Trace);
        let taken: Vec<_> = taken.iter().map(Envelope::payload_type).collect();
        assert_eq!(taken, vec![PayloadType::SyncComplete, PayloadType::Heartbeat]);
        assert_eq!(queue.len(), 2);
        assert!(queue.iter().all(|envelope| envelope.payload_type() == PayloadType::Trace));
    }
}

//! Per-call inbound sequencing.

use std::collections::BTreeMap;

use pulsar_rpc_wire::Envelope;

/// Outcome of admitting one envelope.
#[derive(Debug)]
pub(crate) enum Admit {
    /// These envelopes are now deliverable, in order.
    Ready(Vec<Envelope>),
    /// Sequence number already consumed or already buffered.
    Duplicate,
    /// Held until the gap before it fills.
    Buffered,
    /// The gap is wider than the window.
    Overflow,
}

/// Releases envelopes of one call and direction in sequence order.
#[derive(Debug)]
pub(crate) struct Reorder {
    next: u64,
    pending: BTreeMap<u64, Envelope>,
    window: usize,
}

impl Reorder {
    pub(crate) fn new(window: usize) -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
            window,
        }
    }

    pub(crate) fn admit(&mut self, envelope: Envelope) -> Admit {
        let seq = envelope.seq;
        if seq < self.next || self.pending.contains_key(&seq) {
            return Admit::Duplicate;
        }
        if seq > self.next {
            if seq - self.next > self.window as u64 || self.pending.len() >= self.window {
                return Admit::Overflow;
            }
            self.pending.insert(seq, envelope);
            return Admit::Buffered;
        }

        let mut ready = vec![envelope];
        self.next += 1;
        while let Some(env) = self.pending.remove(&self.next) {
            ready.push(env);
            self.next += 1;
        }
        Admit::Ready(ready)
    }

    /// Envelopes waiting for a gap to fill.
    pub(crate) fn pending(&self) -> usize {
        self.pending.len()
    }
}

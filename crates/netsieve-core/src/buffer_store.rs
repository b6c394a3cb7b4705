//! Concurrent store of per-flow accumulators.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::accumulator::ByteAccumulator;
use crate::flow::{FlowId, Side};
use crate::parser::{
    carve_all_with, find_message_start, truncated_head, Carved, RawMessage, SkipReason,
    START_PREFIX_LEN,
};

type BufferKey = (FlowId, Side);

/// What one append produced, in input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framed {
    /// A complete message.
    Message(RawMessage),
    /// The head of a message whose body overflowed the buffer. The body is
    /// dropped as it arrives.
    Truncated(RawMessage),
    /// A message overflowed the buffer before its head was complete.
    Lost { dropped: usize },
}

/// How the bytes after an overflow are handled.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Recovery {
    #[default]
    None,
    /// The rest of the overflowed body, of known length.
    Discard(usize),
    /// Framing is unknown; drop bytes up to the next plausible start line.
    Resync,
}

#[derive(Debug, Default)]
struct FlowBuffer {
    acc: ByteAccumulator,
    recovery: Recovery,
}

impl FlowBuffer {
    fn is_idle(&self) -> bool {
        self.acc.is_empty() && self.recovery == Recovery::None
    }

    /// Drops bytes that still belong to an overflowed message.
    fn recover(&mut self, side: Side) {
        match self.recovery {
            Recovery::None => {}
            Recovery::Discard(remaining) => {
                let skipped = self.acc.skip(remaining);
                self.recovery = match remaining - skipped {
                    0 => Recovery::None,
                    left => Recovery::Discard(left),
                };
            }
            Recovery::Resync => match find_message_start(self.acc.unparsed(), side) {
                Some(start) => {
                    self.acc.skip(start);
                    self.recovery = Recovery::None;
                }
                None => {
                    // Keep a short tail in case a start line is split.
                    let keep = self.acc.unparsed_len().min(START_PREFIX_LEN);
                    self.acc.skip(self.acc.unparsed_len() - keep);
                }
            },
        }
        self.acc.compact();
    }
}

/// Accumulators keyed by (flow, side).
///
/// The map is sharded; each entry has its own lock, so unrelated flows never
/// contend beyond the shard lookup. Accumulators are created on the first
/// byte and removed once fully consumed.
pub struct FlowBufferStore {
    buffers: DashMap<BufferKey, Arc<Mutex<FlowBuffer>>>,
    max_buffer_bytes: usize,
}

impl FlowBufferStore {
    /// Creates a store that drops any message holding more than
    /// `max_buffer_bytes` unparsed bytes.
    pub fn new(max_buffer_bytes: usize) -> Self {
        Self {
            buffers: DashMap::new(),
            max_buffer_bytes,
        }
    }

    /// Appends `bytes` for (flow, side) and returns every message that became
    /// complete, in order.
    ///
    /// On the response side, `answers_head(n)` tells whether the `n`-th final
    /// response framed by this call answers a `HEAD` request.
    pub fn on_bytes(
        &self,
        flow: FlowId,
        side: Side,
        bytes: &[u8],
        answers_head: impl Fn(usize) -> bool,
    ) -> Vec<Framed> {
        if bytes.is_empty() {
            return Vec::new();
        }

        let key = (flow, side);
        let buffer = self.buffers.entry(key).or_default().value().clone();

        let (carved, overflow, idle) = {
            let mut buffer = buffer.lock();
            buffer.acc.append(bytes);
            buffer.recover(side);
            let carved = carve_all_with(&mut buffer.acc, side, answers_head);

            let overflow = (buffer.acc.unparsed_len() > self.max_buffer_bytes)
                .then(|| self.overflow(flow, side, &mut buffer));
            (carved, overflow, buffer.is_idle())
        };

        if idle {
            self.buffers.remove_if(&key, |_, buffer| buffer.lock().is_idle());
        }

        let mut framed: Vec<Framed> = carved
            .into_iter()
            .filter_map(|c| match c {
                Carved::Message(message) => Some(Framed::Message(message)),
                Carved::Skipped {
                    bytes,
                    reason: SkipReason::Tunnel,
                } => {
                    tracing::trace!(flow = %flow, len = bytes.len(), "Skipped tunnel preamble");
                    None
                }
                Carved::Skipped { .. } => None,
            })
            .collect();
        framed.extend(overflow.flatten());
        framed
    }

    /// Drops the oversized message at the front of `buffer` and decides how
    /// its remaining bytes are recognised.
    fn overflow(&self, flow: FlowId, side: Side, buffer: &mut FlowBuffer) -> Option<Framed> {
        let buffered = buffer.acc.unparsed_len();
        let truncated = truncated_head(buffer.acc.unparsed(), side);
        buffer.acc.reset();

        buffer.recovery = match truncated.as_ref().and_then(|t| t.framed_len) {
            Some(total) if total > buffered => Recovery::Discard(total - buffered),
            Some(_) => Recovery::None,
            None => Recovery::Resync,
        };

        tracing::warn!(
            flow = %flow,
            side = side.as_str(),
            buffered,
            limit = self.max_buffer_bytes,
            recovery = ?buffer.recovery,
            "Buffer limit exceeded, dropping message"
        );

        match truncated {
            Some(truncated) => truncated.message.map(Framed::Truncated),
            None => Some(Framed::Lost { dropped: buffered }),
        }
    }

    /// Drops both accumulators of a flow.
    pub fn remove_flow(&self, flow: FlowId) {
        self.buffers.remove(&(flow, Side::Request));
        self.buffers.remove(&(flow, Side::Response));
    }

    /// Number of unparsed bytes held for (flow, side).
    pub fn buffered(&self, flow: FlowId, side: Side) -> usize {
        self.buffers
            .get(&(flow, side))
            .map(|entry| entry.value().lock().acc.unparsed_len())
            .unwrap_or(0)
    }

    /// Number of live accumulators.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Returns true if no accumulator is live.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

impl std::fmt::Debug for FlowBufferStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowBufferStore")
            .field("buffers", &self.buffers.len())
            .field("max_buffer_bytes", &self.max_buffer_bytes)
            .finish()
    }
}

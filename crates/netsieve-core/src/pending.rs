//! Requests awaiting their response, per flow.

use std::collections::VecDeque;

use dashmap::DashMap;

use crate::flow::FlowId;
use crate::message::ParsedRequest;

/// Bounded FIFO of in-flight requests for each flow.
///
/// Pipelined requests are correlated with responses in the order they were
/// sent. When a flow exceeds its limit the oldest request is evicted.
pub struct PendingRequestTable {
    pending: DashMap<FlowId, VecDeque<ParsedRequest>>,
    max_per_flow: usize,
}

impl PendingRequestTable {
    /// Creates a table holding at most `max_per_flow` requests per flow.
    pub fn new(max_per_flow: usize) -> Self {
        Self {
            pending: DashMap::new(),
            max_per_flow: max_per_flow.max(1),
        }
    }

    /// Queues a request and returns its position in the flow's queue.
    pub fn push(&self, flow: FlowId, request: ParsedRequest) -> usize {
        let mut queue = self.pending.entry(flow).or_default();
        if queue.len() >= self.max_per_flow {
            if let Some(evicted) = queue.pop_front() {
                tracing::warn!(
                    flow = %flow,
                    url = %evicted.url,
                    limit = self.max_per_flow,
                    "Pending request limit reached, evicting oldest request"
                );
            }
        }
        queue.push_back(request);
        queue.len() - 1
    }

    /// Removes and returns the oldest pending request for `flow`.
    pub fn take_oldest(&self, flow: FlowId) -> Option<ParsedRequest> {
        let request = {
            let mut queue = self.pending.get_mut(&flow)?;
            queue.pop_front()
        };
        self.pending.remove_if(&flow, |_, queue| queue.is_empty());
        request
    }

    /// Returns true if the request `index` places from the front of the
    /// flow's queue is a `HEAD` request.
    pub fn is_head_at(&self, flow: FlowId, index: usize) -> bool {
        self.pending
            .get(&flow)
            .and_then(|queue| queue.get(index).map(|r| r.method.eq_ignore_ascii_case("HEAD")))
            .unwrap_or(false)
    }

    /// Drops every pending request for `flow`, returning how many there were.
    pub fn remove_flow(&self, flow: FlowId) -> usize {
        self.pending
            .remove(&flow)
            .map(|(_, queue)| queue.len())
            .unwrap_or(0)
    }

    /// Number of pending requests for `flow`.
    pub fn pending_for(&self, flow: FlowId) -> usize {
        self.pending.get(&flow).map(|queue| queue.len()).unwrap_or(0)
    }

    /// Total pending requests across all flows.
    pub fn len(&self) -> usize {
        self.pending.iter().map(|entry| entry.value().len()).sum()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl std::fmt::Debug for PendingRequestTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequestTable")
            .field("flows", &self.pending.len())
            .field("max_per_flow", &self.max_per_flow)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Transport;

    fn request(path: &str) -> ParsedRequest {
        ParsedRequest::new(Transport::Plaintext, "GET", format!("http://a.com{path}"))
    }

    #[test]
    fn correlates_in_fifo_order() {
        let table = PendingRequestTable::new(8);
        let flow = FlowId::plain(1);
        table.push(flow, request("/1"));
        table.push(flow, request("/2"));

        assert_eq!(table.take_oldest(flow).unwrap().url, "http://a.com/1");
        assert_eq!(table.take_oldest(flow).unwrap().url, "http://a.com/2");
        assert!(table.take_oldest(flow).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn evicts_oldest_when_full() {
        let table = PendingRequestTable::new(2);
        let flow = FlowId::plain(1);
        table.push(flow, request("/1"));
        table.push(flow, request("/2"));
        assert_eq!(table.push(flow, request("/3")), 1);

        assert_eq!(table.pending_for(flow), 2);
        assert_eq!(table.take_oldest(flow).unwrap().url, "http://a.com/2");
    }

    #[test]
    fn flows_are_separate() {
        let table = PendingRequestTable::new(8);
        table.push(FlowId::plain(1), request("/a"));
        table.push(FlowId::tls(1), request("/b"));
        table.push(FlowId::tls(1), request("/c"));

        assert_eq!(table.len(), 3);
        assert_eq!(table.remove_flow(FlowId::tls(1)), 2);
        assert_eq!(table.len(), 1);
        assert!(table.take_oldest(FlowId::tls(1)).is_none());
    }

    #[test]
    fn head_requests_are_found_by_position() {
        let table = PendingRequestTable::new(8);
        let flow = FlowId::plain(7);
        table.push(flow, request("/a"));
        table.push(
            flow,
            ParsedRequest::new(Transport::Plaintext, "head", "http://a.com/b"),
        );

        assert!(!table.is_head_at(flow, 0));
        assert!(table.is_head_at(flow, 1));
        assert!(!table.is_head_at(flow, 2));
        assert!(!table.is_head_at(FlowId::plain(8), 0));
    }
}

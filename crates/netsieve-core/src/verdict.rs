//! Verdict classification and dispatch.
//!
//! A dispatched record is de-duplicated, has large bodies offloaded to the
//! blob store, and is published twice: once on [`Channel::All`] and once on
//! the channel of its classification. Blocked records produce an abort
//! signal whether or not the notification was suppressed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::flow::{FlowId, Transport};
use crate::message::{CompletedRecord, ParsedRequest, ResponsePart};
use crate::rules::RuleMatch;

const DEFAULT_MIME: &str = "application/octet-stream";

/// Outcome of rule evaluation for one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// A rule matched; the transfer is aborted.
    Blocked,
    /// No rule matched.
    Passed,
}

impl Classification {
    /// Classifies a rule lookup result.
    pub fn from_match(matched: Option<&RuleMatch>) -> Self {
        if matched.is_some() {
            Classification::Blocked
        } else {
            Classification::Passed
        }
    }

    /// Channel carrying records of this classification.
    pub fn channel(&self) -> Channel {
        match self {
            Classification::Blocked => Channel::Blocked,
            Classification::Passed => Channel::Passed,
        }
    }

    /// Returns the classification as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Blocked => "blocked",
            Classification::Passed => "passed",
        }
    }

    /// Parses a classification from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "blocked" => Some(Classification::Blocked),
            "passed" => Some(Classification::Passed),
            _ => None,
        }
    }
}

/// Notification channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Every non-suppressed record.
    All,
    /// Blocked records.
    Blocked,
    /// Passed records.
    Passed,
}

impl Channel {
    /// Returns the channel name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::All => "all",
            Channel::Blocked => "block",
            Channel::Passed => "pass",
        }
    }
}

/// Opaque reference to a body held by a [`BlobStore`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobHandle(pub String);

impl BlobHandle {
    /// Returns the handle as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BlobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A body carried by a verdict event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BodyRef {
    /// Small body carried in the event.
    Inline { bytes: Vec<u8> },
    /// Large body stored out of band.
    Stored {
        handle: BlobHandle,
        mime_type: String,
        size: usize,
    },
}

impl BodyRef {
    /// Size of the body in bytes.
    pub fn len(&self) -> usize {
        match self {
            BodyRef::Inline { bytes } => bytes.len(),
            BodyRef::Stored { size, .. } => *size,
        }
    }

    /// Returns true for an empty inline body.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Stores large bodies and hands back handles.
pub trait BlobStore: Send + Sync {
    /// Stores `bytes` and returns a handle to them.
    fn store(&self, bytes: &[u8], mime_type: &str) -> Result<BlobHandle, StoreError>;
}

/// Receives verdict events. Publishing never fails from the caller's view.
pub trait VerdictSink: Send + Sync {
    /// Publishes one event.
    fn publish(&self, event: VerdictEvent);
}

impl<F> VerdictSink for F
where
    F: Fn(VerdictEvent) + Send + Sync,
{
    fn publish(&self, event: VerdictEvent) {
        self(event)
    }
}

/// A published verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictEvent {
    /// Flow the record came from, for byte-level sources.
    pub flow: Option<FlowId>,
    /// Instrumentation point.
    pub transport: Transport,
    /// Channel this copy was published on.
    pub channel: Channel,
    /// Verdict.
    pub classification: Classification,
    /// Request method.
    pub method: String,
    /// Full request URL.
    pub url: String,
    /// Canonical value the rules were matched against.
    pub canonical: String,
    /// Request header lines.
    pub request_headers: String,
    /// Response header lines, when a response was correlated.
    pub response_headers: Option<String>,
    /// Response status code.
    pub status: Option<u16>,
    /// Response reason phrase.
    pub status_message: Option<String>,
    /// Response content descriptor.
    pub content_descriptor: Option<String>,
    /// Rule that matched, for blocked records.
    pub matched: Option<RuleMatch>,
    /// Request body.
    pub request_body: Option<BodyRef>,
    /// Response body.
    pub response_body: Option<BodyRef>,
    /// Call-site snapshot.
    pub snapshot: Option<String>,
    /// Resolved host for DNS records.
    pub dns_host: Option<String>,
    /// Resolved addresses for DNS records.
    pub dns_addresses: Vec<String>,
    /// When the verdict was reached.
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Disposition
// =============================================================================

/// Tells an adapter to fail the transfer it is servicing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortSignal {
    /// URL of the blocked request.
    pub url: String,
    /// Rule that caused the block.
    pub rule: Option<RuleMatch>,
}

/// What the adapter should do after an ingress call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Disposition {
    /// Let the transfer proceed.
    #[default]
    Continue,
    /// Abort the transfer.
    Abort(AbortSignal),
}

impl Disposition {
    /// Returns true if the transfer must be aborted.
    pub fn is_abort(&self) -> bool {
        matches!(self, Disposition::Abort(_))
    }

    /// Keeps the first abort of two dispositions.
    pub fn or(self, other: Disposition) -> Disposition {
        match self {
            Disposition::Abort(_) => self,
            Disposition::Continue => other,
        }
    }

    /// Maps an abort to a `PermissionDenied` I/O error for adapters that
    /// must fail a read or write call.
    pub fn into_io_result(self) -> std::io::Result<()> {
        match self {
            Disposition::Continue => Ok(()),
            Disposition::Abort(signal) => Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("request blocked: {}", signal.url),
            )),
        }
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Classifies, de-duplicates and publishes records.
pub struct VerdictDispatcher {
    blobs: Arc<dyn BlobStore>,
    sink: Arc<dyn VerdictSink>,
    seen: DashSet<String>,
    dedup_capacity: usize,
    blob_threshold: usize,
}

impl VerdictDispatcher {
    /// Creates a dispatcher.
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        sink: Arc<dyn VerdictSink>,
        dedup_capacity: usize,
        blob_threshold: usize,
    ) -> Self {
        Self {
            blobs,
            sink,
            seen: DashSet::new(),
            dedup_capacity: dedup_capacity.max(1),
            blob_threshold,
        }
    }

    /// Dispatches a request, with its response when one was correlated.
    pub fn dispatch(
        &self,
        request: &ParsedRequest,
        response: Option<&ResponsePart>,
        matched: Option<RuleMatch>,
    ) -> Disposition {
        let classification = Classification::from_match(matched.as_ref());

        if self.first_seen(request) {
            self.publish(request, response, classification, matched.clone());
        } else {
            tracing::trace!(url = %request.url, "Suppressed repeat notification");
        }

        match classification {
            Classification::Blocked => {
                tracing::info!(
                    url = %request.url,
                    transport = request.transport.as_str(),
                    rule = matched.as_ref().map(|m| m.address.as_str()),
                    "Request blocked"
                );
                Disposition::Abort(AbortSignal {
                    url: request.url.clone(),
                    rule: matched,
                })
            }
            Classification::Passed => Disposition::Continue,
        }
    }

    /// Dispatches a request merged with its correlated response.
    pub fn dispatch_completed(&self, record: &CompletedRecord, matched: Option<RuleMatch>) -> Disposition {
        self.dispatch(&record.request, Some(&record.response), matched)
    }

    /// Number of remembered de-duplication keys.
    pub fn seen(&self) -> usize {
        self.seen.len()
    }

    fn first_seen(&self, request: &ParsedRequest) -> bool {
        let Some(key) = request.dedup_key() else {
            return false;
        };
        if self.seen.contains(key) {
            return false;
        }
        if self.seen.len() >= self.dedup_capacity {
            tracing::warn!(
                capacity = self.dedup_capacity,
                "De-duplication set full, clearing"
            );
            self.seen.clear();
        }
        self.seen.insert(key.to_string())
    }

    fn publish(
        &self,
        request: &ParsedRequest,
        response: Option<&ResponsePart>,
        classification: Classification,
        matched: Option<RuleMatch>,
    ) {
        let request_body = request.body.as_deref().and_then(|body| {
            let mime = request.content_type.as_deref().unwrap_or(DEFAULT_MIME);
            self.body_ref(body, mime, &request.url)
        });
        let response_body = response.and_then(|r| {
            let body = r.body.as_deref()?;
            self.body_ref(body, r.mime_type().unwrap_or(DEFAULT_MIME), &request.url)
        });

        let event = VerdictEvent {
            flow: request.flow,
            transport: request.transport,
            channel: Channel::All,
            classification,
            method: request.method.clone(),
            url: request.url.clone(),
            canonical: request.canonical.clone(),
            request_headers: request.headers.clone(),
            response_headers: response.map(|r| r.headers.clone()),
            status: response.map(|r| r.status),
            status_message: response.map(|r| r.status_message.clone()),
            content_descriptor: response.and_then(|r| r.content_descriptor.clone()),
            matched,
            request_body,
            response_body,
            snapshot: request.snapshot.clone(),
            dns_host: request.dns_host.clone(),
            dns_addresses: request.dns_addresses.clone(),
            timestamp: Utc::now(),
        };

        self.sink.publish(VerdictEvent {
            channel: classification.channel(),
            ..event.clone()
        });
        self.sink.publish(event);
    }

    fn body_ref(&self, body: &[u8], mime_type: &str, url: &str) -> Option<BodyRef> {
        if body.len() < self.blob_threshold {
            return Some(BodyRef::Inline {
                bytes: body.to_vec(),
            });
        }
        match self.blobs.store(body, mime_type) {
            Ok(handle) => Some(BodyRef::Stored {
                handle,
                mime_type: mime_type.to_string(),
                size: body.len(),
            }),
            Err(e) => {
                tracing::warn!(url = %url, size = body.len(), error = %e, "Failed to store body");
                None
            }
        }
    }
}

impl std::fmt::Debug for VerdictDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerdictDispatcher")
            .field("seen", &self.seen.len())
            .field("dedup_capacity", &self.dedup_capacity)
            .field("blob_threshold", &self.blob_threshold)
            .finish()
    }
}

// =============================================================================
// In-memory Blob Store
// =============================================================================

/// Blob store backed by a map, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<BlobHandle, (String, Vec<u8>)>,
    next: AtomicUsize,
}

impl MemoryBlobStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a stored body and its MIME type.
    pub fn get(&self, handle: &BlobHandle) -> Option<(String, Vec<u8>)> {
        self.blobs.get(handle).map(|entry| entry.value().clone())
    }

    /// Number of stored bodies.
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn store(&self, bytes: &[u8], mime_type: &str) -> Result<BlobHandle, StoreError> {
        let handle = BlobHandle(format!("mem-{}", self.next.fetch_add(1, Ordering::Relaxed)));
        self.blobs
            .insert(handle.clone(), (mime_type.to_string(), bytes.to_vec()));
        Ok(handle)
    }
}

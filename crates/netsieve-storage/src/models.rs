//! Data models for database entities.

use chrono::{DateTime, Utc};
use netsieve_core::{BodyRef, Channel, Classification, RuleMatch, RuleType, Transport, VerdictEvent};
use serde::{Deserialize, Serialize};

/// A stored block rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique identifier.
    pub id: i64,
    /// Rule type.
    pub rule_type: RuleType,
    /// Normalized rule value.
    pub value: String,
    /// Whether the rule is enabled.
    pub enabled: bool,
    /// Free-form note.
    pub note: Option<String>,
    /// Created timestamp.
    pub created_at: DateTime<Utc>,
}

/// Parameters for creating a new rule.
#[derive(Debug, Clone)]
pub struct NewRule {
    /// Rule type.
    pub rule_type: RuleType,
    /// Rule value; normalized on insert.
    pub value: String,
    /// Free-form note.
    pub note: Option<String>,
}

impl NewRule {
    /// Creates a rule without a note.
    pub fn new(rule_type: RuleType, value: impl Into<String>) -> Self {
        Self {
            rule_type,
            value: value.into(),
            note: None,
        }
    }

    /// Sets the note.
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// A stored body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    /// Hex SHA-256 of the data.
    pub hash: String,
    /// MIME type recorded at first store.
    pub mime_type: String,
    /// Size in bytes.
    pub size: i64,
    /// Body bytes.
    pub data: Vec<u8>,
}

/// A logged verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictRecord {
    /// Unique identifier.
    pub id: i64,
    /// Instrumentation point.
    pub transport: Transport,
    /// Verdict.
    pub classification: Classification,
    /// Request method.
    pub method: String,
    /// Request URL.
    pub url: String,
    /// Canonical value matched.
    pub canonical: String,
    /// Response status, if a response was seen.
    pub status: Option<u16>,
    /// Rule that matched.
    pub rule: Option<RuleMatch>,
    /// DNS host for DNS verdicts.
    pub dns_host: Option<String>,
    /// Handle of the stored request body.
    pub request_blob: Option<String>,
    /// Handle of the stored response body.
    pub response_blob: Option<String>,
    /// When the verdict was reached.
    pub created_at: DateTime<Utc>,
}

/// Parameters for logging a verdict.
#[derive(Debug, Clone)]
pub struct NewVerdict {
    /// Instrumentation point.
    pub transport: Transport,
    /// Verdict.
    pub classification: Classification,
    /// Request method.
    pub method: String,
    /// Request URL.
    pub url: String,
    /// Canonical value matched.
    pub canonical: String,
    /// Response status.
    pub status: Option<u16>,
    /// Rule that matched.
    pub rule: Option<RuleMatch>,
    /// DNS host.
    pub dns_host: Option<String>,
    /// Handle of the stored request body.
    pub request_blob: Option<String>,
    /// Handle of the stored response body.
    pub response_blob: Option<String>,
    /// When the verdict was reached.
    pub created_at: DateTime<Utc>,
}

impl NewVerdict {
    /// Builds a log entry from a published event.
    ///
    /// Returns `None` for copies published on the per-classification
    /// channels, so each verdict is logged once.
    pub fn from_event(event: &VerdictEvent) -> Option<Self> {
        if event.channel != Channel::All {
            return None;
        }
        Some(Self {
            transport: event.transport,
            classification: event.classification,
            method: event.method.clone(),
            url: event.url.clone(),
            canonical: event.canonical.clone(),
            status: event.status,
            rule: event.matched.clone(),
            dns_host: event.dns_host.clone(),
            request_blob: stored_handle(event.request_body.as_ref()),
            response_blob: stored_handle(event.response_body.as_ref()),
            created_at: event.timestamp,
        })
    }
}

fn stored_handle(body: Option<&BodyRef>) -> Option<String> {
    match body? {
        BodyRef::Stored { handle, .. } => Some(handle.to_string()),
        BodyRef::Inline { .. } => None,
    }
}

/// Verdict counts by classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictCounts {
    /// Blocked verdicts.
    pub blocked: i64,
    /// Passed verdicts.
    pub passed: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsieve_core::BlobHandle;

    fn event(channel: Channel) -> VerdictEvent {
        VerdictEvent {
            flow: None,
            transport: Transport::Tls,
            channel,
            classification: Classification::Passed,
            method: "GET".into(),
            url: "https://a.test/x".into(),
            canonical: "https://a.test/x".into(),
            request_headers: String::new(),
            response_headers: None,
            status: Some(200),
            status_message: Some("OK".into()),
            content_descriptor: None,
            matched: None,
            request_body: Some(BodyRef::Inline { bytes: vec![1] }),
            response_body: Some(BodyRef::Stored {
                handle: BlobHandle("abc".into()),
                mime_type: "text/html".into(),
                size: 10,
            }),
            snapshot: None,
            dns_host: None,
            dns_addresses: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn only_all_channel_events_are_logged() {
        assert!(NewVerdict::from_event(&event(Channel::Passed)).is_none());

        let verdict = NewVerdict::from_event(&event(Channel::All)).unwrap();
        assert_eq!(verdict.status, Some(200));
        assert_eq!(verdict.request_blob, None);
        assert_eq!(verdict.response_blob.as_deref(), Some("abc"));
    }
}

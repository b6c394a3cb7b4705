//! Capture file format.
//!
//! A capture is a JSON-lines file. Each line is one observation:
//!
//! ```text
//! {"flow":7,"secure":true,"side":"request","data_b64":"R0VUIC8gSFRUUC8xLjENCg=="}
//! {"dns_host":"example.com","addresses":["93.184.216.34"]}
//! {"closed":7,"secure":true}
//! ```
//!
//! Blank lines and lines starting with `#` are ignored.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use netsieve_core::{FlowId, Side};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors reading a capture.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Reading the capture failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A line is not a valid capture record.
    #[error("line {line}: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// A byte record carries a payload that is not base64.
    #[error("line {line}: invalid base64 payload: {source}")]
    Base64 {
        line: usize,
        #[source]
        source: base64::DecodeError,
    },
}

/// One line of a capture, as written on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CaptureRecord {
    /// Bytes observed on one direction of a flow.
    Bytes {
        flow: u64,
        #[serde(default)]
        secure: bool,
        side: Side,
        data_b64: String,
    },
    /// A completed DNS resolution.
    Dns {
        dns_host: String,
        addresses: Vec<String>,
    },
    /// A flow was closed.
    Closed {
        closed: u64,
        #[serde(default)]
        secure: bool,
    },
}

impl CaptureRecord {
    /// Builds a bytes record, encoding the payload.
    pub fn bytes(flow: FlowId, side: Side, data: &[u8]) -> Self {
        Self::Bytes {
            flow: flow.id,
            secure: flow.secure,
            side,
            data_b64: STANDARD.encode(data),
        }
    }

    fn decode(self, line: usize) -> Result<CaptureEvent, CaptureError> {
        Ok(match self {
            Self::Bytes {
                flow,
                secure,
                side,
                data_b64,
            } => CaptureEvent::Bytes {
                flow: FlowId::new(flow, secure),
                side,
                data: STANDARD
                    .decode(data_b64.trim())
                    .map_err(|source| CaptureError::Base64 { line, source })?,
            },
            Self::Dns {
                dns_host,
                addresses,
            } => CaptureEvent::Dns {
                host: dns_host,
                addresses,
            },
            Self::Closed { closed, secure } => CaptureEvent::Closed(FlowId::new(closed, secure)),
        })
    }
}

/// A decoded capture line, ready to feed to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// Bytes observed in one direction of a flow.
    Bytes {
        flow: FlowId,
        side: Side,
        data: Vec<u8>,
    },
    /// A completed DNS resolution.
    Dns {
        host: String,
        addresses: Vec<String>,
    },
    /// The flow was closed.
    Closed(FlowId),
}

/// Reads and decodes every line of a capture.
pub fn read_capture<R: BufRead>(reader: R) -> Result<Vec<CaptureEvent>, CaptureError> {
    let mut events = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line_no = index + 1;
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let record: CaptureRecord = serde_json::from_str(trimmed).map_err(|source| {
            CaptureError::Json {
                line: line_no,
                source,
            }
        })?;
        events.push(record.decode(line_no)?);
    }

    tracing::debug!(events = events.len(), "Read capture");
    Ok(events)
}

/// Opens and reads a capture file.
pub fn read_capture_file(path: impl AsRef<Path>) -> Result<Vec<CaptureEvent>, CaptureError> {
    let file = File::open(path)?;
    read_capture(BufReader::new(file))
}

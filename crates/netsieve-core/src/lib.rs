//! Netsieve Core - traffic reconstruction and block-decision engine.
//!
//! Adapters inside a host process report what they observe: raw socket
//! bytes, decrypted TLS bytes, completed calls from HTTP client libraries,
//! web-engine resource requests and DNS resolutions. The engine rebuilds
//! complete HTTP/1.x messages from fragmented bytes, correlates requests with
//! responses, checks each record against a rule store and tells the adapter
//! whether to let the transfer continue.
//!
//! ## Features
//!
//! - Per-flow, per-direction accumulation with pipelining support
//! - `Content-Length` and chunked body framing, `CONNECT` tunnel skip
//! - FIFO request/response correlation per flow
//! - URL → Domain → Keyword rule matching behind an expiring LRU cache
//! - De-duplicated verdict notifications with large-body offload
//! - Abort signal for blocked transfers
//!
//! ## Architecture
//!
//! ```text
//! on_bytes(flow, side, bytes)
//!        │
//!        ▼
//! FlowBufferStore ── MessageParser ──► carved messages
//!                                          │
//!                   ┌──────────────────────┴──────────────────┐
//!                   │ Request                                 │ Response
//!                   ▼                                         ▼
//!            RuleMatcher ── match ──► block            PendingRequestTable
//!                   │                                         │
//!                   ▼ no match                                ▼
//!            PendingRequestTable                        RuleMatcher
//!                                                             │
//!                                                             ▼
//!                                                    VerdictDispatcher ──► VerdictSink
//! ```
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use netsieve_core::{
//!     EngineConfig, FlowId, InterceptEngine, MemoryBlobStore, MemoryRuleStore, RuleType, Side,
//!     VerdictEvent,
//! };
//!
//! let rules = Arc::new(MemoryRuleStore::new().with_rule(RuleType::Domain, "ads.test"));
//! let engine = InterceptEngine::new(
//!     EngineConfig::default(),
//!     rules,
//!     Arc::new(MemoryBlobStore::new()),
//!     Arc::new(|event: VerdictEvent| println!("{} {}", event.channel.as_str(), event.url)),
//! )
//! .unwrap();
//!
//! let disposition = engine.on_bytes(
//!     FlowId::tls(1),
//!     Side::Request,
//!     b"GET /banner.js HTTP/1.1\r\nHost: cdn.ads.test\r\n\r\n",
//! );
//! assert!(disposition.is_abort());
//! ```

pub mod accumulator;
pub mod buffer_store;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod flow;
pub mod message;
pub mod parser;
pub mod pending;
pub mod rules;
pub mod verdict;

pub use accumulator::ByteAccumulator;
pub use buffer_store::{FlowBufferStore, Framed};
pub use config::EngineConfig;
pub use engine::{CompletedCall, InterceptEngine};
pub use error::{EngineError, Result, StoreError};
pub use flow::{FlowId, Side, Transport};
pub use message::{canonical_url, host_of, CompletedRecord, ParsedRequest, ResponsePart};
pub use parser::{Carve, Carved, RawMessage};
pub use pending::PendingRequestTable;
pub use rules::{MemoryRuleStore, RuleKey, RuleMatch, RuleMatcher, RuleStore, RuleType};
pub use verdict::{
    AbortSignal, BlobHandle, BlobStore, BodyRef, Channel, Classification, Disposition,
    MemoryBlobStore, VerdictDispatcher, VerdictEvent, VerdictSink,
};

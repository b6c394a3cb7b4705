//! Flow identity and traffic direction.

use serde::{Deserialize, Serialize};

/// Identity of one observed connection or engine object.
///
/// The numeric id is whatever the adapter uses to tell connections apart
/// (an identity hash, a handle). The `secure` flag is part of the identity:
/// a plaintext socket and a TLS engine that report the same number are
/// different flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowId {
    /// Adapter-assigned connection identity.
    pub id: u64,
    /// Whether bytes on this flow were observed after TLS decryption.
    pub secure: bool,
}

impl FlowId {
    /// Creates a flow id.
    pub fn new(id: u64, secure: bool) -> Self {
        Self { id, secure }
    }

    /// Creates a plaintext flow id.
    pub fn plain(id: u64) -> Self {
        Self::new(id, false)
    }

    /// Creates a TLS flow id.
    pub fn tls(id: u64) -> Self {
        Self::new(id, true)
    }

    /// URL scheme implied by the flow.
    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }

    /// Transport tag for messages reconstructed from this flow's bytes.
    pub fn transport(&self) -> Transport {
        if self.secure {
            Transport::Tls
        } else {
            Transport::Plaintext
        }
    }
}

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.secure {
            write!(f, "tls:{}", self.id)
        } else {
            write!(f, "tcp:{}", self.id)
        }
    }
}

/// Direction of bytes on a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    /// Bytes written by the host (requests).
    Request,
    /// Bytes read by the host (responses).
    Response,
}

impl Side {
    /// Returns the side as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Request => "request",
            Side::Response => "response",
        }
    }
}

/// Instrumentation point a record was reconstructed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// Raw plaintext socket bytes.
    Plaintext,
    /// Decrypted bytes from a TLS engine.
    Tls,
    /// A high-level HTTP client's completed call.
    Library,
    /// A web-rendering engine's resource request.
    Web,
    /// The platform's HTTP engine.
    PlatformEngine,
    /// A DNS resolution (connection establishment only).
    Dns,
}

impl Transport {
    /// Returns the transport as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Plaintext => "plaintext",
            Transport::Tls => "tls",
            Transport::Library => "library",
            Transport::Web => "web",
            Transport::PlatformEngine => "platform_engine",
            Transport::Dns => "dns",
        }
    }

    /// Human-readable label for display layers.
    pub fn label(&self) -> &'static str {
        match self {
            Transport::Plaintext => "NATIVE-TCP",
            Transport::Tls => "NATIVE-SSL",
            Transport::Library => "HTTP-CLIENT",
            Transport::Web => "WEB",
            Transport::PlatformEngine => "PLATFORM",
            Transport::Dns => "DNS",
        }
    }

    /// Parses a transport from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "plaintext" => Some(Transport::Plaintext),
            "tls" => Some(Transport::Tls),
            "library" => Some(Transport::Library),
            "web" => Some(Transport::Web),
            "platform_engine" => Some(Transport::PlatformEngine),
            "dns" => Some(Transport::Dns),
            _ => None,
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

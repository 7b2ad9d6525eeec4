//! Server URL and virtual path handling.

use flexsync_protocol::ProtocolEnvelope;
use std::fmt;
use ::url::Url;

/// Where a connection goes. Sessions with equal endpoints share a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerEndpoint {
    /// Transport envelope.
    pub envelope: ProtocolEnvelope,
    /// Host name or address.
    pub address: String,
    /// Port.
    pub port: u16,
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.envelope {
            ProtocolEnvelope::Realm => "realm",
            ProtocolEnvelope::Realms => "realms",
            ProtocolEnvelope::Ws => "ws",
            ProtocolEnvelope::Wss => "wss",
        };
        write!(f, "{scheme}://{}:{}", self.address, self.port)
    }
}

/// A server URL split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecomposedUrl {
    /// Endpoint to connect to.
    pub endpoint: ServerEndpoint,
    /// Path component (may be empty).
    pub path: String,
}

/// Parses `realm:`, `realms:`, `ws:` and `wss:` URLs.
///
/// Returns `None` for other schemes, URLs with user info, an empty host, a
/// query or fragment, and port 0.
pub fn decompose_server_url(url: &str) -> Option<DecomposedUrl> {
    let parsed = Url::parse(url).ok()?;
    let envelope = match parsed.scheme() {
        "realm" => ProtocolEnvelope::Realm,
        "realms" => ProtocolEnvelope::Realms,
        "ws" => ProtocolEnvelope::Ws,
        "wss" => ProtocolEnvelope::Wss,
        _ => return None,
    };
    if !parsed.username().is_empty() || parsed.password().is_some() {
        return None;
    }
    if parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }
    let address = parsed.host_str().filter(|h| !h.is_empty())?.to_string();
    // `Url` drops ports equal to the scheme default only for special schemes,
    // so the envelope's default applies whenever none was written.
    let port = match parsed.port() {
        Some(0) => return None,
        Some(port) => port,
        None => envelope.default_port(),
    };
    Some(DecomposedUrl {
        endpoint: ServerEndpoint {
            envelope,
            address,
            port,
        },
        path: parsed.path().to_string(),
    })
}

const RESERVED_SUFFIXES: [&str; 3] = [".realm", ".realm.lock", ".realm.management"];

/// Checks a server-side virtual path.
///
/// The path starts with `/`; every segment is non-empty, made of ASCII
/// alphanumerics, `_`, `-` and `.`, and is neither `.` nor `..`. The path must
/// not end in a suffix reserved for local files.
pub fn validate_virtual_path(path: &str) -> Result<(), String> {
    let rest = path
        .strip_prefix('/')
        .ok_or_else(|| format!("virtual path '{path}' must start with '/'"))?;
    for segment in rest.split('/') {
        if segment.is_empty() {
            return Err(format!("virtual path '{path}' has an empty segment"));
        }
        if segment == "." || segment == ".." {
            return Err(format!("virtual path '{path}' contains '{segment}'"));
        }
        if let Some(c) = segment
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
        {
            return Err(format!("virtual path '{path}' contains invalid character {c:?}"));
        }
    }
    if let Some(suffix) = RESERVED_SUFFIXES.iter().find(|s| path.ends_with(*s)) {
        return Err(format!("virtual path '{path}' ends with reserved suffix '{suffix}'"));
    }
    Ok(())
}

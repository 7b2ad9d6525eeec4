//! Protocol messages exchanged between a sync client and server.
//!
//! Messages are multiplexed over one connection; every session-level message
//! carries the [`SessionIdent`] the client assigned when it sent BIND.

use crate::changeset::Changeset;
use crate::codec::{from_cbor, to_cbor};
use crate::error::ProtocolResult;
use serde::{Deserialize, Serialize};

/// Identifies a session within one connection.
pub type SessionIdent = u64;

/// Identifies a MARK round trip within one session.
pub type RequestIdent = u64;

/// A version in a client or server history.
pub type Version = u64;

/// Version of a subscription set.
pub type QueryVersion = i64;

/// Transport envelope of a sync connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolEnvelope {
    /// Plain sync protocol.
    Realm,
    /// Sync protocol over TLS.
    Realms,
    /// WebSocket.
    Ws,
    /// WebSocket over TLS.
    Wss,
}

impl ProtocolEnvelope {
    /// Returns true if the envelope uses TLS.
    pub fn is_ssl(self) -> bool {
        matches!(self, ProtocolEnvelope::Realms | ProtocolEnvelope::Wss)
    }

    /// Port used when none is given.
    pub fn default_port(self) -> u16 {
        match self {
            ProtocolEnvelope::Realm => 7800,
            ProtocolEnvelope::Realms => 7801,
            ProtocolEnvelope::Ws => 80,
            ProtocolEnvelope::Wss => 443,
        }
    }
}

/// Why a session is being opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SessionReason {
    /// Regular synchronization.
    #[default]
    Sync,
    /// Downloading a fresh copy during client reset.
    ClientReset,
}

/// Client file identifier assigned by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SaltedFileIdent {
    /// The ident (0 = not yet assigned).
    pub ident: u64,
    /// Salt guarding against ident reuse.
    pub salt: i64,
}

/// How far the client has downloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DownloadCursor {
    /// Last server version integrated locally.
    pub server_version: Version,
    /// Last client version the server had integrated at that point.
    pub last_integrated_client_version: Version,
}

/// How far the server has acknowledged client uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UploadCursor {
    /// Last client version scanned for upload and acknowledged.
    pub client_version: Version,
    /// Last server version the client had integrated at that point.
    pub last_integrated_server_version: Version,
}

/// Progress reported by the server in DOWNLOAD messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncProgress {
    /// Download position after this message.
    pub download: DownloadCursor,
    /// Upload acknowledgement.
    pub upload: UploadCursor,
    /// Latest version in the server history.
    pub latest_server_version: Version,
}

/// Position of a DOWNLOAD message inside a bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadBatchState {
    /// More bootstrap messages follow for this query version.
    MoreToCome,
    /// Last bootstrap message for this query version.
    LastInBatch,
    /// Regular steady-state download.
    SteadyState,
}

/// A local changeset sent in UPLOAD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadChangeset {
    /// Local version produced by the changeset.
    pub origin_client_version: Version,
    /// Server version integrated locally when the changeset was made.
    pub last_integrated_server_version: Version,
    /// Origin timestamp.
    pub origin_timestamp: u64,
    /// The instructions.
    pub changeset: Changeset,
}

/// A server changeset received in DOWNLOAD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChangeset {
    /// Server version produced by the changeset.
    pub remote_version: Version,
    /// Last local version the server had integrated before it.
    pub last_integrated_local_version: Version,
    /// Origin timestamp.
    pub origin_timestamp: u64,
    /// File ident of the originating client.
    pub origin_file_ident: u64,
    /// Size of the changeset as produced by its origin.
    pub original_changeset_size: u64,
    /// The instructions.
    pub changeset: Changeset,
}

/// Error codes reported by the server in ERROR messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolErrorCode {
    /// Connection closed (no error).
    ConnectionClosed = 100,
    /// Other connection-level error.
    OtherError = 101,
    /// Unknown type of input message.
    UnknownMessage = 102,
    /// Bad syntax in input message head.
    BadSyntax = 103,
    /// Limits exceeded in input message.
    LimitsExceeded = 104,
    /// Wrong protocol version.
    WrongProtocolVersion = 105,
    /// Bad session identifier in input message.
    BadSessionIdent = 106,
    /// Overlapping reuse of session identifier.
    ReuseOfSessionIdent = 107,
    /// Client file bound in other session.
    BoundInOtherSession = 108,
    /// Bad input message order.
    BadMessageOrder = 109,
    /// Session closed (no error).
    SessionClosed = 200,
    /// Other session-level error.
    OtherSessionError = 201,
    /// Access token expired.
    TokenExpired = 202,
    /// Bad user authentication.
    BadAuthentication = 203,
    /// Illegal path.
    IllegalRealmPath = 204,
    /// No such file on the server.
    NoSuchRealm = 205,
    /// Permission denied.
    PermissionDenied = 206,
    /// Bad client file identifier.
    BadClientFileIdent = 208,
    /// Bad server version in DOWNLOAD progress.
    BadServerVersion = 209,
    /// Bad client version in UPLOAD.
    BadClientVersion = 210,
    /// Diverging histories.
    DivergingHistories = 211,
    /// Bad changeset.
    BadChangeset = 212,
    /// Client file expired.
    ClientFileExpired = 219,
    /// Bad query.
    BadQuery = 223,
    /// Write not allowed by permissions.
    WriteNotAllowed = 227,
}

impl ProtocolErrorCode {
    /// Numeric code.
    pub fn to_code(self) -> u32 {
        self as u32
    }

    /// Returns true for errors that concern one session rather than the connection.
    pub fn is_session_level(self) -> bool {
        self.to_code() >= 200
    }
}

/// What the server asks the client to do about an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServerRequestsAction {
    /// Nothing specific.
    #[default]
    NoAction,
    /// The client violated the protocol.
    ProtocolViolation,
    /// The application is at fault.
    ApplicationBug,
    /// Informational.
    Warning,
    /// Retry after backoff.
    Transient,
    /// Delete the local file.
    DeleteRealm,
    /// Perform a client reset.
    ClientReset,
    /// Refresh the user's access token.
    RefreshUser,
    /// Log the user out.
    LogOutUser,
}

/// BIND: associates a session with a server file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindMessage {
    /// Session ident chosen by the client.
    pub session_ident: SessionIdent,
    /// Virtual path of the server file.
    pub path: String,
    /// Access token.
    pub signed_user_token: String,
    /// Whether the client still needs a file ident.
    pub need_client_file_ident: bool,
    /// Whether flexible sync is requested.
    pub is_flx: bool,
    /// Why the session is opened.
    pub session_reason: SessionReason,
}

/// IDENT (client): identifies the local file and download position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentMessage {
    /// Session ident.
    pub session_ident: SessionIdent,
    /// Local file ident.
    pub client_file_ident: SaltedFileIdent,
    /// Download position.
    pub download: DownloadCursor,
    /// Version of the active subscription set (flexible sync).
    pub latest_query_version: QueryVersion,
    /// Query of the active subscription set, as JSON text.
    pub query_body: String,
}

/// UPLOAD: local changesets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadMessage {
    /// Session ident.
    pub session_ident: SessionIdent,
    /// Local version up to which the history has been scanned.
    pub progress_client_version: Version,
    /// Server version integrated locally.
    pub progress_server_version: Version,
    /// Server version below which the server may compact.
    pub locked_server_version: Version,
    /// Non-empty local changesets in version order.
    pub changesets: Vec<UploadChangeset>,
}

/// DOWNLOAD: server changesets and progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadMessage {
    /// Session ident.
    pub session_ident: SessionIdent,
    /// Progress after integrating this message.
    pub progress: SyncProgress,
    /// Bytes remaining to download.
    pub downloadable_bytes: u64,
    /// Subscription set version the data belongs to.
    pub query_version: QueryVersion,
    /// Bootstrap position.
    pub batch_state: DownloadBatchState,
    /// Changesets to integrate.
    pub changesets: Vec<RemoteChangeset>,
}

/// ERROR: connection-level (`session_ident == 0`) or session-level error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Affected session, or 0 for the whole connection.
    pub session_ident: SessionIdent,
    /// Error code.
    pub error_code: ProtocolErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Whether the client may retry.
    pub try_again: bool,
    /// Requested client action.
    pub action: ServerRequestsAction,
}

impl ErrorMessage {
    /// Creates a session-level error.
    pub fn session(
        session_ident: SessionIdent,
        error_code: ProtocolErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            session_ident,
            error_code,
            message: message.into(),
            try_again: false,
            action: ServerRequestsAction::NoAction,
        }
    }

    /// Creates a connection-level error.
    pub fn connection(error_code: ProtocolErrorCode, message: impl Into<String>, try_again: bool) -> Self {
        Self {
            session_ident: 0,
            error_code,
            message: message.into(),
            try_again,
            action: if try_again {
                ServerRequestsAction::Transient
            } else {
                ServerRequestsAction::NoAction
            },
        }
    }
}

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Bind a session.
    Bind(BindMessage),
    /// Identify the local file.
    Ident(IdentMessage),
    /// Renew the access token.
    Refresh {
        /// Session ident.
        session_ident: SessionIdent,
        /// New access token.
        signed_user_token: String,
    },
    /// Request a round-trip marker.
    Mark {
        /// Session ident.
        session_ident: SessionIdent,
        /// Marker ident.
        request_ident: RequestIdent,
    },
    /// Upload local changesets.
    Upload(UploadMessage),
    /// Announce a new subscription set.
    Query {
        /// Session ident.
        session_ident: SessionIdent,
        /// Subscription set version.
        query_version: QueryVersion,
        /// Query as JSON text.
        query_body: String,
    },
    /// Unbind a session.
    Unbind {
        /// Session ident.
        session_ident: SessionIdent,
    },
}

impl ClientMessage {
    /// The session this message belongs to.
    pub fn session_ident(&self) -> SessionIdent {
        match self {
            ClientMessage::Bind(m) => m.session_ident,
            ClientMessage::Ident(m) => m.session_ident,
            ClientMessage::Upload(m) => m.session_ident,
            ClientMessage::Refresh { session_ident, .. }
            | ClientMessage::Mark { session_ident, .. }
            | ClientMessage::Query { session_ident, .. }
            | ClientMessage::Unbind { session_ident } => *session_ident,
        }
    }

    /// Message name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::Bind(_) => "BIND",
            ClientMessage::Ident(_) => "IDENT",
            ClientMessage::Refresh { .. } => "REFRESH",
            ClientMessage::Mark { .. } => "MARK",
            ClientMessage::Upload(_) => "UPLOAD",
            ClientMessage::Query { .. } => "QUERY",
            ClientMessage::Unbind { .. } => "UNBIND",
        }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Assigns a client file ident.
    Ident {
        /// Session ident.
        session_ident: SessionIdent,
        /// Assigned file ident.
        client_file_ident: SaltedFileIdent,
    },
    /// Server changesets and progress.
    Download(DownloadMessage),
    /// Answers a client MARK.
    Mark {
        /// Session ident.
        session_ident: SessionIdent,
        /// Marker ident echoed back.
        request_ident: RequestIdent,
    },
    /// Confirms UNBIND.
    Unbound {
        /// Session ident.
        session_ident: SessionIdent,
    },
    /// Error report.
    Error(ErrorMessage),
    /// A subscription set was rejected.
    QueryError {
        /// Session ident.
        session_ident: SessionIdent,
        /// Rejected version.
        query_version: QueryVersion,
        /// Reason.
        message: String,
    },
}

impl ServerMessage {
    /// The session this message belongs to (0 for connection-level errors).
    pub fn session_ident(&self) -> SessionIdent {
        match self {
            ServerMessage::Download(m) => m.session_ident,
            ServerMessage::Error(m) => m.session_ident,
            ServerMessage::Ident { session_ident, .. }
            | ServerMessage::Mark { session_ident, .. }
            | ServerMessage::Unbound { session_ident }
            | ServerMessage::QueryError { session_ident, .. } => *session_ident,
        }
    }

    /// Message name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ServerMessage::Ident { .. } => "IDENT",
            ServerMessage::Download(_) => "DOWNLOAD",
            ServerMessage::Mark { .. } => "MARK",
            ServerMessage::Unbound { .. } => "UNBOUND",
            ServerMessage::Error(_) => "ERROR",
            ServerMessage::QueryError { .. } => "QUERY_ERROR",
        }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_ports() {
        assert_eq!(ProtocolEnvelope::Realm.default_port(), 7800);
        assert_eq!(ProtocolEnvelope::Realms.default_port(), 7801);
        assert_eq!(ProtocolEnvelope::Ws.default_port(), 80);
        assert_eq!(ProtocolEnvelope::Wss.default_port(), 443);
        assert!(ProtocolEnvelope::Wss.is_ssl());
        assert!(!ProtocolEnvelope::Ws.is_ssl());
    }

    #[test]
    fn error_levels() {
        assert!(ProtocolErrorCode::TokenExpired.is_session_level());
        assert!(!ProtocolErrorCode::ConnectionClosed.is_session_level());
        assert_eq!(ProtocolErrorCode::TokenExpired.to_code(), 202);
    }

    #[test]
    fn client_message_roundtrip() {
        let msg = ClientMessage::Query {
            session_ident: 3,
            query_version: 2,
            query_body: r#"{"Cat":"(age > 2)"}"#.into(),
        };
        let decoded = ClientMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.session_ident(), 3);
        assert_eq!(decoded.name(), "QUERY");
    }

    #[test]
    fn server_download_roundtrip() {
        let mut changeset = Changeset::new();
        changeset.intern_string("Cat");
        let msg = ServerMessage::Download(DownloadMessage {
            session_ident: 1,
            progress: SyncProgress::default(),
            downloadable_bytes: 10,
            query_version: 1,
            batch_state: DownloadBatchState::LastInBatch,
            changesets: vec![RemoteChangeset {
                remote_version: 5,
                last_integrated_local_version: 0,
                origin_timestamp: 0,
                origin_file_ident: 9,
                original_changeset_size: 0,
                changeset,
            }],
        });
        let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }
}

//! Per-session protocol state machine, owned by the event loop.
//!
//! The engine never touches a connection directly. Operations append the
//! messages to send to an outbox, and the event loop writes them to the
//! connection the session is attached to. Session-level failures come back
//! as a [`Disposition`] so the loop can detach the session from its
//! connection.

use crate::applier::{DatabaseApplier, PendingBootstrap, SyncMetadata};
use crate::config::SessionConfig;
use crate::endpoint::ServerEndpoint;
use crate::error::{SyncError, SyncResult};
use crate::event_loop::ConnectionId;
use crate::functional::UniqueFunction;
use crate::session::{
    ConnectionState, ProgressReport, SessionCallbacks, SessionErrorInfo, SessionShared,
};
use crate::status::{ErrorCode, Status};
use crate::subscriptions::{State, SubscriptionStore};
use flexsync_protocol::{
    BindMessage, ClientMessage, DownloadBatchState, DownloadMessage, IdentMessage, QueryVersion,
    RemoteChangeset, RequestIdent, SaltedFileIdent, ServerMessage, SessionIdent, SyncProgress,
    UploadChangeset, UploadCursor, UploadMessage,
};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

pub(crate) type WaitHandler = UniqueFunction<Status>;

/// Messages produced by one engine operation.
pub(crate) type Outbox = Vec<ClientMessage>;

/// Everything the event loop needs to take over a bound session.
pub(crate) struct BindRequest {
    pub(crate) shared: Arc<SessionShared>,
    pub(crate) applier: DatabaseApplier,
    pub(crate) store: Option<SubscriptionStore>,
    pub(crate) config: SessionConfig,
    pub(crate) endpoint: ServerEndpoint,
    pub(crate) callbacks: SessionCallbacks,
}

/// Where a session stands with respect to its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Needs a connection.
    Waiting,
    /// Attached to a connection that is not yet established.
    Connecting(ConnectionId),
    /// BIND sent, IDENT not yet.
    Bound(ConnectionId),
    /// IDENT sent; uploads and queries flow.
    Enlisted(ConnectionId),
    /// Stopped by a session-level error.
    Suspended,
}

/// Outcome of handling a server message.
#[derive(Debug)]
pub(crate) enum Disposition {
    Continue,
    Suspend(SessionErrorInfo),
}

enum AfterUpload {
    Complete(WaitHandler),
    RequestDownload(WaitHandler),
}

struct UploadWait {
    target: u64,
    then: AfterUpload,
}

struct Bootstrap {
    query_version: QueryVersion,
    changesets: Vec<RemoteChangeset>,
    progress: SyncProgress,
}

pub(crate) struct SessionEngine {
    shared: Arc<SessionShared>,
    applier: DatabaseApplier,
    store: Option<SubscriptionStore>,
    config: SessionConfig,
    endpoint: ServerEndpoint,
    callbacks: SessionCallbacks,

    phase: Phase,
    reported: ConnectionState,
    error_attempts: u32,
    resume_generation: u64,
    retry_pending: bool,

    metadata: SyncMetadata,
    upload_sent_through: u64,
    upload_waits: Vec<UploadWait>,
    download_waits: Vec<(RequestIdent, WaitHandler)>,
    last_mark_requested: RequestIdent,
    last_mark_sent: RequestIdent,
    bootstrap: Option<Bootstrap>,
    bootstrap_marks: Vec<(RequestIdent, QueryVersion)>,
    last_sent_query_version: QueryVersion,
    downloadable_bytes: u64,
    progress_version: u64,
}

impl SessionEngine {
    pub(crate) fn new(request: BindRequest) -> Self {
        let metadata = SyncMetadata::load(request.applier.database());
        // Local changes made before binding are uploaded too.
        request
            .shared
            .raise_watermark(request.applier.database().latest_version());
        info!(
            session_ident = request.shared.id,
            path = %request.config.realm_identifier,
            endpoint = %request.endpoint,
            flx = request.store.is_some(),
            "session bound"
        );
        let mut engine = Self {
            applier: request.applier,
            store: request.store,
            config: request.config,
            endpoint: request.endpoint,
            callbacks: request.callbacks,
            shared: request.shared,
            phase: Phase::Waiting,
            reported: ConnectionState::Disconnected,
            error_attempts: 0,
            resume_generation: 0,
            retry_pending: false,
            upload_sent_through: metadata.upload.client_version,
            metadata,
            upload_waits: Vec::new(),
            download_waits: Vec::new(),
            last_mark_requested: 0,
            last_mark_sent: 0,
            bootstrap: None,
            bootstrap_marks: Vec::new(),
            last_sent_query_version: 0,
            downloadable_bytes: 0,
            progress_version: 0,
        };
        engine.resume_bootstrap();
        engine
    }

    /// Finishes integrating a bootstrap that was received in full before
    /// the database was last closed.
    fn resume_bootstrap(&mut self) {
        let pending = match self.applier.pending_bootstrap() {
            Ok(Some(pending)) => pending,
            Ok(None) => return,
            Err(e) => {
                warn!(session_ident = self.ident(), error = %e, "cannot read pending bootstrap");
                return;
            }
        };
        let query_version = pending.query_version;
        info!(
            session_ident = self.ident(),
            query_version,
            remaining = pending.changesets.len(),
            "resuming bootstrap"
        );
        match self.apply_bootstrap(pending) {
            Ok(()) => self.await_bootstrap_mark(query_version),
            Err(error) => {
                warn!(session_ident = self.ident(), error = %error.status, "failed to resume bootstrap")
            }
        }
    }

    pub(crate) fn ident(&self) -> SessionIdent {
        self.shared.id
    }

    pub(crate) fn endpoint(&self) -> &ServerEndpoint {
        &self.endpoint
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn connection(&self) -> Option<ConnectionId> {
        match self.phase {
            Phase::Connecting(c) | Phase::Bound(c) | Phase::Enlisted(c) => Some(c),
            Phase::Waiting | Phase::Suspended => None,
        }
    }

    pub(crate) fn is_bound_on_server(&self) -> bool {
        matches!(self.phase, Phase::Bound(_) | Phase::Enlisted(_))
    }

    // Connection lifecycle

    pub(crate) fn on_connecting(&mut self, connection: ConnectionId) {
        self.phase = Phase::Connecting(connection);
        self.report(ConnectionState::Connecting, None);
    }

    /// The connection is up: BIND, and IDENT too if the file ident is known.
    pub(crate) fn activate(&mut self, out: &mut Outbox) {
        let Phase::Connecting(connection) = self.phase else {
            return;
        };
        self.phase = Phase::Bound(connection);
        self.report(ConnectionState::Connected, None);

        let file_ident = self.metadata.client_file_ident;
        out.push(ClientMessage::Bind(BindMessage {
            session_ident: self.ident(),
            path: self.config.realm_identifier.clone(),
            signed_user_token: self.config.signed_user_token.clone(),
            need_client_file_ident: file_ident.ident == 0,
            is_flx: self.store.is_some(),
            session_reason: self.config.session_reason,
        }));
        if file_ident.ident != 0 {
            self.send_ident(out);
        }
    }

    pub(crate) fn on_connection_lost(&mut self, error: &SessionErrorInfo) {
        self.reset_connection_state();
        self.phase = Phase::Waiting;
        self.report(ConnectionState::Disconnected, Some(error));
    }

    /// Stops the session after a session-level error. Returns the resume
    /// generation and retry count when the error allows retrying.
    pub(crate) fn suspend(&mut self, error: &SessionErrorInfo) -> Option<(u64, u32)> {
        warn!(
            session_ident = self.ident(),
            error = %error.status,
            try_again = error.try_again,
            "session suspended"
        );
        self.reset_connection_state();
        self.phase = Phase::Suspended;
        self.report(ConnectionState::Disconnected, Some(error));
        self.retry_pending = error.try_again;
        if !error.try_again {
            return None;
        }
        self.error_attempts += 1;
        self.resume_generation += 1;
        Some((self.resume_generation, self.error_attempts))
    }

    /// Leaves the suspended phase. Returns true if the session now needs a
    /// connection.
    pub(crate) fn resume(&mut self) -> bool {
        if self.phase != Phase::Suspended {
            return false;
        }
        debug!(session_ident = self.ident(), "resuming session");
        self.phase = Phase::Waiting;
        self.retry_pending = false;
        true
    }

    /// Like [`resume`](Self::resume), but only after a retryable error and,
    /// given a generation, only if no newer suspension happened since.
    pub(crate) fn resume_retry(&mut self, generation: Option<u64>) -> bool {
        if !self.retry_pending || generation.is_some_and(|g| g != self.resume_generation) {
            return false;
        }
        self.resume()
    }

    fn reset_connection_state(&mut self) {
        self.upload_sent_through = self.metadata.upload.client_version;
        self.last_mark_sent = 0;
        self.last_sent_query_version = 0;
        self.bootstrap = None;
    }

    // Application requests

    pub(crate) fn nonsync_transact(&mut self, out: &mut Outbox) {
        self.send_upload(out);
        self.check_upload_waits(out);
    }

    pub(crate) fn request_upload_completion(&mut self, handler: WaitHandler, out: &mut Outbox) {
        self.upload_waits.push(UploadWait {
            target: self.shared.watermark(),
            then: AfterUpload::Complete(handler),
        });
        self.check_upload_waits(out);
    }

    pub(crate) fn request_sync_completion(&mut self, handler: WaitHandler, out: &mut Outbox) {
        self.upload_waits.push(UploadWait {
            target: self.shared.watermark(),
            then: AfterUpload::RequestDownload(handler),
        });
        self.check_upload_waits(out);
    }

    pub(crate) fn request_download_completion(&mut self, handler: WaitHandler, out: &mut Outbox) {
        self.last_mark_requested += 1;
        self.download_waits.push((self.last_mark_requested, handler));
        self.send_mark(out);
    }

    /// Installs a new access token. Returns true if a suspended session
    /// should reconnect.
    pub(crate) fn refresh(&mut self, token: String, out: &mut Outbox) -> bool {
        self.config.signed_user_token = token;
        match self.phase {
            Phase::Suspended => self.resume(),
            Phase::Bound(_) | Phase::Enlisted(_) => {
                out.push(ClientMessage::Refresh {
                    session_ident: self.ident(),
                    signed_user_token: self.config.signed_user_token.clone(),
                });
                false
            }
            Phase::Waiting | Phase::Connecting(_) => false,
        }
    }

    pub(crate) fn on_new_subscription(&mut self, version: QueryVersion, out: &mut Outbox) {
        debug!(session_ident = self.ident(), version, "new subscription set");
        self.send_queries(out);
    }

    /// Aborts every pending wait. The engine reports nothing afterwards.
    pub(crate) fn terminate(mut self) {
        info!(session_ident = self.ident(), "session terminated");
        for wait in std::mem::take(&mut self.upload_waits) {
            match wait.then {
                AfterUpload::Complete(handler) | AfterUpload::RequestDownload(handler) => {
                    handler.call(Status::aborted())
                }
            }
        }
        for (_, handler) in std::mem::take(&mut self.download_waits) {
            handler.call(Status::aborted());
        }
    }

    // Server messages

    pub(crate) fn handle_message(&mut self, message: ServerMessage, out: &mut Outbox) -> Disposition {
        debug!(session_ident = self.ident(), message = message.name(), "received");
        let result = match message {
            ServerMessage::Ident {
                client_file_ident, ..
            } => self.receive_ident(client_file_ident, out),
            ServerMessage::Download(download) => self.receive_download(download, out),
            ServerMessage::Mark { request_ident, .. } => {
                self.receive_mark(request_ident);
                Ok(())
            }
            ServerMessage::Unbound { .. } => Ok(()),
            ServerMessage::Error(error) => Err(SessionErrorInfo::from_protocol(&error)),
            ServerMessage::QueryError {
                query_version,
                message,
                ..
            } => {
                warn!(session_ident = self.ident(), query_version, %message, "query rejected");
                self.set_query_state(query_version, State::Error, Some(&message));
                Ok(())
            }
        };
        match result {
            Ok(()) => Disposition::Continue,
            Err(error) => Disposition::Suspend(error),
        }
    }

    fn receive_ident(
        &mut self,
        file_ident: SaltedFileIdent,
        out: &mut Outbox,
    ) -> Result<(), SessionErrorInfo> {
        if !matches!(self.phase, Phase::Bound(_)) || self.metadata.client_file_ident.ident != 0 {
            return Err(protocol_violation("unexpected IDENT"));
        }
        if file_ident.ident == 0 {
            return Err(protocol_violation("server assigned file ident 0"));
        }
        let mut metadata = self.metadata;
        metadata.client_file_ident = file_ident;
        self.applier.save(&metadata).map_err(|e| {
            SessionErrorInfo::new(Status::new(ErrorCode::RuntimeError, e.to_string()), false)
        })?;
        self.metadata = metadata;
        info!(session_ident = self.ident(), file_ident = file_ident.ident, "received file ident");
        self.send_ident(out);
        Ok(())
    }

    fn receive_download(
        &mut self,
        download: DownloadMessage,
        out: &mut Outbox,
    ) -> Result<(), SessionErrorInfo> {
        if !matches!(self.phase, Phase::Enlisted(_)) {
            return Err(protocol_violation("DOWNLOAD before IDENT"));
        }
        if self.config.simulate_integration_error && !download.changesets.is_empty() {
            return Err(SessionErrorInfo::new(
                Status::new(ErrorCode::BadChangeset, "simulated failure"),
                false,
            ));
        }

        self.acknowledge_upload(download.progress.upload);
        self.downloadable_bytes = download.downloadable_bytes;

        if self.store.is_some() && download.batch_state != DownloadBatchState::SteadyState {
            self.receive_bootstrap(download, out)?;
        } else {
            self.integrate(download.changesets, &download.progress)?;
        }

        self.error_attempts = 0;
        self.check_upload_waits(out);
        self.report_progress();
        Ok(())
    }

    fn receive_bootstrap(
        &mut self,
        download: DownloadMessage,
        out: &mut Outbox,
    ) -> Result<(), SessionErrorInfo> {
        let query_version = download.query_version;
        let restart = self
            .bootstrap
            .as_ref()
            .is_some_and(|b| b.query_version != query_version);
        if restart {
            warn!(session_ident = self.ident(), query_version, "bootstrap restarted");
            self.bootstrap = None;
        }
        let bootstrap = self.bootstrap.get_or_insert_with(|| Bootstrap {
            query_version,
            changesets: Vec::new(),
            progress: download.progress,
        });
        bootstrap.changesets.extend(download.changesets);
        bootstrap.progress = download.progress;

        if download.batch_state == DownloadBatchState::MoreToCome {
            self.set_query_state(query_version, State::Bootstrapping, None);
            return Ok(());
        }

        if let Some(bootstrap) = self.bootstrap.take() {
            let pending = self
                .applier
                .store_bootstrap(bootstrap.query_version, bootstrap.progress, bootstrap.changesets)
                .map_err(|e| integration_failed(&e))?;
            self.apply_bootstrap(pending)?;
        }
        self.await_bootstrap_mark(query_version);
        self.send_mark(out);
        Ok(())
    }

    fn await_bootstrap_mark(&mut self, query_version: QueryVersion) {
        self.set_query_state(query_version, State::AwaitingMark, None);
        self.last_mark_requested += 1;
        self.bootstrap_marks
            .push((self.last_mark_requested, query_version));
    }

    /// Integrates a stored bootstrap in transactions of bounded size. The
    /// download cursor moves with the last one.
    fn apply_bootstrap(&mut self, bootstrap: PendingBootstrap) -> Result<(), SessionErrorInfo> {
        let limit = self.config.flx_bootstrap_batch_size_bytes.max(1) as u64;
        debug!(
            session_ident = self.ident(),
            query_version = bootstrap.query_version,
            changesets = bootstrap.changesets.len(),
            "applying bootstrap"
        );
        let mut parts: Vec<&[(i64, RemoteChangeset)]> = Vec::new();
        let mut start = 0;
        let mut part_bytes = 0u64;
        for (index, (_, changeset)) in bootstrap.changesets.iter().enumerate() {
            let size = changeset.original_changeset_size;
            if index > start && part_bytes + size > limit {
                parts.push(&bootstrap.changesets[start..index]);
                start = index;
                part_bytes = 0;
            }
            part_bytes += size;
        }
        parts.push(&bootstrap.changesets[start..]);

        let count = parts.len();
        for (index, part) in parts.into_iter().enumerate() {
            let last = index + 1 == count;
            let metadata = self.next_metadata(
                part.iter().map(|(_, changeset)| changeset),
                last.then_some(&bootstrap.progress),
            );
            let versions = self.applier.integrate_bootstrap(part, &metadata, last);
            self.finish_integration(metadata, part.len(), versions)?;
        }
        Ok(())
    }

    fn integrate(
        &mut self,
        changesets: Vec<RemoteChangeset>,
        progress: &SyncProgress,
    ) -> Result<(), SessionErrorInfo> {
        let metadata = self.next_metadata(changesets.iter(), Some(progress));
        let versions = self.applier.integrate(&changesets, &metadata);
        self.finish_integration(metadata, changesets.len(), versions)
    }

    fn next_metadata<'a>(
        &self,
        changesets: impl Iterator<Item = &'a RemoteChangeset>,
        progress: Option<&SyncProgress>,
    ) -> SyncMetadata {
        let mut metadata = self.metadata;
        if let Some(progress) = progress {
            metadata.download = progress.download;
            metadata.latest_server_version = progress.latest_server_version;
        }
        metadata.downloaded_bytes += changesets.map(|c| c.original_changeset_size).sum::<u64>();
        metadata
    }

    fn finish_integration(
        &mut self,
        metadata: SyncMetadata,
        count: usize,
        versions: SyncResult<(u64, u64)>,
    ) -> Result<(), SessionErrorInfo> {
        let (old_version, new_version) = versions.map_err(|e| integration_failed(&e))?;
        self.metadata = metadata;
        self.progress_version = new_version;

        if count > 0 {
            debug!(
                session_ident = self.ident(),
                count,
                new_version,
                "integrated server changesets"
            );
            if let Some(callback) = &mut self.callbacks.sync_transact {
                callback(old_version, new_version);
            }
        }
        Ok(())
    }

    fn acknowledge_upload(&mut self, cursor: UploadCursor) {
        let acked = self.metadata.upload.client_version;
        if cursor.client_version <= acked {
            return;
        }
        let db = self.applier.database();
        self.metadata.uploaded_bytes += db.uploadable_bytes(acked, cursor.client_version);
        db.trim_history(cursor.client_version);
        self.metadata.upload = cursor;
        self.upload_sent_through = self.upload_sent_through.max(cursor.client_version);
    }

    fn receive_mark(&mut self, request_ident: RequestIdent) {
        let (reached, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.bootstrap_marks)
            .into_iter()
            .partition(|(mark, _)| *mark <= request_ident);
        self.bootstrap_marks = pending;
        for (_, query_version) in reached {
            self.set_query_state(query_version, State::Complete, None);
        }

        let (reached, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.download_waits)
            .into_iter()
            .partition(|(mark, _)| *mark <= request_ident);
        self.download_waits = pending;
        for (_, handler) in reached {
            handler.call(Status::ok());
        }
    }

    // Outgoing messages

    fn send_ident(&mut self, out: &mut Outbox) {
        let Phase::Bound(connection) = self.phase else {
            return;
        };
        let (latest_query_version, query_body) = match &self.store {
            Some(store) => match store.get_active() {
                Ok(set) => (set.version(), set.to_ext_json()),
                Err(e) => {
                    warn!(session_ident = self.ident(), error = %e, "cannot read active subscriptions");
                    (0, "{}".to_string())
                }
            },
            None => (0, String::new()),
        };
        out.push(ClientMessage::Ident(IdentMessage {
            session_ident: self.ident(),
            client_file_ident: self.metadata.client_file_ident,
            download: self.metadata.download,
            latest_query_version,
            query_body,
        }));
        self.phase = Phase::Enlisted(connection);
        self.last_sent_query_version = latest_query_version;

        self.send_mark(out);
        self.send_upload(out);
        self.send_queries(out);
    }

    fn send_mark(&mut self, out: &mut Outbox) {
        if !matches!(self.phase, Phase::Enlisted(_)) {
            return;
        }
        let outstanding = !self.download_waits.is_empty() || !self.bootstrap_marks.is_empty();
        if outstanding && self.last_mark_requested > self.last_mark_sent {
            out.push(ClientMessage::Mark {
                session_ident: self.ident(),
                request_ident: self.last_mark_requested,
            });
            self.last_mark_sent = self.last_mark_requested;
        }
    }

    fn send_upload(&mut self, out: &mut Outbox) {
        if !matches!(self.phase, Phase::Enlisted(_)) {
            return;
        }
        let watermark = self.shared.watermark();
        if watermark <= self.upload_sent_through {
            return;
        }
        let entries = self
            .applier
            .database()
            .uploadable_changesets(self.upload_sent_through, watermark);
        self.upload_sent_through = watermark;
        if entries.is_empty() {
            return;
        }

        let server_version = self.metadata.download.server_version;
        let origin_timestamp = now_millis();
        let changesets: Vec<UploadChangeset> = entries
            .into_iter()
            .map(|entry| UploadChangeset {
                origin_client_version: entry.version,
                last_integrated_server_version: server_version,
                origin_timestamp,
                changeset: entry.changeset,
            })
            .collect();
        debug!(
            session_ident = self.ident(),
            count = changesets.len(),
            progress_client_version = watermark,
            "uploading"
        );
        out.push(ClientMessage::Upload(UploadMessage {
            session_ident: self.ident(),
            progress_client_version: watermark,
            progress_server_version: server_version,
            locked_server_version: server_version,
            changesets,
        }));
        self.report_progress();
    }

    fn send_queries(&mut self, out: &mut Outbox) {
        if !matches!(self.phase, Phase::Enlisted(_)) {
            return;
        }
        let Some(store) = &self.store else {
            return;
        };
        while let Some(pending) = store.get_next_pending_version(self.last_sent_query_version) {
            let query_body = match store.get_by_version(pending.query_version) {
                Ok(set) => set.to_ext_json(),
                Err(e) => {
                    warn!(version = pending.query_version, error = %e, "cannot read subscription set");
                    break;
                }
            };
            out.push(ClientMessage::Query {
                session_ident: self.shared.id,
                query_version: pending.query_version,
                query_body,
            });
            self.last_sent_query_version = pending.query_version;
        }
    }

    // Helpers

    fn check_upload_waits(&mut self, out: &mut Outbox) {
        if self.upload_waits.is_empty() {
            return;
        }
        let acked = self.metadata.upload.client_version;
        let db = self.applier.database().clone();
        let (done, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.upload_waits)
            .into_iter()
            .partition(|wait| db.uploadable_changesets(acked, wait.target).is_empty());
        self.upload_waits = pending;
        for wait in done {
            match wait.then {
                AfterUpload::Complete(handler) => handler.call(Status::ok()),
                AfterUpload::RequestDownload(handler) => {
                    self.request_download_completion(handler, out)
                }
            }
        }
    }

    /// Moves a subscription set forward. Stale or backward moves are
    /// ignored.
    fn set_query_state(&self, version: QueryVersion, state: State, error: Option<&str>) {
        let Some(store) = &self.store else {
            return;
        };
        let mut set = match store.get_mutable_by_version(version) {
            Ok(set) => set,
            Err(e) => {
                debug!(version, error = %e, "subscription set not found");
                return;
            }
        };
        let current = set.state();
        if current.is_terminal() || (state != State::Error && current.rank() >= state.rank()) {
            return;
        }
        if let Err(e) = set.update_state(state, error) {
            debug!(version, error = %e, "subscription state not updated");
            return;
        }
        match set.commit() {
            Ok(_) => debug!(version, %state, "subscription set state changed"),
            Err(e) => warn!(version, error = %e, "failed to store subscription state"),
        }
    }

    fn report(&mut self, state: ConnectionState, error: Option<&SessionErrorInfo>) {
        if self.reported == state {
            return;
        }
        self.reported = state;
        if let Some(listener) = &mut self.callbacks.connection_state {
            listener(state, error);
        }
    }

    fn report_progress(&mut self) {
        if self.callbacks.progress.is_none() {
            return;
        }
        let db = self.applier.database();
        let latest = db.latest_version();
        let unacked = db.uploadable_bytes(self.metadata.upload.client_version, latest);
        let report = ProgressReport {
            downloaded_bytes: self.metadata.downloaded_bytes,
            downloadable_bytes: self.downloadable_bytes,
            uploaded_bytes: self.metadata.uploaded_bytes,
            uploadable_bytes: self.metadata.uploaded_bytes + unacked,
            progress_version: self.progress_version,
            snapshot_version: latest,
        };
        if let Some(handler) = &mut self.callbacks.progress {
            handler(&report);
        }
    }
}

fn integration_failed(error: &SyncError) -> SessionErrorInfo {
    SessionErrorInfo::new(
        Status::new(ErrorCode::BadChangeset, format!("failed to integrate: {error}")),
        false,
    )
}

fn protocol_violation(message: &str) -> SessionErrorInfo {
    SessionErrorInfo::new(Status::new(ErrorCode::ProtocolViolation, message), false)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flexsync_protocol::{Changeset, CreateObject, DownloadCursor, PayloadType, PrimaryKey};
    use flexsync_storage::Database;

    fn bind_request(store: &SubscriptionStore) -> BindRequest {
        let config = SessionConfig::new("localhost", "/app/flx");
        BindRequest {
            shared: Arc::new(SessionShared::new(1)),
            applier: DatabaseApplier::new(store.database().clone()),
            store: Some(store.clone()),
            endpoint: ServerEndpoint {
                envelope: config.protocol_envelope,
                address: config.server_address.clone(),
                port: 7800,
            },
            config,
            callbacks: SessionCallbacks::default(),
        }
    }

    fn create_cat(object: i64) -> RemoteChangeset {
        let mut changeset = Changeset::new();
        let table = changeset.intern_string("Cat");
        changeset.push(CreateObject {
            table,
            object: PrimaryKey::Int(object),
        });
        RemoteChangeset {
            remote_version: object as u64,
            last_integrated_local_version: 0,
            origin_timestamp: 0,
            origin_file_ident: 2,
            original_changeset_size: 8,
            changeset,
        }
    }

    #[test]
    fn unfinished_bootstrap_is_applied_on_bind() {
        let db = Database::open_in_memory();
        db.transaction(|txn| txn.add_table("Cat", "_id", PayloadType::Int))
            .unwrap();
        let store = SubscriptionStore::create(db.clone()).unwrap();
        let version = store
            .get_latest()
            .unwrap()
            .make_mutable_copy()
            .commit()
            .unwrap()
            .version();
        let mut set = store.get_mutable_by_version(version).unwrap();
        set.update_state(State::Bootstrapping, None).unwrap();
        set.commit().unwrap();

        let applier = DatabaseApplier::new(db.clone());
        let progress = SyncProgress {
            download: DownloadCursor {
                server_version: 12,
                last_integrated_client_version: 0,
            },
            latest_server_version: 12,
            ..Default::default()
        };
        let stored = applier
            .store_bootstrap(version, progress, vec![create_cat(1), create_cat(2)])
            .unwrap();
        // The first part was integrated before the database was closed.
        applier
            .integrate_bootstrap(&stored.changesets[..1], &SyncMetadata::default(), false)
            .unwrap();

        let engine = SessionEngine::new(bind_request(&store));
        assert_eq!(applier.pending_bootstrap().unwrap(), None);
        assert_eq!(db.begin_read().object_count("Cat"), 2);
        assert_eq!(engine.metadata.download.server_version, 12);
        assert_eq!(SyncMetadata::load(&db).download.server_version, 12);
        assert_eq!(
            store.get_by_version(version).unwrap().state(),
            State::AwaitingMark
        );
        assert_eq!(engine.bootstrap_marks, vec![(1, version)]);
    }

    #[test]
    fn nothing_to_resume_without_pending_bootstrap() {
        let db = Database::open_in_memory();
        let store = SubscriptionStore::create(db).unwrap();
        let engine = SessionEngine::new(bind_request(&store));
        assert!(engine.bootstrap_marks.is_empty());
        assert_eq!(engine.progress_version, 0);
    }
}

//! # FlexSync Client
//!
//! Client side of the FlexSync protocol.
//!
//! This crate provides:
//! - [`Client`], an event loop that multiplexes sessions over connections
//!   and reconnects with backoff
//! - [`Session`], which binds a local database to a server-side file,
//!   uploads local changesets and integrates downloaded ones
//! - Flexible sync subscriptions: [`SubscriptionStore`], [`SubscriptionSet`]
//!   and [`MutableSubscriptionSet`]
//! - [`Status`], [`ErrorCode`] and a one-shot [`Promise`]/[`Future`] pair
//! - The [`SyncTransport`] abstraction and a scripted [`MockTransport`]
//!
//! ## Threading
//!
//! One thread calls [`Client::run`]. All session callbacks run on that
//! thread. [`SessionHandle`] operations may be called from any thread.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod applier;
mod client;
mod config;
mod endpoint;
mod engine;
mod error;
mod event_loop;
mod functional;
mod future;
mod session;
mod status;
mod subscriptions;
mod transport;

pub use applier::SyncMetadata;
pub use client::Client;
pub use endpoint::{decompose_server_url, validate_virtual_path, DecomposedUrl, ServerEndpoint};
pub use config::{
    ClientConfig, ReconnectBackoff, ReconnectMode, SessionConfig, DEFAULT_FLX_BOOTSTRAP_BATCH_SIZE,
};
pub use error::{LogicError, SyncError, SyncResult};
pub use event_loop::ConnectionId;
pub use functional::UniqueFunction;
pub use future::{make_promise_future, Future, Promise};
pub use session::{
    ConnectionState, ConnectionStateListener, ProgressHandler, ProgressReport, Session,
    SessionErrorInfo, SessionHandle, SyncTransactCallback,
};
pub use status::{ErrorCategory, ErrorCode, Status, StatusWith};
pub use subscriptions::{
    MutableSubscriptionSet, PendingSubscription, Query, State, Subscription, SubscriptionSet,
    SubscriptionStore, VersionInfo, EMPTY_VERSION,
};
pub use transport::{ConnectOutcome, Connection, ConnectionEvents, MockTransport, SyncTransport};

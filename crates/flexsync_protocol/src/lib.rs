//! # FlexSync Protocol
//!
//! Replication instructions, changesets and sync protocol messages.
//!
//! This crate provides:
//! - [`Instruction`], the closed set of mutation kinds, with path addressing
//!   into nested collections
//! - [`Changeset`], an ordered instruction sequence with its intern table and
//!   string buffer
//! - Client and server protocol messages
//! - CBOR encoding/decoding
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod changeset;
mod codec;
mod error;
mod instruction;
mod messages;
mod path;
mod payload;
mod types;

pub use changeset::Changeset;
pub use codec::{from_cbor, to_cbor};
pub use error::{ProtocolError, ProtocolResult};
pub use instruction::{
    AddColumn, AddInteger, AddTable, ArrayErase, ArrayInsert, ArrayMove, Clear, CreateObject,
    EraseColumn, EraseObject, EraseTable, Instruction, InstructionKind, InstructionSlot,
    InstructionType, ObjectInstruction, PathInstruction, PrimaryKeySpec, SetErase, SetInsert,
    TableInstruction, TableType, Update,
};
pub use messages::{
    BindMessage, ClientMessage, DownloadBatchState, DownloadCursor, DownloadMessage,
    ErrorMessage, IdentMessage, ProtocolEnvelope, ProtocolErrorCode, QueryVersion,
    RemoteChangeset, RequestIdent, SaltedFileIdent, ServerMessage, ServerRequestsAction,
    SessionIdent, SessionReason, SyncProgress, UploadChangeset, UploadCursor, UploadMessage,
    Version,
};
pub use path::{Path, PathElement};
pub use payload::{CollectionType, ObjLink, Payload, PayloadType, PrimaryKey};
pub use types::{Decimal128, GlobalKey, InternString, ObjectId, StringBufferRange, Timestamp};
pub use uuid::Uuid;

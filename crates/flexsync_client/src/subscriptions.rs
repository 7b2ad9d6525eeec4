//! Flexible-sync subscriptions.
//!
//! A [`SubscriptionStore`] keeps versioned [`SubscriptionSet`]s in two internal
//! tables of the local database. Applications change what they sync by taking
//! a [`MutableSubscriptionSet`] copy of the latest set, editing it and
//! committing it as the next version. The sync session then drives the
//! committed set through the server-acknowledged states:
//!
//! ```text
//! Uncommitted -> Pending -> Bootstrapping -> AwaitingMark -> Complete -> Superseded
//!                   |              |
//!                   +---> Error <--+
//! ```
//!
//! When a set reaches `Complete`, every set with a lower version is deleted;
//! reading such a version afterwards yields `Superseded`.

use crate::error::{LogicError, SyncError, SyncResult};
use crate::future::{make_promise_future, Future, Promise};
use crate::status::{ErrorCode, Status};
use flexsync_protocol::{CollectionType, ObjectId, PayloadType, Timestamp};
use flexsync_storage::{
    ColumnSpec, Database, ObjKey, Object, ReplicationOverride, Snapshot, Value, WriteTransaction,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Table holding one object per subscription set, keyed by version.
pub const SUBSCRIPTION_SETS_TABLE: &str = "flx_subscription_sets";
/// Embedded table holding the subscriptions of a set.
pub const SUBSCRIPTIONS_TABLE: &str = "flx_subscriptions";

/// State of a subscription set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Being edited; only mutable sets are in this state.
    Uncommitted,
    /// Committed locally, not yet acknowledged by the server.
    Pending,
    /// The server is sending the data matching the set.
    Bootstrapping,
    /// All bootstrap data arrived; waiting for the server to confirm the
    /// client is caught up.
    AwaitingMark,
    /// The set is active and fully synchronized.
    Complete,
    /// The server rejected the set.
    Error,
    /// A newer set became complete first.
    Superseded,
}

impl State {
    /// Position in the forward progression. `Error` is outside it.
    pub(crate) fn rank(self) -> u8 {
        match self {
            State::Uncommitted => 0,
            State::Pending => 1,
            State::Bootstrapping => 2,
            State::AwaitingMark => 3,
            State::Complete => 4,
            State::Superseded => 5,
            State::Error => u8::MAX,
        }
    }

    fn to_code(self) -> i64 {
        match self {
            State::Uncommitted => 0,
            State::Pending => 1,
            State::Bootstrapping => 2,
            State::AwaitingMark => 3,
            State::Complete => 4,
            State::Error => 5,
            State::Superseded => 6,
        }
    }

    fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            0 => State::Uncommitted,
            1 => State::Pending,
            2 => State::Bootstrapping,
            3 => State::AwaitingMark,
            4 => State::Complete,
            5 => State::Error,
            6 => State::Superseded,
            _ => return None,
        })
    }

    /// Returns true for states a set never leaves.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Error | State::Superseded)
    }

    /// Returns true while the server still has to act on the set.
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            State::Pending | State::Bootstrapping | State::AwaitingMark
        )
    }

    /// Returns true if a server-driven update may move a set from `self`
    /// to `to`. Staying in the same non-terminal state is allowed.
    pub(crate) fn can_move_to(self, to: State) -> bool {
        match to {
            State::Uncommitted | State::Superseded => false,
            State::Error => matches!(self, State::Pending | State::Bootstrapping),
            _ => self != State::Uncommitted && !self.is_terminal() && to.rank() >= self.rank(),
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A query over one object class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Query {
    object_class: String,
    description: String,
}

impl Query {
    /// Creates a query from its class and serialized predicate.
    pub fn new(object_class: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            object_class: object_class.into(),
            description: description.into(),
        }
    }

    /// The queried object class.
    pub fn object_class(&self) -> &str {
        &self.object_class
    }

    /// The serialized predicate.
    pub fn description(&self) -> &str {
        &self.description
    }
}

/// One subscription of a set. Equality is by id.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: ObjectId,
    created_at: Timestamp,
    updated_at: Timestamp,
    name: Option<String>,
    object_class_name: String,
    query_string: String,
}

impl Subscription {
    fn new(name: Option<String>, query: &Query) -> Self {
        let now = Timestamp::now();
        Self {
            id: ObjectId::generate(),
            created_at: now,
            updated_at: now,
            name,
            object_class_name: query.object_class.clone(),
            query_string: query.description.clone(),
        }
    }

    /// Unique id.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// When the subscription was created.
    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// When the subscription was last changed.
    pub fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    /// Name given by the application.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The queried object class.
    pub fn object_class_name(&self) -> &str {
        &self.object_class_name
    }

    /// The serialized predicate.
    pub fn query_string(&self) -> &str {
        &self.query_string
    }

    fn matches(&self, query: &Query) -> bool {
        self.object_class_name == query.object_class && self.query_string == query.description
    }

    fn to_object(&self) -> Object {
        let mut obj = Object::new();
        obj.set("id", Value::ObjectId(self.id));
        obj.set("created_at", Value::Timestamp(self.created_at));
        obj.set("updated_at", Value::Timestamp(self.updated_at));
        obj.set("name", Value::from(self.name.clone()));
        obj.set("object_class", Value::from(self.object_class_name.as_str()));
        obj.set("query", Value::from(self.query_string.as_str()));
        obj
    }

    fn from_object(obj: &Object) -> Option<Self> {
        Some(Self {
            id: obj.get("id")?.as_object_id()?,
            created_at: obj.get("created_at")?.as_timestamp()?,
            updated_at: obj.get("updated_at")?.as_timestamp()?,
            name: obj.get("name").and_then(Value::as_str).map(str::to_string),
            object_class_name: obj.get("object_class")?.as_str()?.to_string(),
            query_string: obj.get("query")?.as_str()?.to_string(),
        })
    }
}

impl PartialEq for Subscription {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Subscription {}

/// Version of a set that has not been committed yet.
pub const EMPTY_VERSION: i64 = -1;

/// The persisted content of a set.
#[derive(Debug, Clone)]
struct SetData {
    version: i64,
    state: State,
    error: Option<String>,
    snapshot_version: u64,
    subscriptions: Vec<Subscription>,
}

impl SetData {
    fn superseded(version: i64) -> Self {
        Self {
            version,
            state: State::Superseded,
            error: None,
            snapshot_version: 0,
            subscriptions: Vec::new(),
        }
    }
}

/// An immutable snapshot of a versioned subscription set.
///
/// Call [`refresh`](Self::refresh) to observe state changes made by the sync
/// session after the snapshot was taken.
#[derive(Clone)]
pub struct SubscriptionSet {
    store: Weak<StoreInner>,
    data: SetData,
}

impl SubscriptionSet {
    fn new(store: &Arc<StoreInner>, data: SetData) -> Self {
        Self {
            store: Arc::downgrade(store),
            data,
        }
    }

    /// Version of the set.
    pub fn version(&self) -> i64 {
        self.data.version
    }

    /// State as of the last read.
    pub fn state(&self) -> State {
        self.data.state
    }

    /// Error reported by the server, in the `Error` state.
    pub fn error_str(&self) -> Option<&str> {
        self.data.error.as_deref()
    }

    /// Database version at which the set was committed.
    pub fn snapshot_version(&self) -> u64 {
        self.data.snapshot_version
    }

    /// Number of subscriptions.
    pub fn size(&self) -> usize {
        self.data.subscriptions.len()
    }

    /// Returns true if the set has no subscriptions.
    pub fn is_empty(&self) -> bool {
        self.data.subscriptions.is_empty()
    }

    /// Iterates over the subscriptions in insertion order.
    pub fn iter(&self) -> std::slice::Iter<'_, Subscription> {
        self.data.subscriptions.iter()
    }

    /// Subscription at `index`.
    pub fn at(&self, index: usize) -> Option<&Subscription> {
        self.data.subscriptions.get(index)
    }

    /// Finds a subscription by name.
    pub fn find(&self, name: &str) -> Option<&Subscription> {
        self.iter().find(|s| s.name() == Some(name))
    }

    /// Finds a subscription by query.
    pub fn find_query(&self, query: &Query) -> Option<&Subscription> {
        self.iter().find(|s| s.matches(query))
    }

    /// The set's queries as a JSON object mapping each class to the
    /// disjunction of its predicates.
    pub fn to_ext_json(&self) -> String {
        let mut by_class: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for sub in self.iter() {
            by_class
                .entry(sub.object_class_name())
                .or_default()
                .push(sub.query_string());
        }
        let body: serde_json::Map<String, serde_json::Value> = by_class
            .into_iter()
            .map(|(class, queries)| {
                let joined = queries
                    .iter()
                    .map(|q| format!("({q})"))
                    .collect::<Vec<_>>()
                    .join(" OR ");
                (class.to_string(), serde_json::Value::String(joined))
            })
            .collect();
        serde_json::Value::Object(body).to_string()
    }

    /// Resolves once the set reaches `target` or a later state.
    ///
    /// Resolves with the state actually reached, which may be past `target`
    /// (a set can be superseded before it completes). Resolves with a
    /// `SubscriptionFailed` error if the set enters the `Error` state.
    pub fn get_state_change_notification(&self, target: State) -> Future<State> {
        match self.store.upgrade() {
            Some(store) => store.state_change_notification(self.data.version, target),
            None => Future::ready(Err(Status::new(
                ErrorCode::RuntimeError,
                "subscription store is gone",
            ))),
        }
    }

    /// Re-reads the set from the database.
    pub fn refresh(&mut self) -> SyncResult<()> {
        let store = self.store.upgrade().ok_or(SyncError::StoreGone)?;
        let read = store.db.begin_read();
        self.data = match read_set(&read, self.data.version) {
            Some(data) => data,
            None => SetData {
                state: State::Superseded,
                error: None,
                ..self.data.clone()
            },
        };
        Ok(())
    }

    /// Creates an editable copy that will commit as a new version.
    pub fn make_mutable_copy(&self) -> MutableSubscriptionSet {
        let mut data = self.data.clone();
        data.version = EMPTY_VERSION;
        data.state = State::Uncommitted;
        data.error = None;
        MutableSubscriptionSet {
            set: SubscriptionSet {
                store: self.store.clone(),
                data,
            },
        }
    }
}

impl fmt::Debug for SubscriptionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionSet")
            .field("version", &self.data.version)
            .field("state", &self.data.state)
            .field("size", &self.size())
            .finish()
    }
}

impl<'a> IntoIterator for &'a SubscriptionSet {
    type Item = &'a Subscription;
    type IntoIter = std::slice::Iter<'a, Subscription>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// An editable subscription set.
///
/// Obtained from [`SubscriptionSet::make_mutable_copy`] in the `Uncommitted`
/// state, where the subscriptions can be changed, or from
/// [`SubscriptionStore::get_mutable_by_version`] for recording a state change.
/// Nothing is written until [`commit`](Self::commit).
pub struct MutableSubscriptionSet {
    set: SubscriptionSet,
}

impl MutableSubscriptionSet {
    fn check_uncommitted(&self) -> SyncResult<()> {
        if self.set.data.state != State::Uncommitted {
            return Err(LogicError::WrongSubscriptionState {
                state: self.set.data.state,
                expected: State::Uncommitted,
            }
            .into());
        }
        Ok(())
    }

    /// Inserts a named subscription, or updates the query of the existing
    /// subscription with that name. Returns its index and whether it was
    /// inserted.
    pub fn insert_or_assign(&mut self, name: &str, query: &Query) -> SyncResult<(usize, bool)> {
        self.check_uncommitted()?;
        let subs = &mut self.set.data.subscriptions;
        if let Some(index) = subs.iter().position(|s| s.name() == Some(name)) {
            let sub = &mut subs[index];
            sub.object_class_name = query.object_class.clone();
            sub.query_string = query.description.clone();
            sub.updated_at = Timestamp::now();
            return Ok((index, false));
        }
        subs.push(Subscription::new(Some(name.to_string()), query));
        Ok((subs.len() - 1, true))
    }

    /// Inserts an unnamed subscription unless one with an equal query exists,
    /// in which case only its update time changes.
    pub fn insert_or_assign_unnamed(&mut self, query: &Query) -> SyncResult<(usize, bool)> {
        self.check_uncommitted()?;
        let subs = &mut self.set.data.subscriptions;
        if let Some(index) = subs
            .iter()
            .position(|s| s.name.is_none() && s.matches(query))
        {
            subs[index].updated_at = Timestamp::now();
            return Ok((index, false));
        }
        subs.push(Subscription::new(None, query));
        Ok((subs.len() - 1, true))
    }

    /// Removes the subscription with `name`.
    pub fn erase(&mut self, name: &str) -> SyncResult<bool> {
        self.check_uncommitted()?;
        Ok(self.remove_where(|s| s.name() == Some(name), true))
    }

    /// Removes the first subscription with an equal query.
    pub fn erase_by_query(&mut self, query: &Query) -> SyncResult<bool> {
        self.check_uncommitted()?;
        Ok(self.remove_where(|s| s.matches(query), true))
    }

    /// Removes the subscription with `id`.
    pub fn erase_by_id(&mut self, id: ObjectId) -> SyncResult<bool> {
        self.check_uncommitted()?;
        Ok(self.remove_where(|s| s.id == id, true))
    }

    /// Removes every subscription on `object_class`.
    pub fn erase_by_class_name(&mut self, object_class: &str) -> SyncResult<bool> {
        self.check_uncommitted()?;
        Ok(self.remove_where(|s| s.object_class_name == object_class, false))
    }

    /// Removes every subscription.
    pub fn clear(&mut self) -> SyncResult<()> {
        self.check_uncommitted()?;
        self.set.data.subscriptions.clear();
        Ok(())
    }

    fn remove_where(&mut self, pred: impl Fn(&Subscription) -> bool, first_only: bool) -> bool {
        let subs = &mut self.set.data.subscriptions;
        if first_only {
            match subs.iter().position(|s| pred(s)) {
                Some(index) => {
                    subs.remove(index);
                    true
                }
                None => false,
            }
        } else {
            let before = subs.len();
            subs.retain(|s| !pred(s));
            subs.len() != before
        }
    }

    /// Records a server-driven state change, written by [`commit`](Self::commit).
    ///
    /// States only move forward. `Error` requires a message and no other
    /// state accepts one. `Uncommitted` and `Superseded` cannot be set.
    pub fn update_state(&mut self, state: State, error: Option<&str>) -> SyncResult<()> {
        let current = self.set.data.state;
        let invalid = LogicError::InvalidStateTransition {
            from: current,
            to: state,
        };
        if !current.can_move_to(state) {
            return Err(invalid.into());
        }
        if (state == State::Error) != error.is_some() {
            return Err(LogicError::ErrorMessageMismatch.into());
        }
        self.set.data.state = state;
        self.set.data.error = error.map(str::to_string);
        Ok(())
    }

    /// Writes the set in one storage commit.
    ///
    /// An `Uncommitted` set becomes the next version in the `Pending` state
    /// and the store's new-set callback runs. For any other set the state
    /// change is written; reaching `Complete` deletes every older set.
    pub fn commit(self) -> SyncResult<SubscriptionSet> {
        let store = self.set.store.upgrade().ok_or(SyncError::StoreGone)?;
        if self.set.data.state == State::Uncommitted {
            store.commit_new(self.set.data)
        } else {
            store.commit_state(self.set.data)
        }
    }
}

impl Deref for MutableSubscriptionSet {
    type Target = SubscriptionSet;

    fn deref(&self) -> &SubscriptionSet {
        &self.set
    }
}

impl fmt::Debug for MutableSubscriptionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MutableSubscriptionSet").field(&self.set).finish()
    }
}

/// Versions of interest to the sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    /// Highest committed version.
    pub latest: i64,
    /// Version of the active set.
    pub active: i64,
    /// Version waiting for its bootstrap MARK, if any.
    pub pending_mark: Option<i64>,
}

/// A set the server has not finished processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingSubscription {
    /// Set version.
    pub query_version: i64,
    /// Database version at which it was committed.
    pub snapshot_version: u64,
}

type NewSetCallback = Box<dyn Fn(i64) + Send + Sync>;

struct NotificationRequest {
    version: i64,
    target: State,
    promise: Promise<State>,
}

struct StoreInner {
    db: Database,
    replication: ReplicationOverride,
    on_new_subscription_set: Option<NewSetCallback>,
    pending_notifications: Mutex<Vec<NotificationRequest>>,
}

/// Persistent, versioned subscription sets of one database.
///
/// Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct SubscriptionStore {
    inner: Arc<StoreInner>,
}

impl SubscriptionStore {
    /// Opens the store, creating its tables and an empty version 0 set in
    /// the `Pending` state if the database has none.
    pub fn create(db: Database) -> SyncResult<Self> {
        Self::open(db, None)
    }

    /// Like [`create`](Self::create); `on_new_subscription_set` is called
    /// with the version of every newly committed set.
    pub fn create_with_callback(
        db: Database,
        on_new_subscription_set: impl Fn(i64) + Send + Sync + 'static,
    ) -> SyncResult<Self> {
        Self::open(db, Some(Box::new(on_new_subscription_set)))
    }

    fn open(db: Database, on_new_subscription_set: Option<NewSetCallback>) -> SyncResult<Self> {
        let replication = db.replication_override();
        let needs_init = {
            let read = db.begin_read();
            read.table(SUBSCRIPTION_SETS_TABLE).map_or(true, |t| t.is_empty())
        };
        if needs_init {
            let mut txn = db.begin_write_without_replication(&replication)?;
            ensure_schema(&mut txn)?;
            if versions(&txn).is_empty() {
                let zero = SetData {
                    version: 0,
                    state: State::Pending,
                    error: None,
                    snapshot_version: txn.version() + 1,
                    subscriptions: Vec::new(),
                };
                write_set(&mut txn, &zero)?;
            }
            txn.commit()?;
            debug!("initialized subscription store");
        }
        Ok(Self {
            inner: Arc::new(StoreInner {
                db,
                replication,
                on_new_subscription_set,
                pending_notifications: Mutex::new(Vec::new()),
            }),
        })
    }

    /// The database holding the subscriptions.
    pub fn database(&self) -> &Database {
        &self.inner.db
    }

    /// The set with the highest version.
    pub fn get_latest(&self) -> SyncResult<SubscriptionSet> {
        let read = self.inner.db.begin_read();
        let version = versions(&read).last().copied().unwrap_or(0);
        Ok(self.set_or_superseded(&read, version))
    }

    /// The complete set with the highest version, or the initial set if
    /// none has completed.
    pub fn get_active(&self) -> SyncResult<SubscriptionSet> {
        let read = self.inner.db.begin_read();
        let version = active_version(&read);
        Ok(self.set_or_superseded(&read, version))
    }

    /// The set with `version`. Versions that were garbage collected read as
    /// `Superseded`.
    pub fn get_by_version(&self, version: i64) -> SyncResult<SubscriptionSet> {
        let read = self.inner.db.begin_read();
        let latest = versions(&read).last().copied().unwrap_or(0);
        if version > latest || version < 0 {
            return Err(LogicError::NoSuchSubscriptionSet(version).into());
        }
        Ok(self.set_or_superseded(&read, version))
    }

    /// An editable view of an existing set, for recording state changes.
    pub fn get_mutable_by_version(&self, version: i64) -> SyncResult<MutableSubscriptionSet> {
        let read = self.inner.db.begin_read();
        let data = read_set(&read, version)
            .ok_or(LogicError::NoSuchSubscriptionSet(version))?;
        Ok(MutableSubscriptionSet {
            set: SubscriptionSet::new(&self.inner, data),
        })
    }

    /// Latest, active and awaiting-mark versions.
    pub fn get_active_and_latest_versions(&self) -> VersionInfo {
        let read = self.inner.db.begin_read();
        let all = versions(&read);
        let pending_mark = all.iter().copied().find(|&v| {
            read_state(&read, v).map(|(s, _)| s) == Some(State::AwaitingMark)
        });
        VersionInfo {
            latest: all.last().copied().unwrap_or(0),
            active: active_version(&read),
            pending_mark,
        }
    }

    /// The first set after `last_query_version` the server still has to
    /// process.
    pub fn get_next_pending_version(&self, last_query_version: i64) -> Option<PendingSubscription> {
        let read = self.inner.db.begin_read();
        versions(&read)
            .into_iter()
            .filter(|&v| v > last_query_version)
            .find_map(|v| {
                let data = read_set(&read, v)?;
                data.state.is_pending().then_some(PendingSubscription {
                    query_version: v,
                    snapshot_version: data.snapshot_version,
                })
            })
    }

    /// Every set newer than the active one that is still pending.
    pub fn get_pending_subscriptions(&self) -> Vec<SubscriptionSet> {
        let read = self.inner.db.begin_read();
        let active = active_version(&read);
        versions(&read)
            .into_iter()
            .filter(|&v| v > active)
            .filter_map(|v| read_set(&read, v))
            .filter(|data| data.state.is_pending())
            .map(|data| SubscriptionSet::new(&self.inner, data))
            .collect()
    }

    /// Returns true if a set with a version above `version` exists.
    pub fn would_refresh(&self, version: i64) -> bool {
        let read = self.inner.db.begin_read();
        versions(&read).last().is_some_and(|&latest| version < latest)
    }

    /// Object classes queried by the latest set.
    pub fn get_tables_for_latest(&self) -> SyncResult<BTreeSet<String>> {
        Ok(self
            .get_latest()?
            .iter()
            .map(|s| s.object_class_name().to_string())
            .collect())
    }

    /// Resolves every outstanding state change notification without
    /// touching the database.
    ///
    /// An error `status` fails each future with it; an OK status resolves
    /// each with the set's current state.
    pub fn notify_all_state_change_notifications(&self, status: Status) {
        let requests = std::mem::take(&mut *self.inner.pending_notifications.lock());
        if requests.is_empty() {
            return;
        }
        let read = self.inner.db.begin_read();
        for req in requests {
            if status.is_ok() {
                let state = read_state(&read, req.version).map_or(State::Superseded, |(s, _)| s);
                req.promise.emplace_value(state);
            } else {
                req.promise.set_error(status.clone());
            }
        }
    }

    /// Removes every set and starts over from an empty version 0.
    ///
    /// Outstanding notifications resolve with `Superseded`. Must be called
    /// from the sync event loop.
    pub fn terminate(&self) -> SyncResult<()> {
        let mut txn = self.begin_write()?;
        for version in versions(&txn) {
            txn.erase_object(SUBSCRIPTION_SETS_TABLE, &ObjKey::Int(version))?;
        }
        let zero = SetData {
            version: 0,
            state: State::Pending,
            error: None,
            snapshot_version: txn.version() + 1,
            subscriptions: Vec::new(),
        };
        write_set(&mut txn, &zero)?;
        txn.commit()?;
        debug!("terminated subscription store");
        self.supersede_notifications(|_| true);
        Ok(())
    }

    /// Deletes every set except `version`, resolving their notifications
    /// with `Superseded`.
    pub fn supercede_all_except(&self, version: i64) -> SyncResult<()> {
        let mut txn = self.begin_write()?;
        for v in versions(&txn) {
            if v != version {
                txn.erase_object(SUBSCRIPTION_SETS_TABLE, &ObjKey::Int(v))?;
            }
        }
        txn.commit()?;
        self.supersede_notifications(|v| v != version);
        Ok(())
    }

    fn begin_write(&self) -> SyncResult<WriteTransaction<'_>> {
        self.inner.begin_write()
    }

    fn set_or_superseded(&self, snapshot: &Snapshot, version: i64) -> SubscriptionSet {
        let data = read_set(snapshot, version).unwrap_or_else(|| SetData::superseded(version));
        SubscriptionSet::new(&self.inner, data)
    }

    fn supersede_notifications(&self, pred: impl Fn(i64) -> bool) {
        let ready = {
            let mut pending = self.inner.pending_notifications.lock();
            let (ready, keep) = std::mem::take(&mut *pending)
                .into_iter()
                .partition::<Vec<_>, _>(|req| pred(req.version));
            *pending = keep;
            ready
        };
        for req in ready {
            req.promise.emplace_value(State::Superseded);
        }
    }
}

impl StoreInner {
    fn begin_write(&self) -> SyncResult<WriteTransaction<'_>> {
        let mut txn = self.db.begin_write_without_replication(&self.replication)?;
        ensure_schema(&mut txn)?;
        Ok(txn)
    }

    fn commit_new(self: &Arc<Self>, mut data: SetData) -> SyncResult<SubscriptionSet> {
        let mut txn = self.begin_write()?;
        data.version = versions(&txn).last().copied().unwrap_or(0) + 1;
        data.state = State::Pending;
        data.snapshot_version = txn.version() + 1;
        write_set(&mut txn, &data)?;
        txn.commit()?;
        debug!(version = data.version, size = data.subscriptions.len(), "committed subscription set");

        if let Some(callback) = &self.on_new_subscription_set {
            callback(data.version);
        }
        Ok(SubscriptionSet::new(self, data))
    }

    fn commit_state(self: &Arc<Self>, data: SetData) -> SyncResult<SubscriptionSet> {
        let mut txn = self.begin_write()?;
        let key = ObjKey::Int(data.version);
        let Some((stored, _)) = read_state(&txn, data.version) else {
            // Collected while the caller held its copy.
            drop(txn);
            return Ok(SubscriptionSet::new(self, SetData::superseded(data.version)));
        };
        if stored != data.state && !stored.can_move_to(data.state) {
            return Err(LogicError::InvalidStateTransition {
                from: stored,
                to: data.state,
            }
            .into());
        }
        txn.set(SUBSCRIPTION_SETS_TABLE, &key, "state", data.state.to_code())?;
        txn.set(SUBSCRIPTION_SETS_TABLE, &key, "error", data.error.clone())?;
        if data.state == State::Complete {
            for older in versions(&txn).into_iter().filter(|&v| v < data.version) {
                txn.erase_object(SUBSCRIPTION_SETS_TABLE, &ObjKey::Int(older))?;
            }
        }
        txn.commit()?;
        debug!(version = data.version, state = %data.state, "subscription set state changed");

        self.process_notifications(data.version, data.state, data.error.as_deref());
        Ok(SubscriptionSet::new(self, data))
    }

    fn state_change_notification(self: &Arc<Self>, version: i64, target: State) -> Future<State> {
        let mut pending = self.pending_notifications.lock();
        let read = self.db.begin_read();
        let (state, error) = read_state(&read, version).unwrap_or((State::Superseded, None));
        if state == State::Error {
            return Future::ready(Err(subscription_failed(error.as_deref())));
        }
        if state.rank() >= target.rank() {
            return Future::ready(Ok(state));
        }
        let (promise, future) = make_promise_future();
        pending.push(NotificationRequest {
            version,
            target,
            promise,
        });
        future
    }

    fn process_notifications(&self, version: i64, state: State, error: Option<&str>) {
        let mut resolved = Vec::new();
        {
            let mut pending = self.pending_notifications.lock();
            let mut keep = Vec::new();
            for req in std::mem::take(&mut *pending) {
                if req.version == version {
                    if state == State::Error {
                        resolved.push((req.promise, Err(subscription_failed(error))));
                    } else if state.rank() >= req.target.rank() {
                        resolved.push((req.promise, Ok(state)));
                    } else {
                        keep.push(req);
                    }
                } else if req.version < version && state == State::Complete {
                    resolved.push((req.promise, Ok(State::Superseded)));
                } else {
                    keep.push(req);
                }
            }
            *pending = keep;
        }
        for (promise, result) in resolved {
            promise.set_from(result);
        }
    }
}

fn subscription_failed(error: Option<&str>) -> Status {
    Status::new(
        ErrorCode::SubscriptionFailed,
        error.unwrap_or("subscription set failed"),
    )
}

fn ensure_schema(txn: &mut WriteTransaction<'_>) -> SyncResult<()> {
    if txn.has_table(SUBSCRIPTION_SETS_TABLE) {
        return Ok(());
    }
    txn.add_embedded_table(SUBSCRIPTIONS_TABLE)?;
    for (name, spec) in [
        ("id", ColumnSpec::single(PayloadType::ObjectId, false)),
        ("created_at", ColumnSpec::single(PayloadType::Timestamp, false)),
        ("updated_at", ColumnSpec::single(PayloadType::Timestamp, false)),
        ("name", ColumnSpec::single(PayloadType::String, true)),
        ("object_class", ColumnSpec::single(PayloadType::String, false)),
        ("query", ColumnSpec::single(PayloadType::String, false)),
    ] {
        txn.add_column(SUBSCRIPTIONS_TABLE, name, spec)?;
    }

    txn.add_table(SUBSCRIPTION_SETS_TABLE, "version", PayloadType::Int)?;
    for (name, spec) in [
        ("state", ColumnSpec::single(PayloadType::Int, false)),
        ("error", ColumnSpec::single(PayloadType::String, true)),
        ("snapshot_version", ColumnSpec::single(PayloadType::Int, false)),
        (
            "subscriptions",
            ColumnSpec::collection(PayloadType::Link, CollectionType::List)
                .with_link_target(SUBSCRIPTIONS_TABLE),
        ),
    ] {
        txn.add_column(SUBSCRIPTION_SETS_TABLE, name, spec)?;
    }
    Ok(())
}

fn versions(snapshot: &Snapshot) -> Vec<i64> {
    let mut versions: Vec<i64> = snapshot
        .table(SUBSCRIPTION_SETS_TABLE)
        .map(|table| {
            table
                .objects()
                .filter_map(|(key, _)| match key {
                    ObjKey::Int(v) => Some(*v),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    versions.sort_unstable();
    versions
}

fn active_version(snapshot: &Snapshot) -> i64 {
    let all = versions(snapshot);
    all.iter()
        .rev()
        .copied()
        .find(|&v| read_state(snapshot, v).map(|(s, _)| s) == Some(State::Complete))
        .or_else(|| all.first().copied())
        .unwrap_or(0)
}

fn read_state(snapshot: &Snapshot, version: i64) -> Option<(State, Option<String>)> {
    let obj = snapshot.get_object(SUBSCRIPTION_SETS_TABLE, &ObjKey::Int(version))?;
    let state = obj.get("state").and_then(Value::as_int).and_then(State::from_code)?;
    let error = obj.get("error").and_then(Value::as_str).map(str::to_string);
    Some((state, error))
}

fn read_set(snapshot: &Snapshot, version: i64) -> Option<SetData> {
    let (state, error) = read_state(snapshot, version)?;
    let obj = snapshot.get_object(SUBSCRIPTION_SETS_TABLE, &ObjKey::Int(version))?;
    let snapshot_version = obj
        .get("snapshot_version")
        .and_then(Value::as_int)
        .unwrap_or(0) as u64;
    let subscriptions = obj
        .get("subscriptions")
        .and_then(Value::as_list)
        .unwrap_or(&[])
        .iter()
        .filter_map(Value::as_object)
        .filter_map(Subscription::from_object)
        .collect();
    Some(SetData {
        version,
        state,
        error,
        snapshot_version,
        subscriptions,
    })
}

fn write_set(txn: &mut WriteTransaction<'_>, data: &SetData) -> SyncResult<()> {
    let key = ObjKey::Int(data.version);
    txn.create_object(SUBSCRIPTION_SETS_TABLE, key.clone())?;
    txn.set(SUBSCRIPTION_SETS_TABLE, &key, "state", data.state.to_code())?;
    txn.set(SUBSCRIPTION_SETS_TABLE, &key, "error", data.error.clone())?;
    txn.set(
        SUBSCRIPTION_SETS_TABLE,
        &key,
        "snapshot_version",
        data.snapshot_version as i64,
    )?;
    txn.clear(SUBSCRIPTION_SETS_TABLE, &key, "subscriptions")?;
    for sub in &data.subscriptions {
        txn.list_push(
            SUBSCRIPTION_SETS_TABLE,
            &key,
            "subscriptions",
            Value::Object(sub.to_object()),
        )?;
    }
    Ok(())
}

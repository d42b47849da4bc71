//! The Backend contract (spec §6.2): storage + OT engine + live-query engine,
//! out of scope for this crate but fixed here as the interface the [`Agent`]
//! requires.
//!
//! [`Agent`]: crate::agent::Agent

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::error::BackendError;

/// One operational-transform record: an edit, a create, or a delete,
/// versioned with `(src, seq, v)` (spec §3, the `Op` entity).
#[derive(Debug, Clone, PartialEq)]
pub struct Op {
    /// Collection this op belongs to.
    pub collection: String,
    /// Document this op applies to.
    pub doc_id: String,
    /// Version this op applies at (or the resulting version, depending on
    /// direction of travel). Absent on a fresh create in some protocols.
    pub v: Option<u64>,
    /// Client identifier that originated this op.
    pub src: String,
    /// Per-`src` sequence number.
    pub seq: Option<u64>,
    pub body: OpBody,
    /// Optional, opaque metadata slot. Never inspected by the agent.
    pub m: Option<Value>,
}

/// Exactly one of edit / create / delete, per spec §3.
#[derive(Debug, Clone, PartialEq)]
pub enum OpBody {
    Edit(Value),
    Create(Value),
    Delete,
}

pub type DestroyFn = Box<dyn FnOnce() + Send>;

/// A doc-scoped push source, as returned by [`Backend::subscribe`] /
/// [`Backend::subscribe_bulk`].
///
/// Bundles the event stream with the resource's release hook, matching the
/// spec's requirement that every stream expose an idempotent `destroy()`
/// (§6.2) while staying idiomatic: `destroy` also fires on `Drop`, so a
/// stream dropped without an explicit call still releases its Backend-side
/// resources exactly once.
pub struct DocStream {
    pub events: BoxStream<'static, DocStreamEvent>,
    destroy: Option<DestroyFn>,
}

impl DocStream {
    pub fn new(
        events: BoxStream<'static, DocStreamEvent>,
        destroy: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            events,
            destroy: Some(Box::new(destroy)),
        }
    }

    /// Splits this stream into its pollable half and a standalone destroy
    /// handle, so the events can be driven by a multiplexer while the
    /// destroy capability lives in the agent's bookkeeping map.
    pub fn split(mut self) -> (BoxStream<'static, DocStreamEvent>, Destroyer) {
        let destroy = self.destroy.take();
        let events = std::mem::replace(&mut self.events, Box::pin(futures::stream::empty()));
        (events, Destroyer(destroy))
    }

    pub fn destroy(&mut self) {
        if let Some(d) = self.destroy.take() {
            d();
        }
    }
}

impl Drop for DocStream {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for DocStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocStream").finish_non_exhaustive()
    }
}

/// A standalone destroy capability, split off from a [`DocStream`] or
/// [`QueryEmitter`] once its event stream has been handed to the
/// multiplexer. Idempotent; also fires on `Drop`.
pub struct Destroyer(Option<DestroyFn>);

impl Destroyer {
    pub fn destroy(&mut self) {
        if let Some(d) = self.0.take() {
            d();
        }
    }
}

impl Drop for Destroyer {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// An event delivered on a [`DocStream`] (spec §4.7 step 4).
#[derive(Debug, Clone)]
pub enum DocStreamEvent {
    /// A new op for this document.
    Op {
        op: Op,
        /// The collection this op actually originated from: `i` if the
        /// Backend set it (a projection), else the doc's own collection.
        /// Used for own-op filtering (spec §3 invariant 6, §9 open question).
        source_collection: String,
    },
    /// An asynchronous, non-request-scoped error (spec §7 taxonomy item 4):
    /// logged, never forwarded to the client.
    Error(BackendError),
}

/// A snapshot of a document at some version (the `data`/`v` pair returned by
/// `fetch` and by `subscribe` on initial subscription).
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub v: u64,
    pub data: Value,
}

/// Result of [`Backend::subscribe`].
pub struct SubscribeResult {
    pub stream: DocStream,
    /// `Some` for an initial subscription (no `v` in the request); `None` for
    /// catch-up, in which case missed ops have already been pushed into
    /// `stream`.
    pub snapshot: Option<Snapshot>,
}

/// Result of [`Backend::subscribe_bulk`] for a single collection.
pub struct BulkSubscribeResult {
    pub streams: HashMap<String, DocStream>,
    /// Only doc ids that actually have a snapshot; a doc id present in
    /// `streams` but absent here is a catch-up subscription (sentinel `true`
    /// on the wire, spec §4.6).
    pub snapshots: HashMap<String, Snapshot>,
}

/// Result of [`Backend::submit`]: the op's final version plus any ops the
/// caller missed while the submit was in flight (spec §4.12).
pub struct SubmitResult {
    pub version: u64,
    pub missed_ops: Vec<Op>,
}

/// Caller-supplied context for a live query (spec §4.8's `options`).
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub versions: Option<HashMap<String, u64>>,
    pub db: Option<String>,
}

/// One row of a query result set (spec §4.10).
#[derive(Debug, Clone)]
pub struct QueryResultItem {
    pub id: String,
    pub v: u64,
    pub doc_type: Option<String>,
    pub data: Value,
}

/// An opaque Backend-side handle identifying a live query, round-tripped back
/// to the Backend on resubscribe (spec §6.2).
pub type QueryIndex = Value;

/// One entry of a query's `diff` push (spec §6.1): inserted rows carry
/// `values` transformed the same way as an ordinary result set (spec §4.10).
#[derive(Debug, Clone)]
pub enum DiffEntry {
    Insert {
        index: usize,
        values: Vec<QueryResultItem>,
    },
    Remove {
        index: usize,
        count: usize,
    },
    Move {
        from: usize,
        to: usize,
        count: usize,
    },
}

/// An event delivered on a [`QueryEmitter`] (spec §2: `extra`, `diff`, `op`,
/// `error`).
#[derive(Debug, Clone)]
pub enum QueryEvent {
    Extra(Value),
    Diff(Vec<DiffEntry>),
    /// The underlying doc changed; forwarded through the same op-translation
    /// path as an ordinary doc subscription (spec §4.9).
    Op {
        op: Op,
        source_collection: String,
    },
    Error(BackendError),
}

/// A live-query push source, as returned by [`Backend::query_subscribe`].
pub struct QueryEmitter {
    pub events: BoxStream<'static, QueryEvent>,
    pub index: QueryIndex,
    pub options: QueryOptions,
    destroy: Option<DestroyFn>,
}

impl QueryEmitter {
    pub fn new(
        events: BoxStream<'static, QueryEvent>,
        index: QueryIndex,
        options: QueryOptions,
        destroy: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            events,
            index,
            options,
            destroy: Some(Box::new(destroy)),
        }
    }

    pub fn split(
        mut self,
    ) -> (
        BoxStream<'static, QueryEvent>,
        QueryIndex,
        QueryOptions,
        Destroyer,
    ) {
        let destroy = self.destroy.take();
        let events = std::mem::replace(&mut self.events, Box::pin(futures::stream::empty()));
        (
            events,
            self.index.clone(),
            self.options.clone(),
            Destroyer(destroy),
        )
    }

    pub fn destroy(&mut self) {
        if let Some(d) = self.destroy.take() {
            d();
        }
    }
}

impl Drop for QueryEmitter {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for QueryEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryEmitter").finish_non_exhaustive()
    }
}

/// Result of a one-shot [`Backend::query_fetch`] or the initial part of
/// [`Backend::query_subscribe`].
pub struct QueryResults {
    pub results: Vec<QueryResultItem>,
    pub extra: Option<Value>,
}

/// Identity an [`Agent`](crate::agent::Agent) presents to the Backend: its
/// `client_id` plus anything a real deployment wants attached (auth
/// principal, etc.) — kept minimal here since authentication is out of scope
/// (spec §1).
#[derive(Debug, Clone)]
pub struct AgentHandle {
    pub client_id: String,
}

/// The storage + OT + live-query façade the agent dispatches to (spec §6.2).
/// All operations are scoped by the calling agent's identity.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn subscribe(
        &self,
        agent: &AgentHandle,
        collection: &str,
        doc_id: &str,
        version: Option<u64>,
    ) -> Result<SubscribeResult, BackendError>;

    async fn subscribe_bulk(
        &self,
        agent: &AgentHandle,
        collection: &str,
        versions: HashMap<String, Option<u64>>,
    ) -> Result<BulkSubscribeResult, BackendError>;

    async fn fetch(&self, collection: &str, doc_id: &str) -> Result<Snapshot, BackendError>;

    async fn get_ops(
        &self,
        collection: &str,
        doc_id: &str,
        from: u64,
        to: Option<u64>,
    ) -> Result<Vec<Op>, BackendError>;

    async fn get_ops_bulk(
        &self,
        agent: &AgentHandle,
        collection: &str,
        from: HashMap<String, u64>,
        to: Option<u64>,
    ) -> Result<HashMap<String, Vec<Op>>, BackendError>;

    async fn submit(
        &self,
        agent: &AgentHandle,
        collection: &str,
        doc_id: &str,
        op: Op,
    ) -> Result<SubmitResult, BackendError>;

    async fn query_subscribe(
        &self,
        agent: &AgentHandle,
        collection: &str,
        query: Value,
        options: QueryOptions,
    ) -> Result<(QueryEmitter, QueryResults), BackendError>;

    async fn query_resubscribe(
        &self,
        agent: &AgentHandle,
        index: &QueryIndex,
        collection: &str,
        query: Value,
        options: &QueryOptions,
    ) -> Result<(), BackendError>;

    async fn query_fetch(
        &self,
        agent: &AgentHandle,
        collection: &str,
        query: Value,
        options: QueryOptions,
    ) -> Result<QueryResults, BackendError>;
}

//! The `Agent` actor (spec §4): one per client connection. Owns the message
//! pump, dispatches requests to the [`Backend`], multiplexes every live
//! [`DocStream`]/[`QueryEmitter`] it has installed back onto the connection,
//! and tears everything down on close.
//!
//! The pump follows the shape of `juniper_graphql_ws`'s `Connection`: reads
//! and in-flight work are driven from one `select!` loop, and every push
//! source is folded into a single `SelectAll` so the loop never needs more
//! than one stream to poll.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{self, BoxFuture};
use futures::stream::{self, BoxStream, SelectAll};
use futures::{FutureExt, StreamExt};
use serde_json::{Map, Value};

use crate::backend::{
    AgentHandle, Backend, BulkSubscribeResult, Destroyer, DiffEntry, DocStream, DocStreamEvent, Op,
    OpBody, QueryEmitter, QueryEvent, QueryIndex, QueryOptions, QueryResultItem, QueryResults,
    SubmitResult, SubscribeResult,
};
use crate::config::AgentConfig;
use crate::error::{BackendError, ValidationError};
use crate::transport::{Incoming, MessageStream};
use crate::wire::{ClientRequest, InitMessage, Reply, RequestEnvelope, WireError};

/// "No such query" — not in the wire error table explicitly, numbered in the
/// same 4xxx range as [`BackendError::DUPLICATE_SUBMIT`] and
/// [`ValidationError::CODE`] (spec §4.8's `qresub`, open question).
const NO_SUCH_QUERY: u32 = 4002;

/// Translates a [`Op`] into its wire `op` push shape (spec §4.9).
fn translate_op(op: &Op) -> Reply {
    let mut reply = Reply::new("op")
        .c(op.collection.clone())
        .d(op.doc_id.clone())
        .set("src", op.src.clone())
        .set_opt("seq", op.seq)
        .set_opt("v", op.v);
    reply = match &op.body {
        OpBody::Edit(v) => reply.set("op", v.clone()),
        OpBody::Create(v) => reply.set("create", v.clone()),
        OpBody::Delete => reply.set("del", true),
    };
    reply
}

/// Translates a query's diff entries into their wire shape (spec §6.1).
fn translate_diff(entries: Vec<DiffEntry>) -> Vec<Value> {
    entries
        .into_iter()
        .map(|entry| match entry {
            DiffEntry::Insert { index, values } => {
                let values = build_query_data(&values, None);
                serde_json::json!({"type": "insert", "index": index, "values": values})
            }
            DiffEntry::Remove { index, count } => {
                serde_json::json!({"type": "remove", "index": index, "count": count})
            }
            DiffEntry::Move { from, to, count } => {
                serde_json::json!({"type": "move", "from": from, "to": to, "count": count})
            }
        })
        .collect()
}

/// Builds the `data` array for a query result set (spec §4.10): `data` is
/// omitted for a row the client already has at the reported version, and
/// `type` is omitted when it's unchanged from the previous row (run-length
/// compression over doc type).
fn build_query_data(
    results: &[QueryResultItem],
    versions: Option<&HashMap<String, u64>>,
) -> Vec<Value> {
    let mut out = Vec::with_capacity(results.len());
    let mut prev_type: Option<&String> = None;
    for r in results {
        let mut obj = Map::new();
        obj.insert("d".into(), Value::String(r.id.clone()));
        obj.insert("v".into(), Value::from(r.v));
        let has_known_version = versions.is_some_and(|m| m.contains_key(&r.id));
        if !has_known_version {
            obj.insert("data".into(), r.data.clone());
        }
        if prev_type != r.doc_type.as_ref() {
            if let Some(t) = &r.doc_type {
                obj.insert("type".into(), Value::String(t.clone()));
            }
        }
        prev_type = r.doc_type.as_ref();
        out.push(Value::Object(obj));
    }
    out
}

/// Builds the `from` map for a catch-up `getOpsBulk` call (spec §4.10): one
/// entry per row whose reported version is newer than what the client holds.
fn build_ops_request(
    results: &[QueryResultItem],
    versions: &HashMap<String, u64>,
) -> HashMap<String, u64> {
    let mut req = HashMap::new();
    for r in results {
        if let Some(&known) = versions.get(&r.id) {
            if r.v > known {
                req.insert(r.id.clone(), known);
            }
        }
    }
    req
}

/// A side effect produced by a request handler, applied back onto the
/// [`Agent`] by the pump loop (never by the handler itself, which runs
/// concurrently with other in-flight requests and must not hold `&mut Agent`
/// across an `await`).
enum Effect {
    Send(Reply),
    InstallDoc {
        collection: String,
        doc_id: String,
        stream: DocStream,
    },
    InstallQuery {
        id: u64,
        collection: String,
        emitter: QueryEmitter,
    },
}

/// What the pump does with the next complete request: synchronous
/// bookkeeping (no Backend call, e.g. `unsub`) runs immediately and produces
/// effects directly; everything else becomes a future joining the in-flight
/// set.
enum Dispatch {
    Effects(Vec<Effect>),
    Spawn(BoxFuture<'static, Vec<Effect>>),
}

/// An event folded from one of the agent's installed push sources.
enum MuxEvent {
    Doc {
        collection: String,
        event: DocStreamEvent,
    },
    DocEnd {
        collection: String,
        doc_id: String,
    },
    Query {
        id: u64,
        event: QueryEvent,
    },
    QueryEnd {
        id: u64,
    },
}

struct SubQuery {
    destroyer: Destroyer,
    index: QueryIndex,
    options: QueryOptions,
    collection: String,
}

/// One client connection's session state (spec §3's `Agent` entity).
pub struct Agent<B: Backend + 'static> {
    client_id: String,
    backend: Arc<B>,
    config: AgentConfig,
    closed: bool,
    subscribed_docs: HashMap<String, HashMap<String, Destroyer>>,
    subscribed_queries: HashMap<u64, SubQuery>,
    mux: SelectAll<BoxStream<'static, MuxEvent>>,
}

impl<B: Backend + 'static> Agent<B> {
    pub fn new(backend: Arc<B>, config: AgentConfig) -> Self {
        Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            backend,
            config,
            closed: false,
            subscribed_docs: HashMap::new(),
            subscribed_queries: HashMap::new(),
            mux: SelectAll::new(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Runs the agent to completion: sends `init`, then pumps messages,
    /// in-flight requests, and installed streams until the transport closes
    /// or a fatal error occurs, then runs cleanup (spec §4.13).
    pub async fn run(self, transport: impl MessageStream) {
        self.run_until(transport, future::pending()).await;
    }

    /// Like [`Agent::run`], but also closes the agent as soon as `shutdown`
    /// resolves — the hook a server uses to tear down every live agent
    /// together (spec §4.13 describes per-connection close; a server-wide
    /// shutdown just fires this for all of them at once).
    pub async fn run_until(
        mut self,
        mut transport: impl MessageStream,
        shutdown: impl std::future::Future<Output = ()> + Send,
    ) {
        let init = InitMessage::new(self.client_id.clone());
        if transport
            .send(serde_json::to_value(&init).expect("InitMessage always serializes"))
            .await
            .is_err()
        {
            self.cleanup();
            return;
        }

        let mut in_flight: futures::stream::FuturesUnordered<BoxFuture<'static, Vec<Effect>>> =
            futures::stream::FuturesUnordered::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown, if !self.closed => {
                    self.closed = true;
                }
                incoming = transport.recv(), if !self.closed => {
                    match incoming {
                        None => self.closed = true,
                        Some(msg) => {
                            self.handle_incoming(&mut transport, msg, &mut in_flight).await;
                        }
                    }
                }
                // Already-pending Backend calls are finite (one per client
                // request) and are left to drain even after close, so a
                // stream/emitter they hand back still gets the
                // already-closed treatment in `install_doc`/`install_query`
                // instead of leaking. A *subscribed* stream, on the other
                // hand, normally only ends when the Backend decides to, not
                // when the client disconnects — so once closed, stop waiting
                // on it; `cleanup` below destroys it synchronously instead
                // (spec §5 "Cancellation", §3 invariant 2).
                Some(effects) = in_flight.next(), if !in_flight.is_empty() => {
                    self.apply_effects(&mut transport, effects).await;
                }
                Some(event) = self.mux.next(), if !self.closed && !self.mux.is_empty() => {
                    self.handle_mux_event(&mut transport, event).await;
                }
                else => break,
            }
        }

        self.cleanup();
    }

    async fn handle_incoming(
        &mut self,
        transport: &mut impl MessageStream,
        msg: Incoming,
        in_flight: &mut futures::stream::FuturesUnordered<BoxFuture<'static, Vec<Effect>>>,
    ) {
        let value = match msg {
            Incoming::Parsed(v) => v,
            Incoming::Text(text) => match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(client_id = %self.client_id, error = %e, "malformed JSON frame; closing");
                    transport.close_with_error(e.to_string()).await;
                    self.closed = true;
                    return;
                }
            },
        };

        let envelope: RequestEnvelope = serde_json::from_value(value.clone()).unwrap_or_default();

        match serde_json::from_value::<ClientRequest>(value) {
            Err(e) => {
                let err = ValidationError::new(e.to_string()).into_backend_error();
                let mut reply = Reply::new(envelope.a.unwrap_or_else(|| "unknown".to_string()))
                    .error(WireError::from(&err));
                if let Some(c) = envelope.c {
                    reply = reply.c(c);
                }
                if let Some(d) = envelope.d {
                    reply = reply.d(d);
                }
                if let Some(id) = envelope.id {
                    reply = reply.id(id);
                }
                self.send(transport, reply).await;
            }
            Ok(req) => {
                if self.config.max_in_flight_requests > 0
                    && in_flight.len() >= self.config.max_in_flight_requests
                {
                    let err =
                        ValidationError::new("too many in-flight requests").into_backend_error();
                    let reply = req.error_reply(WireError::from(&err));
                    self.send(transport, reply).await;
                    return;
                }
                match self.dispatch(req) {
                    Dispatch::Effects(effects) => self.apply_effects(transport, effects).await,
                    Dispatch::Spawn(fut) => in_flight.push(fut),
                }
            }
        }
    }

    fn dispatch(&mut self, req: ClientRequest) -> Dispatch {
        let agent = AgentHandle {
            client_id: self.client_id.clone(),
        };
        let backend = self.backend.clone();
        match req {
            ClientRequest::Sub { c, d, v } => {
                Dispatch::Spawn(handle_sub(backend, agent, c, d, v).boxed())
            }
            ClientRequest::Unsub { c, d } => {
                if let Some(docs) = self.subscribed_docs.get_mut(&c) {
                    if let Some(mut destroyer) = docs.remove(&d) {
                        destroyer.destroy();
                    }
                    if docs.is_empty() {
                        self.subscribed_docs.remove(&c);
                    }
                }
                Dispatch::Effects(vec![Effect::Send(Reply::new("unsub").c(c).d(d))])
            }
            ClientRequest::Fetch { c, d, v } => {
                Dispatch::Spawn(handle_fetch(backend, c, d, v).boxed())
            }
            ClientRequest::BulkSub { s } => {
                Dispatch::Spawn(handle_bulk_sub(backend, agent, s).boxed())
            }
            ClientRequest::Submit {
                c,
                d,
                v,
                src,
                seq,
                op,
                create,
                del,
            } => Dispatch::Spawn(
                handle_submit(
                    backend,
                    agent,
                    SubmitRequest {
                        c,
                        d,
                        v,
                        src,
                        seq,
                        op,
                        create,
                        del,
                    },
                )
                .boxed(),
            ),
            ClientRequest::QSub { id, c, q, vs, db } => {
                Dispatch::Spawn(handle_qsub(backend, agent, id, c, q, vs, db).boxed())
            }
            ClientRequest::QResub { id, q } => match self.subscribed_queries.get(&id) {
                None => {
                    let err = BackendError::new(NO_SUCH_QUERY, "Can not find query to resubscribe");
                    Dispatch::Effects(vec![Effect::Send(
                        Reply::new("qresub")
                            .id(Value::from(id))
                            .error(WireError::from(&err)),
                    )])
                }
                Some(sq) => {
                    let index = sq.index.clone();
                    let options = sq.options.clone();
                    let collection = sq.collection.clone();
                    Dispatch::Spawn(
                        handle_qresub(backend, agent, id, q, index, collection, options).boxed(),
                    )
                }
            },
            ClientRequest::QUnsub { id } => {
                if let Some(mut sq) = self.subscribed_queries.remove(&id) {
                    sq.destroyer.destroy();
                }
                Dispatch::Effects(vec![Effect::Send(Reply::new("qunsub").id(Value::from(id)))])
            }
            ClientRequest::QFetch { id, c, q, vs, db } => {
                Dispatch::Spawn(handle_qfetch(backend, agent, id, c, q, vs, db).boxed())
            }
        }
    }

    async fn apply_effects(&mut self, transport: &mut impl MessageStream, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send(reply) => self.send(transport, reply).await,
                Effect::InstallDoc {
                    collection,
                    doc_id,
                    stream,
                } => self.install_doc(collection, doc_id, stream),
                Effect::InstallQuery {
                    id,
                    collection,
                    emitter,
                } => self.install_query(id, collection, emitter),
            }
        }
    }

    async fn send(&mut self, transport: &mut impl MessageStream, reply: Reply) {
        if self.closed {
            return;
        }
        let value = serde_json::to_value(&reply).expect("Reply always serializes");
        if let Err(e) = transport.send(value).await {
            tracing::warn!(client_id = %self.client_id, error = %e, "send failed; closing agent");
            self.closed = true;
        }
    }

    /// Installs a subscribed [`DocStream`] (spec §4.7): replaces any prior
    /// stream for the same `(collection, doc_id)`, splits the stream so its
    /// events join the multiplexer while its destroy handle joins
    /// bookkeeping, tagging each event with an explicit end marker so the
    /// mux loop notices when the stream naturally ends.
    fn install_doc(&mut self, collection: String, doc_id: String, mut stream: DocStream) {
        if self.closed {
            stream.destroy();
            return;
        }
        if let Some(docs) = self.subscribed_docs.get_mut(&collection) {
            if let Some(mut prior) = docs.remove(&doc_id) {
                prior.destroy();
            }
        }
        let (events, destroyer) = stream.split();
        self.subscribed_docs
            .entry(collection.clone())
            .or_default()
            .insert(doc_id.clone(), destroyer);

        let tag_collection = collection.clone();
        let tagged = events
            .map(move |event| MuxEvent::Doc {
                collection: tag_collection.clone(),
                event,
            })
            .chain(stream::once(future::ready(MuxEvent::DocEnd {
                collection,
                doc_id,
            })))
            .boxed();
        self.mux.push(tagged);
    }

    fn install_query(&mut self, id: u64, collection: String, mut emitter: QueryEmitter) {
        if self.closed {
            emitter.destroy();
            return;
        }
        if let Some(mut prior) = self.subscribed_queries.remove(&id) {
            prior.destroyer.destroy();
        }
        let (events, index, options, destroyer) = emitter.split();
        self.subscribed_queries.insert(
            id,
            SubQuery {
                destroyer,
                index,
                options,
                collection,
            },
        );
        let tagged = events
            .map(move |event| MuxEvent::Query { id, event })
            .chain(stream::once(future::ready(MuxEvent::QueryEnd { id })))
            .boxed();
        self.mux.push(tagged);
    }

    async fn handle_mux_event(&mut self, transport: &mut impl MessageStream, event: MuxEvent) {
        match event {
            MuxEvent::Doc { collection, event } => match event {
                DocStreamEvent::Error(e) => {
                    tracing::warn!(client_id = %self.client_id, collection = %collection, error = %e, "doc stream error");
                }
                DocStreamEvent::Op {
                    op,
                    source_collection,
                } => {
                    if !(op.src == self.client_id && source_collection == collection) {
                        self.send(transport, translate_op(&op)).await;
                    }
                }
            },
            MuxEvent::DocEnd { collection, doc_id } => {
                if let Some(docs) = self.subscribed_docs.get_mut(&collection) {
                    docs.remove(&doc_id);
                    if docs.is_empty() {
                        self.subscribed_docs.remove(&collection);
                    }
                }
            }
            MuxEvent::Query { id, event } => self.handle_query_event(transport, id, event).await,
            MuxEvent::QueryEnd { id } => {
                self.subscribed_queries.remove(&id);
            }
        }
    }

    async fn handle_query_event(
        &mut self,
        transport: &mut impl MessageStream,
        id: u64,
        event: QueryEvent,
    ) {
        match event {
            QueryEvent::Error(e) => {
                tracing::warn!(client_id = %self.client_id, query_id = id, error = %e, "query stream error");
            }
            QueryEvent::Extra(extra) => {
                self.send(
                    transport,
                    Reply::new("q").id(Value::from(id)).set("extra", extra),
                )
                .await;
            }
            QueryEvent::Diff(entries) => {
                let diff = translate_diff(entries);
                self.send(
                    transport,
                    Reply::new("q")
                        .id(Value::from(id))
                        .set("diff", Value::Array(diff)),
                )
                .await;
            }
            QueryEvent::Op {
                op,
                source_collection,
            } => {
                let collection = self
                    .subscribed_queries
                    .get(&id)
                    .map(|sq| sq.collection.clone());
                let is_own =
                    op.src == self.client_id && Some(&source_collection) == collection.as_ref();
                if !is_own {
                    self.send(transport, translate_op(&op)).await;
                }
            }
        }
    }

    /// Tears down every installed stream and query emitter (spec §4.13);
    /// idempotent via [`Destroyer`], safe to call even if nothing was ever
    /// installed.
    fn cleanup(&mut self) {
        self.closed = true;
        for (_, docs) in self.subscribed_docs.drain() {
            for (_, mut destroyer) in docs {
                destroyer.destroy();
            }
        }
        for (_, mut sq) in self.subscribed_queries.drain() {
            sq.destroyer.destroy();
        }
    }
}

async fn handle_sub(
    backend: Arc<dyn Backend>,
    agent: AgentHandle,
    c: String,
    d: String,
    v: Option<u64>,
) -> Vec<Effect> {
    match backend.subscribe(&agent, &c, &d, v).await {
        Err(e) => vec![Effect::Send(
            Reply::new("sub").c(c).d(d).error(WireError::from(&e)),
        )],
        Ok(SubscribeResult { stream, snapshot }) => {
            let mut reply = Reply::new("sub").c(c.clone()).d(d.clone());
            if let Some(snap) = snapshot {
                reply = reply.set("v", snap.v).set("data", snap.data);
            }
            vec![
                Effect::InstallDoc {
                    collection: c,
                    doc_id: d,
                    stream,
                },
                Effect::Send(reply),
            ]
        }
    }
}

async fn handle_fetch(
    backend: Arc<dyn Backend>,
    c: String,
    d: String,
    v: Option<u64>,
) -> Vec<Effect> {
    match v {
        None => match backend.fetch(&c, &d).await {
            Ok(snap) => vec![Effect::Send(
                Reply::new("fetch")
                    .c(c)
                    .d(d)
                    .set("v", snap.v)
                    .set("data", snap.data),
            )],
            Err(e) => vec![Effect::Send(
                Reply::new("fetch").c(c).d(d).error(WireError::from(&e)),
            )],
        },
        Some(from) => match backend.get_ops(&c, &d, from, None).await {
            Ok(ops) => {
                let mut effects: Vec<Effect> = ops
                    .iter()
                    .map(|op| Effect::Send(translate_op(op)))
                    .collect();
                effects.push(Effect::Send(Reply::new("fetch").c(c).d(d)));
                effects
            }
            Err(e) => vec![Effect::Send(
                Reply::new("fetch").c(c).d(d).error(WireError::from(&e)),
            )],
        },
    }
}

/// Runs one `subscribeBulk` call per named collection concurrently. If any
/// collection errors, every stream obtained from a collection that *did*
/// succeed is destroyed unopened — none of them was ever installed into the
/// agent's bookkeeping, so there's nothing to roll back there, only the
/// Backend-side resources to release (spec §4.6's partial-failure sweep).
async fn handle_bulk_sub(
    backend: Arc<dyn Backend>,
    agent: AgentHandle,
    s: HashMap<String, HashMap<String, Option<u64>>>,
) -> Vec<Effect> {
    let futs = s.into_iter().map(|(collection, versions)| {
        let backend = backend.clone();
        let agent = agent.clone();
        async move {
            let result = backend.subscribe_bulk(&agent, &collection, versions).await;
            (collection, result)
        }
    });
    let mut results: Vec<(String, Result<BulkSubscribeResult, BackendError>)> =
        future::join_all(futs).await;

    if let Some(err) = results.iter().find_map(|(_, r)| r.as_ref().err().cloned()) {
        for (_, result) in results.drain(..) {
            if let Ok(mut bulk) = result {
                for (_, mut stream) in bulk.streams.drain() {
                    stream.destroy();
                }
            }
        }
        return vec![Effect::Send(Reply::new("bs").error(WireError::from(&err)))];
    }

    let mut effects = Vec::new();
    let mut s_field = Map::new();
    for (collection, result) in results {
        let BulkSubscribeResult {
            mut streams,
            mut snapshots,
        } = result.expect("no collection errored, checked above");
        let mut per_collection = Map::new();
        let doc_ids: Vec<String> = streams.keys().cloned().collect();
        for doc_id in doc_ids {
            let stream = streams.remove(&doc_id).expect("key came from this map");
            let value = match snapshots.remove(&doc_id) {
                Some(snap) => serde_json::json!({"v": snap.v, "data": snap.data}),
                None => Value::Bool(true),
            };
            per_collection.insert(doc_id.clone(), value);
            effects.push(Effect::InstallDoc {
                collection: collection.clone(),
                doc_id,
                stream,
            });
        }
        s_field.insert(collection, Value::Object(per_collection));
    }
    effects.push(Effect::Send(
        Reply::new("bs").set("s", Value::Object(s_field)),
    ));
    effects
}

/// Request fields for `op` (spec §4.12), grouped to keep the handler's
/// signature down to one request argument.
struct SubmitRequest {
    c: String,
    d: String,
    v: Option<u64>,
    src: Option<String>,
    seq: Option<u64>,
    op: Option<Value>,
    create: Option<Value>,
    del: Option<bool>,
}

async fn handle_submit(
    backend: Arc<dyn Backend>,
    agent: AgentHandle,
    req: SubmitRequest,
) -> Vec<Effect> {
    let SubmitRequest {
        c,
        d,
        v,
        src,
        seq,
        op,
        create,
        del,
    } = req;
    let src = src.unwrap_or_else(|| agent.client_id.clone());
    let body = match (op, create, del) {
        (Some(edit), None, None) => OpBody::Edit(edit),
        (None, Some(create), None) => OpBody::Create(create),
        (None, None, Some(true)) => OpBody::Delete,
        _ => {
            let err = ValidationError::new("exactly one of op/create/del must be present")
                .into_backend_error();
            return vec![Effect::Send(
                Reply::new("op").c(c).d(d).error(WireError::from(&err)),
            )];
        }
    };
    let wire_op = Op {
        collection: c.clone(),
        doc_id: d.clone(),
        v,
        src: src.clone(),
        seq,
        body,
        m: None,
    };
    match backend.submit(&agent, &c, &d, wire_op).await {
        Ok(SubmitResult {
            version,
            missed_ops,
        }) => {
            let mut effects: Vec<Effect> = missed_ops
                .iter()
                .map(|op| Effect::Send(translate_op(op)))
                .collect();
            effects.push(Effect::Send(
                Reply::new("op")
                    .c(c)
                    .d(d)
                    .set("src", src)
                    .set_opt("seq", seq)
                    .set("v", version),
            ));
            effects
        }
        // Duplicate submit after a reconnect: treat as success, acking with
        // the version the client itself proposed (spec §4.12).
        Err(e) if e.is_duplicate_submit() => vec![Effect::Send(
            Reply::new("op")
                .c(c)
                .d(d)
                .set("src", src)
                .set_opt("seq", seq)
                .set_opt("v", v),
        )],
        Err(e) => vec![Effect::Send(
            Reply::new("op").c(c).d(d).error(WireError::from(&e)),
        )],
    }
}

/// Shared tail of `qsub`/`qfetch` (spec §4.10): fetches catch-up ops for any
/// row the client is behind on, then builds the `q` reply. A `getOpsBulk`
/// failure here is logged and otherwise swallowed — it isn't attributable to
/// a single client-facing field, the same call as any other stream-level
/// Backend error (spec §7 taxonomy item 4).
async fn finish_query_results(
    backend: &Arc<dyn Backend>,
    agent: &AgentHandle,
    c: &str,
    vs: &Option<HashMap<String, u64>>,
    results: QueryResults,
) -> (Vec<Effect>, Reply) {
    let mut effects = Vec::new();
    if let Some(versions) = vs {
        let ops_req = build_ops_request(&results.results, versions);
        if !ops_req.is_empty() {
            match backend.get_ops_bulk(agent, c, ops_req, None).await {
                Ok(ops_by_doc) => {
                    for (_, ops) in ops_by_doc {
                        for op in &ops {
                            effects.push(Effect::Send(translate_op(op)));
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(client_id = %agent.client_id, collection = %c, error = %e, "catch-up getOpsBulk failed");
                }
            }
        }
    }
    let data = build_query_data(&results.results, vs.as_ref());
    let reply = Reply::new("q")
        .set("data", Value::Array(data))
        .set("extra", results.extra.unwrap_or(Value::Null));
    (effects, reply)
}

async fn handle_qsub(
    backend: Arc<dyn Backend>,
    agent: AgentHandle,
    id: u64,
    c: String,
    q: Value,
    vs: Option<HashMap<String, u64>>,
    db: Option<String>,
) -> Vec<Effect> {
    let options = QueryOptions {
        versions: vs.clone(),
        db,
    };
    match backend.query_subscribe(&agent, &c, q, options).await {
        Err(e) => vec![Effect::Send(
            Reply::new("q")
                .id(Value::from(id))
                .error(WireError::from(&e)),
        )],
        Ok((emitter, results)) => {
            let (ops_effects, reply) =
                finish_query_results(&backend, &agent, &c, &vs, results).await;
            let mut effects = vec![Effect::InstallQuery {
                id,
                collection: c,
                emitter,
            }];
            effects.extend(ops_effects);
            effects.push(Effect::Send(reply.id(Value::from(id))));
            effects
        }
    }
}

async fn handle_qresub(
    backend: Arc<dyn Backend>,
    agent: AgentHandle,
    id: u64,
    q: Value,
    index: QueryIndex,
    collection: String,
    options: QueryOptions,
) -> Vec<Effect> {
    match backend
        .query_resubscribe(&agent, &index, &collection, q, &options)
        .await
    {
        Ok(()) => vec![Effect::Send(Reply::new("qresub").id(Value::from(id)))],
        Err(e) => vec![Effect::Send(
            Reply::new("qresub")
                .id(Value::from(id))
                .error(WireError::from(&e)),
        )],
    }
}

async fn handle_qfetch(
    backend: Arc<dyn Backend>,
    agent: AgentHandle,
    id: u64,
    c: String,
    q: Value,
    vs: Option<HashMap<String, u64>>,
    db: Option<String>,
) -> Vec<Effect> {
    let options = QueryOptions {
        versions: vs.clone(),
        db,
    };
    match backend.query_fetch(&agent, &c, q, options).await {
        Err(e) => vec![Effect::Send(
            Reply::new("q")
                .id(Value::from(id))
                .error(WireError::from(&e)),
        )],
        Ok(results) => {
            let (mut effects, reply) =
                finish_query_results(&backend, &agent, &c, &vs, results).await;
            effects.push(Effect::Send(reply.id(Value::from(id))));
            effects
        }
    }
}

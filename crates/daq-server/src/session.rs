//! Delta-synchronised sessions.
//!
//! A [`SyncSession`] mirrors one block (or one field of a block) for the
//! clients of a channel. It subscribes to the controller in delta mode and
//! keeps a snapshot that is patched with every change set:
//!
//! ```text
//!   Unopened ──root update──► Open ──disconnect / unit gone──► Closed
//!                              │ ▲
//!                              └─┘ delete, missing segment or shape change:
//!                                  Close, re-read the block, Open again
//! ```
//!
//! Every change set is forwarded to the sink as exactly one `Update`, so the
//! batching of the controller is what clients see. Structural changes are
//! never patched in: the session re-reads the authoritative tree through the
//! controller and reopens with a fresh snapshot and put-path set.
//!
//! The controller always starts a delta subscription with a root update. A
//! first change set of any other shape is not trusted: the session reads
//! the block through the controller and opens from that instead.
//!
//! Phase, snapshot and put-path set live under one lock. Connect and
//! disconnect run on the controller's serialized context, bounded by a
//! timeout. A disconnect that times out still closes the session and tells
//! the sink; the timeout is returned to the caller.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use daq_core::changes::{apply_change, split_dotted, value_at, with_parents, Change};
use daq_core::error::{AppResult, DaqError};
use daq_core::model::{typeid, Field};
use daq_core::request::{Response, ResponseReceiver};
use daq_core::{Controller, SubscriptionHandle};

use crate::error_mapping::{BoundaryFault, DaqResultExt};

/// Key an unpacked single return value is wrapped under.
pub const RETURN_KEY: &str = "return";

/// Life-cycle phase of a session. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPhase {
    Unopened,
    Open,
    Closed,
}

/// What a session pushes to its channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum SessionEvent {
    /// Full snapshot; any previous view is void.
    Open {
        /// Serialized block or field.
        snapshot: Value,
    },
    /// One change set, to be applied atomically.
    Update {
        /// Changes relative to the snapshot root.
        changes: Vec<Change>,
    },
    /// The view is gone until the next `Open`.
    Close,
}

/// Receiver of session events, implemented by the boundary adapter.
pub trait ChannelSink: Send + Sync {
    /// Push one event. Must not block.
    fn send(&self, event: SessionEvent);
}

/// An inbound method call.
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    /// Self-describing request: target path plus query-style parameters.
    /// The path may start with the MRI.
    Explicit {
        /// Target method path.
        path: Vec<String>,
        /// Call parameters.
        query: Map<String, Value>,
    },
    /// Target known from the channel (a field-scoped session); the whole
    /// payload is the parameter record.
    Implicit {
        /// Call parameters.
        parameters: Map<String, Value>,
    },
}

struct SessionState {
    phase: SessionPhase,
    snapshot: Value,
    put_paths: BTreeSet<String>,
    subscription: Option<SubscriptionHandle>,
    pump: Option<JoinHandle<()>>,
}

/// Per-channel mirror of a block or a field.
pub struct SyncSession {
    id: Uuid,
    controller: Arc<Controller>,
    field: Option<String>,
    sink: Arc<dyn ChannelSink>,
    lifecycle_timeout: Duration,
    state: Mutex<SessionState>,
}

impl SyncSession {
    /// Unopened session on `controller`, scoped to `field` if given.
    pub fn new(
        controller: Arc<Controller>,
        field: Option<String>,
        sink: Arc<dyn ChannelSink>,
        lifecycle_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            controller,
            field,
            sink,
            lifecycle_timeout,
            state: Mutex::new(SessionState {
                phase: SessionPhase::Unopened,
                snapshot: Value::Null,
                put_paths: BTreeSet::new(),
                subscription: None,
                pump: None,
            }),
        })
    }

    /// Session id, used in logs.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// `mri` or `mri.field`.
    pub fn channel_name(&self) -> String {
        match &self.field {
            Some(field) => format!("{}.{field}", self.controller.mri()),
            None => self.controller.mri().to_string(),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        self.state.lock().phase
    }

    /// Mirrored snapshot, if open.
    pub fn snapshot(&self) -> Option<Value> {
        let state = self.state.lock();
        (state.phase == SessionPhase::Open).then(|| state.snapshot.clone())
    }

    /// Dotted paths an external write may target.
    pub fn put_paths(&self) -> BTreeSet<String> {
        self.state.lock().put_paths.clone()
    }

    fn path(&self) -> Vec<String> {
        self.field.iter().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Connection lifecycle
    // -------------------------------------------------------------------------

    /// Subscribe to the controller in delta mode. The first change set
    /// delivered opens the session.
    #[instrument(skip(self), fields(session = %self.id, channel = %self.channel_name()), err)]
    pub async fn connect(self: &Arc<Self>) -> AppResult<()> {
        {
            let state = self.state.lock();
            if state.phase == SessionPhase::Closed {
                return Err(DaqError::InvalidTransition {
                    from: "Closed".into(),
                    to: "Open".into(),
                });
            }
            if state.subscription.is_some() {
                return Ok(());
            }
        }
        let this = Arc::clone(self);
        self.controller
            .run_in_context("session connect", self.lifecycle_timeout, async move {
                this.subscribe()
            })
            .await
    }

    fn subscribe(self: &Arc<Self>) -> AppResult<()> {
        let (handle, responses) = self.controller.subscribe(&self.path(), true)?.into_parts();
        let pump = tokio::spawn(pump(Arc::downgrade(self), responses));
        let mut state = self.state.lock();
        state.subscription = Some(handle);
        state.pump = Some(pump);
        debug!(session = %self.id, "Session subscribed");
        Ok(())
    }

    /// Last client gone: close the channel and unsubscribe, bounded by the
    /// lifecycle timeout.
    pub async fn disconnect(self: &Arc<Self>) -> AppResult<()> {
        self.disconnect_within(self.lifecycle_timeout).await
    }

    /// [`SyncSession::disconnect`] with an explicit bound. A no-op on a
    /// session that is already closed and unsubscribed.
    #[instrument(skip(self), fields(session = %self.id, channel = %self.channel_name()), err)]
    pub async fn disconnect_within(self: &Arc<Self>, limit: Duration) -> AppResult<()> {
        {
            let state = self.state.lock();
            if state.phase == SessionPhase::Closed && state.subscription.is_none() {
                return Ok(());
            }
        }
        let this = Arc::clone(self);
        let result = self
            .controller
            .run_in_context("session disconnect", limit, async move {
                this.teardown();
                Ok(())
            })
            .await;
        if let Err(err) = result {
            // The subscription stays for a later disconnect (or drop) to end.
            warn!(session = %self.id, error = %err, "Disconnect did not complete, closing anyway");
            let mut state = self.state.lock();
            self.close_locked(&mut state);
            return Err(err);
        }
        info!(session = %self.id, "Session closed");
        Ok(())
    }

    fn teardown(&self) {
        let mut state = self.state.lock();
        self.close_locked(&mut state);
        if let Some(handle) = state.subscription.take() {
            handle.unsubscribe();
        }
        // The pump ends on the terminal Return of the unsubscribe.
        state.pump.take();
    }

    fn close_locked(&self, state: &mut SessionState) {
        if state.phase == SessionPhase::Open {
            self.sink.send(SessionEvent::Close);
        }
        state.phase = SessionPhase::Closed;
        state.put_paths.clear();
        state.snapshot = Value::Null;
    }

    // -------------------------------------------------------------------------
    // Change sets
    // -------------------------------------------------------------------------

    fn handle_changes(&self, changes: Vec<Change>) {
        let mut state = self.state.lock();
        let phase = state.phase;
        match phase {
            SessionPhase::Closed => {
                debug!(session = %self.id, "Dropping change set for closed session");
            }
            SessionPhase::Unopened => match changes.as_slice() {
                [Change::Update { path, value }] if path.is_empty() => {
                    let snapshot = value.clone();
                    self.open(&mut state, snapshot);
                }
                _ => {
                    warn!(session = %self.id, "First change set is not a root update");
                    self.rebuild(&mut state);
                }
            },
            SessionPhase::Open => {
                // A failed batch is thrown away by the rebuild, so patch in place.
                let failed = changes
                    .iter()
                    .find_map(|change| apply_change(&mut state.snapshot, change).err());
                match failed {
                    None => self.sink.send(SessionEvent::Update { changes }),
                    Some(reason) => {
                        debug!(session = %self.id, ?reason, "Structural change");
                        self.rebuild(&mut state);
                    }
                }
            }
        }
    }

    fn open(&self, state: &mut SessionState, snapshot: Value) {
        state.put_paths = put_paths_for(&snapshot, self.field.is_some());
        state.snapshot = snapshot.clone();
        state.phase = SessionPhase::Open;
        debug!(session = %self.id, put_paths = ?state.put_paths, "Session open");
        self.sink.send(SessionEvent::Open { snapshot });
    }

    fn rebuild(&self, state: &mut SessionState) {
        match self.controller.get(&self.path()) {
            Ok(fresh) => {
                info!(session = %self.id, channel = %self.channel_name(), "Rebuilding session");
                if state.phase == SessionPhase::Open {
                    self.sink.send(SessionEvent::Close);
                }
                self.open(state, fresh);
            }
            Err(err) => {
                warn!(session = %self.id, error = %err, "Cannot rebuild session, closing");
                self.close_locked(state);
            }
        }
    }

    fn unit_gone(&self, reason: &str) {
        let mut state = self.state.lock();
        warn!(session = %self.id, reason, "Subscription ended by the unit");
        self.close_locked(&mut state);
        state.subscription = None;
    }

    // -------------------------------------------------------------------------
    // Put and RPC
    // -------------------------------------------------------------------------

    /// Forward a client's partial update to the controller.
    ///
    /// `update` is a tree in snapshot coordinates holding only what the client
    /// touched, e.g. `{"value": {"value": 7}}` for a block session or
    /// `{"value": 7}` for a field session.
    #[instrument(skip(self, update), fields(session = %self.id), err)]
    pub async fn put(&self, update: &Value) -> AppResult<()> {
        let (relative, value) = {
            let state = self.state.lock();
            if state.phase != SessionPhase::Open {
                return Err(DaqError::NotWritable(format!(
                    "session on {} is not open",
                    self.channel_name()
                )));
            }
            let relative = resolve_put_path(&leaf_paths(update), &state.put_paths)?;
            let value = value_at(update, &relative)
                .cloned()
                .ok_or_else(|| DaqError::AmbiguousPut(format!("no value at {}", relative.join("."))))?;
            (relative, value)
        };
        let mut path = self.path();
        path.extend(relative);
        self.controller.put(&path, value).await?;
        Ok(())
    }

    /// Invoke a method. Failures come back stringified.
    pub async fn rpc(&self, invocation: Invocation) -> Result<Value, BoundaryFault> {
        self.invoke(invocation).await.map_daq_err()
    }

    #[instrument(skip(self, invocation), fields(session = %self.id), err)]
    async fn invoke(&self, invocation: Invocation) -> AppResult<Value> {
        let (path, parameters) = match invocation {
            Invocation::Explicit { path, query } => (self.explicit_target(path), query),
            Invocation::Implicit { parameters } => (self.path(), parameters),
        };
        let target = || format!("{}.{}", self.controller.mri(), path.join("."));
        if path.is_empty() {
            return Err(DaqError::NotInvocable(target()));
        }
        let unpacked = self.controller.with_block(|b| match b.resolve(&path) {
            Some(Field::Method(method)) => Ok(method.is_return_unpacked()),
            _ => Err(DaqError::NotInvocable(target())),
        })?;
        let returned = self.controller.post(&path, parameters).await?;
        if unpacked {
            Ok(json!({ RETURN_KEY: returned }))
        } else {
            Ok(returned)
        }
    }

    fn explicit_target(&self, path: Vec<String>) -> Vec<String> {
        let path = match path.split_first() {
            Some((mri, rest)) if *mri == self.controller.mri() => rest.to_vec(),
            _ => path,
        };
        if path.is_empty() {
            self.path()
        } else {
            path
        }
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(handle) = state.subscription.take() {
            handle.unsubscribe();
        }
    }
}

async fn pump(session: Weak<SyncSession>, mut responses: ResponseReceiver) {
    while let Some(response) = responses.recv().await {
        let Some(session) = session.upgrade() else {
            break;
        };
        match response {
            Response::Delta { changes, .. } => session.handle_changes(changes),
            Response::Update { .. } => {}
            Response::Error { error, .. } => {
                session.unit_gone(&error.message);
                break;
            }
            Response::Return { .. } => break,
        }
    }
}

/// Put-path set of a snapshot.
///
/// For a block: `"<field>.value"` for every top-level record that is neither
/// a method nor the block's own meta. For a single field: `{"value"}` when
/// the field is an attribute.
pub fn put_paths_for(snapshot: &Value, field_scoped: bool) -> BTreeSet<String> {
    let typeid_of = |v: &Value| v.get("typeid").and_then(Value::as_str).map(str::to_string);
    if field_scoped {
        return match typeid_of(snapshot) {
            Some(t) if typeid::is_attribute(&t) => BTreeSet::from(["value".to_string()]),
            _ => BTreeSet::new(),
        };
    }
    snapshot
        .as_object()
        .map(|fields| {
            fields
                .iter()
                .filter(|(_, v)| typeid_of(v).is_some_and(|t| !typeid::is_unputtable(&t)))
                .map(|(name, _)| format!("{name}.value"))
                .collect()
        })
        .unwrap_or_default()
}

/// Resolve the paths a client touched against a put-path set.
///
/// Every touched path and each of its ancestors is a candidate; exactly one
/// candidate must be in `put_paths`.
pub fn resolve_put_path(touched: &[String], put_paths: &BTreeSet<String>) -> AppResult<Vec<String>> {
    let candidates = with_parents(touched.iter().map(String::as_str));
    let matches: Vec<&String> = candidates.iter().filter(|p| put_paths.contains(*p)).collect();
    match matches.as_slice() {
        [] => Err(DaqError::AmbiguousPut(format!(
            "Nothing puttable changed in {touched:?}"
        ))),
        [single] => Ok(split_dotted(single)),
        many => Err(DaqError::AmbiguousPut(format!(
            "Can only do a Put to a single field at a time, got {many:?}"
        ))),
    }
}

/// Dotted paths of every leaf in a partial update.
pub fn leaf_paths(update: &Value) -> Vec<String> {
    fn walk(node: &Value, prefix: &str, out: &mut Vec<String>) {
        match node {
            Value::Object(map) if !map.is_empty() => {
                for (key, child) in map {
                    let path = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{prefix}.{key}")
                    };
                    walk(child, &path, out);
                }
            }
            _ if !prefix.is_empty() => out.push(prefix.to_string()),
            _ => {}
        }
    }
    let mut out = Vec::new();
    walk(update, "", &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_core::model::{AttributeModel, BlockModel, MethodModel, NumberType, VMeta};
    use daq_core::tags::METHOD_RETURN_UNPACKED;
    use futures::FutureExt;
    use tokio::time::{sleep, timeout};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<SessionEvent>>);

    impl ChannelSink for Recorder {
        fn send(&self, event: SessionEvent) {
            self.0.lock().push(event);
        }
    }

    impl Recorder {
        fn take(&self) -> Vec<SessionEvent> {
            std::mem::take(&mut *self.0.lock())
        }
    }

    fn unit() -> Arc<Controller> {
        let mut block = BlockModel::new("Unit");
        block
            .add_field(
                "value",
                Field::Attribute(
                    AttributeModel::new(VMeta::number(NumberType::Int32, "value").writeable(true))
                        .with_value(json!(5))
                        .unwrap(),
                ),
            )
            .unwrap();
        block
            .add_field(
                "double",
                Field::Method(
                    MethodModel::new("Double a number")
                        .with_takes(daq_core::model::MapMeta::new().with_element(
                            "x",
                            VMeta::number(NumberType::Int32, "x"),
                            true,
                        ))
                        .with_tags([METHOD_RETURN_UNPACKED]),
                ),
            )
            .unwrap();
        let controller = Controller::new("UNIT", block);
        controller.register_method(
            "double",
            Arc::new(|params: Map<String, Value>| {
                async move { Ok::<_, DaqError>(json!(params["x"].as_i64().unwrap_or(0) * 2)) }.boxed()
            }),
        );
        controller
    }

    fn unopened(field: Option<&str>) -> (Arc<Controller>, Arc<SyncSession>, Arc<Recorder>) {
        let controller = unit();
        let sink = Arc::new(Recorder::default());
        let session = SyncSession::new(
            controller.clone(),
            field.map(str::to_string),
            sink.clone(),
            Duration::from_millis(200),
        );
        (controller, session, sink)
    }

    async fn opened(field: Option<&str>) -> (Arc<Controller>, Arc<SyncSession>, Arc<Recorder>) {
        let (controller, session, sink) = unopened(field);
        session.connect().await.unwrap();
        timeout(Duration::from_secs(1), async {
            while session.phase() != SessionPhase::Open {
                sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        (controller, session, sink)
    }

    fn set(paths: &[&str]) -> BTreeSet<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn put_resolution_needs_exactly_one_match() {
        let puts = set(&["value.value", "gain.value"]);
        assert_eq!(
            resolve_put_path(&["value.value".into()], &puts).unwrap(),
            vec!["value", "value"]
        );
        assert!(matches!(
            resolve_put_path(&["meta.label".into()], &puts),
            Err(DaqError::AmbiguousPut(_))
        ));
        let both = ["value.value".to_string(), "gain.value".to_string()];
        assert!(matches!(resolve_put_path(&both, &puts), Err(DaqError::AmbiguousPut(_))));
        // Same inputs, same answer.
        assert_eq!(
            resolve_put_path(&both, &puts).unwrap_err().to_string(),
            resolve_put_path(&both, &puts).unwrap_err().to_string()
        );
    }

    #[test]
    fn leaf_paths_of_partial_update() {
        let update = json!({"value": {"value": 7}, "gain": {"value": [1, 2]}});
        assert_eq!(leaf_paths(&update), vec!["value.value", "gain.value"]);
        assert!(leaf_paths(&json!(3)).is_empty());
    }

    #[tokio::test]
    async fn opens_on_first_root_update_and_computes_put_paths() {
        let (controller, session, sink) = opened(None).await;
        assert_eq!(session.put_paths(), set(&["value.value"]));
        match sink.take().as_slice() {
            [SessionEvent::Open { snapshot }] => assert_eq!(snapshot, &controller.get(&[]).unwrap()),
            other => panic!("expected one open, got {other:?}"),
        }

        let (_, field_session, _) = opened(Some("value")).await;
        assert_eq!(field_session.put_paths(), set(&["value"]));
        let (_, method_session, _) = opened(Some("double")).await;
        assert!(method_session.put_paths().is_empty());
    }

    #[tokio::test]
    async fn unpacked_return_is_wrapped() {
        let (_, session, _) = opened(None).await;
        let mut query = Map::new();
        query.insert("x".into(), json!(21));
        let returned = session
            .rpc(Invocation::Explicit {
                path: vec!["UNIT".into(), "double".into()],
                query,
            })
            .await
            .unwrap();
        assert_eq!(returned, json!({"return": 42}));

        let fault = session
            .rpc(Invocation::Explicit {
                path: vec!["value".into()],
                query: Map::new(),
            })
            .await
            .unwrap_err();
        assert!(fault.message.starts_with("NotInvocable: "), "{fault}");
    }

    #[tokio::test]
    async fn implicit_invocation_uses_the_channel_field() {
        let (_, session, _) = opened(Some("double")).await;
        let mut parameters = Map::new();
        parameters.insert("x".into(), json!(4));
        let returned = session.rpc(Invocation::Implicit { parameters }).await.unwrap();
        assert_eq!(returned, json!({"return": 8}));

        let (_, block_session, _) = opened(None).await;
        let fault = block_session
            .rpc(Invocation::Implicit { parameters: Map::new() })
            .await
            .unwrap_err();
        assert!(fault.message.starts_with("NotInvocable: "));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_terminal() {
        let (controller, session, sink) = opened(None).await;
        sink.take();
        session.disconnect().await.unwrap();
        assert_eq!(session.phase(), SessionPhase::Closed);
        assert_eq!(sink.take(), vec![SessionEvent::Close]);
        session.disconnect().await.unwrap();
        assert!(sink.take().is_empty());

        timeout(Duration::from_secs(1), async {
            while controller.subscriber_count() != 0 {
                sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        assert!(matches!(
            session.connect().await,
            Err(DaqError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn hung_context_makes_disconnect_time_out_but_still_close() {
        let (controller, session, sink) = opened(None).await;
        sink.take();
        let _busy = controller.spawn(sleep(Duration::from_secs(30)));
        sleep(Duration::from_millis(5)).await;
        let err = session
            .disconnect_within(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Timeout(_)), "{err}");
        assert_eq!(session.phase(), SessionPhase::Closed);
        assert_eq!(sink.take(), vec![SessionEvent::Close]);
        assert!(session.snapshot().is_none());
        assert!(session.put_paths().is_empty());

        // Nothing more reaches the sink once closed.
        controller.set_value("value", json!(11)).unwrap();
        sleep(Duration::from_millis(5)).await;
        assert!(sink.take().is_empty());
    }

    #[tokio::test]
    async fn first_change_set_that_is_not_a_root_update_opens_from_the_block() {
        let (controller, session, sink) = unopened(None);
        session.handle_changes(vec![Change::update(["value", "value"], json!(9))]);
        assert_eq!(session.phase(), SessionPhase::Open);
        assert_eq!(
            sink.take(),
            vec![SessionEvent::Open {
                snapshot: controller.get(&[]).unwrap()
            }]
        );
        assert!(session.put_paths().contains("value.value"));
    }

    #[tokio::test]
    async fn closed_unit_closes_session() {
        let (controller, session, sink) = opened(None).await;
        sink.take();
        controller.close();
        timeout(Duration::from_secs(1), async {
            while session.phase() != SessionPhase::Closed {
                sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(sink.take(), vec![SessionEvent::Close]);
        session.disconnect().await.unwrap();
    }
}

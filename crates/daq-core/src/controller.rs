//! Dispatch core: the owner of one block.
//!
//! A [`Controller`] owns a [`BlockModel`] and is the only thing that mutates
//! it. Every mutation happens inside a [`Transaction`] under the controller's
//! state lock, and the resulting change set is delivered to subscribers before
//! the lock is released, so every subscriber sees mutations in one total
//! order.
//!
//! # Request pipeline
//!
//! ```text
//!   get(path)        ─► serialize block ─► value at path
//!   put(path, v)     ─► attribute? writeable? meta.validate(v)
//!                       ─► writer callback (hardware) or Transaction::set_value
//!   post(path, p)    ─► method? writeable? takes.validate(p) ─► handler(p)
//!   subscribe(path)  ─► initial value / root delta ─► one response per change set
//!   unsubscribe(id)  ─► terminal Return
//! ```
//!
//! # Execution context
//!
//! [`Controller::spawn`] runs jobs one at a time on the controller's own
//! serialized context. Session lifecycle callbacks and schema rebuilds go
//! there; request handling does not, so a long-running `run` never blocks it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace, warn};

use crate::changes::{dotted, starts_with, value_at, Change};
use crate::error::{AppResult, DaqError};
use crate::model::{Alarm, BlockModel, Field, MethodModel};
use crate::request::{Request, RequestBody, Response, ResponseReceiver, ResponseSender};

/// Future returned by a method handler.
pub type MethodFuture = BoxFuture<'static, AppResult<Value>>;

/// Implementation of a method field. Receives validated parameters.
pub type MethodHandler = Arc<dyn Fn(Map<String, Value>) -> MethodFuture + Send + Sync>;

/// Hardware writer for an attribute. Receives the validated value and is
/// responsible for storing the value that actually resulted.
pub type AttributeWriter = Arc<dyn Fn(Value) -> BoxFuture<'static, AppResult<()>> + Send + Sync>;

struct Subscriber {
    id: u64,
    path: Vec<String>,
    delta: bool,
    responder: ResponseSender,
}

impl Subscriber {
    /// Response for this subscriber to a change set, if it is affected.
    fn response_for(&self, tree: &Value, changes: &[Change]) -> Option<Response> {
        if !self.delta {
            let touched = changes
                .iter()
                .any(|c| starts_with(c.path(), &self.path) || starts_with(&self.path, c.path()));
            if !touched {
                return None;
            }
            return Some(match value_at(tree, &self.path) {
                Some(value) => Response::Update {
                    id: self.id,
                    value: value.clone(),
                },
                None => Response::Error {
                    id: self.id,
                    error: DaqError::NoSuchPath(dotted(&self.path)).to_info(),
                },
            });
        }

        let mut out = Vec::new();
        for change in changes {
            let cpath = change.path();
            if starts_with(cpath, &self.path) {
                let rel = cpath[self.path.len()..].to_vec();
                match change {
                    Change::Update { value, .. } if rel.is_empty() => {
                        out.extend(per_key_updates(value))
                    }
                    Change::Update { value, .. } => out.push(Change::Update {
                        path: rel,
                        value: value.clone(),
                    }),
                    Change::Delete { .. } => out.push(Change::Delete { path: rel }),
                }
            } else if starts_with(&self.path, cpath) {
                // An ancestor of the subscribed node changed.
                match (change, value_at(tree, &self.path)) {
                    (Change::Update { .. }, Some(value)) => out.extend(per_key_updates(value)),
                    _ => out.push(Change::Delete { path: Vec::new() }),
                }
            }
        }
        (!out.is_empty()).then_some(Response::Delta {
            id: self.id,
            changes: out,
        })
    }
}

/// A replaced subscribed node is re-sent key by key so it never looks like a
/// root update to the receiver.
fn per_key_updates(value: &Value) -> Vec<Change> {
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| Change::update([k.as_str()], v.clone()))
            .collect(),
        _ => vec![Change::Delete { path: Vec::new() }],
    }
}

struct ControllerState {
    block: BlockModel,
    subscribers: Vec<Subscriber>,
    methods: HashMap<String, MethodHandler>,
    writers: HashMap<String, AttributeWriter>,
    closed: bool,
}

// =============================================================================
// Transaction
// =============================================================================

/// Batch of mutations applied to a block and delivered as one change set.
pub struct Transaction<'a> {
    block: &'a mut BlockModel,
    changes: Vec<Change>,
}

impl Transaction<'_> {
    /// Current block.
    pub fn block(&self) -> &BlockModel {
        self.block
    }

    fn attribute_mut(&mut self, path: &[String]) -> AppResult<&mut crate::model::AttributeModel> {
        self.block
            .resolve_mut(path)
            .and_then(Field::as_attribute_mut)
            .ok_or_else(|| DaqError::NoSuchPath(dotted(path)))
    }

    /// Set an attribute value, addressed by the path of the attribute.
    pub fn set_value_at(&mut self, path: &[String], value: &Value) -> AppResult<()> {
        let attr = self.attribute_mut(path)?;
        let validated = attr.meta.validate(value)?;
        if attr.value == validated {
            return Ok(());
        }
        attr.set_value(&validated)?;
        let ts = serde_json::to_value(attr.time_stamp)?;
        let mut value_path = path.to_vec();
        value_path.push("value".into());
        self.changes.push(Change::Update {
            path: value_path,
            value: validated,
        });
        let mut ts_path = path.to_vec();
        ts_path.push("timeStamp".into());
        self.changes.push(Change::Update {
            path: ts_path,
            value: ts,
        });
        Ok(())
    }

    /// Set a top-level attribute value.
    pub fn set_value(&mut self, name: &str, value: impl Into<Value>) -> AppResult<()> {
        self.set_value_at(&[name.to_string()], &value.into())
    }

    /// Set an attribute's alarm.
    pub fn set_alarm(&mut self, name: &str, alarm: Alarm) -> AppResult<()> {
        let path = [name.to_string()];
        let attr = self.attribute_mut(&path)?;
        if attr.alarm == alarm {
            return Ok(());
        }
        let value = serde_json::to_value(&alarm)?;
        attr.alarm = alarm;
        self.changes.push(Change::update([name, "alarm"], value));
        Ok(())
    }

    /// Enable or disable external writes of an attribute or calls of a method.
    pub fn set_writeable(&mut self, name: &str, writeable: bool) -> AppResult<()> {
        let field = self
            .block
            .field_mut(name)
            .ok_or_else(|| DaqError::NoSuchPath(name.to_string()))?;
        let (current, path) = match field {
            Field::Attribute(a) => (&mut a.meta.writeable, vec![name, "meta", "writeable"]),
            Field::Method(m) => (&mut m.writeable, vec![name, "writeable"]),
            Field::Block(b) => (&mut b.meta.writeable, vec![name, "meta", "writeable"]),
        };
        if *current != writeable {
            *current = writeable;
            self.changes.push(Change::update(path, Value::from(writeable)));
        }
        Ok(())
    }

    /// Append a field.
    pub fn add_field(&mut self, name: &str, field: Field) -> AppResult<()> {
        let value = field.to_value()?;
        self.block.add_field(name, field)?;
        self.changes.push(Change::update([name], value));
        self.push_field_list();
        Ok(())
    }

    /// Remove a field.
    pub fn remove_field(&mut self, name: &str) -> AppResult<Field> {
        let removed = self
            .block
            .remove_field(name)
            .ok_or_else(|| DaqError::NoSuchPath(name.to_string()))?;
        self.changes.push(Change::delete([name]));
        self.push_field_list();
        Ok(removed)
    }

    /// Replace a field in place. A retyped field is announced as a delete
    /// followed by an update.
    pub fn replace_field(&mut self, name: &str, field: Field) -> AppResult<()> {
        let value = field.to_value()?;
        let new_typeid = field.typeid();
        let old = self.block.replace_field(name, field)?;
        if old.typeid() != new_typeid {
            self.changes.push(Change::delete([name]));
        }
        self.changes.push(Change::update([name], value));
        Ok(())
    }

    /// Edit a method's model in place.
    pub fn update_method(&mut self, name: &str, edit: impl FnOnce(&mut MethodModel)) -> AppResult<()> {
        let mut method = self
            .block
            .method(name)
            .cloned()
            .ok_or_else(|| DaqError::NoSuchPath(name.to_string()))?;
        edit(&mut method);
        self.replace_field(name, Field::Method(method))
    }

    fn push_field_list(&mut self) {
        self.changes.push(Change::update(
            ["meta", "fields"],
            Value::from(self.block.meta.fields.clone()),
        ));
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// Cheap handle able to cancel a subscription.
#[derive(Clone)]
pub struct SubscriptionHandle {
    id: u64,
    controller: Arc<Controller>,
    responder: ResponseSender,
}

impl SubscriptionHandle {
    /// Subscription id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Controller the subscription is registered with.
    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// Deregister; the receiver gets a terminal `Return`.
    pub fn unsubscribe(&self) {
        self.controller.unsubscribe(self.id, &self.responder);
    }
}

/// A live subscription: a handle plus the stream of responses.
pub struct Subscription {
    handle: SubscriptionHandle,
    receiver: ResponseReceiver,
}

impl Subscription {
    /// Next response; `None` once the controller has dropped the subscriber.
    pub async fn recv(&mut self) -> Option<Response> {
        self.receiver.recv().await
    }

    /// Handle for cancelling.
    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    /// Split into handle and receiver.
    pub fn into_parts(self) -> (SubscriptionHandle, ResponseReceiver) {
        (self.handle, self.receiver)
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Owner of one block and its subscribers.
pub struct Controller {
    mri: String,
    state: Mutex<ControllerState>,
    context: tokio::sync::Mutex<()>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller").field("mri", &self.mri).finish()
    }
}

impl Controller {
    /// Controller owning `block` under `mri`.
    pub fn new(mri: impl Into<String>, block: BlockModel) -> Arc<Self> {
        Arc::new(Self {
            mri: mri.into(),
            state: Mutex::new(ControllerState {
                block,
                subscribers: Vec::new(),
                methods: HashMap::new(),
                writers: HashMap::new(),
                closed: false,
            }),
            context: tokio::sync::Mutex::new(()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Identifier of the block.
    pub fn mri(&self) -> &str {
        &self.mri
    }

    /// Install the implementation of a method field.
    pub fn register_method(&self, name: impl Into<String>, handler: MethodHandler) {
        self.state.lock().methods.insert(name.into(), handler);
    }

    /// Install a hardware writer for an attribute (dotted path within the block).
    pub fn register_writer(&self, attribute: impl Into<String>, writer: AttributeWriter) {
        self.state.lock().writers.insert(attribute.into(), writer);
    }

    /// Read the block under the lock.
    pub fn with_block<R>(&self, f: impl FnOnce(&BlockModel) -> R) -> R {
        f(&self.state.lock().block)
    }

    /// Current value of a top-level attribute.
    pub fn value(&self, attribute: &str) -> AppResult<Value> {
        self.with_block(|b| {
            b.attribute(attribute)
                .map(|a| a.value.clone())
                .ok_or_else(|| DaqError::NoSuchPath(format!("{}.{attribute}", self.mri)))
        })
    }

    /// Apply a batch of mutations and notify subscribers once.
    ///
    /// Changes made before an error inside `f` are still delivered, so
    /// subscribers never drift from the block.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut Transaction<'_>) -> AppResult<R>) -> AppResult<R> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(DaqError::UnknownUnit(self.mri.clone()));
        }
        let mut tx = Transaction {
            block: &mut state.block,
            changes: Vec::new(),
        };
        let result = f(&mut tx);
        let changes = tx.changes;
        if !changes.is_empty() {
            Self::notify(&self.mri, state, &changes);
        }
        result
    }

    /// Set one top-level attribute.
    pub fn set_value(&self, name: &str, value: impl Into<Value>) -> AppResult<()> {
        self.transaction(|tx| tx.set_value(name, value))
    }

    fn notify(mri: &str, state: &mut ControllerState, changes: &[Change]) {
        if state.subscribers.is_empty() {
            return;
        }
        let tree = match state.block.to_value() {
            Ok(tree) => tree,
            Err(err) => {
                warn!(mri, error = %err, "Failed to serialize block for notification");
                return;
            }
        };
        trace!(mri, changes = changes.len(), "Notifying subscribers");
        state.subscribers.retain(|sub| match sub.response_for(&tree, changes) {
            None => true,
            Some(response) => {
                let terminal = response.is_terminal();
                if sub.responder.send(response).is_err() {
                    debug!(mri, id = sub.id, "Dropping subscriber with closed channel");
                    return false;
                }
                !terminal
            }
        });
    }

    fn strip_mri<'p>(&self, path: &'p [String]) -> AppResult<&'p [String]> {
        match path.split_first() {
            Some((mri, rest)) if *mri == self.mri => Ok(rest),
            _ => Err(DaqError::NoSuchPath(dotted(path))),
        }
    }

    // -------------------------------------------------------------------------
    // Request pipeline
    // -------------------------------------------------------------------------

    /// Serialized value at `path` (relative to the block; empty = whole block).
    pub fn get(&self, path: &[String]) -> AppResult<Value> {
        let tree = self.with_block(BlockModel::to_value)?;
        value_at(&tree, path)
            .cloned()
            .ok_or_else(|| DaqError::NoSuchPath(format!("{}.{}", self.mri, dotted(path))))
    }

    /// Write an attribute. `path` is `[attr, "value"]` or `[attr]`, possibly
    /// prefixed by nested block names.
    #[instrument(skip(self, value), fields(mri = %self.mri), err)]
    pub async fn put(&self, path: &[String], value: Value) -> AppResult<Value> {
        let attr_path = match path.split_last() {
            Some((last, rest)) if last == "value" && !rest.is_empty() => rest,
            _ => path,
        };
        let full = || format!("{}.{}", self.mri, dotted(path));
        let (validated, writer) = {
            let state = self.state.lock();
            if state.closed {
                return Err(DaqError::UnknownUnit(self.mri.clone()));
            }
            let field = state
                .block
                .resolve(attr_path)
                .ok_or_else(|| DaqError::NoSuchPath(full()))?;
            let attr = field.as_attribute().ok_or_else(|| DaqError::NotWritable(full()))?;
            if !attr.meta.writeable {
                return Err(DaqError::NotWritable(full()));
            }
            let validated = attr.meta.validate(&value)?;
            (validated, state.writers.get(&dotted(attr_path)).cloned())
        };
        match writer {
            Some(writer) => writer(validated).await?,
            None => self.transaction(|tx| tx.set_value_at(attr_path, &validated))?,
        }
        Ok(Value::Null)
    }

    /// Invoke a method. `path` is `[method]`.
    #[instrument(skip(self, params), fields(mri = %self.mri), err)]
    pub async fn post(&self, path: &[String], params: Map<String, Value>) -> AppResult<Value> {
        let full = || format!("{}.{}", self.mri, dotted(path));
        let (handler, validated) = {
            let state = self.state.lock();
            if state.closed {
                return Err(DaqError::UnknownUnit(self.mri.clone()));
            }
            let field = state
                .block
                .resolve(path)
                .ok_or_else(|| DaqError::NoSuchPath(full()))?;
            let method = field.as_method().ok_or_else(|| DaqError::NotInvocable(full()))?;
            if !method.writeable {
                return Err(DaqError::NotWritable(full()));
            }
            let validated = method.validate_params(&params)?;
            let handler = state
                .methods
                .get(&dotted(path))
                .cloned()
                .ok_or_else(|| DaqError::Internal(format!("{} has no implementation", full())))?;
            (handler, validated)
        };
        handler(validated).await
    }

    /// Subscribe to `path` (relative to the block) with a fresh response channel.
    pub fn subscribe(self: &Arc<Self>, path: &[String], delta: bool) -> AppResult<Subscription> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.add_subscriber(id, path, delta, tx.clone())?;
        Ok(Subscription {
            handle: SubscriptionHandle {
                id,
                controller: Arc::clone(self),
                responder: tx,
            },
            receiver: rx,
        })
    }

    fn add_subscriber(&self, id: u64, path: &[String], delta: bool, responder: ResponseSender) -> AppResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(DaqError::UnknownUnit(self.mri.clone()));
        }
        let tree = state.block.to_value()?;
        let value = value_at(&tree, path)
            .cloned()
            .ok_or_else(|| DaqError::NoSuchPath(format!("{}.{}", self.mri, dotted(path))))?;
        let initial = if delta {
            Response::Delta {
                id,
                changes: vec![Change::Update {
                    path: Vec::new(),
                    value,
                }],
            }
        } else {
            Response::Update { id, value }
        };
        if responder.send(initial).is_ok() {
            debug!(mri = %self.mri, id, path = %dotted(path), delta, "Subscriber added");
            state.subscribers.push(Subscriber {
                id,
                path: path.to_vec(),
                delta,
                responder,
            });
        }
        Ok(())
    }

    /// Remove a subscriber; it receives a terminal `Return`.
    pub fn unsubscribe(&self, id: u64, responder: &ResponseSender) {
        let mut state = self.state.lock();
        let before = state.subscribers.len();
        state
            .subscribers
            .retain(|s| !(s.id == id && s.responder.same_channel(responder)));
        if state.subscribers.len() != before {
            debug!(mri = %self.mri, id, "Subscriber removed");
            let _ = responder.send(Response::Return {
                id,
                value: Value::Null,
            });
        }
    }

    /// Dispatch a request addressed as `[mri, ...]`.
    pub async fn handle_request(&self, request: Request) {
        let rest = match self.strip_mri(&request.path) {
            Ok(rest) => rest.to_vec(),
            Err(err) => return request.respond(Err(err)),
        };
        match &request.body {
            RequestBody::Get => request.respond(self.get(&rest)),
            RequestBody::Put { value } => request.respond(self.put(&rest, value.clone()).await),
            RequestBody::Post { parameters } => {
                request.respond(self.post(&rest, parameters.clone()).await)
            }
            RequestBody::Subscribe { delta } => {
                if let Err(err) =
                    self.add_subscriber(request.id, &rest, *delta, request.responder.clone())
                {
                    request.respond(Err(err));
                }
            }
            RequestBody::Unsubscribe => self.unsubscribe(request.id, &request.responder),
        }
    }

    /// Mark the block destroyed; every subscriber gets a terminal error.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        for sub in state.subscribers.drain(..) {
            let _ = sub.responder.send(Response::Error {
                id: sub.id,
                error: DaqError::UnknownUnit(self.mri.clone()).to_info(),
            });
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    // -------------------------------------------------------------------------
    // Serialized execution context
    // -------------------------------------------------------------------------

    /// Run `job` on this controller's serialized context.
    pub fn spawn<F>(self: &Arc<Self>, job: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _turn = this.context.lock().await;
            job.await
        })
    }

    /// Run `job` on the serialized context and wait at most `limit` for it.
    /// On expiry the job is cancelled and `Timeout` returned.
    pub async fn run_in_context<T>(
        self: &Arc<Self>,
        what: &str,
        limit: Duration,
        job: impl Future<Output = AppResult<T>> + Send + 'static,
    ) -> AppResult<T>
    where
        T: Send + 'static,
    {
        let handle = self.spawn(job);
        let abort = handle.abort_handle();
        match tokio::time::timeout(limit, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(DaqError::Internal(format!("{what} panicked: {join}"))),
            Err(_) => {
                abort.abort();
                Err(DaqError::Timeout(format!("{what} on {} after {limit:?}", self.mri)))
            }
        }
    }
}

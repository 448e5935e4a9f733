//! Client-side access to other blocks.
//!
//! A [`Context`] is what a part uses to talk to child blocks. Every call goes
//! through the child's request pipeline, so a child's errors arrive with
//! their original kind. The context remembers every subscription it made so
//! that [`Context::unsubscribe_all`] can release them in one go, for example
//! when a run is aborted.

use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::controller::{Controller, SubscriptionHandle};
use crate::error::{AppResult, DaqError};
use crate::model::MethodModel;
use crate::process::Process;
use crate::request::{Request, RequestBody, Response};

/// Handle on another block.
#[derive(Clone)]
pub struct BlockView {
    controller: Arc<Controller>,
}

impl BlockView {
    /// View of `controller`.
    pub fn new(controller: Arc<Controller>) -> Self {
        Self { controller }
    }

    /// MRI of the block.
    pub fn mri(&self) -> &str {
        self.controller.mri()
    }

    async fn request(&self, mut path: Vec<String>, body: RequestBody) -> AppResult<Value> {
        path.insert(0, self.controller.mri().to_string());
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.controller
            .handle_request(Request {
                id: 1,
                path,
                body,
                responder: tx,
            })
            .await;
        match rx.recv().await {
            Some(Response::Return { value, .. }) => Ok(value),
            Some(Response::Error { error, .. }) => Err(DaqError::from_info(error)),
            _ => Err(DaqError::Internal(format!(
                "{} sent no terminal response",
                self.mri()
            ))),
        }
    }

    /// Current value of an attribute.
    pub async fn value(&self, attribute: &str) -> AppResult<Value> {
        self.request(vec![attribute.into(), "value".into()], RequestBody::Get)
            .await
    }

    /// Whether `field` exists.
    pub fn has_field(&self, field: &str) -> bool {
        self.controller.with_block(|b| b.field(field).is_some())
    }

    /// Whether `field` currently accepts a put or call.
    pub fn is_writeable(&self, field: &str) -> bool {
        self.controller
            .with_block(|b| b.field(field).is_some_and(|f| f.is_writeable()))
    }

    /// Model of a method, if the block has one by that name.
    pub fn method_model(&self, name: &str) -> Option<MethodModel> {
        self.controller.with_block(|b| b.method(name).cloned())
    }

    /// Write an attribute.
    pub async fn put_value(&self, attribute: &str, value: Value) -> AppResult<()> {
        self.request(
            vec![attribute.into(), "value".into()],
            RequestBody::Put { value },
        )
        .await
        .map(|_| ())
    }

    /// Invoke a method and wait for its return.
    pub async fn call(&self, method: &str, parameters: Map<String, Value>) -> AppResult<Value> {
        self.request(vec![method.into()], RequestBody::Post { parameters })
            .await
    }

    /// Invoke a method on a separate task.
    pub fn call_async(&self, method: &str, parameters: Map<String, Value>) -> JoinHandle<AppResult<Value>> {
        let view = self.clone();
        let method = method.to_string();
        tokio::spawn(async move { view.call(&method, parameters).await })
    }
}

/// Tracks subscriptions a part makes on other blocks.
pub struct Context {
    process: Arc<Process>,
    subscriptions: Mutex<Vec<(SubscriptionHandle, Option<JoinHandle<()>>)>>,
}

impl Context {
    /// Context resolving blocks through `process`.
    pub fn new(process: Arc<Process>) -> Self {
        Self {
            process,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Owning process.
    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    /// View of the block registered under `mri`.
    pub fn block_view(&self, mri: &str) -> AppResult<BlockView> {
        Ok(BlockView::new(self.process.lookup(mri)?))
    }

    /// Call `on_value` with the current value of an attribute and then with
    /// every new value, until [`Context::unsubscribe_all`].
    pub fn subscribe_value<F>(&self, mri: &str, attribute: &str, on_value: F) -> AppResult<()>
    where
        F: Fn(Value) + Send + 'static,
    {
        let controller = self.process.lookup(mri)?;
        let sub = controller.subscribe(&[attribute.to_string(), "value".to_string()], false)?;
        let (handle, mut rx) = sub.into_parts();
        let task = tokio::spawn(async move {
            while let Some(response) = rx.recv().await {
                match response {
                    Response::Update { value, .. } => on_value(value),
                    Response::Delta { .. } => {}
                    Response::Return { .. } | Response::Error { .. } => break,
                }
            }
        });
        self.subscriptions.lock().push((handle, Some(task)));
        Ok(())
    }

    /// Future that resolves when an attribute equals `good`, or fails with
    /// `BadValue` as soon as it takes one of the `bad` values.
    ///
    /// The subscription is registered before this returns, so a change made
    /// right after the call is not missed.
    pub fn when_value_matches(
        &self,
        mri: &str,
        attribute: &str,
        good: Value,
        bad: Vec<Value>,
    ) -> AppResult<BoxFuture<'static, AppResult<()>>> {
        let controller = self.process.lookup(mri)?;
        let sub = controller.subscribe(&[attribute.to_string(), "value".to_string()], false)?;
        let (handle, mut rx) = sub.into_parts();
        self.subscriptions.lock().push((handle.clone(), None));
        let what = format!("{mri}.{attribute}");
        Ok(Box::pin(async move {
            let outcome = loop {
                match rx.recv().await {
                    Some(Response::Update { value, .. }) => {
                        if value == good {
                            break Ok(());
                        }
                        if bad.contains(&value) {
                            break Err(DaqError::BadValue(format!(
                                "{what} is {value} while waiting for {good}"
                            )));
                        }
                    }
                    Some(Response::Delta { .. }) => {}
                    Some(Response::Error { error, .. }) => break Err(DaqError::from_info(error)),
                    Some(Response::Return { .. }) | None => {
                        break Err(DaqError::Aborted(format!("wait on {what} cancelled")))
                    }
                }
            };
            handle.unsubscribe();
            outcome
        }))
    }

    /// Release every subscription made through this context.
    pub fn unsubscribe_all(&self) {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        if !subscriptions.is_empty() {
            debug!(count = subscriptions.len(), "Releasing subscriptions");
        }
        for (handle, task) in subscriptions {
            handle.unsubscribe();
            if let Some(task) = task {
                task.abort();
            }
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.unsubscribe_all();
    }
}

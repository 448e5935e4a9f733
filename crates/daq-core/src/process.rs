//! Process registry.
//!
//! A [`Process`] is the explicit, process-scoped registry of controllers,
//! looked up by MRI. It also owns the ordered list of lifecycle participants
//! (state machines, servers) that are started and stopped with the process,
//! and the watch-published list of MRIs the block server should serve.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use crate::controller::Controller;
use crate::error::{AppResult, DaqError};
use crate::request::{Request, Response};

/// Something started and stopped together with the process.
#[async_trait]
pub trait ProcessLifecycle: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Called by [`Process::start`], in registration order.
    async fn on_start(&self) -> AppResult<()>;

    /// Called by [`Process::stop`], in reverse registration order.
    async fn on_stop(&self) -> AppResult<()>;
}

/// Registry of controllers plus lifecycle participants.
pub struct Process {
    name: String,
    controllers: DashMap<String, Arc<Controller>>,
    participants: Mutex<Vec<Arc<dyn ProcessLifecycle>>>,
    published: watch::Sender<Vec<String>>,
}

impl Process {
    /// Empty process.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let (published, _) = watch::channel(Vec::new());
        Arc::new(Self {
            name: name.into(),
            controllers: DashMap::new(),
            participants: Mutex::new(Vec::new()),
            published,
        })
    }

    /// Process name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a controller and publish it.
    pub fn add_controller(&self, controller: Arc<Controller>) -> AppResult<()> {
        let mri = controller.mri().to_string();
        if self.controllers.contains_key(&mri) {
            return Err(DaqError::Configuration(format!(
                "Controller {mri} already registered"
            )));
        }
        self.controllers.insert(mri.clone(), controller);
        self.published.send_modify(|list| {
            if !list.contains(&mri) {
                list.push(mri.clone());
            }
        });
        debug!(process = %self.name, mri, "Controller registered");
        Ok(())
    }

    /// Deregister and close a controller; it also leaves the published list.
    pub fn remove_controller(&self, mri: &str) -> AppResult<Arc<Controller>> {
        let (_, controller) = self
            .controllers
            .remove(mri)
            .ok_or_else(|| DaqError::UnknownUnit(mri.to_string()))?;
        self.published.send_modify(|list| list.retain(|m| m != mri));
        controller.close();
        debug!(process = %self.name, mri, "Controller removed");
        Ok(controller)
    }

    /// Controller registered under `mri`.
    pub fn lookup(&self, mri: &str) -> AppResult<Arc<Controller>> {
        self.controllers
            .get(mri)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| DaqError::UnknownUnit(mri.to_string()))
    }

    /// Every registered MRI, sorted.
    pub fn mris(&self) -> Vec<String> {
        let mut mris: Vec<String> = self.controllers.iter().map(|e| e.key().clone()).collect();
        mris.sort();
        mris
    }

    /// Replace the list of MRIs the block server should serve.
    pub fn publish(&self, mris: Vec<String>) {
        info!(process = %self.name, ?mris, "Publishing blocks");
        self.published.send_replace(mris);
    }

    /// MRIs currently published.
    pub fn published(&self) -> Vec<String> {
        self.published.borrow().clone()
    }

    /// Watch the published list.
    pub fn watch_published(&self) -> watch::Receiver<Vec<String>> {
        self.published.subscribe()
    }

    /// Route a request to the controller named by `path[0]`.
    pub async fn handle_request(&self, request: Request) {
        let mri = request.path.first().cloned().unwrap_or_default();
        match self.lookup(&mri) {
            Ok(controller) => controller.handle_request(request).await,
            Err(err) => {
                let _ = request.responder.send(Response::Error {
                    id: request.id,
                    error: err.to_info(),
                });
            }
        }
    }

    /// Send a request and wait for its terminal response.
    pub async fn request(&self, path: Vec<String>, body: crate::request::RequestBody) -> AppResult<serde_json::Value> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.handle_request(Request {
            id: 0,
            path,
            body,
            responder: tx,
        })
        .await;
        while let Some(response) = rx.recv().await {
            match response {
                Response::Return { value, .. } => return Ok(value),
                Response::Error { error, .. } => return Err(DaqError::from_info(error)),
                Response::Update { .. } | Response::Delta { .. } => continue,
            }
        }
        Err(DaqError::Internal("controller dropped request".into()))
    }

    /// Add a lifecycle participant.
    pub fn add_participant(&self, participant: Arc<dyn ProcessLifecycle>) {
        self.participants.lock().push(participant);
    }

    /// Start every participant in registration order, stopping at the first
    /// failure.
    pub async fn start(&self) -> AppResult<()> {
        let participants = self.participants.lock().clone();
        for participant in participants {
            debug!(process = %self.name, participant = participant.name(), "Starting");
            participant.on_start().await?;
        }
        info!(process = %self.name, "Process started");
        Ok(())
    }

    /// Stop every participant in reverse order. All are attempted; failures
    /// are collected into `ShutdownFailed`.
    pub async fn stop(&self) -> AppResult<()> {
        let participants = self.participants.lock().clone();
        let mut errors = Vec::new();
        for participant in participants.iter().rev() {
            if let Err(err) = participant.on_stop().await {
                error!(participant = participant.name(), error = %err, "Failed to stop");
                errors.push(err);
            }
        }
        if errors.is_empty() {
            info!(process = %self.name, "Process stopped");
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(errors))
        }
    }
}

//! Shared channels: one session fanned out to many clients.
//!
//! The first client to connect creates a fresh [`SyncSession`]; later
//! clients get the current snapshot and then the same event stream. When
//! the last client leaves, the session is disconnected and dropped, so the
//! next connect starts over with a new one.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use daq_core::error::{AppResult, DaqError};
use daq_core::Process;

use crate::error_mapping::BoundaryFault;
use crate::session::{ChannelSink, Invocation, SessionEvent, SyncSession};

struct BroadcastSink(broadcast::Sender<SessionEvent>);

impl ChannelSink for BroadcastSink {
    fn send(&self, event: SessionEvent) {
        // No client listening right now is fine.
        let _ = self.0.send(event);
    }
}

#[derive(Default)]
struct Clients {
    count: usize,
    session: Option<Arc<SyncSession>>,
}

/// A named channel (`mri` or `mri.field`) shared by its clients.
pub struct SharedChannel {
    name: String,
    mri: String,
    field: Option<String>,
    process: Arc<Process>,
    events: broadcast::Sender<SessionEvent>,
    lifecycle_timeout: Duration,
    clients: Mutex<Clients>,
    closed: watch::Sender<bool>,
}

impl SharedChannel {
    /// Channel on `mri` (and `field`) with room for `capacity` buffered events.
    pub fn new(
        process: Arc<Process>,
        mri: impl Into<String>,
        field: Option<String>,
        capacity: usize,
        lifecycle_timeout: Duration,
    ) -> Arc<Self> {
        let mri = mri.into();
        let name = match &field {
            Some(field) => format!("{mri}.{field}"),
            None => mri.clone(),
        };
        let (events, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self {
            name,
            mri,
            field,
            process,
            events,
            lifecycle_timeout,
            clients: Mutex::new(Clients::default()),
            closed: watch::Sender::new(false),
        })
    }

    /// Channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// MRI of the served block.
    pub fn mri(&self) -> &str {
        &self.mri
    }

    /// Connected clients.
    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.count
    }

    /// Mirrored snapshot of the current session.
    pub async fn snapshot(&self) -> Option<Value> {
        self.clients.lock().await.session.as_ref()?.snapshot()
    }

    /// Current session.
    pub async fn session(&self) -> AppResult<Arc<SyncSession>> {
        self.clients
            .lock()
            .await
            .session
            .clone()
            .ok_or_else(|| DaqError::Internal(format!("channel {} has no session", self.name)))
    }

    /// Whether the channel was closed administratively.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Add a client. The first one creates and connects a session.
    pub async fn connect(self: &Arc<Self>) -> AppResult<ChannelClient> {
        let mut clients = self.clients.lock().await;
        if self.is_closed() {
            return Err(DaqError::Channel(format!("channel {} is closed", self.name)));
        }
        let events = self.events.subscribe();
        let pending = match clients.session.clone() {
            Some(session) => session.snapshot().map(|snapshot| SessionEvent::Open { snapshot }),
            None => {
                let controller = self.process.lookup(&self.mri)?;
                let session = SyncSession::new(
                    controller,
                    self.field.clone(),
                    Arc::new(BroadcastSink(self.events.clone())),
                    self.lifecycle_timeout,
                );
                session.connect().await?;
                clients.session = Some(session);
                None
            }
        };
        clients.count += 1;
        info!(channel = %self.name, clients = clients.count, "Client connected");
        Ok(ChannelClient {
            channel: Arc::clone(self),
            pending,
            events,
            closed: self.closed.subscribe(),
        })
    }

    async fn release(&self) -> AppResult<()> {
        let mut clients = self.clients.lock().await;
        clients.count = clients.count.saturating_sub(1);
        info!(channel = %self.name, clients = clients.count, "Client disconnected");
        if clients.count > 0 {
            return Ok(());
        }
        match clients.session.take() {
            Some(session) => session.disconnect().await,
            None => Ok(()),
        }
    }

    /// Close the channel for every client, bounded by `limit`. Idempotent.
    ///
    /// Clients see `Close` (if their view was open) and then the end of the
    /// stream, even when the session could not unsubscribe in time.
    pub async fn force_close(&self, limit: Duration) -> AppResult<()> {
        let mut clients = self.clients.lock().await;
        clients.count = 0;
        let result = match clients.session.take() {
            Some(session) => {
                debug!(channel = %self.name, "Closing channel administratively");
                session.disconnect_within(limit).await
            }
            None => Ok(()),
        };
        self.closed.send_replace(true);
        result
    }
}

/// An event already in the buffer, `None` when there is none left.
fn buffered(
    events: &mut broadcast::Receiver<SessionEvent>,
) -> Option<Result<SessionEvent, RecvError>> {
    match events.try_recv() {
        Ok(event) => Some(Ok(event)),
        Err(TryRecvError::Lagged(missed)) => Some(Err(RecvError::Lagged(missed))),
        Err(TryRecvError::Empty | TryRecvError::Closed) => None,
    }
}

/// One client's end of a [`SharedChannel`].
pub struct ChannelClient {
    channel: Arc<SharedChannel>,
    pending: Option<SessionEvent>,
    events: broadcast::Receiver<SessionEvent>,
    closed: watch::Receiver<bool>,
}

impl ChannelClient {
    /// Channel this client is connected to.
    pub fn channel(&self) -> &Arc<SharedChannel> {
        &self.channel
    }

    /// Next event. A client that fell behind gets a fresh `Open` instead of
    /// the events it missed. `None` once the channel is gone, or once it was
    /// closed and everything sent before that has been delivered.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        if let Some(event) = self.pending.take() {
            return Some(event);
        }
        let received = if *self.closed.borrow() {
            buffered(&mut self.events)?
        } else {
            tokio::select! {
                biased;
                received = self.events.recv() => received,
                _ = self.closed.changed() => buffered(&mut self.events)?,
            }
        };
        match received {
            Ok(event) => Some(event),
            Err(RecvError::Lagged(missed)) => {
                warn!(channel = %self.channel.name, missed, "Client lagged, resending snapshot");
                self.events = self.events.resubscribe();
                match self.channel.snapshot().await {
                    Some(snapshot) => Some(SessionEvent::Open { snapshot }),
                    None => Some(SessionEvent::Close),
                }
            }
            Err(RecvError::Closed) => None,
        }
    }

    /// Write through the channel's session.
    pub async fn put(&self, update: &Value) -> AppResult<()> {
        self.channel.session().await?.put(update).await
    }

    /// Invoke a method through the channel's session.
    pub async fn rpc(&self, invocation: Invocation) -> Result<Value, BoundaryFault> {
        match self.channel.session().await {
            Ok(session) => session.rpc(invocation).await,
            Err(err) => Err(crate::error_mapping::map_daq_error_to_fault(&err)),
        }
    }

    /// Leave the channel. The last client out disconnects the session.
    pub async fn disconnect(self) -> AppResult<()> {
        self.channel.release().await
    }
}

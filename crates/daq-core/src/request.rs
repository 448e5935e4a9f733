//! Requests and responses exchanged with a controller.
//!
//! Every request names a path `[mri, field, ...]` and carries a responder
//! channel. Exactly one terminal response (`Return` or `Error`) is sent per
//! request; a subscribe sends any number of `Update`/`Delta` responses first.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::changes::Change;
use crate::error::{DaqError, ErrorInfo};

/// Channel a requester receives responses on.
pub type ResponseSender = mpsc::UnboundedSender<Response>;

/// Receiving end of a [`ResponseSender`].
pub type ResponseReceiver = mpsc::UnboundedReceiver<Response>;

/// What a request asks for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RequestBody {
    /// Read the serialized value at the path.
    Get,
    /// Write an attribute.
    Put {
        /// New value.
        value: Value,
    },
    /// Invoke a method.
    Post {
        /// Call parameters.
        #[serde(default)]
        parameters: Map<String, Value>,
    },
    /// Stream the value at the path.
    Subscribe {
        /// Deliver deltas instead of whole values.
        #[serde(default)]
        delta: bool,
    },
    /// Stop the subscription with the same id and responder.
    Unsubscribe,
}

/// A request addressed to a block.
#[derive(Debug, Clone)]
pub struct Request {
    /// Caller-chosen id, echoed in every response.
    pub id: u64,
    /// `[mri, field, ...]`.
    pub path: Vec<String>,
    /// Operation.
    pub body: RequestBody,
    /// Where responses go.
    pub responder: ResponseSender,
}

impl Request {
    /// New request.
    pub fn new<S: Into<String>>(
        id: u64,
        path: impl IntoIterator<Item = S>,
        body: RequestBody,
        responder: ResponseSender,
    ) -> Self {
        Self {
            id,
            path: path.into_iter().map(Into::into).collect(),
            body,
            responder,
        }
    }

    /// Send the terminal response for `result`.
    pub fn respond(&self, result: Result<Value, DaqError>) {
        let response = match result {
            Ok(value) => Response::Return { id: self.id, value },
            Err(err) => Response::Error {
                id: self.id,
                error: err.to_info(),
            },
        };
        // Requester hung up; nothing to deliver to.
        let _ = self.responder.send(response);
    }
}

/// A response to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    /// Terminal success.
    Return {
        /// Request id.
        id: u64,
        /// Result value.
        value: Value,
    },
    /// Terminal failure.
    Error {
        /// Request id.
        id: u64,
        /// What went wrong.
        error: ErrorInfo,
    },
    /// Whole current value (non-delta subscription).
    Update {
        /// Request id.
        id: u64,
        /// Value at the subscribed path.
        value: Value,
    },
    /// Batch of changes (delta subscription).
    Delta {
        /// Request id.
        id: u64,
        /// Changes relative to the subscribed path, applied atomically.
        changes: Vec<Change>,
    },
}

impl Response {
    /// Id of the request this answers.
    pub fn id(&self) -> u64 {
        match self {
            Response::Return { id, .. }
            | Response::Error { id, .. }
            | Response::Update { id, .. }
            | Response::Delta { id, .. } => *id,
        }
    }

    /// True for `Return` and `Error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Response::Return { .. } | Response::Error { .. })
    }
}

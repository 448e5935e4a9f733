//! Ordered hook execution.
//!
//! A hook is a named life-cycle extension point. Running it starts every
//! part's handler in registration order and waits until all of them have
//! finished; the first failure cancels the rest and is returned. An optional
//! bound turns a hung handler into a `Timeout`.

use std::fmt;
use std::time::Duration;

use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use tracing::{debug, warn};

use crate::error::{AppResult, DaqError};
use crate::part::{Part, PartContext, PartEntry};

/// Life-cycle extension points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    Init,
    Halt,
    Reset,
    Disable,
    ReportStatus,
    Validate,
    Configure,
    Run,
    PostRunArmed,
    PostRunReady,
    Seek,
    Resume,
    Abort,
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Run `call` for every part in registration order and wait for all.
///
/// Results come back paired with the part name, in part order.
pub async fn run_hook<'a, T, F>(
    hook: Hook,
    parts: &'a [PartEntry],
    timeout: Option<Duration>,
    call: F,
) -> AppResult<Vec<(String, T)>>
where
    T: Send + 'a,
    F: Fn(&'a dyn Part, &'a PartContext) -> BoxFuture<'a, AppResult<T>>,
{
    debug!(%hook, parts = parts.len(), "Running hook");
    let handlers = parts.iter().map(|entry| {
        let name = entry.ctx.name();
        call(entry.part.as_ref(), &entry.ctx).map(move |result| match result {
            Ok(value) => Ok((name.to_string(), value)),
            Err(err) => {
                warn!(%hook, part = name, error = %err, "Hook handler failed");
                Err(err)
            }
        })
    });
    let all = try_join_all(handlers);
    match timeout {
        Some(limit) => tokio::time::timeout(limit, all)
            .await
            .map_err(|_| DaqError::Timeout(format!("{hook} hook after {limit:?}")))?,
        None => all.await,
    }
}

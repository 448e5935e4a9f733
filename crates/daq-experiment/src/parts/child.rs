//! Part driving a child block that is itself runnable.
//!
//! Every transition is delegated to the child's method of the same name.
//! While running, the child's `completedSteps` feeds the parent's progress
//! and the part waits for the child to pass through PostRun, failing fast if
//! it reaches Aborting, Disabling or Fault instead.
//!
//! The child's `configure` signature can change at runtime. Each change is
//! queued and followed by a rebuild on the parent's serialized context; a
//! rebuild always applies the newest queued signature, so the parent never
//! regresses to an older one whatever order the rebuilds run in.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use daq_core::controller::SubscriptionHandle;
use daq_core::error::{AppResult, DaqError};
use daq_core::model::MethodModel;
use daq_core::part::{ConfigureArgsNotifier, ParameterTweak, Params, PartInfo, ProgressReporter, StepRange};
use daq_core::request::Response;
use daq_core::view::BlockView;
use daq_core::{Part, PartContext};

use crate::states::RunState;

/// Child states that end a wait for PostRun with an error.
const BAD_STATES: [RunState; 3] = [RunState::Aborting, RunState::Disabling, RunState::Fault];

type RunHandle = JoinHandle<AppResult<Value>>;

// =============================================================================
// Configure-argument queue
// =============================================================================

/// FIFO of child `configure` signatures waiting to be applied.
pub struct ConfigureArgsQueue {
    pending: Mutex<VecDeque<MethodModel>>,
    notifier: ConfigureArgsNotifier,
}

impl ConfigureArgsQueue {
    /// Queue delivering to `notifier`.
    pub fn new(notifier: ConfigureArgsNotifier) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            notifier,
        }
    }

    /// Enqueue a new signature.
    pub fn push(&self, configure: MethodModel) {
        self.pending.lock().push_back(configure);
    }

    /// Apply the newest queued signature, discarding older ones. Returns
    /// false when an earlier rebuild already drained the queue.
    pub fn rebuild(&self) -> bool {
        let latest = self.pending.lock().drain(..).last();
        match latest {
            Some(configure) => {
                debug!(params = configure.takes.elements.len(), "Applying child configure arguments");
                self.notifier.update(configure.takes);
                true
            }
            None => false,
        }
    }

    /// Signatures not yet applied.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// True when nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

// =============================================================================
// Part
// =============================================================================

/// Delegates scan transitions to the child block `mri`.
pub struct RunnableChildPart {
    name: String,
    mri: String,
    design: Option<String>,
    monitor: Mutex<Option<(SubscriptionHandle, JoinHandle<()>)>>,
    run: Mutex<Option<RunHandle>>,
}

impl RunnableChildPart {
    /// Part named `name` controlling child `mri`.
    pub fn new(name: impl Into<String>, mri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mri: mri.into(),
            design: None,
            monitor: Mutex::new(None),
            run: Mutex::new(None),
        }
    }

    /// Design the child is switched to before each configure.
    pub fn with_design(mut self, design: impl Into<String>) -> Self {
        let design = design.into();
        self.design = (!design.is_empty()).then_some(design);
        self
    }

    /// MRI of the child.
    pub fn mri(&self) -> &str {
        &self.mri
    }

    fn child(&self, ctx: &PartContext) -> AppResult<BlockView> {
        ctx.context().block_view(&self.mri)
    }

    /// Keep only parameters the child's configure accepts.
    fn child_params(child: &BlockView, params: &Params) -> Params {
        match child.method_model("configure") {
            Some(configure) => params
                .iter()
                .filter(|(k, _)| configure.takes.elements.contains_key(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            None => Params::new(),
        }
    }

    async fn child_state(child: &BlockView) -> AppResult<Option<RunState>> {
        let value = child.value("state").await?;
        Ok(value.as_str().and_then(|s| s.parse().ok()))
    }

    /// Forward child progress, start `method` on the child and race its
    /// completion against the child passing through PostRun.
    async fn drive(&self, ctx: &PartContext, progress: &ProgressReporter, method: &str) -> AppResult<()> {
        let child = self.child(ctx)?;
        let reporter = progress.clone();
        ctx.context()
            .subscribe_value(&self.mri, "completedSteps", move |value| {
                if let Some(steps) = value.as_i64() {
                    reporter.report(steps);
                }
            })?;
        let post_run = ctx.context().when_value_matches(
            &self.mri,
            "state",
            json!(RunState::PostRun.as_str()),
            BAD_STATES.iter().map(|s| json!(s.as_str())).collect(),
        )?;
        let mut call = child.call_async(method, Map::new());

        tokio::select! {
            matched = post_run => match matched {
                Ok(()) => {
                    *self.run.lock() = Some(call);
                    Ok(())
                }
                Err(DaqError::BadValue(message)) => {
                    if Self::child_state(&child).await? == Some(RunState::Fault) {
                        // The child's own failure says more than the state wait.
                        return Err(joined(call.await));
                    }
                    Err(DaqError::BadValue(message))
                }
                Err(err) => Err(err),
            },
            finished = &mut call => match finished {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(err)) => Err(err),
                Err(join) => Err(DaqError::Internal(format!("{} {method} task failed: {join}", self.mri))),
            },
        }
    }
}

fn joined(result: Result<AppResult<Value>, tokio::task::JoinError>) -> DaqError {
    match result {
        Ok(Err(err)) => err,
        Ok(Ok(_)) => DaqError::Internal("child run succeeded after entering Fault".into()),
        Err(join) => DaqError::Internal(format!("child run task failed: {join}")),
    }
}

#[async_trait]
impl Part for RunnableChildPart {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self, ctx: &PartContext) -> AppResult<()> {
        let child = ctx.process().lookup(&self.mri)?;
        let (handle, mut rx) = child.subscribe(&["configure".to_string()], false)?.into_parts();
        let queue = Arc::new(ConfigureArgsQueue::new(ctx.configure_args_notifier()));

        // The first signature is applied before init returns.
        match rx.recv().await {
            Some(Response::Update { value, .. }) => {
                queue.push(serde_json::from_value(value)?);
                queue.rebuild();
            }
            other => {
                return Err(DaqError::Internal(format!(
                    "{} configure subscription ended early: {other:?}",
                    self.mri
                )))
            }
        }

        let parent = ctx.controller().clone();
        let mri = self.mri.clone();
        let task = tokio::spawn(async move {
            while let Some(response) = rx.recv().await {
                match response {
                    Response::Update { value, .. } => match serde_json::from_value::<MethodModel>(value) {
                        Ok(configure) => {
                            queue.push(configure);
                            let queue = queue.clone();
                            parent.spawn(async move {
                                queue.rebuild();
                            });
                        }
                        Err(err) => warn!(child = %mri, error = %err, "Unreadable configure signature"),
                    },
                    Response::Delta { .. } => {}
                    Response::Return { .. } | Response::Error { .. } => break,
                }
            }
            debug!(child = %mri, "Configure monitor finished");
        });
        if let Some((old, old_task)) = self.monitor.lock().replace((handle, task)) {
            old.unsubscribe();
            old_task.abort();
        }
        Ok(())
    }

    async fn halt(&self, _ctx: &PartContext) -> AppResult<()> {
        if let Some((handle, task)) = self.monitor.lock().take() {
            handle.unsubscribe();
            task.abort();
        }
        Ok(())
    }

    async fn report_status(&self, ctx: &PartContext) -> AppResult<Option<Value>> {
        let child = self.child(ctx)?;
        Ok(Some(json!({ "mri": self.mri, "state": child.value("state").await? })))
    }

    async fn reset(&self, ctx: &PartContext) -> AppResult<()> {
        self.run.lock().take();
        let child = self.child(ctx)?;
        if child.is_writeable("abort") {
            child.call("abort", Map::new()).await?;
        }
        if child.is_writeable("reset") {
            child.call("reset", Map::new()).await?;
        }
        Ok(())
    }

    async fn disable(&self, ctx: &PartContext) -> AppResult<()> {
        let child = self.child(ctx)?;
        if child.is_writeable("disable") {
            child.call("disable", Map::new()).await?;
        }
        Ok(())
    }

    async fn validate(&self, ctx: &PartContext, _info: &PartInfo, params: &Params) -> AppResult<Vec<ParameterTweak>> {
        let child = self.child(ctx)?;
        let returned = child.call("validate", Self::child_params(&child, params)).await?;
        let tweaks = returned
            .as_object()
            .into_iter()
            .flatten()
            .filter(|(k, v)| params.get(k.as_str()) != Some(*v))
            .map(|(k, v)| ParameterTweak::new(k.clone(), v.clone()))
            .collect();
        Ok(tweaks)
    }

    async fn configure(&self, ctx: &PartContext, steps: StepRange, _info: &PartInfo, params: &Params) -> AppResult<()> {
        let child = self.child(ctx)?;
        if steps.completed_steps > 0 && Self::child_state(&child).await? == Some(RunState::Armed) {
            // Segmented child already armed itself for the next segment.
            return Ok(());
        }
        if let Some(design) = &self.design {
            if child.has_field("design") {
                child.put_value("design", json!(design)).await?;
            }
        }
        child.call("configure", Self::child_params(&child, params)).await?;
        Ok(())
    }

    async fn run(&self, ctx: &PartContext, progress: &ProgressReporter) -> AppResult<()> {
        ctx.context().unsubscribe_all();
        self.drive(ctx, progress, "run").await
    }

    async fn post_run(&self, _ctx: &PartContext, _armed: bool) -> AppResult<()> {
        let pending = self.run.lock().take();
        match pending {
            Some(call) => match call.await {
                Ok(result) => result.map(|_| ()),
                Err(join) => Err(DaqError::Internal(format!("{} run task failed: {join}", self.mri))),
            },
            None => Ok(()),
        }
    }

    async fn seek(&self, ctx: &PartContext, steps: StepRange) -> AppResult<()> {
        ctx.context().unsubscribe_all();
        self.run.lock().take();
        let child = self.child(ctx)?;
        let mut params = Map::new();
        params.insert("lastGoodStep".into(), json!(steps.completed_steps));
        child.call("pause", params).await?;
        Ok(())
    }

    async fn resume(&self, ctx: &PartContext, progress: &ProgressReporter) -> AppResult<()> {
        self.drive(ctx, progress, "resume").await
    }

    async fn abort(&self, ctx: &PartContext) -> AppResult<()> {
        self.run.lock().take();
        let child = self.child(ctx)?;
        if child.is_writeable("abort") {
            child.call("abort", Map::new()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_core::model::{MapMeta, NumberType, VMeta};
    use daq_core::part::ConfigureArgsSink;
    use std::sync::Weak;

    #[derive(Default)]
    struct Captured {
        applied: Mutex<Vec<Vec<String>>>,
    }

    impl ConfigureArgsSink for Captured {
        fn update_configure_args(&self, _part: &str, args: MapMeta) {
            self.applied
                .lock()
                .push(args.elements.keys().map(str::to_string).collect());
        }
    }

    fn signature(params: &[&str]) -> MethodModel {
        let takes = params.iter().fold(MapMeta::new(), |takes, name| {
            takes.with_element(*name, VMeta::number(NumberType::Float64, *name), false)
        });
        MethodModel::new("configure").with_takes(takes)
    }

    #[test]
    fn rebuild_applies_latest_signature() {
        let sink = Arc::new(Captured::default());
        let weak: Weak<dyn ConfigureArgsSink> = Arc::downgrade(&sink) as Weak<dyn ConfigureArgsSink>;
        let queue = ConfigureArgsQueue::new(ConfigureArgsNotifier::new("child", Some(weak)));

        queue.push(signature(&["steps"]));
        queue.push(signature(&["steps", "exposure"]));
        assert_eq!(queue.len(), 2);

        // Both scheduled rebuilds run; the first consumes the newest entry.
        assert!(queue.rebuild());
        assert!(!queue.rebuild());
        assert!(queue.is_empty());
        assert_eq!(*sink.applied.lock(), vec![vec!["steps".to_string(), "exposure".to_string()]]);
    }

    #[test]
    fn design_is_optional() {
        assert_eq!(RunnableChildPart::new("c", "CHILD").with_design("").design, None);
        assert_eq!(
            RunnableChildPart::new("c", "CHILD").with_design("fast").design.as_deref(),
            Some("fast")
        );
    }
}

//! RunnableController - scan life-cycle state machine over a set of parts.
//!
//! The controller owns a block exposing `health`, `state`, `completedSteps`,
//! `configuredSteps`, `totalSteps` and one method per transition. Every
//! transition runs as an ordered hook over the registered parts and commits
//! the new state only after all of them finished.
//!
//! # Transitions
//!
//! ```text
//!   validate(params)  no state change, returns params with tweaks applied
//!   configure(params) Ready ─► Configuring ─► Armed
//!   run()             Armed ─► Running ─► PostRun ─► Ready | Armed
//!   pause(step)       Armed | Running | Paused ─► Seeking ─► Paused
//!   resume()          Paused ─► Running ─► PostRun ─► Ready | Armed
//!   abort()           abortable ─► Aborting ─► Aborted
//!   reset()           Fault | Aborted | Ready | Disabled ─► Resetting ─► Ready
//!   disable()         any but Disabling/Disabled ─► Disabling ─► Disabled
//!   any failure       ─► Fault (health carries the cause)
//! ```
//!
//! Configure, run, resume, seek and post-run work is wrapped in an abort
//! handle; pause, abort, reset and disable cancel it and release every
//! subscription the parts made through their contexts.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{AbortHandle, Abortable, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use daq_core::controller::MethodHandler;
use daq_core::error::{AppResult, DaqError};
use daq_core::hooks::{run_hook, Hook};
use daq_core::model::{Alarm, AttributeModel, BlockModel, Field, MapMeta, MethodModel, NumberType, VMeta};
use daq_core::part::{ConfigureArgsSink, ParameterTweak, Params, PartEntry, PartInfo, ProgressReporter, StepRange};
use daq_core::tags::Widget;
use daq_core::{Controller, Part, PartContext, Process, ProcessLifecycle};

use crate::states::{method_writeable, RunState};

use RunState::*;

/// Passes of the Validate hook before giving up on tweaks converging.
const VALIDATE_ITERATIONS: usize = 10;

const METHODS: [&str; 8] = [
    "validate",
    "configure",
    "run",
    "pause",
    "resume",
    "abort",
    "reset",
    "disable",
];

type ProgressSink = Arc<dyn Fn(&str, i64) + Send + Sync>;

/// What the last configure (or seek) set up.
#[derive(Clone)]
struct ScanSetup {
    range: StepRange,
    segment: i64,
    info: PartInfo,
    params: Params,
}

#[derive(Default)]
struct Progress {
    per_part: HashMap<String, i64>,
    completed: i64,
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles a [`RunnableController`] from parts.
pub struct RunnableControllerBuilder {
    mri: String,
    description: String,
    parts: Vec<Arc<dyn Part>>,
    hook_timeout: Option<Duration>,
}

impl RunnableControllerBuilder {
    /// Builder for a block registered under `mri`.
    pub fn new(mri: impl Into<String>) -> Self {
        let mri = mri.into();
        Self {
            description: format!("Scan controller {mri}"),
            mri,
            parts: Vec::new(),
            hook_timeout: None,
        }
    }

    /// Block description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Append a part. Hooks run in the order parts are added.
    pub fn with_part(mut self, part: Arc<dyn Part>) -> Self {
        self.parts.push(part);
        self
    }

    /// Bound every hook except run, resume and post-run.
    pub fn with_hook_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.hook_timeout = timeout;
        self
    }

    /// Build the block, register the controller with `process` and join the
    /// process lifecycle. The controller starts Disabled; [`Process::start`]
    /// runs Init and then resets it to Ready.
    pub fn build(self, process: &Arc<Process>) -> AppResult<Arc<RunnableController>> {
        let mut names = Vec::with_capacity(self.parts.len());
        for part in &self.parts {
            if names.contains(&part.name()) {
                return Err(DaqError::Configuration(format!(
                    "{} has two parts named '{}'",
                    self.mri,
                    part.name()
                )));
            }
            names.push(part.name());
        }

        let mut block = standard_block(&self.description)?;
        for part in &self.parts {
            part.setup(&mut block)?;
        }
        let controller = Controller::new(self.mri.clone(), block);
        let part_args: Vec<(String, MapMeta)> = self
            .parts
            .iter()
            .map(|p| (p.name().to_string(), p.configure_args()))
            .collect();

        let this = Arc::new_cyclic(|weak: &Weak<RunnableController>| {
            let sink: Weak<dyn ConfigureArgsSink> = weak.clone();
            let parts = self
                .parts
                .into_iter()
                .map(|part| PartEntry {
                    ctx: PartContext::new(part.name(), controller.clone(), process.clone(), Some(sink.clone())),
                    part,
                })
                .collect();
            let progress_weak = weak.clone();
            let progress_sink: ProgressSink = Arc::new(move |part: &str, steps: i64| {
                if let Some(this) = progress_weak.upgrade() {
                    this.update_completed_steps(part, steps);
                }
            });
            let (state_tx, _) = watch::channel(Disabled);
            RunnableController {
                controller,
                parts,
                state: Mutex::new(Disabled),
                state_tx,
                active: Mutex::new(None),
                setup: Mutex::new(None),
                progress: Mutex::new(Progress::default()),
                part_args: Mutex::new(part_args),
                progress_sink,
                hook_timeout: self.hook_timeout,
            }
        });

        this.register_methods();
        this.rebuild_configure_methods()?;
        process.add_controller(this.controller.clone())?;
        process.add_participant(this.clone());
        info!(mri = %this.mri(), parts = this.parts.len(), "Runnable controller built");
        Ok(this)
    }
}

fn read_only(meta: VMeta, value: Value) -> AppResult<Field> {
    Ok(Field::Attribute(
        AttributeModel::new(meta.with_tags([Widget::TextUpdate.tag()])).with_value(value)?,
    ))
}

fn standard_block(description: &str) -> AppResult<BlockModel> {
    let mut block = BlockModel::new(description);
    block.add_field("health", read_only(VMeta::string("Displays OK or an error message"), json!("OK"))?)?;
    block.add_field(
        "state",
        read_only(
            VMeta::choice(RunState::ALL.iter().map(|s| s.as_str()), "State of the block"),
            json!(Disabled.as_str()),
        )?,
    )?;
    for (name, description) in [
        ("completedSteps", "Readback of number of scan steps"),
        ("configuredSteps", "Number of steps currently configured"),
        ("totalSteps", "Number of steps contained in the scan"),
    ] {
        block.add_field(name, read_only(VMeta::number(NumberType::Int32, description), json!(0))?)?;
    }

    let takes = base_takes();
    let methods = [
        (
            "validate",
            MethodModel::new("Validate configuration parameters and return tweaked ones")
                .with_takes(takes.clone())
                .with_returns(takes.clone()),
        ),
        ("configure", MethodModel::new("Configure for a scan").with_takes(takes)),
        ("run", MethodModel::new("Start a configured scan and wait for it to finish")),
        (
            "pause",
            MethodModel::new("Pause a run so that it can be resumed later").with_takes(MapMeta::new().with_element(
                "lastGoodStep",
                VMeta::number(NumberType::Int32, "Step to seek back to").writeable(true),
                false,
            )),
        ),
        ("resume", MethodModel::new("Resume a paused scan")),
        ("abort", MethodModel::new("Abort the current operation")),
        ("reset", MethodModel::new("Reset from Fault, Aborted or Disabled")),
        ("disable", MethodModel::new("Stop all activity and disable")),
    ];
    for (name, mut method) in methods {
        method.writeable = method_writeable(name, Disabled);
        block.add_field(name, Field::Method(method))?;
    }
    Ok(block)
}

fn base_takes() -> MapMeta {
    MapMeta::new()
        .with_element(
            "steps",
            VMeta::number(NumberType::Int32, "Number of steps in the scan")
                .writeable(true)
                .with_tags([Widget::TextInput.tag()]),
            true,
        )
        .with_element(
            "segmentSteps",
            VMeta::number(NumberType::Int32, "Steps per run, 0 runs the whole scan")
                .writeable(true)
                .with_tags([Widget::TextInput.tag()]),
            false,
        )
}

fn describe_tweaks(tweaks: &[ParameterTweak]) -> String {
    tweaks
        .iter()
        .map(|t| format!("{} -> {}", t.parameter, t.value))
        .collect::<Vec<_>>()
        .join(", ")
}

fn method<F, Fut>(weak: &Weak<RunnableController>, call: F) -> MethodHandler
where
    F: Fn(Arc<RunnableController>, Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AppResult<Value>> + Send + 'static,
{
    let weak = weak.clone();
    Arc::new(move |params| match weak.upgrade() {
        Some(this) => call(this, params).boxed(),
        None => futures::future::ready(Err(DaqError::Internal("runnable controller dropped".into()))).boxed(),
    })
}

// =============================================================================
// Controller
// =============================================================================

/// Scan state machine driving an ordered set of parts.
pub struct RunnableController {
    controller: Arc<Controller>,
    parts: Vec<PartEntry>,
    state: Mutex<RunState>,
    state_tx: watch::Sender<RunState>,
    active: Mutex<Option<AbortHandle>>,
    setup: Mutex<Option<ScanSetup>>,
    progress: Mutex<Progress>,
    part_args: Mutex<Vec<(String, MapMeta)>>,
    progress_sink: ProgressSink,
    hook_timeout: Option<Duration>,
}

impl RunnableController {
    /// MRI of the block.
    pub fn mri(&self) -> &str {
        self.controller.mri()
    }

    /// The dispatch core owning the block.
    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// Current state.
    pub fn state(&self) -> RunState {
        *self.state.lock()
    }

    /// Stream of state changes.
    pub fn watch_state(&self) -> watch::Receiver<RunState> {
        self.state_tx.subscribe()
    }

    /// Current `health` text: "OK" or the fault cause.
    pub fn health(&self) -> String {
        self.controller
            .value("health")
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default()
    }

    /// Current `completedSteps`.
    pub fn completed_steps(&self) -> i64 {
        self.progress.lock().completed
    }

    fn register_methods(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let c = &self.controller;
        c.register_method(
            "validate",
            method(&weak, |this, params| async move { this.validate(params).await.map(Value::Object) }),
        );
        c.register_method(
            "configure",
            method(&weak, |this, params| async move { this.configure(params).await.map(|()| Value::Null) }),
        );
        c.register_method(
            "run",
            method(&weak, |this, _| async move { this.run().await.map(|()| Value::Null) }),
        );
        c.register_method(
            "pause",
            method(&weak, |this, params| async move {
                let step = params.get("lastGoodStep").and_then(Value::as_i64);
                this.pause(step).await.map(|()| Value::Null)
            }),
        );
        c.register_method(
            "resume",
            method(&weak, |this, _| async move { this.resume().await.map(|()| Value::Null) }),
        );
        c.register_method(
            "abort",
            method(&weak, |this, _| async move { this.abort().await.map(|()| Value::Null) }),
        );
        c.register_method(
            "reset",
            method(&weak, |this, _| async move { this.reset().await.map(|()| Value::Null) }),
        );
        c.register_method(
            "disable",
            method(&weak, |this, _| async move { this.disable().await.map(|()| Value::Null) }),
        );
    }

    // -------------------------------------------------------------------------
    // State bookkeeping
    // -------------------------------------------------------------------------

    fn transition(&self, allowed: &[RunState], to: RunState) -> AppResult<RunState> {
        self.change_state(|from| allowed.contains(&from), to, None)
    }

    /// Move to `to` if `accept(from)` and the table has the edge. State,
    /// health and method writeability change in one transaction.
    fn change_state(&self, accept: impl FnOnce(RunState) -> bool, to: RunState, fault: Option<&str>) -> AppResult<RunState> {
        let mut state = self.state.lock();
        let from = *state;
        if !accept(from) || !from.can_transition_to(to) {
            return Err(DaqError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        self.controller.transaction(|tx| {
            tx.set_value("state", to.as_str())?;
            match fault {
                Some(cause) => {
                    tx.set_value("health", cause)?;
                    tx.set_alarm("health", Alarm::major(cause))?;
                }
                None => {
                    tx.set_value("health", "OK")?;
                    tx.set_alarm("health", Alarm::ok())?;
                }
            }
            for name in METHODS {
                tx.set_writeable(name, method_writeable(name, to))?;
            }
            Ok(())
        })?;
        *state = to;
        self.state_tx.send_replace(to);
        info!(mri = %self.mri(), %from, %to, "State change");
        Ok(from)
    }

    /// Drive the machine into Fault with the cause of `err` and return the
    /// error callers should see.
    fn go_to_error(&self, err: DaqError) -> DaqError {
        let cause = err.fault_cause();
        error!(mri = %self.mri(), %cause, "Scan fault");
        if let Err(transition) = self.change_state(|_| true, Fault, Some(&cause)) {
            warn!(mri = %self.mri(), error = %transition, "Could not enter Fault");
        }
        DaqError::Fault { cause }
    }

    /// Cancellation is only expected while someone else moved the state
    /// away from `during`; anything else is a fault.
    fn fail(&self, during: RunState, err: DaqError) -> DaqError {
        if matches!(err, DaqError::Aborted(_)) && self.state() != during {
            debug!(mri = %self.mri(), %during, "Interrupted");
            return err;
        }
        self.go_to_error(err)
    }

    async fn abortable<T>(&self, during: RunState, work: impl Future<Output = AppResult<T>>) -> AppResult<T> {
        let registration = {
            let state = self.state.lock();
            if *state != during {
                return Err(DaqError::Aborted(format!("{} left {during}", self.mri())));
            }
            let (handle, registration) = AbortHandle::new_pair();
            *self.active.lock() = Some(handle);
            registration
        };
        let result = Abortable::new(work, registration).await;
        self.active.lock().take();
        result.unwrap_or_else(|_| Err(DaqError::Aborted(format!("{} {during} cancelled", self.mri()))))
    }

    fn cancel_active(&self) {
        if let Some(handle) = self.active.lock().take() {
            handle.abort();
        }
        for entry in &self.parts {
            entry.ctx.context().unsubscribe_all();
        }
    }

    fn hook<'a, T, F>(&'a self, hook: Hook, call: F) -> BoxFuture<'a, AppResult<Vec<(String, T)>>>
    where
        T: Send + 'a,
        F: Fn(&'a dyn Part, &'a PartContext) -> BoxFuture<'a, AppResult<T>> + Send + Sync + 'a,
    {
        // Run and Resume last as long as the scan does.
        let timeout = match hook {
            Hook::Run | Hook::Resume => None,
            _ => self.hook_timeout,
        };
        run_hook(hook, &self.parts, timeout, call).boxed()
    }

    // -------------------------------------------------------------------------
    // Progress
    // -------------------------------------------------------------------------

    /// `completedSteps` follows the slowest part that reported and only
    /// moves forward while Running.
    fn update_completed_steps(&self, part: &str, steps: i64) {
        let mut progress = self.progress.lock();
        progress.per_part.insert(part.to_string(), steps);
        let slowest = progress.per_part.values().copied().min().unwrap_or(0);
        if self.state() == Running && slowest > progress.completed {
            progress.completed = slowest;
            if let Err(err) = self.controller.set_value("completedSteps", slowest) {
                warn!(mri = %self.mri(), error = %err, "Failed to publish progress");
            }
        }
    }

    fn advance_completed_steps(&self, steps: i64) -> AppResult<()> {
        let mut progress = self.progress.lock();
        if steps > progress.completed {
            progress.completed = steps;
            self.controller.set_value("completedSteps", steps)?;
        }
        Ok(())
    }

    fn reset_progress(&self, completed: i64) -> AppResult<()> {
        let mut progress = self.progress.lock();
        progress.per_part.clear();
        progress.completed = completed;
        self.controller.set_value("completedSteps", completed)
    }

    // -------------------------------------------------------------------------
    // Configure arguments
    // -------------------------------------------------------------------------

    fn configure_takes(&self) -> MapMeta {
        let mut takes = base_takes();
        for (_, args) in self.part_args.lock().iter() {
            takes.merge(args);
        }
        takes
    }

    fn rebuild_configure_methods(&self) -> AppResult<()> {
        let takes = self.configure_takes();
        debug!(mri = %self.mri(), params = takes.elements.len(), "Rebuilding configure arguments");
        self.controller.transaction(|tx| {
            tx.update_method("validate", |m| {
                m.takes = takes.clone();
                m.returns = takes.clone();
            })?;
            tx.update_method("configure", |m| m.takes = takes.clone())
        })
    }

    fn check_params(&self, params: &Params) -> AppResult<Params> {
        let params = self.configure_takes().validate(params, &Map::new())?;
        let steps = params.get("steps").and_then(Value::as_i64).unwrap_or(0);
        if steps < 1 {
            return Err(DaqError::BadValue(format!("steps must be at least 1, got {steps}")));
        }
        if params.get("segmentSteps").and_then(Value::as_i64).unwrap_or(0) < 0 {
            return Err(DaqError::BadValue("segmentSteps cannot be negative".into()));
        }
        Ok(params)
    }

    async fn report_status(&self) -> AppResult<PartInfo> {
        let reports = self
            .hook(Hook::ReportStatus, |part, ctx| part.report_status(ctx))
            .await?;
        let mut info = PartInfo::default();
        for (part, report) in reports {
            if let Some(value) = report {
                info.insert(part, value);
            }
        }
        Ok(info)
    }

    async fn collect_tweaks(&self, info: &PartInfo, params: &Params) -> AppResult<Vec<ParameterTweak>> {
        let results = self
            .hook(Hook::Validate, |part, ctx| part.validate(ctx, info, params))
            .await?;
        Ok(results.into_iter().flat_map(|(_, tweaks)| tweaks).collect())
    }

    // -------------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------------

    /// Validate parameters, applying every tweak the parts propose until
    /// they agree. Never changes state.
    #[instrument(skip(self, params), fields(mri = %self.mri()), err)]
    pub async fn validate(&self, params: Params) -> AppResult<Params> {
        let mut params = self.check_params(&params)?;
        let info = self.report_status().await?;
        for _ in 0..VALIDATE_ITERATIONS {
            let tweaks = self.collect_tweaks(&info, &params).await?;
            if tweaks.is_empty() {
                return Ok(params);
            }
            debug!(mri = %self.mri(), tweaks = %describe_tweaks(&tweaks), "Applying parameter tweaks");
            for tweak in tweaks {
                params.insert(tweak.parameter, tweak.value);
            }
        }
        Err(DaqError::BadValue(format!(
            "parameter tweaks did not settle after {VALIDATE_ITERATIONS} passes"
        )))
    }

    /// Configure for a scan. Parameters that need tweaks are refused without
    /// a state change; the caller should validate and resubmit.
    #[instrument(skip(self, params), fields(mri = %self.mri()), err)]
    pub async fn configure(&self, params: Params) -> AppResult<()> {
        let state = self.state();
        if state != Ready {
            return Err(DaqError::InvalidTransition {
                from: state.to_string(),
                to: Configuring.to_string(),
            });
        }
        let params = self.check_params(&params)?;
        let info = self.report_status().await?;
        let tweaks = self.collect_tweaks(&info, &params).await?;
        if !tweaks.is_empty() {
            return Err(DaqError::BadValue(format!(
                "parameters need tweaks: {}",
                describe_tweaks(&tweaks)
            )));
        }
        self.transition(&[Ready], Configuring)?;
        self.do_configure(info, params)
            .await
            .map_err(|err| self.fail(Configuring, err))
    }

    async fn do_configure(&self, info: PartInfo, params: Params) -> AppResult<()> {
        let total = params.get("steps").and_then(Value::as_i64).unwrap_or(0);
        let segment = match params.get("segmentSteps").and_then(Value::as_i64) {
            Some(segment) if segment > 0 => segment.min(total),
            _ => total,
        };
        let range = StepRange {
            completed_steps: 0,
            steps_to_do: segment,
            total_steps: total,
        };
        let configure = self.hook(Hook::Configure, |part, ctx| part.configure(ctx, range, &info, &params));
        self.abortable(Configuring, configure).await?;
        self.reset_progress(0)?;
        self.controller.transaction(|tx| {
            tx.set_value("configuredSteps", range.steps_to_do)?;
            tx.set_value("totalSteps", total)
        })?;
        *self.setup.lock() = Some(ScanSetup {
            range,
            segment,
            info,
            params,
        });
        self.transition(&[Configuring], Armed)?;
        Ok(())
    }

    /// Run the configured steps and wait until the scan is Ready or Armed
    /// again. A pause in between keeps this waiting until resumed.
    #[instrument(skip(self), fields(mri = %self.mri()), err)]
    pub async fn run(&self) -> AppResult<()> {
        self.transition(&[Armed], Running)?;
        let result = self.run_segment(Hook::Run).await;
        self.settle(result).await
    }

    /// Continue a paused scan.
    #[instrument(skip(self), fields(mri = %self.mri()), err)]
    pub async fn resume(&self) -> AppResult<()> {
        self.transition(&[Paused], Running)?;
        let result = self.run_segment(Hook::Resume).await;
        self.settle(result).await
    }

    async fn run_segment(&self, hook: Hook) -> AppResult<()> {
        let sink = self.progress_sink.clone();
        let work = run_hook(hook, &self.parts, None, move |part, ctx| {
            let reporter = ProgressReporter::new(ctx.name(), sink.clone());
            async move {
                if hook == Hook::Resume {
                    part.resume(ctx, &reporter).await
                } else {
                    part.run(ctx, &reporter).await
                }
            }
            .boxed()
        });
        self.abortable(Running, work).await?;
        self.post_run().await
    }

    async fn post_run(&self) -> AppResult<()> {
        let setup = self
            .setup
            .lock()
            .clone()
            .ok_or_else(|| DaqError::Internal(format!("{} ran without a configuration", self.mri())))?;
        let range = setup.range;
        self.advance_completed_steps(range.steps_to_do)?;
        self.transition(&[Running], PostRun)?;

        if range.steps_to_do < range.total_steps {
            let post = run_hook(Hook::PostRunArmed, &self.parts, None, |part, ctx| part.post_run(ctx, true));
            self.abortable(PostRun, post).await?;
            let next = StepRange {
                completed_steps: range.steps_to_do,
                steps_to_do: (range.steps_to_do + setup.segment).min(range.total_steps),
                total_steps: range.total_steps,
            };
            let configure = self.hook(Hook::Configure, |part, ctx| {
                part.configure(ctx, next, &setup.info, &setup.params)
            });
            self.abortable(PostRun, configure).await?;
            self.controller.set_value("configuredSteps", next.steps_to_do)?;
            if let Some(current) = self.setup.lock().as_mut() {
                current.range = next;
            }
            self.transition(&[PostRun], Armed)?;
        } else {
            let post = run_hook(Hook::PostRunReady, &self.parts, None, |part, ctx| part.post_run(ctx, false));
            self.abortable(PostRun, post).await?;
            self.transition(&[PostRun], Ready)?;
        }
        Ok(())
    }

    /// A run interrupted by pause waits for the resume to finish the job;
    /// one interrupted by abort or disable reports that.
    async fn settle(&self, result: AppResult<()>) -> AppResult<()> {
        let reason = match result {
            Ok(()) => return Ok(()),
            Err(DaqError::Aborted(reason)) if !matches!(self.state(), Running | PostRun) => reason,
            Err(err) => return Err(self.go_to_error(err)),
        };
        let mut states = self.state_tx.subscribe();
        let settled = states
            .wait_for(|s| !matches!(s, Seeking | Paused | Running | PostRun))
            .await
            .map(|s| *s)
            .map_err(|_| DaqError::Internal(format!("{} state channel closed", self.mri())))?;
        match settled {
            Ready | Armed => Ok(()),
            Fault => Err(DaqError::Fault { cause: self.health() }),
            _ => Err(DaqError::Aborted(reason)),
        }
    }

    /// Pause, seeking back to `last_good_step` (default: current progress).
    #[instrument(skip(self), fields(mri = %self.mri()), err)]
    pub async fn pause(&self, last_good_step: Option<i64>) -> AppResult<()> {
        let setup = self
            .setup
            .lock()
            .clone()
            .ok_or_else(|| DaqError::BadValue(format!("{} is not configured", self.mri())))?;
        let completed = last_good_step.unwrap_or_else(|| self.completed_steps());
        if !(0..=setup.range.total_steps).contains(&completed) {
            return Err(DaqError::BadValue(format!(
                "lastGoodStep {completed} outside 0..={}",
                setup.range.total_steps
            )));
        }
        self.transition(&[Armed, Running, Paused], Seeking)?;
        self.cancel_active();
        self.reset_progress(completed)?;

        let steps_to_do = if completed < setup.range.steps_to_do {
            setup.range.steps_to_do
        } else {
            (completed + setup.segment).min(setup.range.total_steps)
        };
        let range = StepRange {
            completed_steps: completed,
            steps_to_do,
            total_steps: setup.range.total_steps,
        };
        let seek = self.hook(Hook::Seek, |part, ctx| part.seek(ctx, range));
        let result = self.abortable(Seeking, seek).await.and_then(|_| {
            self.controller.set_value("configuredSteps", range.steps_to_do)?;
            if let Some(current) = self.setup.lock().as_mut() {
                current.range = range;
            }
            self.transition(&[Seeking], Paused).map(|_| ())
        });
        result.map_err(|err| self.fail(Seeking, err))
    }

    /// Abort whatever is in progress.
    #[instrument(skip(self), fields(mri = %self.mri()), err)]
    pub async fn abort(&self) -> AppResult<()> {
        self.change_state(RunState::is_abortable, Aborting, None)?;
        self.cancel_active();
        match self.hook(Hook::Abort, |part, ctx| part.abort(ctx)).await {
            Ok(_) => self.transition(&[Aborting], Aborted).map(|_| ()),
            Err(err) => Err(self.go_to_error(err)),
        }
    }

    /// Return to Ready, clearing the last configuration.
    #[instrument(skip(self), fields(mri = %self.mri()), err)]
    pub async fn reset(&self) -> AppResult<()> {
        self.transition(&[Fault, Aborted, Ready, Disabled], Resetting)?;
        self.cancel_active();
        match self.hook(Hook::Reset, |part, ctx| part.reset(ctx)).await {
            Ok(_) => {
                self.setup.lock().take();
                self.reset_progress(0)?;
                self.controller.transaction(|tx| {
                    tx.set_value("configuredSteps", 0)?;
                    tx.set_value("totalSteps", 0)
                })?;
                self.transition(&[Resetting], Ready).map(|_| ())
            }
            Err(err) => Err(self.go_to_error(err)),
        }
    }

    /// Stop all activity.
    #[instrument(skip(self), fields(mri = %self.mri()), err)]
    pub async fn disable(&self) -> AppResult<()> {
        self.change_state(|s| !matches!(s, Disabling | Disabled), Disabling, None)?;
        self.cancel_active();
        match self.hook(Hook::Disable, |part, ctx| part.disable(ctx)).await {
            Ok(_) => self.transition(&[Disabling], Disabled).map(|_| ()),
            Err(err) => Err(self.go_to_error(err)),
        }
    }

    /// Run the Init hook, then reset to Ready.
    #[instrument(skip(self), fields(mri = %self.mri()), err)]
    pub async fn init(&self) -> AppResult<()> {
        self.hook(Hook::Init, |part, ctx| part.init(ctx))
            .await
            .map_err(|err| self.go_to_error(err))?;
        self.reset().await
    }

    /// Cancel any activity and run the Halt hook.
    #[instrument(skip(self), fields(mri = %self.mri()), err)]
    pub async fn halt(&self) -> AppResult<()> {
        self.cancel_active();
        self.hook(Hook::Halt, |part, ctx| part.halt(ctx)).await?;
        Ok(())
    }
}

impl ConfigureArgsSink for RunnableController {
    fn update_configure_args(&self, part: &str, args: MapMeta) {
        {
            let mut all = self.part_args.lock();
            match all.iter_mut().find(|(name, _)| name == part) {
                Some((_, current)) => *current = args,
                None => all.push((part.to_string(), args)),
            }
        }
        if let Err(err) = self.rebuild_configure_methods() {
            warn!(mri = %self.mri(), part, error = %err, "Failed to rebuild configure arguments");
        }
    }
}

#[async_trait]
impl ProcessLifecycle for RunnableController {
    fn name(&self) -> &str {
        self.mri()
    }

    async fn on_start(&self) -> AppResult<()> {
        self.init().await
    }

    async fn on_stop(&self) -> AppResult<()> {
        self.halt().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        min_steps: i64,
    }

    #[async_trait]
    impl Part for Recording {
        fn name(&self) -> &str {
            self.name
        }

        async fn reset(&self, _ctx: &PartContext) -> AppResult<()> {
            self.log.lock().push(format!("{}:reset", self.name));
            Ok(())
        }

        async fn validate(&self, _ctx: &PartContext, _info: &PartInfo, params: &Params) -> AppResult<Vec<ParameterTweak>> {
            let steps = params.get("steps").and_then(Value::as_i64).unwrap_or(0);
            if steps < self.min_steps {
                return Ok(vec![ParameterTweak::new("steps", self.min_steps)]);
            }
            Ok(Vec::new())
        }

        async fn configure(&self, _ctx: &PartContext, steps: StepRange, _info: &PartInfo, _params: &Params) -> AppResult<()> {
            self.log
                .lock()
                .push(format!("{}:configure {}/{}", self.name, steps.steps_to_do, steps.total_steps));
            Ok(())
        }

        async fn run(&self, _ctx: &PartContext, progress: &ProgressReporter) -> AppResult<()> {
            self.log.lock().push(format!("{}:run", self.name));
            progress.report(1);
            Ok(())
        }

        async fn post_run(&self, _ctx: &PartContext, armed: bool) -> AppResult<()> {
            self.log.lock().push(format!("{}:post_run armed={armed}", self.name));
            Ok(())
        }
    }

    async fn started(parts: &[(&'static str, i64)]) -> (Arc<RunnableController>, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let process = Process::new("test");
        let mut builder = RunnableControllerBuilder::new("SCAN");
        for &(name, min_steps) in parts {
            builder = builder.with_part(Arc::new(Recording {
                name,
                log: log.clone(),
                min_steps,
            }));
        }
        let scan = builder.build(&process).unwrap();
        process.start().await.unwrap();
        log.lock().clear();
        (scan, log)
    }

    fn steps(n: i64) -> Params {
        let mut params = Params::new();
        params.insert("steps".into(), json!(n));
        params
    }

    #[tokio::test]
    async fn starts_disabled_and_init_resets_to_ready() {
        let process = Process::new("test");
        let scan = RunnableControllerBuilder::new("SCAN").build(&process).unwrap();
        assert_eq!(scan.state(), Disabled);
        process.start().await.unwrap();
        assert_eq!(scan.state(), Ready);
        assert_eq!(scan.controller().value("state").unwrap(), json!("Ready"));
    }

    #[tokio::test]
    #[traced_test]
    async fn state_changes_are_logged() {
        let (scan, _log) = started(&[("a", 0)]).await;
        scan.configure(steps(1)).await.unwrap();
        assert!(logs_contain("State change"));
        assert!(logs_contain("to=Armed"));
    }

    #[tokio::test]
    async fn duplicate_part_names_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let process = Process::new("test");
        let part = |log: &Arc<Mutex<Vec<String>>>| {
            Arc::new(Recording {
                name: "det",
                log: log.clone(),
                min_steps: 0,
            })
        };
        let err = RunnableControllerBuilder::new("SCAN")
            .with_part(part(&log))
            .with_part(part(&log))
            .build(&process)
            .err()
            .unwrap();
        assert!(matches!(err, DaqError::Configuration(_)));
    }

    #[tokio::test]
    async fn configure_and_run_visit_parts_in_order() {
        let (scan, log) = started(&[("a", 0), ("b", 0)]).await;
        scan.configure(steps(4)).await.unwrap();
        assert_eq!(scan.state(), Armed);
        scan.run().await.unwrap();
        assert_eq!(scan.state(), Ready);
        assert_eq!(scan.completed_steps(), 4);
        assert_eq!(
            *log.lock(),
            vec![
                "a:configure 4/4",
                "b:configure 4/4",
                "a:run",
                "b:run",
                "a:post_run armed=false",
                "b:post_run armed=false",
            ]
        );
    }

    #[tokio::test]
    async fn segmented_scan_returns_to_armed() {
        let (scan, log) = started(&[("a", 0)]).await;
        let mut params = steps(10);
        params.insert("segmentSteps".into(), json!(4));
        scan.configure(params).await.unwrap();
        scan.run().await.unwrap();
        assert_eq!(scan.state(), Armed);
        assert_eq!(scan.controller().value("configuredSteps").unwrap(), json!(8));
        scan.run().await.unwrap();
        scan.run().await.unwrap();
        assert_eq!(scan.state(), Ready);
        assert_eq!(scan.completed_steps(), 10);
        assert!(log.lock().contains(&"a:configure 10/10".to_string()));
    }

    #[tokio::test]
    async fn validate_applies_tweaks_without_changing_state() {
        let (scan, _log) = started(&[("a", 5)]).await;
        let out = scan.validate(steps(2)).await.unwrap();
        assert_eq!(out.get("steps"), Some(&json!(5)));
        assert_eq!(scan.state(), Ready);
    }

    #[tokio::test]
    async fn configure_refuses_parameters_needing_tweaks() {
        let (scan, log) = started(&[("a", 5)]).await;
        let err = scan.configure(steps(2)).await.unwrap_err();
        assert!(matches!(err, DaqError::BadValue(ref m) if m.contains("steps -> 5")));
        assert_eq!(scan.state(), Ready);
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn method_writeability_tracks_state() {
        let (scan, _log) = started(&[]).await;
        let writeable = |name: &str| scan.controller().with_block(|b| b.method(name).map(|m| m.writeable));
        assert_eq!(writeable("configure"), Some(true));
        assert_eq!(writeable("run"), Some(false));
        scan.configure(steps(1)).await.unwrap();
        assert_eq!(writeable("configure"), Some(false));
        assert_eq!(writeable("run"), Some(true));
        let err = scan
            .controller()
            .post(&["configure".to_string()], steps(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::NotWritable(_)));
    }

    #[tokio::test]
    async fn abort_then_reset() {
        let (scan, _log) = started(&[("a", 0)]).await;
        scan.configure(steps(3)).await.unwrap();
        scan.abort().await.unwrap();
        assert_eq!(scan.state(), Aborted);
        assert!(matches!(scan.run().await, Err(DaqError::InvalidTransition { .. })));
        scan.reset().await.unwrap();
        assert_eq!(scan.state(), Ready);
        assert_eq!(scan.controller().value("totalSteps").unwrap(), json!(0));
    }

    #[tokio::test]
    async fn disable_then_reset() {
        let (scan, _log) = started(&[("a", 0)]).await;
        scan.disable().await.unwrap();
        assert_eq!(scan.state(), Disabled);
        assert!(scan.disable().await.is_err());
        scan.reset().await.unwrap();
        assert_eq!(scan.state(), Ready);
    }

    #[tokio::test]
    async fn zero_steps_is_bad_value() {
        let (scan, _log) = started(&[]).await;
        assert!(matches!(scan.validate(steps(0)).await, Err(DaqError::BadValue(_))));
    }
}

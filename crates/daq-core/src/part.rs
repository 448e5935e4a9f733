//! Parts: pluggable behaviour attached to a controller.
//!
//! A controller is assembled from an ordered list of parts. Each part may
//! add fields to the block during [`Part::setup`] and may handle any of the
//! life-cycle hooks. Every hook has a no-op default, so a part only
//! implements what it cares about.
//!
//! ```rust,ignore
//! struct ShutterPart;
//!
//! #[async_trait]
//! impl Part for ShutterPart {
//!     fn name(&self) -> &str { "shutter" }
//!
//!     async fn run(&self, ctx: &PartContext, _progress: &ProgressReporter) -> AppResult<()> {
//!         ctx.context().block_view("SHUTTER")?.put_value("open", true.into()).await
//!     }
//! }
//! ```

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::controller::Controller;
use crate::error::AppResult;
use crate::model::{BlockModel, MapMeta};
use crate::process::Process;
use crate::view::Context;

/// Validated configure/validate parameters.
pub type Params = Map<String, Value>;

/// A correction a part proposes for one parameter during validate.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterTweak {
    /// Parameter name.
    pub parameter: String,
    /// Value the part would accept.
    pub value: Value,
}

impl ParameterTweak {
    /// New tweak.
    pub fn new(parameter: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            parameter: parameter.into(),
            value: value.into(),
        }
    }
}

/// Status info reported by each part before validate and configure.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartInfo {
    entries: Vec<(String, Value)>,
}

impl PartInfo {
    /// Record info reported by `part`.
    pub fn insert(&mut self, part: impl Into<String>, info: Value) {
        self.entries.push((part.into(), info));
    }

    /// Info reported by `part`.
    pub fn get(&self, part: &str) -> Option<&Value> {
        self.entries.iter().find(|(p, _)| p == part).map(|(_, v)| v)
    }

    /// Every (part, info) pair in part order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(p, v)| (p.as_str(), v))
    }
}

/// Where a configure or seek places the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepRange {
    /// Steps already done.
    pub completed_steps: i64,
    /// Last step this segment should reach.
    pub steps_to_do: i64,
    /// Steps in the whole scan.
    pub total_steps: i64,
}

type ProgressSink = Arc<dyn Fn(&str, i64) + Send + Sync>;

/// Channel through which a part reports completed steps while running.
#[derive(Clone)]
pub struct ProgressReporter {
    part: String,
    sink: ProgressSink,
}

impl ProgressReporter {
    /// Reporter for `part` delivering to `sink`.
    pub fn new(part: impl Into<String>, sink: ProgressSink) -> Self {
        Self {
            part: part.into(),
            sink,
        }
    }

    /// Report that `completed_steps` are done.
    pub fn report(&self, completed_steps: i64) {
        (self.sink)(&self.part, completed_steps);
    }
}

/// Receiver of live configure-argument changes from a part.
pub trait ConfigureArgsSink: Send + Sync {
    /// `part` now takes `args` in validate/configure.
    fn update_configure_args(&self, part: &str, args: MapMeta);
}

/// Detached handle through which a background task of a part reports
/// configure-argument changes.
#[derive(Clone)]
pub struct ConfigureArgsNotifier {
    part: String,
    sink: Option<Weak<dyn ConfigureArgsSink>>,
}

impl ConfigureArgsNotifier {
    /// Notifier for `part` delivering to `sink`.
    pub fn new(part: impl Into<String>, sink: Option<Weak<dyn ConfigureArgsSink>>) -> Self {
        Self {
            part: part.into(),
            sink,
        }
    }

    /// Deliver `args`; a dropped controller is ignored.
    pub fn update(&self, args: MapMeta) {
        if let Some(sink) = self.sink.as_ref().and_then(Weak::upgrade) {
            sink.update_configure_args(&self.part, args);
        }
    }
}

/// Everything a part can reach from inside a hook.
pub struct PartContext {
    name: String,
    controller: Arc<Controller>,
    context: Context,
    args_sink: Option<Weak<dyn ConfigureArgsSink>>,
}

impl PartContext {
    /// Context for part `name` of `controller`.
    pub fn new(
        name: impl Into<String>,
        controller: Arc<Controller>,
        process: Arc<Process>,
        args_sink: Option<Weak<dyn ConfigureArgsSink>>,
    ) -> Self {
        Self {
            name: name.into(),
            controller,
            context: Context::new(process),
            args_sink,
        }
    }

    /// Part name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Controller owning the part.
    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// Subscription-tracking access to other blocks.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Owning process.
    pub fn process(&self) -> &Arc<Process> {
        self.context.process()
    }

    /// Tell the owning controller this part's configure arguments changed.
    pub fn update_configure_args(&self, args: MapMeta) {
        self.configure_args_notifier().update(args);
    }

    /// Handle for reporting configure-argument changes from a spawned task.
    pub fn configure_args_notifier(&self) -> ConfigureArgsNotifier {
        ConfigureArgsNotifier::new(self.name.clone(), self.args_sink.clone())
    }
}

/// Behaviour attached to a controller.
#[async_trait]
pub trait Part: Send + Sync {
    /// Unique name within the controller.
    fn name(&self) -> &str;

    /// Add fields to the block being assembled.
    fn setup(&self, _block: &mut BlockModel) -> AppResult<()> {
        Ok(())
    }

    /// Parameters this part adds to validate/configure.
    fn configure_args(&self) -> MapMeta {
        MapMeta::new()
    }

    /// Process started.
    async fn init(&self, _ctx: &PartContext) -> AppResult<()> {
        Ok(())
    }

    /// Process stopping.
    async fn halt(&self, _ctx: &PartContext) -> AppResult<()> {
        Ok(())
    }

    /// Reset transition.
    async fn reset(&self, _ctx: &PartContext) -> AppResult<()> {
        Ok(())
    }

    /// Disable transition.
    async fn disable(&self, _ctx: &PartContext) -> AppResult<()> {
        Ok(())
    }

    /// Status info gathered before validate and configure.
    async fn report_status(&self, _ctx: &PartContext) -> AppResult<Option<Value>> {
        Ok(None)
    }

    /// Check parameters; return corrections instead of failing.
    async fn validate(
        &self,
        _ctx: &PartContext,
        _info: &PartInfo,
        _params: &Params,
    ) -> AppResult<Vec<ParameterTweak>> {
        Ok(Vec::new())
    }

    /// Configure transition.
    async fn configure(
        &self,
        _ctx: &PartContext,
        _steps: StepRange,
        _info: &PartInfo,
        _params: &Params,
    ) -> AppResult<()> {
        Ok(())
    }

    /// Run transition.
    async fn run(&self, _ctx: &PartContext, _progress: &ProgressReporter) -> AppResult<()> {
        Ok(())
    }

    /// Post-run; `armed` is true when more steps remain.
    async fn post_run(&self, _ctx: &PartContext, _armed: bool) -> AppResult<()> {
        Ok(())
    }

    /// Seek (pause) to a step.
    async fn seek(&self, _ctx: &PartContext, _steps: StepRange) -> AppResult<()> {
        Ok(())
    }

    /// Resume after a pause.
    async fn resume(&self, _ctx: &PartContext, _progress: &ProgressReporter) -> AppResult<()> {
        Ok(())
    }

    /// Abort transition.
    async fn abort(&self, _ctx: &PartContext) -> AppResult<()> {
        Ok(())
    }
}

/// A part together with its context, as held by a controller.
pub struct PartEntry {
    /// The part.
    pub part: Arc<dyn Part>,
    /// Its context.
    pub ctx: PartContext,
}

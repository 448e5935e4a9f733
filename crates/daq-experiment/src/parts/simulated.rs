//! Simulated stepping detector.
//!
//! Steps at a fixed interval while running, reporting each completed step.
//! Exposure is a configure parameter with a lower bound (values below it
//! come back from validate as a tweak) and a fault can be injected at a
//! given step to exercise the Fault path.
//!
//! # Performance Characteristics
//!
//! - One step per `step_interval` (10ms unless configured)
//! - No work between steps, so pause and abort take effect immediately

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::debug;

use daq_core::error::{AppResult, DaqError};
use daq_core::model::{AttributeModel, BlockModel, Field, MapMeta, NumberType, VMeta};
use daq_core::part::{ParameterTweak, Params, PartInfo, ProgressReporter, StepRange};
use daq_core::tags::{config_tag, Widget};
use daq_core::{Part, PartContext};

const DEFAULT_EXPOSURE: f64 = 0.1;

/// Names accepted by the `design` attribute.
pub const DESIGNS: [&str; 3] = ["", "fast", "slow"];

#[derive(Debug, Default)]
struct StepState {
    completed: i64,
    steps_to_do: i64,
}

/// Simulated detector part.
pub struct SimulatedStepsPart {
    name: String,
    step_interval: Duration,
    min_exposure: f64,
    fault_at_step: Option<i64>,
    steps: Mutex<StepState>,
}

impl SimulatedStepsPart {
    /// Detector stepping every `step_interval`.
    pub fn new(name: impl Into<String>, step_interval: Duration) -> Self {
        Self {
            name: name.into(),
            step_interval,
            min_exposure: 0.01,
            fault_at_step: None,
            steps: Mutex::new(StepState::default()),
        }
    }

    /// Smallest exposure validate lets through.
    pub fn with_min_exposure(mut self, min_exposure: f64) -> Self {
        self.min_exposure = min_exposure;
        self
    }

    /// Fail with a Fault when step `step` is reached.
    pub fn with_fault_at_step(mut self, step: Option<i64>) -> Self {
        self.fault_at_step = step;
        self
    }

    fn exposure(params: &Params) -> f64 {
        params
            .get("exposure")
            .and_then(Value::as_f64)
            .unwrap_or(DEFAULT_EXPOSURE)
    }

    async fn step_until_done(&self, ctx: &PartContext, progress: &ProgressReporter) -> AppResult<()> {
        loop {
            let (completed, target) = {
                let steps = self.steps.lock();
                (steps.completed, steps.steps_to_do)
            };
            if completed >= target {
                return Ok(());
            }
            sleep(self.step_interval).await;
            let next = completed + 1;
            if self.fault_at_step == Some(next) {
                return Err(DaqError::Fault {
                    cause: format!("{} overheated at step {next}", ctx.controller().mri()),
                });
            }
            self.steps.lock().completed = next;
            progress.report(next);
        }
    }
}

#[async_trait]
impl Part for SimulatedStepsPart {
    fn name(&self) -> &str {
        &self.name
    }

    fn setup(&self, block: &mut BlockModel) -> AppResult<()> {
        block.add_field(
            "exposure",
            Field::Attribute(
                AttributeModel::new(
                    VMeta::number(NumberType::Float64, "Exposure time of each step in seconds")
                        .with_tags([Widget::TextUpdate.tag()]),
                )
                .with_value(json!(DEFAULT_EXPOSURE))?,
            ),
        )?;
        block.add_field(
            "design",
            Field::Attribute(AttributeModel::new(
                VMeta::choice(DESIGNS, "Design to load on configure")
                    .writeable(true)
                    .with_tags([Widget::Combo.tag(), config_tag(1)]),
            )),
        )
    }

    fn configure_args(&self) -> MapMeta {
        MapMeta::new().with_element(
            "exposure",
            VMeta::number(NumberType::Float64, "Exposure time of each step in seconds")
                .writeable(true)
                .with_tags([Widget::TextInput.tag()]),
            false,
        )
    }

    async fn reset(&self, _ctx: &PartContext) -> AppResult<()> {
        *self.steps.lock() = StepState::default();
        Ok(())
    }

    async fn report_status(&self, ctx: &PartContext) -> AppResult<Option<Value>> {
        Ok(Some(json!({ "design": ctx.controller().value("design")? })))
    }

    async fn validate(&self, _ctx: &PartContext, _info: &PartInfo, params: &Params) -> AppResult<Vec<ParameterTweak>> {
        let exposure = Self::exposure(params);
        if exposure < self.min_exposure {
            debug!(part = %self.name, exposure, min = self.min_exposure, "Exposure below minimum");
            return Ok(vec![ParameterTweak::new("exposure", self.min_exposure)]);
        }
        Ok(Vec::new())
    }

    async fn configure(&self, ctx: &PartContext, steps: StepRange, _info: &PartInfo, params: &Params) -> AppResult<()> {
        *self.steps.lock() = StepState {
            completed: steps.completed_steps,
            steps_to_do: steps.steps_to_do,
        };
        ctx.controller().set_value("exposure", Self::exposure(params))
    }

    async fn run(&self, ctx: &PartContext, progress: &ProgressReporter) -> AppResult<()> {
        self.step_until_done(ctx, progress).await
    }

    async fn seek(&self, _ctx: &PartContext, steps: StepRange) -> AppResult<()> {
        *self.steps.lock() = StepState {
            completed: steps.completed_steps,
            steps_to_do: steps.steps_to_do,
        };
        Ok(())
    }

    async fn resume(&self, ctx: &PartContext, progress: &ProgressReporter) -> AppResult<()> {
        self.step_until_done(ctx, progress).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runnable::RunnableControllerBuilder;
    use crate::states::RunState;
    use daq_core::Process;
    use std::sync::Arc;

    async fn detector(fault_at_step: Option<i64>) -> Arc<crate::runnable::RunnableController> {
        let process = Process::new("test");
        let det = RunnableControllerBuilder::new("DET")
            .with_part(Arc::new(
                SimulatedStepsPart::new("sim", Duration::from_millis(1)).with_fault_at_step(fault_at_step),
            ))
            .build(&process)
            .unwrap();
        process.start().await.unwrap();
        det
    }

    fn params(steps: i64, exposure: f64) -> Params {
        let mut params = Params::new();
        params.insert("steps".into(), json!(steps));
        params.insert("exposure".into(), json!(exposure));
        params
    }

    #[tokio::test]
    async fn short_exposure_is_tweaked_to_minimum() {
        let det = detector(None).await;
        let out = det.validate(params(3, 0.001)).await.unwrap();
        assert_eq!(out.get("exposure"), Some(&json!(0.01)));
    }

    #[tokio::test]
    async fn steps_through_the_scan() {
        let det = detector(None).await;
        det.configure(params(5, 0.2)).await.unwrap();
        assert_eq!(det.controller().value("exposure").unwrap(), json!(0.2));
        det.run().await.unwrap();
        assert_eq!(det.state(), RunState::Ready);
        assert_eq!(det.completed_steps(), 5);
    }

    #[tokio::test]
    async fn injected_fault_carries_cause() {
        let det = detector(Some(2)).await;
        det.configure(params(5, 0.2)).await.unwrap();
        let err = det.run().await.unwrap_err();
        assert!(matches!(err, DaqError::Fault { ref cause } if cause == "DET overheated at step 2"));
        assert_eq!(det.state(), RunState::Fault);
        assert_eq!(det.health(), "DET overheated at step 2");
    }
}

//! End-to-end scans: a SCAN block driving a simulated DET child.

use std::sync::Arc;
use std::time::Duration;

use daq_core::error::DaqError;
use daq_core::part::Params;
use daq_core::request::Response;
use daq_core::Process;
use daq_experiment::parts::{RunnableChildPart, SimulatedStepsPart};
use daq_experiment::{RunState, RunnableController, RunnableControllerBuilder};
use serde_json::{json, Value};
use tokio::time::{sleep, timeout};

struct Rig {
    det: Arc<RunnableController>,
    scan: Arc<RunnableController>,
}

async fn rig(step_ms: u64, fault_at_step: Option<i64>) -> Rig {
    let process = Process::new("scan-test");
    let det = RunnableControllerBuilder::new("DET")
        .with_part(Arc::new(
            SimulatedStepsPart::new("sim", Duration::from_millis(step_ms)).with_fault_at_step(fault_at_step),
        ))
        .build(&process)
        .unwrap();
    let scan = RunnableControllerBuilder::new("SCAN")
        .with_part(Arc::new(RunnableChildPart::new("det", "DET").with_design("fast")))
        .build(&process)
        .unwrap();
    process.start().await.unwrap();
    Rig { det, scan }
}

fn params(steps: i64, exposure: f64) -> Params {
    let mut params = Params::new();
    params.insert("steps".into(), json!(steps));
    params.insert("exposure".into(), json!(exposure));
    params
}

async fn wait_until(what: &str, check: impl Fn() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !check() {
            sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

fn configure_params(rc: &RunnableController) -> Vec<String> {
    rc.controller().with_block(|b| {
        b.method("configure")
            .map(|m| m.takes.elements.keys().map(str::to_string).collect())
            .unwrap_or_default()
    })
}

#[tokio::test]
async fn configure_then_run_reports_monotonic_progress() {
    let rig = rig(2, None).await;
    let scan_ctrl = rig.scan.controller();
    let mut progress = scan_ctrl
        .subscribe(&["completedSteps".into(), "value".into()], false)
        .unwrap();
    let mut states = scan_ctrl.subscribe(&["state".into(), "value".into()], false).unwrap();

    rig.scan.configure(params(20, 0.1)).await.unwrap();
    assert_eq!(rig.scan.state(), RunState::Armed);
    assert_eq!(rig.det.state(), RunState::Armed);
    assert_eq!(rig.det.controller().value("design").unwrap(), json!("fast"));

    timeout(Duration::from_secs(5), rig.scan.run()).await.unwrap().unwrap();
    assert_eq!(rig.scan.state(), RunState::Ready);
    assert_eq!(rig.scan.completed_steps(), 20);

    progress.handle().unsubscribe();
    let mut seen = Vec::new();
    while let Some(response) = progress.recv().await {
        match response {
            Response::Update { value, .. } => seen.push(value.as_i64().unwrap()),
            _ => break,
        }
    }
    assert_eq!(seen.last(), Some(&20));
    // Configure resets to zero before the run starts; from there on it only grows.
    let run_part = &seen[seen.iter().rposition(|&v| v == 0).unwrap()..];
    assert!(run_part.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");

    states.handle().unsubscribe();
    let mut visited = Vec::new();
    while let Some(Response::Update { value, .. }) = states.recv().await {
        visited.push(value.as_str().unwrap().to_string());
    }
    let tail: Vec<_> = visited.iter().skip_while(|s| *s != "Running").map(String::as_str).collect();
    assert_eq!(tail, vec!["Running", "PostRun", "Ready"]);
}

#[tokio::test]
async fn child_fault_cause_is_reraised() {
    let rig = rig(1, Some(3)).await;
    rig.scan.configure(params(10, 0.1)).await.unwrap();
    let err = timeout(Duration::from_secs(5), rig.scan.run()).await.unwrap().unwrap_err();
    match err {
        DaqError::Fault { cause } => assert_eq!(cause, "DET overheated at step 3"),
        other => panic!("expected the child's fault, got {other:?}"),
    }
    assert_eq!(rig.scan.state(), RunState::Fault);
    assert_eq!(rig.det.state(), RunState::Fault);
    assert_eq!(rig.scan.health(), "DET overheated at step 3");

    rig.scan.reset().await.unwrap();
    assert_eq!(rig.scan.state(), RunState::Ready);
    assert_eq!(rig.det.state(), RunState::Ready);
}

#[tokio::test]
async fn validate_never_changes_state() {
    let rig = rig(1, None).await;
    let out = rig.scan.validate(params(5, 0.001)).await.unwrap();
    assert_eq!(out.get("exposure"), Some(&json!(0.01)));
    assert_eq!(rig.scan.state(), RunState::Ready);

    let err = rig.scan.configure(params(5, 0.001)).await.unwrap_err();
    assert!(matches!(err, DaqError::BadValue(_)));
    assert_eq!(rig.scan.state(), RunState::Ready);
    assert_eq!(rig.det.state(), RunState::Ready);

    rig.scan.configure(params(5, 0.1)).await.unwrap();
    rig.scan.validate(params(5, 0.001)).await.unwrap();
    assert_eq!(rig.scan.state(), RunState::Armed);
}

#[tokio::test]
async fn child_configure_arguments_propagate_latest_wins() {
    let rig = rig(1, None).await;
    assert_eq!(configure_params(&rig.scan), vec!["steps", "segmentSteps", "exposure"]);

    let det_ctrl = rig.det.controller().clone();
    for extra in ["gain", "binning"] {
        det_ctrl
            .transaction(|tx| {
                tx.update_method("configure", |m| {
                    m.takes.elements.remove("gain");
                    m.takes = m.takes.clone().with_element(
                        extra,
                        daq_core::model::VMeta::number(daq_core::model::NumberType::Int32, extra),
                        false,
                    );
                })
            })
            .unwrap();
    }
    wait_until("binning to reach SCAN", || {
        configure_params(&rig.scan).contains(&"binning".to_string())
    })
    .await;
    sleep(Duration::from_millis(20)).await;
    let takes = configure_params(&rig.scan);
    assert!(!takes.contains(&"gain".to_string()), "{takes:?}");
    let validate_takes: Vec<String> = rig.scan.controller().with_block(|b| {
        b.method("validate")
            .map(|m| m.takes.elements.keys().map(str::to_string).collect())
            .unwrap_or_default()
    });
    assert_eq!(validate_takes, takes);
}

#[tokio::test]
async fn pause_and_resume_finish_the_scan() {
    let rig = rig(10, None).await;
    rig.scan.configure(params(12, 0.1)).await.unwrap();
    let scan = rig.scan.clone();
    let running = tokio::spawn(async move { scan.run().await });

    wait_until("two steps", || rig.scan.completed_steps() >= 2).await;
    rig.scan.pause(Some(1)).await.unwrap();
    assert_eq!(rig.scan.state(), RunState::Paused);
    assert_eq!(rig.scan.completed_steps(), 1);
    assert_eq!(rig.det.state(), RunState::Paused);
    assert!(!running.is_finished());

    timeout(Duration::from_secs(5), rig.scan.resume()).await.unwrap().unwrap();
    timeout(Duration::from_secs(5), running).await.unwrap().unwrap().unwrap();
    assert_eq!(rig.scan.state(), RunState::Ready);
    assert_eq!(rig.scan.completed_steps(), 12);
}

#[tokio::test]
async fn abort_interrupts_run_and_reset_recovers() {
    let rig = rig(10, None).await;
    rig.scan.configure(params(50, 0.1)).await.unwrap();
    let scan = rig.scan.clone();
    let running = tokio::spawn(async move { scan.run().await });

    wait_until("first step", || rig.scan.completed_steps() >= 1).await;
    rig.scan.abort().await.unwrap();
    let result = timeout(Duration::from_secs(5), running).await.unwrap().unwrap();
    assert!(matches!(result, Err(DaqError::Aborted(_))), "{result:?}");
    assert_eq!(rig.scan.state(), RunState::Aborted);
    assert_eq!(rig.det.state(), RunState::Aborted);

    rig.scan.reset().await.unwrap();
    assert_eq!(rig.det.state(), RunState::Ready);
    assert_eq!(rig.scan.controller().value("completedSteps").unwrap(), Value::from(0));
}

#[tokio::test]
async fn methods_are_reachable_through_the_block() {
    let rig = rig(1, None).await;
    let ctrl = rig.scan.controller();
    let returned = ctrl
        .post(&["validate".into()], params(3, 0.5))
        .await
        .unwrap();
    assert_eq!(returned["steps"], json!(3));
    ctrl.post(&["configure".into()], params(3, 0.5)).await.unwrap();
    ctrl.post(&["run".into()], Params::new()).await.unwrap();
    assert_eq!(rig.scan.state(), RunState::Ready);
    let err = ctrl.post(&["resume".into()], Params::new()).await.unwrap_err();
    assert!(matches!(err, DaqError::NotWritable(_)));
}

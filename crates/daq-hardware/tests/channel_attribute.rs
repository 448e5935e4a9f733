//! A motor block whose `position` attribute mirrors mock channels.

use std::sync::Arc;
use std::time::Duration;

use daq_core::error::DaqError;
use daq_core::model::{AlarmSeverity, NumberType, VMeta};
use daq_core::Process;
use daq_experiment::{RunState, RunnableController, RunnableControllerBuilder};
use daq_hardware::{ChannelAttributePart, ChannelBackend, MockChannelBackend};
use serde_json::json;
use tokio::time::{sleep, timeout};

fn backend() -> Arc<MockChannelBackend> {
    let backend = MockChannelBackend::new();
    backend.add_channel("M1:DEMAND", 0.0);
    backend.add_channel("M1:RBV", 1.5);
    backend.link("M1:DEMAND", "M1:RBV");
    Arc::new(backend)
}

async fn motor(backend: &Arc<MockChannelBackend>, demand: bool) -> Arc<RunnableController> {
    let process = Process::new("motor-test");
    let part = ChannelAttributePart::new(
        "position",
        VMeta::number(NumberType::Float64, "Motor position"),
        backend.clone(),
        demand.then(|| "M1:DEMAND".to_string()),
        Some("M1:RBV".to_string()),
    )
    .unwrap();
    let motor = RunnableControllerBuilder::new("MOTOR")
        .with_part(Arc::new(part))
        .build(&process)
        .unwrap();
    process.start().await.unwrap();
    motor
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !check() {
            sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

fn alarm_severity(motor: &RunnableController) -> AlarmSeverity {
    motor
        .controller()
        .with_block(|b| b.attribute("position").map(|a| a.alarm.severity))
        .unwrap()
}

#[test]
fn part_needs_a_channel() {
    let err = ChannelAttributePart::new(
        "position",
        VMeta::number(NumberType::Float64, "Motor position"),
        backend(),
        None,
        None,
    )
    .err()
    .unwrap();
    assert!(matches!(err, DaqError::Configuration(_)));
}

#[tokio::test]
async fn connects_on_start_and_writes_through() {
    let backend = backend();
    let motor = motor(&backend, true).await;
    let ctrl = motor.controller();
    assert_eq!(motor.state(), RunState::Ready);
    assert_eq!(ctrl.value("position").unwrap(), json!(1.5));
    assert_eq!(backend.monitor_count("M1:RBV"), 1);

    ctrl.put(&["position".into(), "value".into()], json!(7.25)).await.unwrap();
    assert_eq!(ctrl.value("position").unwrap(), json!(7.25));
    assert_eq!(backend.get("M1:DEMAND").await.unwrap(), json!(7.25));
}

#[tokio::test]
async fn readback_only_attribute_is_not_writeable() {
    let backend = backend();
    let motor = motor(&backend, false).await;
    let err = motor
        .controller()
        .put(&["position".into(), "value".into()], json!(3.0))
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::NotWritable(_)));

    backend.set("M1:RBV", 9.0).unwrap();
    eventually("readback to propagate", || {
        motor.controller().value("position").ok() == Some(json!(9.0))
    })
    .await;
}

#[tokio::test]
async fn disconnect_raises_alarm_and_reconnect_clears_it() {
    let backend = backend();
    let motor = motor(&backend, true).await;
    assert_eq!(alarm_severity(&motor), AlarmSeverity::NoAlarm);

    backend.disconnect("M1:RBV").unwrap();
    eventually("disconnect alarm", || alarm_severity(&motor) == AlarmSeverity::Invalid).await;

    backend.reconnect("M1:RBV").unwrap();
    eventually("alarm to clear", || alarm_severity(&motor) == AlarmSeverity::NoAlarm).await;
}

#[tokio::test]
async fn disable_stops_monitoring_until_reset() {
    let backend = backend();
    let motor = motor(&backend, true).await;
    motor.disable().await.unwrap();
    assert_eq!(motor.state(), RunState::Disabled);
    eventually("monitor to drop", || backend.monitor_count("M1:RBV") == 0).await;
    let writeable = motor
        .controller()
        .with_block(|b| b.attribute("position").map(|a| a.meta.writeable));
    assert_eq!(writeable, Some(false));

    backend.set("M1:RBV", 4.0).unwrap();
    motor.reset().await.unwrap();
    assert_eq!(motor.controller().value("position").unwrap(), json!(4.0));
    assert_eq!(backend.monitor_count("M1:RBV"), 1);
}

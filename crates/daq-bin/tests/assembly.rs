//! Assembling a process from a config file and driving it through channels.

use std::io::Write;
use std::time::Duration;

use daq_bin::{assemble, Assembly};
use daq_core::config::ProcessConfig;
use daq_core::error::DaqError;
use daq_experiment::RunState;
use daq_server::{FaultCode, Invocation, SessionEvent};
use serde_json::{json, Map};
use tempfile::NamedTempFile;
use tokio::time::timeout;

const CONFIG: &str = r#"
[application]
name = "assembly-test"

[server]
lifecycle_timeout_ms = 500

[[blocks]]
mri = "DET"
kind = "detector"
steps_interval_ms = 1
fault_at_step = 4

[[blocks]]
mri = "SCAN"
kind = "scan"
child = "DET"

[[blocks]]
mri = "MOTOR"
kind = "motor"

[[blocks]]
mri = "HIDDEN"
kind = "motor"
publish = false
"#;

fn load(text: &str) -> ProcessConfig {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    ProcessConfig::load_from(file.path()).unwrap()
}

async fn started() -> Assembly {
    let assembly = assemble(&load(CONFIG)).unwrap();
    assembly.process.start().await.unwrap();
    assembly
}

fn scan_query(steps: i64) -> Map<String, serde_json::Value> {
    let mut query = Map::new();
    query.insert("steps".into(), json!(steps));
    query.insert("exposure".into(), json!(0.05));
    query
}

#[tokio::test]
async fn every_block_is_built_and_only_published_ones_are_served() {
    let assembly = started().await;
    let mut mris = assembly.process.mris();
    mris.sort();
    assert_eq!(mris, vec!["DET", "HIDDEN", "MOTOR", "SCAN"]);
    for mri in ["DET", "SCAN", "MOTOR", "HIDDEN"] {
        assert_eq!(assembly.block(mri).unwrap().state(), RunState::Ready, "{mri}");
    }
    assert!(assembly.server.test_channel("SCAN"));
    assert!(assembly.server.test_channel("MOTOR.position"));
    assert!(!assembly.server.test_channel("HIDDEN"));
    assert!(matches!(assembly.block("NOPE"), Err(DaqError::UnknownUnit(_))));
    assembly.process.stop().await.unwrap();
}

#[tokio::test]
async fn scan_without_a_known_child_is_rejected() {
    let config = load(
        r#"
[[blocks]]
mri = "SCAN"
kind = "scan"
child = "DET"
"#,
    );
    assert!(matches!(assemble(&config), Err(DaqError::Configuration(_))));
}

#[tokio::test]
async fn scan_fault_reaches_the_client_and_reset_recovers() {
    let assembly = started().await;
    let channel = assembly.server.make_channel("SCAN").unwrap();
    let mut client = channel.connect().await.unwrap();
    match timeout(Duration::from_secs(2), client.recv()).await.unwrap() {
        Some(SessionEvent::Open { snapshot }) => assert_eq!(snapshot["state"]["value"], json!("Ready")),
        other => panic!("expected open, got {other:?}"),
    }

    let call = |method: &str, query| Invocation::Explicit {
        path: vec!["SCAN".into(), method.into()],
        query,
    };
    client.rpc(call("configure", scan_query(10))).await.unwrap();
    let fault = client.rpc(call("run", Map::new())).await.unwrap_err();
    assert_eq!(fault.code, FaultCode::Aborted);
    assert!(fault.message.contains("DET overheated at step 4"), "{}", fault.message);

    let scan = assembly.block("SCAN").unwrap();
    assert_eq!(scan.state(), RunState::Fault);
    client.rpc(call("reset", Map::new())).await.unwrap();
    assert_eq!(scan.state(), RunState::Ready);
    assert_eq!(assembly.block("DET").unwrap().state(), RunState::Ready);

    client.disconnect().await.unwrap();
    assembly.process.stop().await.unwrap();
}

#[tokio::test]
async fn motor_position_is_written_through_its_channel() {
    let assembly = started().await;
    let channel = assembly.server.make_channel("MOTOR.position").unwrap();
    let client = channel.connect().await.unwrap();

    client.put(&json!({"value": 2.5})).await.unwrap();
    let motor = assembly.block("MOTOR").unwrap();
    assert_eq!(motor.controller().value("position").unwrap(), json!(2.5));

    assembly.process.stop().await.unwrap();
}

//! Clients of a block server watching blocks change.

use std::sync::Arc;
use std::time::Duration;

use daq_core::changes::Change;
use daq_core::config::ServerConfig;
use daq_core::error::DaqError;
use daq_core::model::{AttributeModel, BlockModel, Field, NumberType, VMeta};
use daq_core::{Controller, Process};
use daq_server::{BlockServer, ChannelClient, SessionEvent};
use serde_json::{json, Value};
use tokio::time::{sleep, timeout};

struct Served {
    process: Arc<Process>,
    unit: Arc<Controller>,
    server: Arc<BlockServer>,
}

fn int_attribute(value: i64, writeable: bool) -> Field {
    Field::Attribute(
        AttributeModel::new(VMeta::number(NumberType::Int32, "an int").writeable(writeable))
            .with_value(json!(value))
            .unwrap(),
    )
}

async fn served(fields: Vec<(&str, Field)>) -> Served {
    let process = Process::new("sync-test");
    let mut block = BlockModel::new("Unit");
    for (name, field) in fields {
        block.add_field(name, field).unwrap();
    }
    let unit = Controller::new("UNIT", block);
    process.add_controller(unit.clone()).unwrap();
    let server = BlockServer::attach(&process, ServerConfig::default());
    server.publish(vec!["UNIT".into()]).await.unwrap();
    process.start().await.unwrap();
    Served {
        process,
        unit,
        server,
    }
}

async fn next(client: &mut ChannelClient) -> SessionEvent {
    timeout(Duration::from_secs(2), client.recv())
        .await
        .expect("no event within 2s")
        .expect("channel gone")
}

async fn open_snapshot(client: &mut ChannelClient) -> Value {
    match next(client).await {
        SessionEvent::Open { snapshot } => snapshot,
        other => panic!("expected open, got {other:?}"),
    }
}

#[tokio::test]
async fn write_is_resolved_forwarded_and_seen_as_one_update() {
    let s = served(vec![("value", int_attribute(5, true))]).await;
    let channel = s.server.make_channel("UNIT").unwrap();
    let mut client = channel.connect().await.unwrap();
    let snapshot = open_snapshot(&mut client).await;
    assert_eq!(snapshot["value"]["value"], json!(5));
    assert_eq!(
        channel.session().await.unwrap().put_paths().into_iter().collect::<Vec<_>>(),
        vec!["value.value"]
    );

    client.put(&json!({"value": {"value": 7}})).await.unwrap();
    assert_eq!(s.unit.value("value").unwrap(), json!(7));
    match next(&mut client).await {
        SessionEvent::Update { changes } => {
            assert!(changes.contains(&Change::update(["value", "value"], json!(7))), "{changes:?}");
        }
        other => panic!("expected update, got {other:?}"),
    }

    let err = client.put(&json!({"meta": {"label": "x"}})).await.unwrap_err();
    assert!(matches!(err, DaqError::AmbiguousPut(_)));
}

#[tokio::test]
async fn delete_and_add_in_one_batch_rebuilds_the_session() {
    let s = served(vec![("x", int_attribute(1, true))]).await;
    let channel = s.server.make_channel("UNIT").unwrap();
    let mut client = channel.connect().await.unwrap();
    open_snapshot(&mut client).await;

    s.unit
        .transaction(|tx| {
            tx.remove_field("x")?;
            tx.add_field(
                "y",
                Field::Attribute(AttributeModel::new(VMeta::string("a string").writeable(true))),
            )
        })
        .unwrap();

    assert_eq!(next(&mut client).await, SessionEvent::Close);
    let rebuilt = open_snapshot(&mut client).await;
    assert!(rebuilt.get("x").is_none());
    assert_eq!(rebuilt, s.unit.get(&[]).unwrap());

    let put_paths = channel.session().await.unwrap().put_paths();
    assert!(put_paths.contains("y.value"));
    assert!(!put_paths.contains("x.value"));

    let err = client.put(&json!({"x": {"value": 3}})).await.unwrap_err();
    assert!(matches!(err, DaqError::AmbiguousPut(_)));
    client.put(&json!({"y": {"value": "hello"}})).await.unwrap();
    assert_eq!(s.unit.value("y").unwrap(), json!("hello"));
}

#[tokio::test]
async fn mirror_never_drifts_from_the_block() {
    let s = served(vec![("a", int_attribute(0, true)), ("b", int_attribute(0, false))]).await;
    let channel = s.server.make_channel("UNIT").unwrap();
    let mut client = channel.connect().await.unwrap();
    let mut view = open_snapshot(&mut client).await;

    for i in 1..=20 {
        s.unit
            .transaction(|tx| {
                tx.set_value("a", i)?;
                if i % 3 == 0 {
                    tx.set_value("b", -i)?;
                }
                if i == 10 {
                    tx.add_field("c", int_attribute(i, true))?;
                }
                Ok(())
            })
            .unwrap();
    }

    // Replay what the client saw; it must end where the block is.
    let authoritative = s.unit.get(&[]).unwrap();
    timeout(Duration::from_secs(2), async {
        while view != authoritative {
            match client.recv().await {
                Some(SessionEvent::Open { snapshot }) => view = snapshot,
                Some(SessionEvent::Update { changes }) => {
                    for change in &changes {
                        daq_core::changes::apply_change(&mut view, change).unwrap();
                    }
                }
                Some(SessionEvent::Close) => {}
                None => panic!("channel gone"),
            }
        }
    })
    .await
    .expect("client view never matched the block");
    assert_eq!(channel.snapshot().await.unwrap(), authoritative);
}

#[tokio::test]
async fn field_channel_writes_its_value() {
    let s = served(vec![("value", int_attribute(5, true))]).await;
    let channel = s.server.make_channel("UNIT.value").unwrap();
    let mut client = channel.connect().await.unwrap();
    let snapshot = open_snapshot(&mut client).await;
    assert_eq!(snapshot["value"], json!(5));

    client.put(&json!({"value": 9})).await.unwrap();
    assert_eq!(s.unit.value("value").unwrap(), json!(9));
}

#[tokio::test]
async fn late_client_gets_the_snapshot_and_last_client_closes() {
    let s = served(vec![("value", int_attribute(5, true))]).await;
    let channel = s.server.make_channel("UNIT").unwrap();
    let mut first = channel.connect().await.unwrap();
    open_snapshot(&mut first).await;
    let mut second = channel.connect().await.unwrap();
    assert_eq!(open_snapshot(&mut second).await["value"]["value"], json!(5));
    assert_eq!(channel.client_count().await, 2);

    first.disconnect().await.unwrap();
    assert_eq!(s.unit.subscriber_count(), 1);
    second.put(&json!({"value": {"value": 6}})).await.unwrap();
    assert!(matches!(next(&mut second).await, SessionEvent::Update { .. }));

    let session = channel.session().await.unwrap();
    second.disconnect().await.unwrap();
    assert_eq!(s.unit.subscriber_count(), 0);
    assert_eq!(session.phase(), daq_server::SessionPhase::Closed);
    assert!(channel.session().await.is_err());
}

#[tokio::test]
async fn unpublishing_disconnects_clients_once() {
    let s = served(vec![("value", int_attribute(5, true))]).await;
    let channel = s.server.make_channel("UNIT").unwrap();
    let mut client = channel.connect().await.unwrap();
    open_snapshot(&mut client).await;

    s.server.publish(Vec::new()).await.unwrap();
    assert_eq!(next(&mut client).await, SessionEvent::Close);
    assert!(!s.server.test_channel("UNIT"));
    assert!(s.server.channel_names().is_empty());
    assert_eq!(s.unit.subscriber_count(), 0);

    s.server.disconnect_clients(&["UNIT".into()]).await.unwrap();
    channel.force_close(Duration::from_millis(10)).await.unwrap();
    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn stopping_the_process_closes_every_channel() {
    let s = served(vec![("value", int_attribute(5, true))]).await;
    let mut client = s.server.make_channel("UNIT").unwrap().connect().await.unwrap();
    open_snapshot(&mut client).await;
    s.process.stop().await.unwrap();
    assert_eq!(next(&mut client).await, SessionEvent::Close);
    sleep(Duration::from_millis(5)).await;
    assert_eq!(s.unit.subscriber_count(), 0);
}

#[tokio::test]
async fn timed_out_administrative_close_still_ends_every_client() {
    let s = served(vec![("value", int_attribute(5, true))]).await;
    let channel = s.server.make_channel("UNIT").unwrap();
    let mut client = channel.connect().await.unwrap();
    let mut late = channel.connect().await.unwrap();
    open_snapshot(&mut client).await;
    open_snapshot(&mut late).await;
    let session = channel.session().await.unwrap();

    let _busy = s.unit.spawn(sleep(Duration::from_secs(30)));
    sleep(Duration::from_millis(5)).await;
    let err = channel.force_close(Duration::from_millis(20)).await.unwrap_err();
    assert!(matches!(err, DaqError::Timeout(_)), "{err}");
    assert_eq!(session.phase(), daq_server::SessionPhase::Closed);
    assert!(channel.is_closed());

    for c in [&mut client, &mut late] {
        assert_eq!(next(c).await, SessionEvent::Close);
        let end = timeout(Duration::from_millis(300), c.recv()).await.expect("stream never ended");
        assert!(end.is_none());
    }
    assert!(matches!(channel.connect().await, Err(DaqError::Channel(_))));
}

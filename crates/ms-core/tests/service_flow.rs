use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use ms_common::ServiceConfig;
use ms_core::publisher::{TAG_ORBIT, TAG_PROFILE_ORBIT, TAG_PROFILE_TWISS, TAG_UNDULATOR_TWISS};
use ms_core::{DeviceNameMap, ModelService, RecordingSink, RpcRequest, RpcStatus, REFUSAL};
use ms_metrics::ModelMetrics;
use ms_oracle::LatticeSimulator;
use ms_router::ChannelValue;
use serde_json::{json, Value};

fn service(sink: Arc<RecordingSink>, metrics: ModelMetrics) -> Result<(ModelService, usize)> {
    let mut config = ServiceConfig::default();
    config.oracle.simulator.cells = 2;
    let simulator = LatticeSimulator::new(&config.oracle.simulator);
    let end = simulator.end_index();
    let mut devices = DeviceNameMap::empty();
    devices.insert("QF01", "QUAD:IN10:121");
    let service = ModelService::new(config, Box::new(simulator), Arc::new(devices), sink, metrics)?;
    Ok((service, end))
}

#[tokio::test(start_paused = true)]
async fn set_command_refreshes_live_table_and_broadcasts() -> Result<()> {
    let sink = Arc::new(RecordingSink::new());
    let metrics = ModelMetrics::unregistered()?;
    let (service, end) = service(Arc::clone(&sink), metrics.clone())?;

    let design = service.tables().design();
    assert_eq!(design.len(), end);
    assert_eq!(design.rows.last().map(|r| r.element.as_str()), Some("END"));
    assert_eq!(design.row("QF01").map(|r| r.device_name.as_str()), Some("QUAD:IN10:121"));
    assert_eq!(design.row("QD01").map(|r| r.device_name.as_str()), Some(""));
    let design_beta = design.row("QD01").and_then(|r| r.value("beta_x")).expect("beta_x");

    let handle = service.start();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(sink.messages().is_empty(), "nothing changed yet");

    let reply = handle
        .rpc()
        .call(RpcRequest::new("tao", json!("set ele QF01 k1 = 3.0")))
        .await
        .expect("reply");
    assert_eq!(reply.status, RpcStatus::Ok);
    assert_eq!(reply.result, Some(json!([])));

    tokio::time::sleep(Duration::from_secs(2)).await;

    let tables = handle.tables();
    let live = tables.live();
    assert_eq!(live.len(), end);
    let live_beta = live.row("QD01").and_then(|r| r.value("beta_x")).expect("beta_x");
    assert!((live_beta - design_beta).abs() > 1e-9);
    let unchanged = tables.design().row("QD01").and_then(|r| r.value("beta_x"));
    assert_eq!(unchanged, Some(design_beta));

    assert_eq!(
        sink.tags(),
        [TAG_ORBIT, TAG_PROFILE_TWISS, TAG_PROFILE_ORBIT, TAG_UNDULATOR_TWISS]
    );
    assert_eq!(metrics.table_builds(), 2);
    assert!(!handle.tracker().needs_broadcast());
    assert!(!handle.tracker().needs_table_refresh());

    handle.shutdown().await
}

#[tokio::test(start_paused = true)]
async fn send_commands_and_refusals() -> Result<()> {
    let sink = Arc::new(RecordingSink::new());
    let (service, _) = service(Arc::clone(&sink), ModelMetrics::unregistered()?)?;
    let handle = service.start();
    let rpc = handle.rpc();

    let reply = rpc
        .call(RpcRequest::new("tao", json!("exit")))
        .await
        .expect("reply");
    assert_eq!(reply.result, Some(json!(REFUSAL)));
    assert_eq!(rpc.call(RpcRequest::new("reboot", Value::Null)).await, None);

    let reply = rpc
        .call(RpcRequest::new("send_orbit", Value::Null))
        .await
        .expect("reply");
    assert!(reply.is_ok());
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(sink.tags().first().map(String::as_str), Some(TAG_ORBIT));
    assert_eq!(sink.messages().len(), 4);

    handle.shutdown().await
}

#[tokio::test(start_paused = true)]
async fn channel_writes_reach_the_model() -> Result<()> {
    let sink = Arc::new(RecordingSink::new());
    let (service, _) = service(Arc::clone(&sink), ModelMetrics::unregistered()?)?;
    let handle = service.start();
    let router = handle.router();

    let k1 = router.get("BMAD:SYS0:1:QF02:K1")?;
    assert!(k1.is_writable());
    k1.write(ChannelValue::Double(2.25))?;
    assert_eq!(k1.read()?, ChannelValue::Double(2.25));

    tokio::time::sleep(Duration::from_secs(2)).await;
    let s = router.get("BMAD:SYS0:1:END:S")?.read()?;
    let expected = handle.tables().live().row("END").map(|r| r.s).expect("END row");
    assert_eq!(s, ChannelValue::Double(expected));
    assert_eq!(sink.messages().len(), 4);

    handle.shutdown().await
}

use device_link::{Endpoint, MockConnector, MockOpen, TransportError};
use pin_control::{
    ConnectionSupervisor, DeviceConfig, LinkState, MetricsHub, NodeSignal, NodeStatus,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn collect(rx: &mut mpsc::UnboundedReceiver<NodeSignal>) -> Vec<NodeSignal> {
    let mut out = Vec::new();
    while let Ok(sig) = rx.try_recv() {
        out.push(sig);
    }
    out
}

fn errors(signals: &[NodeSignal]) -> Vec<String> {
    signals
        .iter()
        .filter_map(|s| match s {
            NodeSignal::Error { message, .. } => Some(message.clone()),
            _ => None,
        })
        .collect()
}

/// Let spawned tasks run until they block, without reaching any timer.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

fn spawn(
    mock: &MockConnector,
) -> (ConnectionSupervisor, mpsc::UnboundedReceiver<NodeSignal>) {
    let (signals, rx) = mpsc::unbounded_channel();
    let config = DeviceConfig::new("uno", Endpoint::serial("/dev/ttyACM0"));
    let sup = ConnectionSupervisor::spawn(
        config,
        Arc::new(mock.clone()),
        signals,
        MetricsHub::new().unwrap(),
    );
    (sup, rx)
}

async fn wait_ready(sup: &ConnectionSupervisor) {
    sup.link()
        .readiness()
        .wait_for(|s| s.is_ready())
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn connects_and_reports_ready() {
    let mock = MockConnector::new();
    let (mut sup, mut rx) = spawn(&mock);
    wait_ready(&sup).await;
    assert_eq!(sup.state(), LinkState::Ready);
    assert_eq!(sup.link().snapshot().epoch, 1);
    let statuses: Vec<_> = collect(&mut rx)
        .into_iter()
        .filter_map(|s| match s {
            NodeSignal::Status { status, .. } => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec![NodeStatus::connecting(), NodeStatus::connected()]);
    sup.teardown().await.unwrap();
    assert_eq!(mock.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn benign_failures_reported_once_until_ready() {
    let mock = MockConnector::new();
    for _ in 0..3 {
        mock.push_open(MockOpen::Fail(TransportError::NotFound("/dev/ttyACM0".into())));
    }
    let (mut sup, mut rx) = spawn(&mock);
    wait_ready(&sup).await;
    assert_eq!(errors(&collect(&mut rx)).len(), 1);

    // Ready cleared the latch, so the next outage is reported again.
    assert!(mock.unplug());
    sup.link()
        .readiness()
        .wait_for(|s| !s.is_ready())
        .await
        .unwrap();
    settle().await;
    assert_eq!(errors(&collect(&mut rx)), vec!["disconnected".to_string()]);
    sup.teardown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unexpected_failures_reported_each_attempt() {
    let mock = MockConnector::new();
    for _ in 0..2 {
        mock.push_open(MockOpen::Fail(TransportError::Io("permission denied".into())));
    }
    let (mut sup, mut rx) = spawn(&mock);
    wait_ready(&sup).await;
    assert_eq!(errors(&collect(&mut rx)).len(), 2);
    sup.teardown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn watchdog_replaces_silent_client() {
    let mock = MockConnector::new();
    mock.push_open(MockOpen::Silent);
    let (mut sup, _rx) = spawn(&mock);
    wait_ready(&sup).await;
    settle().await;
    assert_eq!(mock.opens(), 2);
    assert_eq!(mock.live_clients(), 1);
    sup.teardown().await.unwrap();
    assert_eq!(mock.live_clients(), 0);
}

#[tokio::test(start_paused = true)]
async fn one_live_client_across_reconnects() {
    let mock = MockConnector::new();
    let (mut sup, _rx) = spawn(&mock);
    for round in 1..=3u64 {
        wait_ready(&sup).await;
        settle().await;
        assert_eq!(mock.live_clients(), 1);
        assert_eq!(sup.link().snapshot().epoch, round);
        assert!(mock.unplug());
        sup.link()
            .readiness()
            .wait_for(|s| !s.is_ready())
            .await
            .unwrap();
    }
    sup.teardown().await.unwrap();
    settle().await;
    assert_eq!(mock.live_clients(), 0);
}

#[tokio::test(start_paused = true)]
async fn teardown_before_connect_and_twice() {
    let mock = MockConnector::new();
    mock.push_open(MockOpen::Silent);
    let (mut sup, _rx) = spawn(&mock);
    sup.teardown().await.unwrap();
    sup.teardown().await.unwrap();
    settle().await;
    assert!(mock.closes() <= 1);
    assert_eq!(mock.live_clients(), 0);

    // No retry fires once torn down.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(mock.opens() <= 1);
}

#[tokio::test(start_paused = true)]
async fn explicit_connect_is_idempotent() {
    let mock = MockConnector::new();
    let (mut sup, _rx) = spawn(&mock);
    sup.connect();
    sup.connect();
    wait_ready(&sup).await;
    sup.connect();
    settle().await;
    assert_eq!(mock.opens(), 1);
    sup.teardown().await.unwrap();
}

//! End-to-end controller lifecycle tests.

mod common;

use std::time::Duration;

use common::{RecordingApplier, ScriptedSource, eventually, rules};
use opa_iptables::{Config, Controller, WatcherConfig};
use reqwest::StatusCode;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

fn config(watcher_enabled: bool) -> Config {
    Config {
        watcher_enabled,
        watcher: WatcherConfig {
            interval: Duration::from_millis(50),
            worker_count: 2,
            shutdown_grace: Duration::from_millis(200),
            ..Default::default()
        },
        watch_targets: if watcher_enabled {
            vec!["iptables/web".to_string()]
        } else {
            Vec::new()
        },
        server_grace: Duration::from_secs(1),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_serves_and_stops_on_signal() {
    let applier = RecordingApplier::new();
    let source = ScriptedSource::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let controller = Controller::new(config(false), source.clone(), applier.clone());
    let task = tokio::spawn(controller.serve(listener, async {
        let _ = stop_rx.await;
    }));

    let resp = reqwest::get(format!("http://{addr}/v1/version"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // Watcher disabled: nothing is polled.
    let resp = reqwest::get(format!("http://{addr}/v1/watcher/targets"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(source.calls(), 0);

    stop_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(3), task)
        .await
        .expect("controller did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_watches_configured_targets() {
    let applier = RecordingApplier::new();
    let source = ScriptedSource::new();
    source.set("iptables/web", rules(&["R1", "R2"]));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let controller = Controller::new(config(true), source.clone(), applier.clone());
    let task = tokio::spawn(controller.serve(listener, async {
        let _ = stop_rx.await;
    }));

    let recorder = applier.clone();
    assert!(eventually(Duration::from_secs(2), || recorder.calls().len() == 2).await);

    let targets: Vec<Value> = reqwest::get(format!("http://{addr}/v1/watcher/targets"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0]["path"], "iptables/web");

    stop_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(3), task)
        .await
        .expect("controller did not stop")
        .unwrap()
        .unwrap();

    // Nothing polls once the controller is down.
    let fetches = source.calls();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(source.calls(), fetches);
}

#[tokio::test]
async fn test_shutdown_bounded_by_grace_with_stuck_worker() {
    let applier = RecordingApplier::with_delay(Duration::from_secs(30));
    let source = ScriptedSource::new();
    source.set("iptables/web", rules(&["R1"]));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let controller = Controller::new(config(true), source.clone(), applier.clone());
    let task = tokio::spawn(controller.serve(listener, async {
        let _ = stop_rx.await;
    }));

    let recorder = applier.clone();
    assert!(eventually(Duration::from_secs(2), || recorder.active() == 1).await);

    stop_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(3), task)
        .await
        .expect("controller ignored the watcher grace period")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_run_binds_configured_address() {
    let port = portpicker::pick_unused_port().expect("No available port");
    let mut config = config(false);
    config.listen_addr = format!("127.0.0.1:{port}");

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let controller = Controller::new(config, ScriptedSource::new(), RecordingApplier::new());
    let task = tokio::spawn(controller.run(async {
        let _ = stop_rx.await;
    }));

    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{port}/v1/version");
    let mut up = false;
    for _ in 0..50 {
        if client.get(&url).send().await.is_ok() {
            up = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(up, "controller never came up on port {port}");

    stop_tx.send(()).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_run_fails_on_bad_address() {
    let mut config = config(false);
    config.listen_addr = "not-an-address".to_string();

    let controller = Controller::new(config, ScriptedSource::new(), RecordingApplier::new());
    let err = controller.run(std::future::pending()).await.unwrap_err();
    assert!(err.to_string().contains("Failed to bind"));
}

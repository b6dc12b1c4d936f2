//! Supervisor reacting to host channel traffic

#![cfg(unix)]

mod common;

use common::{script_config, wait_until, ECHO_CHILD};
use std::time::Duration;
use storyrun_common::store::{RunStateEvent, RUN_STATE_CHANNEL};
use storyrun_common::{Environment, ErrorLike, FatalError, RunRequest, Stores};
use storyrun_host::{ChildEvent, ProcessBridge, Supervisor};
use tempfile::TempDir;
use tokio::sync::broadcast;

async fn next_event(events: &mut broadcast::Receiver<ChildEvent>) -> ChildEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no child event")
        .expect("event bus closed")
}

fn setup(dir: &TempDir) -> (Stores, ProcessBridge, std::sync::Arc<Supervisor>) {
    let stores = Stores::new(Environment::Server);
    let bridge = ProcessBridge::new(script_config(dir, ECHO_CHILD), None, stores.clone());
    let supervisor = Supervisor::new(stores.clone(), bridge.clone());
    (stores, bridge, supervisor)
}

#[tokio::test]
async fn test_trigger_run_boots_and_delivers_request() {
    let dir = TempDir::new().unwrap();
    let (stores, bridge, supervisor) = setup(&dir);
    let mut events = bridge.subscribe_events();
    let _loop = supervisor.start();

    stores.run_state.send(RunStateEvent::TriggerRun(RunRequest::global()));

    let mut received = Vec::new();
    for _ in 0..4 {
        received.push(next_event(&mut events).await.args[0].clone());
    }
    let init = &received[3];
    assert_eq!(init["type"], RUN_STATE_CHANNEL);
    assert_eq!(init["args"][0]["event"]["body"]["type"], "TRIGGER_RUN");
    assert_eq!(init["args"][0]["event"]["body"]["payload"]["triggeredBy"], "global");

    // The request was not also forwarded by the channel forwarders
    assert!(
        tokio::time::timeout(Duration::from_millis(300), events.recv())
            .await
            .is_err()
    );
    assert_eq!(bridge.boots(), 1);
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_fatal_error_is_recorded_and_kills_child() {
    let dir = TempDir::new().unwrap();
    let (stores, bridge, supervisor) = setup(&dir);
    let _loop = supervisor.start();
    bridge.boot().await.unwrap();

    stores.run_state.send(RunStateEvent::FatalError(FatalError {
        message: "Failed to run tests".into(),
        error: ErrorLike::new("EngineError", "worker exited"),
    }));

    let watched = bridge.clone();
    wait_until(move || !watched.is_live()).await;
    let fatal = stores.run_state.state().fatal_error.unwrap();
    assert_eq!(fatal.message, "Failed to run tests");
    assert_eq!(fatal.error.message, "worker exited");
}

#[tokio::test]
async fn test_toggle_watching_boots_idle_runner() {
    let dir = TempDir::new().unwrap();
    let (stores, bridge, supervisor) = setup(&dir);
    let mut events = bridge.subscribe_events();
    let _loop = supervisor.start();

    stores
        .run_state
        .send(RunStateEvent::ToggleWatching { to: true });

    let snapshot = next_event(&mut events).await.args[0].clone();
    assert_eq!(snapshot["type"], RUN_STATE_CHANNEL);
    assert_eq!(snapshot["args"][0]["event"]["body"]["watching"], true);
    assert!(stores.run_state.state().watching);

    let watched = bridge.clone();
    wait_until(move || watched.is_ready()).await;
    bridge.shutdown().await;
}

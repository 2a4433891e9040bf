// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Cancelling workers and whole sessions.

mod common;

use std::time::{Duration, Instant};

use common::{block, Workspace};
use serde_json::json;

use codi_swarm::orchestrate::{IpcClient, IpcServer};
use codi_swarm::{SessionError, SessionState, WorkerStatus};

const SLEEPER: &str = "printf 'start\\n' > started.txt; sleep 30";

async fn wait_for_running(session: &codi_swarm::Session, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let running = session
            .status(&[])
            .workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Running)
            .count();
        if running >= count {
            return;
        }
        assert!(Instant::now() < deadline, "workers never started");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_cancel_session_stops_background_swarm() {
    let ws = Workspace::new();
    let session = ws.open(SLEEPER).await;

    let replies = session
        .handle_output(&block(
            "spawn_swarm",
            json!({"request_id": "bg", "wait": false, "tasks": ["sleep a", "sleep b"]}),
        ))
        .await
        .unwrap();
    assert!(replies[0].text.contains("bg-final"));
    wait_for_running(&session, 2).await;

    let started = Instant::now();
    session.cancel().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(session.state(), SessionState::Cancelled);
    assert_eq!(ws.extra_worktrees(), 0);

    for worker in session.status(&[]).workers {
        assert_eq!(worker.status, WorkerStatus::Cancelled);
    }
    assert!(matches!(
        session.handle_output("```check_workers\n{}\n```").await,
        Err(SessionError::Terminal(_))
    ));

    let record = session.finish().await.unwrap();
    assert_eq!(record.state, SessionState::Cancelled);
    assert!(record.outcomes.iter().all(|o| !o.applied));
}

#[tokio::test]
async fn test_cancel_one_worker_over_control_socket() {
    let ws = Workspace::new();
    let socket_dir = tempfile::TempDir::new().unwrap();
    let socket = socket_dir.path().join("ctl.sock");

    let mut server = IpcServer::new(&socket);
    server.start().await.unwrap();
    let incoming = server.take_receiver().unwrap();
    let server = std::sync::Arc::new(server);
    let accept = server.spawn_accept_loop();

    let session = codi_swarm::Session::builder(ws.path(), ws.config(SLEEPER))
        .control_server(server.clone())
        .build()
        .await;
    let serve = {
        let session = session.clone();
        let server = server.clone();
        tokio::spawn(async move { session.serve_control(server, incoming).await })
    };

    session
        .handle_output(&block(
            "spawn_swarm",
            json!({"wait": false, "tasks": ["sleep a"]}),
        ))
        .await
        .unwrap();
    wait_for_running(&session, 1).await;
    let worker_id = session.status(&[]).workers[0].worker_id.clone();

    let mut client = IpcClient::new(&socket);
    client.connect().await.unwrap();
    client.ping().await.unwrap();
    let paused = client.pause_queue().await.unwrap();
    assert_eq!(paused["paused"], true);
    client.resume_queue().await.unwrap();

    let cancelled = client.cancel_worker(&worker_id).await.unwrap();
    assert_eq!(cancelled["cancelled"], worker_id.as_str());
    assert!(client.cancel_worker("w-missing").await.is_err());

    let record = session.finish().await.unwrap();
    assert_eq!(record.state, SessionState::Completed);
    assert_eq!(record.workers[0].status, WorkerStatus::Cancelled);

    client.disconnect().await;
    serve.abort();
    accept.abort();
}

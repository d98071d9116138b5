//! End-to-end with real processes: HTTP create -> native spawner -> bus ->
//! stream controller.
#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{app, app_state, project_dir, start_server};
use multiterm::client::{NewSession, SessionApi, StreamController, StreamOptions};
use multiterm::config::SessionConfig;
use multiterm::project::MarkerProjects;
use multiterm::pty::NativeSpawner;
use multiterm::session::{SessionRegistry, SessionStatus};

const WAIT: Duration = Duration::from_secs(10);

async fn start() -> (SessionApi, tempfile::TempDir) {
    let dir = project_dir();
    let sessions = SessionRegistry::new(
        Arc::new(NativeSpawner::default()),
        Arc::new(MarkerProjects::new(vec![dir.path().to_path_buf()])),
        SessionConfig::default(),
    );
    let addr = start_server(app(app_state(sessions))).await;
    let api = SessionApi::new(&format!("http://{addr}")).unwrap();
    (api, dir)
}

#[tokio::test(flavor = "multi_thread")]
async fn echo_output_is_streamed_and_exit_recorded() {
    let (api, dir) = start().await;
    let info = api
        .create(&NewSession {
            cwd: Some(dir.path().display().to_string()),
            command: Some(
                ["/bin/sh", "-c", "echo hi; exit 3"]
                    .map(String::from)
                    .to_vec(),
            ),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(info.pid.is_some());

    let mut controller = StreamController::connect(api.clone(), &info.id, 0, StreamOptions::default());
    let mut seen = Vec::new();
    tokio::time::timeout(WAIT, async {
        while !String::from_utf8_lossy(&seen).contains("hi") {
            let frame = controller.next_frame().await.expect("stream closed early");
            seen.extend_from_slice(&frame.data);
        }
    })
    .await
    .expect("never saw the echo");

    let finished = tokio::time::timeout(WAIT, async {
        loop {
            let info = api.get(&info.id).await.unwrap();
            if info.status == SessionStatus::Exited {
                return info;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("session never exited");
    assert_eq!(finished.exit_code, Some(3));
    assert!(finished.exited_at.is_some());

    api.delete(&info.id).await.unwrap();
    assert!(api.get(&info.id).await.unwrap_err().is_not_found());
}

#[tokio::test(flavor = "multi_thread")]
async fn interactive_shell_echoes_input() {
    let (api, dir) = start().await;
    let info = api
        .create(&NewSession {
            cwd: Some(dir.path().display().to_string()),
            command: Some(vec!["/bin/sh".to_string()]),
            ..Default::default()
        })
        .await
        .unwrap();

    let mut controller = StreamController::connect(api.clone(), &info.id, 0, StreamOptions::default());
    controller.send(&b"echo multiterm-$((40 + 2))\n"[..]);

    let mut seen = Vec::new();
    tokio::time::timeout(WAIT, async {
        while !String::from_utf8_lossy(&seen).contains("multiterm-42") {
            let frame = controller.next_frame().await.expect("stream closed early");
            seen.extend_from_slice(&frame.data);
        }
    })
    .await
    .expect("shell never answered");

    api.stop(&info.id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn readyz_selftest_spawns_a_real_shell() {
    let (api, _dir) = start().await;
    let url = format!("{}/readyz?selftest=1", api.base_url());
    let report: serde_json::Value = reqwest::get(url).await.unwrap().json().await.unwrap();
    assert_eq!(report["ok"], true, "{report}");
    assert_eq!(report["sawReady"], true);
    assert_eq!(report["sawOk"], true);
    assert!(report["ms"].as_u64().unwrap() < 3000);
}

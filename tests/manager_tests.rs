//! Tests for the AppManager registry and the control socket
//!
//! Tests use temporary directories for isolation; apps are /bin/sh
//! children defined through real config files.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use warden::app::AppState;
use warden::control::{self, ControlClient, ControlCommand, ControlResponse, ControlServer};
use warden::error::Error;
use warden::manager::{AppManager, ManagerConfig};
use assert_matches::assert_matches;

/// Write a config file declaring a single long-running app.
fn write_sleeper_config(dir: &TempDir, name: &str) -> std::path::PathBuf {
    let script = dir.path().join("sleeper.sh");
    std::fs::write(&script, "exec sleep 30\n").unwrap();

    let config_path = dir.path().join("warden.toml");
    std::fs::write(
        &config_path,
        format!(
            r#"
            [apps.{}]
            interpreter = "/bin/sh"
            script = "{}"
            listen_timeout = 100
            kill_timeout = 1000
            "#,
            name,
            script.display()
        ),
    )
    .unwrap();
    config_path
}

fn manager_in(dir: &TempDir, config_path: &Path) -> AppManager {
    AppManager::new(ManagerConfig {
        config_path: config_path.to_path_buf(),
        runtime_dir: dir.path().join("run"),
        log_dir: dir.path().join("logs"),
    })
}

async fn wait_app_running(manager: &AppManager, name: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let statuses = manager.status(name).await.unwrap();
        if !statuses.is_empty() && statuses.iter().all(|s| s.state == AppState::Running) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "app did not reach Running in time"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

mod registry {
    use super::*;

    #[tokio::test]
    async fn test_start_stop_round_trip() {
        let dir = TempDir::new().unwrap();
        let config = write_sleeper_config(&dir, "svc");
        let manager = manager_in(&dir, &config);

        assert_eq!(manager.load_apps().await.unwrap(), 1);
        assert_eq!(manager.start("svc").await.unwrap(), 1);
        wait_app_running(&manager, "svc").await;

        // Starting a running app is refused.
        assert_matches!(manager.start("svc").await, Err(Error::AlreadyRunning(_)));

        manager.stop("svc").await.unwrap();
        let statuses = manager.status("svc").await.unwrap();
        assert!(statuses.iter().all(|s| s.state == AppState::Stopped));

        // Stopping a stopped app is refused.
        assert_matches!(manager.stop("svc").await, Err(Error::NotRunning(_)));
    }

    #[tokio::test]
    async fn test_unknown_app_is_an_error() {
        let dir = TempDir::new().unwrap();
        let config = write_sleeper_config(&dir, "svc");
        let manager = manager_in(&dir, &config);
        manager.load_apps().await.unwrap();

        assert_matches!(manager.start("ghost").await, Err(Error::UnknownApp(_)));
        assert_matches!(manager.stop("ghost").await, Err(Error::UnknownApp(_)));
        assert_matches!(manager.status("ghost").await, Err(Error::UnknownApp(_)));
    }

    #[tokio::test]
    async fn test_multiple_instances_get_distinct_identities() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("instance.sh");
        std::fs::write(&script, "echo \"$WARDEN_INSTANCE\"\nexec sleep 30\n").unwrap();

        let config_path = dir.path().join("warden.toml");
        std::fs::write(
            &config_path,
            format!(
                r#"
                [apps.pool]
                interpreter = "/bin/sh"
                script = "{}"
                instances = 2
                exec_mode = "cluster"
                listen_timeout = 100
                kill_timeout = 1000
                "#,
                script.display()
            ),
        )
        .unwrap();

        let manager = manager_in(&dir, &config_path);
        manager.load_apps().await.unwrap();
        assert_eq!(manager.start("pool").await.unwrap(), 2);
        wait_app_running(&manager, "pool").await;

        let statuses = manager.status("pool").await.unwrap();
        assert_eq!(statuses.len(), 2);
        let pids: Vec<_> = statuses.iter().filter_map(|s| s.pid).collect();
        assert_eq!(pids.len(), 2);
        assert_ne!(pids[0], pids[1]);

        // Each instance logs to its own default file.
        let log_dir = dir.path().join("logs");
        let first = std::fs::read_to_string(log_dir.join("pool-0-out.log")).unwrap();
        let second = std::fs::read_to_string(log_dir.join("pool-1-out.log")).unwrap();
        assert!(first.trim().ends_with('0'));
        assert!(second.trim().ends_with('1'));

        manager.stop("pool").await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_brings_up_a_fresh_child() {
        let dir = TempDir::new().unwrap();
        let config = write_sleeper_config(&dir, "svc");
        let manager = manager_in(&dir, &config);
        manager.load_apps().await.unwrap();

        manager.start("svc").await.unwrap();
        wait_app_running(&manager, "svc").await;
        let old_pid = manager.status("svc").await.unwrap()[0].pid.unwrap();

        manager.restart("svc").await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let new_pid = loop {
            let statuses = manager.status("svc").await.unwrap();
            if let Some(pid) = statuses[0].pid {
                if pid != old_pid && statuses[0].state == AppState::Running {
                    break pid;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "restart never produced a new child"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        };
        assert_ne!(new_pid, old_pid);

        manager.stop("svc").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_reports_aggregate_state() {
        let dir = TempDir::new().unwrap();
        let config = write_sleeper_config(&dir, "svc");
        let manager = manager_in(&dir, &config);
        manager.load_apps().await.unwrap();

        let summaries = manager.list().await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].name, "svc");
        assert_eq!(summaries[0].state, AppState::Stopped);

        manager.start("svc").await.unwrap();
        wait_app_running(&manager, "svc").await;

        let summaries = manager.list().await;
        assert_eq!(summaries[0].state, AppState::Running);
        assert_eq!(summaries[0].running, 1);

        manager.stop("svc").await.unwrap();
    }
}

mod control_socket {
    use super::*;

    /// Run an accept loop like the daemon's over a test socket.
    fn serve(
        mut server: ControlServer,
        manager: Arc<AppManager>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let mut stream = match server.accept().await {
                    Ok(stream) => stream,
                    Err(_) => break,
                };
                let manager = Arc::clone(&manager);
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Ok(command) = ControlServer::read_command(&mut stream).await {
                        let response = control::dispatch(&manager, &shutdown_tx, command).await;
                        let _ = ControlServer::write_response(&mut stream, &response).await;
                    }
                });
            }
        })
    }

    #[tokio::test]
    async fn test_command_round_trip_over_the_socket() {
        let dir = TempDir::new().unwrap();
        let config = write_sleeper_config(&dir, "svc");
        let manager = Arc::new(manager_in(&dir, &config));
        manager.load_apps().await.unwrap();

        let socket_path = dir.path().join("run").join("control.sock");
        let mut server = ControlServer::new(&socket_path);
        server.start().await.unwrap();

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let server_task = serve(server, Arc::clone(&manager), shutdown_tx);

        let client = ControlClient::new(&socket_path);
        assert!(client.ping().await);

        let response = client
            .send_command(ControlCommand::Start {
                name: "svc".to_string(),
            })
            .await
            .unwrap();
        assert_matches!(response, ControlResponse::Success { .. });
        wait_app_running(&manager, "svc").await;

        let response = client
            .send_command(ControlCommand::Status {
                name: "svc".to_string(),
            })
            .await
            .unwrap();
        match response {
            ControlResponse::Status { app, instances } => {
                assert_eq!(app, "svc");
                assert_eq!(instances.len(), 1);
                assert_eq!(instances[0].state, AppState::Running);
            }
            other => panic!("unexpected response: {:?}", other),
        }

        let response = client.send_command(ControlCommand::List).await.unwrap();
        match response {
            ControlResponse::AppList { apps } => {
                assert_eq!(apps.len(), 1);
                assert_eq!(apps[0].name, "svc");
            }
            other => panic!("unexpected response: {:?}", other),
        }

        // Unknown names come back as command errors, not transport errors.
        let response = client
            .send_command(ControlCommand::Stop {
                name: "ghost".to_string(),
            })
            .await
            .unwrap();
        assert_matches!(response, ControlResponse::Error { .. });

        let response = client
            .send_command(ControlCommand::Stop {
                name: "svc".to_string(),
            })
            .await
            .unwrap();
        assert_matches!(response, ControlResponse::Success { .. });

        let response = client.send_command(ControlCommand::Shutdown).await.unwrap();
        assert_matches!(response, ControlResponse::Success { .. });
        tokio::time::timeout(Duration::from_secs(1), shutdown_rx.recv())
            .await
            .expect("shutdown must be broadcast")
            .unwrap();

        server_task.abort();
    }

    #[tokio::test]
    async fn test_client_without_daemon_fails_cleanly() {
        let dir = TempDir::new().unwrap();
        let client = ControlClient::new(dir.path().join("missing.sock"));
        assert!(!client.ping().await);
        assert!(client.send_command(ControlCommand::List).await.is_err());
    }
}

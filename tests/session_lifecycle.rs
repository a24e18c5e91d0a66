//! End-to-end session lifecycle against the real worker binary
//!
//! Each test builds a fake portable installation in a temp dir, points the
//! registry at the bundled `mt5-worker` binary, and exercises the full
//! create / dispatch / evict / teardown path over actual pipes and
//! processes.

use secrecy::SecretString;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use mt5_bridge::{BridgeConfig, SessionError, SessionRegistry};

fn worker_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_mt5-worker"))
}

/// A minimal vendor installation: the terminal "binary" plus one library
fn fake_install(root: &Path) -> PathBuf {
    let install = root.join("install");
    std::fs::create_dir_all(&install).unwrap();
    let exe = install.join("terminal64.exe");
    std::fs::write(&exe, b"terminal binary").unwrap();
    std::fs::write(install.join("mt5api.dll"), b"lib").unwrap();
    exe
}

fn bridge_config(tmp: &TempDir) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.sessions_base_path = tmp.path().join("sessions");
    config.portable_terminal_path = fake_install(tmp.path());
    config.worker_command = Some(worker_binary());
    config
}

fn session_dirs(base: &Path) -> Vec<String> {
    if !base.exists() {
        return Vec::new();
    }
    std::fs::read_dir(base)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("session_"))
        .collect()
}

fn pw(s: &str) -> SecretString {
    SecretString::new(s.to_string())
}

#[tokio::test]
async fn test_happy_path_lifecycle() {
    let tmp = TempDir::new().unwrap();
    let registry = SessionRegistry::new(bridge_config(&tmp));

    let id = registry.create_session(42, pw("pw"), "srv-A").await.unwrap();

    let resp = registry
        .execute_command(&id, "symbol_select", json!({"symbol": "EURUSD", "enable": true}))
        .await
        .unwrap();
    assert!(resp.success);
    assert_eq!(resp.result, Some(serde_json::Value::Null));

    let listing = registry.list_sessions();
    let info = listing.get(&id).expect("session should be listed");
    assert_eq!(info.login, 42);
    assert_eq!(info.server, "srv-A");
    assert!(info.age_seconds >= 0.0);

    assert!(registry.cleanup_session(&id).await);
    assert!(registry.get_session(&id).is_none());
    assert!(session_dirs(&registry.config().sessions_base_path).is_empty());
}

#[tokio::test]
async fn test_init_failure_reports_vendor_error_and_leaves_nothing() {
    let tmp = TempDir::new().unwrap();
    let registry = SessionRegistry::new(bridge_config(&tmp));

    let err = registry
        .create_session(0, pw(""), "")
        .await
        .expect_err("invalid credentials must fail");
    match err {
        SessionError::Init(msg) => assert!(msg.contains("invalid account"), "got: {msg}"),
        other => panic!("expected Init error, got {other:?}"),
    }

    assert_eq!(registry.session_count(), 0);
    assert!(session_dirs(&registry.config().sessions_base_path).is_empty());
}

#[tokio::test]
async fn test_concurrent_dispatch_on_one_session() {
    let tmp = TempDir::new().unwrap();
    let registry = SessionRegistry::new(bridge_config(&tmp));

    let id = registry.create_session(42, pw("pw"), "srv-A").await.unwrap();

    let reg_x: Arc<SessionRegistry> = Arc::clone(&registry);
    let reg_y: Arc<SessionRegistry> = Arc::clone(&registry);
    let id_x = id.clone();
    let id_y = id.clone();

    let task_x = tokio::spawn(async move {
        reg_x
            .execute_command(&id_x, "quote", json!({"symbol": "X"}))
            .await
    });
    let task_y = tokio::spawn(async move {
        reg_y
            .execute_command(&id_y, "quote", json!({"symbol": "Y"}))
            .await
    });

    let resp_x = task_x.await.unwrap().unwrap();
    let resp_y = task_y.await.unwrap().unwrap();

    for resp in [&resp_x, &resp_y] {
        assert!(resp.success);
        let result = resp.result.as_ref().unwrap();
        assert!(result["bid"].as_f64().unwrap() > 0.0);
        assert!(result["ask"].as_f64().unwrap() > result["bid"].as_f64().unwrap());
    }
    // Different symbols, different simulated prices
    assert_ne!(resp_x.result.unwrap()["bid"], resp_y.result.unwrap()["bid"]);

    registry.close_all_sessions().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_idle_sessions_are_reaped() {
    let tmp = TempDir::new().unwrap();
    let mut config = bridge_config(&tmp);
    config.session_idle_timeout_seconds = 2;
    config.reaper_interval_seconds = 1;

    let registry = SessionRegistry::new(config);
    let reaper = registry.spawn_reaper();

    let id = registry.create_session(42, pw("pw"), "srv-A").await.unwrap();
    assert!(registry.get_session(&id).is_some());

    tokio::time::sleep(Duration::from_secs(4)).await;

    assert!(registry.get_session(&id).is_none());
    assert!(registry.list_sessions().is_empty());
    assert!(session_dirs(&registry.config().sessions_base_path).is_empty());

    registry.begin_shutdown();
    reaper.abort();
}

#[tokio::test]
async fn test_cleanup_session_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let registry = SessionRegistry::new(bridge_config(&tmp));

    let id = registry.create_session(42, pw("pw"), "srv-A").await.unwrap();

    assert!(registry.cleanup_session(&id).await);
    assert!(!registry.cleanup_session(&id).await);
    assert!(session_dirs(&registry.config().sessions_base_path).is_empty());
}

#[tokio::test]
async fn test_template_is_built_once_and_sessions_are_isolated() {
    let tmp = TempDir::new().unwrap();
    let registry = SessionRegistry::new(bridge_config(&tmp));
    let template_dir = registry.config().template_dir();

    let first = registry.create_session(1, pw("pw"), "srv-A").await.unwrap();

    // Mark the built template; later sessions must clone this exact copy
    let sentinel = template_dir.join("template_sentinel");
    std::fs::write(&sentinel, b"built once").unwrap();
    let ini_mtime = std::fs::metadata(template_dir.join("Config").join("terminal.ini"))
        .unwrap()
        .modified()
        .unwrap();

    let mut ids = vec![first];
    for login in 2..=10 {
        ids.push(
            registry
                .create_session(login, pw("pw"), "srv-A")
                .await
                .unwrap(),
        );
    }

    // Not rebuilt: the injected ini is untouched and the sentinel survives
    assert!(sentinel.exists());
    let ini_mtime_after = std::fs::metadata(template_dir.join("Config").join("terminal.ini"))
        .unwrap()
        .modified()
        .unwrap();
    assert_eq!(ini_mtime, ini_mtime_after);

    // Sessions created after the sentinel carry a copy of it
    let base = &registry.config().sessions_base_path;
    for id in &ids[1..] {
        assert!(base.join(format!("session_{id}")).join("template_sentinel").exists());
    }

    // No shared mutable state between session dirs
    let marker = base.join(format!("session_{}", ids[1])).join("MQL5/Files/state.dat");
    std::fs::create_dir_all(marker.parent().unwrap()).unwrap();
    std::fs::write(&marker, b"session private").unwrap();
    assert!(!base
        .join(format!("session_{}", ids[2]))
        .join("MQL5/Files/state.dat")
        .exists());

    assert_eq!(registry.close_all_sessions().await, 10);
    assert!(session_dirs(base).is_empty());
}

#[tokio::test]
async fn test_trading_commands_round_trip() {
    let tmp = TempDir::new().unwrap();
    let registry = SessionRegistry::new(bridge_config(&tmp));

    let id = registry.create_session(42, pw("pw"), "srv-A").await.unwrap();

    let account = registry
        .execute_command(&id, "account_info", json!({}))
        .await
        .unwrap();
    assert_eq!(account.result.unwrap()["login"], 42);

    let candles = registry
        .execute_command(
            &id,
            "candles",
            json!({"symbol": "EURUSD", "timeframe": "M5", "count": 5}),
        )
        .await
        .unwrap();
    assert_eq!(candles.result.unwrap().as_array().unwrap().len(), 5);

    let order = registry
        .execute_command(
            &id,
            "order_send",
            json!({"symbol": "EURUSD", "volume": 0.1, "type": 0}),
        )
        .await
        .unwrap();
    assert_eq!(order.result.unwrap()["retcode"], 10009);

    let positions = registry
        .execute_command(&id, "positions_get", json!({"symbol": "EURUSD"}))
        .await
        .unwrap();
    assert_eq!(positions.result.unwrap().as_array().unwrap().len(), 1);

    // Vendor-level failures surface verbatim and leave the session usable
    let err = registry
        .execute_command(&id, "quote", json!({"symbol": ""}))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Vendor(_)));
    assert!(registry.get_session(&id).is_some());

    let unknown = registry
        .execute_command(&id, "teleport", json!({}))
        .await
        .unwrap_err();
    match unknown {
        SessionError::Vendor(msg) => assert_eq!(msg, "unknown command: teleport"),
        other => panic!("expected Vendor error, got {other:?}"),
    }

    registry.cleanup_session(&id).await;
}

#[tokio::test]
async fn test_last_accessed_moves_with_commands() {
    let tmp = TempDir::new().unwrap();
    let registry = SessionRegistry::new(bridge_config(&tmp));

    let id = registry.create_session(42, pw("pw"), "srv-A").await.unwrap();

    registry.execute_command(&id, "ping", json!({})).await.unwrap();
    let first = registry.list_sessions().get(&id).unwrap().last_accessed;

    tokio::time::sleep(Duration::from_millis(20)).await;
    registry.execute_command(&id, "ping", json!({})).await.unwrap();
    let second = registry.list_sessions().get(&id).unwrap().last_accessed;

    assert!(second >= first);

    registry.cleanup_session(&id).await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_terminal_process_is_reaped_with_its_session() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = TempDir::new().unwrap();
    let mut config = bridge_config(&tmp);

    // Make the fake terminal actually runnable so the worker launches it
    std::fs::write(&config.portable_terminal_path, b"#!/bin/sh\nexec sleep 300\n").unwrap();
    std::fs::set_permissions(
        &config.portable_terminal_path,
        std::fs::Permissions::from_mode(0o755),
    )
    .unwrap();
    config.worker_command = Some(worker_binary());

    let registry = SessionRegistry::new(config);
    let id = registry.create_session(42, pw("pw"), "srv-A").await.unwrap();

    let handle = registry.get_session(&id).unwrap();
    let terminal_pid = handle.mt5_pid().expect("worker should report the terminal pid");
    assert!(process_alive(terminal_pid));
    drop(handle);

    registry.cleanup_session(&id).await;

    // The worker's shutdown kills the terminal it launched
    let mut alive = process_alive(terminal_pid);
    for _ in 0..50 {
        if !alive {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        alive = process_alive(terminal_pid);
    }
    assert!(!alive, "terminal process {terminal_pid} outlived its session");
    assert!(session_dirs(&registry.config().sessions_base_path).is_empty());
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

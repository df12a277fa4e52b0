//! End-to-end tests for plugin servers and directory discovery.
//!
//! Every test gets its own temporary discovery directory, real Unix sockets
//! and a real tokio runtime. Nothing is mocked.

use std::fs;
use std::os::unix::net::UnixListener as StdUnixListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use plugdir::discovery::{Change, DirWatcher};
use plugdir::plugin::Unusable;
use plugdir::{ConnectionHandler, DirDiscovery, DiscoveryError, PluginServer};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

struct Echo;

#[async_trait]
impl ConnectionHandler for Echo {
    async fn handle(&self, mut stream: UnixStream, _conn_id: String) {
        let mut buf = [0u8; 256];
        while let Ok(n) = stream.read(&mut buf).await {
            if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
    }
}

fn discovery(tmp: &TempDir) -> DirDiscovery {
    DirDiscovery::new(tmp.path())
        .unwrap()
        .with_poll_interval(Duration::from_millis(10))
}

#[tokio::test]
async fn test_two_plugins_come_and_go() {
    let tmp = TempDir::new().unwrap();
    let discovery = discovery(&tmp);
    assert!(discovery.list().unwrap().is_empty());

    let mut group = PluginServer::start_at_path(tmp.path().join("group"), Echo).unwrap();
    let mut flavor = PluginServer::start_at_path(tmp.path().join("flavor"), Echo).unwrap();

    let found = discovery.find("group").unwrap();
    assert_eq!(found.path(), tmp.path().join("group"));
    assert_eq!(found.address(), format!("unix://{}", tmp.path().join("group").display()));
    assert!(discovery.find("flavor").is_ok());
    let err = discovery.find("manager").unwrap_err();
    assert!(err.is_not_found(), "a name nobody started must be NotFound, got: {err}");

    let list = discovery.list().unwrap();
    assert_eq!(list.keys().cloned().collect::<Vec<_>>(), vec!["flavor", "group"]);

    group.stop().unwrap();
    assert!(discovery.wait_gone("group", Duration::from_secs(5)).unwrap());
    assert!(!tmp.path().join("group").exists());
    assert!(discovery.find("flavor").is_ok(), "stopping one plugin must not affect another");

    flavor.stop().unwrap();
    assert!(discovery.wait_gone("flavor", Duration::from_secs(5)).unwrap());
    assert!(discovery.list().unwrap().is_empty());
}

#[tokio::test]
async fn test_found_endpoint_is_connectable() {
    let tmp = TempDir::new().unwrap();
    let _server = PluginServer::start_at_path(tmp.path().join("echo"), Echo).unwrap();

    let endpoint = discovery(&tmp).find("echo/v1").unwrap();
    assert_eq!(endpoint.name().lookup(), "echo");

    let mut stream = endpoint.connect_async().await.unwrap();
    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
}

#[tokio::test]
async fn test_crashed_plugin_is_replaced_on_restart() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("group");

    // A plugin that exited without cleaning up.
    drop(StdUnixListener::bind(&path).unwrap());
    assert!(path.exists());

    let err = discovery(&tmp).find("group").unwrap_err();
    assert!(
        matches!(&err, DiscoveryError::NotASocket { reason: Unusable::Stale, .. }),
        "got: {err}"
    );

    let _server = PluginServer::start_at_path(&path, Echo).unwrap();
    assert!(discovery(&tmp).find("group").is_ok());
}

#[tokio::test]
async fn test_second_server_on_same_name_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("group");
    let _first = PluginServer::start_at_path(&path, Echo).unwrap();

    let err = PluginServer::start_at_path(&path, Echo).unwrap_err();
    assert!(err.is_already_in_use(), "got: {err}");
    assert!(discovery(&tmp).find("group").is_ok(), "the live plugin must survive");
}

#[test]
fn test_plain_file_is_reported_not_deleted() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("manager");
    fs::write(&path, b"not a socket").unwrap();

    let err = discovery(&tmp).find("manager").unwrap_err();
    assert!(err.is_not_a_socket(), "got: {err}");

    let snapshot = discovery(&tmp).snapshot().unwrap();
    assert!(snapshot.endpoints.is_empty());
    assert!(snapshot.invalid.contains_key("manager"));
    assert_eq!(fs::read(&path).unwrap(), b"not a socket");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lookups_during_teardown_never_see_a_stale_socket() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().to_path_buf();

    for round in 0..20 {
        let mut server = PluginServer::start_at_path(dir.join("group"), Echo).unwrap();
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let discovery = DirDiscovery::new(&dir).unwrap();
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    while !done.load(Ordering::Relaxed) {
                        match discovery.find("group") {
                            Ok(_) => {}
                            Err(e) if e.is_not_found() => {}
                            Err(e) => panic!("round {round}: unexpected lookup result: {e}"),
                        }
                        let _ = discovery.list().unwrap();
                    }
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(5)).await;
        server.stop().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        done.store(true, Ordering::Relaxed);

        for reader in readers {
            reader.join().unwrap();
        }
        assert!(DirDiscovery::new(&dir).unwrap().find("group").unwrap_err().is_not_found());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_watcher_reports_server_lifecycle() {
    let tmp = TempDir::new().unwrap();
    let mut watcher = DirWatcher::new(discovery(&tmp), Duration::from_millis(10)).unwrap();
    assert!(watcher.current().is_empty());

    let mut server = PluginServer::start_at_path(tmp.path().join("instance"), Echo).unwrap();
    let changes = tokio::task::block_in_place(|| watcher.next_changes(Duration::from_secs(5))).unwrap();
    assert!(
        matches!(&changes[..], [Change::Appeared(e)] if e.name().as_str() == "instance"),
        "got: {changes:?}"
    );

    server.stop().unwrap();
    let changes = tokio::task::block_in_place(|| watcher.next_changes(Duration::from_secs(5))).unwrap();
    assert_eq!(changes, vec![Change::Vanished("instance".to_string())]);
}

//! Driver Run/Stop lifecycle tests
//!
//! Start the real gRPC server on a loopback TCP port or a Unix socket in a
//! scratch directory and talk to it with the generated CSI clients.

mod common;

use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tonic::transport::Channel;

use cloudblock_csi::csi;
use cloudblock_csi::csi::controller_client::ControllerClient;
use cloudblock_csi::csi::identity_client::IdentityClient;
use cloudblock_csi::csi::node_client::NodeClient;
use cloudblock_csi::{Driver, DriverConfig, DriverError};

use common::{FakeControlPlane, FakeMounter};

fn driver(endpoint: &str) -> Arc<Driver> {
    Arc::new(Driver::new(
        DriverConfig {
            driver_name: "csi.cloudblock.io".to_string(),
            version: "1.0.0".to_string(),
            node_id: "node-1".to_string(),
            endpoint: endpoint.to_string(),
        },
        Arc::new(FakeMounter::new()),
        Arc::new(FakeControlPlane::new()),
    ))
}

fn spawn_run(driver: &Arc<Driver>) -> JoinHandle<Result<(), DriverError>> {
    let driver = Arc::clone(driver);
    tokio::spawn(async move { driver.run().await })
}

/// Reserve a loopback port by binding and immediately releasing it.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn connect(port: u16) -> Channel {
    let url = format!("http://127.0.0.1:{}", port);
    for _ in 0..100 {
        if let Ok(channel) = Channel::from_shared(url.clone()).unwrap().connect().await {
            return channel;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("driver did not start listening on port {}", port);
}

async fn wait_for_socket(path: &Path) {
    for _ in 0..100 {
        if let Ok(meta) = std::fs::metadata(path)
            && meta.file_type().is_socket()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("socket {} was not created", path.display());
}

#[tokio::test]
async fn test_run_probe_stop_over_tcp() {
    let port = free_port();
    let driver = driver(&format!("tcp://127.0.0.1:{}", port));
    let handle = spawn_run(&driver);

    let channel = connect(port).await;

    let mut identity = IdentityClient::new(channel.clone());
    let probe = identity
        .probe(csi::ProbeRequest {})
        .await
        .unwrap()
        .into_inner();
    assert_eq!(probe.ready, Some(true));

    let info = identity
        .get_plugin_info(csi::GetPluginInfoRequest {})
        .await
        .unwrap()
        .into_inner();
    assert_eq!(info.name, "csi.cloudblock.io");
    assert_eq!(info.vendor_version, "1.0.0");

    driver.stop();
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("run returns after stop")
        .unwrap();
    assert!(result.is_ok(), "{:?}", result);

    // The listener is gone with the server
    let url = format!("http://127.0.0.1:{}", port);
    assert!(
        Channel::from_shared(url)
            .unwrap()
            .connect()
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_stop_closes_open_connections() {
    let port = free_port();
    let driver = driver(&format!("tcp://127.0.0.1:{}", port));
    let handle = spawn_run(&driver);

    let mut identity = IdentityClient::new(connect(port).await);
    identity.probe(csi::ProbeRequest {}).await.unwrap();

    driver.stop();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("run returns after stop")
        .unwrap()
        .unwrap();

    // Same client, connection opened before the stop
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        identity.probe(csi::ProbeRequest {}),
    )
    .await
    .expect("probe does not hang");
    assert!(result.is_err(), "{:?}", result);
}

#[tokio::test]
async fn test_all_services_registered() {
    let port = free_port();
    let driver = driver(&format!("tcp://127.0.0.1:{}", port));
    let handle = spawn_run(&driver);

    let channel = connect(port).await;

    let mut controller = ControllerClient::new(channel.clone());
    let caps = controller
        .controller_get_capabilities(csi::ControllerGetCapabilitiesRequest {})
        .await
        .unwrap()
        .into_inner();
    assert_eq!(caps.capabilities.len(), 2);

    let status = controller
        .list_volumes(csi::ListVolumesRequest::default())
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::Unimplemented);

    let mut node = NodeClient::new(channel);
    let info = node
        .node_get_info(csi::NodeGetInfoRequest {})
        .await
        .unwrap()
        .into_inner();
    assert_eq!(info.node_id, "node-1");

    // Validation errors travel over the wire unchanged
    let status = node
        .node_stage_volume(csi::NodeStageVolumeRequest::default())
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);

    driver.stop();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unix_socket_replaces_stale_file() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("csi.sock");
    std::fs::write(&socket, b"left over from a previous run").unwrap();

    let driver = driver(&format!("unix://{}", socket.display()));
    let handle = spawn_run(&driver);

    wait_for_socket(&socket).await;
    tokio::net::UnixStream::connect(&socket).await.unwrap();

    driver.stop();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("run returns after stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_unix_socket_path_that_cannot_be_removed() {
    let dir = tempfile::tempdir().unwrap();
    // A directory in place of the socket is not a stale socket
    let socket = dir.path().join("csi.sock");
    std::fs::create_dir(&socket).unwrap();

    let driver = driver(&format!("unix://{}", socket.display()));
    let err = driver.run().await.unwrap_err();
    assert!(matches!(err, DriverError::Io(_)), "{:?}", err);
}

#[tokio::test]
async fn test_run_rejects_invalid_endpoint() {
    for endpoint in ["/tmp/csi.sock", "http://127.0.0.1:9000", "unix://", "tcp://"] {
        let driver = driver(endpoint);
        let err = driver.run().await.unwrap_err();
        assert!(matches!(err, DriverError::Endpoint(_)), "{}: {:?}", endpoint, err);
    }
}

#[tokio::test]
async fn test_stop_before_run_returns_once_bound() {
    let driver = driver("tcp://127.0.0.1:0");
    driver.stop();

    let result = tokio::time::timeout(Duration::from_secs(5), driver.run())
        .await
        .expect("run returns immediately");
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_listen_failure_is_reported() {
    // Port already taken by another listener
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let driver = driver(&format!("tcp://127.0.0.1:{}", port));
    let err = driver.run().await.unwrap_err();
    assert!(matches!(err, DriverError::Io(_)), "{:?}", err);
}

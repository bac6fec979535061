//! End-to-end tunnel tests: a fake client echoes tunneled bytes back, so a
//! TCP connection through the tunnel sees its own payload.

mod common;

use common::{harness, wait_for, FakeClient, FakeClientConfig};
use portgate_proto::Remote;
use portgate_server::{ErrorKind, StartTunnelOptions};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn options() -> StartTunnelOptions {
    StartTunnelOptions {
        check_remote_port: false,
        check_local_port: true,
        reuse_existing: false,
        check_port_timeout: Duration::from_secs(1),
    }
}

fn local_remote(acl: Option<&str>) -> Remote {
    let mut remote = Remote::new("127.0.0.1", 7777);
    remote.local_host = "127.0.0.1".to_string();
    remote.acl = acl.map(|s| s.to_string());
    remote
}

#[tokio::test]
async fn test_tunnel_roundtrip_and_forced_teardown() {
    let h = harness();
    let client = FakeClient::connect(
        &h,
        "203.0.113.20:41000",
        FakeClientConfig::named(0x11, "echo-1"),
    )
    .await
    .unwrap();

    let entry = h.registry.get_active_by_id(&client.client_id).await.unwrap();
    let tunnel = {
        let mut locked = entry.lock().await;
        locked
            .start_tunnels(&h.distributor, vec![local_remote(None)], &options())
            .await
            .unwrap()
            .remove(0)
    };
    assert_eq!(tunnel.id, "1");
    let port = tunnel.remote.local_port;
    assert!(h.port_range.contains(&port));

    // connect through the tunnel and get our bytes echoed back
    let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    conn.write_all(b"ping through tunnel").await.unwrap();
    let mut buf = vec![0u8; 64];
    let n = conn.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"ping through tunnel");

    {
        let tunnel = tunnel.clone();
        wait_for(move || tunnel.active_connections() == 1, "conn counted").await;
    }

    // non-forced teardown is refused while the connection is open
    {
        let mut locked = entry.lock().await;
        let err = locked.terminate_tunnel(&tunnel.id, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    // forced teardown closes the in-flight connection promptly
    {
        let mut locked = entry.lock().await;
        locked.terminate_tunnel(&tunnel.id, true).unwrap();
    }
    let n = tokio::time::timeout(Duration::from_secs(2), conn.read(&mut buf))
        .await
        .expect("connection must close after forced teardown")
        .unwrap();
    assert_eq!(n, 0);

    // the listener is gone too
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());

    let locked = entry.lock().await;
    assert!(locked.find_tunnel(&tunnel.id).is_none());
}

#[tokio::test]
async fn test_acl_denies_foreign_source() {
    let h = harness();
    let client = FakeClient::connect(
        &h,
        "203.0.113.20:41001",
        FakeClientConfig::named(0x12, "echo-2"),
    )
    .await
    .unwrap();

    let entry = h.registry.get_active_by_id(&client.client_id).await.unwrap();
    // 127.0.0.1 is not inside the allowed block
    let tunnel = {
        let mut locked = entry.lock().await;
        locked
            .start_tunnels(
                &h.distributor,
                vec![local_remote(Some("192.168.1.0/24"))],
                &options(),
            )
            .await
            .unwrap()
            .remove(0)
    };

    let mut conn = TcpStream::connect(("127.0.0.1", tunnel.remote.local_port))
        .await
        .unwrap();
    let mut buf = [0u8; 8];
    // the server drops the connection without reading
    let n = tokio::time::timeout(Duration::from_secs(2), conn.read(&mut buf))
        .await
        .expect("denied connection must be closed")
        .unwrap_or(0);
    assert_eq!(n, 0);
    assert_eq!(tunnel.active_connections(), 0);
}

#[tokio::test]
async fn test_duplicate_tunnel_is_conflict_but_handshake_path_reuses() {
    let h = harness();
    let client = FakeClient::connect(
        &h,
        "203.0.113.20:41002",
        FakeClientConfig::named(0x13, "echo-3"),
    )
    .await
    .unwrap();

    let entry = h.registry.get_active_by_id(&client.client_id).await.unwrap();
    let mut locked = entry.lock().await;

    let first = locked
        .start_tunnels(&h.distributor, vec![local_remote(None)], &options())
        .await
        .unwrap()
        .remove(0);

    // operator path: identical forward is a conflict
    let mut same = local_remote(None);
    same.local_port = first.remote.local_port;
    let err = locked
        .start_tunnels(&h.distributor, vec![same.clone()], &options())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    // handshake path: the existing tunnel is returned as-is
    let reuse = StartTunnelOptions {
        reuse_existing: true,
        ..options()
    };
    let again = locked
        .start_tunnels(&h.distributor, vec![same], &reuse)
        .await
        .unwrap()
        .remove(0);
    assert_eq!(again.id, first.id);
    assert_eq!(locked.view().tunnels.len(), 1);
}

#[tokio::test]
async fn test_same_remote_different_local_is_conflict() {
    let h = harness();
    let client = FakeClient::connect(
        &h,
        "203.0.113.20:41003",
        FakeClientConfig::named(0x14, "echo-4"),
    )
    .await
    .unwrap();

    let entry = h.registry.get_active_by_id(&client.client_id).await.unwrap();
    let mut locked = entry.lock().await;

    locked
        .start_tunnels(&h.distributor, vec![local_remote(None)], &options())
        .await
        .unwrap();

    // same client-side endpoint and ACL, different (auto-allocated) local port
    let err = locked
        .start_tunnels(&h.distributor, vec![local_remote(None)], &options())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_local_port_outside_pool_is_conflict() {
    let h = harness();
    let client = FakeClient::connect(
        &h,
        "203.0.113.20:41004",
        FakeClientConfig::named(0x15, "echo-5"),
    )
    .await
    .unwrap();

    let entry = h.registry.get_active_by_id(&client.client_id).await.unwrap();
    let mut locked = entry.lock().await;

    let mut remote = local_remote(None);
    remote.local_port = 1; // never in the allowed pool
    let err = locked
        .start_tunnels(&h.distributor, vec![remote], &options())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_idle_tunnel_reaped() {
    let h = harness();
    let client = FakeClient::connect(
        &h,
        "203.0.113.20:41005",
        FakeClientConfig::named(0x16, "echo-6"),
    )
    .await
    .unwrap();

    let entry = h.registry.get_active_by_id(&client.client_id).await.unwrap();
    let tunnel = {
        let mut locked = entry.lock().await;
        let mut remote = local_remote(None);
        remote.auto_close_secs = Some(1);
        locked
            .start_tunnels(&h.distributor, vec![remote], &options())
            .await
            .unwrap()
            .remove(0)
    };
    let port = tunnel.remote.local_port;

    {
        let tunnel = tunnel.clone();
        wait_for(move || tunnel.is_terminated(), "idle watchdog to fire").await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());

    // the reaped tunnel no longer shows up on the client
    let locked = entry.lock().await;
    assert!(locked.view().tunnels.is_empty());
}

#[tokio::test]
async fn test_client_disconnect_tears_tunnels_down() {
    let h = harness();
    let mut config = FakeClientConfig::named(0x17, "echo-7");
    config.remotes = vec![local_remote(None)];
    let client = FakeClient::connect(&h, "203.0.113.20:41006", config)
        .await
        .unwrap();

    let entry = h.registry.get_active_by_id(&client.client_id).await.unwrap();

    // the handshake remote is started on the listener task
    {
        let entry = entry.clone();
        wait_for(
            move || {
                entry
                    .try_lock()
                    .map(|c| !c.tunnels.is_empty())
                    .unwrap_or(false)
            },
            "handshake remote to be started",
        )
        .await;
    }
    let tunnel = entry.lock().await.tunnels[0].clone();

    // kill the session from the server side, as a dropped transport would
    {
        let locked = entry.lock().await;
        locked.session.as_ref().unwrap().close();
    }

    {
        let entry = entry.clone();
        wait_for(
            move || {
                entry
                    .try_lock()
                    .map(|c| !c.is_connected())
                    .unwrap_or(false)
            },
            "client to be marked disconnected",
        )
        .await;
    }
    assert!(tunnel.is_terminated());
}

//! End-to-end tests running real mesh nodes on the loopback interface.
//!
//! Every node listens on an ephemeral port. The periodic tick is pushed far
//! into the future so heartbeats and reconnects only happen when a test calls
//! `MeshHandle::tick`.

use bytes::{Buf, Bytes, BytesMut};
use node_mesh::{
    CenterEntry, CenterRole, ChannelDispatcher, Decoded, Delivery, FrameCodec, Handle,
    LocalModules, MeshConfig, MeshError, MeshHandle, MessageType, ModuleEvent, NodeAddr,
    NodeEntry, NodeId, NodeMesh, PeerState, CENTER_MODULE_ID, MESH_MODULE_ID,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::{sleep, timeout, Duration};

const WAIT: Duration = Duration::from_secs(5);

struct TestNode {
    mesh: MeshHandle,
    deliveries: UnboundedReceiver<Delivery>,
    events: UnboundedReceiver<ModuleEvent>,
}

fn test_config(id: u8, center: CenterRole) -> MeshConfig {
    MeshConfig {
        node_id: NodeId(id),
        node_addr: NodeAddr {
            node_host: "127.0.0.1".to_string(),
            node_port: 0,
            ..NodeAddr::default()
        },
        center,
        heartbeat_secs: 30,
        tick_interval: Duration::from_secs(3600),
        max_nodes: 16,
        connect_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
        ..MeshConfig::default()
    }
}

async fn start_node(id: u8, center: CenterRole) -> Result<TestNode, MeshError> {
    start_node_with(test_config(id, center)).await
}

async fn start_node_with(config: MeshConfig) -> Result<TestNode, MeshError> {
    let (modules, events) = LocalModules::new();
    let (dispatcher, deliveries) = ChannelDispatcher::new();
    let mesh = NodeMesh::start(config, Arc::new(modules), Arc::new(dispatcher)).await?;
    Ok(TestNode {
        mesh,
        deliveries,
        events,
    })
}

fn remote(center: &TestNode) -> CenterRole {
    CenterRole::Remote(center.mesh.local_addr().to_string())
}

async fn state_of(mesh: &MeshHandle, id: u8) -> PeerState {
    mesh.peer(NodeId(id))
        .await
        .unwrap()
        .map(|entry| entry.state)
        .unwrap_or_default()
}

async fn wait_for_state(mesh: &MeshHandle, id: u8, expected: PeerState) {
    let reached = timeout(WAIT, async {
        while state_of(mesh, id).await != expected {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(
        reached.is_ok(),
        "node {} never saw node {} as {:?}",
        mesh.node_id(),
        id,
        expected
    );
}

async fn wait_for_started(events: &mut UnboundedReceiver<ModuleEvent>, name: &str) -> Handle {
    let found = timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(ModuleEvent::Started { name: n, handle, .. }) if n == name => return handle,
                Some(_) => continue,
                None => panic!("module event channel closed"),
            }
        }
    })
    .await;
    found.unwrap_or_else(|_| panic!("module {name} never started"))
}

/// Renders a module event as a short line, e.g. `Started game 0305`.
fn describe(event: &ModuleEvent) -> String {
    match event {
        ModuleEvent::Started { name, handle, .. } => format!("Started {name} {handle}"),
        ModuleEvent::BatchBegin { name } => format!("BatchBegin {name}"),
        ModuleEvent::BatchEnd { name } => format!("BatchEnd {name}"),
        ModuleEvent::Exited { handle } => format!("Exited {handle}"),
    }
}

/// Collects the next `count` module events.
async fn next_events(events: &mut UnboundedReceiver<ModuleEvent>, count: usize) -> Vec<String> {
    let mut seen = Vec::new();
    let collected = timeout(WAIT, async {
        while seen.len() < count {
            match events.recv().await {
                Some(event) => seen.push(describe(&event)),
                None => panic!("module event channel closed"),
            }
        }
    })
    .await;
    assert!(collected.is_ok(), "only got {seen:?}");
    seen
}

/// Waits until `mesh` knows node `id` listens on `port`.
async fn wait_for_port(mesh: &MeshHandle, id: u8, port: u16) -> NodeEntry {
    let learned = timeout(WAIT, async {
        loop {
            if let Some(entry) = mesh.peer(NodeId(id)).await.unwrap() {
                if entry.addr.node_port == port {
                    return entry;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    learned.unwrap_or_else(|_| {
        panic!(
            "node {} never learned the address of node {id}",
            mesh.node_id()
        )
    })
}

/// Starts center 1 and clients 2 and 3, then links 2 and 3 through a pair of
/// mutual subscriptions.
async fn converged_cluster() -> (TestNode, TestNode, TestNode) {
    let a = start_node(1, CenterRole::Host).await.unwrap();
    let mut b = start_node(2, remote(&a)).await.unwrap();
    let mut c = start_node(3, remote(&a)).await.unwrap();
    wait_for_state(&a.mesh, 2, PeerState::Established).await;
    wait_for_state(&a.mesh, 3, PeerState::Established).await;

    c.mesh.publish("game", Handle(0x0005)).await.unwrap();
    b.mesh.publish("chat", Handle(0x0006)).await.unwrap();
    b.mesh.subscribe("game").await.unwrap();
    c.mesh.subscribe("chat").await.unwrap();

    assert_eq!(wait_for_started(&mut b.events, "game").await, Handle(0x0305));
    assert_eq!(wait_for_started(&mut c.events, "chat").await, Handle(0x0206));
    wait_for_state(&b.mesh, 3, PeerState::Established).await;
    wait_for_state(&c.mesh, 2, PeerState::Established).await;
    (a, b, c)
}

#[tokio::test]
async fn test_client_registers_with_center() {
    let a = start_node(1, CenterRole::Host).await.unwrap();
    assert!(a.mesh.is_center());
    let b = start_node(2, remote(&a)).await.unwrap();
    assert!(!b.mesh.is_center());

    let center = b.mesh.peer(NodeId(1)).await.unwrap().unwrap();
    assert_eq!(center.state, PeerState::Established);
    assert_eq!(center.handle, Some(Handle::new(NodeId(1), MESH_MODULE_ID)));

    wait_for_state(&a.mesh, 2, PeerState::Established).await;
    let seen = a.mesh.peer(NodeId(2)).await.unwrap().unwrap();
    assert_eq!(seen.addr.node_port, b.mesh.local_addr().port());
    assert_eq!(seen.handle, Some(Handle(0x0201)));
}

#[tokio::test]
async fn test_broadcast_shares_addresses_without_linking() {
    let a = start_node(1, CenterRole::Host).await.unwrap();
    let b = start_node(2, remote(&a)).await.unwrap();
    wait_for_state(&a.mesh, 2, PeerState::Established).await;
    let c = start_node(3, remote(&a)).await.unwrap();
    wait_for_state(&a.mesh, 3, PeerState::Established).await;

    let learned = wait_for_port(&b.mesh, 3, c.mesh.local_addr().port()).await;
    assert_eq!(learned.handle, Some(Handle(0x0301)));
    assert_eq!(learned.state, PeerState::Empty);

    let back = wait_for_port(&c.mesh, 2, b.mesh.local_addr().port()).await;
    assert_eq!(back.handle, Some(Handle(0x0201)));
    assert_eq!(back.state, PeerState::Empty);
}

#[tokio::test]
async fn test_mesh_convergence_and_delivery() {
    let (_a, b, mut c) = converged_cluster().await;

    b.mesh
        .send(
            Handle(0x0005),
            Handle::new(NodeId(3), 7),
            MessageType(9),
            &b"hello"[..],
        )
        .await
        .unwrap();

    let delivery = timeout(WAIT, c.deliveries.recv())
        .await
        .expect("no delivery")
        .unwrap();
    assert_eq!(delivery.source, Handle(0x0205));
    assert_eq!(delivery.dest, 7);
    assert_eq!(delivery.msg_type, MessageType(9));
    assert_eq!(&delivery.payload[..], b"hello");
}

#[tokio::test]
async fn test_local_send_skips_the_wire() {
    let a = start_node(1, CenterRole::Host).await.unwrap();
    let mut b = start_node(2, remote(&a)).await.unwrap();

    b.mesh
        .send(
            Handle(0x0004),
            Handle::new(NodeId(2), 8),
            MessageType(3),
            &b"self"[..],
        )
        .await
        .unwrap();
    let delivery = b.deliveries.try_recv().expect("local delivery is synchronous");
    assert_eq!(delivery.source, Handle(0x0204));
    assert_eq!(delivery.dest, 8);
}

#[tokio::test]
async fn test_send_to_unlinked_node_fails() {
    let a = start_node(1, CenterRole::Host).await.unwrap();
    let b = start_node(2, remote(&a)).await.unwrap();

    let result = b
        .mesh
        .send(Handle(0x0004), Handle(0x0901), MessageType(3), &b"x"[..])
        .await;
    assert!(matches!(result, Err(MeshError::NotConnected(NodeId(9)))));

    let result = b
        .mesh
        .send(Handle(0x0004), Handle(0x4001), MessageType(3), &b"x"[..])
        .await;
    assert!(matches!(result, Err(MeshError::InvalidNode(NodeId(0x40)))));
}

#[tokio::test]
async fn test_duplicate_reg_is_ignored() {
    let a = start_node(1, CenterRole::Host).await.unwrap();
    let b = start_node(2, remote(&a)).await.unwrap();
    let before = b.mesh.peer(NodeId(1)).await.unwrap().unwrap();

    // Announce node 1 again at a bogus address, straight to our own mesh
    // endpoint.
    b.mesh
        .send(
            Handle::new(NodeId(2), MESH_MODULE_ID),
            Handle::new(NodeId(2), MESH_MODULE_ID),
            MessageType::TEXT,
            &b"REG 1 10.9.9.9 9 0 0 0 0101"[..],
        )
        .await
        .unwrap();

    let after = b.mesh.peer(NodeId(1)).await.unwrap().unwrap();
    assert_eq!(after.state, PeerState::Established);
    assert_eq!(after.link, before.link);
    assert_eq!(after.addr, before.addr);
}

#[tokio::test]
async fn test_malformed_frame_closes_only_that_connection() {
    let a = start_node(1, CenterRole::Host).await.unwrap();
    let b = start_node(2, remote(&a)).await.unwrap();

    let mut raw = TcpStream::connect(b.mesh.local_addr()).await.unwrap();
    // Declared length 1 cannot hold the routing header.
    raw.write_all(&[1, 0, 0, 0, 0, 0]).await.unwrap();

    let mut byte = [0u8; 1];
    let read = timeout(WAIT, raw.read(&mut byte))
        .await
        .expect("connection was not closed");
    assert!(matches!(read, Ok(0) | Err(_)));

    assert_eq!(state_of(&b.mesh, 1).await, PeerState::Established);
    let mut c = start_node(3, remote(&a)).await.unwrap();
    c.mesh.publish("echo", Handle(0x000a)).await.unwrap();
    b.mesh.subscribe("echo").await.unwrap();
    wait_for_state(&b.mesh, 3, PeerState::Established).await;
    b.mesh
        .send(Handle(0x0001), Handle(0x030a), MessageType(5), &b"ok"[..])
        .await
        .unwrap();
    assert!(timeout(WAIT, c.deliveries.recv()).await.unwrap().is_some());
}

#[tokio::test]
async fn test_startup_fails_without_center() {
    let unused = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap();
    let result = start_node(2, CenterRole::Remote(unused.to_string())).await;
    assert!(matches!(result, Err(MeshError::Center(_))));
}

#[tokio::test]
async fn test_startup_rejects_invalid_node_id() {
    let result = start_node(0, CenterRole::Host).await;
    assert!(matches!(result, Err(MeshError::Config(_))));
    let result = start_node(16, CenterRole::Host).await;
    assert!(matches!(result, Err(MeshError::Config(_))));
}

#[tokio::test]
async fn test_center_forgets_lost_node() {
    let a = start_node(1, CenterRole::Host).await.unwrap();
    let b = start_node(2, remote(&a)).await.unwrap();
    b.mesh.publish("world", Handle(0x0004)).await.unwrap();

    let published = timeout(WAIT, async {
        loop {
            let snapshot = a.mesh.directory().await.unwrap().unwrap();
            if snapshot.publishers.contains_key("world") {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(published.is_ok(), "publication never reached the center");

    b.mesh.shutdown().await.unwrap();
    assert!(matches!(b.mesh.peers().await, Err(MeshError::Closed)));
    wait_for_state(&a.mesh, 2, PeerState::Empty).await;
    let snapshot = a.mesh.directory().await.unwrap().unwrap();
    assert!(snapshot.publishers.is_empty());
}

#[tokio::test]
async fn test_client_loses_center_and_bound_modules() {
    let a = start_node(1, CenterRole::Host).await.unwrap();
    let mut b = start_node(2, remote(&a)).await.unwrap();
    a.mesh.publish("login", Handle(0x0009)).await.unwrap();
    b.mesh.subscribe("login").await.unwrap();
    assert_eq!(wait_for_started(&mut b.events, "login").await, Handle(0x0109));

    a.mesh.shutdown().await.unwrap();
    wait_for_state(&b.mesh, 1, PeerState::Empty).await;
    let exited = timeout(WAIT, async {
        loop {
            if let Some(ModuleEvent::Exited { handle }) = b.events.recv().await {
                return handle;
            }
        }
    })
    .await
    .expect("bound module never exited");
    assert_eq!(exited, Handle(0x0109));

    // The center is gone, so the reconnect pass fails and leaves the slot empty.
    b.mesh.tick().await.unwrap();
    wait_for_state(&b.mesh, 1, PeerState::Empty).await;
}

/// Center entry frame announcing node 9 as the center.
fn center_entry_frame() -> Bytes {
    let entry = CenterEntry {
        center: Handle::new(NodeId(9), CENTER_MODULE_ID),
        mesh: Handle::new(NodeId(9), MESH_MODULE_ID),
    };
    FrameCodec::default()
        .encode(
            Handle::new(NodeId(9), 0),
            0,
            MessageType::TEXT,
            entry.encode().as_bytes(),
        )
        .unwrap()
}

/// Minimal center: answers every connection with an entry for node 9 and
/// hands the socket to the test.
async fn fake_center() -> (SocketAddr, UnboundedReceiver<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (streams_tx, streams) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let frame = center_entry_frame();
        while let Ok((mut stream, _)) = listener.accept().await {
            stream.write_all(&frame).await.unwrap();
            if streams_tx.send(stream).is_err() {
                break;
            }
        }
    });
    (addr, streams)
}

/// Writes a control line from the fake center to the node's mesh module.
async fn push_control(stream: &mut TcpStream, text: &str) {
    let frame = FrameCodec::default()
        .encode(
            Handle::new(NodeId(9), MESH_MODULE_ID),
            MESH_MODULE_ID,
            MessageType::TEXT,
            text.as_bytes(),
        )
        .unwrap();
    stream.write_all(&frame).await.unwrap();
}

/// Reads the next text frame, heartbeats included.
async fn next_text(stream: &mut TcpStream, buf: &mut BytesMut) -> String {
    let codec = FrameCodec::default();
    loop {
        match codec.decode(buf).unwrap() {
            Decoded::Frame { frame, consumed } => {
                buf.advance(consumed);
                assert_eq!(frame.msg_type, MessageType::TEXT);
                return String::from_utf8(frame.payload.to_vec()).unwrap();
            }
            Decoded::Incomplete => {
                let n = stream.read_buf(buf).await.unwrap();
                assert!(n > 0, "node closed the center connection");
            }
        }
    }
}

/// Reads control lines from `stream` until `count` non-heartbeat lines arrived.
async fn read_control(stream: &mut TcpStream, buf: &mut BytesMut, count: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let collected = timeout(WAIT, async {
        while lines.len() < count {
            let text = next_text(stream, buf).await;
            if text != "HB" {
                lines.push(text);
            }
        }
    })
    .await;
    assert!(collected.is_ok(), "only got {lines:?}");
    lines
}

/// Asserts that nothing but heartbeats arrives for a short while.
async fn assert_quiet(stream: &mut TcpStream, buf: &mut BytesMut) {
    let extra = timeout(Duration::from_millis(300), read_control(stream, buf, 1)).await;
    assert!(extra.is_err(), "unexpected control traffic: {extra:?}");
}

#[tokio::test]
async fn test_subscriptions_replayed_once_per_reconnect() {
    let (center_addr, mut streams) = fake_center().await;
    let b = start_node(2, CenterRole::Remote(center_addr.to_string()))
        .await
        .unwrap();
    let port = b.mesh.local_addr().port();
    let reg = format!("REG 2 127.0.0.1 {port} 0 0 0 0201");

    let mut conn = streams.recv().await.unwrap();
    let mut buf = BytesMut::new();
    assert_eq!(read_control(&mut conn, &mut buf, 1).await, vec![reg.clone()]);

    b.mesh.subscribe("hall").await.unwrap();
    b.mesh.subscribe("db").await.unwrap();
    b.mesh.subscribe("hall").await.unwrap();
    let published = b.mesh.publish("world", Handle(0x0004)).await.unwrap();
    assert_eq!(published, Handle(0x0204));
    assert_eq!(
        b.mesh.publish("world", Handle(0x0007)).await.unwrap(),
        Handle(0x0204)
    );
    assert_eq!(
        read_control(&mut conn, &mut buf, 3).await,
        vec!["SUB hall", "SUB db", "PUB world:0204"]
    );
    assert_quiet(&mut conn, &mut buf).await;

    for _cycle in 0..3 {
        drop(conn);
        wait_for_state(&b.mesh, 9, PeerState::Empty).await;

        b.mesh.tick().await.unwrap();
        wait_for_state(&b.mesh, 9, PeerState::Established).await;

        conn = streams.recv().await.unwrap();
        buf.clear();
        assert_eq!(
            read_control(&mut conn, &mut buf, 4).await,
            vec![reg.as_str(), "SUB hall", "SUB db", "PUB world:0204"]
        );
        assert_quiet(&mut conn, &mut buf).await;
    }
}

#[tokio::test]
async fn test_heartbeat_sent_only_after_idle_interval() {
    let (center_addr, mut streams) = fake_center().await;
    let b = start_node(2, CenterRole::Remote(center_addr.to_string()))
        .await
        .unwrap();
    let mut conn = streams.recv().await.unwrap();
    let mut buf = BytesMut::new();
    read_control(&mut conn, &mut buf, 1).await;

    // The REG just went out, so the center link is not idle yet.
    b.mesh.tick().await.unwrap();
    let early = timeout(Duration::from_millis(200), conn.read_buf(&mut buf)).await;
    assert!(early.is_err(), "heartbeat sent before the interval elapsed");
}

#[tokio::test]
async fn test_heartbeat_sent_once_interval_elapsed() {
    let (center_addr, mut streams) = fake_center().await;
    let config = MeshConfig {
        heartbeat_secs: 3,
        ..test_config(2, CenterRole::Remote(center_addr.to_string()))
    };
    let b = start_node_with(config).await.unwrap();
    let mut conn = streams.recv().await.unwrap();
    let mut buf = BytesMut::new();
    read_control(&mut conn, &mut buf, 1).await;

    sleep(Duration::from_millis(3100)).await;
    b.mesh.tick().await.unwrap();
    b.mesh.tick().await.unwrap();
    let first = timeout(WAIT, next_text(&mut conn, &mut buf)).await.unwrap();
    assert_eq!(first, "HB");
    let second = timeout(Duration::from_millis(300), next_text(&mut conn, &mut buf)).await;
    assert!(second.is_err(), "second heartbeat within one interval: {second:?}");
}

#[tokio::test]
async fn test_handles_reply_is_reported_as_one_batch() {
    let (center_addr, mut streams) = fake_center().await;
    let mut b = start_node(2, CenterRole::Remote(center_addr.to_string()))
        .await
        .unwrap();
    let mut conn = streams.recv().await.unwrap();
    let mut buf = BytesMut::new();
    read_control(&mut conn, &mut buf, 1).await;

    let peer = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = peer.local_addr().unwrap().port();
    push_control(&mut conn, &format!("ADDR 3 127.0.0.1 {port} 0 0 0 0301")).await;
    push_control(&mut conn, "HANDLES game:0305,0306").await;
    assert_eq!(
        next_events(&mut b.events, 4).await,
        vec![
            "BatchBegin game",
            "Started game 0305",
            "Started game 0306",
            "BatchEnd game"
        ]
    );

    push_control(&mut conn, "HANDLES empty").await;
    assert_eq!(
        next_events(&mut b.events, 2).await,
        vec!["BatchBegin empty", "BatchEnd empty"]
    );
}

#[tokio::test]
async fn test_client_reports_lost_peer_to_center() {
    let (center_addr, mut streams) = fake_center().await;
    let mut b = start_node(2, CenterRole::Remote(center_addr.to_string()))
        .await
        .unwrap();
    let mut conn = streams.recv().await.unwrap();
    let mut buf = BytesMut::new();
    read_control(&mut conn, &mut buf, 1).await;

    let peer = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = peer.local_addr().unwrap().port();
    push_control(&mut conn, &format!("ADDR 3 127.0.0.1 {port} 0 0 0 0301")).await;
    push_control(&mut conn, "HANDLE x:0305").await;
    assert_eq!(next_events(&mut b.events, 1).await, vec!["Started x 0305"]);

    let (accepted, _) = timeout(WAIT, peer.accept()).await.unwrap().unwrap();
    drop(accepted);

    assert_eq!(next_events(&mut b.events, 1).await, vec!["Exited 0305"]);
    assert_eq!(read_control(&mut conn, &mut buf, 1).await, vec!["UNREG 3"]);
    wait_for_state(&b.mesh, 3, PeerState::Empty).await;
}

#[tokio::test]
async fn test_center_keeps_entries_of_linked_nodes_on_unreg() {
    let a = start_node(1, CenterRole::Host).await.unwrap();
    let b = start_node(2, remote(&a)).await.unwrap();
    let c = start_node(3, remote(&a)).await.unwrap();
    wait_for_state(&a.mesh, 3, PeerState::Established).await;
    c.mesh.publish("game", Handle(0x0005)).await.unwrap();

    let directory = Handle::new(NodeId(1), CENTER_MODULE_ID);
    let tell_center = |line: &'static str| {
        b.mesh.send(
            Handle::new(NodeId(2), MESH_MODULE_ID),
            directory,
            MessageType::TEXT,
            line.as_bytes(),
        )
    };
    tell_center("PUB ghost:0705").await.unwrap();
    let published = timeout(WAIT, async {
        loop {
            let snapshot = a.mesh.directory().await.unwrap().unwrap();
            let names = &snapshot.publishers;
            if names.contains_key("ghost") && names.contains_key("game") {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(published.is_ok(), "publications never reached the center");

    // Node 3 is still linked to the center; node 7 never was.
    tell_center("UNREG 3").await.unwrap();
    tell_center("UNREG 7").await.unwrap();
    let dropped = timeout(WAIT, async {
        loop {
            let snapshot = a.mesh.directory().await.unwrap().unwrap();
            if !snapshot.publishers.contains_key("ghost") {
                return snapshot;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("entries of node 7 were never dropped");
    assert_eq!(dropped.publishers.get("game"), Some(&vec![Handle(0x0305)]));
    assert_eq!(state_of(&a.mesh, 3).await, PeerState::Established);
}

#[tokio::test]
async fn test_center_reconnect_runs_one_handshake_at_a_time() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let center_addr = listener.local_addr().unwrap();
    let (started, accepted) = tokio::join!(
        start_node(2, CenterRole::Remote(center_addr.to_string())),
        async {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(&center_entry_frame()).await.unwrap();
            stream
        }
    );
    let b = started.unwrap();
    let mut conn = accepted;
    let mut buf = BytesMut::new();
    read_control(&mut conn, &mut buf, 1).await;

    drop(conn);
    wait_for_state(&b.mesh, 9, PeerState::Empty).await;

    // This listener never answers a second time, so the handshake hangs.
    b.mesh.tick().await.unwrap();
    assert_eq!(state_of(&b.mesh, 9).await, PeerState::Handshaking);
    let (_silent, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();

    b.mesh.tick().await.unwrap();
    let again = timeout(Duration::from_millis(300), listener.accept()).await;
    assert!(again.is_err(), "second handshake started while one was running");
    assert_eq!(state_of(&b.mesh, 9).await, PeerState::Handshaking);

    // The handshake timeout gives the slot back.
    wait_for_state(&b.mesh, 9, PeerState::Empty).await;
}

#[tokio::test]
async fn test_invalid_module_names_are_rejected() {
    let a = start_node(1, CenterRole::Host).await.unwrap();
    for name in ["", "two words", "a:b", "a,b"] {
        let result = a.mesh.subscribe(name).await;
        assert!(
            matches!(result, Err(MeshError::InvalidName(ref n)) if n == name),
            "subscribe {name:?}: {result:?}"
        );
        let result = a.mesh.publish(name, Handle(0x0005)).await;
        assert!(
            matches!(result, Err(MeshError::InvalidName(_))),
            "publish {name:?}: {result:?}"
        );
    }
    assert!(a.mesh.subscribe("hall").await.is_ok());
    let snapshot = a.mesh.directory().await.unwrap().unwrap();
    assert!(snapshot.publishers.is_empty());
    assert_eq!(snapshot.subscribers.len(), 1);
}

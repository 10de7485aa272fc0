//! Gate relay behavior: identity stamping, redirects, filters, and stale
//! client reconciliation, against a scripted dispatcher.

use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;

use world_gate::bind_ephemeral;
use world_shared::ids::{ClientId, EntityId};
use world_shared::packet::PacketPool;
use world_shared::proto::{self, Conn};
use world_tests::{init_tracing, FakeDispatcher, TEST_TIMEOUT};

struct Harness {
    fake: FakeDispatcher,
    dispatcher_conn: Conn,
    client_conn: Conn,
    client_id: ClientId,
    client_pool: PacketPool,
}

/// Boots a gate, connects one client and drains the connect notification.
async fn harness() -> anyhow::Result<Harness> {
    init_tracing();
    let fake = FakeDispatcher::bind().await?;
    let (gate, gate_addr) = bind_ephemeral(&fake.addr()).await?;
    tokio::spawn(gate.run());

    let mut dispatcher_conn = timeout(TEST_TIMEOUT, fake.accept()).await??;
    let client_conn = Conn::new(TcpStream::connect(gate_addr).await?);

    let (msg_type, mut pkt) =
        timeout(TEST_TIMEOUT, dispatcher_conn.recv_packet(fake.pool())).await??;
    anyhow::ensure!(msg_type == proto::MT_NOTIFY_CLIENT_CONNECTED);
    let client_id = pkt.read_client_id()?;

    Ok(Harness {
        fake,
        dispatcher_conn,
        client_conn,
        client_id,
        client_pool: PacketPool::new(),
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_calls_are_stamped_with_identity() -> anyhow::Result<()> {
    let mut h = harness().await?;
    let entity = EntityId::new_unique();

    let mut pkt = h.client_pool.get();
    pkt.append_entity_id(entity);
    pkt.append_str("LevelUp");
    pkt.append_data(&json!([]))?;
    h.client_conn
        .send_packet(proto::MT_CALL_ENTITY_METHOD, pkt)
        .await?;

    let (msg_type, mut got) =
        timeout(TEST_TIMEOUT, h.dispatcher_conn.recv_packet(h.fake.pool())).await??;
    assert_eq!(msg_type, proto::MT_CALL_ENTITY_METHOD_FROM_CLIENT);
    assert_eq!(got.read_client_id()?, h.client_id, "gate stamps, client cannot");
    assert_eq!(got.read_entity_id()?, entity);
    assert_eq!(got.read_str()?, "LevelUp");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn redirects_reach_the_addressed_client_unprefixed() -> anyhow::Result<()> {
    let mut h = harness().await?;
    let entity = EntityId::new_unique();

    let mut pkt = h.fake.pool().get();
    pkt.append_client_id(h.client_id);
    pkt.append_entity_id(entity);
    pkt.append_str("OnLevelUp");
    pkt.append_data(&json!([2]))?;
    h.dispatcher_conn
        .send_packet(proto::MT_CALL_CLIENT_METHOD, pkt)
        .await?;

    let (msg_type, mut got) =
        timeout(TEST_TIMEOUT, h.client_conn.recv_packet(&h.client_pool)).await??;
    assert_eq!(msg_type, proto::MT_CALL_CLIENT_METHOD);
    // The routing prefix is the gate's business; the client never sees it.
    assert_eq!(got.read_entity_id()?, entity);
    assert_eq!(got.read_str()?, "OnLevelUp");
    let args: Value = got.read_data()?;
    assert_eq!(args, json!([2]));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn redirect_to_stale_client_reports_it_gone() -> anyhow::Result<()> {
    let mut h = harness().await?;
    let stale = ClientId::new_unique();

    let mut pkt = h.fake.pool().get();
    pkt.append_client_id(stale);
    pkt.append_entity_id(EntityId::new_unique());
    h.dispatcher_conn
        .send_packet(proto::MT_DESTROY_ENTITY_ON_CLIENT, pkt)
        .await?;

    let (msg_type, mut got) =
        timeout(TEST_TIMEOUT, h.dispatcher_conn.recv_packet(h.fake.pool())).await??;
    assert_eq!(msg_type, proto::MT_NOTIFY_CLIENT_DISCONNECTED);
    assert_eq!(got.read_client_id()?, stale);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn filtered_call_reaches_matching_clients_only() -> anyhow::Result<()> {
    let mut h = harness().await?;

    // Tag the client, then address everyone in its area.
    let mut pkt = h.fake.pool().get();
    pkt.append_client_id(h.client_id);
    pkt.append_str("area");
    pkt.append_str("forest");
    h.dispatcher_conn
        .send_packet(proto::MT_GATE_SET_CLIENT_FILTER_PROP, pkt)
        .await?;

    let entity = EntityId::new_unique();
    let send_filtered = |val: &str, method: &str| {
        let mut pkt = h.fake.pool().get();
        pkt.append_str("area");
        pkt.append_str("=");
        pkt.append_str(val);
        pkt.append_entity_id(entity);
        pkt.append_str(method);
        pkt.append_data(&json!([])).unwrap();
        pkt
    };

    // Non-matching value first: must not arrive.
    let miss = send_filtered("desert", "OnSandstorm");
    h.dispatcher_conn
        .send_packet(proto::MT_GATE_CALL_FILTERED_CLIENTS, miss)
        .await?;
    let hit = send_filtered("forest", "OnRain");
    h.dispatcher_conn
        .send_packet(proto::MT_GATE_CALL_FILTERED_CLIENTS, hit)
        .await?;

    let (msg_type, mut got) =
        timeout(TEST_TIMEOUT, h.client_conn.recv_packet(&h.client_pool)).await??;
    assert_eq!(msg_type, proto::MT_CALL_CLIENT_METHOD);
    assert_eq!(got.read_entity_id()?, entity);
    assert_eq!(got.read_str()?, "OnRain", "desert call must have been skipped");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_disconnect_is_reported_upstream() -> anyhow::Result<()> {
    let mut h = harness().await?;

    drop(h.client_conn);
    let (msg_type, mut got) =
        timeout(TEST_TIMEOUT, h.dispatcher_conn.recv_packet(h.fake.pool())).await??;
    assert_eq!(msg_type, proto::MT_NOTIFY_CLIENT_DISCONNECTED);
    assert_eq!(got.read_client_id()?, h.client_id);
    Ok(())
}

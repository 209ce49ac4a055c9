use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use mini_aerospike::{
    execute, proto, Cluster, ClusterPolicy, Command, EventLoops, Listener, Node, Status, Value,
};

/// 요청 프레임 하나를 읽는다. 커넥션이 닫히면 'false'.
async fn read_request(socket: &mut TcpStream) -> bool {
    let mut header = [0u8; 8];
    if socket.read_exact(&mut header).await.is_err() {
        return false;
    }

    let mut len = 0usize;
    for &b in &header[2..8] {
        len = (len << 8) | b as usize;
    }

    let mut body = vec![0u8; len];
    socket.read_exact(&mut body).await.is_ok()
}

/// 요청마다 'reply'를 돌려주는 서버. 'None'이면 응답하지 않는다.
async fn start_server(reply: Option<Bytes>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };

            let reply = reply.clone();
            tokio::spawn(async move {
                while read_request(&mut socket).await {
                    if let Some(frame) = &reply {
                        if socket.write_all(frame).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });
    addr
}

fn cluster_for(addr: SocketAddr, loops: &EventLoops) -> (Arc<Cluster>, Arc<Node>) {
    let cluster = Cluster::new(loops.clone(), ClusterPolicy::default());
    let node = cluster.add_node("A", addr);
    cluster.set_partition(0, Some(node.clone()), None);
    (cluster, node)
}

#[tokio::test]
async fn write_ack_round_trip_returns_connection_to_pool() {
    let addr = start_server(Some(proto::pack_ack(0))).await;
    let loops = EventLoops::create(1).unwrap();
    let (cluster, node) = cluster_for(addr, &loops);

    let (tx, rx) = oneshot::channel();
    let mut cmd = Command::new(
        cluster,
        loops.get(0).unwrap(),
        proto::pack_request(b"put"),
        Listener::WriteAck(Box::new(move |err, event_loop| {
            tx.send((err, event_loop.is_loop_thread())).unwrap();
        })),
    );
    cmd.set_partition(0);

    execute(cmd).unwrap();

    let (err, on_loop) = rx.await.unwrap();
    assert!(err.is_none());
    // 리스너는 커맨드가 바인딩된 루프 스레드에서 불린다.
    assert!(on_loop);

    // 커넥션은 풀로 돌아가 있다.
    assert_eq!(node.idle_connections(), 1);
    assert_eq!(node.open_connections(), 1);

    loops.close();
}

#[tokio::test]
async fn record_read_parses_bins() {
    let reply = proto::pack_response(
        0,
        7,
        300,
        &[b"namespace"],
        &[
            ("name", Value::Str("door".to_string())),
            ("count", Value::Int(9)),
        ],
    );
    let addr = start_server(Some(reply)).await;
    let loops = EventLoops::create(1).unwrap();
    let (cluster, _node) = cluster_for(addr, &loops);

    let (tx, rx) = oneshot::channel();
    let mut cmd = Command::new(
        cluster,
        loops.get(0).unwrap(),
        proto::pack_request(b"get"),
        Listener::Record(Box::new(move |result, _| {
            tx.send(result).unwrap();
        })),
    );
    cmd.set_partition(0);
    cmd.set_read(true);

    execute(cmd).unwrap();

    let record = rx.await.unwrap().unwrap();
    assert_eq!(record.generation, 7);
    assert_eq!(record.ttl, 300);
    assert_eq!(record.bins["name"], Value::Str("door".to_string()));
    assert_eq!(record.bins["count"], Value::Int(9));

    loops.close();
}

#[tokio::test]
async fn value_read_unwraps_success_bin() {
    let reply = proto::pack_response(0, 0, 0, &[], &[("SUCCESS", Value::Int(42))]);
    let addr = start_server(Some(reply)).await;
    let loops = EventLoops::create(1).unwrap();
    let (cluster, _node) = cluster_for(addr, &loops);

    let (tx, rx) = oneshot::channel();
    let mut cmd = Command::new(
        cluster,
        loops.get(0).unwrap(),
        proto::pack_request(b"apply"),
        Listener::Value(Box::new(move |result, _| {
            tx.send(result).unwrap();
        })),
    );
    cmd.set_partition(0);

    execute(cmd).unwrap();
    assert_eq!(rx.await.unwrap().unwrap(), Value::Int(42));

    loops.close();
}

#[tokio::test]
async fn udf_failure_carries_server_message() {
    let reply = proto::pack_response(
        100,
        0,
        0,
        &[],
        &[("FAILURE", Value::Str("division by zero".to_string()))],
    );
    let addr = start_server(Some(reply)).await;
    let loops = EventLoops::create(1).unwrap();
    let (cluster, _node) = cluster_for(addr, &loops);

    let (tx, rx) = oneshot::channel();
    let mut cmd = Command::new(
        cluster,
        loops.get(0).unwrap(),
        proto::pack_request(b"apply"),
        Listener::Value(Box::new(move |result, _| {
            tx.send(result).unwrap();
        })),
    );
    cmd.set_partition(0);

    execute(cmd).unwrap();

    let err = rx.await.unwrap().unwrap_err();
    assert_eq!(err.status(), Status::Udf);
    assert_eq!(err.message(), "division by zero");

    loops.close();
}

#[tokio::test]
async fn socket_timeout_retries_then_times_out() {
    // 응답하지 않는 서버. 소켓 타이머가 30ms마다 발화하고, 세 번째 시도가
    // 한도를 넘는 순간 타임아웃이 확정된다.
    let addr = start_server(None).await;
    let loops = EventLoops::create(1).unwrap();
    let (cluster, node) = cluster_for(addr, &loops);

    let (tx, rx) = oneshot::channel();
    let mut cmd = Command::new(
        cluster,
        loops.get(0).unwrap(),
        proto::pack_request(b"get"),
        Listener::WriteAck(Box::new(move |err, _| {
            tx.send(err).unwrap();
        })),
    );
    cmd.set_partition(0);
    cmd.set_read(true);
    cmd.set_timeouts(
        Some(Duration::from_millis(30)),
        Some(Duration::from_millis(100)),
    );
    cmd.set_max_retries(2);

    execute(cmd).unwrap();

    let err = rx.await.unwrap().expect("command must time out");
    assert_eq!(err.status(), Status::Timeout);
    assert!(
        err.message().contains("iterations=3"),
        "unexpected message: {}",
        err.message()
    );

    // 타임아웃 경로는 커넥션을 풀에 돌려놓지 않는다.
    assert_eq!(node.idle_connections(), 0);
    assert_eq!(node.open_connections(), 0);

    loops.close();
}

#[tokio::test]
async fn past_deadline_fails_without_io() {
    let loops = EventLoops::create(1).unwrap();
    let cluster = Cluster::new(loops.clone(), ClusterPolicy::default());
    let event_loop = loops.get(0).unwrap();

    // 루프를 잠시 붙잡아서 데드라인이 큐 안에서 지나가게 한다.
    event_loop.post(|| std::thread::sleep(Duration::from_millis(50)));

    let (tx, rx) = oneshot::channel();
    let mut cmd = Command::new(
        cluster,
        event_loop,
        proto::pack_request(b"get"),
        Listener::WriteAck(Box::new(move |err, _| {
            tx.send(err).unwrap();
        })),
    );
    cmd.set_timeouts(None, Some(Duration::from_millis(10)));

    execute(cmd).unwrap();

    let err = rx.await.unwrap().expect("command must time out");
    assert_eq!(err.status(), Status::Timeout);
    assert_eq!(err.message(), "Register timeout");

    loops.close();
}

#[tokio::test]
async fn connection_limit_surfaces_no_more_connections() {
    let addr = start_server(Some(proto::pack_ack(0))).await;
    let loops = EventLoops::create(1).unwrap();

    let policy = ClusterPolicy {
        max_conns_per_loop: 0,
        ..ClusterPolicy::default()
    };
    let cluster = Cluster::new(loops.clone(), policy);
    let node = cluster.add_node("A", addr);
    cluster.set_partition(0, Some(node), None);

    let (tx, rx) = oneshot::channel();
    let mut cmd = Command::new(
        cluster,
        loops.get(0).unwrap(),
        proto::pack_request(b"put"),
        Listener::WriteAck(Box::new(move |err, _| {
            tx.send(err).unwrap();
        })),
    );
    cmd.set_partition(0);
    cmd.set_max_retries(0);

    execute(cmd).unwrap();

    let err = rx.await.unwrap().expect("command must fail");
    assert_eq!(err.status(), Status::NoMoreConnections);

    loops.close();
}

#[tokio::test]
async fn server_error_keeps_reusable_connection() {
    // 일반 서버 에러(1)는 소켓에 잔여 데이터를 남기지 않으므로 커넥션이
    // 풀로 돌아간다.
    let addr = start_server(Some(proto::pack_ack(1))).await;
    let loops = EventLoops::create(1).unwrap();
    let (cluster, node) = cluster_for(addr, &loops);

    let (tx, rx) = oneshot::channel();
    let mut cmd = Command::new(
        cluster,
        loops.get(0).unwrap(),
        proto::pack_request(b"put"),
        Listener::WriteAck(Box::new(move |err, _| {
            tx.send(err).unwrap();
        })),
    );
    cmd.set_partition(0);

    execute(cmd).unwrap();

    let err = rx.await.unwrap().expect("server error expected");
    assert_eq!(err.status(), Status::Server);
    assert_eq!(node.idle_connections(), 1);

    loops.close();
}

#[tokio::test]
async fn not_authenticated_closes_connection() {
    let addr = start_server(Some(proto::pack_ack(80))).await;
    let loops = EventLoops::create(1).unwrap();
    let (cluster, node) = cluster_for(addr, &loops);

    let (tx, rx) = oneshot::channel();
    let mut cmd = Command::new(
        cluster,
        loops.get(0).unwrap(),
        proto::pack_request(b"put"),
        Listener::WriteAck(Box::new(move |err, _| {
            tx.send(err).unwrap();
        })),
    );
    cmd.set_partition(0);

    execute(cmd).unwrap();

    let err = rx.await.unwrap().expect("auth error expected");
    assert_eq!(err.status(), Status::NotAuthenticated);
    assert_eq!(node.idle_connections(), 0);
    assert_eq!(node.open_connections(), 0);

    loops.close();
}

#[tokio::test]
async fn empty_partition_map_is_cluster_error() {
    let loops = EventLoops::create(1).unwrap();
    let cluster = Cluster::new(loops.clone(), ClusterPolicy::default());

    let (tx, rx) = oneshot::channel();
    let mut cmd = Command::new(
        cluster,
        loops.get(0).unwrap(),
        proto::pack_request(b"get"),
        Listener::WriteAck(Box::new(move |err, _| {
            tx.send(err).unwrap();
        })),
    );
    cmd.set_partition(0);

    execute(cmd).unwrap();

    let err = rx.await.unwrap().expect("cluster is empty");
    assert_eq!(err.status(), Status::Cluster);

    loops.close();
}

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use bytes::Bytes;
use tokio::time::{self, Instant};
use tracing::{debug, error};

use crate::cluster::Cluster;
use crate::connection::Connection;
use crate::error::{Error, Status};
use crate::executor::Executor;
use crate::loops::EventLoop;
use crate::node::Node;
use crate::pool::ConnPool;
use crate::proto::{self, Record, Value};
use crate::timer::{Armed, CommandTimer, SocketExpiry};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct CommandFlags: u8 {
        /// 마스터 레플리카를 선호한다. 레플리카 교대 재시도가 이 비트를
        /// 토글한다.
        const MASTER = 0b0000_0001;

        /// 읽기 커맨드. 타임아웃 재시도에서 레플리카를 교대할지 결정한다.
        const READ = 0b0000_0010;
    }
}

/// 커맨드의 생애 주기 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommandState {
    Unregistered,
    Registered,
    Connect,
    Write,
    Read,
    Complete,
}

/**
 * 커맨드 종류별 사용자 리스너.
 *
 * 네 가지 모양의 닫힌 집합이다. 열린 trait 계층 대신 태그된 합 타입을 쓰면
 * "리스너는 정확히 한 번 불린다"는 감사가 종료 경로 하나만 보면 끝난다.
 * 사용자 데이터는 클로저 캡처로 들어온다.
 */
pub enum Listener {
    /// 쓰기 ack. 데이터 없는 성공 혹은 에러.
    WriteAck(Box<dyn FnOnce(Option<Error>, &Arc<EventLoop>) + Send>),

    /// 단일 키 읽기. 레코드 혹은 에러.
    Record(Box<dyn FnOnce(crate::Result<Record>, &Arc<EventLoop>) + Send>),

    /// 키 없는 스칼라 연산. SUCCESS/FAILURE 빈 쌍에서 나온 값 하나.
    Value(Box<dyn FnOnce(crate::Result<Value>, &Arc<EventLoop>) + Send>),

    /// 배치/스캔/쿼리 그룹의 멤버. 완료는 개별 콜백 대신 executor에
    /// 집계된다.
    Group(Arc<Executor>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerKind {
    WriteAck,
    Record,
    Value,
    Group,
}

impl Listener {
    fn kind(&self) -> ListenerKind {
        match self {
            Listener::WriteAck(_) => ListenerKind::WriteAck,
            Listener::Record(_) => ListenerKind::Record,
            Listener::Value(_) => ListenerKind::Value,
            Listener::Group(_) => ListenerKind::Group,
        }
    }
}

/**
 * 실행 중인 요청 하나.
 *
 * 커맨드는 현재 그것을 들고 있는 주체(큐, 상태 머신, 리스너 디스패치)가
 * 단독으로 소유한다. 'execute'에 넘어온 뒤로는 자신의 이벤트 루프 스레드
 * 에서만 변형된다. 해제는 종료 경로의 마지막 단계가 유일하게 책임진다.
 * Rust에서는 소유권 이동이 그 규칙 자체다.
 */
pub struct Command {
    cluster: Arc<Cluster>,
    event_loop: Arc<EventLoop>,

    /// 키가 있는 커맨드의 파티션. 키가 없는 커맨드는 'None'이고, 대상
    /// 노드를 직접 지정한다.
    partition: Option<u32>,

    /// 선택된 노드. 커맨드가 잡고 있는 동안 레퍼런스 하나를 소유한다.
    node: Option<Arc<Node>>,

    flags: CommandFlags,
    state: CommandState,

    /// 직렬화된 요청 버퍼. 이 코어는 내용을 해석하지 않는다.
    buf: Bytes,

    /// 소켓 타임아웃. 'None'은 없음.
    socket_timeout: Option<Duration>,

    /// 전체 타임아웃. 큐 제출 시점에 절대 데드라인으로 변환된다.
    total_timeout: Option<Duration>,
    deadline: Option<Instant>,

    timer: CommandTimer,

    /// 시도 횟수. 첫 시도는 0이고, 재시도마다 증가한다.
    iteration: u32,
    max_retries: u32,

    listener: Listener,
}

impl Command {
    pub fn new(
        cluster: Arc<Cluster>,
        event_loop: Arc<EventLoop>,
        buf: Bytes,
        listener: Listener,
    ) -> Command {
        Command {
            cluster,
            event_loop,
            partition: None,
            node: None,
            flags: CommandFlags::MASTER,
            state: CommandState::Unregistered,
            buf,
            socket_timeout: None,
            total_timeout: None,
            deadline: None,
            timer: CommandTimer::unarmed(),
            iteration: 0,
            max_retries: 2,
            listener,
        }
    }

    /// 파티션을 지정한다. 노드는 파티션 맵과 레플리카 선호로 골라진다.
    pub fn set_partition(&mut self, partition: u32) {
        self.partition = Some(partition);
    }

    /// 키 없는 커맨드의 대상 노드를 직접 지정한다.
    pub fn set_node(&mut self, node: Arc<Node>) {
        self.node = Some(node);
    }

    /// 읽기 커맨드로 표시한다. 타임아웃 재시도가 프롤 레플리카로 넘어가게
    /// 된다.
    pub fn set_read(&mut self, read: bool) {
        self.flags.set(CommandFlags::READ, read);
    }

    /// 소켓/전체 타임아웃. 'None'은 해당 타이머 없음.
    pub fn set_timeouts(&mut self, socket: Option<Duration>, total: Option<Duration>) {
        self.socket_timeout = socket;
        self.total_timeout = total;
    }

    pub fn set_max_retries(&mut self, max_retries: u32) {
        self.max_retries = max_retries;
    }

    fn pool<'a>(&self, node: &'a Arc<Node>) -> &'a ConnPool {
        node.pool(self.event_loop.index())
    }
}

/**
 * 커맨드를 제출한다.
 *
 * 호출 스레드가 커맨드의 이벤트 루프 스레드이고 루프의 최근 에러 수가
 * 임계치 미만이면 그 자리에서 시작한다. 그 외에는 루프의 큐를 태운다. 큐
 * 제출 시 상대 시간으로 주어진 전체 타임아웃은 단조 시계 기준의 절대
 * 데드라인으로 변환된다.
 *
 * # Errors
 *
 * 루프가 셧다운 중이어서 큐에 넣지 못한 경우에만 동기적으로 'Err'을
 * 반환한다. 이 경우 커맨드는 리스너 호출 없이 해제된다. 'Ok'를 받았다면
 * 리스너는 (에러와 함께일지언정) 정확히 한 번 불린다.
 */
pub fn execute(mut cmd: Command) -> crate::Result<()> {
    let event_loop = cmd.event_loop.clone();
    let max_depth = cmd.cluster.policy().max_error_depth;

    if event_loop.is_loop_thread() && event_loop.error_count() < max_depth {
        // 이미 루프 스레드에 있다. 바로 시작한다.
        execute_in_loop(cmd);
        return Ok(());
    }

    if let Some(total) = cmd.total_timeout {
        cmd.deadline = Some(Instant::now() + total);
    }
    cmd.state = CommandState::Registered;

    if !event_loop.post(move || execute_in_loop(cmd)) {
        // 루프 스레드가 아니므로 엄밀히 정확하지는 않다.
        event_loop.bump_errors();
        return Err(Error::new(Status::Client, "Failed to queue command"));
    }
    Ok(())
}

/// 루프 스레드 위에서의 시작. pending 증가, 데드라인 확인, 타이머 무장.
fn execute_in_loop(mut cmd: Command) {
    let event_loop = cmd.event_loop.clone();
    let index = event_loop.index();

    if cmd.cluster.pending_inc(index) == -1 {
        // 이 루프는 이 클러스터에 대해 이미 닫혔다. 종료 경로의 감소가
        // 센티널(-1)을 복원한다.
        event_loop.bump_errors();
        finish_error(cmd, Error::new(Status::Client, "Cluster has been closed"));
        return;
    }

    let now = Instant::now();

    if cmd.state == CommandState::Registered {
        // 큐를 거쳐서 들어왔다. 기다리는 동안 데드라인이 지났을 수 있다.
        if let Some(deadline) = cmd.deadline {
            if now >= deadline {
                event_loop.bump_errors();
                finish_error(cmd, Error::new(Status::Timeout, "Register timeout"));
                return;
            }
        }
    } else if let Some(total) = cmd.total_timeout {
        // 인라인 시작. 여기서 절대 데드라인으로 변환한다.
        cmd.deadline = Some(now + total);
    }

    cmd.timer = CommandTimer::arm(cmd.socket_timeout, cmd.deadline, now);
    cmd.state = CommandState::Connect;

    tokio::task::spawn_local(begin(cmd));
}

/**
 * 한 번의 시도: 노드 선택 → 커넥션 획득 → 쓰기/읽기.
 *
 * 재시도는 이 함수를 다시 큐에 태우는 것으로 표현된다.
 */
async fn begin(mut cmd: Command) {
    if let Some(partition) = cmd.partition {
        // 재시도라면 이전 시도의 노드 레퍼런스를 먼저 놓는다.
        cmd.node = None;

        let use_master = cmd.flags.contains(CommandFlags::MASTER);
        cmd.node = cmd.cluster.get_node(partition, use_master);
    }

    let node = match cmd.node.clone() {
        Some(node) => node,
        None => {
            finish_error(cmd, Error::new(Status::Cluster, "Cluster is empty"));
            return;
        }
    };

    // 풀에서 유효한 커넥션을 찾는다.
    loop {
        let mut conn = match cmd.pool(&node).try_get() {
            Some(conn) => conn,
            None => break,
        };

        if conn.validate() {
            // 유효한 커넥션을 얻었다. 재귀 가드 카운터를 되돌린다.
            cmd.event_loop.reset_errors();
            run_io(cmd, node, conn).await;
            return;
        }

        debug!(node = node.name(), "invalid socket from pool");
        cmd.pool(&node).release(conn);
    }

    // 노드 커넥션 수가 한도 안일 때에만 새로 연다.
    if cmd.pool(&node).inc_open() {
        let addr = node.address();
        match with_timer(&mut cmd.timer, Connection::connect(&addr)).await {
            Timed::Done(Ok(conn)) => {
                run_io(cmd, node, conn).await;
            }
            Timed::Done(Err(err)) => {
                cmd.pool(&node).dec_open();
                debug!(cause = %err, node = node.name(), "async connect failed");
                let failure = Error::new(
                    Status::AsyncConnection,
                    format!("Failed to connect to {}: {}", node.name(), err),
                );
                retry_or_finish(cmd, true, failure);
            }
            Timed::SocketTimeout => {
                cmd.pool(&node).dec_open();
                socket_timeout_retry(cmd, &node);
            }
            Timed::TotalTimeout { iterated } => {
                cmd.pool(&node).dec_open();
                total_timeout_finish(cmd, Some(&node), iterated);
            }
        }
        return;
    }

    cmd.event_loop.bump_errors();

    let failure = Error::new(
        Status::NoMoreConnections,
        format!(
            "Max node/event loop {} async connections would be exceeded: {}",
            node.name(),
            cmd.pool(&node).limit()
        ),
    );
    retry_or_finish(cmd, true, failure);
}

/// 쓰기와 읽기. 타이머는 모든 대기 지점을 감싼다.
async fn run_io(mut cmd: Command, node: Arc<Node>, mut conn: Connection) {
    cmd.state = CommandState::Write;

    let buf = cmd.buf.clone();
    match with_timer(&mut cmd.timer, conn.write_command(&buf)).await {
        Timed::Done(Ok(())) => {}
        Timed::Done(Err(err)) => {
            cmd.pool(&node).release(conn);
            let failure = Error::new(
                Status::AsyncConnection,
                format!("Socket write failed: {}", err),
            );
            retry_or_finish(cmd, true, failure);
            return;
        }
        Timed::SocketTimeout => {
            cmd.pool(&node).release(conn);
            socket_timeout_retry(cmd, &node);
            return;
        }
        Timed::TotalTimeout { iterated } => {
            cmd.pool(&node).release(conn);
            total_timeout_finish(cmd, Some(&node), iterated);
            return;
        }
    }

    cmd.state = CommandState::Read;

    loop {
        // 완전한 응답이 모였는지 먼저 확인한다.
        match conn.take_message() {
            Ok(Some(frame)) => {
                on_response(cmd, node, conn, frame);
                return;
            }
            Ok(None) => {}
            Err(err) => {
                // 프레이밍 오류. 소켓에 무엇이 남아있는지 알 수 없으므로
                // 커넥션을 닫는다. 파싱 실패는 영구 오류다.
                cmd.pool(&node).release(conn);
                finish_error(cmd, err);
                return;
            }
        }

        match with_timer(&mut cmd.timer, conn.read_some()).await {
            Timed::Done(Ok(_)) => {
                // 소켓 타이머 규칙을 위한 이벤트 수신 표시.
                cmd.timer.note_event();
            }
            Timed::Done(Err(err)) => {
                cmd.pool(&node).release(conn);
                let failure = Error::new(
                    Status::AsyncConnection,
                    format!("Socket read failed: {}", err),
                );
                retry_or_finish(cmd, true, failure);
                return;
            }
            Timed::SocketTimeout => {
                cmd.pool(&node).release(conn);
                socket_timeout_retry(cmd, &node);
                return;
            }
            Timed::TotalTimeout { iterated } => {
                cmd.pool(&node).release(conn);
                total_timeout_finish(cmd, Some(&node), iterated);
                return;
            }
        }
    }
}

/// 완전한 응답 프레임 하나를 커맨드 종류에 맞게 해석한다.
fn on_response(mut cmd: Command, node: Arc<Node>, conn: Connection, mut frame: Bytes) {
    let header = match proto::parse_msg_header(&mut frame) {
        Ok(header) => header,
        Err(err) => {
            cmd.pool(&node).release(conn);
            finish_error(cmd, err);
            return;
        }
    };

    let status = Status::from_code(i32::from(header.result_code));

    match cmd.listener.kind() {
        // 헤더 전용 완료. 그룹 멤버도 개별 데이터 없이 ack로 끝난다.
        ListenerKind::WriteAck | ListenerKind::Group => {
            if status == Status::Ok {
                response_complete(&mut cmd, &node, conn);
                finish_success(cmd, CommandResult::Ack);
            } else {
                response_error(cmd, &node, conn, Error::from_code(header.result_code as i32));
            }
        }

        ListenerKind::Record => match status {
            Status::Ok => {
                let parsed = proto::skip_fields(&mut frame, header.n_fields)
                    .and_then(|_| proto::parse_bins(&mut frame, header.n_ops));

                match parsed {
                    Ok(bins) => {
                        let record = Record {
                            generation: header.generation,
                            ttl: header.ttl,
                            bins,
                        };
                        response_complete(&mut cmd, &node, conn);
                        finish_success(cmd, CommandResult::Record(record));
                    }
                    Err(err) => {
                        // 파싱 실패. 커넥션은 재사용할 수 없다.
                        cmd.pool(&node).release(conn);
                        finish_error(cmd, err);
                    }
                }
            }
            Status::Udf => {
                let err = proto::parse_udf_error(&mut frame, &header);
                response_error(cmd, &node, conn, err);
            }
            _ => {
                response_error(cmd, &node, conn, Error::from_code(header.result_code as i32));
            }
        },

        ListenerKind::Value => match status {
            Status::Ok => {
                let parsed = proto::skip_fields(&mut frame, header.n_fields)
                    .and_then(|_| proto::parse_success_failure(&mut frame, header.n_ops));

                match parsed {
                    Ok(value) => {
                        response_complete(&mut cmd, &node, conn);
                        finish_success(cmd, CommandResult::Value(value));
                    }
                    Err(err) => {
                        // FAILURE 빈은 서버가 보낸 에러다. 응답은 끝까지
                        // 읽었으므로 응답 에러 경로로 처리한다.
                        response_error(cmd, &node, conn, err);
                    }
                }
            }
            Status::Udf => {
                let err = proto::parse_udf_error(&mut frame, &header);
                response_error(cmd, &node, conn, err);
            }
            _ => {
                response_error(cmd, &node, conn, Error::from_code(header.result_code as i32));
            }
        },
    }
}

/// 성공 응답의 마무리. 타이머를 멈추고 커넥션을 풀에 돌려놓는다.
fn response_complete(cmd: &mut Command, node: &Arc<Node>, conn: Connection) {
    cmd.timer.disarm();
    put_connection(cmd.pool(node), conn);
}

/**
 * 서버가 에러를 돌려준 경우의 마무리.
 *
 * 소켓에 읽지 않은 데이터가 남을 수 있는 에러에서는 커넥션을 닫고, 그 외에는
 * 풀에 돌려놓는다.
 */
fn response_error(mut cmd: Command, node: &Arc<Node>, conn: Connection, err: Error) {
    cmd.timer.disarm();

    match err.status() {
        Status::QueryAborted
        | Status::ScanAborted
        | Status::AsyncConnection
        | Status::TlsError
        | Status::ClientAbort
        | Status::Client
        | Status::NotAuthenticated => cmd.pool(node).release(conn),
        _ => put_connection(cmd.pool(node), conn),
    }

    finish_error(cmd, err);
}

fn put_connection(pool: &ConnPool, mut conn: Connection) {
    conn.touch();
    if let Err(conn) = pool.put(conn) {
        pool.release(conn);
    }
}

/// 소켓 타임아웃 후의 재시도. 읽기 커맨드만 레플리카를 교대한다.
fn socket_timeout_retry(cmd: Command, node: &Arc<Node>) {
    let alternate = cmd.flags.contains(CommandFlags::READ);
    let failure = Error::new(
        Status::Timeout,
        format!(
            "Timeout: iterations={} lastNode={}",
            cmd.iteration + 1,
            node.name()
        ),
    );
    retry_or_finish(cmd, alternate, failure);
}

/// 전체 데드라인 초과. 재시도 없는 종료다.
fn total_timeout_finish(mut cmd: Command, node: Option<&Arc<Node>>, iterated: bool) {
    if iterated {
        cmd.iteration += 1;
    }

    let last_node = node.map_or("null", |n| n.name());
    let err = Error::new(
        Status::Timeout,
        format!("Timeout: iterations={} lastNode={}", cmd.iteration, last_node),
    );
    finish_error(cmd, err);
}

/**
 * 재시도를 시도한다. 거부되면 'failure'로 종료한다.
 *
 * 시도 횟수가 한도를 넘거나 데드라인이 지났으면 거부된다. 'alternate'면
 * MASTER 플래그를 토글해서 다음 시도가 반대쪽 레플리카를 선호하게 한다.
 * 재시도는 큐의 꼬리로 들어간다. 다른 커맨드들이 먼저 실행될 기회를 갖도록
 * 하기 위함이다.
 */
fn retry_or_finish(mut cmd: Command, alternate: bool, failure: Error) {
    cmd.iteration += 1;

    if cmd.iteration > cmd.max_retries || !cmd.timer.on_retry(Instant::now()) {
        finish_error(cmd, failure);
        return;
    }

    if alternate {
        cmd.flags.toggle(CommandFlags::MASTER);
    }
    cmd.state = CommandState::Connect;

    let event_loop = cmd.event_loop.clone();
    let queued = event_loop.post(move || {
        tokio::task::spawn_local(begin(cmd));
    });

    if !queued {
        // 재시도는 항상 자기 루프 스레드에서 일어나므로, 루프가 살아있는 한
        // 여기에 닿지 않는다.
        error!("failed to queue command retry");
    }
}

/// 성공 종료 경로의 결과.
enum CommandResult {
    Ack,
    Record(Record),
    Value(Value),
}

/*
종료 경로는 아래 두 함수로만 수렴한다. 리스너 호출은 커맨드의 소유권을
소비하므로 두 번 부를 방법이 없다. 순서는 리스너 → pending 감소다. 리스너가
그 자리에서 새 커맨드를 제출할 수 있기 때문에, 이 루프의 작업이 남아있는
동안에는 pending이 0으로 보이면 안 된다.
*/

fn finish_success(mut cmd: Command, result: CommandResult) {
    cmd.state = CommandState::Complete;
    cmd.timer.disarm();

    let event_loop = cmd.event_loop.clone();
    let cluster = cmd.cluster.clone();
    cmd.node = None;

    match (cmd.listener, result) {
        (Listener::WriteAck(listener), _) => listener(None, &event_loop),
        (Listener::Record(listener), CommandResult::Record(record)) => {
            listener(Ok(record), &event_loop)
        }
        (Listener::Value(listener), CommandResult::Value(value)) => {
            listener(Ok(value), &event_loop)
        }
        (Listener::Group(executor), _) => Executor::member_complete(&executor),
        (Listener::Record(listener), _) => listener(
            Err(Error::new(Status::Client, "Unexpected response shape")),
            &event_loop,
        ),
        (Listener::Value(listener), _) => listener(
            Err(Error::new(Status::Client, "Unexpected response shape")),
            &event_loop,
        ),
    }

    cluster.pending_dec(event_loop.index());
}

fn finish_error(mut cmd: Command, err: Error) {
    cmd.state = CommandState::Complete;
    cmd.timer.disarm();

    let event_loop = cmd.event_loop.clone();
    let cluster = cmd.cluster.clone();
    cmd.node = None;

    match cmd.listener {
        Listener::WriteAck(listener) => listener(Some(err), &event_loop),
        Listener::Record(listener) => listener(Err(err), &event_loop),
        Listener::Value(listener) => listener(Err(err), &event_loop),
        Listener::Group(executor) => Executor::member_error(&executor, err),
    }

    cluster.pending_dec(event_loop.index());
}

/// 타이머로 감싼 대기의 결과.
enum Timed<T> {
    Done(T),
    /// 소켓 타이머가 이벤트 없이 발화했다. 커넥션을 닫고 재시도한다.
    SocketTimeout,
    /// 전체 데드라인이 지났다. 'iterated'는 소켓 타이머 발화 경로에서
    /// 발견되어 시도 횟수를 한 번 더 세어야 하는 경우다.
    TotalTimeout { iterated: bool },
}

/**
 * 입출력 대기 하나를 커맨드 타이머로 감싼다.
 *
 * 소켓 타이머가 발화하면 이벤트 수신 여부에 따라 재무장/전환하고 같은
 * future를 계속 기다린다. 타이머가 없으면 그냥 기다린다.
 */
async fn with_timer<T, F>(timer: &mut CommandTimer, fut: F) -> Timed<T>
where
    F: Future<Output = T>,
{
    tokio::pin!(fut);

    loop {
        match timer.armed() {
            Armed::None => return Timed::Done((&mut fut).await),

            Armed::Total(deadline) => {
                return match time::timeout_at(deadline, &mut fut).await {
                    Ok(value) => Timed::Done(value),
                    Err(_) => Timed::TotalTimeout { iterated: false },
                };
            }

            Armed::Socket(fire_at) => {
                tokio::select! {
                    value = &mut fut => return Timed::Done(value),
                    _ = time::sleep_until(fire_at) => {
                        match timer.on_socket_fire(Instant::now()) {
                            SocketExpiry::Rearm | SocketExpiry::Transitioned => continue,
                            SocketExpiry::TotalExpired => {
                                return Timed::TotalTimeout { iterated: true };
                            }
                            SocketExpiry::SocketTimeout => return Timed::SocketTimeout,
                        }
                    }
                }
            }
        }
    }
}

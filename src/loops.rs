use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tracing::{debug, error};

use crate::error::{Error, Status};

/**
 * 루프의 제출 큐로 전달되는 작업.
 *
 * 'Stop'은 셧다운 센티널이다. 루프를 직접 멈추면 먼저 큐에 들어간 작업들이
 * 버려질 수 있기 때문에, 정지도 반드시 큐를 통해 전달한다. 센티널이 큐의
 * 꼬리에 있으므로, 그보다 앞서 제출된 작업은 모두 실행된 뒤에 루프가 멈춘다.
 */
pub(crate) enum Task {
    Exec(Box<dyn FnOnce() + Send>),
    Stop,
}

/**
 * 하나의 이벤트 루프 핸들.
 *
 * 루프 하나는 OS 스레드 하나에 대응한다. 내부 루프는 이 crate가 스레드를
 * 소유하고, 외부 루프는 호출자의 스레드 위에 등록된다. 어느 쪽이든 루프의
 * 소유 스레드는 최초 사용 시점에 한 번 기록되고 이후 변하지 않는다.
 *
 * 커맨드는 자신의 루프 스레드에서만 변형된다. 다른 스레드에서의 제출은
 * 스레드 안전한 큐('tx')를 통해서만 이루어진다.
 */
pub struct EventLoop {
    /// 레지스트리 안에서의 고정 인덱스. 커넥션 풀과 pending 카운터가 이
    /// 인덱스로 키잉된다.
    index: usize,

    /// 제출 큐. 커맨드 시작, 재시도 재투입, 클러스터 셧다운 콜백이 모두
    /// 이 큐를 지난다.
    tx: mpsc::UnboundedSender<Task>,

    /// 소유 스레드의 식별자. 최초 사용 시 한 번 세팅된다.
    thread_id: OnceLock<thread::ThreadId>,

    /**
     * 최근 연속 에러 카운터 (재귀 가드).
     *
     * 동기적으로 실행된 에러 콜백이 곧바로 다른 커맨드를 제출하는 상황이
     * 반복되면 스택이 무한히 자랄 수 있다. 이 카운터가 임계치에 도달하면
     * 같은 스레드에서의 제출이라도 인라인 실행 대신 큐를 태운다. 유효한
     * 커넥션을 얻으면 0으로 돌아간다.
     */
    errors: AtomicU32,
}

impl EventLoop {
    pub fn index(&self) -> usize {
        self.index
    }

    /// 현재 스레드가 이 루프의 소유 스레드라면 'true'를 반환한다.
    pub fn is_loop_thread(&self) -> bool {
        self.thread_id
            .get()
            .map_or(false, |id| *id == thread::current().id())
    }

    /**
     * 클로저 하나를 루프 스레드에서 실행하도록 큐에 넣는다.
     *
     * 루프가 이미 정지해서 큐가 닫힌 경우에만 'false'를 반환한다. 루프
     * 스레드 자신에게 제출하는 경우에는 실패하지 않는다. 제출하는 도중에는
     * 그 루프가 정지 센티널을 처리할 수 없기 때문이다.
     */
    pub fn post(&self, f: impl FnOnce() + Send + 'static) -> bool {
        self.tx.send(Task::Exec(Box::new(f))).is_ok()
    }

    fn post_stop(&self) -> bool {
        self.tx.send(Task::Stop).is_ok()
    }

    pub(crate) fn error_count(&self) -> u32 {
        self.errors.load(Ordering::Relaxed)
    }

    pub(crate) fn bump_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reset_errors(&self) {
        self.errors.store(0, Ordering::Relaxed);
    }
}

/**
 * 이벤트 루프 레지스트리.
 *
 * 고정된 용량의 슬롯 배열을 가진다. 내부 루프는 생성 시점에 슬롯이 모두
 * 채워지고, 외부 루프는 등록될 때마다 'size'를 원자적으로 증가시키며 슬롯을
 * 채운다. 슬롯 채움은 라운드 로빈 읽기와 동기화되지 않는다. 읽는 쪽은 잠깐
 * 비어있는 슬롯을 볼 수 있고, 이를 허용해야 한다 (다음 슬롯으로 넘어간다).
 *
 * 'Db' 핸들과 같은 방식의 공유 핸들이다. clone은 shallow이며 레퍼런스
 * 카운트만 증가시킨다.
 */
#[derive(Clone)]
pub struct EventLoops {
    shared: Arc<Registry>,
}

struct Registry {
    /// 고정 용량의 루프 슬롯.
    slots: Box<[OnceLock<Arc<EventLoop>>]>,

    /// 채워진 슬롯 수. 외부 등록 시 fetch-add로 증가한다.
    size: AtomicUsize,

    /// 라운드 로빈 커서. fetch-add 후 size로 나눈 나머지를 쓴다. 순환
    /// 리스트의 next 링크를 따라가는 것과 등가이며, 엄밀한 공정성은
    /// 요구하지 않는다.
    current: AtomicUsize,

    /// 내부 생성 루프의 스레드 핸들. 외부 루프의 스레드는 join할 수 없다.
    threads: Mutex<Vec<JoinHandle<()>>>,

    /// 루프 스레드를 이 crate가 만들었는지 여부.
    internal: bool,
}

impl EventLoops {
    /**
     * 'capacity'개의 내부 이벤트 루프를 생성한다. 루프마다 전용 OS 스레드가
     * 하나씩 가동된다.
     *
     * # Errors
     *
     * 용량이 0이면 실패한다. 스레드 생성 도중 실패하면 이미 만들어진 루프를
     * 모두 정리한 뒤 'Err'을 반환한다.
     */
    pub fn create(capacity: usize) -> crate::Result<EventLoops> {
        let loops = EventLoops::initialize(capacity, true)?;

        for i in 0..capacity {
            let (tx, rx) = mpsc::unbounded_channel();
            let event_loop = Arc::new(EventLoop {
                index: i,
                tx,
                thread_id: OnceLock::new(),
                errors: AtomicU32::new(0),
            });

            let spawned = thread::Builder::new()
                .name(format!("event-loop-{}", i))
                .spawn({
                    let event_loop = event_loop.clone();
                    move || run_loop(event_loop, rx)
                });

            match spawned {
                Ok(handle) => {
                    loops.shared.threads.lock().unwrap().push(handle);
                    let _ = loops.shared.slots[i].set(event_loop);
                    loops.shared.size.fetch_add(1, Ordering::Release);
                }
                Err(err) => {
                    error!(cause = %err, "failed to spawn event loop thread");
                    loops.close();
                    return Err(Error::new(
                        Status::Client,
                        "Failed to create event loops",
                    ));
                }
            }
        }
        Ok(loops)
    }

    /**
     * 외부 루프 'capacity'개를 받을 준비만 한다. 스레드는 만들지 않는다.
     * 이후 각 루프의 소유 스레드에서 'register_external_loop'를 호출한다.
     */
    pub fn with_external_capacity(capacity: usize) -> crate::Result<EventLoops> {
        EventLoops::initialize(capacity, false)
    }

    fn initialize(capacity: usize, internal: bool) -> crate::Result<EventLoops> {
        if capacity == 0 {
            return Err(Error::new(
                Status::Client,
                "Event loop capacity must not be zero",
            ));
        }

        let slots = (0..capacity)
            .map(|_| OnceLock::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(EventLoops {
            shared: Arc::new(Registry {
                slots,
                size: AtomicUsize::new(0),
                current: AtomicUsize::new(0),
                threads: Mutex::new(Vec::new()),
                internal,
            }),
        })
    }

    /**
     * 호출자의 스레드를 이벤트 루프로 등록한다.
     *
     * 반드시 루프의 소유 스레드에서, 그 스레드의 current-thread Tokio 런타임의
     * 'LocalSet' 안에서 호출해야 한다. 큐를 비우는 태스크가 호출자의 LocalSet
     * 위에 가동되기 때문이다.
     *
     * # Errors
     *
     * 용량을 초과하면 'Err'을 반환한다.
     */
    pub fn register_external_loop(&self) -> crate::Result<Arc<EventLoop>> {
        let current = self.shared.size.fetch_add(1, Ordering::AcqRel);

        if current >= self.shared.slots.len() {
            self.shared.size.fetch_sub(1, Ordering::AcqRel);
            error!(
                capacity = self.shared.slots.len(),
                "failed to add external loop"
            );
            return Err(Error::new(
                Status::Client,
                "Event loop capacity exceeded",
            ));
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let event_loop = Arc::new(EventLoop {
            index: current,
            tx,
            thread_id: OnceLock::new(),
            errors: AtomicU32::new(0),
        });

        // 등록하는 스레드가 곧 루프의 소유 스레드가 되어야 한다.
        let _ = event_loop.thread_id.set(thread::current().id());

        tokio::task::spawn_local(async move {
            while let Some(task) = rx.recv().await {
                match task {
                    Task::Exec(f) => f(),
                    Task::Stop => break,
                }
            }
        });

        let _ = self.shared.slots[current].set(event_loop.clone());
        Ok(event_loop)
    }

    /// 슬롯 용량을 반환한다. 클러스터의 pending 배열과 노드의 커넥션 풀이
    /// 이 크기로 할당된다.
    pub fn capacity(&self) -> usize {
        self.shared.slots.len()
    }

    /// 현재 등록된 루프 수를 반환한다.
    pub fn len(&self) -> usize {
        self.shared.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 인덱스로 루프를 찾는다.
    pub fn get(&self, index: usize) -> Option<Arc<EventLoop>> {
        self.shared.slots.get(index)?.get().cloned()
    }

    /// 현재 스레드를 소유한 루프를 찾는다.
    pub fn find_current(&self) -> Option<Arc<EventLoop>> {
        self.snapshot().into_iter().find(|l| l.is_loop_thread())
    }

    /**
     * 라운드 로빈으로 다음 루프를 고른다.
     *
     * 커서는 원자적 fetch-add로 움직인다. 외부 등록과 동기화되지 않으므로
     * 막 증가한 'size'에 비해 슬롯이 아직 비어있을 수 있다. 그 경우 채워진
     * 다음 슬롯으로 넘어간다.
     */
    pub fn next_loop(&self) -> Option<Arc<EventLoop>> {
        let size = self.shared.size.load(Ordering::Acquire);
        if size == 0 {
            return None;
        }

        let start = self.shared.current.fetch_add(1, Ordering::Relaxed);
        for offset in 0..size {
            let index = (start + offset) % size;
            if let Some(event_loop) = self.get(index) {
                return Some(event_loop);
            }
        }
        None
    }

    /// 등록된 루프들을 인덱스 순서로 모아 반환한다.
    pub(crate) fn snapshot(&self) -> Vec<Arc<EventLoop>> {
        let size = self.len().min(self.capacity());
        (0..size).filter_map(|i| self.get(i)).collect()
    }

    /**
     * 모든 루프에 정지 센티널을 보낸다.
     *
     * 내부 생성 루프라면 스레드가 끝나기를 기다린다. 외부 루프의 스레드는
     * join할 수 없다. 루프 스레드 위에서 호출하면 자기 자신을 기다리게
     * 되므로, 반드시 루프 바깥에서 호출한다.
     */
    pub fn close(&self) -> bool {
        let mut status = true;

        for event_loop in self.snapshot() {
            if !event_loop.post_stop() {
                error!("failed to send stop command to event loop");
                status = false;
            }
        }

        if self.shared.internal && status {
            let mut threads = self.shared.threads.lock().unwrap();
            for handle in threads.drain(..) {
                let _ = handle.join();
            }
        }
        status
    }
}

/**
 * 내부 루프 스레드의 본체.
 *
 * current-thread 런타임 위에 'LocalSet'을 깔고 제출 큐를 비운다. 커맨드의
 * 비동기 단계는 이 LocalSet에 'spawn_local'로 올라가므로, 커맨드는 루프
 * 스레드를 떠나지 않는다.
 */
fn run_loop(event_loop: Arc<EventLoop>, mut rx: mpsc::UnboundedReceiver<Task>) {
    let _ = event_loop.thread_id.set(thread::current().id());

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            error!(cause = %err, "failed to build event loop runtime");
            return;
        }
    };

    let local = LocalSet::new();
    local.block_on(&rt, async move {
        while let Some(task) = rx.recv().await {
            match task {
                Task::Exec(f) => f(),
                Task::Stop => break,
            }
        }
    });

    debug!(index = event_loop.index, "event loop stopped");
}

// 테스트에서 소유 스레드를 현재 스레드로 고정한 루프를 만든다.
#[cfg(test)]
pub(crate) fn stub_loop(index: usize) -> Arc<EventLoop> {
    let (tx, _rx) = mpsc::unbounded_channel();
    let event_loop = Arc::new(EventLoop {
        index,
        tx,
        thread_id: OnceLock::new(),
        errors: AtomicU32::new(0),
    });
    let _ = event_loop.thread_id.set(thread::current().id());
    event_loop
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_capacity_fails() {
        assert!(EventLoops::create(0).is_err());
        assert!(EventLoops::with_external_capacity(0).is_err());
    }

    #[test]
    fn round_robin_cycles() {
        let loops = EventLoops::create(2).unwrap();

        let a = loops.next_loop().unwrap().index();
        let b = loops.next_loop().unwrap().index();
        let c = loops.next_loop().unwrap().index();

        assert_ne!(a, b);
        assert_eq!(a, c);

        loops.close();
    }

    #[test]
    fn posted_task_runs_on_loop_thread() {
        let loops = EventLoops::create(1).unwrap();
        let event_loop = loops.get(0).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let handle = event_loop.clone();
        let posted = event_loop.post(move || {
            tx.send(handle.is_loop_thread()).unwrap();
        });

        assert!(posted);
        assert!(rx.recv().unwrap());
        assert!(!event_loop.is_loop_thread());

        loops.close();
    }

    #[tokio::test]
    async fn external_loop_registers_on_owning_thread() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let loops = EventLoops::with_external_capacity(1).unwrap();
                let event_loop = loops.register_external_loop().unwrap();

                assert!(event_loop.is_loop_thread());
                assert_eq!(loops.len(), 1);

                // 용량을 넘는 등록은 거부된다.
                assert!(loops.register_external_loop().is_err());
                assert_eq!(loops.len(), 1);

                // 큐는 호출자의 LocalSet 위에서 비워진다.
                let (tx, rx) = tokio::sync::oneshot::channel();
                assert!(event_loop.post(move || {
                    tx.send(()).unwrap();
                }));
                rx.await.unwrap();
            })
            .await;
    }

    #[test]
    fn error_counter_resets() {
        let event_loop = stub_loop(0);
        event_loop.bump_errors();
        event_loop.bump_errors();
        assert_eq!(event_loop.error_count(), 2);
        event_loop.reset_errors();
        assert_eq!(event_loop.error_count(), 0);
    }
}

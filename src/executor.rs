use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::command::{self, Command};
use crate::error::Error;

type CompleteFn = Box<dyn FnOnce(Option<Error>) + Send>;

/**
 * 한 사용자 수준 다중 노드 연산(배치/스캔/쿼리)에 속한 형제 커맨드들의
 * 조정자.
 *
 * N개의 서브 커맨드 중 최대 'max_concurrent'개만 동시에 실행된다. 하나가
 * 끝날 때마다 다음 인덱스의 커맨드가 출발한다. 첫 에러가 그룹을 무효로
 * 만들고 보관되며, 이후의 에러는 버려진다. 완료 콜백은 'count'가 'max'에
 * 도달하는 경로가 어느 쪽이든 정확히 한 번 불린다.
 *
 * 'count'와 'valid'의 모든 변형은 뮤텍스 아래에서 일어난다. 뮤텍스는 사용자
 * 콜백을 잡은 채로 넘어가지 않는다.
 */
pub struct Executor {
    inner: Mutex<Inner>,
    complete_fn: Mutex<Option<CompleteFn>>,
}

struct Inner {
    /// 서브 커맨드 총 수. 'launch'에서 확정된다.
    max: usize,

    /// 동시 실행 한도.
    max_concurrent: usize,

    /// 완료(성공/실패/팬텀)된 서브 커맨드 수.
    count: usize,

    /// 첫 에러나 취소가 그룹을 무효로 만든다. 무효가 되면 새 서브 커맨드는
    /// 출발하지 않지만, 이미 실행 중인 것들은 끝까지 간다.
    valid: bool,

    /// 사용자의 순회 콜백이 더 이상 결과를 원하지 않는다고 했다면 false.
    /// 완료 콜백은 억제되지만 자원 정리는 그대로 일어난다.
    notify: bool,

    /// 첫 에러의 소유 사본.
    err: Option<Error>,

    /// 아직 출발하지 않은 서브 커맨드들.
    commands: Vec<Option<Command>>,
}

impl Executor {
    pub fn new(
        max_concurrent: usize,
        complete_fn: impl FnOnce(Option<Error>) + Send + 'static,
    ) -> Arc<Executor> {
        Arc::new(Executor {
            inner: Mutex::new(Inner {
                max: 0,
                max_concurrent,
                count: 0,
                valid: true,
                notify: true,
                err: None,
                commands: Vec::new(),
            }),
            complete_fn: Mutex::new(Some(Box::new(complete_fn))),
        })
    }

    /**
     * 서브 커맨드들을 등록하고 동시 실행 한도까지 출발시킨다.
     *
     * 각 커맨드의 리스너는 'Listener::Group'으로 이 executor를 가리키고
     * 있어야 한다.
     */
    pub fn launch(self: &Arc<Executor>, commands: Vec<Command>) {
        let initial = {
            let mut inner = self.inner.lock().unwrap();
            inner.max = commands.len();
            if inner.max_concurrent == 0 || inner.max_concurrent > inner.max {
                inner.max_concurrent = inner.max;
            }
            inner.commands = commands.into_iter().map(Some).collect();
            inner.max_concurrent
        };

        if initial == 0 {
            // 빈 그룹은 그 자리에서 끝난다.
            self.finish();
            return;
        }

        for index in 0..initial {
            self.launch_at(index);
        }
    }

    /// index번째 서브 커맨드를 출발시킨다. 이미 무효라면 아무것도 하지
    /// 않는다.
    fn launch_at(self: &Arc<Executor>, index: usize) {
        let cmd = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.valid {
                return;
            }
            inner.commands.get_mut(index).and_then(Option::take)
        };

        if let Some(cmd) = cmd {
            if let Err(err) = command::execute(cmd) {
                // 큐 제출이 실패한 커맨드는 리스너 없이 해제되었다.
                // 0..index는 이미 출발했으므로, 나머지를 팬텀 완료로 채운다.
                self.fail_from(index, err);
            }
        }
    }

    /// 서브 커맨드 하나가 성공적으로 끝났다.
    pub(crate) fn member_complete(executor: &Arc<Executor>) {
        let (complete, next) = {
            let mut inner = executor.inner.lock().unwrap();
            inner.count += 1;

            let complete = inner.count == inner.max;
            let next = inner.count + inner.max_concurrent - 1;
            let start_next = !complete && next < inner.max && inner.valid;

            (complete, if start_next { Some(next) } else { None })
        };

        if complete {
            executor.finish();
        } else if let Some(next) = next {
            executor.launch_at(next);
        }
    }

    /// 서브 커맨드 하나가 에러로 끝났다. 첫 에러만 보관된다.
    pub(crate) fn member_error(executor: &Arc<Executor>, err: Error) {
        let complete = {
            let mut inner = executor.inner.lock().unwrap();
            let first_error = inner.valid;
            inner.valid = false;
            inner.count += 1;

            if first_error {
                inner.err = Some(err);
            } else {
                debug!(cause = %err, "dropping subsequent group error");
            }
            inner.count == inner.max
        };

        if complete {
            executor.finish();
        }
    }

    /// 출발시키지 못한 커맨드들을 팬텀 완료로 채우는 에러 경로.
    fn fail_from(self: &Arc<Executor>, queued_count: usize, err: Error) {
        let complete = {
            let mut inner = self.inner.lock().unwrap();
            let first_error = inner.valid;
            inner.valid = false;
            inner.count += inner.max - queued_count;

            if first_error {
                inner.err = Some(err);
            }
            inner.count == inner.max
        };

        if complete {
            self.finish();
        }
    }

    /**
     * 호출자가 그룹을 취소한다.
     *
     * 'queued_count'는 지금까지 출발한 서브 커맨드 수다. 출발하지 못할
     * 나머지를 팬텀 완료로 채워서, 실행 중인 멤버들이 끝나는 순간 단일 파괴
     * 경로가 발화하게 한다. 취소 자체가 'count'를 'max'로 끌어올렸다면
     * 에러가 최초 호출에 동기적으로 반환된 경우이므로 완료 콜백 없이 정리만
     * 한다.
     */
    pub fn cancel(self: &Arc<Executor>, queued_count: usize) {
        let complete = {
            let mut inner = self.inner.lock().unwrap();
            inner.valid = false;
            inner.count += inner.max - queued_count;
            inner.count == inner.max
        };

        if complete {
            *self.complete_fn.lock().unwrap() = None;
        }
    }

    /// 사용자의 순회 콜백이 중단을 원했다. 완료 콜백을 억제한다.
    pub fn set_notify(&self, notify: bool) {
        self.inner.lock().unwrap().notify = notify;
    }

    /// 협조적 취소 플래그. 스캔/쿼리 드라이버가 결과를 더 전달할지 확인하는
    /// 데 쓴다.
    pub fn is_valid(&self) -> bool {
        self.inner.lock().unwrap().valid
    }

    /// 마지막 서브 커맨드가 'count'를 'max'로 끌어올린 쪽에서 한 번만
    /// 불린다. 뮤텍스를 놓은 뒤에 사용자 콜백을 부른다.
    fn finish(&self) {
        let (notify, err) = {
            let mut inner = self.inner.lock().unwrap();
            (inner.notify, inner.err.take())
        };

        let complete_fn = self.complete_fn.lock().unwrap().take();
        if let Some(complete_fn) = complete_fn {
            if notify {
                complete_fn(err);
            }
        }
    }
}

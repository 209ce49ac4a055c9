use std::time::Duration;

use tokio::time::Instant;

/**
 * 커맨드에 무장된 타이머. 한 시점에 하나만 무장된다.
 *
 * 'Socket'은 마지막 이벤트 수신 이후 socket_timeout 만큼 지나면 발화한다.
 * 'Total'은 절대 데드라인에 발화하며, 발화하면 재시도 없이 종료된다.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Armed {
    None,
    Socket(Instant),
    Total(Instant),
}

/// 소켓 타이머 발화 시점의 판정 결과.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SocketExpiry {
    /// 타이머 주기 안에 이벤트가 있었다. 소켓 타이머를 다시 무장했다.
    Rearm,
    /// 이벤트는 있었지만 데드라인까지 남은 시간이 socket_timeout 이하다.
    /// 전체 타이머로 전환했다.
    Transitioned,
    /// 이벤트는 있었지만 전체 데드라인이 이미 지났다.
    TotalExpired,
    /// 주기 안에 이벤트가 없었다. 진짜 소켓 타임아웃이다.
    SocketTimeout,
}

/**
 * 커맨드 하나의 2단 타임아웃 상태.
 *
 * 시작 시 socket_timeout과 데드라인이 모두 있고 socket_timeout이 남은
 * 시간보다 짧을 때에만 소켓 타이머를 쓴다. 그 외에는 전체 타이머 하나로
 * 충분하다. 소켓 타이머는 읽기 이벤트가 도착하는 한 계속 재무장되다가,
 * 남은 시간이 주기 이하로 줄어드는 순간 전체 타이머로 넘어간다.
 */
#[derive(Debug)]
pub(crate) struct CommandTimer {
    socket_timeout: Option<Duration>,
    deadline: Option<Instant>,
    armed: Armed,
    event_received: bool,
}

impl CommandTimer {
    /// 아직 무장되지 않은 타이머. 커맨드가 루프에 들어가기 전의 상태다.
    pub(crate) fn unarmed() -> CommandTimer {
        CommandTimer {
            socket_timeout: None,
            deadline: None,
            armed: Armed::None,
            event_received: false,
        }
    }

    /// 커맨드 시작 시점의 무장 선택.
    pub(crate) fn arm(
        socket_timeout: Option<Duration>,
        deadline: Option<Instant>,
        now: Instant,
    ) -> CommandTimer {
        let armed = match (socket_timeout, deadline) {
            (Some(socket), Some(deadline)) => {
                if now + socket < deadline {
                    Armed::Socket(now + socket)
                } else {
                    Armed::Total(deadline)
                }
            }
            (Some(socket), None) => Armed::Socket(now + socket),
            (None, Some(deadline)) => Armed::Total(deadline),
            (None, None) => Armed::None,
        };

        CommandTimer {
            socket_timeout,
            deadline,
            armed,
            event_received: false,
        }
    }

    pub(crate) fn armed(&self) -> Armed {
        self.armed
    }

    /// 읽기 이벤트가 도착했다. 다음 소켓 타이머 발화 판정에 반영된다.
    pub(crate) fn note_event(&mut self) {
        self.event_received = true;
    }

    /// 타이머를 해제한다. 종료 경로에서 호출된다.
    pub(crate) fn disarm(&mut self) {
        self.armed = Armed::None;
    }

    /**
     * 소켓 타이머가 발화했다.
     *
     * 주기 안에 이벤트가 있었다면 플래그를 지우고 전체 데드라인과의 관계에
     * 따라 재무장하거나 전체 타이머로 전환한다. 이벤트가 없었다면 진짜
     * 타임아웃이며, 커넥션을 닫고 재시도하는 것은 호출자의 몫이다.
     */
    pub(crate) fn on_socket_fire(&mut self, now: Instant) -> SocketExpiry {
        if !self.event_received {
            return SocketExpiry::SocketTimeout;
        }
        self.event_received = false;

        // Socket 타이머는 socket_timeout이 있어야만 무장된다.
        let socket = self.socket_timeout.unwrap();

        match self.deadline {
            Some(deadline) => {
                if now >= deadline {
                    SocketExpiry::TotalExpired
                } else if deadline - now <= socket {
                    self.armed = Armed::Total(deadline);
                    SocketExpiry::Transitioned
                } else {
                    self.armed = Armed::Socket(now + socket);
                    SocketExpiry::Rearm
                }
            }
            None => {
                self.armed = Armed::Socket(now + socket);
                SocketExpiry::Rearm
            }
        }
    }

    /**
     * 재시도 직전의 타이머 처리. 데드라인이 이미 지났으면 'false'를 반환하고
     * 재시도는 거부된다. 소켓 타이머를 쓰는 중이라면 남은 시간에 따라
     * 재무장하거나 전체 타이머로 전환한다.
     */
    pub(crate) fn on_retry(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) => {
                if now >= deadline {
                    return false;
                }
                if let Armed::Socket(_) = self.armed {
                    let socket = self.socket_timeout.unwrap();
                    if deadline - now <= socket {
                        self.armed = Armed::Total(deadline);
                    } else {
                        self.armed = Armed::Socket(now + socket);
                    }
                }
            }
            None => {
                if let Armed::Socket(_) = self.armed {
                    let socket = self.socket_timeout.unwrap();
                    self.armed = Armed::Socket(now + socket);
                }
            }
        }
        true
    }
}

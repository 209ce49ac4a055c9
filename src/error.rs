use std::error;
use std::fmt;
use std::io;

/**
 * 리스너에게 전달되는 에러의 안정된 식별자.
 *
 * 각 식별자는 와이어 상의 숫자 코드와 짝을 이룬다. 음수는 클라이언트 측에서
 * 만들어지는 코드이고, 양수는 서버가 돌려주는 코드이다. 알 수 없는 음수 코드는
 * 'Client'로, 알 수 없는 양수 코드는 'Server'로 수렴한다.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// TLS 계층 오류.
    TlsError,
    /// (노드, 이벤트 루프)별 커넥션 한도 초과.
    NoMoreConnections,
    /// 비동기 소켓 연결/입출력 실패.
    AsyncConnection,
    /// 클라이언트 측에서 처리를 중단함.
    ClientAbort,
    /// 일반적인 클라이언트 측 오류.
    Client,
    /// 성공.
    Ok,
    /// 일반적인 서버 측 오류.
    Server,
    /// 소켓 타임아웃 혹은 전체 데드라인 초과.
    Timeout,
    /// 클러스터가 비어있거나 닫힘.
    Cluster,
    /// 스캔이 서버에서 중단됨.
    ScanAborted,
    /// 인증되지 않은 커넥션.
    NotAuthenticated,
    /// UDF 실행 실패. 서버가 보낸 메시지가 에러에 담긴다.
    Udf,
    /// 쿼리가 서버에서 중단됨.
    QueryAborted,
}

impl Status {
    /// 와이어 상의 숫자 코드를 반환한다.
    pub fn code(self) -> i32 {
        match self {
            Status::TlsError => -9,
            Status::NoMoreConnections => -7,
            Status::AsyncConnection => -6,
            Status::ClientAbort => -5,
            Status::Client => -1,
            Status::Ok => 0,
            Status::Server => 1,
            Status::Timeout => 9,
            Status::Cluster => 11,
            Status::ScanAborted => 15,
            Status::NotAuthenticated => 80,
            Status::Udf => 100,
            Status::QueryAborted => 210,
        }
    }

    /*
    숫자 코드를 식별자로 되돌린다.

    알 수 없는 코드도 실패가 아니다. 음수라면 클라이언트가, 양수라면 서버가
    만든 코드이므로 각각의 일반 식별자로 수렴시킨다.
    */
    pub fn from_code(code: i32) -> Status {
        match code {
            -9 => Status::TlsError,
            -7 => Status::NoMoreConnections,
            -6 => Status::AsyncConnection,
            -5 => Status::ClientAbort,
            -1 => Status::Client,
            0 => Status::Ok,
            1 => Status::Server,
            9 => Status::Timeout,
            11 => Status::Cluster,
            15 => Status::ScanAborted,
            80 => Status::NotAuthenticated,
            100 => Status::Udf,
            210 => Status::QueryAborted,
            c if c < 0 => Status::Client,
            _ => Status::Server,
        }
    }

    // 식별자 이름을 반환한다. 로그와 Display에 사용한다.
    pub fn name(self) -> &'static str {
        match self {
            Status::TlsError => "TLS_ERROR",
            Status::NoMoreConnections => "NO_MORE_CONNECTIONS",
            Status::AsyncConnection => "ASYNC_CONNECTION",
            Status::ClientAbort => "CLIENT_ABORT",
            Status::Client => "CLIENT",
            Status::Ok => "OK",
            Status::Server => "SERVER",
            Status::Timeout => "TIMEOUT",
            Status::Cluster => "CLUSTER",
            Status::ScanAborted => "SCAN_ABORTED",
            Status::NotAuthenticated => "NOT_AUTHENTICATED",
            Status::Udf => "UDF",
            Status::QueryAborted => "QUERY_ABORTED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        self.name().fmt(fmt)
    }
}

/**
 * 리스너에게 전달되는 구조적 에러.
 *
 * 'Status'와 사람이 읽을 메시지를 담는다. 재시도 가능 여부의 판단은 에러를
 * 만드는 쪽이 아니라 상태 머신이 한다. 이 타입은 판단의 재료만 나른다.
 */
#[derive(Debug, Clone)]
pub struct Error {
    status: Status,
    message: String,
}

impl Error {
    /// 상태와 메시지로 새로운 에러를 생성한다.
    pub fn new(status: Status, message: impl Into<String>) -> Error {
        Error {
            status,
            message: message.into(),
        }
    }

    /// 서버 결과 코드만으로 에러를 생성한다. 메시지는 식별자 이름이 된다.
    pub fn from_code(code: i32) -> Error {
        let status = Status::from_code(code);
        Error {
            status,
            message: status.name().to_string(),
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}: {}", self.status.name(), self.message)
    }
}

impl error::Error for Error {}

/*
소켓 입출력 에러는 비동기 커넥션 오류로 수렴한다. 상태 머신은 이 상태를 보고
재시도 여부를 결정한다.
*/
impl From<io::Error> for Error {
    fn from(src: io::Error) -> Error {
        Error::new(Status::AsyncConnection, src.to_string())
    }
}

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::proto;

/**
 * 원격 노드와의 TCP 커넥션 하나.
 *
 * 커넥션은 풀의 소유물이며, 커맨드 하나가 실행되는 동안만 빌려 쓴다. 소켓에
 * 읽지 않은 데이터가 남을 수 있는 오류 경로에서는 풀에 돌려놓지 않고 닫는다.
 *
 * 읽기에는 내부 버퍼를 사용한다. 완전한 하나의 응답 프레임을 만들 수 있을
 * 만큼의 바이트가 모일 때까지 버퍼를 채우다가, 충분해지면 프레임을 잘라서
 * 호출자에게 반환한다. 쓰기는 이미 직렬화된 요청 버퍼 하나를 그대로 쓴다.
 */
pub(crate) struct Connection {
    stream: TcpStream,
    buffer: BytesMut,
    last_used: Instant,
}

impl Connection {
    /// 'addr'의 노드에 비동기로 연결한다.
    pub(crate) async fn connect(addr: &SocketAddr) -> io::Result<Connection> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        Ok(Connection {
            stream,
            // 응답 헤더와 작은 레코드가 재할당 없이 들어갈 크기.
            buffer: BytesMut::with_capacity(4 * 1024),
            last_used: Instant::now(),
        })
    }

    /**
     * 풀에서 꺼낸 커넥션을 검증한다.
     *
     * 소켓이 살아있고 수신 버퍼가 비어있어야 재사용할 수 있다. 논블로킹
     * 읽기를 시도해서 'WouldBlock'이면 정상이다. 바이트가 읽히면 이전
     * 커맨드의 잔여 데이터가 있다는 뜻이고, 0이면 상대가 닫은 것이다.
     * 어느 쪽이든 이 커넥션은 버린다.
     */
    pub(crate) fn validate(&mut self) -> bool {
        let mut probe = [0u8; 8];
        match self.stream.try_read(&mut probe) {
            Ok(_) => false,
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        }
    }

    /// 직렬화된 요청 버퍼를 소켓에 쓴다. 완전히 쓸 때까지 대기한다.
    pub(crate) async fn write_command(&mut self, buf: &[u8]) -> io::Result<()> {
        self.stream.write_all(buf).await
    }

    /**
     * 소켓에서 읽어 내부 버퍼에 누적한다. 최소 1바이트를 읽을 때까지
     * 대기한다. 상대가 소켓을 닫았다면 에러를 반환한다.
     */
    pub(crate) async fn read_some(&mut self) -> io::Result<usize> {
        let n = self.stream.read_buf(&mut self.buffer).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection reset by peer",
            ));
        }
        Ok(n)
    }

    /**
     * 완전한 응답 메시지가 모였으면 잘라서 반환한다.
     *
     * 프로토콜 헤더가 아직 다 오지 않았거나 본문이 모자라면 'None'을
     * 반환하고, 호출자는 'read_some'으로 버퍼를 더 채운다. 반환되는
     * 바이트에서 프로토콜 헤더는 이미 소비되어 있다.
     */
    pub(crate) fn take_message(&mut self) -> crate::Result<Option<Bytes>> {
        match proto::message_len(&self.buffer)? {
            Some(total) if self.buffer.len() >= total => {
                let mut frame = self.buffer.split_to(total).freeze();
                frame.advance(proto::PROTO_HEADER_SIZE);
                Ok(Some(frame))
            }
            _ => Ok(None),
        }
    }

    /// 풀에 돌려놓기 직전에 호출된다. 유휴 리퍼의 기준 시각을 갱신한다.
    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
        self.buffer.clear();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    #[cfg(test)]
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.stream.local_addr().unwrap()
    }
}

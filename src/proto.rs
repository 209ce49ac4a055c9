//! 응답 프레임의 와이어 표현.
//!
//! 네트워크 프로토콜 상의 하나의 응답은 고정 크기 프로토콜 헤더, 메시지
//! 헤더, 필드들, 빈(bin)들로 구성된 프레임 하나다. 요청의 직렬화는 이 코어
//! 바깥에서 일어난다. 커맨드는 이미 직렬화된 요청 버퍼를 들고 들어온다.
//!
//! 인코딩 함수들은 "실제" 클라이언트라면 public이 아니겠지만, 테스트가
//! 서버 역할을 해야 하므로 여기서는 public으로 둔다.

use std::collections::HashMap;
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Status};

/// 프로토콜 버전. 프레임의 첫 바이트.
pub const PROTO_VERSION: u8 = 2;

/// 메시지 타입. 프레임의 두 번째 바이트.
pub const MSG_TYPE_MESSAGE: u8 = 3;

/// 프로토콜 헤더 크기: version(1) + type(1) + length(6, big-endian).
pub(crate) const PROTO_HEADER_SIZE: usize = 8;

/// 메시지 헤더 크기. 프로토콜 헤더 바로 뒤에 온다.
pub const MSG_HEADER_SIZE: usize = 16;

// 빈 값의 와이어 타입.
const BIN_TYPE_NIL: u8 = 0;
const BIN_TYPE_INTEGER: u8 = 1;
const BIN_TYPE_STRING: u8 = 3;
const BIN_TYPE_BLOB: u8 = 4;

// UDF 결과가 담기는 빈의 이름.
const BIN_SUCCESS: &str = "SUCCESS";
const BIN_FAILURE: &str = "FAILURE";

/// 빈 하나에 담기는 값.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Int(i64),
    Str(String),
    Blob(Bytes),
}

impl fmt::Display for Value {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Nil => "(nil)".fmt(fmt),
            Value::Int(v) => v.fmt(fmt),
            Value::Str(v) => v.fmt(fmt),
            Value::Blob(v) => write!(fmt, "{:?}", v),
        }
    }
}

/// 단일 키 읽기의 결과 레코드.
#[derive(Debug, Clone)]
pub struct Record {
    /// 레코드의 세대 번호. 쓰기마다 증가한다.
    pub generation: u32,

    /// 남은 TTL (초). 0은 만료 없음.
    pub ttl: u32,

    /// 빈 이름 → 값.
    pub bins: HashMap<String, Value>,
}

/**
 * 메시지 헤더.
 *
 * result_code가 0(OK)이 아니면 필드와 빈은 의미를 갖지 않는다. 예외는
 * UDF 실패인데, 이때는 FAILURE 빈에 서버가 만든 메시지가 담겨 온다.
 */
#[derive(Debug, Clone, Copy)]
pub struct MsgHeader {
    pub result_code: u8,
    pub generation: u32,
    pub ttl: u32,
    pub n_fields: u16,
    pub n_ops: u16,
}

fn truncated(what: &str) -> Error {
    Error::new(Status::Client, format!("protocol error; truncated {}", what))
}

/**
 * 버퍼 맨 앞의 프로토콜 헤더를 읽어 프레임 전체 길이를 계산한다.
 *
 * 헤더가 아직 다 오지 않았으면 'None'. 버전이 맞지 않으면 에러다. 이
 * 함수는 버퍼를 소비하지 않는다.
 */
pub(crate) fn message_len(buf: &[u8]) -> crate::Result<Option<usize>> {
    if buf.len() < PROTO_HEADER_SIZE {
        return Ok(None);
    }

    if buf[0] != PROTO_VERSION {
        return Err(Error::new(
            Status::Client,
            format!("protocol error; unsupported version {}", buf[0]),
        ));
    }

    if buf[1] != MSG_TYPE_MESSAGE {
        return Err(Error::new(
            Status::Client,
            format!("protocol error; unexpected message type {}", buf[1]),
        ));
    }

    let mut len: u64 = 0;
    for &b in &buf[2..PROTO_HEADER_SIZE] {
        len = (len << 8) | u64::from(b);
    }
    Ok(Some(PROTO_HEADER_SIZE + len as usize))
}

/// 메시지 헤더를 파싱한다. 'src'는 프로토콜 헤더가 소비된 프레임이다.
pub fn parse_msg_header(src: &mut Bytes) -> crate::Result<MsgHeader> {
    if src.remaining() < MSG_HEADER_SIZE {
        return Err(truncated("message header"));
    }

    let result_code = src.get_u8();
    let _info = src.get_u8();
    let _reserved = src.get_u16();
    let generation = src.get_u32();
    let ttl = src.get_u32();
    let n_fields = src.get_u16();
    let n_ops = src.get_u16();

    Ok(MsgHeader {
        result_code,
        generation,
        ttl,
        n_fields,
        n_ops,
    })
}

/**
 * 필드들을 건너뛴다.
 *
 * 이 코어는 필드(네임스페이스, 셋, 키 다이제스트 등)를 해석하지 않는다.
 * 필드 하나는 u32 길이와 그만큼의 바이트다.
 */
pub fn skip_fields(src: &mut Bytes, n_fields: u16) -> crate::Result<()> {
    for _ in 0..n_fields {
        if src.remaining() < 4 {
            return Err(truncated("field"));
        }
        let size = src.get_u32() as usize;
        if src.remaining() < size {
            return Err(truncated("field"));
        }
        src.advance(size);
    }
    Ok(())
}

/*
빈 하나: u32 size, u8 op, u8 value type, u8 name length, 이름, 값.
size는 size 필드 뒤에 오는 바이트 수다.
*/
fn parse_bin(src: &mut Bytes) -> crate::Result<(String, Value)> {
    if src.remaining() < 4 {
        return Err(truncated("bin"));
    }
    let size = src.get_u32() as usize;
    if size < 3 || src.remaining() < size {
        return Err(truncated("bin"));
    }

    let _op = src.get_u8();
    let value_type = src.get_u8();
    let name_len = src.get_u8() as usize;
    if size < 3 + name_len {
        return Err(truncated("bin name"));
    }

    let name = src.split_to(name_len);
    let name = std::str::from_utf8(&name)
        .map_err(|_| Error::new(Status::Client, "protocol error; invalid bin name"))?
        .to_string();

    let data = src.split_to(size - 3 - name_len);
    let value = decode_value(value_type, data)?;
    Ok((name, value))
}

fn decode_value(value_type: u8, data: Bytes) -> crate::Result<Value> {
    match value_type {
        BIN_TYPE_NIL => Ok(Value::Nil),
        BIN_TYPE_INTEGER => {
            if data.len() != 8 {
                return Err(Error::new(
                    Status::Client,
                    "protocol error; invalid integer size",
                ));
            }
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&data);
            Ok(Value::Int(i64::from_be_bytes(bytes)))
        }
        BIN_TYPE_STRING => match String::from_utf8(data.to_vec()) {
            Ok(s) => Ok(Value::Str(s)),
            Err(_) => Err(Error::new(
                Status::Client,
                "protocol error; invalid string value",
            )),
        },
        BIN_TYPE_BLOB => Ok(Value::Blob(data)),
        t => Err(Error::new(
            Status::Client,
            format!("protocol error; unsupported value type {}", t),
        )),
    }
}

/// 빈들을 파싱해서 이름 → 값 맵을 만든다.
pub fn parse_bins(src: &mut Bytes, n_ops: u16) -> crate::Result<HashMap<String, Value>> {
    let mut bins = HashMap::with_capacity(n_ops as usize);
    for _ in 0..n_ops {
        let (name, value) = parse_bin(src)?;
        bins.insert(name, value);
    }
    Ok(bins)
}

/**
 * SUCCESS/FAILURE 빈 쌍에서 스칼라 값 하나를 꺼낸다.
 *
 * SUCCESS 빈이 있으면 그 값이 결과다. FAILURE 빈이 있으면 서버가 만든
 * 메시지를 담은 UDF 에러가 된다.
 */
pub fn parse_success_failure(src: &mut Bytes, n_ops: u16) -> crate::Result<Value> {
    let bins = parse_bins(src, n_ops)?;

    for (name, value) in bins {
        match name.as_str() {
            BIN_SUCCESS => return Ok(value),
            BIN_FAILURE => return Err(udf_failure(value)),
            _ => {}
        }
    }

    Err(Error::new(
        Status::Client,
        "protocol error; response missing SUCCESS or FAILURE bin",
    ))
}

/**
 * UDF 실패 응답에서 서버 메시지를 추출한다.
 *
 * FAILURE 빈을 찾지 못하면 기본 메시지를 쓴다. 추출 실패가 또 다른 에러가
 * 되지는 않는다. 이미 에러 경로이기 때문이다.
 */
pub fn parse_udf_error(src: &mut Bytes, header: &MsgHeader) -> Error {
    if skip_fields(src, header.n_fields).is_err() {
        return Error::new(Status::Udf, "udf failure");
    }

    if let Ok(bins) = parse_bins(src, header.n_ops) {
        if let Some(value) = bins.get(BIN_FAILURE) {
            return udf_failure(value.clone());
        }
    }
    Error::new(Status::Udf, "udf failure")
}

fn udf_failure(value: Value) -> Error {
    match value {
        Value::Str(message) => Error::new(Status::Udf, message),
        other => Error::new(Status::Udf, other.to_string()),
    }
}

fn put_proto_header(dst: &mut BytesMut, len: usize) {
    dst.put_u8(PROTO_VERSION);
    dst.put_u8(MSG_TYPE_MESSAGE);
    let len = len as u64;
    for shift in (0..6).rev() {
        dst.put_u8((len >> (shift * 8)) as u8);
    }
}

/// 요청 본문을 프로토콜 헤더로 감싼다. 상위 계층의 직렬화가 쓰는 형태와
/// 같지만, 여기서는 테스트가 요청 버퍼를 만들 때 쓴다.
pub fn pack_request(body: &[u8]) -> Bytes {
    let mut dst = BytesMut::with_capacity(PROTO_HEADER_SIZE + body.len());
    put_proto_header(&mut dst, body.len());
    dst.put_slice(body);
    dst.freeze()
}

/// 완전한 응답 프레임 하나를 인코딩한다.
pub fn pack_response(
    result_code: u8,
    generation: u32,
    ttl: u32,
    fields: &[&[u8]],
    bins: &[(&str, Value)],
) -> Bytes {
    let mut msg = BytesMut::new();
    msg.put_u8(result_code);
    msg.put_u8(0); // info
    msg.put_u16(0); // reserved
    msg.put_u32(generation);
    msg.put_u32(ttl);
    msg.put_u16(fields.len() as u16);
    msg.put_u16(bins.len() as u16);

    for field in fields {
        msg.put_u32(field.len() as u32);
        msg.put_slice(field);
    }

    for (name, value) in bins {
        put_bin(&mut msg, name, value);
    }

    let mut dst = BytesMut::with_capacity(PROTO_HEADER_SIZE + msg.len());
    put_proto_header(&mut dst, msg.len());
    dst.put_slice(&msg);
    dst.freeze()
}

/// 빈 없는 헤더 전용 응답. 쓰기 ack가 이 모양이다.
pub fn pack_ack(result_code: u8) -> Bytes {
    pack_response(result_code, 0, 0, &[], &[])
}

fn put_bin(dst: &mut BytesMut, name: &str, value: &Value) {
    let (value_type, data) = encode_value(value);
    dst.put_u32((3 + name.len() + data.len()) as u32);
    dst.put_u8(0); // op
    dst.put_u8(value_type);
    dst.put_u8(name.len() as u8);
    dst.put_slice(name.as_bytes());
    dst.put_slice(&data);
}

fn encode_value(value: &Value) -> (u8, Vec<u8>) {
    match value {
        Value::Nil => (BIN_TYPE_NIL, Vec::new()),
        Value::Int(v) => (BIN_TYPE_INTEGER, v.to_be_bytes().to_vec()),
        Value::Str(v) => (BIN_TYPE_STRING, v.as_bytes().to_vec()),
        Value::Blob(v) => (BIN_TYPE_BLOB, v.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_response_parses() {
        let frame = pack_response(
            0,
            3,
            120,
            &[b"ns-field"],
            &[
                ("count", Value::Int(7)),
                ("name", Value::Str("door".to_string())),
            ],
        );

        let total = message_len(&frame).unwrap().unwrap();
        assert_eq!(total, frame.len());

        let mut src = frame.slice(PROTO_HEADER_SIZE..);
        let header = parse_msg_header(&mut src).unwrap();
        assert_eq!(header.result_code, 0);
        assert_eq!(header.generation, 3);
        assert_eq!(header.ttl, 120);

        skip_fields(&mut src, header.n_fields).unwrap();
        let bins = parse_bins(&mut src, header.n_ops).unwrap();
        assert_eq!(bins["count"], Value::Int(7));
        assert_eq!(bins["name"], Value::Str("door".to_string()));
    }

    #[test]
    fn success_failure_pair() {
        let frame = pack_response(0, 0, 0, &[], &[("SUCCESS", Value::Int(42))]);
        let mut src = frame.slice(PROTO_HEADER_SIZE..);
        let header = parse_msg_header(&mut src).unwrap();
        skip_fields(&mut src, header.n_fields).unwrap();
        assert_eq!(
            parse_success_failure(&mut src, header.n_ops).unwrap(),
            Value::Int(42)
        );

        let frame = pack_response(
            0,
            0,
            0,
            &[],
            &[("FAILURE", Value::Str("division by zero".to_string()))],
        );
        let mut src = frame.slice(PROTO_HEADER_SIZE..);
        let header = parse_msg_header(&mut src).unwrap();
        skip_fields(&mut src, header.n_fields).unwrap();
        let err = parse_success_failure(&mut src, header.n_ops).unwrap_err();
        assert_eq!(err.status(), Status::Udf);
        assert_eq!(err.message(), "division by zero");
    }

    #[test]
    fn udf_error_extracts_server_message() {
        let frame = pack_response(
            100,
            0,
            0,
            &[],
            &[("FAILURE", Value::Str("udf blew up".to_string()))],
        );
        let mut src = frame.slice(PROTO_HEADER_SIZE..);
        let header = parse_msg_header(&mut src).unwrap();
        let err = parse_udf_error(&mut src, &header);
        assert_eq!(err.status(), Status::Udf);
        assert_eq!(err.message(), "udf blew up");
    }

    #[test]
    fn incomplete_frame_waits() {
        let frame = pack_ack(0);
        assert!(message_len(&frame[..4]).unwrap().is_none());
        assert!(message_len(&frame[..PROTO_HEADER_SIZE]).unwrap().is_some());
    }

    #[test]
    fn bad_version_is_error() {
        let mut frame = pack_ack(0).to_vec();
        frame[0] = 9;
        assert!(message_len(&frame).is_err());
    }

    #[test]
    fn truncated_bin_is_error() {
        let frame = pack_response(0, 0, 0, &[], &[("count", Value::Int(7))]);
        let mut src = frame.slice(PROTO_HEADER_SIZE..frame.len() - 2);
        let header = parse_msg_header(&mut src).unwrap();
        assert!(parse_bins(&mut src, header.n_ops).is_err());
    }
}

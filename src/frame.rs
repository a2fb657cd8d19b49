//! 와이어 프레임 정의
//!
//! - 데이터 프레임: `[sequence_number: u32 BE][payload...]`
//! - ACK 프레임: 정확히 4바이트 `[sequence_number: u32 BE]`
//! - 엔벨로프: 데이터 프레임 페이로드 앞에 붙는 13바이트 프래그먼트 헤더
//!   `[message_id: u32][fragment_index: u32][total_fragments: u32][flags: u8]`

use bincode::Options;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{Error, Result, SEQUENCE_SIZE};

/// 직렬화된 프래그먼트 헤더 크기 (바이트)
pub const FRAGMENT_HEADER_SIZE: usize = 13;

/// flags bit0: 분할된 메시지의 조각
pub const FLAG_FRAGMENT: u8 = 0b0000_0001;

/// flags bit1: 본문이 압축됨
pub const FLAG_COMPRESSED: u8 = 0b0000_0010;

/// flags bit2: 본문이 암호화됨 (IV 선행)
pub const FLAG_ENCRYPTED: u8 = 0b0000_0100;

/// flags bit3: 본문 없는 keepalive (조각일 수 없음)
pub const FLAG_KEEPALIVE: u8 = 0b0000_1000;

const KNOWN_FLAGS: u8 = FLAG_FRAGMENT | FLAG_COMPRESSED | FLAG_ENCRYPTED | FLAG_KEEPALIVE;

/// 헤더 직렬화 옵션 (빅엔디안, 고정 길이 정수)
fn header_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_big_endian()
        .with_fixint_encoding()
}

/// 시퀀스 번호가 붙은 최소 와이어 단위
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sequence_number: u32,
    pub payload: Bytes,
}

impl Frame {
    /// 데이터 프레임 생성
    pub fn data(sequence_number: u32, payload: Bytes) -> Self {
        Self {
            sequence_number,
            payload,
        }
    }

    /// ACK 프레임 생성
    pub fn ack(sequence_number: u32) -> Self {
        Self {
            sequence_number,
            payload: Bytes::new(),
        }
    }

    /// ACK 여부 (전체 길이 4바이트)
    pub fn is_ack(&self) -> bool {
        self.payload.is_empty()
    }

    /// 인코딩된 크기
    pub fn encoded_len(&self) -> usize {
        SEQUENCE_SIZE + self.payload.len()
    }

    /// 바이트로 직렬화
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u32(self.sequence_number);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// 바이트에서 역직렬화
    pub fn decode(mut bytes: Bytes) -> Result<Self> {
        if bytes.len() < SEQUENCE_SIZE {
            return Err(Error::Protocol(format!(
                "프레임이 너무 짧음: {} bytes",
                bytes.len()
            )));
        }

        let sequence_number = bytes.get_u32();
        Ok(Self {
            sequence_number,
            payload: bytes,
        })
    }
}

/// 프래그먼트 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentHeader {
    /// 같은 메시지의 조각들이 공유하는 ID
    pub message_id: u32,

    /// 0부터 시작하는 조각 인덱스
    pub fragment_index: u32,

    /// 메시지의 총 조각 수
    pub total_fragments: u32,

    /// bit0 = 조각, bit1 = 압축, bit2 = 암호화, bit3 = keepalive
    pub flags: u8,
}

impl FragmentHeader {
    /// 분할되지 않은 단일 메시지 헤더
    pub fn single(message_id: u32, flags: u8) -> Self {
        Self {
            message_id,
            fragment_index: 0,
            total_fragments: 1,
            flags: flags & !FLAG_FRAGMENT,
        }
    }

    /// keepalive 헤더
    pub fn keepalive(message_id: u32) -> Self {
        Self::single(message_id, FLAG_KEEPALIVE)
    }

    /// 조각 헤더
    pub fn fragment(message_id: u32, fragment_index: u32, total_fragments: u32, flags: u8) -> Self {
        Self {
            message_id,
            fragment_index,
            total_fragments,
            flags: flags | FLAG_FRAGMENT,
        }
    }

    pub fn is_fragment(&self) -> bool {
        self.flags & FLAG_FRAGMENT != 0
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    pub fn is_keepalive(&self) -> bool {
        self.flags & FLAG_KEEPALIVE != 0
    }

    /// 바이트로 직렬화
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(header_options().serialize(self)?)
    }

    /// 바이트에서 역직렬화 후 필드 검증
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FRAGMENT_HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "프래그먼트 헤더가 너무 짧음: {} bytes",
                bytes.len()
            )));
        }

        let header: Self = header_options().deserialize(&bytes[..FRAGMENT_HEADER_SIZE])?;

        if header.flags & !KNOWN_FLAGS != 0 {
            return Err(Error::Protocol(format!("알 수 없는 플래그: {:08b}", header.flags)));
        }
        if header.total_fragments == 0 || header.fragment_index >= header.total_fragments {
            return Err(Error::Protocol(format!(
                "잘못된 조각 위치: index={}, total={}",
                header.fragment_index, header.total_fragments
            )));
        }
        if header.is_keepalive() && header.flags != FLAG_KEEPALIVE {
            return Err(Error::Protocol(format!(
                "keepalive에 다른 플래그가 섞임: {:08b}",
                header.flags
            )));
        }
        if !header.is_fragment() && header.total_fragments != 1 {
            return Err(Error::FragmentMismatch {
                message_id: header.message_id,
                expected: 1,
                got: header.total_fragments,
            });
        }

        Ok(header)
    }
}

/// 헤더 + 본문 (데이터 프레임의 페이로드)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub header: FragmentHeader,
    pub body: Bytes,
}

impl Envelope {
    pub fn new(header: FragmentHeader, body: Bytes) -> Self {
        Self { header, body }
    }

    /// 바이트로 직렬화
    pub fn encode(&self) -> Result<Bytes> {
        let header = self.header.to_bytes()?;
        let mut buf = BytesMut::with_capacity(header.len() + self.body.len());
        buf.put_slice(&header);
        buf.put_slice(&self.body);
        Ok(buf.freeze())
    }

    /// 바이트에서 역직렬화
    pub fn decode(mut bytes: Bytes) -> Result<Self> {
        let header = FragmentHeader::from_bytes(&bytes)?;
        bytes.advance(FRAGMENT_HEADER_SIZE);
        Ok(Self {
            header,
            body: bytes,
        })
    }
}

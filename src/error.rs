//! 에러 타입 정의

use thiserror::Error;

use crate::crypto::CryptoError;

/// PRL 전송 코어 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    /// 상태 변경 전에 거부되는 입력 오류 (주소, 포트, 키/IV 크기 등)
    #[error("유효하지 않은 입력: {0}")]
    Validation(String),

    #[error("페이로드가 MTU를 초과함: size={size}, mtu={mtu}")]
    PayloadTooLarge { size: usize, mtu: usize },

    /// 잘못된 프레임 또는 엔벨로프
    #[error("프로토콜 에러: {0}")]
    Protocol(String),

    #[error("알 수 없는 메시지 ID: {message_id}")]
    UnknownMessage { message_id: u32 },

    #[error("프래그먼트 수 불일치: message_id={message_id}, expected={expected}, got={got}")]
    FragmentMismatch {
        message_id: u32,
        expected: u32,
        got: u32,
    },

    #[error("리소스 고갈: 최대 용량 {capacity}")]
    ResourceExhausted { capacity: usize },

    #[error("암호화 에러: {0}")]
    Crypto(#[from] CryptoError),

    #[error("압축 에러: {0}")]
    Compression(String),

    #[error("잘못된 상태에서 호출됨: op={op}, state={state}")]
    InvalidState { op: &'static str, state: String },

    #[error("연결 종료")]
    Closed,
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;

//! 전송 코어 설정

use crate::frame::FRAGMENT_HEADER_SIZE;
use crate::{Error, Result, DEFAULT_FRAGMENT_SIZE, DEFAULT_MTU, SEQUENCE_SIZE};

/// 조각 수 상한 계산에서 암호화 오버헤드로 잡아두는 바이트
const CIPHER_OVERHEAD_ALLOWANCE: usize = 64;

/// PRL 전송 코어 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 바인드 포트 (0이면 OS가 할당)
    pub port: u16,

    /// 수신 버퍼 크기 (바이트)
    pub buffer_size: usize,

    /// 프래그먼트 본문 최대 크기 (바이트)
    /// 처리된 메시지가 이보다 크면 분할됨
    pub fragment_size: usize,

    /// 미완성 메시지 조립 대기 타임아웃 (밀리초)
    pub fragment_timeout_ms: u64,

    /// 재전송 간격 (밀리초)
    pub resend_timeout_ms: u64,

    /// 최대 재전송 횟수. 초과 시 손실 처리
    pub max_resend_attempts: u32,

    /// 스케줄러 큐 최대 길이
    pub max_queue_size: usize,

    /// 최대 대역폭 (bytes/sec, 0이면 무제한)
    pub max_bandwidth_bytes_per_sec: u64,

    /// 한 번의 전송에 허용되는 최대 바이트
    pub mtu: usize,

    /// 손실률 등 파생 통계 갱신 주기 (밀리초)
    pub stats_interval_ms: u64,

    /// 압축 결과/원본 비율이 이 값보다 작을 때만 압축
    pub compression_ratio_threshold: f64,

    /// 이보다 작은 페이로드는 압축하지 않음
    pub min_compression_size: usize,

    /// 중복 수신 판별에 기억할 최근 시퀀스 번호 수
    pub dedup_window: usize,

    /// 메시지 하나의 최대 크기 (바이트). 조각 수 상한도 여기서 나옴
    pub max_message_size: usize,

    /// 송신이 이만큼 없으면 keepalive 전송 (밀리초, 0이면 끔)
    pub keepalive_interval_ms: u64,

    /// 수신이 이만큼 없으면 피어 타임아웃 (밀리초, 0이면 끔)
    pub connection_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 0,
            buffer_size: 64 * 1024,
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            fragment_timeout_ms: 5000,        // 5초
            resend_timeout_ms: 100,           // 100ms
            max_resend_attempts: 5,
            max_queue_size: 1000,
            max_bandwidth_bytes_per_sec: 0,   // 무제한
            mtu: DEFAULT_MTU,
            stats_interval_ms: 1000,          // 1초
            compression_ratio_threshold: 0.8, // 20% 이상 줄어야 압축
            min_compression_size: 64,
            dedup_window: 1024,
            max_message_size: 16 * 1024 * 1024, // 16MB
            keepalive_interval_ms: 1000,        // 1초
            connection_timeout_ms: 10_000,      // 10초
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 메시지 크기에 대한 프래그먼트 수 계산
    pub fn fragments_for(&self, size: usize) -> usize {
        if size == 0 {
            return 1;
        }
        (size + self.fragment_size - 1) / self.fragment_size
    }

    /// 한 메시지가 가질 수 있는 최대 조각 수
    ///
    /// 암호화가 붙이는 IV와 태그 몫으로 `CIPHER_OVERHEAD_ALLOWANCE` 바이트를 더 허용한다.
    pub fn max_fragments(&self) -> u32 {
        let fragment_size = self.fragment_size.max(1);
        let body = self.max_message_size.saturating_add(CIPHER_OVERHEAD_ALLOWANCE);
        let fragments = body / fragment_size + usize::from(body % fragment_size != 0);
        u32::try_from(fragments).unwrap_or(u32::MAX)
    }

    /// 한 프레임이 가질 수 있는 최대 크기 (시퀀스 + 엔벨로프 + 본문)
    pub fn max_frame_size(&self) -> usize {
        SEQUENCE_SIZE + FRAGMENT_HEADER_SIZE + self.fragment_size
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.fragment_size == 0 {
            return Err(Error::Validation("fragment_size는 0보다 커야 함".into()));
        }
        if self.max_frame_size() > self.mtu {
            return Err(Error::Validation(format!(
                "fragment_size {} + 헤더 {} 가 mtu {} 를 초과함",
                self.fragment_size,
                SEQUENCE_SIZE + FRAGMENT_HEADER_SIZE,
                self.mtu
            )));
        }
        if self.max_queue_size == 0 {
            return Err(Error::Validation("max_queue_size는 0보다 커야 함".into()));
        }
        if !(0.0..=1.0).contains(&self.compression_ratio_threshold) {
            return Err(Error::Validation(format!(
                "compression_ratio_threshold 범위 초과: {}",
                self.compression_ratio_threshold
            )));
        }
        if self.max_message_size == 0 {
            return Err(Error::Validation("max_message_size는 0보다 커야 함".into()));
        }
        if self.connection_timeout_ms > 0 && self.keepalive_interval_ms >= self.connection_timeout_ms {
            return Err(Error::Validation(format!(
                "keepalive_interval_ms {} 는 connection_timeout_ms {} 보다 작아야 함",
                self.keepalive_interval_ms, self.connection_timeout_ms
            )));
        }
        if self.buffer_size < self.mtu {
            return Err(Error::Validation(format!(
                "buffer_size {} 가 mtu {} 보다 작음",
                self.buffer_size, self.mtu
            )));
        }
        Ok(())
    }

    /// 실시간 게임용 저지연 설정
    pub fn low_latency() -> Self {
        Self {
            fragment_size: 1024,
            fragment_timeout_ms: 1000,
            resend_timeout_ms: 30,
            max_resend_attempts: 8,
            keepalive_interval_ms: 250,
            connection_timeout_ms: 3000,
            max_queue_size: 256,
            stats_interval_ms: 250,
            ..Self::default()
        }
    }

    /// 대용량 전송용 설정
    pub fn high_throughput() -> Self {
        Self {
            buffer_size: 256 * 1024,
            fragment_size: 8192,
            mtu: 9000,                        // 점보 프레임
            fragment_timeout_ms: 10_000,
            resend_timeout_ms: 200,
            max_queue_size: 10_000,
            ..Self::default()
        }
    }

    /// 불안정한 네트워크용 설정
    pub fn unstable_network() -> Self {
        Self {
            fragment_size: 512,               // 작은 프래그먼트
            fragment_timeout_ms: 15_000,
            resend_timeout_ms: 250,
            max_resend_attempts: 10,
            dedup_window: 4096,
            ..Self::default()
        }
    }
}

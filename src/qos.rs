//! 우선순위, 신뢰성 등급, QoS 프로필

use std::time::Duration;

/// 전송 긴급도. 숫자가 작을수록 먼저 처리됨
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
    /// 즉시 전달
    Critical = 0,
    High = 1,
    Medium = 2,
    Low = 3,
    /// 대역폭 여유가 있을 때만
    Background = 4,
}

impl Priority {
    /// 높은 순서대로 전체 목록
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
        Priority::Background,
    ];

    /// 우선순위별 버킷 인덱스
    pub fn index(self) -> usize {
        self as usize
    }
}

/// 스케줄러 메타데이터에 붙는 QoS 등급
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QosLevel {
    UltraLowLatency,
    LowLatency,
    Balanced,
    HighThroughput,
    Reliable,
}

/// 전달 보장 등급
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReliabilityClass {
    /// 전달 보장 없음
    Unreliable,
    /// 전달 보장 없음, 순서 번호만 부여
    UnreliableSequenced,
    /// 전달 보장
    Reliable,
    ReliableSequenced,
    ReliableOrdered,
}

impl ReliabilityClass {
    /// ACK 추적 대상 여부
    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            ReliabilityClass::Reliable
                | ReliabilityClass::ReliableSequenced
                | ReliabilityClass::ReliableOrdered
        )
    }
}

/// 한 번의 전송에 적용되는 정책 묶음
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QosProfile {
    pub priority: Priority,
    pub reliability: ReliabilityClass,
    /// 최대 재전송 횟수
    pub max_retries: u32,
    /// 스케줄러 데드라인 (밀리초)
    pub timeout_ms: u32,
    pub use_compression: bool,
    pub use_encryption: bool,
}

impl Default for QosProfile {
    fn default() -> Self {
        Self {
            priority: Priority::Medium,
            reliability: ReliabilityClass::Reliable,
            max_retries: 3,
            timeout_ms: 1000,   // 1초
            use_compression: true,
            use_encryption: true,
        }
    }
}

impl QosProfile {
    /// 위치 갱신 등 최신 값만 의미 있는 데이터
    pub fn realtime() -> Self {
        Self {
            priority: Priority::High,
            reliability: ReliabilityClass::UnreliableSequenced,
            max_retries: 0,
            timeout_ms: 50,
            use_compression: false,
            use_encryption: false,
        }
    }

    /// 반드시 도착해야 하는 제어 메시지
    pub fn control() -> Self {
        Self {
            priority: Priority::Critical,
            reliability: ReliabilityClass::ReliableOrdered,
            max_retries: 5,
            timeout_ms: 250,
            use_compression: false,
            use_encryption: true,
        }
    }

    /// 대용량 백그라운드 전송
    pub fn bulk() -> Self {
        Self {
            priority: Priority::Background,
            reliability: ReliabilityClass::Reliable,
            max_retries: 10,
            timeout_ms: 10_000,
            use_compression: true,
            use_encryption: true,
        }
    }

    /// 압축/암호화 없는 평문 프로필
    pub fn plain(priority: Priority, reliability: ReliabilityClass) -> Self {
        Self {
            priority,
            reliability,
            use_compression: false,
            use_encryption: false,
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.timeout_ms))
    }

    /// 우선순위에서 스케줄러 QoS 등급 유도
    pub fn level(&self) -> QosLevel {
        match (self.priority, self.reliability.is_reliable()) {
            (Priority::Critical, _) => QosLevel::UltraLowLatency,
            (Priority::High, _) => QosLevel::LowLatency,
            (Priority::Background, _) => QosLevel::HighThroughput,
            (_, true) => QosLevel::Reliable,
            (_, false) => QosLevel::Balanced,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::Low < Priority::Background);
        assert_eq!(Priority::Medium.index(), 2);
    }

    #[test]
    fn test_reliable_classes() {
        assert!(!ReliabilityClass::Unreliable.is_reliable());
        assert!(!ReliabilityClass::UnreliableSequenced.is_reliable());
        assert!(ReliabilityClass::Reliable.is_reliable());
        assert!(ReliabilityClass::ReliableOrdered.is_reliable());
    }

    #[test]
    fn test_level_mapping() {
        assert_eq!(QosProfile::control().level(), QosLevel::UltraLowLatency);
        assert_eq!(QosProfile::default().level(), QosLevel::Reliable);
        assert_eq!(
            QosProfile::plain(Priority::Low, ReliabilityClass::Unreliable).level(),
            QosLevel::Balanced
        );
    }
}

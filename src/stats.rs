//! 전송 통계
//!
//! 카운터는 단조 증가하고, 파생 값(손실률, 대역폭)은 정해진 주기로만 다시 계산된다.

use std::time::{Duration, Instant};

use crate::qos::Priority;

/// 고정 길이 윈도우 안의 바이트 집계
#[derive(Debug, Clone)]
pub struct RateWindow {
    /// 윈도우 길이
    window: Duration,

    /// 현재 윈도우 시작 시간
    started_at: Instant,

    /// 현재 윈도우에 기록된 바이트
    bytes: u64,

    /// 직전 윈도우의 바이트 (샘플)
    last_sample: u64,
}

impl RateWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            started_at: Instant::now(),
            bytes: 0,
            last_sample: 0,
        }
    }

    /// 1초 윈도우
    pub fn per_second() -> Self {
        Self::new(Duration::from_secs(1))
    }

    /// 윈도우가 끝났으면 샘플을 남기고 새 윈도우 시작
    fn roll(&mut self, now: Instant) -> bool {
        if now.duration_since(self.started_at) >= self.window {
            self.last_sample = self.bytes;
            self.bytes = 0;
            self.started_at = now;
            return true;
        }
        false
    }

    /// 바이트 기록 후 현재 윈도우 누적값 반환
    pub fn record(&mut self, bytes: u64, now: Instant) -> u64 {
        self.roll(now);
        self.bytes += bytes;
        self.bytes
    }

    /// 현재 윈도우 누적값
    pub fn current(&mut self, now: Instant) -> u64 {
        self.roll(now);
        self.bytes
    }

    /// 윈도우가 바뀌었으면 true (샘플 갱신 시점)
    pub fn resample(&mut self, now: Instant) -> bool {
        self.roll(now)
    }

    /// 직전 윈도우의 바이트
    pub fn last_sample(&self) -> u64 {
        self.last_sample
    }

    pub fn reset(&mut self, now: Instant) {
        self.started_at = now;
        self.bytes = 0;
        self.last_sample = 0;
    }
}

/// 신뢰성 채널 통계
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelStats {
    /// 첫 전송된 패킷 수 (재전송 제외)
    pub packets_sent: u64,

    /// 재전송 횟수
    pub packets_resent: u64,

    /// 수신한 데이터 프레임 수 (중복 포함)
    pub packets_received: u64,

    /// ACK 된 패킷 수
    pub packets_acked: u64,

    /// 재전송 한도를 넘어 손실 처리된 패킷 수
    pub packets_lost: u64,

    /// 중복 수신 수
    pub duplicates: u64,

    /// 보낸 ACK 프레임 수
    pub acks_sent: u64,

    pub bytes_sent: u64,
    pub bytes_received: u64,

    /// lost / max(sent, 1), 통계 주기마다 갱신
    pub packet_loss_ratio: f64,

    /// 평활 RTT (밀리초)
    pub rtt_ms: f64,
}

impl ChannelStats {
    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Sent: {} (+{} resent) | Recv: {} | Acked: {} | Lost: {} | Dup: {} | Loss: {:.2}% | RTT: {:.1}ms",
            self.packets_sent,
            self.packets_resent,
            self.packets_received,
            self.packets_acked,
            self.packets_lost,
            self.duplicates,
            self.packet_loss_ratio * 100.0,
            self.rtt_ms,
        )
    }
}

/// 파이프라인 통계
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub messages_prepared: u64,
    pub fragments_prepared: u64,
    pub messages_compressed: u64,
    pub messages_encrypted: u64,
    pub messages_delivered: u64,
    pub fragments_received: u64,
    pub duplicate_fragments: u64,
    pub keepalives_received: u64,

    /// 조각 수 상한을 넘어 거부된 조각
    pub oversized_rejected: u64,

    /// 타임아웃, 복호화/압축 해제 실패로 폐기된 메시지
    pub messages_dropped: u64,
}

/// 스케줄러 통계
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub enqueued: u64,
    pub dequeued: u64,

    /// 큐가 가득 차 거부된 수
    pub rejected: u64,

    /// 데드라인이 지나 폐기된 수
    pub expired: u64,
}

/// 시뮬레이션 링크 통계
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkStatistics {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub packets_corrupted: u64,
    pub packets_reordered: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,

    /// 수신측에서 체크섬 불일치로 확인된 손상 패킷
    pub corrupted_detected: u64,

    /// 수신 패킷 기준 누적 이동 평균 지연 (밀리초)
    pub average_latency_ms: f64,

    /// 1초마다 다시 샘플링되는 대역폭 (bytes/sec)
    pub current_bandwidth: u64,

    /// 우선순위별 송신 수
    pub packets_by_priority: [u64; 5],
}

impl LinkStatistics {
    /// 손실률
    pub fn packet_loss_rate(&self) -> f64 {
        if self.packets_sent == 0 {
            return 0.0;
        }
        self.packets_lost as f64 / self.packets_sent as f64
    }

    /// 손상률
    pub fn corruption_rate(&self) -> f64 {
        if self.packets_sent == 0 {
            return 0.0;
        }
        self.packets_corrupted as f64 / self.packets_sent as f64
    }

    pub fn reorder_rate(&self) -> f64 {
        if self.packets_sent == 0 {
            return 0.0;
        }
        self.packets_reordered as f64 / self.packets_sent as f64
    }

    pub fn sent_with_priority(&self, priority: Priority) -> u64 {
        self.packets_by_priority[priority.index()]
    }

    /// 수신 지연 샘플 반영 (누적 이동 평균)
    pub(crate) fn record_latency(&mut self, latency_ms: f64) {
        let n = self.packets_received as f64;
        if n <= 0.0 {
            return;
        }
        self.average_latency_ms += (latency_ms - self.average_latency_ms) / n;
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Sent: {} | Recv: {} | Lost: {} ({:.2}%) | Corrupted: {} | Reordered: {} | Latency: {:.1}ms | BW: {} B/s",
            self.packets_sent,
            self.packets_received,
            self.packets_lost,
            self.packet_loss_rate() * 100.0,
            self.packets_corrupted,
            self.packets_reordered,
            self.average_latency_ms,
            self.current_bandwidth,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_window_rolls() {
        let start = Instant::now();
        let mut window = RateWindow::new(Duration::from_millis(100));
        window.reset(start);

        assert_eq!(window.record(500, start), 500);
        assert_eq!(window.record(250, start + Duration::from_millis(50)), 750);

        // 윈도우 경과 -> 새 윈도우
        assert_eq!(window.record(10, start + Duration::from_millis(150)), 10);
        assert_eq!(window.last_sample(), 750);
    }

    #[test]
    fn test_cumulative_latency_average() {
        let mut stats = LinkStatistics::default();
        for latency in [10.0, 20.0, 30.0] {
            stats.packets_received += 1;
            stats.record_latency(latency);
        }
        assert!((stats.average_latency_ms - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_rates_without_traffic() {
        let stats = LinkStatistics::default();
        assert_eq!(stats.packet_loss_rate(), 0.0);
        assert_eq!(stats.corruption_rate(), 0.0);
    }
}

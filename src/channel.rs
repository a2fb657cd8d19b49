//! 피어별 신뢰성 채널
//!
//! - 시퀀스 번호 부여
//! - ACK 추적 및 재전송 타이밍
//! - 손실 통계
//!
//! 패킷 상태: `Queued -> PendingAck -> {Acknowledged | Lost}`

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::events::{Event, EventSink};
use crate::frame::Frame;
use crate::qos::{Priority, ReliabilityClass};
use crate::stats::ChannelStats;
use crate::{Config, Error, Result};

/// RTT 평활 계수
const RTT_ALPHA: f64 = 0.125;

/// 신뢰성 패킷 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketState {
    /// 아직 한 번도 전송되지 않음
    Queued,
    /// 전송됨, ACK 대기
    PendingAck,
    Acknowledged,
    Lost,
}

/// ACK 대기 중인 신뢰성 패킷
#[derive(Debug, Clone)]
pub struct PendingPacket {
    pub sequence_number: u32,
    pub reliability: ReliabilityClass,
    pub priority: Priority,
    pub payload: Bytes,

    /// 첫 전송 시간
    pub sent_at: Option<Instant>,

    /// 마지막 (재)전송 시간
    pub last_resend_at: Option<Instant>,

    /// 지금까지의 재전송 횟수
    pub resend_attempts: u32,

    /// 허용 재전송 횟수
    pub max_resend_attempts: u32,

    pub acknowledged: bool,
}

impl PendingPacket {
    fn state(&self) -> PacketState {
        if self.acknowledged {
            PacketState::Acknowledged
        } else if self.sent_at.is_some() {
            PacketState::PendingAck
        } else {
            PacketState::Queued
        }
    }

    /// 재전송 한도를 다 쓰고 마지막 재전송의 타임아웃까지 지났는지
    fn is_expired(&self, now: Instant, resend_timeout: Duration) -> bool {
        match self.last_resend_at {
            Some(last) => {
                !self.acknowledged
                    && self.resend_attempts >= self.max_resend_attempts
                    && now.duration_since(last) >= resend_timeout
            }
            None => false,
        }
    }
}

/// 송신 대기 프레임
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFrame {
    pub frame: Frame,
    pub reliability: ReliabilityClass,
    pub priority: Priority,

    /// 재전송 여부
    pub is_resend: bool,
}

/// 수신 프레임 처리 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// ACK 프레임. `known`은 대기 중이던 패킷과 일치했는지
    Acked { sequence_number: u32, known: bool },

    /// 파이프라인으로 넘길 데이터
    Data { sequence_number: u32, payload: Bytes },

    /// 이미 받은 데이터 (ACK만 다시 보냄)
    Duplicate { sequence_number: u32 },
}

/// 최근 수신 시퀀스 번호 기록 (중복 판별용)
#[derive(Debug)]
struct ReceivedWindow {
    order: VecDeque<u32>,
    seen: HashSet<u32>,
    capacity: usize,
}

impl ReceivedWindow {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// 새 번호면 true
    fn insert(&mut self, sequence_number: u32) -> bool {
        if self.capacity == 0 {
            return true;
        }
        if !self.seen.insert(sequence_number) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(sequence_number);
        true
    }

    fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}

/// 채널 내부 상태 (단일 락으로 보호)
#[derive(Debug)]
struct ChannelInner {
    /// ACK 대기 패킷
    pending: BTreeMap<u32, PendingPacket>,

    /// 한 번만 보내고 잊는 프레임 (비신뢰성 데이터, ACK)
    outgoing: VecDeque<OutgoingFrame>,

    next_sequence: u32,
    received: ReceivedWindow,
    stats: ChannelStats,
    last_stats_update: Instant,

    /// 평활 RTT (밀리초)
    srtt_ms: Option<f64>,

    closed: bool,
}

impl ChannelInner {
    /// 대기 중인 패킷과 겹치지 않는 다음 시퀀스 번호
    fn allocate_sequence(&mut self) -> u32 {
        while self.pending.contains_key(&self.next_sequence) {
            self.next_sequence = self.next_sequence.wrapping_add(1);
        }
        let sequence_number = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        sequence_number
    }

    fn record_rtt(&mut self, sample: Duration) {
        let sample_ms = sample.as_secs_f64() * 1000.0;
        let srtt = match self.srtt_ms {
            Some(srtt) => srtt + RTT_ALPHA * (sample_ms - srtt),
            None => sample_ms,
        };
        self.srtt_ms = Some(srtt);
        self.stats.rtt_ms = srtt;
    }
}

/// 피어별 신뢰성 채널
#[derive(Debug)]
pub struct PacketChannel {
    inner: Mutex<ChannelInner>,
    resend_timeout: Duration,
    max_resend_attempts: u32,
    stats_interval: Duration,
    events: Option<EventSink>,
}

impl PacketChannel {
    /// 새 채널 생성
    pub fn new(config: &Config) -> Self {
        Self {
            inner: Mutex::new(ChannelInner {
                pending: BTreeMap::new(),
                outgoing: VecDeque::new(),
                next_sequence: 0,
                received: ReceivedWindow::new(config.dedup_window),
                stats: ChannelStats::default(),
                last_stats_update: Instant::now(),
                srtt_ms: None,
                closed: false,
            }),
            resend_timeout: Duration::from_millis(config.resend_timeout_ms),
            max_resend_attempts: config.max_resend_attempts,
            stats_interval: Duration::from_millis(config.stats_interval_ms),
            events: None,
        }
    }

    /// 이벤트 싱크 연결
    pub fn with_events(mut self, sink: EventSink) -> Self {
        self.events = Some(sink);
        self
    }

    fn emit(&self, event: Event) {
        if let Some(sink) = &self.events {
            sink.emit(event);
        }
    }

    /// 기본 우선순위와 설정된 재전송 한도로 큐잉
    pub fn queue(&self, payload: Bytes, reliability: ReliabilityClass) -> Result<u32> {
        self.queue_with(payload, reliability, Priority::Medium, self.max_resend_attempts)
    }

    /// 페이로드에 시퀀스 번호를 부여하고 큐잉
    ///
    /// 신뢰성 등급이면 ACK 대기 목록에, 아니면 일회성 송신 목록에 넣는다.
    /// 빈 페이로드는 ACK와 구분할 수 없으므로 거부한다.
    pub fn queue_with(
        &self,
        payload: Bytes,
        reliability: ReliabilityClass,
        priority: Priority,
        max_resend_attempts: u32,
    ) -> Result<u32> {
        if payload.is_empty() {
            return Err(Error::Validation("빈 페이로드는 ACK와 구분할 수 없음".into()));
        }

        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::Closed);
        }

        let sequence_number = inner.allocate_sequence();

        if reliability.is_reliable() {
            inner.pending.insert(
                sequence_number,
                PendingPacket {
                    sequence_number,
                    reliability,
                    priority,
                    payload,
                    sent_at: None,
                    last_resend_at: None,
                    resend_attempts: 0,
                    max_resend_attempts,
                    acknowledged: false,
                },
            );
        } else {
            inner.outgoing.push_back(OutgoingFrame {
                frame: Frame::data(sequence_number, payload),
                reliability,
                priority,
                is_resend: false,
            });
        }

        trace!("패킷 큐잉: seq={}, {:?}", sequence_number, reliability);
        Ok(sequence_number)
    }

    /// 수신 프레임 처리
    ///
    /// 4바이트 프레임은 ACK, 나머지는 데이터. 데이터를 받으면 ACK를 일회성 목록에 넣는다.
    /// 4바이트 미만은 상태를 바꾸지 않고 `Protocol` 에러.
    pub fn process_incoming(&self, bytes: Bytes) -> Result<Incoming> {
        let frame = Frame::decode(bytes)?;
        let sequence_number = frame.sequence_number;
        let now = Instant::now();

        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::Closed);
        }

        if frame.is_ack() {
            let known = match inner.pending.remove(&sequence_number) {
                Some(mut packet) => {
                    packet.acknowledged = true;
                    inner.stats.packets_acked += 1;
                    // 재전송된 패킷은 어느 전송에 대한 ACK인지 모르므로 RTT 샘플에서 제외
                    if packet.resend_attempts == 0 {
                        if let Some(sent_at) = packet.sent_at {
                            inner.record_rtt(now.duration_since(sent_at));
                        }
                    }
                    true
                }
                None => false,
            };
            drop(inner);

            if known {
                self.emit(Event::PacketAcked { sequence_number });
            } else {
                trace!("알 수 없는 ACK: seq={}", sequence_number);
            }
            return Ok(Incoming::Acked {
                sequence_number,
                known,
            });
        }

        inner.stats.packets_received += 1;
        inner.stats.bytes_received += frame.encoded_len() as u64;
        inner.outgoing.push_back(OutgoingFrame {
            frame: Frame::ack(sequence_number),
            reliability: ReliabilityClass::Unreliable,
            priority: Priority::High,
            is_resend: false,
        });

        if !inner.received.insert(sequence_number) {
            inner.stats.duplicates += 1;
            return Ok(Incoming::Duplicate { sequence_number });
        }

        Ok(Incoming::Data {
            sequence_number,
            payload: frame.payload,
        })
    }

    /// 지금 보내야 할 프레임
    ///
    /// (a) 처음 보내는 신뢰성 패킷과 재전송 타임아웃이 지난 패킷,
    /// (b) 일회성 목록 전체 (이 호출로 비워짐)
    pub fn packets_due_for_send(&self, now: Instant) -> Vec<OutgoingFrame> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Vec::new();
        }

        let ChannelInner {
            pending,
            outgoing,
            stats,
            ..
        } = &mut *inner;

        let mut frames = Vec::with_capacity(pending.len() + outgoing.len());

        for packet in pending.values_mut() {
            let is_resend = match packet.last_resend_at {
                None => {
                    packet.sent_at = Some(now);
                    stats.packets_sent += 1;
                    false
                }
                Some(last)
                    if now.duration_since(last) >= self.resend_timeout
                        && packet.resend_attempts < packet.max_resend_attempts =>
                {
                    packet.resend_attempts += 1;
                    stats.packets_resent += 1;
                    true
                }
                Some(_) => continue,
            };

            packet.last_resend_at = Some(now);
            stats.bytes_sent += (crate::SEQUENCE_SIZE + packet.payload.len()) as u64;
            frames.push(OutgoingFrame {
                frame: Frame::data(packet.sequence_number, packet.payload.clone()),
                reliability: packet.reliability,
                priority: packet.priority,
                is_resend,
            });
        }

        for outgoing_frame in outgoing.drain(..) {
            if outgoing_frame.frame.is_ack() {
                stats.acks_sent += 1;
            } else {
                stats.packets_sent += 1;
            }
            stats.bytes_sent += outgoing_frame.frame.encoded_len() as u64;
            frames.push(outgoing_frame);
        }

        frames
    }

    /// 주기 작업: 손실 판정 및 파생 통계 갱신
    ///
    /// 손실 처리된 시퀀스 번호 목록을 반환한다.
    pub fn tick(&self, now: Instant) -> Vec<u32> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Vec::new();
        }

        let resend_timeout = self.resend_timeout;
        let lost: Vec<u32> = inner
            .pending
            .values()
            .filter(|packet| packet.is_expired(now, resend_timeout))
            .map(|packet| packet.sequence_number)
            .collect();

        for sequence_number in &lost {
            inner.pending.remove(sequence_number);
        }
        inner.stats.packets_lost += lost.len() as u64;

        if now.duration_since(inner.last_stats_update) >= self.stats_interval {
            inner.stats.packet_loss_ratio =
                inner.stats.packets_lost as f64 / inner.stats.packets_sent.max(1) as f64;
            inner.last_stats_update = now;
        }
        drop(inner);

        for &sequence_number in &lost {
            warn!("패킷 손실 처리: seq={}", sequence_number);
            self.emit(Event::PacketLost { sequence_number });
        }

        lost
    }

    /// 패킷 상태 조회 (종료 상태의 패킷은 목록에서 빠지므로 None)
    pub fn packet_state(&self, sequence_number: u32) -> Option<PacketState> {
        self.inner
            .lock()
            .pending
            .get(&sequence_number)
            .map(PendingPacket::state)
    }

    /// ACK 대기 패킷 수
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// 일회성 목록 길이
    pub fn outgoing_count(&self) -> usize {
        self.inner.lock().outgoing.len()
    }

    /// 평활 RTT
    pub fn rtt(&self) -> Option<Duration> {
        self.inner
            .lock()
            .srtt_ms
            .map(|ms| Duration::from_secs_f64(ms / 1000.0))
    }

    /// 통계 반환
    pub fn stats(&self) -> ChannelStats {
        self.inner.lock().stats.clone()
    }

    /// 채널 종료. 대기 중인 패킷을 모두 버리고 비활성화 (여러 번 호출해도 안전)
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        let discarded = inner.pending.len() + inner.outgoing.len();
        inner.pending.clear();
        inner.outgoing.clear();
        inner.received.clear();
        inner.closed = true;
        drop(inner);

        debug!("채널 종료: {} 패킷 폐기", discarded);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_channel;

    fn config() -> Config {
        Config {
            resend_timeout_ms: 100,
            max_resend_attempts: 5,
            stats_interval_ms: 1000,
            ..Config::default()
        }
    }

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let channel = PacketChannel::new(&config());
        let a = channel.queue(Bytes::from_static(b"a"), ReliabilityClass::Reliable).unwrap();
        let b = channel.queue(Bytes::from_static(b"b"), ReliabilityClass::Unreliable).unwrap();
        let c = channel.queue(Bytes::from_static(b"c"), ReliabilityClass::Reliable).unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_unreliable_sent_once() {
        let channel = PacketChannel::new(&config());
        channel
            .queue(Bytes::from_static(b"fire"), ReliabilityClass::Unreliable)
            .unwrap();

        let now = Instant::now();
        assert_eq!(channel.packets_due_for_send(now).len(), 1);
        assert!(channel.packets_due_for_send(now + ms(1000)).is_empty());
        assert_eq!(channel.pending_count(), 0);
    }

    #[test]
    fn test_resend_cadence_and_loss() {
        let (sink, events) = event_channel();
        let channel = PacketChannel::new(&config()).with_events(sink);
        let seq = channel
            .queue(Bytes::from_static(b"reliable"), ReliabilityClass::Reliable)
            .unwrap();
        assert_eq!(channel.packet_state(seq), Some(PacketState::Queued));

        let t0 = Instant::now();
        let first = channel.packets_due_for_send(t0);
        assert_eq!(first.len(), 1);
        assert!(!first[0].is_resend);
        assert_eq!(channel.packet_state(seq), Some(PacketState::PendingAck));

        // 타임아웃 전에는 다시 나오지 않음
        assert!(channel.packets_due_for_send(t0 + ms(50)).is_empty());

        for attempt in 1..=5u64 {
            let due = channel.packets_due_for_send(t0 + ms(100 * attempt));
            assert_eq!(due.len(), 1, "resend #{attempt}");
            assert!(due[0].is_resend);
            assert!(channel.tick(t0 + ms(100 * attempt)).is_empty());
        }

        // 한도 소진 후에는 더 보내지 않음
        assert!(channel.packets_due_for_send(t0 + ms(550)).is_empty());
        assert!(channel.tick(t0 + ms(550)).is_empty());

        assert_eq!(channel.tick(t0 + ms(600)), vec![seq]);
        assert!(channel.tick(t0 + ms(700)).is_empty());

        let stats = channel.stats();
        assert_eq!(stats.packets_lost, 1);
        assert_eq!(stats.packets_resent, 5);
        assert_eq!(channel.packet_state(seq), None);
        assert_eq!(
            events.drain(),
            vec![Event::PacketLost { sequence_number: seq }]
        );
    }

    #[test]
    fn test_ack_removes_pending() {
        let sender = PacketChannel::new(&config());
        let receiver = PacketChannel::new(&config());

        let seq = sender
            .queue(Bytes::from_static(b"hello"), ReliabilityClass::Reliable)
            .unwrap();
        let now = Instant::now();
        let frame = sender.packets_due_for_send(now).remove(0).frame;

        match receiver.process_incoming(frame.encode()).unwrap() {
            Incoming::Data { sequence_number, payload } => {
                assert_eq!(sequence_number, seq);
                assert_eq!(payload.as_ref(), b"hello");
            }
            other => panic!("unexpected {other:?}"),
        }

        let ack = receiver.packets_due_for_send(now).remove(0);
        assert!(ack.frame.is_ack());
        assert_eq!(ack.frame.encode().len(), 4);

        assert_eq!(
            sender.process_incoming(ack.frame.encode()).unwrap(),
            Incoming::Acked { sequence_number: seq, known: true }
        );
        assert_eq!(sender.pending_count(), 0);
        assert!(sender.packets_due_for_send(now + ms(500)).is_empty());
        assert!(sender.rtt().is_some());
        assert_eq!(sender.stats().packets_acked, 1);
    }

    #[test]
    fn test_duplicate_is_reacked_not_redelivered() {
        let channel = PacketChannel::new(&config());
        let frame = Frame::data(42, Bytes::from_static(b"once")).encode();

        assert!(matches!(
            channel.process_incoming(frame.clone()).unwrap(),
            Incoming::Data { sequence_number: 42, .. }
        ));
        assert_eq!(
            channel.process_incoming(frame).unwrap(),
            Incoming::Duplicate { sequence_number: 42 }
        );

        let acks = channel.packets_due_for_send(Instant::now());
        assert_eq!(acks.len(), 2);
        assert!(acks.iter().all(|f| f.frame.is_ack()));
        assert_eq!(channel.stats().duplicates, 1);
    }

    #[test]
    fn test_malformed_frame_leaves_state_unchanged() {
        let channel = PacketChannel::new(&config());
        let err = channel.process_incoming(Bytes::from_static(&[0, 1])).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));

        assert_eq!(channel.stats(), ChannelStats::default());
        assert_eq!(channel.outgoing_count(), 0);
    }

    #[test]
    fn test_loss_ratio_updated_on_interval() {
        let config = Config {
            max_resend_attempts: 0,
            ..config()
        };
        let channel = PacketChannel::new(&config);
        channel.queue(Bytes::from_static(b"x"), ReliabilityClass::Reliable).unwrap();
        channel.queue(Bytes::from_static(b"y"), ReliabilityClass::Unreliable).unwrap();

        let t0 = Instant::now();
        channel.packets_due_for_send(t0);
        assert_eq!(channel.tick(t0 + ms(100)).len(), 1);

        // 통계 주기 경과 시에만 갱신
        channel.tick(t0 + ms(1100));
        assert!((channel.stats().packet_loss_ratio - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_close_is_idempotent() {
        let channel = PacketChannel::new(&config());
        channel.queue(Bytes::from_static(b"a"), ReliabilityClass::Reliable).unwrap();
        channel.close();
        channel.close();

        assert!(channel.is_closed());
        assert_eq!(channel.pending_count(), 0);
        assert!(matches!(
            channel.queue(Bytes::from_static(b"b"), ReliabilityClass::Reliable),
            Err(Error::Closed)
        ));
    }

    #[test]
    fn test_empty_payload_rejected() {
        let channel = PacketChannel::new(&config());
        assert!(matches!(
            channel.queue(Bytes::new(), ReliabilityClass::Reliable),
            Err(Error::Validation(_))
        ));
    }
}

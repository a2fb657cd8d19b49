//! 엔드포인트 - 파이프라인, 신뢰성 채널, 스케줄러, 원시 전송 조합
//!
//! 송신: 페이로드 -> 파이프라인 -> 채널(시퀀스) -> 스케줄러 -> 전송
//! 수신: 전송 -> 채널(ACK/중복) -> 파이프라인(조립) -> 전달 큐
//!
//! 타이머는 없다. 호출자가 `poll`을 주기적으로 불러 재전송, 손실 판정,
//! 조립 타임아웃, keepalive, 피어 타임아웃, 스케줄러 배출을 진행시킨다.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::channel::{Incoming, PacketChannel};
use crate::codec::Compressor;
use crate::crypto::Cipher;
use crate::events::{event_channel, Event, EventReceiver, EventSink};
use crate::pipeline::TransportPipeline;
use crate::qos::{Priority, QosProfile, ReliabilityClass};
use crate::scheduler::{PacketMetadata, PacketScheduler};
use crate::stats::{ChannelStats, PipelineStats, SchedulerStats};
use crate::transport::Transport;
use crate::{Config, Error, Result};

/// 엔드포인트 통계 묶음
#[derive(Debug, Clone, Default)]
pub struct EndpointStats {
    pub channel: ChannelStats,
    pub pipeline: PipelineStats,
    pub scheduler: SchedulerStats,
}

/// 한 번의 `poll` 결과
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollOutcome {
    /// 전송 계층에서 읽은 프레임
    pub frames_received: usize,

    /// 완성되어 전달 큐에 들어간 메시지
    pub messages_delivered: usize,

    /// 전송 계층으로 내보낸 프레임
    pub frames_sent: usize,

    /// 이번에 손실 처리된 신뢰성 패킷
    pub packets_lost: usize,

    /// 수신 중 발생한 전송 에러 (수신만 건너뛰고 나머지 작업은 계속)
    pub receive_errors: usize,

    /// 이번에 큐잉한 keepalive
    pub keepalives_sent: usize,
}

/// 마지막 송수신 시각
#[derive(Debug)]
struct Activity {
    last_sent: Instant,
    last_received: Instant,
    timed_out: bool,
}

/// 피어 하나와 통신하는 엔드포인트
pub struct Endpoint<T: Transport> {
    transport: T,
    channel: PacketChannel,
    pipeline: TransportPipeline,
    scheduler: PacketScheduler,
    events: EventReceiver,
    sink: EventSink,

    /// 스케줄러에 넣은 프레임의 유효 시간
    frame_lifetime: Duration,

    /// 메시지별 재전송 한도의 상한
    max_resend_attempts: u32,

    /// 0이면 끔
    keepalive_interval: Duration,
    connection_timeout: Duration,

    activity: Mutex<Activity>,
    delivered: Mutex<VecDeque<Bytes>>,
}

impl<T: Transport> std::fmt::Debug for Endpoint<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("pipeline", &self.pipeline)
            .field("pending", &self.channel.pending_count())
            .field("scheduled", &self.scheduler.len())
            .finish()
    }
}

impl<T: Transport> Endpoint<T> {
    /// 설정 검증 후 엔드포인트 생성 (압축/암호화 없음)
    pub fn new(config: &Config, transport: T) -> Result<Self> {
        config.validate()?;

        let (sink, events) = event_channel();
        let created_at = Instant::now();
        Ok(Self {
            transport,
            channel: PacketChannel::new(config).with_events(sink.clone()),
            pipeline: TransportPipeline::new(config).with_events(sink.clone()),
            scheduler: PacketScheduler::new(config).with_events(sink.clone()),
            events,
            sink,
            frame_lifetime: Duration::from_millis(config.resend_timeout_ms),
            max_resend_attempts: config.max_resend_attempts,
            keepalive_interval: Duration::from_millis(config.keepalive_interval_ms),
            connection_timeout: Duration::from_millis(config.connection_timeout_ms),
            activity: Mutex::new(Activity {
                last_sent: created_at,
                last_received: created_at,
                timed_out: false,
            }),
            delivered: Mutex::new(VecDeque::new()),
        })
    }

    /// 압축기 연결
    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.pipeline = self.pipeline.with_compressor(compressor);
        self
    }

    /// 암호화기와 키 연결
    pub fn with_cipher(mut self, cipher: Arc<dyn Cipher>, key: &[u8]) -> Result<Self> {
        self.pipeline = self.pipeline.with_cipher(cipher, key)?;
        Ok(self)
    }

    /// 메시지 송신 큐잉. 부여된 시퀀스 번호 목록 반환
    ///
    /// 재전송 한도는 프로파일 값과 설정의 `max_resend_attempts` 중 작은 쪽.
    /// 조각 k의 큐잉이 실패하면 k 이후 조각은 버리고, 이미 큐잉된 조각은 그대로 둔다.
    pub fn send(&self, payload: &[u8], qos: &QosProfile) -> Result<Vec<u32>> {
        let wire = self.pipeline.prepare_outbound(payload, qos)?;
        let max_retries = qos.max_retries.min(self.max_resend_attempts);

        let mut sequence_numbers = Vec::with_capacity(wire.len());
        for (index, fragment) in wire.into_iter().enumerate() {
            match self
                .channel
                .queue_with(fragment, qos.reliability, qos.priority, max_retries)
            {
                Ok(sequence_number) => sequence_numbers.push(sequence_number),
                Err(e) => {
                    warn!(
                        "조각 큐잉 실패, 나머지 중단: index={}, queued={}: {}",
                        index,
                        sequence_numbers.len(),
                        e
                    );
                    return Err(e);
                }
            }
        }
        Ok(sequence_numbers)
    }

    /// 수신, 주기 작업, 송신을 한 번 진행
    pub fn poll(&self, now: Instant) -> Result<PollOutcome> {
        if self.transport.is_closed() {
            return Err(Error::Closed);
        }
        let mut outcome = PollOutcome::default();

        // 1. 수신. 종료 외의 전송 에러는 이번 수신만 중단
        loop {
            match self.transport.try_receive() {
                Ok(Some(bytes)) => {
                    outcome.frames_received += 1;
                    if self.handle_incoming(bytes) {
                        outcome.messages_delivered += 1;
                    }
                }
                Ok(None) => break,
                Err(Error::Closed) => return Err(Error::Closed),
                Err(e) => {
                    warn!("수신 실패, 이번 poll의 수신 중단: {}", e);
                    outcome.receive_errors += 1;
                    break;
                }
            }
        }
        if outcome.frames_received > 0 {
            let mut activity = self.activity.lock();
            activity.last_received = now;
            activity.timed_out = false;
        }

        // 2. 손실 판정, 조립 타임아웃, 피어 타임아웃, keepalive
        outcome.packets_lost = self.channel.tick(now).len();
        self.pipeline.sweep_expired_fragments(now);
        self.check_peer_timeout(now);
        if self.keepalive_due(now) {
            match self.queue_keepalive() {
                Ok(()) => outcome.keepalives_sent += 1,
                Err(e) => debug!("keepalive 큐잉 실패: {}", e),
            }
        }

        // 3. 보낼 프레임을 스케줄러로
        let deadline = now + self.frame_lifetime;
        for outgoing in self.channel.packets_due_for_send(now) {
            let bytes = outgoing.frame.encode();
            let metadata = PacketMetadata {
                priority: outgoing.priority,
                qos: QosProfile::plain(outgoing.priority, outgoing.reliability).level(),
                deadline,
                size: bytes.len(),
                sequence_number: outgoing.frame.sequence_number,
                requires_ack: outgoing.reliability.is_reliable() && !outgoing.frame.is_ack(),
            };
            if !self.scheduler.enqueue(bytes, metadata) {
                debug!(
                    "스케줄러 거부: seq={}, resend={}",
                    outgoing.frame.sequence_number, outgoing.is_resend
                );
            }
        }

        // 4. 대역폭 예산 안에서 배출
        while !self.scheduler.is_over_budget(now) {
            let Some((bytes, metadata)) = self.scheduler.dequeue_at(now) else {
                break;
            };

            let reliability = if metadata.requires_ack {
                ReliabilityClass::Reliable
            } else {
                ReliabilityClass::Unreliable
            };
            match self
                .transport
                .send_with(&bytes, &QosProfile::plain(metadata.priority, reliability))
            {
                Ok(sent) => {
                    self.scheduler.update_bandwidth_usage_at(sent as u64, now);
                    outcome.frames_sent += 1;
                }
                Err(e) => warn!("프레임 송신 실패: seq={}: {}", metadata.sequence_number, e),
            }
        }
        if outcome.frames_sent > 0 {
            self.activity.lock().last_sent = now;
        }

        Ok(outcome)
    }

    fn keepalive_due(&self, now: Instant) -> bool {
        !self.keepalive_interval.is_zero()
            && now.saturating_duration_since(self.activity.lock().last_sent) >= self.keepalive_interval
    }

    /// 빈 keepalive 엔벨로프를 비신뢰, 낮은 우선순위로 큐잉
    fn queue_keepalive(&self) -> Result<()> {
        let envelope = self.pipeline.prepare_keepalive()?;
        self.channel
            .queue_with(envelope, ReliabilityClass::Unreliable, Priority::Low, 0)?;
        Ok(())
    }

    /// 타임아웃 동안 수신이 없으면 `PeerTimedOut`을 한 번만 발행
    fn check_peer_timeout(&self, now: Instant) {
        if self.connection_timeout.is_zero() {
            return;
        }

        let silent_for = {
            let mut activity = self.activity.lock();
            let silent_for = now.saturating_duration_since(activity.last_received);
            if activity.timed_out || silent_for < self.connection_timeout {
                return;
            }
            activity.timed_out = true;
            silent_for
        };

        warn!("피어 응답 없음: {}ms", silent_for.as_millis());
        self.sink.emit(Event::PeerTimedOut {
            silent_for_ms: silent_for.as_millis() as u64,
        });
    }

    /// 연결 타임아웃이 지나도록 상대가 조용한지
    pub fn is_timed_out(&self) -> bool {
        self.activity.lock().timed_out
    }

    /// 수신 프레임 하나 처리. 메시지가 완성되면 true
    fn handle_incoming(&self, bytes: Bytes) -> bool {
        let payload = match self.channel.process_incoming(bytes) {
            Ok(Incoming::Data { payload, .. }) => payload,
            Ok(Incoming::Acked { .. }) | Ok(Incoming::Duplicate { .. }) => return false,
            Err(e) => {
                debug!("잘못된 프레임 무시: {}", e);
                return false;
            }
        };

        match self.pipeline.consume_inbound(payload) {
            Ok(Some(message)) => {
                self.delivered.lock().push_back(message);
                true
            }
            Ok(None) => false,
            Err(e) => {
                debug!("메시지 처리 실패: {}", e);
                false
            }
        }
    }

    /// 완성된 메시지 하나
    pub fn recv(&self) -> Option<Bytes> {
        self.delivered.lock().pop_front()
    }

    /// 완성된 메시지 전부
    pub fn drain_received(&self) -> Vec<Bytes> {
        self.delivered.lock().drain(..).collect()
    }

    /// 호출자가 폴링하는 이벤트 큐
    pub fn events(&self) -> &EventReceiver {
        &self.events
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.channel.rtt()
    }

    /// ACK 대기 패킷 수
    pub fn pending_count(&self) -> usize {
        self.channel.pending_count()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn stats(&self) -> EndpointStats {
        EndpointStats {
            channel: self.channel.stats(),
            pipeline: self.pipeline.stats(),
            scheduler: self.scheduler.stats(),
        }
    }

    /// 모든 구성요소 종료 (여러 번 호출해도 안전)
    pub fn close(&self) {
        self.channel.close();
        self.scheduler.close();
        self.pipeline.clear();
        self.transport.close();
        self.delivered.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use crate::link::NetworkConditionProfile;
    use crate::network::SimNetwork;
    use crate::qos::Priority;
    use crate::transport::LinkTransport;

    fn pair(network: &SimNetwork, config: &Config) -> (Endpoint<LinkTransport>, Endpoint<LinkTransport>) {
        let a = network.create_link_with_seed(7100, 1).unwrap();
        let b = network.create_link_with_seed(7101, 2).unwrap();
        let ta = LinkTransport::connect(a.clone(), b.local_addr().unwrap()).unwrap();
        let tb = LinkTransport::connect(b, a.local_addr().unwrap()).unwrap();
        (
            Endpoint::new(config, ta).unwrap(),
            Endpoint::new(config, tb).unwrap(),
        )
    }

    fn run(network: &SimNetwork, endpoints: [&Endpoint<LinkTransport>; 2], rounds: usize, start: Instant, step: Duration) -> Instant {
        let mut now = start;
        for _ in 0..rounds {
            for endpoint in endpoints {
                endpoint.poll(now).unwrap();
            }
            network.step(now);
            now += step;
        }
        now
    }

    #[test]
    fn test_reliable_message_is_acked() {
        let network = SimNetwork::new();
        let (a, b) = pair(&network, &Config::default());

        let qos = QosProfile::plain(Priority::High, ReliabilityClass::Reliable);
        a.send(b"hello endpoint", &qos).unwrap();
        assert_eq!(a.pending_count(), 1);

        run(&network, [&a, &b], 4, Instant::now(), Duration::from_millis(10));

        assert_eq!(b.recv().unwrap().as_ref(), b"hello endpoint");
        assert_eq!(a.pending_count(), 0);
        assert!(a.rtt().is_some());
        assert!(a.events().drain().contains(&Event::PacketAcked { sequence_number: 0 }));
    }

    #[test]
    fn test_large_message_fragments_end_to_end() {
        let network = SimNetwork::new();
        let config = Config {
            fragment_size: 256,
            ..Config::default()
        };
        let (a, b) = pair(&network, &config);

        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 97) as u8).collect();
        let seqs = a
            .send(&payload, &QosProfile::plain(Priority::Medium, ReliabilityClass::Reliable))
            .unwrap();
        assert_eq!(seqs.len(), 20);

        run(&network, [&a, &b], 4, Instant::now(), Duration::from_millis(10));
        assert_eq!(b.recv().unwrap().as_ref(), payload.as_slice());
    }

    #[test]
    fn test_total_loss_surfaces_packet_lost() {
        let network = SimNetwork::new();
        let config = Config {
            resend_timeout_ms: 10,
            max_resend_attempts: 2,
            ..Config::default()
        };
        let (a, b) = pair(&network, &config);

        let link = a.transport().link().clone();
        link.set_network_condition(NetworkConditionProfile {
            packet_loss: 1.0,
            ..NetworkConditionProfile::default()
        })
        .unwrap();
        link.enable_simulation(true);

        a.send(b"doomed", &QosProfile {
            max_retries: 2,
            ..QosProfile::plain(Priority::Medium, ReliabilityClass::Reliable)
        })
        .unwrap();

        run(&network, [&a, &b], 10, Instant::now(), Duration::from_millis(10));

        assert!(b.recv().is_none());
        assert_eq!(a.stats().channel.packets_lost, 1);
        assert!(a.events().drain().contains(&Event::PacketLost { sequence_number: 0 }));
    }

    #[test]
    fn test_resend_bound_is_capped_by_config() {
        let network = SimNetwork::new();
        let config = Config {
            resend_timeout_ms: 10,
            max_resend_attempts: 1,
            ..Config::default()
        };
        let (a, b) = pair(&network, &config);

        let link = a.transport().link().clone();
        link.set_network_condition(NetworkConditionProfile {
            packet_loss: 1.0,
            ..NetworkConditionProfile::default()
        })
        .unwrap();
        link.enable_simulation(true);

        // 프로파일은 10회를 허용하지만 설정이 1회로 제한
        a.send(b"capped", &QosProfile {
            max_retries: 10,
            ..QosProfile::plain(Priority::Critical, ReliabilityClass::Reliable)
        })
        .unwrap();

        run(&network, [&a, &b], 10, Instant::now(), Duration::from_millis(10));

        let stats = a.stats().channel;
        assert_eq!(stats.packets_resent, 1);
        assert_eq!(stats.packets_lost, 1);
    }

    #[test]
    fn test_quiet_endpoint_sends_keepalive() {
        let network = SimNetwork::new();
        let config = Config {
            keepalive_interval_ms: 100,
            connection_timeout_ms: 1000,
            ..Config::default()
        };
        let (a, b) = pair(&network, &config);

        let start = Instant::now();
        let mut keepalives = 0;
        let mut now = start;
        for _ in 0..6 {
            keepalives += a.poll(now).unwrap().keepalives_sent;
            b.poll(now).unwrap();
            network.step(now);
            now += Duration::from_millis(50);
        }

        assert!(keepalives >= 1);
        assert!(b.stats().pipeline.keepalives_received >= 1);
        assert!(b.recv().is_none());
        assert_eq!(a.pending_count(), 0);
        assert!(!a.is_timed_out());
        assert!(!b.is_timed_out());
    }

    #[test]
    fn test_silent_peer_times_out_once() {
        let network = SimNetwork::new();
        let config = Config {
            keepalive_interval_ms: 0,
            connection_timeout_ms: 200,
            ..Config::default()
        };
        let (a, b) = pair(&network, &config);

        let start = Instant::now();
        for offset in [0u64, 100, 250, 400, 600] {
            a.poll(start + Duration::from_millis(offset)).unwrap();
        }

        let timeouts = a
            .events()
            .drain()
            .into_iter()
            .filter(|event| matches!(event, Event::PeerTimedOut { .. }))
            .count();
        assert_eq!(timeouts, 1);
        assert!(a.is_timed_out());

        // 상대가 다시 말하면 해제
        let later = start + Duration::from_millis(700);
        b.send(b"back", &QosProfile::plain(Priority::High, ReliabilityClass::Unreliable))
            .unwrap();
        b.poll(later).unwrap();
        network.step(later);
        a.poll(later).unwrap();
        assert!(!a.is_timed_out());
        assert_eq!(a.recv().unwrap().as_ref(), b"back");
    }

    /// 첫 수신만 실패하고 송신은 기록하는 전송
    #[derive(Default)]
    struct FlakyTransport {
        failed_once: std::sync::atomic::AtomicBool,
        sent: Mutex<Vec<Bytes>>,
    }

    impl Transport for FlakyTransport {
        fn send(&self, payload: &[u8]) -> Result<usize> {
            self.sent.lock().push(Bytes::copy_from_slice(payload));
            Ok(payload.len())
        }

        fn try_receive(&self) -> Result<Option<Bytes>> {
            use std::sync::atomic::Ordering;

            if self.failed_once.swap(true, Ordering::Relaxed) {
                Ok(None)
            } else {
                Err(Error::Io(std::io::ErrorKind::ConnectionRefused.into()))
            }
        }

        fn close(&self) {}

        fn is_closed(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_receive_error_does_not_block_sending() {
        let endpoint = Endpoint::new(&Config::default(), FlakyTransport::default()).unwrap();
        endpoint
            .send(b"still goes out", &QosProfile::plain(Priority::High, ReliabilityClass::Reliable))
            .unwrap();

        let outcome = endpoint.poll(Instant::now()).unwrap();
        assert_eq!(outcome.receive_errors, 1);
        assert_eq!(outcome.frames_sent, 1);
        assert_eq!(endpoint.transport().sent.lock().len(), 1);
    }

    #[test]
    fn test_close_is_idempotent() {
        let network = SimNetwork::new();
        let (a, _b) = pair(&network, &Config::default());
        a.close();
        a.close();
        assert!(a.send(b"x", &QosProfile::default()).is_err());
        assert!(matches!(a.poll(Instant::now()), Err(Error::Closed)));
    }
}

//! 네트워크 상태 에뮬레이터 (시뮬레이션 링크)
//!
//! 실제 소켓과 같은 송수신/QoS 인터페이스를 제공하면서 손실, 손상, 지연,
//! 순서 뒤바뀜, 대역폭 제한을 흉내낸다. 송신 큐에서 수신 큐로 옮기는 "와이어"
//! 단계는 [`crate::network::SimNetwork`]가 맡는다.
//!
//! 상태: `Closed -> Bound -> {Connected | Listening} -> Closed`

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace};

use crate::qos::{Priority, QosProfile};
use crate::stats::{LinkStatistics, RateWindow};
use crate::{Error, Result, DEFAULT_MTU};

/// 시퀀스 번호 생성기
///
/// 같은 생성기를 공유하는 링크끼리는 번호 공간을 공유한다.
#[derive(Debug, Default)]
pub struct SequenceGenerator {
    next: AtomicU32,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(start: u32) -> Self {
        Self {
            next: AtomicU32::new(start),
        }
    }

    /// 다음 번호 (u32 범위에서 순환)
    pub fn next(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// 링크 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Closed,
    Bound,
    Connected,
    Listening,
}

/// 에뮬레이션할 네트워크 상태
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkConditionProfile {
    /// 손실 확률 (0.0 ~ 1.0)
    pub packet_loss: f64,

    /// 기본 지연 (밀리초)
    pub latency_ms: f64,

    /// 지연 변동폭 (밀리초, ±)
    pub jitter_ms: f64,

    /// 대역폭 상한 (bytes/sec, 0이면 무제한)
    pub bandwidth_bytes_per_sec: u64,

    /// 손상 확률 (0.0 ~ 1.0)
    pub corruption_prob: f64,

    /// 순서 뒤바뀜 확률 (0.0 ~ 1.0)
    pub reorder_prob: f64,

    /// 한 번의 송신에 허용되는 최대 바이트
    pub mtu: usize,
}

impl Default for NetworkConditionProfile {
    fn default() -> Self {
        Self {
            packet_loss: 0.0,
            latency_ms: 0.0,
            jitter_ms: 0.0,
            bandwidth_bytes_per_sec: 0,
            corruption_prob: 0.0,
            reorder_prob: 0.0,
            mtu: DEFAULT_MTU,
        }
    }
}

impl NetworkConditionProfile {
    /// 같은 랙 안의 LAN
    pub fn lan() -> Self {
        Self {
            latency_ms: 1.0,
            jitter_ms: 0.5,
            ..Self::default()
        }
    }

    /// 일반적인 Wi-Fi
    pub fn wifi() -> Self {
        Self {
            packet_loss: 0.01,
            latency_ms: 15.0,
            jitter_ms: 10.0,
            reorder_prob: 0.01,
            ..Self::default()
        }
    }

    /// 혼잡한 모바일 망
    pub fn congested() -> Self {
        Self {
            packet_loss: 0.05,
            latency_ms: 120.0,
            jitter_ms: 60.0,
            bandwidth_bytes_per_sec: 256 * 1024,
            corruption_prob: 0.001,
            reorder_prob: 0.05,
            ..Self::default()
        }
    }

    /// 확률 범위, 지연 범위, MTU 검증
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("packet_loss", self.packet_loss),
            ("corruption_prob", self.corruption_prob),
            ("reorder_prob", self.reorder_prob),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Validation(format!("{} 범위 초과: {}", name, value)));
            }
        }
        for (name, value) in [("latency_ms", self.latency_ms), ("jitter_ms", self.jitter_ms)] {
            if !value.is_finite() || !(0.0..=MAX_DELAY_MS).contains(&value) {
                return Err(Error::Validation(format!(
                    "{} 는 0 이상 {} 이하의 유한값이어야 함: {}",
                    name, MAX_DELAY_MS, value
                )));
            }
        }
        if self.mtu == 0 {
            return Err(Error::Validation("mtu는 0보다 커야 함".into()));
        }
        Ok(())
    }
}

/// 지연, 지터, 대역폭 지연의 상한 (1시간, 밀리초)
pub const MAX_DELAY_MS: f64 = 3_600_000.0;

/// 와이어 위의 시뮬레이션 패킷
#[derive(Debug, Clone)]
pub struct SimPacket {
    pub payload: Bytes,
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub sequence_number: u32,
    pub priority: Priority,

    /// 송신 시각
    pub sent_at: Instant,

    /// 지연과 대역폭 제한을 반영한 도착 예정 시각
    pub deliver_at: Instant,

    /// 손상 전 페이로드의 CRC32
    pub checksum: u32,

    pub corrupted: bool,
}

impl SimPacket {
    /// 체크섬 검증
    pub fn verify_checksum(&self) -> bool {
        crc32fast::hash(&self.payload) == self.checksum
    }
}

/// 수신 패킷 콜백 (링크당 하나)
pub type PacketCallback = Arc<dyn Fn(&Bytes, SocketAddr) + Send + Sync>;

struct LinkInner {
    state: LinkState,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,

    simulation_enabled: bool,
    condition: NetworkConditionProfile,

    default_qos: QosProfile,
    qos_profiles: HashMap<u32, QosProfile>,

    /// 우선순위별 송신 큐 (5개)
    send_queues: [VecDeque<SimPacket>; 5],
    receive_queue: VecDeque<SimPacket>,

    rng: StdRng,

    /// 1초 윈도우 송신 바이트 (대역폭 제한 및 샘플링)
    traffic: RateWindow,

    stats: LinkStatistics,
    packet_callback: Option<PacketCallback>,
}

impl LinkInner {
    fn require_bound(&self, op: &'static str) -> Result<SocketAddr> {
        match (self.state, self.local_addr) {
            (LinkState::Closed, _) | (_, None) => Err(Error::InvalidState {
                op,
                state: format!("{:?}", self.state),
            }),
            (_, Some(addr)) => Ok(addr),
        }
    }

    fn connected_remote(&self, op: &'static str) -> Result<SocketAddr> {
        match (self.state, self.remote_addr) {
            (LinkState::Connected, Some(addr)) => Ok(addr),
            _ => Err(Error::InvalidState {
                op,
                state: format!("{:?}", self.state),
            }),
        }
    }

    /// 지연 + 지터 (음수는 0으로)
    fn sample_latency(&mut self) -> Duration {
        let mut latency = self.condition.latency_ms;
        if self.condition.jitter_ms > 0.0 {
            latency += (self.rng.gen::<f64>() * 2.0 - 1.0) * self.condition.jitter_ms;
        }
        Duration::from_secs_f64(latency.clamp(0.0, MAX_DELAY_MS) / 1000.0)
    }

    /// 가장 최근에 들어간 Medium 패킷 두 개를 맞바꿈
    fn reorder_medium(&mut self) -> bool {
        let queue = &mut self.send_queues[Priority::Medium.index()];
        let len = queue.len();
        if len < 2 {
            return false;
        }
        queue.swap(len - 1, len - 2);
        true
    }

    /// 현재 윈도우 사용량이 상한을 넘은 만큼 비례 지연
    fn shaping_delay(&mut self, bytes: u64, now: Instant) -> Duration {
        let window_bytes = self.traffic.record(bytes, now);
        self.refresh_bandwidth(now);

        let limit = self.condition.bandwidth_bytes_per_sec;
        if limit == 0 || window_bytes <= limit {
            return Duration::ZERO;
        }
        let delay_ms = (window_bytes - limit) as f64 / limit as f64 * 1000.0;
        Duration::from_secs_f64(delay_ms.min(MAX_DELAY_MS) / 1000.0)
    }

    fn refresh_bandwidth(&mut self, now: Instant) {
        self.traffic.resample(now);
        self.stats.current_bandwidth = self.traffic.last_sample();
    }
}

/// 시뮬레이션 링크
pub struct SimulatedLink {
    inner: Mutex<LinkInner>,
    sequence: Arc<SequenceGenerator>,
}

impl std::fmt::Debug for SimulatedLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SimulatedLink")
            .field("state", &inner.state)
            .field("local_addr", &inner.local_addr)
            .field("remote_addr", &inner.remote_addr)
            .field("simulation_enabled", &inner.simulation_enabled)
            .finish()
    }
}

impl SimulatedLink {
    /// 엔트로피로 시드한 링크
    pub fn new(sequence: Arc<SequenceGenerator>) -> Self {
        Self::from_rng(sequence, StdRng::from_entropy())
    }

    /// 고정 시드 링크 (재현 가능한 테스트용)
    pub fn with_seed(sequence: Arc<SequenceGenerator>, seed: u64) -> Self {
        Self::from_rng(sequence, StdRng::seed_from_u64(seed))
    }

    fn from_rng(sequence: Arc<SequenceGenerator>, rng: StdRng) -> Self {
        Self {
            inner: Mutex::new(LinkInner {
                state: LinkState::Closed,
                local_addr: None,
                remote_addr: None,
                simulation_enabled: false,
                condition: NetworkConditionProfile::default(),
                default_qos: QosProfile::default(),
                qos_profiles: HashMap::new(),
                send_queues: Default::default(),
                receive_queue: VecDeque::new(),
                rng,
                traffic: RateWindow::per_second(),
                stats: LinkStatistics::default(),
                packet_callback: None,
            }),
            sequence,
        }
    }

    /// 로컬 포트에 바인드 (Closed 상태에서만)
    pub fn bind(&self, port: u16) -> Result<SocketAddr> {
        let mut inner = self.inner.lock();
        if inner.state != LinkState::Closed {
            return Err(Error::InvalidState {
                op: "bind",
                state: format!("{:?}", inner.state),
            });
        }

        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        inner.local_addr = Some(addr);
        inner.state = LinkState::Bound;
        drop(inner);

        debug!("링크 바인드: {}", addr);
        Ok(addr)
    }

    /// 원격 주소 고정 (Bound 상태에서만)
    pub fn connect(&self, remote: SocketAddr) -> Result<()> {
        if remote.port() == 0 {
            return Err(Error::Validation(format!("잘못된 원격 포트: {}", remote)));
        }

        let mut inner = self.inner.lock();
        if inner.state != LinkState::Bound {
            return Err(Error::InvalidState {
                op: "connect",
                state: format!("{:?}", inner.state),
            });
        }
        inner.remote_addr = Some(remote);
        inner.state = LinkState::Connected;
        drop(inner);

        debug!("링크 연결: -> {}", remote);
        Ok(())
    }

    /// 수신 대기 (Bound 상태에서만)
    pub fn listen(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != LinkState::Bound {
            return Err(Error::InvalidState {
                op: "listen",
                state: format!("{:?}", inner.state),
            });
        }
        inner.state = LinkState::Listening;
        Ok(())
    }

    /// 어느 상태에서든 Closed로. 큐에 있던 패킷은 모두 폐기
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.state == LinkState::Closed {
            return;
        }
        for queue in inner.send_queues.iter_mut() {
            queue.clear();
        }
        inner.receive_queue.clear();
        inner.local_addr = None;
        inner.remote_addr = None;
        inner.state = LinkState::Closed;
        drop(inner);

        debug!("링크 종료");
    }

    pub fn state(&self) -> LinkState {
        self.inner.lock().state
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().remote_addr
    }

    /// 지정한 주소로 송신. 받아들인 바이트 수 반환
    ///
    /// 시뮬레이션이 켜져 있으면 손실 -> 손상 -> 지연 -> 순서 뒤바뀜 -> 대역폭 제한
    /// 순서로 적용한다. 손실된 패킷도 호출자에게는 성공으로 보인다.
    pub fn send_to(&self, payload: &[u8], destination: SocketAddr, qos: &QosProfile) -> Result<usize> {
        if destination.port() == 0 {
            return Err(Error::Validation(format!("잘못된 목적지 포트: {}", destination)));
        }

        let mut inner = self.inner.lock();
        let source = inner.require_bound("send_to")?;

        if payload.len() > inner.condition.mtu {
            return Err(Error::PayloadTooLarge {
                size: payload.len(),
                mtu: inner.condition.mtu,
            });
        }

        let now = Instant::now();
        let sequence_number = self.sequence.next();
        let priority = qos.priority;

        inner.stats.packets_sent += 1;
        inner.stats.bytes_sent += payload.len() as u64;
        inner.stats.packets_by_priority[priority.index()] += 1;

        let mut packet = SimPacket {
            payload: Bytes::copy_from_slice(payload),
            source,
            destination,
            sequence_number,
            priority,
            sent_at: now,
            deliver_at: now,
            checksum: crc32fast::hash(payload),
            corrupted: false,
        };

        if inner.simulation_enabled {
            // 1. 손실
            if inner.rng.gen::<f64>() < inner.condition.packet_loss {
                inner.stats.packets_lost += 1;
                trace!("시뮬레이션 손실: seq={}", sequence_number);
                return Ok(payload.len());
            }

            // 2. 손상 (손실은 아님, 그대로 전달)
            if !payload.is_empty() && inner.rng.gen::<f64>() < inner.condition.corruption_prob {
                let index = inner.rng.gen_range(0..payload.len());
                let mask = inner.rng.gen_range(1..=u8::MAX);
                let mut corrupted = BytesMut::from(payload);
                corrupted[index] ^= mask;
                packet.payload = corrupted.freeze();
                packet.corrupted = true;
                inner.stats.packets_corrupted += 1;
                trace!("시뮬레이션 손상: seq={}, byte={}", sequence_number, index);
            }

            // 3. 지연
            packet.deliver_at += inner.sample_latency();

            // 4. 순서 뒤바뀜
            if inner.condition.reorder_prob > 0.0
                && inner.rng.gen::<f64>() < inner.condition.reorder_prob
                && inner.reorder_medium()
            {
                inner.stats.packets_reordered += 1;
            }

            // 5. 대역폭 제한
            packet.deliver_at += inner.shaping_delay(payload.len() as u64, now);
        } else {
            inner.traffic.record(payload.len() as u64, now);
            inner.refresh_bandwidth(now);
        }

        inner.send_queues[priority.index()].push_back(packet);
        Ok(payload.len())
    }

    /// 연결된 원격 주소로 송신
    pub fn send(&self, payload: &[u8], qos: &QosProfile) -> Result<usize> {
        let remote = self.inner.lock().connected_remote("send")?;
        self.send_to(payload, remote, qos)
    }

    /// 기본 QoS 프로필로 송신
    pub fn send_default(&self, payload: &[u8], destination: SocketAddr) -> Result<usize> {
        let qos = self.default_qos();
        self.send_to(payload, destination, &qos)
    }

    /// 등록된 QoS 프로필로 송신
    pub fn send_with_profile(&self, payload: &[u8], destination: SocketAddr, profile_id: u32) -> Result<usize> {
        let qos = self
            .qos_profile(profile_id)
            .ok_or_else(|| Error::Validation(format!("등록되지 않은 QoS 프로필: {}", profile_id)))?;
        self.send_to(payload, destination, &qos)
    }

    /// 수신 큐에서 하나 꺼내기 (FIFO). 콜백이 있으면 락을 놓은 뒤 호출
    pub fn receive_from(&self) -> Result<Option<(Bytes, SocketAddr)>> {
        let (packet, callback) = {
            let mut inner = self.inner.lock();
            inner.require_bound("receive_from")?;
            match inner.receive_queue.pop_front() {
                Some(packet) => (packet, inner.packet_callback.clone()),
                None => return Ok(None),
            }
        };

        if let Some(callback) = callback {
            callback(&packet.payload, packet.source);
        }
        Ok(Some((packet.payload, packet.source)))
    }

    /// 연결된 원격 주소에서 온 패킷 하나
    pub fn receive(&self) -> Result<Option<Bytes>> {
        self.inner.lock().connected_remote("receive")?;
        Ok(self.receive_from()?.map(|(payload, _)| payload))
    }

    /// 도착 시각이 지난 송신 패킷을 우선순위 순으로 꺼냄 (와이어 단계용)
    pub fn drain_outgoing(&self, now: Instant) -> Vec<SimPacket> {
        let mut inner = self.inner.lock();
        let mut ready = Vec::new();

        for queue in inner.send_queues.iter_mut() {
            let mut waiting = VecDeque::with_capacity(queue.len());
            for packet in queue.drain(..) {
                if packet.deliver_at <= now {
                    ready.push(packet);
                } else {
                    waiting.push_back(packet);
                }
            }
            *queue = waiting;
        }
        ready
    }

    /// 와이어에서 도착한 패킷을 수신 큐에 넣음. 닫힌 링크면 false
    pub fn deliver(&self, packet: SimPacket, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == LinkState::Closed {
            return false;
        }

        inner.stats.packets_received += 1;
        inner.stats.bytes_received += packet.payload.len() as u64;
        if !packet.verify_checksum() {
            inner.stats.corrupted_detected += 1;
        }

        let latency_ms = now.saturating_duration_since(packet.sent_at).as_secs_f64() * 1000.0;
        inner.stats.record_latency(latency_ms);

        inner.receive_queue.push_back(packet);
        true
    }

    /// 송신 큐에 남은 패킷 수
    pub fn queued_outgoing(&self) -> usize {
        self.inner.lock().send_queues.iter().map(VecDeque::len).sum()
    }

    /// 수신 큐에 남은 패킷 수
    pub fn queued_incoming(&self) -> usize {
        self.inner.lock().receive_queue.len()
    }

    /// 네트워크 상태 설정
    pub fn set_network_condition(&self, condition: NetworkConditionProfile) -> Result<()> {
        condition.validate()?;
        self.inner.lock().condition = condition;
        Ok(())
    }

    pub fn network_condition(&self) -> NetworkConditionProfile {
        self.inner.lock().condition.clone()
    }

    pub fn enable_simulation(&self, enable: bool) {
        self.inner.lock().simulation_enabled = enable;
    }

    pub fn is_simulation_enabled(&self) -> bool {
        self.inner.lock().simulation_enabled
    }

    pub fn set_default_qos(&self, qos: QosProfile) {
        self.inner.lock().default_qos = qos;
    }

    pub fn default_qos(&self) -> QosProfile {
        self.inner.lock().default_qos.clone()
    }

    /// 이름 붙은 QoS 프로필 등록 (같은 ID면 교체)
    pub fn set_qos_profile(&self, profile_id: u32, qos: QosProfile) {
        self.inner.lock().qos_profiles.insert(profile_id, qos);
    }

    pub fn qos_profile(&self, profile_id: u32) -> Option<QosProfile> {
        self.inner.lock().qos_profiles.get(&profile_id).cloned()
    }

    /// 수신 패킷 콜백 설정 (None이면 해제)
    pub fn set_packet_callback(&self, callback: Option<PacketCallback>) {
        self.inner.lock().packet_callback = callback;
    }

    /// 통계 반환
    pub fn statistics(&self) -> LinkStatistics {
        let mut inner = self.inner.lock();
        inner.refresh_bandwidth(Instant::now());
        inner.stats.clone()
    }

    pub fn reset_statistics(&self) {
        let mut inner = self.inner.lock();
        inner.stats = LinkStatistics::default();
        inner.traffic.reset(Instant::now());
    }
}

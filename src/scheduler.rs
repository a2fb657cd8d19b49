//! 우선순위 + 데드라인 송신 스케줄러
//!
//! 정렬 키: 우선순위 오름차순 (CRITICAL 먼저), 같으면 데드라인 오름차순, 같으면 삽입 순.
//! 대역폭은 집계만 하고, 상한을 넘었을 때 막는 것은 호출자의 몫이다.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::events::{Event, EventSink};
use crate::qos::{Priority, QosLevel, QosProfile};
use crate::stats::{RateWindow, SchedulerStats};
use crate::Config;

/// 스케줄 항목 메타데이터
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketMetadata {
    pub priority: Priority,
    pub qos: QosLevel,

    /// 이 시각이 지나면 보내지 않고 폐기
    pub deadline: Instant,

    /// 와이어 크기 (바이트)
    pub size: usize,

    pub sequence_number: u32,
    pub requires_ack: bool,
}

impl PacketMetadata {
    /// QoS 프로필에서 메타데이터 생성 (데드라인 = now + timeout)
    pub fn from_profile(
        profile: &QosProfile,
        sequence_number: u32,
        size: usize,
        now: Instant,
    ) -> Self {
        Self {
            priority: profile.priority,
            qos: profile.level(),
            deadline: now + profile.timeout(),
            size,
            sequence_number,
            requires_ack: profile.reliability.is_reliable(),
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.deadline
    }
}

/// 큐에 들어 있는 항목
#[derive(Debug, Clone)]
pub struct ScheduledEnvelope {
    pub payload: Bytes,
    pub metadata: PacketMetadata,

    /// 삽입 순서 (동률 처리용)
    order: u64,
}

impl PartialEq for ScheduledEnvelope {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScheduledEnvelope {}

impl PartialOrd for ScheduledEnvelope {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEnvelope {
    /// BinaryHeap은 최대 힙이므로 먼저 나가야 할 항목이 "큰" 값
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .metadata
            .priority
            .cmp(&self.metadata.priority)
            .then_with(|| other.metadata.deadline.cmp(&self.metadata.deadline))
            .then_with(|| other.order.cmp(&self.order))
    }
}

#[derive(Debug)]
struct SchedulerInner {
    queue: BinaryHeap<ScheduledEnvelope>,
    next_order: u64,

    /// 1초 윈도우 대역폭 집계
    bandwidth: RateWindow,

    /// 0이면 무제한
    max_bandwidth: u64,

    stats: SchedulerStats,
    closed: bool,
}

/// 우선순위 송신 스케줄러
#[derive(Debug)]
pub struct PacketScheduler {
    inner: Mutex<SchedulerInner>,
    max_queue_size: usize,
    events: Option<EventSink>,
}

impl PacketScheduler {
    pub fn new(config: &Config) -> Self {
        Self::with_capacity(config.max_queue_size, config.max_bandwidth_bytes_per_sec)
    }

    pub fn with_capacity(max_queue_size: usize, max_bandwidth: u64) -> Self {
        Self {
            inner: Mutex::new(SchedulerInner {
                queue: BinaryHeap::new(),
                next_order: 0,
                bandwidth: RateWindow::per_second(),
                max_bandwidth,
                stats: SchedulerStats::default(),
                closed: false,
            }),
            max_queue_size,
            events: None,
        }
    }

    /// 이벤트 싱크 연결
    pub fn with_events(mut self, sink: EventSink) -> Self {
        self.events = Some(sink);
        self
    }

    /// 큐에 추가. 가득 찼거나 닫혔으면 false (큐는 그대로)
    pub fn enqueue(&self, payload: Bytes, metadata: PacketMetadata) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }

        if inner.queue.len() >= self.max_queue_size {
            inner.stats.rejected += 1;
            drop(inner);

            debug!("스케줄러 큐 가득 참: capacity={}", self.max_queue_size);
            if let Some(sink) = &self.events {
                sink.emit(Event::QueueFull {
                    capacity: self.max_queue_size,
                });
            }
            return false;
        }

        let order = inner.next_order;
        inner.next_order += 1;
        inner.queue.push(ScheduledEnvelope {
            payload,
            metadata,
            order,
        });
        inner.stats.enqueued += 1;
        true
    }

    /// 가장 급한 유효 항목 꺼내기
    pub fn dequeue(&self) -> Option<(Bytes, PacketMetadata)> {
        self.dequeue_at(Instant::now())
    }

    /// `now` 기준으로 데드라인이 지난 항목은 폐기하며 가장 급한 유효 항목 꺼내기
    pub fn dequeue_at(&self, now: Instant) -> Option<(Bytes, PacketMetadata)> {
        let mut expired = Vec::new();
        let found = {
            let mut inner = self.inner.lock();
            let mut found = None;

            while let Some(envelope) = inner.queue.pop() {
                if envelope.metadata.is_expired(now) {
                    inner.stats.expired += 1;
                    expired.push(envelope.metadata.sequence_number);
                    continue;
                }
                inner.stats.dequeued += 1;
                found = Some((envelope.payload, envelope.metadata));
                break;
            }
            found
        };

        for sequence_number in expired {
            trace!("데드라인 초과로 폐기: seq={}", sequence_number);
            if let Some(sink) = &self.events {
                sink.emit(Event::DeadlineExpired { sequence_number });
            }
        }

        found
    }

    /// 맨 앞 항목의 우선순위 (꺼내지 않음)
    pub fn peek_priority(&self) -> Option<Priority> {
        self.inner
            .lock()
            .queue
            .peek()
            .map(|envelope| envelope.metadata.priority)
    }

    /// 송신한 바이트 기록
    pub fn update_bandwidth_usage(&self, bytes: u64) {
        self.update_bandwidth_usage_at(bytes, Instant::now());
    }

    pub fn update_bandwidth_usage_at(&self, bytes: u64, now: Instant) {
        self.inner.lock().bandwidth.record(bytes, now);
    }

    pub fn set_max_bandwidth(&self, limit: u64) {
        self.inner.lock().max_bandwidth = limit;
    }

    pub fn max_bandwidth(&self) -> u64 {
        self.inner.lock().max_bandwidth
    }

    /// 현재 1초 윈도우에 기록된 바이트
    pub fn current_bandwidth(&self) -> u64 {
        self.current_bandwidth_at(Instant::now())
    }

    pub fn current_bandwidth_at(&self, now: Instant) -> u64 {
        self.inner.lock().bandwidth.current(now)
    }

    /// 상한이 있고 현재 윈도우 사용량이 상한 이상인지
    pub fn is_over_budget(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        let limit = inner.max_bandwidth;
        limit > 0 && inner.bandwidth.current(now) >= limit
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_queue_size
    }

    /// 통계 반환
    pub fn stats(&self) -> SchedulerStats {
        self.inner.lock().stats.clone()
    }

    /// 큐 비우기
    pub fn clear(&self) {
        self.inner.lock().queue.clear();
    }

    /// 큐를 비우고 이후 enqueue 거부 (여러 번 호출해도 안전)
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.queue.clear();
        inner.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

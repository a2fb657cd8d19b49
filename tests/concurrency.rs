//! 여러 스레드가 같은 채널과 스케줄러를 동시에 건드릴 때의 불변식
//!
//! 각 시퀀스 번호는 ACK 또는 손실 중 정확히 한 번으로 끝나야 하고,
//! 스케줄러에 들어간 항목은 정확히 한 번 꺼내져야 한다.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use prl::{
    event_channel, Config, Event, Frame, PacketChannel, PacketMetadata, PacketScheduler, Priority,
    QosProfile, ReliabilityClass,
};

const PACKETS: u32 = 2000;

#[test]
fn test_channel_settles_every_packet_exactly_once() {
    let config = Config {
        resend_timeout_ms: 1,
        max_resend_attempts: 2,
        ..Config::default()
    };
    let (sink, events) = event_channel();
    let channel = Arc::new(PacketChannel::new(&config).with_events(sink));
    let producing = Arc::new(AtomicBool::new(true));
    let start = Instant::now();

    // 큐잉하면서 짝수 번호는 바로 ACK
    let producer = {
        let channel = Arc::clone(&channel);
        let producing = Arc::clone(&producing);
        thread::spawn(move || {
            for i in 0..PACKETS {
                let sequence_number = channel
                    .queue(Bytes::from(i.to_be_bytes().to_vec()), ReliabilityClass::Reliable)
                    .unwrap();
                if sequence_number % 2 == 0 {
                    channel.process_incoming(Frame::ack(sequence_number).encode()).unwrap();
                }
            }
            producing.store(false, Ordering::Release);
        })
    };

    // 송신, 재전송, 손실 판정을 가상 시간으로 계속 돌림
    let ticker = {
        let channel = Arc::clone(&channel);
        let producing = Arc::clone(&producing);
        thread::spawn(move || {
            let mut now = start;
            while producing.load(Ordering::Acquire) {
                now += Duration::from_millis(1);
                channel.packets_due_for_send(now);
                channel.tick(now);
            }
            now
        })
    };

    producer.join().unwrap();
    let mut now = ticker.join().unwrap();

    // 남은 패킷을 모두 손실로 정리
    for _ in 0..10 {
        now += Duration::from_millis(10);
        channel.packets_due_for_send(now);
        channel.tick(now);
    }

    let mut acked = HashSet::new();
    let mut lost = HashSet::new();
    for event in events.drain() {
        match event {
            Event::PacketAcked { sequence_number } => assert!(acked.insert(sequence_number)),
            Event::PacketLost { sequence_number } => assert!(lost.insert(sequence_number)),
            _ => {}
        }
    }

    assert!(acked.is_disjoint(&lost));
    assert_eq!(acked.len() + lost.len(), PACKETS as usize);
    assert!(acked.iter().all(|seq| seq % 2 == 0));

    let stats = channel.stats();
    assert_eq!(stats.packets_acked + stats.packets_lost, u64::from(PACKETS));
    assert_eq!(channel.pending_count(), 0);
}

#[test]
fn test_scheduler_hands_out_each_entry_once() {
    const PRODUCERS: u32 = 4;
    const PER_PRODUCER: u32 = 500;

    let scheduler = PacketScheduler::with_capacity((PRODUCERS * PER_PRODUCER) as usize, 0);
    let producing = AtomicBool::new(true);
    let now = Instant::now();
    let priorities = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
        Priority::Background,
    ];

    let mut seen = thread::scope(|scope| {
        let consumer = scope.spawn(|| {
            let mut taken = Vec::new();
            while producing.load(Ordering::Acquire) {
                match scheduler.dequeue_at(now) {
                    Some((_, metadata)) => taken.push(metadata.sequence_number),
                    None => thread::yield_now(),
                }
            }
            taken
        });

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|producer| {
                let scheduler = &scheduler;
                scope.spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let sequence_number = producer * PER_PRODUCER + i;
                        let priority = priorities[(sequence_number % 5) as usize];
                        let metadata = PacketMetadata {
                            deadline: now + Duration::from_secs(3600),
                            ..PacketMetadata::from_profile(
                                &QosProfile::plain(priority, ReliabilityClass::Reliable),
                                sequence_number,
                                8,
                                now,
                            )
                        };
                        assert!(scheduler.enqueue(Bytes::from_static(b"envelope"), metadata));
                    }
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }
        producing.store(false, Ordering::Release);
        consumer.join().unwrap()
    });

    while let Some((_, metadata)) = scheduler.dequeue_at(now) {
        seen.push(metadata.sequence_number);
    }

    let total = (PRODUCERS * PER_PRODUCER) as usize;
    assert_eq!(seen.len(), total);
    assert_eq!(seen.iter().collect::<HashSet<_>>().len(), total);

    let stats = scheduler.stats();
    assert_eq!(stats.enqueued, stats.dequeued);
    assert_eq!(stats.rejected, 0);
    assert_eq!(stats.expired, 0);
    assert!(scheduler.is_empty());
}

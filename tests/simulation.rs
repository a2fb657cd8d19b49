//! 시뮬레이션 네트워크 위의 통합 테스트
//!
//! 링크 에뮬레이터, 파이프라인, 스케줄러, 엔드포인트를 공개 API로만 조합한다.
//! 시간은 테스트가 직접 진행시키므로 실제로 기다리지 않는다.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use bytes::Bytes;
use prl::{
    Config, Endpoint, Event, LinkTransport, NetworkConditionProfile, PacketMetadata,
    PacketScheduler, Priority, QosProfile, ReliabilityClass, SimNetwork, TransportPipeline,
};

fn reliable() -> QosProfile {
    QosProfile::plain(Priority::Medium, ReliabilityClass::Reliable)
}

// ---------------------------------------------------------------------------
// 링크 에뮬레이터
// ---------------------------------------------------------------------------

#[test]
fn test_total_loss_delivers_nothing() {
    let network = SimNetwork::new();
    let a = network.create_link_with_seed(8000, 11).unwrap();
    let b = network.create_link_with_seed(8001, 12).unwrap();
    a.connect(b.local_addr().unwrap()).unwrap();

    a.set_network_condition(NetworkConditionProfile {
        packet_loss: 1.0,
        ..NetworkConditionProfile::default()
    })
    .unwrap();
    a.enable_simulation(true);

    for i in 0..100u32 {
        // 손실돼도 송신자에게는 성공으로 보임
        assert_eq!(a.send(&i.to_be_bytes(), &reliable()).unwrap(), 4);
    }
    network.step(Instant::now() + Duration::from_secs(1));

    assert!(b.receive_from().unwrap().is_none());

    let stats = a.statistics();
    assert_eq!(stats.packets_sent, 100);
    assert_eq!(stats.packets_lost, 100);
    assert!((stats.packet_loss_rate() - 1.0).abs() < f64::EPSILON);
    assert_eq!(b.statistics().packets_received, 0);
}

#[test]
fn test_clean_link_is_byte_identical() {
    let network = SimNetwork::new();
    let a = network.create_link_with_seed(8010, 21).unwrap();
    let b = network.create_link_with_seed(8011, 22).unwrap();
    a.connect(b.local_addr().unwrap()).unwrap();

    // 시뮬레이션을 켜도 손상 요소가 0이면 그대로 전달
    a.enable_simulation(true);

    let sent: Vec<Vec<u8>> = (0..50u8)
        .map(|i| (0..=i).map(|b| b.wrapping_mul(31)).collect())
        .collect();
    for payload in &sent {
        a.send(payload, &reliable()).unwrap();
    }
    network.step(Instant::now() + Duration::from_millis(1));

    let mut received = Vec::new();
    while let Some((payload, source)) = b.receive_from().unwrap() {
        assert_eq!(source, a.local_addr().unwrap());
        received.push(payload.to_vec());
    }
    assert_eq!(received, sent);

    let stats = b.statistics();
    assert_eq!(stats.packets_received, 50);
    assert_eq!(stats.corrupted_detected, 0);
}

#[test]
fn test_corruption_is_detected_by_receiver() {
    let network = SimNetwork::new();
    let a = network.create_link_with_seed(8020, 31).unwrap();
    let b = network.create_link_with_seed(8021, 32).unwrap();
    a.connect(b.local_addr().unwrap()).unwrap();

    a.set_network_condition(NetworkConditionProfile {
        corruption_prob: 1.0,
        ..NetworkConditionProfile::default()
    })
    .unwrap();
    a.enable_simulation(true);

    for _ in 0..20 {
        a.send(b"fragile payload", &reliable()).unwrap();
    }
    network.step(Instant::now() + Duration::from_millis(1));

    let mut received = 0;
    while let Some((payload, _)) = b.receive_from().unwrap() {
        assert_eq!(payload.len(), 15);
        assert_ne!(payload.as_ref(), b"fragile payload");
        received += 1;
    }
    assert_eq!(received, 20);
    assert_eq!(a.statistics().packets_corrupted, 20);
    assert_eq!(b.statistics().corrupted_detected, 20);
}

#[test]
fn test_latency_holds_packets_until_due() {
    let network = SimNetwork::new();
    let a = network.create_link_with_seed(8030, 41).unwrap();
    let b = network.create_link_with_seed(8031, 42).unwrap();
    a.connect(b.local_addr().unwrap()).unwrap();

    a.set_network_condition(NetworkConditionProfile {
        latency_ms: 200.0,
        ..NetworkConditionProfile::default()
    })
    .unwrap();
    a.enable_simulation(true);

    let start = Instant::now();
    a.send(b"slow", &reliable()).unwrap();

    network.step(start);
    assert!(b.receive_from().unwrap().is_none());
    assert_eq!(a.queued_outgoing(), 1);

    network.step(start + Duration::from_secs(1));
    assert_eq!(b.receive_from().unwrap().unwrap().0.as_ref(), b"slow");
}

// ---------------------------------------------------------------------------
// 파이프라인
// ---------------------------------------------------------------------------

#[test]
fn test_fragments_reassemble_in_any_arrival_order() {
    let config = Config {
        fragment_size: 100,
        ..Config::default()
    };
    let sender = TransportPipeline::new(&config);
    let receiver = TransportPipeline::new(&config);

    let payload: Vec<u8> = (0..1050u32).map(|i| (i * 7 % 256) as u8).collect();
    let wire = sender.prepare_outbound(&payload, &reliable()).unwrap();
    assert_eq!(wire.len(), 11);

    // 역순 + 중간 교차
    let mut order: Vec<usize> = (0..wire.len()).rev().collect();
    order.swap(2, 7);

    let mut assembled = None;
    for (n, index) in order.into_iter().enumerate() {
        let result = receiver.consume_inbound(wire[index].clone()).unwrap();
        if n + 1 < wire.len() {
            assert!(result.is_none());
        } else {
            assembled = result;
        }
    }

    assert_eq!(assembled.unwrap().as_ref(), payload.as_slice());
    assert_eq!(receiver.pending_reassemblies(), 0);
}

// ---------------------------------------------------------------------------
// 스케줄러
// ---------------------------------------------------------------------------

#[test]
fn test_scheduler_drains_by_priority_then_deadline() {
    let scheduler = PacketScheduler::with_capacity(16, 0);
    let now = Instant::now();

    let entries = [
        (Priority::Low, 10, 1u32),
        (Priority::Critical, 50, 2),
        (Priority::Medium, 30, 3),
        (Priority::Critical, 20, 4),
        (Priority::Background, 5, 5),
        (Priority::Medium, 30, 6),
    ];
    for (priority, deadline_ms, seq) in entries {
        let metadata = PacketMetadata {
            deadline: now + Duration::from_millis(deadline_ms),
            ..PacketMetadata::from_profile(&QosProfile::plain(priority, ReliabilityClass::Reliable), seq, 8, now)
        };
        assert!(scheduler.enqueue(Bytes::from_static(b"envelope"), metadata));
    }

    let mut order = Vec::new();
    while let Some((_, metadata)) = scheduler.dequeue_at(now) {
        order.push(metadata.sequence_number);
    }
    // 같은 우선순위는 데드라인, 그다음 삽입 순서
    assert_eq!(order, vec![4, 2, 3, 6, 1, 5]);
}

// ---------------------------------------------------------------------------
// 엔드포인트
// ---------------------------------------------------------------------------

fn endpoint_pair(
    network: &SimNetwork,
    config: &Config,
    ports: (u16, u16),
) -> (Endpoint<LinkTransport>, Endpoint<LinkTransport>) {
    let a = network.create_link_with_seed(ports.0, 101).unwrap();
    let b = network.create_link_with_seed(ports.1, 202).unwrap();
    let ta = LinkTransport::connect(a.clone(), b.local_addr().unwrap()).unwrap();
    let tb = LinkTransport::connect(b, a.local_addr().unwrap()).unwrap();
    (
        Endpoint::new(config, ta).unwrap(),
        Endpoint::new(config, tb).unwrap(),
    )
}

#[test]
fn test_reliable_delivery_survives_loss() {
    let network = SimNetwork::new();
    let config = Config {
        resend_timeout_ms: 20,
        max_resend_attempts: 12,
        ..Config::default()
    };
    let (a, b) = endpoint_pair(&network, &config, (8100, 8101));

    let lossy = NetworkConditionProfile {
        packet_loss: 0.2,
        ..NetworkConditionProfile::default()
    };
    for endpoint in [&a, &b] {
        let link = endpoint.transport().link();
        link.set_network_condition(lossy.clone()).unwrap();
        link.enable_simulation(true);
    }

    let qos = QosProfile {
        max_retries: 12,
        ..reliable()
    };
    let sent: HashSet<Vec<u8>> = (0..10u8).map(|i| vec![i; 64 + i as usize]).collect();
    for payload in &sent {
        a.send(payload, &qos).unwrap();
    }

    let mut now = Instant::now();
    let mut received = Vec::new();
    for _ in 0..300 {
        a.poll(now).unwrap();
        b.poll(now).unwrap();
        network.step(now);
        received.extend(b.drain_received().into_iter().map(|m| m.to_vec()));
        now += Duration::from_millis(10);
    }

    // 중복 없이 모두 한 번씩
    assert_eq!(received.len(), sent.len());
    assert_eq!(received.into_iter().collect::<HashSet<_>>(), sent);
    assert_eq!(a.pending_count(), 0);
    assert!(a.stats().channel.packets_resent > 0);
}

#[test]
fn test_unreliable_messages_are_not_resent() {
    let network = SimNetwork::new();
    let (a, b) = endpoint_pair(&network, &Config::default(), (8110, 8111));

    let qos = QosProfile::plain(Priority::High, ReliabilityClass::Unreliable);
    for i in 0..5u8 {
        a.send(&[i; 16], &qos).unwrap();
    }
    assert_eq!(a.pending_count(), 0);

    let mut now = Instant::now();
    for _ in 0..5 {
        a.poll(now).unwrap();
        b.poll(now).unwrap();
        network.step(now);
        now += Duration::from_millis(50);
    }

    assert_eq!(b.drain_received().len(), 5);
    let stats = a.stats().channel;
    assert_eq!(stats.packets_sent, 5);
    assert_eq!(stats.packets_resent, 0);
    assert!(!a
        .events()
        .drain()
        .iter()
        .any(|event| matches!(event, Event::PacketLost { .. })));
}

//! 시뮬레이션 네트워크 (와이어 단계)
//!
//! 주소로 링크를 등록해 두고, `step`마다 각 링크의 송신 큐에서 도착 시각이 지난
//! 패킷을 꺼내 목적지 링크의 수신 큐에 넣는다.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::link::{LinkState, SequenceGenerator, SimulatedLink};
use crate::{Error, Result};

/// 포트 0으로 요청했을 때 할당을 시작하는 포트
const EPHEMERAL_PORT_START: u16 = 49152;

/// 네트워크 전체 통계
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    /// 수신 큐에 넣은 패킷
    pub delivered: u64,

    /// 목적지 링크가 없거나 닫혀 버린 패킷
    pub undeliverable: u64,
}

/// 링크 레지스트리
#[derive(Debug)]
pub struct SimNetwork {
    links: DashMap<SocketAddr, Arc<SimulatedLink>>,

    /// 이 네트워크에서 만든 링크가 공유하는 시퀀스 생성기
    sequence: Arc<SequenceGenerator>,

    next_port: AtomicU16,
    delivered: AtomicU64,
    undeliverable: AtomicU64,
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::with_sequence(Arc::new(SequenceGenerator::new()))
    }

    pub fn with_sequence(sequence: Arc<SequenceGenerator>) -> Self {
        Self {
            links: DashMap::new(),
            sequence,
            next_port: AtomicU16::new(EPHEMERAL_PORT_START),
            delivered: AtomicU64::new(0),
            undeliverable: AtomicU64::new(0),
        }
    }

    pub fn sequence(&self) -> Arc<SequenceGenerator> {
        self.sequence.clone()
    }

    /// 새 링크를 만들어 바인드 후 등록 (port 0이면 임시 포트 할당)
    pub fn create_link(&self, port: u16) -> Result<Arc<SimulatedLink>> {
        self.register(SimulatedLink::new(self.sequence.clone()), port)
    }

    /// 고정 시드 링크 생성
    pub fn create_link_with_seed(&self, port: u16, seed: u64) -> Result<Arc<SimulatedLink>> {
        self.register(SimulatedLink::with_seed(self.sequence.clone(), seed), port)
    }

    fn register(&self, link: SimulatedLink, port: u16) -> Result<Arc<SimulatedLink>> {
        let port = if port == 0 { self.ephemeral_port()? } else { port };
        link.bind(port)?;
        let link = Arc::new(link);
        self.attach(link.clone())?;
        Ok(link)
    }

    fn ephemeral_port(&self) -> Result<u16> {
        for _ in 0..=(u16::MAX - EPHEMERAL_PORT_START) {
            let port = self.next_port.fetch_add(1, Ordering::Relaxed);
            let port = if port < EPHEMERAL_PORT_START {
                self.next_port.store(EPHEMERAL_PORT_START + 1, Ordering::Relaxed);
                EPHEMERAL_PORT_START
            } else {
                port
            };
            if !self.links.iter().any(|entry| entry.key().port() == port) {
                return Ok(port);
            }
        }
        Err(Error::ResourceExhausted {
            capacity: usize::from(u16::MAX - EPHEMERAL_PORT_START) + 1,
        })
    }

    /// 이미 바인드된 링크 등록
    pub fn attach(&self, link: Arc<SimulatedLink>) -> Result<SocketAddr> {
        let addr = link
            .local_addr()
            .ok_or_else(|| Error::InvalidState {
                op: "attach",
                state: format!("{:?}", link.state()),
            })?;

        match self.links.entry(addr) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(Error::Validation(format!("이미 사용 중인 주소: {}", addr)))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(link);
                debug!("링크 등록: {}", addr);
                Ok(addr)
            }
        }
    }

    /// 등록 해제
    pub fn detach(&self, addr: &SocketAddr) -> Option<Arc<SimulatedLink>> {
        self.links.remove(addr).map(|(_, link)| link)
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<Arc<SimulatedLink>> {
        self.links.get(addr).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// 도착 시각이 지난 패킷을 목적지로 옮김. 옮긴 패킷 수 반환
    ///
    /// 레지스트리 참조는 링크를 호출하기 전에 모두 놓는다.
    pub fn step(&self, now: Instant) -> usize {
        let links: Vec<(SocketAddr, Arc<SimulatedLink>)> = self
            .links
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut delivered = 0;
        for (addr, link) in links {
            if link.state() == LinkState::Closed {
                self.links.remove(&addr);
                debug!("닫힌 링크 제거: {}", addr);
                continue;
            }

            for packet in link.drain_outgoing(now) {
                let destination = packet.destination;
                let accepted = match self.get(&destination) {
                    Some(peer) => peer.deliver(packet, now),
                    None => false,
                };

                if accepted {
                    delivered += 1;
                } else {
                    trace!("전달 불가: {} -> {}", addr, destination);
                    self.undeliverable.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            undeliverable: self.undeliverable.load(Ordering::Relaxed),
        }
    }
}

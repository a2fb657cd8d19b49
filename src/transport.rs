//! 원시 전송 계층 인터페이스
//!
//! 엔드포인트는 바이트를 보내고 받는 것만 요구한다. 실제 UDP 소켓과 시뮬레이션 링크가
//! 같은 인터페이스를 구현한다. 모든 호출은 블로킹하지 않는다.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::link::SimulatedLink;
use crate::qos::QosProfile;
use crate::{Error, Result};

/// 한 피어로 향하는 원시 전송
pub trait Transport: Send + Sync {
    /// 바이트 송신. 보낸 바이트 수 반환
    fn send(&self, payload: &[u8]) -> Result<usize>;

    /// QoS 정보를 쓸 수 있는 전송은 이 메서드를 구현한다
    fn send_with(&self, payload: &[u8], _qos: &QosProfile) -> Result<usize> {
        self.send(payload)
    }

    /// 수신 대기 중인 데이터그램 하나 (없으면 None)
    fn try_receive(&self) -> Result<Option<Bytes>>;

    /// 전송 종료 (여러 번 호출해도 안전)
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// 연결된 시뮬레이션 링크 위의 전송
#[derive(Debug, Clone)]
pub struct LinkTransport {
    link: Arc<SimulatedLink>,
}

impl LinkTransport {
    /// 링크를 `remote`에 연결하고 감쌈
    pub fn connect(link: Arc<SimulatedLink>, remote: SocketAddr) -> Result<Self> {
        link.connect(remote)?;
        Ok(Self { link })
    }

    pub fn link(&self) -> &Arc<SimulatedLink> {
        &self.link
    }
}

impl Transport for LinkTransport {
    fn send(&self, payload: &[u8]) -> Result<usize> {
        let qos = self.link.default_qos();
        self.link.send(payload, &qos)
    }

    fn send_with(&self, payload: &[u8], qos: &QosProfile) -> Result<usize> {
        self.link.send(payload, qos)
    }

    fn try_receive(&self) -> Result<Option<Bytes>> {
        self.link.receive()
    }

    fn close(&self) {
        self.link.close();
    }

    fn is_closed(&self) -> bool {
        self.link.state() == crate::link::LinkState::Closed
    }
}

/// 연결된 UDP 소켓 위의 전송
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    buffer: Mutex<Vec<u8>>,
    closed: AtomicBool,
}

impl UdpTransport {
    /// 로컬 주소에 바인드하고 원격 주소에 연결
    pub async fn connect(local: SocketAddr, remote: SocketAddr, buffer_size: usize) -> Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        debug!("UDP 전송 연결: {} -> {}", socket.local_addr()?, remote);

        Ok(Self::from_socket(socket, buffer_size))
    }

    /// 이미 연결된 소켓 사용
    pub fn from_socket(socket: UdpSocket, buffer_size: usize) -> Self {
        Self {
            socket,
            buffer: Mutex::new(vec![0u8; buffer_size]),
            closed: AtomicBool::new(false),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.peer_addr()?)
    }

    /// 읽을 데이터가 생길 때까지 대기 (폴링 루프용)
    pub async fn readable(&self) -> Result<()> {
        self.socket.readable().await?;
        Ok(())
    }
}

impl Transport for UdpTransport {
    fn send(&self, payload: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(self.socket.try_send(payload)?)
    }

    fn try_receive(&self) -> Result<Option<Bytes>> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let mut buffer = self.buffer.lock();
        match self.socket.try_recv(&mut buffer) {
            Ok(len) => Ok(Some(Bytes::copy_from_slice(&buffer[..len]))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

//! # PRL (Priority Reliable Link)
//!
//! 지연에 민감한 애플리케이션을 위한 UDP 위의 우선순위 신뢰성 전송 코어
//!
//! ## 핵심 특징
//! - **ACK 기반 신뢰성**: 시퀀스 번호, 고정 간격 재전송, 손실 통계
//! - **파이프라인**: 압축 -> 암호화 -> 분할, 수신측은 인덱스 순 조립
//! - **우선순위 스케줄러**: 우선순위 + 데드라인 정렬, 대역폭 집계
//! - **네트워크 에뮬레이터**: 손실, 손상, 지연, 순서 뒤바뀜, 대역폭 제한
//! - **논블로킹**: 모든 연산은 즉시 반환, 호출자가 주기적으로 `poll`

pub mod channel;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod frame;
pub mod link;
pub mod network;
pub mod pipeline;
pub mod qos;
pub mod scheduler;
pub mod stats;
pub mod transport;

pub use channel::{Incoming, OutgoingFrame, PacketChannel, PacketState, PendingPacket};
pub use codec::{Compressor, ZstdCompressor};
pub use config::Config;
pub use crypto::{ChaChaCipher, Cipher, CryptoError};
pub use endpoint::{Endpoint, EndpointStats, PollOutcome};
pub use error::{Error, Result};
pub use events::{event_channel, DropReason, Event, EventReceiver, EventSink};
pub use frame::{Envelope, FragmentHeader, Frame};
pub use link::{LinkState, NetworkConditionProfile, SequenceGenerator, SimPacket, SimulatedLink};
pub use network::SimNetwork;
pub use pipeline::{ReassemblyBuffer, TransportPipeline};
pub use qos::{Priority, QosLevel, QosProfile, ReliabilityClass};
pub use scheduler::{PacketMetadata, PacketScheduler, ScheduledEnvelope};
pub use stats::{ChannelStats, LinkStatistics, PipelineStats, SchedulerStats};
pub use transport::{LinkTransport, Transport, UdpTransport};

/// 시퀀스 번호 크기 (바이트). ACK 프레임의 전체 크기이기도 함
pub const SEQUENCE_SIZE: usize = 4;

/// 기본 프래그먼트 본문 크기 (바이트)
pub const DEFAULT_FRAGMENT_SIZE: usize = 1200;

/// 기본 MTU (바이트)
pub const DEFAULT_MTU: usize = 1400;

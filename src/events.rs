//! 호출자가 폴링하는 이벤트 큐
//!
//! 손실, 큐 포화, 메시지 폐기처럼 호출자에게 바로 에러로 돌려줄 수 없는
//! 사건들을 기록한다. 컴포넌트는 락을 놓은 뒤에만 이벤트를 보낸다.

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};

/// 전송 코어 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// 재전송 한도를 넘어 손실 처리된 신뢰성 패킷
    PacketLost { sequence_number: u32 },

    /// ACK 수신
    PacketAcked { sequence_number: u32 },

    /// 스케줄러 큐가 가득 차 거부된 전송
    QueueFull { capacity: usize },

    /// 데드라인이 지나 폐기된 스케줄 항목
    DeadlineExpired { sequence_number: u32 },

    /// 조립 타임아웃 또는 복호화/압축 해제 실패로 폐기된 메시지
    MessageDropped { message_id: u32, reason: DropReason },

    /// 연결 타임아웃 동안 상대에게서 아무 프레임도 받지 못함
    PeerTimedOut { silent_for_ms: u64 },
}

/// 메시지 폐기 사유
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    ReassemblyTimeout,
    Decrypt,
    Decompress,
    Malformed,
}

/// 이벤트 송신측 (컴포넌트가 보유)
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Sender<Event>,
}

impl EventSink {
    /// 이벤트 발행. 수신측이 사라졌으면 조용히 버림
    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

/// 이벤트 수신측 (호출자가 보유)
#[derive(Debug)]
pub struct EventReceiver {
    rx: Receiver<Event>,
}

impl EventReceiver {
    /// 대기 중인 이벤트 하나 (없으면 None)
    pub fn poll(&self) -> Option<Event> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// 대기 중인 이벤트 전부
    pub fn drain(&self) -> Vec<Event> {
        self.rx.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// 이벤트 채널 생성
pub fn event_channel() -> (EventSink, EventReceiver) {
    let (tx, rx) = unbounded();
    (EventSink { tx }, EventReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_polled_in_order() {
        let (sink, events) = event_channel();
        sink.emit(Event::PacketLost { sequence_number: 1 });
        sink.emit(Event::QueueFull { capacity: 8 });

        assert_eq!(events.len(), 2);
        assert_eq!(events.poll(), Some(Event::PacketLost { sequence_number: 1 }));
        assert_eq!(events.drain(), vec![Event::QueueFull { capacity: 8 }]);
        assert!(events.poll().is_none());
    }

    #[test]
    fn test_emit_after_receiver_dropped() {
        let (sink, events) = event_channel();
        drop(events);
        sink.emit(Event::PacketAcked { sequence_number: 3 });
    }
}

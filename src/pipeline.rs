//! 송수신 처리 파이프라인
//!
//! - 송신: 압축 -> 암호화(IV 선행) -> 분할
//! - 수신: 조립(인덱스 순) -> 복호화 -> 압축 해제
//!
//! 압축과 암호화는 항상 메시지 전체에 적용되고, 조각 단위로 적용되지 않는다.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::codec::Compressor;
use crate::crypto::Cipher;
use crate::events::{DropReason, Event, EventSink};
use crate::frame::{Envelope, FragmentHeader, FLAG_COMPRESSED, FLAG_ENCRYPTED, FLAG_FRAGMENT};
use crate::qos::QosProfile;
use crate::stats::PipelineStats;
use crate::{Config, Error, Result};

/// 완료/폐기된 메시지 ID를 기억하는 개수
const RETIRED_WINDOW: usize = 1024;

/// 타임아웃 로그에 남기는 누락 인덱스 개수
const LOGGED_MISSING: usize = 16;

/// 메시지 하나의 조립 버퍼 (수신측)
#[derive(Debug)]
pub struct ReassemblyBuffer {
    pub message_id: u32,

    /// 인덱스 -> 조각 본문
    fragments: BTreeMap<u32, Bytes>,

    pub total_fragments: u32,

    /// 압축/암호화 플래그 (모든 조각이 같아야 함)
    pub flags: u8,

    /// 생성 시간
    pub created_at: Instant,
}

impl ReassemblyBuffer {
    pub fn new(message_id: u32, total_fragments: u32, flags: u8, created_at: Instant) -> Self {
        Self {
            message_id,
            fragments: BTreeMap::new(),
            total_fragments,
            flags: flags & !FLAG_FRAGMENT,
            created_at,
        }
    }

    /// 조각 삽입. 이미 받은 인덱스면 false
    pub fn insert(&mut self, fragment_index: u32, body: Bytes) -> bool {
        if fragment_index >= self.total_fragments || self.fragments.contains_key(&fragment_index) {
            return false;
        }
        self.fragments.insert(fragment_index, body);
        true
    }

    pub fn received_count(&self) -> u32 {
        self.fragments.len() as u32
    }

    /// 완료 여부 확인
    pub fn is_complete(&self) -> bool {
        self.received_count() == self.total_fragments
    }

    /// 누락된 조각 인덱스 (오름차순, 지연 평가)
    pub fn missing_indices(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.total_fragments).filter(move |index| !self.fragments.contains_key(index))
    }

    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.created_at) > timeout
    }

    /// 인덱스 순으로 이어 붙인 본문
    pub fn assemble(self) -> Bytes {
        let size = self.fragments.values().map(Bytes::len).sum();
        let mut buf = BytesMut::with_capacity(size);
        for body in self.fragments.into_values() {
            buf.extend_from_slice(&body);
        }
        buf.freeze()
    }
}

/// 암호화기와 키
struct CipherSlot {
    cipher: Arc<dyn Cipher>,
    key: Vec<u8>,
}

/// 파이프라인 내부 상태 (단일 락으로 보호)
#[derive(Debug, Default)]
struct PipelineInner {
    buffers: HashMap<u32, ReassemblyBuffer>,

    /// 최근 완료/폐기된 메시지 ID
    retired_order: VecDeque<u32>,
    retired: HashSet<u32>,

    stats: PipelineStats,
}

impl PipelineInner {
    fn retire(&mut self, message_id: u32) {
        if !self.retired.insert(message_id) {
            return;
        }
        if self.retired_order.len() >= RETIRED_WINDOW {
            if let Some(oldest) = self.retired_order.pop_front() {
                self.retired.remove(&oldest);
            }
        }
        self.retired_order.push_back(message_id);
    }
}

/// 송수신 처리 파이프라인
pub struct TransportPipeline {
    fragment_size: usize,
    max_message_size: usize,

    /// 수신 조각 헤더가 선언할 수 있는 최대 조각 수
    max_fragments: u32,
    fragment_timeout: Duration,
    compressor: Option<Arc<dyn Compressor>>,
    cipher: Option<CipherSlot>,
    next_message_id: AtomicU32,
    inner: Mutex<PipelineInner>,
    events: Option<EventSink>,
}

impl std::fmt::Debug for TransportPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportPipeline")
            .field("fragment_size", &self.fragment_size)
            .field("fragment_timeout", &self.fragment_timeout)
            .field("compression", &self.compressor.is_some())
            .field("encryption", &self.cipher.is_some())
            .finish()
    }
}

impl TransportPipeline {
    /// 압축/암호화 없는 파이프라인
    pub fn new(config: &Config) -> Self {
        Self {
            fragment_size: config.fragment_size.max(1),
            max_message_size: config.max_message_size,
            max_fragments: config.max_fragments(),
            fragment_timeout: Duration::from_millis(config.fragment_timeout_ms),
            compressor: None,
            cipher: None,
            next_message_id: AtomicU32::new(0),
            inner: Mutex::new(PipelineInner::default()),
            events: None,
        }
    }

    /// 압축기 연결
    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    /// 암호화기와 키 연결. 키 크기가 맞지 않으면 `Validation`
    pub fn with_cipher(mut self, cipher: Arc<dyn Cipher>, key: &[u8]) -> Result<Self> {
        if key.len() != cipher.key_size() {
            return Err(Error::Validation(format!(
                "키 크기 불일치: expected={}, got={}",
                cipher.key_size(),
                key.len()
            )));
        }
        self.cipher = Some(CipherSlot {
            cipher,
            key: key.to_vec(),
        });
        Ok(self)
    }

    /// 이벤트 싱크 연결
    pub fn with_events(mut self, sink: EventSink) -> Self {
        self.events = Some(sink);
        self
    }

    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    /// 송신 처리: 엔벨로프가 붙은 와이어 페이로드 목록 반환
    ///
    /// 프로필이 압축/암호화를 요청해도 해당 협력자가 없으면 그 단계는 건너뛰고
    /// 플래그도 세우지 않는다.
    pub fn prepare_outbound(&self, payload: &[u8], qos: &QosProfile) -> Result<Vec<Bytes>> {
        if payload.len() > self.max_message_size {
            return Err(Error::PayloadTooLarge {
                size: payload.len(),
                mtu: self.max_message_size,
            });
        }

        let mut flags = 0u8;
        let mut body = Bytes::copy_from_slice(payload);

        if qos.use_compression {
            if let Some(compressor) = &self.compressor {
                if let Some(compressed) = compressor.try_compress(&body)? {
                    body = compressed;
                    flags |= FLAG_COMPRESSED;
                }
            }
        }

        if qos.use_encryption {
            if let Some(slot) = &self.cipher {
                let iv = slot.cipher.generate_iv();
                let ciphertext = slot.cipher.encrypt(&body, &slot.key, &iv)?;

                let mut buf = BytesMut::with_capacity(iv.len() + ciphertext.len());
                buf.extend_from_slice(&iv);
                buf.extend_from_slice(&ciphertext);
                body = buf.freeze();
                flags |= FLAG_ENCRYPTED;
            }
        }

        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);

        let wire = if body.len() > self.fragment_size {
            let total = (body.len() + self.fragment_size - 1) / self.fragment_size;
            let total_fragments = u32::try_from(total).map_err(|_| Error::PayloadTooLarge {
                size: body.len(),
                mtu: self.fragment_size,
            })?;

            let mut wire = Vec::with_capacity(total);
            for (index, start) in (0..body.len()).step_by(self.fragment_size).enumerate() {
                let end = (start + self.fragment_size).min(body.len());
                let header =
                    FragmentHeader::fragment(message_id, index as u32, total_fragments, flags);
                wire.push(Envelope::new(header, body.slice(start..end)).encode()?);
            }
            wire
        } else {
            vec![Envelope::new(FragmentHeader::single(message_id, flags), body).encode()?]
        };

        {
            let mut inner = self.inner.lock();
            inner.stats.messages_prepared += 1;
            inner.stats.fragments_prepared += wire.len() as u64;
            if flags & FLAG_COMPRESSED != 0 {
                inner.stats.messages_compressed += 1;
            }
            if flags & FLAG_ENCRYPTED != 0 {
                inner.stats.messages_encrypted += 1;
            }
        }

        trace!(
            "메시지 준비: id={}, {} bytes -> {} 조각, flags={:03b}",
            message_id,
            payload.len(),
            wire.len(),
            flags
        );
        Ok(wire)
    }

    /// 본문 없는 keepalive 엔벨로프
    pub fn prepare_keepalive(&self) -> Result<Bytes> {
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        Envelope::new(FragmentHeader::keepalive(message_id), Bytes::new()).encode()
    }

    /// 수신 처리
    ///
    /// 메시지가 완성되면 원본 페이로드, 조각이 남아 있거나 keepalive면 None.
    /// 조각 수가 상한을 넘는 헤더는 버퍼를 만들기 전에 `Protocol`로 거부한다.
    pub fn consume_inbound(&self, bytes: Bytes) -> Result<Option<Bytes>> {
        let envelope = Envelope::decode(bytes)?;
        let header = envelope.header;

        if header.is_keepalive() {
            self.inner.lock().stats.keepalives_received += 1;
            return Ok(None);
        }

        if header.total_fragments > self.max_fragments {
            self.inner.lock().stats.oversized_rejected += 1;
            return Err(Error::Protocol(format!(
                "조각 수 상한 초과: message_id={}, total={}, max={}",
                header.message_id, header.total_fragments, self.max_fragments
            )));
        }

        if !header.is_fragment() {
            self.inner.lock().stats.fragments_received += 1;
            return self.finish(header.message_id, header.flags, envelope.body).map(Some);
        }

        let assembled = {
            let mut inner = self.inner.lock();
            inner.stats.fragments_received += 1;

            if inner.retired.contains(&header.message_id) {
                return Err(Error::UnknownMessage {
                    message_id: header.message_id,
                });
            }

            let buffer = inner
                .buffers
                .entry(header.message_id)
                .or_insert_with(|| {
                    ReassemblyBuffer::new(
                        header.message_id,
                        header.total_fragments,
                        header.flags,
                        Instant::now(),
                    )
                });

            if buffer.total_fragments != header.total_fragments {
                return Err(Error::FragmentMismatch {
                    message_id: header.message_id,
                    expected: buffer.total_fragments,
                    got: header.total_fragments,
                });
            }
            if buffer.flags != header.flags & !FLAG_FRAGMENT {
                return Err(Error::Protocol(format!(
                    "조각 플래그 불일치: message_id={}",
                    header.message_id
                )));
            }

            if !buffer.insert(header.fragment_index, envelope.body) {
                inner.stats.duplicate_fragments += 1;
                return Ok(None);
            }
            if !buffer.is_complete() {
                return Ok(None);
            }

            inner.retire(header.message_id);
            inner.buffers.remove(&header.message_id)
        };

        match assembled {
            Some(buffer) => {
                let flags = buffer.flags;
                self.finish(header.message_id, flags, buffer.assemble()).map(Some)
            }
            None => Ok(None),
        }
    }

    /// 복호화 + 압축 해제 (락 밖에서 호출)
    fn finish(&self, message_id: u32, flags: u8, body: Bytes) -> Result<Bytes> {
        let body = if flags & FLAG_ENCRYPTED != 0 {
            self.decrypt(&body)
                .map_err(|e| self.drop_message(message_id, DropReason::Decrypt, e))?
        } else {
            body
        };

        let body = if flags & FLAG_COMPRESSED != 0 {
            self.decompress(&body)
                .map_err(|e| self.drop_message(message_id, DropReason::Decompress, e))?
        } else {
            body
        };

        self.inner.lock().stats.messages_delivered += 1;
        Ok(body)
    }

    fn decrypt(&self, body: &[u8]) -> Result<Bytes> {
        let slot = self
            .cipher
            .as_ref()
            .ok_or_else(|| Error::Protocol("암호화된 메시지지만 암호화기가 없음".into()))?;

        let iv_size = slot.cipher.iv_size();
        if body.len() < iv_size {
            return Err(Error::Protocol(format!(
                "암호문이 IV보다 짧음: {} bytes",
                body.len()
            )));
        }

        let (iv, ciphertext) = body.split_at(iv_size);
        Ok(Bytes::from(slot.cipher.decrypt(ciphertext, &slot.key, iv)?))
    }

    fn decompress(&self, body: &[u8]) -> Result<Bytes> {
        let compressor = self
            .compressor
            .as_ref()
            .ok_or_else(|| Error::Protocol("압축된 메시지지만 압축기가 없음".into()))?;
        compressor.decompress(body)
    }

    /// 메시지 폐기 기록 후 원래 에러 반환
    fn drop_message(&self, message_id: u32, reason: DropReason, error: Error) -> Error {
        self.inner.lock().stats.messages_dropped += 1;
        warn!("메시지 폐기: id={}, {:?}: {}", message_id, reason, error);

        if let Some(sink) = &self.events {
            sink.emit(Event::MessageDropped { message_id, reason });
        }
        error
    }

    /// 조립 타임아웃이 지난 버퍼 폐기. 폐기한 메시지 ID 반환
    pub fn sweep_expired_fragments(&self, now: Instant) -> Vec<u32> {
        let timeout = self.fragment_timeout;
        let expired: Vec<ReassemblyBuffer> = {
            let mut inner = self.inner.lock();
            let ids: Vec<u32> = inner
                .buffers
                .values()
                .filter(|buffer| buffer.is_expired(now, timeout))
                .map(|buffer| buffer.message_id)
                .collect();

            let expired: Vec<ReassemblyBuffer> = ids
                .iter()
                .filter_map(|id| inner.buffers.remove(id))
                .collect();
            for id in &ids {
                inner.retire(*id);
            }
            inner.stats.messages_dropped += expired.len() as u64;
            expired
        };

        let mut dropped = Vec::with_capacity(expired.len());
        for buffer in expired {
            debug!(
                "조립 타임아웃: id={}, {}/{} 조각, 누락 앞부분 {:?}",
                buffer.message_id,
                buffer.received_count(),
                buffer.total_fragments,
                buffer.missing_indices().take(LOGGED_MISSING).collect::<Vec<_>>()
            );
            if let Some(sink) = &self.events {
                sink.emit(Event::MessageDropped {
                    message_id: buffer.message_id,
                    reason: DropReason::ReassemblyTimeout,
                });
            }
            dropped.push(buffer.message_id);
        }
        dropped
    }

    /// 조립 중인 메시지 수
    pub fn pending_reassemblies(&self) -> usize {
        self.inner.lock().buffers.len()
    }

    /// 통계 반환
    pub fn stats(&self) -> PipelineStats {
        self.inner.lock().stats.clone()
    }

    /// 조립 중인 버퍼 모두 폐기
    pub fn clear(&self) {
        self.inner.lock().buffers.clear();
    }
}

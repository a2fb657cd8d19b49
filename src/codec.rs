//! 압축 모듈
//!
//! 파이프라인은 `try_compress` 한 번으로 이득 여부 판단과 압축을 함께 한다.

use bytes::Bytes;

use crate::{Config, Error, Result};

/// zstd 기본 압축 레벨
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// 메시지 단위 압축기
pub trait Compressor: Send + Sync {
    /// 전체 메시지 압축
    fn compress(&self, data: &[u8]) -> Result<Bytes>;

    /// 전체 메시지 압축 해제
    fn decompress(&self, data: &[u8]) -> Result<Bytes>;

    /// 압축할 가치가 있는지
    fn should_compress(&self, data: &[u8]) -> bool;

    /// 이득이 있을 때만 압축 결과를 돌려준다. 없으면 `None`.
    fn try_compress(&self, data: &[u8]) -> Result<Option<Bytes>> {
        if self.should_compress(data) {
            self.compress(data).map(Some)
        } else {
            Ok(None)
        }
    }
}

/// zstd 압축기
#[derive(Debug, Clone)]
pub struct ZstdCompressor {
    level: i32,

    /// 이보다 작은 입력은 압축하지 않음
    min_size: usize,

    /// 압축 후 크기 / 원본 크기가 이 값보다 작아야 압축
    ratio_threshold: f64,
}

impl ZstdCompressor {
    pub fn new(level: i32, min_size: usize, ratio_threshold: f64) -> Self {
        Self {
            level,
            min_size,
            ratio_threshold,
        }
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::stream::encode_all(data, self.level).map_err(|e| Error::Compression(e.to_string()))
    }

    fn worth_it(&self, original: usize, compressed: usize) -> bool {
        (compressed as f64) < original as f64 * self.ratio_threshold
    }

    /// 설정의 임계값 사용
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            DEFAULT_ZSTD_LEVEL,
            config.min_compression_size,
            config.compression_ratio_threshold,
        )
    }
}

impl Default for ZstdCompressor {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl Compressor for ZstdCompressor {
    fn compress(&self, data: &[u8]) -> Result<Bytes> {
        self.encode(data).map(Bytes::from)
    }

    fn decompress(&self, data: &[u8]) -> Result<Bytes> {
        let decompressed =
            zstd::stream::decode_all(data).map_err(|e| Error::Compression(e.to_string()))?;
        Ok(Bytes::from(decompressed))
    }

    fn should_compress(&self, data: &[u8]) -> bool {
        matches!(self.try_compress(data), Ok(Some(_)))
    }

    fn try_compress(&self, data: &[u8]) -> Result<Option<Bytes>> {
        if data.len() < self.min_size {
            return Ok(None);
        }

        let compressed = self.encode(data)?;
        if self.worth_it(data.len(), compressed.len()) {
            Ok(Some(Bytes::from(compressed)))
        } else {
            Ok(None)
        }
    }
}

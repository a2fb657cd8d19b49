//! 암호화 모듈 - ChaCha20-Poly1305 대칭 암호화
//!
//! 흐름:
//! 1. 송신측이 메시지마다 새 IV(nonce) 생성
//! 2. 전체 메시지를 암호화하고 IV를 앞에 붙임
//! 3. 수신측은 IV를 떼어내고 태그 검증과 함께 복호화

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand_core::{OsRng, RngCore};

/// ChaCha20-Poly1305 키 크기 (32 bytes)
pub const KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 nonce 크기 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// ChaCha20-Poly1305 태그 크기 (16 bytes)
pub const TAG_SIZE: usize = 16;

/// 암호화 오류
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("암호화 실패: {0}")]
    EncryptionFailed(String),
    #[error("복호화 실패: {0}")]
    DecryptionFailed(String),
    #[error("잘못된 키 크기: {0}")]
    InvalidKeySize(usize),
    #[error("잘못된 nonce 크기: {0}")]
    InvalidNonce(usize),
}

/// 메시지 단위 암호화기
pub trait Cipher: Send + Sync {
    /// 키 길이
    fn key_size(&self) -> usize;

    /// IV 길이
    fn iv_size(&self) -> usize;

    fn encrypt(&self, data: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// 인증 태그가 맞지 않으면 `DecryptionFailed`
    fn decrypt(&self, data: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// 새 IV 생성
    fn generate_iv(&self) -> Vec<u8>;
}

/// ChaCha20-Poly1305 AEAD
#[derive(Debug, Clone, Copy, Default)]
pub struct ChaChaCipher;

impl ChaChaCipher {
    pub fn new() -> Self {
        Self
    }

    fn cipher(key: &[u8]) -> Result<ChaCha20Poly1305, CryptoError> {
        ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::InvalidKeySize(key.len()))
    }

    fn nonce(iv: &[u8]) -> Result<&Nonce, CryptoError> {
        if iv.len() != NONCE_SIZE {
            return Err(CryptoError::InvalidNonce(iv.len()));
        }
        Ok(Nonce::from_slice(iv))
    }
}

impl Cipher for ChaChaCipher {
    fn key_size(&self) -> usize {
        KEY_SIZE
    }

    fn iv_size(&self) -> usize {
        NONCE_SIZE
    }

    fn encrypt(&self, data: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = Self::cipher(key)?;
        let nonce = Self::nonce(iv)?;

        cipher
            .encrypt(nonce, data)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
    }

    fn decrypt(&self, data: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = Self::cipher(key)?;
        let nonce = Self::nonce(iv)?;

        if data.len() < TAG_SIZE {
            return Err(CryptoError::DecryptionFailed("데이터가 너무 짧음".into()));
        }

        cipher
            .decrypt(nonce, data)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }

    fn generate_iv(&self) -> Vec<u8> {
        let mut iv = vec![0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut iv);
        iv
    }
}

/// 새 무작위 키 생성
pub fn generate_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    key
}

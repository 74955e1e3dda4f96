//! MAC 키 전달용 암호화 - X25519 키 교환 + ChaCha20-Poly1305
//!
//! 흐름:
//! 1. 수신측이 임시 X25519 키쌍 생성, Hello로 공개키 전송
//! 2. 송신측도 임시 키쌍 생성, 공유 비밀 계산
//! 3. 공유 비밀에서 봉인 키 유도 후 세션 MAC 키를 봉인해 Welcome으로 전송
//! 4. 수신측이 같은 봉인 키로 MAC 키 복원

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand_core::{OsRng, RngCore};
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::auth::{MacKey, MAC_KEY_SIZE};

/// X25519 공개키 (32 bytes)
pub const PUBLIC_KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 nonce 크기 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// ChaCha20-Poly1305 태그 크기 (16 bytes)
pub const TAG_SIZE: usize = 16;

/// 봉인된 MAC 키 길이: nonce + 키 + 태그
pub const SEALED_KEY_SIZE: usize = NONCE_SIZE + MAC_KEY_SIZE + TAG_SIZE;

const SEAL_CONTEXT: &str = "fmtp 2024 mac-key seal v1";

/// 암호화 오류
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("암호화 실패: {0}")]
    EncryptionFailed(String),
    #[error("복호화 실패: {0}")]
    DecryptionFailed(String),
    #[error("잘못된 키 크기")]
    InvalidKeySize,
}

/// 임시 키쌍 (세션당 일회성)
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl EphemeralKeyPair {
    /// 새 임시 키쌍 생성
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// 공개키를 바이트로 변환
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        *self.public.as_bytes()
    }

    /// 상대방 공개키로 봉인 키 계산 (소비됨)
    pub fn establish(self, peer_public: &[u8; PUBLIC_KEY_SIZE]) -> KeySealer {
        let peer_public = PublicKey::from(*peer_public);
        let shared = self.secret.diffie_hellman(&peer_public);
        // 공유 비밀을 그대로 쓰지 않고 용도별 키로 유도
        KeySealer {
            key: blake3::derive_key(SEAL_CONTEXT, shared.as_bytes()),
        }
    }
}

/// 공유 비밀 기반 MAC 키 봉인/복원
pub struct KeySealer {
    key: [u8; 32],
}

impl KeySealer {
    fn cipher(&self) -> Result<ChaCha20Poly1305, CryptoError> {
        ChaCha20Poly1305::new_from_slice(&self.key).map_err(|_| CryptoError::InvalidKeySize)
    }

    /// MAC 키 봉인
    /// 반환: nonce(12) + ciphertext(32 + 16바이트 태그)
    pub fn seal(&self, mac_key: &MacKey) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher()?
            .encrypt(nonce, mac_key.as_bytes().as_slice())
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut sealed = Vec::with_capacity(SEALED_KEY_SIZE);
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// 봉인된 MAC 키 복원
    pub fn open(&self, sealed: &[u8]) -> Result<MacKey, CryptoError> {
        if sealed.len() != SEALED_KEY_SIZE {
            return Err(CryptoError::DecryptionFailed(format!(
                "봉인 길이 {} != {}",
                sealed.len(),
                SEALED_KEY_SIZE
            )));
        }

        let nonce = Nonce::from_slice(&sealed[..NONCE_SIZE]);
        let plaintext = self
            .cipher()?
            .decrypt(nonce, &sealed[NONCE_SIZE..])
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;

        let bytes: [u8; MAC_KEY_SIZE] = plaintext
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKeySize)?;
        Ok(MacKey::from_bytes(bytes))
    }
}

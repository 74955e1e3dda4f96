//! PDU 인증 (MAC)
//!
//! 모든 PDU 끝에 헤더+페이로드에 대한 MAC 태그를 붙인다.
//! 기본 구현은 BLAKE3 keyed hash (32바이트 태그).

use rand::RngCore;

use crate::AUTH_TAG_SIZE;

/// MAC 키 길이 (바이트)
pub const MAC_KEY_SIZE: usize = 32;

/// 인증 태그
pub type AuthTag = [u8; AUTH_TAG_SIZE];

/// 서명/검증 기능
///
/// 송신측은 `sign`, 수신측은 `verify`만 사용한다.
pub trait Authenticator: Send + Sync {
    /// 바이트열에 대한 태그 생성
    fn sign(&self, bytes: &[u8]) -> AuthTag;

    /// 태그 검증
    fn verify(&self, bytes: &[u8], tag: &[u8]) -> bool;
}

/// 세션 MAC 키
#[derive(Clone, PartialEq, Eq)]
pub struct MacKey([u8; MAC_KEY_SIZE]);

impl MacKey {
    /// 무작위 키 생성 (송신측 세션 시작 시)
    pub fn generate() -> Self {
        let mut key = [0u8; MAC_KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; MAC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; MAC_KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MacKey(..)")
    }
}

/// BLAKE3 keyed hash 기반 인증기
pub struct Blake3Authenticator {
    key: MacKey,
}

impl Blake3Authenticator {
    pub fn new(key: MacKey) -> Self {
        Self { key }
    }
}

impl Authenticator for Blake3Authenticator {
    fn sign(&self, bytes: &[u8]) -> AuthTag {
        *blake3::keyed_hash(self.key.as_bytes(), bytes).as_bytes()
    }

    fn verify(&self, bytes: &[u8], tag: &[u8]) -> bool {
        let Ok(tag) = <[u8; AUTH_TAG_SIZE]>::try_from(tag) else {
            return false;
        };
        // blake3::Hash의 비교는 상수 시간
        blake3::keyed_hash(self.key.as_bytes(), bytes) == blake3::Hash::from(tag)
    }
}

/// 인증 없음 (시험/벤치마크용). 태그는 항상 0
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuthenticator;

impl Authenticator for NullAuthenticator {
    fn sign(&self, _bytes: &[u8]) -> AuthTag {
        [0u8; AUTH_TAG_SIZE]
    }

    fn verify(&self, _bytes: &[u8], tag: &[u8]) -> bool {
        tag.len() == AUTH_TAG_SIZE && tag.iter().all(|b| *b == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let auth = Blake3Authenticator::new(MacKey::generate());
        let tag = auth.sign(b"product 7");
        assert!(auth.verify(b"product 7", &tag));
        assert!(!auth.verify(b"product 8", &tag));
        assert!(!auth.verify(b"product 7", &tag[..16]));
    }

    #[test]
    fn test_different_keys_disagree() {
        let a = Blake3Authenticator::new(MacKey::from_bytes([1u8; MAC_KEY_SIZE]));
        let b = Blake3Authenticator::new(MacKey::from_bytes([2u8; MAC_KEY_SIZE]));
        let tag = a.sign(b"data");
        assert!(!b.verify(b"data", &tag));
    }

    #[test]
    fn test_null_authenticator() {
        let auth = NullAuthenticator;
        let tag = auth.sign(b"anything");
        assert!(auth.verify(b"else", &tag));
        assert!(!auth.verify(b"else", &[1u8; AUTH_TAG_SIZE]));
    }
}

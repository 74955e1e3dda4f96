//! 에러 타입 정의

use thiserror::Error;

/// PDU 디코딩 에러
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("PDU 헤더 잘림: 최소 {needed} 바이트 필요, {got} 바이트 수신")]
    Truncated { needed: usize, got: usize },

    #[error("페이로드 길이 불일치: 선언 {declared}, 남은 바이트 {available}")]
    LengthMismatch { declared: usize, available: usize },

    #[error("페이로드 최대 크기 초과: {len} > {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("알 수 없는 세그먼트 종류: {0:#06x}")]
    UnknownKind(u16),

    #[error("인증 태그 검증 실패")]
    AuthFailed,

    #[error("페이로드 형식 오류: {0}")]
    MalformedPayload(&'static str),
}

/// 에러 분류
///
/// - `Transient`: 개별 세그먼트 손실/손상, 재전송으로 복구
/// - `Exhausted`: 재전송 시도 소진, 제품 손실로 보고 후 세션 유지
/// - `Protocol`: 잘못된 PDU, 인증 실패. 세그먼트 폐기 후 세션 유지
/// - `Fatal`: 채널 설정 실패 등. 세션 종료
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Exhausted,
    Protocol,
    Fatal,
}

/// FMTP 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("PDU 디코딩 에러: {0}")]
    Decode(#[from] DecodeError),

    #[error("암호화 에러: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),

    #[error("핸드쉐이크 실패: {0}")]
    Handshake(String),

    #[error("설정 오류: {0}")]
    Config(String),

    #[error("채널 설정 실패 ({attempts}회 시도): {source}")]
    ChannelSetup {
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("제품 크기 초과: {size} > {max}")]
    ProductTooLarge { size: u64, max: u64 },

    #[error("유효하지 않은 세그먼트: product={product_id}, offset={offset}, len={len}")]
    InvalidSegment {
        product_id: u32,
        offset: u32,
        len: usize,
    },

    #[error("추적 용량 초과: 최대 {max}개 제품")]
    CapacityExceeded { max: usize },

    #[error("재전송 시도 소진: product={product_id}")]
    RetransmissionExhausted { product_id: u32 },

    #[error("세션 종료 중")]
    Shutdown,

    #[error("연결 종료")]
    ConnectionClosed,

    #[error("잘못된 상태 전이: {from} -> {to}")]
    InvalidState { from: String, to: String },
}

impl Error {
    /// 에러 분류 반환
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Decode(_) | Error::ProductTooLarge { .. } | Error::InvalidSegment { .. } => {
                ErrorClass::Protocol
            }
            Error::RetransmissionExhausted { .. } => ErrorClass::Exhausted,
            Error::CapacityExceeded { .. } => ErrorClass::Exhausted,
            Error::Io(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::Interrupted
                        | std::io::ErrorKind::TimedOut
                ) =>
            {
                ErrorClass::Transient
            }
            Error::Io(_)
            | Error::Serialization(_)
            | Error::Crypto(_)
            | Error::Handshake(_)
            | Error::Config(_)
            | Error::ChannelSetup { .. }
            | Error::Shutdown
            | Error::ConnectionClosed
            | Error::InvalidState { .. } => ErrorClass::Fatal,
        }
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;

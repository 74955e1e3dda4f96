//! # FMTP (File Multicast Transport Protocol)
//!
//! UDP 멀티캐스트 기반 제품(파일) 전송 프로토콜
//!
//! ## 핵심 특징
//! - **멀티캐스트 송신**: 제품 하나를 BOP / 데이터 블록 / EOP로 그룹 전체에 전송
//! - **NACK 기반 복구**: 수신측이 누락 블록만 TCP 재전송 채널로 요청
//! - **제한된 재시도**: 지수 백오프 후 소진되면 제품 손실로 보고
//! - **토큰 버킷 pacing**: 송신 속도와 버스트 제한
//! - **세그먼트 인증**: 핸드쉐이크로 나눠 받은 키로 PDU마다 BLAKE3 keyed MAC

pub mod auth;
pub mod channel;
pub mod config;
pub mod crypto;
pub mod error;
pub mod message;
pub mod pdu;
pub mod receiver;
pub mod retransmit;
pub mod sender;
pub mod session;
pub mod shaper;
pub mod stats;
pub mod tracker;

pub use auth::{Authenticator, Blake3Authenticator, MacKey, NullAuthenticator};
pub use config::Config;
pub use error::{DecodeError, Error, ErrorClass, Result};
pub use pdu::{BopInfo, Pdu, PduCodec, ProductId, SegmentKind};
pub use receiver::ReceiverSession;
pub use retransmit::{RetransmissionQueue, RetryPolicy};
pub use sender::SenderSession;
pub use session::{LossReason, MemoryQueue, ProductQueue, SessionEvent, SessionState};
pub use shaper::{RateShaper, TokenBucket};
pub use stats::{SessionStats, StatsSnapshot};
pub use tracker::{BlockRange, BlockTracker};

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u8 = 1;

/// 기본 블록 크기 (바이트)
pub const DEFAULT_BLOCK_SIZE: usize = 1400;

/// PDU 페이로드 최대 크기 (바이트)
pub const MAX_PAYLOAD: usize = 1416;

/// PDU 헤더 크기: prodid(4) + offset(4) + payloadlen(2) + kind(2)
pub const HEADER_LEN: usize = 12;

/// 인증 태그 크기 (BLAKE3 keyed hash)
pub const AUTH_TAG_SIZE: usize = 32;

/// 데이터그램 최대 크기
pub const MAX_DATAGRAM: usize = HEADER_LEN + MAX_PAYLOAD + AUTH_TAG_SIZE;

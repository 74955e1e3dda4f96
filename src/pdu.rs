//! PDU 정의 및 코덱
//!
//! 와이어 포맷 (모든 정수는 big-endian):
//!
//! | 필드 | 크기 |
//! |---|---|
//! | product_id | 4 |
//! | byte_offset | 4 |
//! | payload_len | 2 |
//! | kind | 2 |
//! | payload | payload_len |
//! | auth_tag | 32, 앞의 모든 바이트에 대한 MAC |

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::auth::Authenticator;
use crate::error::DecodeError;
use crate::{Error, Result, AUTH_TAG_SIZE, HEADER_LEN, MAX_PAYLOAD};

/// 제품 ID (32비트, 송신측이 순차 할당, 2^32에서 wrap)
///
/// 크기 비교 대신 serial number 산술(RFC 1982)로 순서를 판단한다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProductId(pub u32);

impl ProductId {
    pub fn next(self) -> Self {
        ProductId(self.0.wrapping_add(1))
    }

    /// `other`보다 뒤의 ID인지 (wrap 고려)
    pub fn is_after(self, other: ProductId) -> bool {
        let diff = self.0.wrapping_sub(other.0);
        diff != 0 && diff < (1 << 31)
    }

    /// `earlier`부터 몇 번째 뒤인지
    pub fn distance_from(self, earlier: ProductId) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u32> for ProductId {
    fn from(value: u32) -> Self {
        ProductId(value)
    }
}

/// 세그먼트 종류 (와이어 태그)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum SegmentKind {
    /// 제품 시작 (BOP)
    BeginOfProduct = 0x0001,

    /// 제품 끝 (EOP)
    EndOfProduct = 0x0002,

    /// 멀티캐스트 데이터 블록
    DataSegment = 0x0004,

    /// 재전송 요청 (수신자 → 송신자)
    RetransRequest = 0x0008,

    /// 재전송 거부 (더 이상 보관하지 않는 제품)
    RetransReject = 0x0010,

    /// 재전송 종료 알림 (수신자 → 송신자)
    RetransEnd = 0x0020,

    /// 유니캐스트 재전송 데이터
    RetransData = 0x0040,

    /// 누락된 BOP 요청
    BopRequest = 0x0080,
}

impl SegmentKind {
    pub fn from_wire(tag: u16) -> std::result::Result<Self, DecodeError> {
        Ok(match tag {
            0x0001 => SegmentKind::BeginOfProduct,
            0x0002 => SegmentKind::EndOfProduct,
            0x0004 => SegmentKind::DataSegment,
            0x0008 => SegmentKind::RetransRequest,
            0x0010 => SegmentKind::RetransReject,
            0x0020 => SegmentKind::RetransEnd,
            0x0040 => SegmentKind::RetransData,
            0x0080 => SegmentKind::BopRequest,
            other => return Err(DecodeError::UnknownKind(other)),
        })
    }

    pub fn to_wire(self) -> u16 {
        self as u16
    }

    /// 제품 데이터를 싣는 종류인지
    pub fn carries_data(self) -> bool {
        matches!(self, SegmentKind::DataSegment | SegmentKind::RetransData)
    }
}

/// BOP 페이로드 고정부 크기: start(8+4) + product_size(4) + metadata_len(2)
pub const BOP_FIXED_LEN: usize = 18;

/// BOP 메타데이터 최대 크기
pub const MAX_BOP_METADATA: usize = MAX_PAYLOAD - BOP_FIXED_LEN;

/// 제품 시작 정보 (BOP 페이로드)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BopInfo {
    /// 전송 시작 시각 (UNIX epoch 초)
    pub start_secs: u64,

    /// 전송 시작 시각 (나노초 부분)
    pub start_nanos: u32,

    /// 제품 전체 크기 (바이트)
    pub product_size: u32,

    /// 제품 메타데이터 (상위 계층 정의)
    pub metadata: Bytes,
}

impl BopInfo {
    /// 현재 시각 기준 BOP 생성
    pub fn new(product_size: u32, metadata: Bytes) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            start_secs: now.as_secs(),
            start_nanos: now.subsec_nanos(),
            product_size,
            metadata,
        }
    }

    fn to_payload(&self) -> Result<Bytes> {
        if self.metadata.len() > MAX_BOP_METADATA {
            return Err(Error::Decode(DecodeError::PayloadTooLarge {
                len: self.metadata.len(),
                max: MAX_BOP_METADATA,
            }));
        }
        let mut buf = BytesMut::with_capacity(BOP_FIXED_LEN + self.metadata.len());
        buf.put_u64(self.start_secs);
        buf.put_u32(self.start_nanos);
        buf.put_u32(self.product_size);
        buf.put_u16(self.metadata.len() as u16);
        buf.put_slice(&self.metadata);
        Ok(buf.freeze())
    }

    fn from_payload(payload: &Bytes) -> std::result::Result<Self, DecodeError> {
        if payload.len() < BOP_FIXED_LEN {
            return Err(DecodeError::MalformedPayload("BOP 페이로드가 너무 짧음"));
        }
        let mut cursor = &payload[..];
        let start_secs = cursor.get_u64();
        let start_nanos = cursor.get_u32();
        let product_size = cursor.get_u32();
        let metadata_len = cursor.get_u16() as usize;
        if cursor.remaining() != metadata_len {
            return Err(DecodeError::MalformedPayload("BOP 메타데이터 길이 불일치"));
        }
        Ok(Self {
            start_secs,
            start_nanos,
            product_size,
            metadata: payload.slice(BOP_FIXED_LEN..),
        })
    }
}

/// 프로토콜 데이터 단위
///
/// `payload_len`은 별도 필드 없이 `payload.len()`에서 유도되므로
/// 두 값의 불일치는 표현할 수 없다.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    pub product_id: ProductId,

    /// 제품 내 payload 오프셋 (RetransRequest는 요청 범위 시작)
    pub byte_offset: u32,

    pub kind: SegmentKind,

    pub payload: Bytes,
}

impl Pdu {
    pub fn new(product_id: ProductId, byte_offset: u32, kind: SegmentKind, payload: Bytes) -> Self {
        Self {
            product_id,
            byte_offset,
            kind,
            payload,
        }
    }

    pub fn bop(product_id: ProductId, info: &BopInfo) -> Result<Self> {
        Ok(Self::new(product_id, 0, SegmentKind::BeginOfProduct, info.to_payload()?))
    }

    pub fn data(product_id: ProductId, byte_offset: u32, payload: Bytes) -> Self {
        Self::new(product_id, byte_offset, SegmentKind::DataSegment, payload)
    }

    pub fn eop(product_id: ProductId) -> Self {
        Self::new(product_id, 0, SegmentKind::EndOfProduct, Bytes::new())
    }

    /// 바이트 범위 `[start, start + length)` 재전송 요청
    pub fn retx_request(product_id: ProductId, start: u32, length: u32) -> Self {
        Self::new(
            product_id,
            start,
            SegmentKind::RetransRequest,
            Bytes::copy_from_slice(&length.to_be_bytes()),
        )
    }

    pub fn retx_data(product_id: ProductId, byte_offset: u32, payload: Bytes) -> Self {
        Self::new(product_id, byte_offset, SegmentKind::RetransData, payload)
    }

    pub fn retx_reject(product_id: ProductId) -> Self {
        Self::new(product_id, 0, SegmentKind::RetransReject, Bytes::new())
    }

    pub fn retx_end(product_id: ProductId) -> Self {
        Self::new(product_id, 0, SegmentKind::RetransEnd, Bytes::new())
    }

    pub fn bop_request(product_id: ProductId) -> Self {
        Self::new(product_id, 0, SegmentKind::BopRequest, Bytes::new())
    }

    pub fn payload_len(&self) -> u16 {
        self.payload.len() as u16
    }

    /// BOP 페이로드 해석
    pub fn bop_info(&self) -> std::result::Result<BopInfo, DecodeError> {
        if self.kind != SegmentKind::BeginOfProduct {
            return Err(DecodeError::MalformedPayload("BOP가 아님"));
        }
        BopInfo::from_payload(&self.payload)
    }

    /// 재전송 요청 길이 (바이트)
    pub fn requested_length(&self) -> std::result::Result<u32, DecodeError> {
        if self.kind != SegmentKind::RetransRequest {
            return Err(DecodeError::MalformedPayload("재전송 요청이 아님"));
        }
        let bytes: [u8; 4] = self
            .payload
            .as_ref()
            .try_into()
            .map_err(|_| DecodeError::MalformedPayload("재전송 요청 길이 필드 오류"))?;
        Ok(u32::from_be_bytes(bytes))
    }
}

/// PDU 인코더/디코더
#[derive(Clone)]
pub struct PduCodec {
    auth: Arc<dyn Authenticator>,
    max_payload: usize,
}

impl PduCodec {
    pub fn new(auth: Arc<dyn Authenticator>) -> Self {
        Self::with_max_payload(auth, MAX_PAYLOAD)
    }

    pub fn with_max_payload(auth: Arc<dyn Authenticator>, max_payload: usize) -> Self {
        Self {
            auth,
            max_payload: max_payload.min(u16::MAX as usize),
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// 페이로드 길이에 대한 전체 프레임 크기
    pub fn frame_len(payload_len: usize) -> usize {
        HEADER_LEN + payload_len + AUTH_TAG_SIZE
    }

    /// PDU를 바이트로 인코딩 (MAC 포함)
    pub fn encode(&self, pdu: &Pdu) -> Result<Bytes> {
        if pdu.payload.len() > self.max_payload {
            return Err(Error::Decode(DecodeError::PayloadTooLarge {
                len: pdu.payload.len(),
                max: self.max_payload,
            }));
        }

        let mut buf = BytesMut::with_capacity(Self::frame_len(pdu.payload.len()));
        buf.put_u32(pdu.product_id.0);
        buf.put_u32(pdu.byte_offset);
        buf.put_u16(pdu.payload_len());
        buf.put_u16(pdu.kind.to_wire());
        buf.put_slice(&pdu.payload);

        let tag = self.auth.sign(&buf);
        buf.put_slice(&tag);
        Ok(buf.freeze())
    }

    /// 헤더만 보고 프레임 전체 길이 계산 (스트림 프레이밍용)
    ///
    /// 선언된 payload 길이가 상한을 넘으면 버퍼를 할당하기 전에 거부한다.
    pub fn peek_frame_len(&self, header: &[u8]) -> std::result::Result<usize, DecodeError> {
        if header.len() < HEADER_LEN {
            return Err(DecodeError::Truncated {
                needed: HEADER_LEN,
                got: header.len(),
            });
        }
        let payload_len = u16::from_be_bytes([header[8], header[9]]) as usize;
        if payload_len > self.max_payload {
            return Err(DecodeError::PayloadTooLarge {
                len: payload_len,
                max: self.max_payload,
            });
        }
        Ok(Self::frame_len(payload_len))
    }

    /// 바이트에서 PDU 디코딩 및 MAC 검증
    pub fn decode(&self, buf: &[u8]) -> std::result::Result<Pdu, DecodeError> {
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::Truncated {
                needed: HEADER_LEN,
                got: buf.len(),
            });
        }

        let mut header = &buf[..HEADER_LEN];
        let product_id = ProductId(header.get_u32());
        let byte_offset = header.get_u32();
        let payload_len = header.get_u16() as usize;
        let kind_tag = header.get_u16();

        if payload_len > self.max_payload {
            return Err(DecodeError::PayloadTooLarge {
                len: payload_len,
                max: self.max_payload,
            });
        }

        let remaining = buf.len() - HEADER_LEN;
        if remaining != payload_len + AUTH_TAG_SIZE {
            return Err(DecodeError::LengthMismatch {
                declared: payload_len,
                available: remaining.saturating_sub(AUTH_TAG_SIZE),
            });
        }

        let signed_len = HEADER_LEN + payload_len;
        if !self.auth.verify(&buf[..signed_len], &buf[signed_len..]) {
            return Err(DecodeError::AuthFailed);
        }

        let kind = SegmentKind::from_wire(kind_tag)?;
        let payload = Bytes::copy_from_slice(&buf[HEADER_LEN..signed_len]);

        Ok(Pdu {
            product_id,
            byte_offset,
            kind,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Blake3Authenticator, MacKey};

    fn codec() -> PduCodec {
        PduCodec::new(Arc::new(Blake3Authenticator::new(MacKey::from_bytes([7u8; 32]))))
    }

    #[test]
    fn test_roundtrip_each_kind() {
        let codec = codec();
        let info = BopInfo::new(2800, Bytes::from_static(b"SDUS54 KOUN"));
        let pdus = vec![
            Pdu::bop(ProductId(1), &info).unwrap(),
            Pdu::data(ProductId(1), 1400, Bytes::from(vec![0xAB; 1400])),
            Pdu::eop(ProductId(1)),
            Pdu::retx_request(ProductId(u32::MAX), 2800, 4200),
            Pdu::retx_data(ProductId(1), 0, Bytes::from_static(b"abc")),
            Pdu::retx_reject(ProductId(9)),
            Pdu::retx_end(ProductId(9)),
            Pdu::bop_request(ProductId(3)),
        ];

        for pdu in pdus {
            let bytes = codec.encode(&pdu).unwrap();
            assert_eq!(bytes.len(), PduCodec::frame_len(pdu.payload.len()));
            assert_eq!(codec.decode(&bytes).unwrap(), pdu);
        }
    }

    #[test]
    fn test_big_endian_header() {
        let codec = codec();
        let pdu = Pdu::data(ProductId(0x01020304), 0x0A0B0C0D, Bytes::from_static(b"xy"));
        let bytes = codec.encode(&pdu).unwrap();
        assert_eq!(&bytes[..12], &[1, 2, 3, 4, 0x0A, 0x0B, 0x0C, 0x0D, 0, 2, 0, 0x04]);
    }

    #[test]
    fn test_flipped_tag_fails_auth() {
        let codec = codec();
        let bytes = codec
            .encode(&Pdu::data(ProductId(5), 0, Bytes::from_static(b"payload")))
            .unwrap();

        for i in (bytes.len() - AUTH_TAG_SIZE)..bytes.len() {
            let mut corrupted = bytes.to_vec();
            corrupted[i] ^= 0x01;
            assert_eq!(codec.decode(&corrupted), Err(DecodeError::AuthFailed));
        }
    }

    #[test]
    fn test_flipped_payload_fails_auth() {
        let codec = codec();
        let mut bytes = codec
            .encode(&Pdu::data(ProductId(5), 0, Bytes::from_static(b"payload")))
            .unwrap()
            .to_vec();
        bytes[HEADER_LEN] ^= 0xFF;
        assert_eq!(codec.decode(&bytes), Err(DecodeError::AuthFailed));
    }

    #[test]
    fn test_truncated_header() {
        let codec = codec();
        let bytes = codec.encode(&Pdu::eop(ProductId(5))).unwrap();
        for len in 0..HEADER_LEN {
            assert!(matches!(
                codec.decode(&bytes[..len]),
                Err(DecodeError::Truncated { needed: HEADER_LEN, .. })
            ));
        }
    }

    #[test]
    fn test_length_mismatch() {
        let codec = codec();
        let bytes = codec
            .encode(&Pdu::data(ProductId(5), 0, Bytes::from(vec![1u8; 100])))
            .unwrap();
        // payload 중간에서 잘림
        assert!(matches!(
            codec.decode(&bytes[..HEADER_LEN + 50]),
            Err(DecodeError::LengthMismatch { declared: 100, .. })
        ));
    }

    #[test]
    fn test_oversized_declared_length_rejected() {
        let codec = PduCodec::with_max_payload(
            Arc::new(Blake3Authenticator::new(MacKey::from_bytes([7u8; 32]))),
            64,
        );
        let mut header = vec![0u8; HEADER_LEN];
        header[8..10].copy_from_slice(&1000u16.to_be_bytes());
        assert!(matches!(
            codec.decode(&header),
            Err(DecodeError::PayloadTooLarge { len: 1000, max: 64 })
        ));
        assert!(matches!(
            codec.peek_frame_len(&header),
            Err(DecodeError::PayloadTooLarge { .. })
        ));
        assert!(codec
            .encode(&Pdu::data(ProductId(1), 0, Bytes::from(vec![0u8; 65])))
            .is_err());
    }

    #[test]
    fn test_unknown_kind() {
        let auth = Arc::new(Blake3Authenticator::new(MacKey::from_bytes([7u8; 32])));
        let codec = PduCodec::new(auth.clone());
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u32(0);
        buf.put_u16(0);
        buf.put_u16(0x8000);
        let tag = auth.sign(&buf);
        buf.put_slice(&tag);
        assert_eq!(codec.decode(&buf), Err(DecodeError::UnknownKind(0x8000)));
    }

    #[test]
    fn test_bop_info_and_request_length() {
        let info = BopInfo::new(10_000, Bytes::from_static(b"meta"));
        let bop = Pdu::bop(ProductId(2), &info).unwrap();
        assert_eq!(bop.bop_info().unwrap(), info);

        let req = Pdu::retx_request(ProductId(2), 1400, 2800);
        assert_eq!(req.requested_length().unwrap(), 2800);
        assert_eq!(req.payload_len(), 4);
        assert!(bop.requested_length().is_err());
    }

    #[test]
    fn test_product_id_wraparound_ordering() {
        assert!(ProductId(1).is_after(ProductId(0)));
        assert!(ProductId(0).is_after(ProductId(u32::MAX)));
        assert!(!ProductId(u32::MAX).is_after(ProductId(0)));
        assert!(!ProductId(5).is_after(ProductId(5)));
        assert_eq!(ProductId(2).distance_from(ProductId(u32::MAX)), 3);
        assert_eq!(ProductId(u32::MAX).next(), ProductId(0));
    }
}

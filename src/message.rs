//! 핸드쉐이크 메시지 정의
//!
//! 유니캐스트(TCP) 연결 직후 한 번만 교환한다.
//! 이후 같은 연결에서는 PDU 프레임만 오간다.
//!
//! 프레임: length(u32 BE) + bincode(HandshakeFrame)

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::PUBLIC_KEY_SIZE;
use crate::{Error, Result, PROTOCOL_VERSION};

/// 매직 넘버 (핸드쉐이크 식별용, "FMTP")
pub const HANDSHAKE_MAGIC: u32 = 0x464D_5450;

/// 핸드쉐이크 프레임 최대 크기
pub const MAX_HANDSHAKE_LEN: usize = 1024;

/// 핸드쉐이크 메시지
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeMessage {
    /// 수신측 → 송신측
    Hello {
        protocol_version: u8,
        /// 수신측 임시 공개키 (X25519)
        public_key: [u8; PUBLIC_KEY_SIZE],
    },

    /// 송신측 → 수신측
    Welcome {
        protocol_version: u8,
        /// 송신측 임시 공개키 (X25519)
        public_key: [u8; PUBLIC_KEY_SIZE],
        /// 봉인된 세션 MAC 키
        sealed_mac_key: Vec<u8>,
        /// 세션 블록 크기
        block_size: u16,
    },

    /// 송신측 → 수신측 (거절)
    Refused { reason: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct HandshakeFrame {
    magic: u32,
    message: HandshakeMessage,
}

impl HandshakeMessage {
    pub fn hello(public_key: [u8; PUBLIC_KEY_SIZE]) -> Self {
        HandshakeMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            public_key,
        }
    }

    pub fn welcome(
        public_key: [u8; PUBLIC_KEY_SIZE],
        sealed_mac_key: Vec<u8>,
        block_size: u16,
    ) -> Self {
        HandshakeMessage::Welcome {
            protocol_version: PROTOCOL_VERSION,
            public_key,
            sealed_mac_key,
            block_size,
        }
    }

    /// 길이 접두 프레임으로 직렬화
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(&HandshakeFrame {
            magic: HANDSHAKE_MAGIC,
            message: self.clone(),
        })?;
        if body.len() > MAX_HANDSHAKE_LEN {
            return Err(Error::Handshake(format!(
                "핸드쉐이크 메시지 너무 큼: {} 바이트",
                body.len()
            )));
        }

        let mut buf = Vec::with_capacity(4 + body.len());
        buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// 길이 접두를 제외한 본문에서 역직렬화
    pub fn from_body(body: &[u8]) -> Result<Self> {
        let frame: HandshakeFrame = bincode::deserialize(body)?;
        if frame.magic != HANDSHAKE_MAGIC {
            return Err(Error::Handshake(format!(
                "잘못된 매직 넘버: {:#010x}",
                frame.magic
            )));
        }
        Ok(frame.message)
    }
}

/// 핸드쉐이크 메시지 송신
pub async fn write_handshake<W>(writer: &mut W, message: &HandshakeMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = message.to_bytes()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// 핸드쉐이크 메시지 수신
pub async fn read_handshake<R>(reader: &mut R) -> Result<HandshakeMessage>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    read_exact_or_closed(reader, &mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_HANDSHAKE_LEN {
        return Err(Error::Handshake(format!("잘못된 핸드쉐이크 길이: {}", len)));
    }

    let mut body = vec![0u8; len];
    read_exact_or_closed(reader, &mut body).await?;
    HandshakeMessage::from_body(&body)
}

async fn read_exact_or_closed<R>(reader: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::ConnectionClosed),
        Err(e) => Err(e.into()),
    }
}

//! 전송 채널
//!
//! - `MulticastChannel`: UDP 멀티캐스트 그룹 송수신 (데이터그램 1개 = PDU 1개)
//! - `UnicastChannel`: TCP 재전송 채널 (요청/재전송 데이터 전용)
//!
//! 그룹 주소가 멀티캐스트가 아니면 일반 UDP로 동작한다 (루프백 시험용).

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, info, warn};

use crate::pdu::{Pdu, PduCodec};
use crate::{Config, Error, Result, HEADER_LEN, MAX_DATAGRAM};

/// 최대 `attempts`회 시도, 실패 사이에 `delay` 대기
async fn with_retries<T, F, Fut>(what: &str, attempts: u32, delay: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                warn!("{} 실패 ({}/{}): {}", what, attempt, attempts, e);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(source) => return Err(Error::ChannelSetup { attempts, source }),
        }
    }
}

/// 멀티캐스트 채널
pub struct MulticastChannel {
    socket: UdpSocket,
    group: SocketAddr,
}

impl MulticastChannel {
    /// 수신용: 그룹 포트에 바인드 후 그룹 가입
    pub async fn join(group: SocketAddr, interface: Ipv4Addr, config: &Config) -> Result<Self> {
        let recv_buffer = config.recv_buffer_size;
        let socket = with_retries(
            "멀티캐스트 그룹 가입",
            config.join_attempts,
            config.join_retry(),
            || async move { make_receive_socket(group, interface, recv_buffer) },
        )
        .await?;

        info!("멀티캐스트 수신 준비: {} (iface {})", group, interface);
        Ok(Self {
            socket: UdpSocket::from_std(socket)?,
            group,
        })
    }

    /// 송신용: 임의 포트에 바인드, 그룹으로 전송
    pub async fn open_sender(group: SocketAddr, interface: Ipv4Addr, config: &Config) -> Result<Self> {
        let ttl = config.multicast_ttl;
        let socket = with_retries(
            "멀티캐스트 송신 소켓 생성",
            config.join_attempts,
            config.join_retry(),
            || async move { make_send_socket(group, interface, ttl) },
        )
        .await?;

        info!("멀티캐스트 송신 준비: {} (ttl {})", group, ttl);
        Ok(Self {
            socket: UdpSocket::from_std(socket)?,
            group,
        })
    }

    pub fn group(&self) -> SocketAddr {
        self.group
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// 인코딩된 프레임 전송
    pub async fn send(&self, frame: &[u8]) -> Result<()> {
        self.socket.send_to(frame, self.group).await?;
        Ok(())
    }

    pub async fn send_pdu(&self, codec: &PduCodec, pdu: &Pdu) -> Result<usize> {
        let frame = codec.encode(pdu)?;
        self.send(&frame).await?;
        Ok(frame.len())
    }

    /// PDU 하나 수신
    ///
    /// 디코딩 실패는 `Error::Decode`로 돌려주며 다음 호출은 정상 동작한다.
    pub async fn recv_pdu(&self, codec: &PduCodec) -> Result<Pdu> {
        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, _from) = self.socket.recv_from(&mut buf).await?;
        Ok(codec.decode(&buf[..len])?)
    }
}

fn make_receive_socket(group: SocketAddr, interface: Ipv4Addr, recv_buffer: usize) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(group), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if let Err(e) = socket.set_recv_buffer_size(recv_buffer) {
        debug!("SO_RCVBUF 설정 실패: {}", e);
    }
    socket.set_nonblocking(true)?;

    match group.ip() {
        IpAddr::V4(ip) if ip.is_multicast() => {
            let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), group.port());
            socket.bind(&bind.into())?;
            socket.join_multicast_v4(&ip, &interface)?;
        }
        IpAddr::V6(ip) if ip.is_multicast() => {
            let bind = SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), group.port());
            socket.bind(&bind.into())?;
            socket.join_multicast_v6(&ip, 0)?;
        }
        _ => socket.bind(&group.into())?,
    }
    Ok(socket.into())
}

fn make_send_socket(group: SocketAddr, interface: Ipv4Addr, ttl: u32) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(group), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    match group.ip() {
        IpAddr::V4(ip) => {
            socket.bind(&SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0).into())?;
            if ip.is_multicast() {
                socket.set_multicast_ttl_v4(ttl)?;
                socket.set_multicast_loop_v4(true)?;
                if !interface.is_unspecified() {
                    socket.set_multicast_if_v4(&interface)?;
                }
            }
        }
        IpAddr::V6(ip) => {
            socket.bind(&SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0).into())?;
            if ip.is_multicast() {
                socket.set_multicast_hops_v6(ttl)?;
            }
        }
    }
    Ok(socket.into())
}

/// 재전송 채널 리스너 (송신측)
pub struct UnicastListener {
    listener: TcpListener,
}

impl UnicastListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::ChannelSetup { attempts: 1, source })?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn accept(&self) -> Result<UnicastChannel> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok(UnicastChannel { stream, peer })
    }
}

/// 재전송 채널 (TCP)
pub struct UnicastChannel {
    stream: TcpStream,
    peer: SocketAddr,
}

impl UnicastChannel {
    /// 송신측에 연결 (최대 `join_attempts`회)
    pub async fn connect(addr: SocketAddr, config: &Config) -> Result<Self> {
        let stream = with_retries(
            "재전송 채널 연결",
            config.join_attempts,
            config.join_retry(),
            || TcpStream::connect(addr),
        )
        .await?;
        stream.set_nodelay(true)?;
        info!("재전송 채널 연결: {}", addr);
        Ok(Self { stream, peer: addr })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// 핸드쉐이크용 원시 스트림
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// 읽기/쓰기 반으로 분리
    pub fn into_split(self, codec: Arc<PduCodec>) -> (UnicastReader, UnicastWriter) {
        let (read, write) = self.stream.into_split();
        (
            UnicastReader {
                half: read,
                codec: codec.clone(),
                peer: self.peer,
            },
            UnicastWriter { half: write, codec },
        )
    }
}

/// 재전송 채널 읽기
pub struct UnicastReader {
    half: OwnedReadHalf,
    codec: Arc<PduCodec>,
    peer: SocketAddr,
}

impl UnicastReader {
    /// PDU 프레임 하나 수신
    ///
    /// 헤더가 잘못되면 스트림 경계를 잃으므로 `InvalidData` IO 에러(Fatal)를 돌려준다.
    /// 프레임 경계가 정상이면 인증 실패 등은 `Error::Decode`.
    pub async fn recv_pdu(&mut self) -> Result<Pdu> {
        let mut header = [0u8; HEADER_LEN];
        read_exact_or_closed(&mut self.half, &mut header).await?;

        let frame_len = self.codec.peek_frame_len(&header).map_err(|e| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{}: {}", self.peer, e),
            ))
        })?;

        let mut frame = vec![0u8; frame_len];
        frame[..HEADER_LEN].copy_from_slice(&header);
        read_exact_or_closed(&mut self.half, &mut frame[HEADER_LEN..]).await?;
        Ok(self.codec.decode(&frame)?)
    }
}

/// 재전송 채널 쓰기
pub struct UnicastWriter {
    half: OwnedWriteHalf,
    codec: Arc<PduCodec>,
}

impl UnicastWriter {
    pub async fn send_pdu(&mut self, pdu: &Pdu) -> Result<()> {
        let frame = self.codec.encode(pdu)?;
        self.half.write_all(&frame).await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.half.shutdown().await?;
        Ok(())
    }
}

async fn read_exact_or_closed(half: &mut OwnedReadHalf, buf: &mut [u8]) -> Result<()> {
    match half.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::ConnectionClosed),
        Err(e) => Err(e.into()),
    }
}

//! 송신 세션
//!
//! - 제품을 BOP / 데이터 블록 / EOP로 나눠 멀티캐스트
//! - 토큰 버킷 pacing
//! - 보관 기간 동안 제품을 유지하며 재전송 채널 요청에 응답

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::auth::{Blake3Authenticator, MacKey};
use crate::channel::{MulticastChannel, UnicastChannel, UnicastListener, UnicastWriter};
use crate::crypto::EphemeralKeyPair;
use crate::error::ErrorClass;
use crate::message::{read_handshake, write_handshake, HandshakeMessage};
use crate::pdu::{BopInfo, Pdu, PduCodec, ProductId, SegmentKind};
use crate::session::{wait_for_shutdown, SessionEvent, SessionState, ShutdownSignal, StateMachine};
use crate::shaper::RateShaper;
use crate::stats::{SessionStats, StatsSnapshot};
use crate::{Config, Error, Result, PROTOCOL_VERSION};

/// 재전송용으로 보관 중인 제품
#[derive(Debug, Clone)]
struct RetainedProduct {
    info: BopInfo,
    data: Bytes,
    sent_at: Instant,
}

/// 송신 세션 공유 상태
struct SenderShared {
    config: Config,
    mac_key: MacKey,
    codec: Arc<PduCodec>,
    retained: DashMap<ProductId, RetainedProduct>,
    machine: StateMachine,
    stats: SessionStats,
    shutdown: ShutdownSignal,
}

impl SenderShared {
    /// 보관 기간이 지난 제품 제거
    fn sweep_retained(&self, now: Instant) -> usize {
        let retention = self.config.retention();
        let before = self.retained.len();
        self.retained
            .retain(|_, p| now.saturating_duration_since(p.sent_at) < retention);
        let removed = before.saturating_sub(self.retained.len());
        if removed > 0 {
            debug!("보관 기간 만료 제품 {}개 제거", removed);
        }
        removed
    }

    /// 재전송 요청 응답 PDU 목록
    ///
    /// 보관하지 않는 제품이면 RetransReject 하나.
    fn retransmission_for(&self, product_id: ProductId, offset: u32, length: u32) -> Vec<Pdu> {
        // DashMap 참조를 await 너머로 들고 가지 않도록 복사
        let Some(data) = self.retained.get(&product_id).map(|p| p.data.clone()) else {
            return vec![Pdu::retx_reject(product_id)];
        };

        let block = self.config.block_size;
        let size = data.len();
        let end = (offset as usize).saturating_add(length as usize).min(size);
        let mut start = (offset as usize / block) * block;

        let mut pdus = Vec::new();
        while start < end {
            let block_end = (start + block).min(size);
            pdus.push(Pdu::retx_data(
                product_id,
                start as u32,
                data.slice(start..block_end),
            ));
            start = block_end;
        }
        pdus
    }

    fn bop_for(&self, product_id: ProductId) -> Result<Pdu> {
        match self.retained.get(&product_id).map(|p| p.info.clone()) {
            Some(info) => Pdu::bop(product_id, &info),
            None => Ok(Pdu::retx_reject(product_id)),
        }
    }
}

/// 송신 세션
pub struct SenderSession {
    shared: Arc<SenderShared>,
    multicast: MulticastChannel,
    shaper: RateShaper,
    unicast_addr: SocketAddr,
    next_id: AtomicU32,
    send_lock: tokio::sync::Mutex<()>,
    supervisor: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SenderSession {
    /// 멀티캐스트 송신 소켓과 재전송 채널 리스너를 열고 시작
    pub async fn start(
        config: Config,
        group: SocketAddr,
        interface: Ipv4Addr,
        unicast_bind: SocketAddr,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        config.validate()?;
        let (machine, events) = StateMachine::new("송신");

        let opened = tokio::try_join!(
            MulticastChannel::open_sender(group, interface, &config),
            UnicastListener::bind(unicast_bind),
        );
        let (multicast, listener) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                error!("송신 세션 설정 실패: {}", e);
                let _ = machine.transition(SessionState::Closed);
                return Err(e);
            }
        };
        let unicast_addr = listener.local_addr()?;
        info!(
            "FMTP 송신 세션 시작: group={}, 재전송 채널={}",
            group, unicast_addr
        );

        let mac_key = MacKey::generate();
        let codec = Arc::new(PduCodec::new(Arc::new(Blake3Authenticator::new(
            mac_key.clone(),
        ))));
        let shutdown = ShutdownSignal::new();
        let shaper = RateShaper::new(config.rate_bps, config.burst_bits, shutdown.subscribe());

        let shared = Arc::new(SenderShared {
            config,
            mac_key,
            codec,
            retained: DashMap::new(),
            machine,
            stats: SessionStats::new(),
            shutdown: shutdown.clone(),
        });
        shared.machine.transition(SessionState::Active)?;

        let workers = vec![
            tokio::spawn(accept_loop(shared.clone(), listener, shutdown.subscribe())),
            tokio::spawn(sweep_loop(shared.clone(), shutdown.subscribe())),
        ];

        let supervisor = {
            let shared = shared.clone();
            let mut shutdown_rx = shutdown.subscribe();
            tokio::spawn(async move {
                wait_for_shutdown(&mut shutdown_rx).await;
                if let Err(e) = shared.machine.transition(SessionState::Draining) {
                    warn!("{}", e);
                }
                for worker in workers {
                    if let Err(e) = worker.await {
                        error!("송신 태스크 비정상 종료: {}", e);
                    }
                }
                shared.retained.clear();
                if let Err(e) = shared.machine.transition(SessionState::Closed) {
                    warn!("{}", e);
                }
                info!("{}", shared.stats.snapshot().summary());
            })
        };

        Ok((
            Self {
                shared,
                multicast,
                shaper,
                unicast_addr,
                next_id: AtomicU32::new(0),
                send_lock: tokio::sync::Mutex::new(()),
                supervisor: tokio::sync::Mutex::new(Some(supervisor)),
            },
            events,
        ))
    }

    /// 재전송 채널 주소 (수신자가 연결할 곳)
    pub fn unicast_addr(&self) -> SocketAddr {
        self.unicast_addr
    }

    pub fn group(&self) -> SocketAddr {
        self.multicast.group()
    }

    pub fn state(&self) -> SessionState {
        self.shared.machine.state()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// 재전송용으로 보관 중인 제품 수
    pub fn retained_count(&self) -> usize {
        self.shared.retained.len()
    }

    /// 송신 속도 변경
    pub async fn configure_rate(&self, rate_bps: u64, burst_bits: u64) {
        self.shaper.configure(rate_bps, burst_bits).await;
        info!("송신 속도 변경: {} bit/s, 버스트 {} bit", rate_bps, burst_bits);
    }

    /// 제품 하나 멀티캐스트
    ///
    /// 제품은 호출 순서대로 하나씩 나간다. 종료 중이면 `Error::Shutdown`.
    pub async fn send_product(&self, data: Bytes, metadata: Bytes) -> Result<ProductId> {
        if self.state() != SessionState::Active {
            return Err(Error::Shutdown);
        }
        let max = self.shared.config.max_product_size.min(u32::MAX as u64);
        if data.len() as u64 > max {
            return Err(Error::ProductTooLarge {
                size: data.len() as u64,
                max,
            });
        }

        let _guard = self.send_lock.lock().await;
        let product_id = ProductId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let info = BopInfo::new(data.len() as u32, metadata);
        let bop = Pdu::bop(product_id, &info)?;

        self.shared.retained.insert(
            product_id,
            RetainedProduct {
                info,
                data: data.clone(),
                sent_at: Instant::now(),
            },
        );

        let started = Instant::now();
        self.send_paced(&bop).await?;
        let block = self.shared.config.block_size;
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + block).min(data.len());
            self.send_paced(&Pdu::data(product_id, offset as u32, data.slice(offset..end)))
                .await?;
            offset = end;
        }
        self.send_paced(&Pdu::eop(product_id)).await?;

        self.shared.stats.record_product_sent();
        info!(
            "제품 {} 송신: {} bytes, {:.2}ms",
            product_id,
            data.len(),
            started.elapsed().as_secs_f64() * 1000.0
        );
        Ok(product_id)
    }

    async fn send_paced(&self, pdu: &Pdu) -> Result<()> {
        let frame = self.shared.codec.encode(pdu)?;
        self.shaper.acquire(frame.len() as u64 * 8).await?;
        match self.multicast.send(&frame).await {
            Ok(()) => {
                self.shared.stats.record_sent(frame.len());
                Ok(())
            }
            // 수신측 재전송 요청으로 복구된다
            Err(e) if e.class() == ErrorClass::Transient => {
                debug!("멀티캐스트 송신 일시 실패 {}: {}", pdu.product_id, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// 종료 요청 후 `Closed`까지 대기
    pub async fn shutdown(&self) {
        self.shared.shutdown.trigger();
        self.wait_closed().await;
    }

    pub async fn wait_closed(&self) {
        let handle = self.supervisor.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("송신 세션 종료 처리 실패: {}", e);
            }
        }
    }
}

async fn accept_loop(
    shared: Arc<SenderShared>,
    listener: UnicastListener,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut responders = JoinSet::new();
    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok(channel) => {
                    info!("수신자 연결: {}", channel.peer_addr());
                    responders.spawn(serve_receiver(shared.clone(), channel, shutdown.clone()));
                }
                Err(e) => warn!("재전송 채널 accept 실패: {}", e),
            },
            Some(done) = responders.join_next(), if !responders.is_empty() => {
                if let Err(e) = done {
                    error!("재전송 응답 태스크 비정상 종료: {}", e);
                }
            }
        }
    }
    responders.shutdown().await;
    debug!("재전송 채널 accept 루프 종료");
}

/// 송신측 핸드쉐이크: Hello 수신 후 봉인된 MAC 키를 담은 Welcome 송신
async fn handshake(shared: &SenderShared, channel: &mut UnicastChannel) -> Result<()> {
    let stream = channel.stream_mut();
    let (protocol_version, peer_key) = match read_handshake(stream).await? {
        HandshakeMessage::Hello {
            protocol_version,
            public_key,
        } => (protocol_version, public_key),
        other => {
            return Err(Error::Handshake(format!(
                "예상하지 못한 메시지: {:?}",
                other
            )))
        }
    };

    if protocol_version != PROTOCOL_VERSION {
        let reason = format!(
            "프로토콜 버전 불일치: {} != {}",
            protocol_version, PROTOCOL_VERSION
        );
        write_handshake(
            stream,
            &HandshakeMessage::Refused {
                reason: reason.clone(),
            },
        )
        .await?;
        return Err(Error::Handshake(reason));
    }

    let keypair = EphemeralKeyPair::generate();
    let public_key = keypair.public_key_bytes();
    let sealed = keypair.establish(&peer_key).seal(&shared.mac_key)?;
    let welcome = HandshakeMessage::welcome(public_key, sealed, shared.config.block_size as u16);
    write_handshake(stream, &welcome).await
}

async fn serve_receiver(
    shared: Arc<SenderShared>,
    mut channel: UnicastChannel,
    mut shutdown: watch::Receiver<bool>,
) {
    let peer = channel.peer_addr();
    let limit = shared.config.handshake_timeout();
    match tokio::time::timeout(limit, handshake(&shared, &mut channel)).await {
        Ok(Ok(())) => debug!("핸드쉐이크 완료: {}", peer),
        Ok(Err(e)) => {
            warn!("핸드쉐이크 실패 {}: {}", peer, e);
            return;
        }
        Err(_) => {
            warn!("핸드쉐이크 시간 초과: {}", peer);
            return;
        }
    }

    let (mut reader, mut writer) = channel.into_split(shared.codec.clone());
    loop {
        let pdu = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            result = reader.recv_pdu() => match result {
                Ok(pdu) => pdu,
                Err(Error::ConnectionClosed) => {
                    info!("수신자 연결 종료: {}", peer);
                    break;
                }
                Err(e) if e.class() == ErrorClass::Protocol => {
                    shared.stats.record_malformed();
                    warn!("{} 요청 폐기: {}", peer, e);
                    continue;
                }
                Err(e) => {
                    warn!("{} 재전송 채널 에러: {}", peer, e);
                    break;
                }
            },
        };
        shared.stats.record_received(PduCodec::frame_len(pdu.payload.len()));

        if let Err(e) = respond(&shared, &mut writer, pdu).await {
            warn!("{} 응답 실패: {}", peer, e);
            break;
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!("재전송 채널 닫기 실패 {}: {}", peer, e);
    }
}

async fn respond(shared: &SenderShared, writer: &mut UnicastWriter, pdu: Pdu) -> Result<()> {
    let product_id = pdu.product_id;
    let replies = match pdu.kind {
        SegmentKind::RetransRequest => {
            shared.stats.record_retx_request();
            let length = match pdu.requested_length() {
                Ok(length) => length,
                Err(e) => {
                    shared.stats.record_malformed();
                    warn!("재전송 요청 형식 오류 {}: {}", product_id, e);
                    return Ok(());
                }
            };
            debug!(
                "재전송 요청 {}: offset={}, length={}",
                product_id, pdu.byte_offset, length
            );
            shared.retransmission_for(product_id, pdu.byte_offset, length)
        }
        SegmentKind::BopRequest => {
            shared.stats.record_bop_request();
            vec![shared.bop_for(product_id)?]
        }
        SegmentKind::RetransEnd => {
            shared.stats.record_retx_end();
            debug!("재전송 종료 {}", product_id);
            return Ok(());
        }
        other => {
            debug!("송신측에서 무시하는 세그먼트: {:?} {}", other, product_id);
            return Ok(());
        }
    };

    for reply in replies {
        match reply.kind {
            SegmentKind::RetransReject => {
                shared.stats.record_retx_reject();
                debug!("재전송 거부 {}: 보관하지 않는 제품", product_id);
            }
            SegmentKind::RetransData => shared.stats.record_retx_data(),
            _ => {}
        }
        writer.send_pdu(&reply).await?;
        shared.stats.record_sent(PduCodec::frame_len(reply.payload.len()));
    }
    Ok(())
}

async fn sweep_loop(shared: Arc<SenderShared>, mut shutdown: watch::Receiver<bool>) {
    let period = (shared.config.retention() / 4).max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            _ = ticker.tick() => {
                shared.sweep_retained(Instant::now());
            }
        }
    }
}

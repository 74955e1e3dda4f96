//! 수신 세션
//!
//! - 멀티캐스트 수신 루프: PDU 디코딩 후 블록 추적기 갱신
//! - 재전송 채널 루프: 재전송 데이터/거부 수신, 요청 송신
//! - 주기 타이머: 누락 판정, 재전송 요청, 손실 판정
//!
//! 추적기와 재전송 큐는 각자 잠금 하나로 보호한다.
//! 잠금 순서는 항상 추적기 → 큐이며 await 중에는 잡지 않는다.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::auth::{Blake3Authenticator, MacKey};
use crate::channel::{MulticastChannel, UnicastChannel, UnicastReader, UnicastWriter};
use crate::crypto::EphemeralKeyPair;
use crate::error::{DecodeError, ErrorClass};
use crate::message::{read_handshake, write_handshake, HandshakeMessage};
use crate::pdu::{Pdu, PduCodec, ProductId, SegmentKind};
use crate::retransmit::{RetransmissionQueue, RetryPolicy};
use crate::session::{
    wait_for_shutdown, LossReason, ProductQueue, SessionEvent, SessionState, ShutdownSignal,
    StateMachine,
};
use crate::stats::{SessionStats, StatsSnapshot};
use crate::tracker::{BlockRange, BlockTracker, CompletedProduct, TrackerEvent};
use crate::{Config, Error, Result, PROTOCOL_VERSION};

/// 세션 이벤트 수신기 타입
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// 수신 세션 공유 상태
struct ReceiverShared {
    config: Config,
    tracker: Mutex<BlockTracker>,
    queue: Mutex<RetransmissionQueue>,
    products: Arc<dyn ProductQueue>,
    machine: StateMachine,
    stats: SessionStats,
    control_tx: mpsc::UnboundedSender<Pdu>,
    shutdown: ShutdownSignal,
}

impl ReceiverShared {
    fn handle_pdu(&self, pdu: Pdu, via_unicast: bool) {
        self.stats.record_received(PduCodec::frame_len(pdu.payload.len()));
        match pdu.kind {
            SegmentKind::BeginOfProduct => self.on_bop(&pdu, via_unicast),
            SegmentKind::DataSegment => self.on_data(&pdu, false),
            SegmentKind::RetransData => self.on_data(&pdu, true),
            SegmentKind::EndOfProduct => self.on_eop(pdu.product_id),
            SegmentKind::RetransReject => self.on_reject(pdu.product_id),
            SegmentKind::RetransRequest | SegmentKind::RetransEnd | SegmentKind::BopRequest => {
                debug!("수신측에서 무시하는 세그먼트: {:?} {}", pdu.kind, pdu.product_id);
            }
        }
        self.process_events();
    }

    fn on_bop(&self, pdu: &Pdu, via_unicast: bool) {
        let product_id = pdu.product_id;
        let info = match pdu.bop_info() {
            Ok(info) => info,
            Err(e) => {
                self.handle_error("BOP", e.into());
                return;
            }
        };

        let (result, missing) = {
            let mut tracker = self.tracker.lock();
            let result = tracker.begin(product_id, info);
            (result, tracker.missing_ranges(product_id))
        };

        match result {
            Ok(_) => {
                let mut queue = self.queue.lock();
                queue.on_bop_received(product_id);
                // 재전송된 BOP면 남은 블록을 바로 요청
                if via_unicast && !missing.is_empty() {
                    queue.on_gap_detected(product_id, &missing);
                }
            }
            Err(e) => {
                warn!("제품 {} 거부: {}", product_id, e);
                self.queue.lock().drop_product(product_id);
                if self.tracker.lock().reject(product_id) {
                    self.report_lost(product_id, LossReason::Invalid);
                }
            }
        }
    }

    fn on_data(&self, pdu: &Pdu, retransmitted: bool) {
        let product_id = pdu.product_id;
        let outcome = {
            let mut tracker = self.tracker.lock();
            let finished = tracker.is_finished(product_id);
            let before = tracker.received_count(product_id);
            match tracker.insert_block(product_id, pdu.byte_offset, &pdu.payload) {
                Ok(true) => Ok(false),
                Ok(false) => {
                    Ok(finished || (before.is_some() && tracker.received_count(product_id) == before))
                }
                Err(e) => Err(e),
            }
        };

        match outcome {
            Ok(duplicate) => {
                if duplicate {
                    self.stats.record_duplicate();
                }
            }
            Err(e) => {
                self.handle_error("데이터 세그먼트", e);
                return;
            }
        }

        if retransmitted {
            self.stats.record_retx_data();
            let range = BlockRange::from_byte_range(
                pdu.byte_offset,
                pdu.payload.len() as u32,
                self.config.block_size,
            );
            self.queue.lock().on_satisfied(product_id, range);
        }
    }

    /// EOP: 송신측 멀티캐스트가 끝났으므로 누락 구간을 바로 요청
    fn on_eop(&self, product_id: ProductId) {
        let (missing, needs_bop) = {
            let mut tracker = self.tracker.lock();
            if !tracker.mark_eop(product_id) {
                return;
            }
            (tracker.missing_ranges(product_id), tracker.needs_bop(product_id))
        };

        if missing.is_empty() && !needs_bop {
            return;
        }
        debug!(
            "EOP 수신 {}: 누락 구간 {}개, BOP 필요 {}",
            product_id,
            missing.len(),
            needs_bop
        );
        let mut queue = self.queue.lock();
        queue.on_gap_detected(product_id, &missing);
        if needs_bop {
            queue.on_missing_bop(product_id);
        }
    }

    fn on_reject(&self, product_id: ProductId) {
        self.stats.record_retx_reject();
        self.queue.lock().drop_product(product_id);
        if self.tracker.lock().reject(product_id) {
            self.report_lost(product_id, LossReason::Rejected);
        }
    }

    /// 추적기 이벤트 처리 (잠금 해제 후)
    fn process_events(&self) {
        let events = self.tracker.lock().drain_events();
        for event in events {
            match event {
                TrackerEvent::Completed(product) => self.deliver(product),
                TrackerEvent::Evicted(product_id) => {
                    self.queue.lock().drop_product(product_id);
                    let e = Error::CapacityExceeded {
                        max: self.config.max_tracked_products,
                    };
                    warn!("제품 {} 축출: {}", product_id, e);
                    self.report_lost(product_id, LossReason::Evicted);
                }
                TrackerEvent::Resynced { last, next } => {
                    warn!(
                        "제품 ID 점프 {} -> {}: 송신측 재시작으로 보고 사이 제품은 추적하지 않음",
                        last, next
                    );
                }
            }
        }
    }

    fn deliver(&self, product: CompletedProduct) {
        let product_id = product.product_id;
        if self.queue.lock().finish(product_id) {
            self.send_control(Pdu::retx_end(product_id));
            self.stats.record_retx_end();
        }

        let size = product.data.len();
        let metadata = product
            .info
            .as_ref()
            .map(|info| info.metadata.clone())
            .unwrap_or_default();

        match self
            .products
            .insert(product_id, product.info.as_ref(), product.data)
        {
            Ok(()) => {
                self.stats.record_complete();
                info!(
                    "제품 {} 완료: {} bytes, {:.2}ms",
                    product_id,
                    size,
                    product.elapsed.as_secs_f64() * 1000.0
                );
                self.machine.emit(SessionEvent::ProductComplete {
                    product_id,
                    size,
                    metadata,
                    elapsed: product.elapsed,
                });
            }
            Err(e) => {
                error!("제품 {} 저장 실패: {}", product_id, e);
                self.report_lost(product_id, LossReason::Storage);
            }
        }
    }

    fn report_lost(&self, product_id: ProductId, reason: LossReason) {
        self.stats.record_lost();
        self.products.signal_missed(product_id);
        warn!("제품 {} 손실: {}", product_id, reason);
        self.machine.emit(SessionEvent::ProductLost { product_id, reason });
    }

    fn send_control(&self, pdu: Pdu) {
        if self.control_tx.send(pdu).is_err() {
            debug!("재전송 채널 닫힘, 제어 PDU 폐기");
        }
    }

    /// 에러 처리. 루프를 계속해도 되면 true
    fn handle_error(&self, source: &str, e: Error) -> bool {
        match e.class() {
            ErrorClass::Transient => {
                debug!("{} 일시적 에러: {}", source, e);
                true
            }
            ErrorClass::Protocol => {
                if matches!(e, Error::Decode(DecodeError::AuthFailed)) {
                    self.stats.record_auth_failure();
                } else {
                    self.stats.record_malformed();
                }
                warn!("{} 폐기: {}", source, e);
                true
            }
            ErrorClass::Exhausted => {
                warn!("{}: {}", source, e);
                true
            }
            ErrorClass::Fatal => {
                if !self.shutdown.is_triggered() {
                    error!("{} 에러, 세션 종료: {}", source, e);
                    self.shutdown.trigger();
                }
                false
            }
        }
    }

    /// 주기 처리
    fn on_tick(&self, now: Instant) {
        let mut gaps = Vec::new();
        let mut bops = Vec::new();
        let stale = {
            let mut tracker = self.tracker.lock();
            let stale = tracker.abandon_stale(now, self.config.product_timeout());
            for product_id in tracker.quiescent(now, self.config.quiescence()) {
                if tracker.needs_bop(product_id) {
                    bops.push(product_id);
                }
                let missing = tracker.missing_ranges(product_id);
                if !missing.is_empty() {
                    gaps.push((product_id, missing));
                }
            }
            stale
        };

        for product_id in stale {
            self.queue.lock().drop_product(product_id);
            self.report_lost(product_id, LossReason::Timeout);
        }

        {
            let mut queue = self.queue.lock();
            for (product_id, missing) in &gaps {
                queue.on_gap_detected(*product_id, missing);
            }
            for product_id in &bops {
                queue.on_missing_bop(*product_id);
            }
        }

        let exhausted = self.queue.lock().expire(now);
        for product_id in exhausted {
            if self.tracker.lock().drop_product(product_id) {
                warn!(
                    "{}",
                    Error::RetransmissionExhausted {
                        product_id: product_id.0
                    }
                );
                self.report_lost(product_id, LossReason::RetransmissionExhausted);
            }
        }

        self.send_requests(now);
        self.process_events();
    }

    fn send_requests(&self, now: Instant) {
        let block_size = self.config.block_size;
        loop {
            let Some(request) = self.queue.lock().next_request(now) else {
                break;
            };
            let product_id = request.product_id;

            let (finished, product_size, missing) = {
                let tracker = self.tracker.lock();
                let missing = tracker
                    .is_tracked(product_id)
                    .then(|| tracker.missing_ranges(product_id));
                (
                    tracker.is_finished(product_id),
                    tracker.product_size(product_id),
                    missing,
                )
            };
            if finished {
                self.queue.lock().drop_product(product_id);
                continue;
            }
            let ranges = match missing {
                Some(missing) => self.queue.lock().restrict_to(product_id, &missing),
                None => request.ranges,
            };
            if ranges.is_empty() && !request.needs_bop {
                continue;
            }

            debug!(
                "재전송 요청 {}: 구간 {}개, BOP {}, {}회차",
                product_id,
                ranges.len(),
                request.needs_bop,
                request.attempt
            );
            if request.needs_bop {
                self.send_control(Pdu::bop_request(product_id));
                self.stats.record_bop_request();
            }
            for range in &ranges {
                let (offset, length) = range.to_byte_range(block_size, product_size);
                if length == 0 {
                    continue;
                }
                self.send_control(Pdu::retx_request(product_id, offset, length));
                self.stats.record_retx_request();
            }
        }
    }

    /// 종료 처리: 요청 폐기, 미완성 제품 손실 보고
    fn drain(&self) {
        let abandoned = self.queue.lock().clear();
        let live = self.tracker.lock().clear();
        if abandoned > 0 || !live.is_empty() {
            info!(
                "종료 처리: 재전송 요청 {}개 폐기, 미완성 제품 {}개",
                abandoned,
                live.len()
            );
        }
        for product_id in live {
            self.report_lost(product_id, LossReason::SessionClosed);
        }
    }
}

/// 수신 세션
pub struct ReceiverSession {
    shared: Arc<ReceiverShared>,
    supervisor: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ReceiverSession {
    /// 그룹 가입, 재전송 채널 연결/핸드쉐이크 후 수신 시작
    ///
    /// 채널 설정이 `join_attempts`회 안에 끝나지 않으면 `Error::ChannelSetup`.
    /// 송신측이 `handshake_timeout_ms` 안에 응답하지 않으면 `Error::Handshake`.
    pub async fn start(
        config: Config,
        group: SocketAddr,
        interface: Ipv4Addr,
        sender_addr: SocketAddr,
        products: Arc<dyn ProductQueue>,
    ) -> Result<(Self, EventReceiver)> {
        config.validate()?;
        let (machine, events) = StateMachine::new("수신");
        info!("FMTP 수신 세션 시작: group={}, sender={}", group, sender_addr);

        let joined = tokio::try_join!(MulticastChannel::join(group, interface, &config), async {
            let mut unicast = UnicastChannel::connect(sender_addr, &config).await?;
            let negotiated = tokio::time::timeout(config.handshake_timeout(), handshake(&mut unicast))
                .await
                .map_err(|_| Error::Handshake("핸드쉐이크 시간 초과".into()))??;
            Ok::<_, Error>((unicast, negotiated))
        });
        let (multicast, (unicast, (mac_key, block_size))) = match joined {
            Ok(joined) => joined,
            Err(e) => {
                error!("수신 세션 설정 실패: {}", e);
                let _ = machine.transition(SessionState::Closed);
                return Err(e);
            }
        };

        let mut config = config;
        if block_size as usize != config.block_size {
            info!(
                "송신측 블록 크기 사용: {} -> {}",
                config.block_size, block_size
            );
            config.block_size = block_size as usize;
            config.validate()?;
        }

        let codec = Arc::new(PduCodec::new(Arc::new(Blake3Authenticator::new(mac_key))));
        let (reader, writer) = unicast.into_split(codec.clone());
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let shutdown = ShutdownSignal::new();

        let shared = Arc::new(ReceiverShared {
            tracker: Mutex::new(BlockTracker::new(&config)),
            queue: Mutex::new(RetransmissionQueue::new(RetryPolicy::from_config(&config))),
            config,
            products,
            machine,
            stats: SessionStats::new(),
            control_tx,
            shutdown: shutdown.clone(),
        });

        shared.machine.transition(SessionState::Active)?;

        let workers = vec![
            tokio::spawn(multicast_loop(
                shared.clone(),
                multicast,
                codec,
                shutdown.subscribe(),
            )),
            tokio::spawn(unicast_read_loop(shared.clone(), reader, shutdown.subscribe())),
            tokio::spawn(unicast_write_loop(
                shared.clone(),
                writer,
                control_rx,
                shutdown.subscribe(),
            )),
            tokio::spawn(timer_loop(shared.clone(), shutdown.subscribe())),
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
                        error!("수신 태스크 비정상 종료: {}", e);
                    }
                }
                shared.drain();
                if let Err(e) = shared.machine.transition(SessionState::Closed) {
                    warn!("{}", e);
                }
                info!("{}", shared.stats.snapshot().summary());
            })
        };

        Ok((
            Self {
                shared,
                supervisor: tokio::sync::Mutex::new(Some(supervisor)),
            },
            events,
        ))
    }

    pub fn state(&self) -> SessionState {
        self.shared.machine.state()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn block_size(&self) -> usize {
        self.shared.config.block_size
    }

    /// 추적 중인 미완성 제품 수
    pub fn tracked_count(&self) -> usize {
        self.shared.tracker.lock().tracked_count()
    }

    /// 종료 요청 후 `Closed`까지 대기
    pub async fn shutdown(&self) {
        self.shared.shutdown.trigger();
        self.wait_closed().await;
    }

    /// 세션이 닫힐 때까지 대기 (내부 치명적 에러 포함)
    pub async fn wait_closed(&self) {
        let handle = self.supervisor.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("수신 세션 종료 처리 실패: {}", e);
            }
        }
    }
}

/// 수신측 핸드쉐이크: Hello 송신, Welcome에서 MAC 키와 블록 크기 획득
async fn handshake(channel: &mut UnicastChannel) -> Result<(MacKey, u16)> {
    let keypair = EphemeralKeyPair::generate();
    let stream = channel.stream_mut();
    write_handshake(stream, &HandshakeMessage::hello(keypair.public_key_bytes())).await?;

    match read_handshake(stream).await? {
        HandshakeMessage::Welcome {
            protocol_version,
            public_key,
            sealed_mac_key,
            block_size,
        } => {
            if protocol_version != PROTOCOL_VERSION {
                return Err(Error::Handshake(format!(
                    "프로토콜 버전 불일치: {} != {}",
                    protocol_version, PROTOCOL_VERSION
                )));
            }
            let mac_key = keypair.establish(&public_key).open(&sealed_mac_key)?;
            debug!("핸드쉐이크 완료: block_size={}", block_size);
            Ok((mac_key, block_size))
        }
        HandshakeMessage::Refused { reason } => Err(Error::Handshake(reason)),
        other => Err(Error::Handshake(format!("예상하지 못한 메시지: {:?}", other))),
    }
}

async fn multicast_loop(
    shared: Arc<ReceiverShared>,
    channel: MulticastChannel,
    codec: Arc<PduCodec>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            result = channel.recv_pdu(&codec) => match result {
                Ok(pdu) => shared.handle_pdu(pdu, false),
                Err(e) => {
                    if !shared.handle_error("멀티캐스트 세그먼트", e) {
                        break;
                    }
                }
            },
        }
    }
    debug!("멀티캐스트 수신 루프 종료");
}

async fn unicast_read_loop(
    shared: Arc<ReceiverShared>,
    mut reader: UnicastReader,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            result = reader.recv_pdu() => match result {
                Ok(pdu) => shared.handle_pdu(pdu, true),
                Err(e) => {
                    if !shared.handle_error("재전송 채널", e) {
                        break;
                    }
                }
            },
        }
    }
    debug!("재전송 채널 수신 루프 종료");
}

async fn unicast_write_loop(
    shared: Arc<ReceiverShared>,
    mut writer: UnicastWriter,
    mut control_rx: mpsc::UnboundedReceiver<Pdu>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            next = control_rx.recv() => {
                let Some(pdu) = next else { break };
                match writer.send_pdu(&pdu).await {
                    Ok(()) => shared.stats.record_sent(PduCodec::frame_len(pdu.payload.len())),
                    Err(e) => {
                        if !shared.handle_error("재전송 요청 송신", e) {
                            break;
                        }
                    }
                }
            }
        }
    }
    if let Err(e) = writer.shutdown().await {
        debug!("재전송 채널 닫기 실패: {}", e);
    }
    debug!("재전송 채널 송신 루프 종료");
}

async fn timer_loop(shared: Arc<ReceiverShared>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(shared.config.timer_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            _ = ticker.tick() => shared.on_tick(Instant::now()),
        }
    }
    debug!("타이머 루프 종료");
}

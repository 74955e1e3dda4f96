//! 세션 상태 머신과 외부 협력자 인터페이스
//!
//! 상태: `Joining → Active → Draining → Closed`
//!
//! 상태 변화와 제품 완료/손실은 `SessionEvent`로 채널에 흘려보낸다.
//! 완성된 제품 바이트는 `ProductQueue`로 넘긴다.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::pdu::{BopInfo, ProductId};
use crate::{Error, Result};

/// 세션 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// 그룹 가입/재전송 채널 연결 중
    Joining,
    /// 정상 송수신
    Active,
    /// 종료 처리 중
    Draining,
    /// 종료됨. 이후 IO 없음
    Closed,
}

impl SessionState {
    /// 허용되는 전이인지
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Joining, Active) | (Joining, Draining) | (Joining, Closed) | (Active, Draining) | (Draining, Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Joining => "Joining",
            SessionState::Active => "Active",
            SessionState::Draining => "Draining",
            SessionState::Closed => "Closed",
        };
        f.write_str(name)
    }
}

/// 제품 손실 사유
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossReason {
    /// 재전송 시도 소진
    RetransmissionExhausted,
    /// 송신측이 재전송 거부 (보관 기간 만료)
    Rejected,
    /// 추적 용량 초과로 축출
    Evicted,
    /// 제품 타임아웃
    Timeout,
    /// 세션 종료 시 미완성
    SessionClosed,
    /// 잘못된 BOP (크기 초과 등)
    Invalid,
    /// 제품 큐 저장 실패
    Storage,
}

impl fmt::Display for LossReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            LossReason::RetransmissionExhausted => "재전송 시도 소진",
            LossReason::Rejected => "재전송 거부",
            LossReason::Evicted => "용량 초과 축출",
            LossReason::Timeout => "타임아웃",
            LossReason::SessionClosed => "세션 종료",
            LossReason::Invalid => "잘못된 제품",
            LossReason::Storage => "저장 실패",
        };
        f.write_str(reason)
    }
}

/// 세션 이벤트
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ProductComplete {
        product_id: ProductId,
        size: usize,
        metadata: Bytes,
        elapsed: Duration,
    },
    ProductLost {
        product_id: ProductId,
        reason: LossReason,
    },
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    Closed,
}

/// 완성된 제품을 받는 저장소
pub trait ProductQueue: Send + Sync {
    /// 완성된 제품 저장
    fn insert(&self, product_id: ProductId, info: Option<&BopInfo>, bytes: Bytes) -> Result<()>;

    /// 제품 손실 통지
    fn signal_missed(&self, product_id: ProductId);
}

/// 메모리 제품 큐 (시험/단순 수신기용)
#[derive(Default)]
pub struct MemoryQueue {
    products: Mutex<Vec<(ProductId, Bytes)>>,
    missed: Mutex<Vec<ProductId>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn products(&self) -> Vec<(ProductId, Bytes)> {
        self.products.lock().clone()
    }

    pub fn missed(&self) -> Vec<ProductId> {
        self.missed.lock().clone()
    }
}

impl ProductQueue for MemoryQueue {
    fn insert(&self, product_id: ProductId, _info: Option<&BopInfo>, bytes: Bytes) -> Result<()> {
        self.products.lock().push((product_id, bytes));
        Ok(())
    }

    fn signal_missed(&self, product_id: ProductId) {
        self.missed.lock().push(product_id);
    }
}

/// 상태 머신 + 이벤트 송신
pub struct StateMachine {
    name: &'static str,
    state: Mutex<SessionState>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl StateMachine {
    pub fn new(name: &'static str) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                name,
                state: Mutex::new(SessionState::Joining),
                events,
            },
            rx,
        )
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// 상태 전이
    ///
    /// 같은 상태로의 전이는 무시. 허용되지 않은 전이는 `Error::InvalidState`.
    pub fn transition(&self, to: SessionState) -> Result<()> {
        let from = {
            let mut state = self.state.lock();
            let from = *state;
            if from == to {
                return Ok(());
            }
            if !from.can_transition_to(to) {
                return Err(Error::InvalidState {
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
            *state = to;
            from
        };

        info!("{} 세션 상태: {} -> {}", self.name, from, to);
        self.emit(SessionEvent::StateChanged { from, to });
        if to == SessionState::Closed {
            self.emit(SessionEvent::Closed);
        }
        Ok(())
    }

    /// 이벤트 송신. 받는 쪽이 없으면 버린다
    pub fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("{} 세션 이벤트 수신자 없음", self.name);
        }
    }
}

/// 종료 신호
///
/// 한 번 켜지면 꺼지지 않는다.
#[derive(Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// 종료 신호(true)가 올 때까지 대기. 신호 송신측이 사라져도 종료로 본다
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        let (machine, mut rx) = StateMachine::new("test");
        assert_eq!(machine.state(), SessionState::Joining);

        machine.transition(SessionState::Active).unwrap();
        machine.transition(SessionState::Draining).unwrap();
        machine.transition(SessionState::Closed).unwrap();

        let mut changes = Vec::new();
        let mut closed = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                SessionEvent::StateChanged { from, to } => changes.push((from, to)),
                SessionEvent::Closed => closed += 1,
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(
            changes,
            vec![
                (SessionState::Joining, SessionState::Active),
                (SessionState::Active, SessionState::Draining),
                (SessionState::Draining, SessionState::Closed),
            ]
        );
        assert_eq!(closed, 1);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let (machine, _rx) = StateMachine::new("test");
        machine.transition(SessionState::Active).unwrap();
        assert!(matches!(
            machine.transition(SessionState::Joining),
            Err(Error::InvalidState { .. })
        ));
        assert!(matches!(
            machine.transition(SessionState::Closed),
            Err(Error::InvalidState { .. })
        ));
        // 같은 상태는 무시
        machine.transition(SessionState::Active).unwrap();
        assert_eq!(machine.state(), SessionState::Active);
    }

    #[test]
    fn test_closed_is_terminal() {
        for next in [
            SessionState::Joining,
            SessionState::Active,
            SessionState::Draining,
        ] {
            assert!(!SessionState::Closed.can_transition_to(next));
        }
    }

    #[test]
    fn test_shutdown_signal_sticks() {
        let signal = ShutdownSignal::new();
        let rx = signal.subscribe();
        assert!(!signal.is_triggered());
        signal.trigger();
        signal.trigger();
        assert!(signal.is_triggered());
        assert!(*rx.borrow());
    }

    #[test]
    fn test_memory_queue() {
        let queue = MemoryQueue::new();
        queue
            .insert(ProductId(1), None, Bytes::from_static(b"abc"))
            .unwrap();
        queue.signal_missed(ProductId(2));
        assert_eq!(queue.products(), vec![(ProductId(1), Bytes::from_static(b"abc"))]);
        assert_eq!(queue.missed(), vec![ProductId(2)]);
    }
}

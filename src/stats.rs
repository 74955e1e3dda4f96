//! 세션 통계
//!
//! 여러 태스크가 동시에 갱신하므로 카운터는 원자 변수.
//! 읽을 때는 `snapshot()`으로 한 번에 복사한다.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 세션 카운터
#[derive(Debug)]
pub struct SessionStats {
    start_time: Instant,
    pdus_sent: AtomicU64,
    pdus_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    duplicates: AtomicU64,
    auth_failures: AtomicU64,
    malformed: AtomicU64,
    retx_requests: AtomicU64,
    retx_data: AtomicU64,
    retx_rejects: AtomicU64,
    retx_ends: AtomicU64,
    bop_requests: AtomicU64,
    products_sent: AtomicU64,
    products_complete: AtomicU64,
    products_lost: AtomicU64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            pdus_sent: AtomicU64::new(0),
            pdus_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            retx_requests: AtomicU64::new(0),
            retx_data: AtomicU64::new(0),
            retx_rejects: AtomicU64::new(0),
            retx_ends: AtomicU64::new(0),
            bop_requests: AtomicU64::new(0),
            products_sent: AtomicU64::new(0),
            products_complete: AtomicU64::new(0),
            products_lost: AtomicU64::new(0),
        }
    }

    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub fn record_sent(&self, bytes: usize) {
        Self::bump(&self.pdus_sent, 1);
        Self::bump(&self.bytes_sent, bytes as u64);
    }

    pub fn record_received(&self, bytes: usize) {
        Self::bump(&self.pdus_received, 1);
        Self::bump(&self.bytes_received, bytes as u64);
    }

    pub fn record_duplicate(&self) {
        Self::bump(&self.duplicates, 1);
    }

    pub fn record_auth_failure(&self) {
        Self::bump(&self.auth_failures, 1);
    }

    pub fn record_malformed(&self) {
        Self::bump(&self.malformed, 1);
    }

    pub fn record_retx_request(&self) {
        Self::bump(&self.retx_requests, 1);
    }

    pub fn record_retx_data(&self) {
        Self::bump(&self.retx_data, 1);
    }

    pub fn record_retx_reject(&self) {
        Self::bump(&self.retx_rejects, 1);
    }

    pub fn record_retx_end(&self) {
        Self::bump(&self.retx_ends, 1);
    }

    pub fn record_bop_request(&self) {
        Self::bump(&self.bop_requests, 1);
    }

    pub fn record_product_sent(&self) {
        Self::bump(&self.products_sent, 1);
    }

    pub fn record_complete(&self) {
        Self::bump(&self.products_complete, 1);
    }

    pub fn record_lost(&self) {
        Self::bump(&self.products_lost, 1);
    }

    /// 현재 값 복사
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            elapsed: self.start_time.elapsed(),
            pdus_sent: load(&self.pdus_sent),
            pdus_received: load(&self.pdus_received),
            bytes_sent: load(&self.bytes_sent),
            bytes_received: load(&self.bytes_received),
            duplicates: load(&self.duplicates),
            auth_failures: load(&self.auth_failures),
            malformed: load(&self.malformed),
            retx_requests: load(&self.retx_requests),
            retx_data: load(&self.retx_data),
            retx_rejects: load(&self.retx_rejects),
            retx_ends: load(&self.retx_ends),
            bop_requests: load(&self.bop_requests),
            products_sent: load(&self.products_sent),
            products_complete: load(&self.products_complete),
            products_lost: load(&self.products_lost),
        }
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 통계 스냅샷
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub elapsed: Duration,
    pub pdus_sent: u64,
    pub pdus_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub duplicates: u64,
    pub auth_failures: u64,
    pub malformed: u64,
    pub retx_requests: u64,
    pub retx_data: u64,
    pub retx_rejects: u64,
    pub retx_ends: u64,
    pub bop_requests: u64,
    pub products_sent: u64,
    pub products_complete: u64,
    pub products_lost: u64,
}

impl StatsSnapshot {
    /// 수신 처리율 (bytes/sec)
    pub fn receive_throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.bytes_received as f64 / secs
    }

    /// 송신 처리율 (bytes/sec)
    pub fn send_throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.bytes_sent as f64 / secs
    }

    /// 제품 손실률
    pub fn product_loss_rate(&self) -> f64 {
        let total = self.products_complete + self.products_lost;
        if total == 0 {
            return 0.0;
        }
        self.products_lost as f64 / total as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | PDUs: {} sent / {} recv | Products: {} sent, {} complete, {} lost ({:.2}%) | Dup: {} | Auth fail: {} | Retx: {} req / {} data / {} reject | Throughput: {:.2} MB/s",
            self.elapsed.as_secs_f64(),
            self.pdus_sent,
            self.pdus_received,
            self.products_sent,
            self.products_complete,
            self.products_lost,
            self.product_loss_rate() * 100.0,
            self.duplicates,
            self.auth_failures,
            self.retx_requests,
            self.retx_data,
            self.retx_rejects,
            (self.receive_throughput() + self.send_throughput()) / 1_000_000.0,
        )
    }
}

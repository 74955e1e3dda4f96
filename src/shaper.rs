//! 송신 속도 제어 (토큰 버킷)
//!
//! 토큰 단위는 비트. 멀티캐스트로 내보내는 프레임마다 `프레임 길이 × 8` 토큰을 소비한다.

use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::debug;

use crate::session::wait_for_shutdown;
use crate::{Error, Result};

/// 토큰 버킷
///
/// 시간은 호출자가 넘긴다. 시계가 뒤로 가면 경과 시간을 0으로 본다.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    available: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// 가득 찬 상태로 생성
    pub fn new(refill_rate: f64, capacity: f64, now: Instant) -> Self {
        let capacity = capacity.max(0.0);
        Self {
            capacity,
            available: capacity,
            refill_rate: refill_rate.max(0.0),
            last_refill: now,
        }
    }

    /// 속도/용량 변경. 남은 토큰은 새 용량으로 잘린다
    pub fn configure(&mut self, refill_rate: f64, capacity: f64) {
        self.refill_rate = refill_rate.max(0.0);
        self.capacity = capacity.max(0.0);
        self.available = self.available.min(self.capacity);
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn available(&self) -> f64 {
        self.available
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// 속도 제한이 없는 버킷인지
    pub fn is_unlimited(&self) -> bool {
        self.refill_rate == 0.0
    }

    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if now > self.last_refill {
            self.last_refill = now;
        }
        self.available = (self.available + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
    }

    /// 즉시 소비 시도
    ///
    /// 부족하면 모자란 토큰이 채워질 때까지의 대기 시간을 돌려준다.
    pub fn try_acquire(&mut self, tokens: f64, now: Instant) -> std::result::Result<(), Duration> {
        if self.is_unlimited() {
            return Ok(());
        }
        self.refill(now);
        if self.available >= tokens {
            self.available -= tokens;
            return Ok(());
        }
        let deficit = tokens - self.available;
        Err(Duration::from_secs_f64(deficit / self.refill_rate))
    }

    /// 대기 후 소비. 용량보다 큰 요청은 버킷을 비운다
    pub fn debit_after_wait(&mut self, tokens: f64, now: Instant) {
        if self.is_unlimited() {
            return;
        }
        self.refill(now);
        self.available = (self.available - tokens).max(0.0);
    }
}

/// 비동기 속도 제어기
///
/// `acquire`는 송신 경로의 유일한 대기 지점이며 종료 신호로 깨어난다.
pub struct RateShaper {
    bucket: Mutex<TokenBucket>,
    shutdown: watch::Receiver<bool>,
}

impl RateShaper {
    /// `rate_bps`가 0이면 속도 제한 없음
    pub fn new(rate_bps: u64, burst_bits: u64, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(
                rate_bps as f64,
                burst_bits as f64,
                Instant::now(),
            )),
            shutdown,
        }
    }

    pub async fn configure(&self, rate_bps: u64, burst_bits: u64) {
        let mut bucket = self.bucket.lock().await;
        bucket.refill(Instant::now());
        bucket.configure(rate_bps as f64, burst_bits as f64);
    }

    /// `tokens`개가 모일 때까지 대기 후 소비
    ///
    /// 종료 신호가 오면 `Error::Shutdown`.
    pub async fn acquire(&self, tokens: u64) -> Result<()> {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return Err(Error::Shutdown);
        }

        // 대기 중에도 잠금을 유지해 호출 순서대로 토큰을 받는다
        let mut bucket = self.bucket.lock().await;
        let tokens = tokens as f64;
        let wait = match bucket.try_acquire(tokens, Instant::now()) {
            Ok(()) => return Ok(()),
            Err(wait) => wait,
        };

        debug!("pacing 대기: {:?} ({} 토큰)", wait, tokens);
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = wait_for_shutdown(&mut shutdown) => return Err(Error::Shutdown),
        }

        bucket.debit_after_wait(tokens, Instant::now());
        Ok(())
    }

    pub async fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock().await;
        bucket.refill(Instant::now());
        bucket.available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_within_capacity() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(100.0, 10.0, now);
        for _ in 0..10 {
            assert!(bucket.try_acquire(1.0, now).is_ok());
        }
        let wait = bucket.try_acquire(1.0, now).unwrap_err();
        assert_eq!(wait, Duration::from_millis(10));
    }

    #[test]
    fn test_refill_capped_at_capacity() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(100.0, 10.0, start);
        assert!(bucket.try_acquire(10.0, start).is_ok());

        bucket.refill(start + Duration::from_millis(50));
        assert!((bucket.available() - 5.0).abs() < 1e-9);

        bucket.refill(start + Duration::from_secs(60));
        assert_eq!(bucket.available(), 10.0);
    }

    #[test]
    fn test_clock_going_backwards_grants_nothing() {
        let start = Instant::now() + Duration::from_secs(1);
        let mut bucket = TokenBucket::new(100.0, 10.0, start);
        assert!(bucket.try_acquire(10.0, start).is_ok());

        bucket.refill(start - Duration::from_millis(500));
        assert_eq!(bucket.available(), 0.0);
        // 이후 정상 시간으로 돌아와도 과다 지급 없음
        bucket.refill(start + Duration::from_millis(10));
        assert!((bucket.available() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_oversized_request_empties_bucket() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(10.0, 5.0, now);
        let wait = bucket.try_acquire(15.0, now).unwrap_err();
        assert_eq!(wait, Duration::from_secs(1));
        bucket.debit_after_wait(15.0, now + wait);
        assert_eq!(bucket.available(), 0.0);
    }

    #[test]
    fn test_unlimited_rate() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(0.0, 0.0, now);
        for _ in 0..1000 {
            assert!(bucket.try_acquire(12_000.0, now).is_ok());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_blocks_beyond_capacity() {
        let (_tx, rx) = watch::channel(false);
        let shaper = RateShaper::new(1_000, 100, rx);

        let start = Instant::now();
        for _ in 0..100 {
            shaper.acquire(1).await.unwrap();
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        shaper.acquire(1).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_run_throughput() {
        let (_tx, rx) = watch::channel(false);
        // 8000 bit/s, 버스트 800 bit
        let shaper = RateShaper::new(8_000, 800, rx);

        let start = Instant::now();
        for _ in 0..100 {
            shaper.acquire(80).await.unwrap();
        }
        // 8000 bit 중 처음 800 bit는 버스트
        let elapsed = start.elapsed().as_secs_f64();
        assert!(elapsed >= 0.89 && elapsed <= 1.01, "elapsed = {}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_acquire() {
        let (tx, rx) = watch::channel(false);
        let shaper = std::sync::Arc::new(RateShaper::new(10, 10, rx));
        shaper.acquire(10).await.unwrap();

        let waiter = {
            let shaper = shaper.clone();
            tokio::spawn(async move { shaper.acquire(1_000).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(true).unwrap();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::Shutdown)));
        assert!(matches!(shaper.acquire(1).await, Err(Error::Shutdown)));
    }
}

//! 프로토콜 설정

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result, DEFAULT_BLOCK_SIZE, MAX_PAYLOAD};

/// FMTP 세션 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 블록 크기 (바이트), 손실/재전송 추적 단위
    pub block_size: usize,

    /// 수신 가능한 최대 제품 크기 (바이트)
    pub max_product_size: u64,

    /// 동시에 추적하는 미완성 제품 최대 수
    pub max_tracked_products: usize,

    /// 마지막 세그먼트 이후 누락 판정까지 대기 (밀리초)
    pub quiescence_ms: u64,

    /// 제품 포기 타임아웃 (밀리초)
    pub product_timeout_ms: u64,

    /// 재전송 요청 응답 대기 타임아웃 (밀리초)
    pub retx_timeout_ms: u64,

    /// 재전송 재시도 간 지수 백오프 배수
    pub retx_backoff_factor: f64,

    /// 백오프 상한 (밀리초)
    pub retx_max_backoff_ms: u64,

    /// 제품당 최대 재전송 요청 횟수
    pub retx_max_attempts: u32,

    /// 멀티캐스트 송신 속도 (bit/s)
    /// 0이면 pacing 없이 최대 속도로 전송
    pub rate_bps: u64,

    /// 토큰 버킷 용량 (bit), 순간 버스트 허용량
    pub burst_bits: u64,

    /// 송신측 재전송용 제품 보관 시간 (밀리초)
    pub retention_ms: u64,

    /// 채널 설정 최대 시도 횟수
    pub join_attempts: u32,

    /// 채널 설정 재시도 간격 (밀리초)
    pub join_retry_ms: u64,

    /// 주기 타이머 간격 (밀리초)
    pub timer_interval_ms: u64,

    /// 완료/손실 제품 ID 기록 개수 (지연 중복 무시용)
    pub finished_history: usize,

    /// 멀티캐스트 TTL
    pub multicast_ttl: u32,

    /// 수신 소켓 버퍼 크기
    pub recv_buffer_size: usize,

    /// 유니캐스트 핸드쉐이크 제한 시간 (밀리초)
    pub handshake_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_product_size: 64 * 1024 * 1024, // 64MB
            max_tracked_products: 256,
            quiescence_ms: 200,
            product_timeout_ms: 60_000,          // 1분
            retx_timeout_ms: 500,
            retx_backoff_factor: 2.0,
            retx_max_backoff_ms: 8_000,
            retx_max_attempts: 5,
            rate_bps: 20_000_000,                // 20Mbps
            burst_bits: (DEFAULT_BLOCK_SIZE as u64) * 8 * 10,
            retention_ms: 120_000,               // 2분
            join_attempts: 3,
            join_retry_ms: 500,
            timer_interval_ms: 50,
            finished_history: 1024,
            multicast_ttl: 1,
            recv_buffer_size: 4 * 1024 * 1024,   // 4MB
            handshake_timeout_ms: 10_000,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 제품 크기로부터 블록 수 계산
    pub fn blocks_for(&self, product_size: u64) -> u32 {
        let block = self.block_size as u64;
        ((product_size + block - 1) / block) as u32
    }

    pub fn quiescence(&self) -> Duration {
        Duration::from_millis(self.quiescence_ms)
    }

    pub fn product_timeout(&self) -> Duration {
        Duration::from_millis(self.product_timeout_ms)
    }

    pub fn retx_timeout(&self) -> Duration {
        Duration::from_millis(self.retx_timeout_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    pub fn timer_interval(&self) -> Duration {
        Duration::from_millis(self.timer_interval_ms)
    }

    pub fn join_retry(&self) -> Duration {
        Duration::from_millis(self.join_retry_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size > MAX_PAYLOAD {
            return Err(Error::Config(format!(
                "block_size는 1..={} 범위여야 함: {}",
                MAX_PAYLOAD, self.block_size
            )));
        }
        if self.max_product_size > u32::MAX as u64 {
            return Err(Error::Config(format!(
                "max_product_size는 u32 범위를 넘을 수 없음: {}",
                self.max_product_size
            )));
        }
        if self.max_tracked_products == 0 {
            return Err(Error::Config("max_tracked_products는 0보다 커야 함".into()));
        }
        if self.retx_max_attempts == 0 {
            return Err(Error::Config("retx_max_attempts는 0보다 커야 함".into()));
        }
        if self.retx_backoff_factor < 1.0 {
            return Err(Error::Config(format!(
                "retx_backoff_factor는 1.0 이상이어야 함: {}",
                self.retx_backoff_factor
            )));
        }
        if self.rate_bps > 0 && self.burst_bits < (self.block_size as u64) * 8 {
            return Err(Error::Config(format!(
                "burst_bits({})는 블록 하나({} bit) 이상이어야 함",
                self.burst_bits,
                self.block_size * 8
            )));
        }
        if self.join_attempts == 0 || self.timer_interval_ms == 0 {
            return Err(Error::Config("join_attempts와 timer_interval_ms는 0보다 커야 함".into()));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(Error::Config("handshake_timeout_ms는 0보다 커야 함".into()));
        }
        Ok(())
    }

    /// 저지연 LAN용 설정
    pub fn low_latency() -> Self {
        Self {
            quiescence_ms: 50,
            retx_timeout_ms: 100,
            retx_max_backoff_ms: 1_000,
            timer_interval_ms: 10,
            rate_bps: 100_000_000,               // 100Mbps
            burst_bits: (DEFAULT_BLOCK_SIZE as u64) * 8 * 32,
            ..Self::default()
        }
    }

    /// 손실이 많은 네트워크용 설정
    pub fn lossy_network() -> Self {
        Self {
            block_size: 1000,                    // 작은 블록
            quiescence_ms: 500,
            product_timeout_ms: 180_000,
            retx_timeout_ms: 1_000,
            retx_max_backoff_ms: 16_000,
            retx_max_attempts: 8,
            rate_bps: 5_000_000,
            burst_bits: 1000 * 8 * 8,
            retention_ms: 600_000,               // 10분
            ..Self::default()
        }
    }
}

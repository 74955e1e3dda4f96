//! 제품별 블록 수신 추적
//!
//! - ProductBitmap: 제품 하나의 블록 수신 비트맵
//! - BlockTracker: productId → 비트맵 + 조립 버퍼 맵, 용량 제한
//!
//! I/O 없음. 세션이 단일 락으로 감싸서 멀티캐스트/유니캐스트 태스크가 공유한다.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::pdu::{BopInfo, ProductId};
use crate::{Config, Error, Result};

/// 블록 범위 `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRange {
    pub start: u32,
    pub end: u32,
}

impl BlockRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, block: u32) -> bool {
        block >= self.start && block < self.end
    }

    /// 바이트 범위 `(offset, length)`로 변환
    ///
    /// 제품 크기를 알면 마지막 블록 길이를 잘라낸다.
    pub fn to_byte_range(&self, block_size: usize, product_size: Option<u32>) -> (u32, u32) {
        let block = block_size as u64;
        let start = self.start as u64 * block;
        let mut end = self.end as u64 * block;
        if let Some(size) = product_size {
            end = end.min(size as u64);
        }
        (start as u32, end.saturating_sub(start) as u32)
    }

    /// 바이트 범위에서 블록 범위로 변환 (부분 블록은 포함)
    pub fn from_byte_range(offset: u32, length: u32, block_size: usize) -> Self {
        let block = block_size as u64;
        let start = offset as u64 / block;
        let end = (offset as u64 + length as u64 + block - 1) / block;
        Self::new(start as u32, end.min(u32::MAX as u64) as u32)
    }
}

/// 블록 표시 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
    /// 새로 수신
    New,
    /// 이미 수신한 블록
    Duplicate,
    /// 범위 밖
    OutOfRange,
}

/// 제품 하나의 블록 수신 비트맵
///
/// BOP 이전에 세그먼트가 도착하면 크기를 모르는 상태로 생성되어
/// `growth_limit`까지 늘어난다.
#[derive(Debug, Clone)]
pub struct ProductBitmap {
    received: Vec<bool>,
    received_count: u32,
    sized: bool,
    growth_limit: u32,
}

impl ProductBitmap {
    /// 전체 블록 수를 아는 비트맵
    pub fn new(total_blocks: u32) -> Self {
        Self {
            received: vec![false; total_blocks as usize],
            received_count: 0,
            sized: true,
            growth_limit: total_blocks,
        }
    }

    /// 크기 미정 비트맵 (BOP 미수신)
    pub fn with_growth_limit(growth_limit: u32) -> Self {
        Self {
            received: Vec::new(),
            received_count: 0,
            sized: false,
            growth_limit,
        }
    }

    pub fn total_blocks(&self) -> u32 {
        self.received.len() as u32
    }

    pub fn received_count(&self) -> u32 {
        self.received_count
    }

    pub fn is_sized(&self) -> bool {
        self.sized
    }

    pub fn is_received(&self, index: u32) -> bool {
        self.received.get(index as usize).copied().unwrap_or(false)
    }

    /// 블록 수신 표시 (중복은 no-op)
    pub fn mark(&mut self, index: u32) -> Mark {
        let idx = index as usize;
        if idx >= self.received.len() {
            if self.sized || index >= self.growth_limit {
                return Mark::OutOfRange;
            }
            self.received.resize(idx + 1, false);
        }

        if self.received[idx] {
            return Mark::Duplicate;
        }
        self.received[idx] = true;
        self.received_count += 1;
        Mark::New
    }

    /// 전체 블록 수 확정 (BOP 수신)
    ///
    /// 이미 크기가 정해져 있으면 무시한다.
    pub fn set_total(&mut self, total_blocks: u32) {
        if self.sized {
            return;
        }
        let total = total_blocks as usize;
        if self.received.len() > total {
            self.received.truncate(total);
            self.received_count = self.received.iter().filter(|&&r| r).count() as u32;
        } else {
            self.received.resize(total, false);
        }
        self.sized = true;
        self.growth_limit = total_blocks;
    }

    /// 완료 여부
    pub fn is_complete(&self) -> bool {
        self.sized && self.received_count == self.total_blocks()
    }

    /// 미수신 블록의 최대 연속 구간 목록
    ///
    /// 크기 미정이면 지금까지 알려진 인덱스 범위만 본다.
    pub fn missing_ranges(&self) -> Vec<BlockRange> {
        let mut ranges = Vec::new();
        let mut run_start: Option<u32> = None;

        for (idx, &received) in self.received.iter().enumerate() {
            match (received, run_start) {
                (false, None) => run_start = Some(idx as u32),
                (true, Some(start)) => {
                    ranges.push(BlockRange::new(start, idx as u32));
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(start) = run_start {
            ranges.push(BlockRange::new(start, self.received.len() as u32));
        }
        ranges
    }
}

/// 완성된 제품
#[derive(Debug, Clone)]
pub struct CompletedProduct {
    pub product_id: ProductId,
    pub info: Option<BopInfo>,
    pub data: Bytes,
    pub elapsed: Duration,
}

/// 추적기에서 나오는 이벤트 (세션이 락 해제 후 처리)
#[derive(Debug, Clone)]
pub enum TrackerEvent {
    Completed(CompletedProduct),
    /// 용량 초과로 밀려난 제품
    Evicted(ProductId),
    /// 기록 한도보다 큰 ID 점프. 사이의 제품은 추적하지 않는다
    Resynced { last: ProductId, next: ProductId },
}

/// 종료된 제품 기록
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Completed,
    Lost,
}

struct TrackedProduct {
    bitmap: ProductBitmap,
    data: Vec<u8>,
    info: Option<BopInfo>,
    seq: u64,
    first_seen: Instant,
    last_activity: Instant,
    eop_seen: bool,
}

impl TrackedProduct {
    fn new(bitmap: ProductBitmap, seq: u64) -> Self {
        let now = Instant::now();
        Self {
            bitmap,
            data: Vec::new(),
            info: None,
            seq,
            first_seen: now,
            last_activity: now,
            eop_seen: false,
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// 블록 추적기
pub struct BlockTracker {
    block_size: usize,
    max_product_size: u64,
    max_tracked: usize,
    history_limit: usize,
    products: HashMap<ProductId, TrackedProduct>,
    next_seq: u64,
    newest: Option<ProductId>,
    finished: HashMap<ProductId, Finish>,
    finished_order: VecDeque<ProductId>,
    events: Vec<TrackerEvent>,
}

impl BlockTracker {
    pub fn new(config: &Config) -> Self {
        Self {
            block_size: config.block_size,
            max_product_size: config.max_product_size,
            max_tracked: config.max_tracked_products.max(1),
            history_limit: config.finished_history.max(1),
            products: HashMap::new(),
            next_seq: 0,
            newest: None,
            finished: HashMap::new(),
            finished_order: VecDeque::new(),
            events: Vec::new(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn growth_limit(&self) -> u32 {
        let block = self.block_size as u64;
        ((self.max_product_size + block - 1) / block).min(u32::MAX as u64) as u32
    }

    /// 제품 시작 (전체 블록 수 확정)
    ///
    /// true면 이 호출로 제품이 완성됨 (블록 0개 또는 BOP 이전에 모두 수신).
    pub fn start_product(&mut self, product_id: ProductId, total_blocks: u32) -> bool {
        self.size_product(product_id, total_blocks, None)
    }

    /// BOP 수신 처리
    pub fn begin(&mut self, product_id: ProductId, info: BopInfo) -> Result<bool> {
        if info.product_size as u64 > self.max_product_size {
            return Err(Error::ProductTooLarge {
                size: info.product_size as u64,
                max: self.max_product_size,
            });
        }
        let block = self.block_size as u64;
        let total = ((info.product_size as u64 + block - 1) / block) as u32;
        Ok(self.size_product(product_id, total, Some(info)))
    }

    fn size_product(&mut self, product_id: ProductId, total: u32, info: Option<BopInfo>) -> bool {
        if self.finished.contains_key(&product_id) {
            return false;
        }
        self.ensure_entry(product_id);

        let Some(product) = self.products.get_mut(&product_id) else {
            return false;
        };
        product.touch();
        if product.bitmap.is_sized() {
            // 중복 BOP
            return false;
        }
        product.bitmap.set_total(total);
        if let Some(info) = info {
            let size = info.product_size as usize;
            product.data.truncate(size);
            product.data.reserve_exact(size - product.data.len());
            product.info = Some(info);
        }

        if product.bitmap.is_complete() {
            self.complete(product_id);
            true
        } else {
            false
        }
    }

    /// 블록 수신 표시
    ///
    /// true면 이 호출로 제품이 완성됨. 완성된 제품은 `drain_events`로 꺼낸다.
    pub fn mark_received(&mut self, product_id: ProductId, block: u32) -> bool {
        if self.finished.contains_key(&product_id) {
            return false;
        }
        self.ensure_entry(product_id);

        let Some(product) = self.products.get_mut(&product_id) else {
            return false;
        };
        product.touch();
        if product.bitmap.mark(block) != Mark::New {
            return false;
        }

        if product.bitmap.is_complete() {
            self.complete(product_id);
            true
        } else {
            false
        }
    }

    /// 데이터 블록 저장 + 수신 표시
    pub fn insert_block(
        &mut self,
        product_id: ProductId,
        byte_offset: u32,
        payload: &[u8],
    ) -> Result<bool> {
        if self.finished.contains_key(&product_id) {
            return Ok(false);
        }

        let invalid = || Error::InvalidSegment {
            product_id: product_id.0,
            offset: byte_offset,
            len: payload.len(),
        };
        if payload.is_empty()
            || payload.len() > self.block_size
            || byte_offset as usize % self.block_size != 0
        {
            return Err(invalid());
        }
        let end = byte_offset as u64 + payload.len() as u64;
        if end > self.max_product_size {
            return Err(Error::ProductTooLarge {
                size: end,
                max: self.max_product_size,
            });
        }
        if let Some(info) = self.products.get(&product_id).and_then(|p| p.info.as_ref()) {
            let size = info.product_size as u64;
            let expected = (size.saturating_sub(byte_offset as u64)).min(self.block_size as u64);
            if end > size || payload.len() as u64 != expected {
                return Err(invalid());
            }
        }

        let block = byte_offset / self.block_size as u32;
        self.ensure_entry(product_id);
        let Some(product) = self.products.get_mut(&product_id) else {
            return Ok(false);
        };

        if product.bitmap.is_received(block) {
            product.touch();
            return Ok(false);
        }
        if product.bitmap.is_sized() && block >= product.bitmap.total_blocks() {
            return Err(invalid());
        }

        let start = byte_offset as usize;
        let end = end as usize;
        if product.data.len() < end {
            product.data.resize(end, 0);
        }
        product.data[start..end].copy_from_slice(payload);

        Ok(self.mark_received(product_id, block))
    }

    /// EOP 수신 표시. 추적 중인 제품이면 true
    pub fn mark_eop(&mut self, product_id: ProductId) -> bool {
        if self.finished.contains_key(&product_id) {
            return false;
        }
        self.ensure_entry(product_id);
        match self.products.get_mut(&product_id) {
            Some(product) => {
                product.touch();
                product.eop_seen = true;
                true
            }
            None => false,
        }
    }

    /// 완료 여부 (완료 후 기록에 남아 있는 동안 true)
    pub fn is_complete(&self, product_id: ProductId) -> bool {
        match self.finished.get(&product_id) {
            Some(finish) => *finish == Finish::Completed,
            None => self
                .products
                .get(&product_id)
                .map(|p| p.bitmap.is_complete())
                .unwrap_or(false),
        }
    }

    /// 종료(완료 또는 손실)된 제품인지
    pub fn is_finished(&self, product_id: ProductId) -> bool {
        self.finished.contains_key(&product_id)
    }

    pub fn is_tracked(&self, product_id: ProductId) -> bool {
        self.products.contains_key(&product_id)
    }

    /// BOP를 아직 받지 못한 제품인지
    pub fn needs_bop(&self, product_id: ProductId) -> bool {
        self.products
            .get(&product_id)
            .map(|p| !p.bitmap.is_sized())
            .unwrap_or(false)
    }

    pub fn eop_seen(&self, product_id: ProductId) -> bool {
        self.products
            .get(&product_id)
            .map(|p| p.eop_seen)
            .unwrap_or(false)
    }

    pub fn product_size(&self, product_id: ProductId) -> Option<u32> {
        self.products
            .get(&product_id)
            .and_then(|p| p.info.as_ref())
            .map(|info| info.product_size)
    }

    pub fn received_count(&self, product_id: ProductId) -> Option<u32> {
        self.products
            .get(&product_id)
            .map(|p| p.bitmap.received_count())
    }

    pub fn total_blocks(&self, product_id: ProductId) -> Option<u32> {
        self.products
            .get(&product_id)
            .map(|p| p.bitmap.total_blocks())
    }

    /// 미수신 블록 구간
    pub fn missing_ranges(&self, product_id: ProductId) -> Vec<BlockRange> {
        self.products
            .get(&product_id)
            .map(|p| p.bitmap.missing_ranges())
            .unwrap_or_default()
    }

    /// 추적 중인 미완성 제품 수
    pub fn tracked_count(&self) -> usize {
        self.products.len()
    }

    /// 마지막 활동 이후 `window` 이상 조용한 제품
    pub fn quiescent(&self, now: Instant, window: Duration) -> Vec<ProductId> {
        let mut ids: Vec<(u64, ProductId)> = self
            .products
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_activity) >= window)
            .map(|(id, p)| (p.seq, *id))
            .collect();
        ids.sort_unstable_by_key(|(seq, _)| *seq);
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// 최초 수신 이후 `timeout`이 지난 제품 포기
    pub fn abandon_stale(&mut self, now: Instant, timeout: Duration) -> Vec<ProductId> {
        let stale: Vec<ProductId> = self
            .products
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.first_seen) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.drop_product(*id);
        }
        stale
    }

    /// 제품 제거 (손실로 기록). 추적 중이었으면 true
    pub fn drop_product(&mut self, product_id: ProductId) -> bool {
        if self.products.remove(&product_id).is_some() {
            self.record_finished(product_id, Finish::Lost);
            true
        } else {
            false
        }
    }

    /// 제품을 손실로 확정. 추적 여부와 관계없이 이후 세그먼트는 무시된다
    ///
    /// 이미 종료된 제품이면 false.
    pub fn reject(&mut self, product_id: ProductId) -> bool {
        if self.finished.contains_key(&product_id) {
            return false;
        }
        self.products.remove(&product_id);
        self.record_finished(product_id, Finish::Lost);
        true
    }

    /// 모든 제품 제거 (세션 종료)
    pub fn clear(&mut self) -> Vec<ProductId> {
        let mut live: Vec<(u64, ProductId)> = self
            .products
            .drain()
            .map(|(id, p)| (p.seq, id))
            .collect();
        live.sort_unstable_by_key(|(seq, _)| *seq);
        let ids: Vec<ProductId> = live.into_iter().map(|(_, id)| id).collect();
        for id in &ids {
            self.record_finished(*id, Finish::Lost);
        }
        ids
    }

    /// 완료/축출 이벤트 꺼내기
    pub fn drain_events(&mut self) -> Vec<TrackerEvent> {
        std::mem::take(&mut self.events)
    }

    fn ensure_entry(&mut self, product_id: ProductId) {
        if self.products.contains_key(&product_id) {
            return;
        }
        self.fill_skipped(product_id);
        let limit = self.growth_limit();
        self.insert_entry(product_id, ProductBitmap::with_growth_limit(limit));
    }

    /// 통째로 건너뛴 제품 ID를 BOP 미수신 상태로 등록
    ///
    /// 추적 용량에 들어가지 않는 앞쪽 ID는 바로 축출(손실)로 보고한다.
    /// 점프가 완료 기록 한도보다 크면 송신측 재시작으로 보고 `Resynced` 하나만 남긴다.
    fn fill_skipped(&mut self, product_id: ProductId) {
        let Some(newest) = self.newest else {
            self.newest = Some(product_id);
            return;
        };
        if !product_id.is_after(newest) {
            return;
        }
        self.newest = Some(product_id);

        let gap = product_id.distance_from(newest) - 1;
        if gap as usize > self.history_limit {
            self.events.push(TrackerEvent::Resynced {
                last: newest,
                next: product_id,
            });
            return;
        }

        // product_id 자신의 자리는 남겨 둔다
        let room = self.max_tracked.saturating_sub(1) as u32;
        let limit = self.growth_limit();
        let mut skipped = newest.next();
        for i in 0..gap {
            if !self.products.contains_key(&skipped) && !self.finished.contains_key(&skipped) {
                if gap - i > room {
                    self.record_finished(skipped, Finish::Lost);
                    self.events.push(TrackerEvent::Evicted(skipped));
                } else {
                    self.insert_entry(skipped, ProductBitmap::with_growth_limit(limit));
                }
            }
            skipped = skipped.next();
        }
    }

    fn insert_entry(&mut self, product_id: ProductId, bitmap: ProductBitmap) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.products
            .insert(product_id, TrackedProduct::new(bitmap, seq));
        self.enforce_capacity(product_id);
    }

    /// 용량 초과 시 가장 오래된 미완성 제품 축출
    fn enforce_capacity(&mut self, keep: ProductId) {
        while self.products.len() > self.max_tracked {
            let oldest = self
                .products
                .iter()
                .filter(|(id, _)| **id != keep)
                .min_by_key(|(_, p)| p.seq)
                .map(|(id, _)| *id);

            match oldest {
                Some(id) => {
                    self.products.remove(&id);
                    self.record_finished(id, Finish::Lost);
                    self.events.push(TrackerEvent::Evicted(id));
                }
                None => break,
            }
        }
    }

    fn complete(&mut self, product_id: ProductId) {
        let Some(product) = self.products.remove(&product_id) else {
            return;
        };
        let mut data = product.data;
        if let Some(info) = &product.info {
            data.resize(info.product_size as usize, 0);
        }

        self.record_finished(product_id, Finish::Completed);
        self.events.push(TrackerEvent::Completed(CompletedProduct {
            product_id,
            info: product.info,
            data: Bytes::from(data),
            elapsed: product.first_seen.elapsed(),
        }));
    }

    fn record_finished(&mut self, product_id: ProductId, finish: Finish) {
        if self.finished.insert(product_id, finish).is_none() {
            self.finished_order.push_back(product_id);
        }
        while self.finished_order.len() > self.history_limit {
            if let Some(old) = self.finished_order.pop_front() {
                self.finished.remove(&old);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(max_tracked: usize) -> BlockTracker {
        BlockTracker::new(&Config {
            block_size: 100,
            max_tracked_products: max_tracked,
            ..Config::default()
        })
    }

    #[test]
    fn test_out_of_order_with_duplicate() {
        let mut tracker = tracker(16);
        let id = ProductId(1);
        tracker.start_product(id, 4);

        for block in [2, 0, 2, 3] {
            assert!(!tracker.mark_received(id, block));
        }

        assert_eq!(tracker.received_count(id), Some(3));
        assert!(!tracker.is_complete(id));
        assert_eq!(tracker.missing_ranges(id), vec![BlockRange::new(1, 2)]);

        assert!(tracker.mark_received(id, 1));
        assert!(tracker.is_complete(id));
        assert!(!tracker.is_tracked(id));
        // 완료 후 중복은 no-op
        assert!(!tracker.mark_received(id, 1));
        assert!(tracker.is_complete(id));
    }

    #[test]
    fn test_count_never_exceeds_total() {
        let mut bitmap = ProductBitmap::new(8);
        // 결정적 의사난수 순서 (중복 포함)
        let mut x: u32 = 12345;
        let mut seen = [false; 8];
        for _ in 0..200 {
            x = x.wrapping_mul(1_103_515_245).wrapping_add(12345);
            let idx = (x >> 16) % 8;
            bitmap.mark(idx);
            seen[idx as usize] = true;
            assert!(bitmap.received_count() <= 8);
            assert_eq!(bitmap.is_complete(), seen.iter().all(|&s| s));
        }
        assert_eq!(bitmap.mark(8), Mark::OutOfRange);
    }

    #[test]
    fn test_missing_ranges_partition() {
        let mut bitmap = ProductBitmap::new(10);
        for idx in [0, 1, 4, 5, 6, 9] {
            bitmap.mark(idx);
        }
        let ranges = bitmap.missing_ranges();
        assert_eq!(ranges, vec![BlockRange::new(2, 4), BlockRange::new(7, 9)]);

        // 미수신 구간 ∪ 수신 블록 = 전체, 겹침 없음
        let mut covered = vec![0u8; 10];
        for range in &ranges {
            for idx in range.start..range.end {
                covered[idx as usize] += 1;
                assert!(!bitmap.is_received(idx));
            }
        }
        for idx in 0..10 {
            if bitmap.is_received(idx) {
                covered[idx as usize] += 1;
            }
        }
        assert!(covered.iter().all(|&c| c == 1));

        // 최대 구간: 인접한 두 구간이 붙어 있지 않음
        for pair in ranges.windows(2) {
            assert!(pair[0].end < pair[1].start);
        }
    }

    #[test]
    fn test_missing_ranges_edges() {
        assert_eq!(ProductBitmap::new(0).missing_ranges(), vec![]);
        assert_eq!(ProductBitmap::new(3).missing_ranges(), vec![BlockRange::new(0, 3)]);

        let mut bitmap = ProductBitmap::new(3);
        bitmap.mark(1);
        assert_eq!(
            bitmap.missing_ranges(),
            vec![BlockRange::new(0, 1), BlockRange::new(2, 3)]
        );
    }

    #[test]
    fn test_segments_before_bop_grow_lazily() {
        let mut tracker = tracker(16);
        let id = ProductId(3);

        assert!(!tracker.insert_block(id, 200, &[3u8; 100]).unwrap());
        assert!(tracker.needs_bop(id));
        assert_eq!(tracker.total_blocks(id), Some(3));
        assert_eq!(tracker.missing_ranges(id), vec![BlockRange::new(0, 2)]);

        tracker.insert_block(id, 0, &[1u8; 100]).unwrap();
        tracker.insert_block(id, 100, &[2u8; 100]).unwrap();
        assert!(!tracker.is_complete(id));

        // BOP 도착 시 완료
        let info = BopInfo::new(250, Bytes::new());
        assert!(tracker.begin(id, info).unwrap());
        assert!(tracker.is_complete(id));

        let events = tracker.drain_events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            TrackerEvent::Completed(product) => {
                assert_eq!(product.data.len(), 250);
                assert_eq!(&product.data[..100], &[1u8; 100][..]);
                assert_eq!(&product.data[200..250], &[3u8; 50][..]);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_assembly_after_bop() {
        let mut tracker = tracker(16);
        let id = ProductId(5);
        let data: Vec<u8> = (0..250).map(|i| i as u8).collect();

        assert!(!tracker.begin(id, BopInfo::new(250, Bytes::from_static(b"m"))).unwrap());
        assert!(!tracker.insert_block(id, 200, &data[200..]).unwrap());
        assert!(!tracker.insert_block(id, 0, &data[..100]).unwrap());
        // 중복
        assert!(!tracker.insert_block(id, 0, &data[..100]).unwrap());
        assert!(tracker.insert_block(id, 100, &data[100..200]).unwrap());

        match tracker.drain_events().pop() {
            Some(TrackerEvent::Completed(product)) => {
                assert_eq!(product.data.as_ref(), &data[..]);
                assert_eq!(product.info.unwrap().metadata.as_ref(), b"m");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_rejects_bad_segments() {
        let mut tracker = tracker(16);
        let id = ProductId(5);
        tracker.begin(id, BopInfo::new(250, Bytes::new())).unwrap();

        // 정렬 안 됨
        assert!(tracker.insert_block(id, 50, &[0u8; 100]).is_err());
        // 블록 크기 초과
        assert!(tracker.insert_block(id, 0, &[0u8; 101]).is_err());
        // 마지막 블록 길이 불일치
        assert!(tracker.insert_block(id, 200, &[0u8; 100]).is_err());
        // 제품 크기 밖
        assert!(tracker.insert_block(id, 300, &[0u8; 10]).is_err());
        assert_eq!(tracker.received_count(id), Some(0));

        let too_big = BopInfo::new(u32::MAX, Bytes::new());
        assert!(matches!(
            tracker.begin(ProductId(6), too_big),
            Err(Error::ProductTooLarge { .. })
        ));
    }

    #[test]
    fn test_empty_product_completes_on_start() {
        let mut tracker = tracker(16);
        assert!(tracker.begin(ProductId(9), BopInfo::new(0, Bytes::new())).unwrap());
        assert!(tracker.is_complete(ProductId(9)));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut tracker = tracker(2);
        tracker.start_product(ProductId(10), 4);
        tracker.start_product(ProductId(11), 4);
        tracker.mark_received(ProductId(10), 0);
        tracker.start_product(ProductId(12), 4);

        assert!(!tracker.is_tracked(ProductId(10)));
        assert!(tracker.is_tracked(ProductId(11)));
        assert!(tracker.is_tracked(ProductId(12)));
        assert!(tracker.is_finished(ProductId(10)));

        let evicted: Vec<ProductId> = tracker
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                TrackerEvent::Evicted(id) => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(evicted, vec![ProductId(10)]);

        // 축출된 제품의 지연 세그먼트는 무시
        assert!(!tracker.mark_received(ProductId(10), 1));
        assert!(!tracker.is_tracked(ProductId(10)));
    }

    #[test]
    fn test_skipped_products_tracked_across_wrap() {
        let mut tracker = tracker(16);
        tracker.start_product(ProductId(u32::MAX - 1), 1);
        tracker.start_product(ProductId(1), 1);

        // u32::MAX, 0 은 통째로 누락
        assert!(tracker.needs_bop(ProductId(u32::MAX)));
        assert!(tracker.needs_bop(ProductId(0)));
        assert_eq!(tracker.tracked_count(), 4);

        // 과거 ID는 채우지 않음
        tracker.start_product(ProductId(u32::MAX - 5), 1);
        assert_eq!(tracker.tracked_count(), 5);
    }

    fn evicted_ids(tracker: &mut BlockTracker) -> Vec<ProductId> {
        let mut ids: Vec<ProductId> = tracker
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                TrackerEvent::Evicted(id) => Some(id),
                _ => None,
            })
            .collect();
        ids.sort_by_key(|id| id.0);
        ids
    }

    #[test]
    fn test_skip_larger_than_capacity_reports_every_id() {
        let mut tracker = tracker(4);
        tracker.start_product(ProductId(0), 2);
        tracker.start_product(ProductId(10), 2);

        // 7, 8, 9만 BOP 대기로 추적, 나머지는 손실
        for id in 7..=10 {
            assert!(tracker.is_tracked(ProductId(id)), "id {}", id);
        }
        assert_eq!(tracker.tracked_count(), 4);
        assert_eq!(
            evicted_ids(&mut tracker),
            (0..=6).map(ProductId).collect::<Vec<_>>()
        );
        assert!(tracker.is_finished(ProductId(3)));

        // 이미 보고된 ID는 다시 보고하지 않음
        tracker.clear();
        assert!(evicted_ids(&mut tracker).is_empty());
    }

    #[test]
    fn test_huge_jump_resyncs() {
        let mut tracker = BlockTracker::new(&Config {
            block_size: 100,
            max_tracked_products: 16,
            finished_history: 8,
            ..Config::default()
        });
        tracker.start_product(ProductId(1), 2);
        tracker.start_product(ProductId(100), 2);

        assert_eq!(tracker.tracked_count(), 2);
        let events = tracker.drain_events();
        assert!(matches!(
            events.as_slice(),
            [TrackerEvent::Resynced {
                last: ProductId(1),
                next: ProductId(100)
            }]
        ));
    }

    #[test]
    fn test_quiescent_and_stale() {
        let mut tracker = tracker(16);
        tracker.start_product(ProductId(1), 2);
        tracker.start_product(ProductId(2), 2);

        let now = Instant::now();
        assert!(tracker.quiescent(now, Duration::from_secs(60)).is_empty());

        let later = now + Duration::from_secs(61);
        assert_eq!(
            tracker.quiescent(later, Duration::from_secs(60)),
            vec![ProductId(1), ProductId(2)]
        );

        let stale = tracker.abandon_stale(later, Duration::from_secs(60));
        assert_eq!(stale.len(), 2);
        assert_eq!(tracker.tracked_count(), 0);
        assert!(!tracker.is_complete(ProductId(1)));
    }

    #[test]
    fn test_clear_drops_everything() {
        let mut tracker = tracker(16);
        tracker.start_product(ProductId(1), 2);
        tracker.insert_block(ProductId(2), 0, &[0u8; 100]).unwrap();
        assert_eq!(tracker.clear(), vec![ProductId(1), ProductId(2)]);
        assert_eq!(tracker.tracked_count(), 0);
    }

    #[test]
    fn test_reject_blocks_late_segments() {
        let mut tracker = tracker(16);
        assert!(tracker.reject(ProductId(5)));
        assert!(!tracker.reject(ProductId(5)));
        assert!(!tracker.insert_block(ProductId(5), 0, &[0u8; 100]).unwrap());
        assert!(!tracker.is_tracked(ProductId(5)));
        assert!(tracker.is_finished(ProductId(5)));
    }

    #[test]
    fn test_byte_range_conversion() {
        let range = BlockRange::new(1, 3);
        assert_eq!(range.to_byte_range(100, None), (100, 200));
        assert_eq!(range.to_byte_range(100, Some(250)), (100, 150));
        assert_eq!(BlockRange::from_byte_range(100, 150, 100), BlockRange::new(1, 3));
        assert_eq!(BlockRange::from_byte_range(0, 0, 100), BlockRange::new(0, 0));
    }
}

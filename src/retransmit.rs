//! 재전송 요청 큐
//!
//! - 제품당 요청 항목은 하나 (누락 구간은 병합)
//! - 응답이 없으면 지수 백오프로 재요청
//! - 최대 시도 횟수를 넘기면 제품 손실로 판정

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::pdu::ProductId;
use crate::tracker::BlockRange;
use crate::Config;

/// 재시도 정책
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 첫 요청의 응답 대기 시간
    pub timeout: Duration,

    /// 재시도마다 곱하는 배수
    pub backoff_factor: f64,

    /// 대기 시간 상한
    pub max_backoff: Duration,

    /// 제품당 최대 요청 횟수
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout: config.retx_timeout(),
            backoff_factor: config.retx_backoff_factor,
            max_backoff: Duration::from_millis(config.retx_max_backoff_ms),
            max_attempts: config.retx_max_attempts.max(1),
        }
    }

    /// `attempt`번째(1부터) 요청의 응답 대기 시간
    pub fn timeout_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.timeout.as_secs_f64() * self.backoff_factor.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_backoff.as_secs_f64()))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// 송신할 재전송 요청
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetransRequestEntry {
    pub product_id: ProductId,

    /// 누락 블록 구간 (정렬, 비중첩)
    pub ranges: Vec<BlockRange>,

    /// BOP도 함께 요청
    pub needs_bop: bool,

    /// 이번이 몇 번째 요청인지
    pub attempt: u32,
}

#[derive(Debug)]
struct QueuedRequest {
    ranges: Vec<BlockRange>,
    needs_bop: bool,
    attempts: u32,
    /// 현재 요청의 응답 마감. None이면 아직 보내지 않음
    deadline: Option<Instant>,
    order: u64,
}

impl QueuedRequest {
    fn is_empty(&self) -> bool {
        self.ranges.is_empty() && !self.needs_bop
    }
}

/// 재전송 요청 큐
pub struct RetransmissionQueue {
    policy: RetryPolicy,
    entries: HashMap<ProductId, QueuedRequest>,
    /// 한 번이라도 요청을 보낸 제품 (완료 시 RetransEnd 대상)
    requested: HashSet<ProductId>,
    next_order: u64,
}

impl RetransmissionQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            entries: HashMap::new(),
            requested: HashSet::new(),
            next_order: 0,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn entry(&mut self, product_id: ProductId) -> &mut QueuedRequest {
        let order = self.next_order;
        let entry = self.entries.entry(product_id).or_insert_with(|| QueuedRequest {
            ranges: Vec::new(),
            needs_bop: false,
            attempts: 0,
            deadline: None,
            order,
        });
        if entry.order == order {
            self.next_order += 1;
        }
        entry
    }

    /// 누락 구간 등록 (기존 항목과 병합)
    pub fn on_gap_detected(&mut self, product_id: ProductId, ranges: &[BlockRange]) {
        let ranges: Vec<BlockRange> = ranges.iter().copied().filter(|r| !r.is_empty()).collect();
        if ranges.is_empty() {
            return;
        }
        let entry = self.entry(product_id);
        entry.ranges = merge_ranges(&entry.ranges, &ranges);
    }

    /// BOP 요청 등록
    pub fn on_missing_bop(&mut self, product_id: ProductId) {
        self.entry(product_id).needs_bop = true;
    }

    /// 보낼 차례인 요청 하나 꺼내기
    ///
    /// 아직 보내지 않은 항목, 또는 응답 마감이 지났고 시도 횟수가 남은 항목.
    pub fn next_request(&mut self, now: Instant) -> Option<RetransRequestEntry> {
        let max_attempts = self.policy.max_attempts;
        let (&product_id, _) = self
            .entries
            .iter()
            .filter(|(_, e)| {
                e.attempts < max_attempts && e.deadline.map_or(true, |d| d <= now)
            })
            .min_by_key(|(_, e)| e.order)?;

        let entry = self.entries.get_mut(&product_id)?;
        entry.attempts += 1;
        entry.deadline = Some(now + self.policy.timeout_for(entry.attempts));
        self.requested.insert(product_id);

        Some(RetransRequestEntry {
            product_id,
            ranges: entry.ranges.clone(),
            needs_bop: entry.needs_bop,
            attempt: entry.attempts,
        })
    }

    /// 시도 횟수를 모두 쓰고 마감도 지난 제품 제거 후 반환
    pub fn expire(&mut self, now: Instant) -> Vec<ProductId> {
        let max_attempts = self.policy.max_attempts;
        let mut exhausted: Vec<(u64, ProductId)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.attempts >= max_attempts && e.deadline.map_or(false, |d| d <= now))
            .map(|(id, e)| (e.order, *id))
            .collect();
        exhausted.sort_unstable_by_key(|(order, _)| *order);

        exhausted
            .into_iter()
            .map(|(_, id)| {
                self.entries.remove(&id);
                self.requested.remove(&id);
                id
            })
            .collect()
    }

    /// 재전송 데이터로 채워진 구간 제거
    ///
    /// 부분 구간이면 기존 구간을 나눈다. 변화가 있었으면 true.
    pub fn on_satisfied(&mut self, product_id: ProductId, range: BlockRange) -> bool {
        let Some(entry) = self.entries.get_mut(&product_id) else {
            return false;
        };
        let remaining = subtract_range(&entry.ranges, range);
        let changed = remaining != entry.ranges;
        entry.ranges = remaining;

        if changed {
            // 응답이 오고 있으므로 마감 연장
            if let Some(deadline) = entry.deadline.as_mut() {
                let refreshed = Instant::now() + self.policy.timeout_for(entry.attempts);
                if refreshed > *deadline {
                    *deadline = refreshed;
                }
            }
        }
        if entry.is_empty() {
            self.entries.remove(&product_id);
        }
        changed
    }

    /// 요청 구간을 아직 누락인 구간으로 좁히고 남은 구간 반환
    ///
    /// 멀티캐스트로 늦게 도착한 블록은 다시 요청하지 않는다.
    pub fn restrict_to(&mut self, product_id: ProductId, missing: &[BlockRange]) -> Vec<BlockRange> {
        let Some(entry) = self.entries.get_mut(&product_id) else {
            return Vec::new();
        };
        entry.ranges = intersect_ranges(&entry.ranges, missing);
        let ranges = entry.ranges.clone();
        if entry.is_empty() {
            self.entries.remove(&product_id);
        }
        ranges
    }

    /// BOP 수신 처리
    pub fn on_bop_received(&mut self, product_id: ProductId) {
        if let Some(entry) = self.entries.get_mut(&product_id) {
            entry.needs_bop = false;
            if entry.is_empty() {
                self.entries.remove(&product_id);
            }
        }
    }

    /// 제품 항목 제거 (완료/손실/거부)
    pub fn drop_product(&mut self, product_id: ProductId) -> bool {
        self.requested.remove(&product_id);
        self.entries.remove(&product_id).is_some()
    }

    /// 모든 요청 폐기 (세션 종료)
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        self.requested.clear();
        count
    }

    pub fn contains(&self, product_id: ProductId) -> bool {
        self.entries.contains_key(&product_id)
    }

    pub fn pending_ranges(&self, product_id: ProductId) -> Vec<BlockRange> {
        self.entries
            .get(&product_id)
            .map(|e| e.ranges.clone())
            .unwrap_or_default()
    }

    /// 재전송을 요청했던 제품인지 (한 번이라도 송신)
    pub fn was_requested(&self, product_id: ProductId) -> bool {
        self.requested.contains(&product_id)
    }

    /// 제품 완료 처리: 항목 제거 후 요청 이력이 있었으면 true
    pub fn finish(&mut self, product_id: ProductId) -> bool {
        self.entries.remove(&product_id);
        self.requested.remove(&product_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 두 구간 목록의 합집합 (정렬, 인접 구간 병합)
fn merge_ranges(a: &[BlockRange], b: &[BlockRange]) -> Vec<BlockRange> {
    let mut all: Vec<BlockRange> = a.iter().chain(b.iter()).copied().collect();
    all.sort_unstable_by_key(|r| r.start);

    let mut merged: Vec<BlockRange> = Vec::with_capacity(all.len());
    for range in all {
        match merged.last_mut() {
            Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
            _ => merged.push(range),
        }
    }
    merged
}

/// 구간 목록에서 `cut` 제거
fn subtract_range(ranges: &[BlockRange], cut: BlockRange) -> Vec<BlockRange> {
    let mut result = Vec::with_capacity(ranges.len() + 1);
    for &range in ranges {
        if cut.end <= range.start || cut.start >= range.end {
            result.push(range);
            continue;
        }
        if range.start < cut.start {
            result.push(BlockRange::new(range.start, cut.start));
        }
        if cut.end < range.end {
            result.push(BlockRange::new(cut.end, range.end));
        }
    }
    result
}

/// 두 구간 목록의 교집합 (둘 다 정렬, 비중첩)
fn intersect_ranges(a: &[BlockRange], b: &[BlockRange]) -> Vec<BlockRange> {
    let mut result = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        let start = a[i].start.max(b[j].start);
        let end = a[i].end.min(b[j].end);
        if start < end {
            result.push(BlockRange::new(start, end));
        }
        if a[i].end < b[j].end {
            i += 1;
        } else {
            j += 1;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_backoff: Duration::from_millis(1_000),
            max_attempts,
        }
    }

    #[test]
    fn test_satisfied_range_empties_queue() {
        let mut queue = RetransmissionQueue::new(policy(3));
        let id = ProductId(7);
        queue.on_gap_detected(id, &[BlockRange::new(1, 2)]);
        assert!(queue.contains(id));

        assert!(queue.on_satisfied(id, BlockRange::new(1, 2)));
        assert!(!queue.contains(id));
        assert!(queue.is_empty());

        // 두 번째 호출은 no-op
        assert!(!queue.on_satisfied(id, BlockRange::new(1, 2)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_partial_satisfaction_splits() {
        let mut queue = RetransmissionQueue::new(policy(3));
        let id = ProductId(1);
        queue.on_gap_detected(id, &[BlockRange::new(0, 10)]);
        queue.on_satisfied(id, BlockRange::new(3, 5));
        assert_eq!(
            queue.pending_ranges(id),
            vec![BlockRange::new(0, 3), BlockRange::new(5, 10)]
        );
    }

    #[test]
    fn test_gaps_coalesce_into_one_entry() {
        let mut queue = RetransmissionQueue::new(policy(3));
        let id = ProductId(1);
        queue.on_gap_detected(id, &[BlockRange::new(0, 2), BlockRange::new(6, 8)]);
        queue.on_gap_detected(id, &[BlockRange::new(2, 3), BlockRange::new(7, 9)]);
        assert_eq!(queue.len(), 1);
        assert_eq!(
            queue.pending_ranges(id),
            vec![BlockRange::new(0, 3), BlockRange::new(6, 9)]
        );

        let now = Instant::now();
        let first = queue.next_request(now).unwrap();
        assert_eq!(first.attempt, 1);
        // 응답 대기 중에는 같은 제품 요청이 다시 나오지 않음
        queue.on_gap_detected(id, &[BlockRange::new(20, 21)]);
        assert!(queue.next_request(now).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_retry_budget_exhaustion_reports_once() {
        let mut queue = RetransmissionQueue::new(policy(3));
        let id = ProductId(7);
        queue.on_gap_detected(id, &[BlockRange::new(1, 2)]);

        let mut now = Instant::now();
        let mut issued = 0;
        let mut lost = Vec::new();

        for _ in 0..10 {
            lost.extend(queue.expire(now));
            while let Some(request) = queue.next_request(now) {
                assert_eq!(request.product_id, id);
                issued += 1;
            }
            now += Duration::from_secs(2);
        }

        assert_eq!(issued, 3);
        assert_eq!(lost, vec![id]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = policy(10);
        assert_eq!(policy.timeout_for(1), Duration::from_millis(100));
        assert_eq!(policy.timeout_for(2), Duration::from_millis(200));
        assert_eq!(policy.timeout_for(3), Duration::from_millis(400));
        assert_eq!(policy.timeout_for(8), Duration::from_millis(1_000));
    }

    #[test]
    fn test_retry_waits_for_deadline() {
        let mut queue = RetransmissionQueue::new(policy(3));
        let id = ProductId(2);
        queue.on_gap_detected(id, &[BlockRange::new(0, 1)]);

        let start = Instant::now();
        assert_eq!(queue.next_request(start).unwrap().attempt, 1);
        assert!(queue.next_request(start + Duration::from_millis(99)).is_none());
        assert_eq!(
            queue.next_request(start + Duration::from_millis(100)).unwrap().attempt,
            2
        );
        // 두 번째 대기는 200ms
        let second = start + Duration::from_millis(100);
        assert!(queue.next_request(second + Duration::from_millis(199)).is_none());
        assert_eq!(
            queue.next_request(second + Duration::from_millis(200)).unwrap().attempt,
            3
        );
    }

    #[test]
    fn test_bop_request_lifecycle() {
        let mut queue = RetransmissionQueue::new(policy(3));
        let id = ProductId(4);
        queue.on_missing_bop(id);
        let request = queue.next_request(Instant::now()).unwrap();
        assert!(request.needs_bop);
        assert!(request.ranges.is_empty());
        assert!(queue.was_requested(id));

        queue.on_bop_received(id);
        assert!(!queue.contains(id));
        // 요청 이력은 완료 처리 때까지 유지
        assert!(queue.was_requested(id));
        assert!(queue.finish(id));
        assert!(!queue.finish(id));
    }

    #[test]
    fn test_requests_in_detection_order() {
        let mut queue = RetransmissionQueue::new(policy(3));
        queue.on_gap_detected(ProductId(9), &[BlockRange::new(0, 1)]);
        queue.on_gap_detected(ProductId(3), &[BlockRange::new(0, 1)]);
        let now = Instant::now();
        assert_eq!(queue.next_request(now).unwrap().product_id, ProductId(9));
        assert_eq!(queue.next_request(now).unwrap().product_id, ProductId(3));
        assert!(queue.next_request(now).is_none());
    }

    #[test]
    fn test_restrict_drops_blocks_no_longer_missing() {
        let mut queue = RetransmissionQueue::new(policy(3));
        let id = ProductId(11);
        queue.on_gap_detected(id, &[BlockRange::new(1, 5), BlockRange::new(8, 10)]);

        let left = queue.restrict_to(id, &[BlockRange::new(0, 2), BlockRange::new(4, 9)]);
        assert_eq!(
            left,
            vec![BlockRange::new(1, 2), BlockRange::new(4, 5), BlockRange::new(8, 9)]
        );
        assert_eq!(queue.pending_ranges(id), left);

        // 모두 도착했으면 항목 제거
        assert!(queue.restrict_to(id, &[]).is_empty());
        assert!(!queue.contains(id));
    }
}

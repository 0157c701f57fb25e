//! 分区键哈希区间与消费者归属（PartitionAffinity）
//!
//! 表示一个消费者实例负责的键哈希区间集合（key-shared 分配的本地视图）：
//! - 区间按 `start` 升序存储，闭区间，互不重叠；
//! - `is_match` 对键做稳定哈希后在有序区间上二分查找；
//! - 结构相等用于检测 broker 侧分配发生变化，需要刷新。
//!
//! 哈希空间固定为 0..65535，与 broker 的 key-shared 分区方案一致。
//! 键哈希采用 FNV-1a（32 位）取模：实现简单、跨进程稳定。
//!
use serde::{Deserialize, Serialize};

/// 键哈希空间大小（0..=65535）
pub const HASH_SPACE_SIZE: u32 = 65536;

/// 一段闭区间 `[start, end]`，两端均含
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashRange {
    pub start: u16,
    pub end: u16,
}

impl HashRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, hash: u16) -> bool {
        self.start <= hash && hash <= self.end
    }
}

/// 消费者实例负责的哈希区间集合
///
/// 空集合表示未分片订阅：该消费者拥有整个键空间，任意键均匹配。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionAffinity {
    ranges: Vec<HashRange>,
}

impl PartitionAffinity {
    /// 从无序区间列表构建；内部按 `start` 升序存储以支持二分查找
    pub fn new(mut ranges: Vec<HashRange>) -> Self {
        ranges.sort_by_key(|r| r.start);
        Self { ranges }
    }

    /// 覆盖整个键空间（等价于空区间集合）
    pub fn all() -> Self {
        Self::default()
    }

    pub fn ranges(&self) -> &[HashRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// 判断某个分区键是否归属本消费者
    pub fn is_match(&self, key: &str) -> bool {
        if self.ranges.is_empty() {
            return true;
        }
        self.contains_hash(key_hash(key))
    }

    /// 在有序区间上二分查找 `hash`
    pub fn contains_hash(&self, hash: u16) -> bool {
        let mut left = 0usize;
        let mut right = self.ranges.len();

        while left < right {
            let mid = left + (right - left) / 2;
            let range = &self.ranges[mid];
            if hash < range.start {
                right = mid;
            } else if hash > range.end {
                left = mid + 1;
            } else {
                return true;
            }
        }
        false
    }
}

/// 分区键的稳定哈希，落在 `0..HASH_SPACE_SIZE`
pub fn key_hash(key: &str) -> u16 {
    (fnv1a32(key.as_bytes()) % HASH_SPACE_SIZE) as u16
}

// FNV-1a 32 位
fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in bytes {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn affinity(pairs: &[(u16, u16)]) -> PartitionAffinity {
        PartitionAffinity::new(pairs.iter().map(|(s, e)| HashRange::new(*s, *e)).collect())
    }

    #[test]
    fn empty_ranges_match_everything() {
        let aff = PartitionAffinity::all();
        assert!(aff.is_match("any-key"));
        assert!(aff.is_match(""));
    }

    #[test]
    fn inclusive_boundaries() {
        let aff = affinity(&[(0, 100), (200, 300)]);
        assert!(aff.contains_hash(50));
        assert!(!aff.contains_hash(150));
        assert!(aff.contains_hash(200));
        assert!(aff.contains_hash(300));
        assert!(!aff.contains_hash(301));
        assert!(aff.contains_hash(0));
        assert!(!aff.contains_hash(101));
    }

    #[test]
    fn single_point_range() {
        let aff = affinity(&[(42, 42)]);
        assert!(aff.contains_hash(42));
        assert!(!aff.contains_hash(41));
        assert!(!aff.contains_hash(43));
    }

    #[test]
    fn unsorted_input_is_sorted() {
        let aff = affinity(&[(200, 300), (0, 100)]);
        assert_eq!(aff.ranges()[0].start, 0);
        assert_eq!(aff.ranges()[1].start, 200);
    }

    #[test]
    fn structural_equality_detects_assignment_change() {
        let a = affinity(&[(0, 100), (200, 300)]);
        let b = affinity(&[(200, 300), (0, 100)]);
        let c = affinity(&[(0, 100)]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn binary_search_agrees_with_linear_scan() {
        let aff = affinity(&[
            (0, 100),
            (512, 1024),
            (2000, 2000),
            (10_000, 20_000),
            (40_000, 65_535),
        ]);

        // 确定性的伪随机采样 1000 个哈希值，二分与线性扫描必须一致
        let mut state = 0x2545_f491u32;
        for _ in 0..1000 {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let hash = (state % HASH_SPACE_SIZE) as u16;
            let linear = aff.ranges().iter().any(|r| r.contains(hash));
            assert_eq!(aff.contains_hash(hash), linear, "hash={hash}");
        }
    }

    #[test]
    fn key_hash_is_stable_and_in_space() {
        assert_eq!(key_hash("order-1"), key_hash("order-1"));
        assert_ne!(key_hash("order-1"), key_hash("order-2"));
    }
}

//! Upload strategy selection
//!
//! Maps the number of unique files in a submission to the way they are
//! pushed through the batch API. The mapping is a pure function of its inputs.

use serde::Serialize;

/// Thresholds and limits the selector works with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyConfig {
    pub direct_threshold: usize,
    pub adaptive_threshold: usize,
    pub batch_size: usize,
    pub max_batch_size: usize,
    pub max_concurrency: usize,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            direct_threshold: 100,
            adaptive_threshold: 1000,
            batch_size: 50,
            max_batch_size: 100,
            max_concurrency: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// One handshake for the whole set, transfers run in parallel
    DirectParallel,
    /// Fixed-size batches
    Batched,
    /// Batch size grows with volume; batches are throttled
    Adaptive,
}

impl StrategyKind {
    pub fn as_str(&self) -> &str {
        match self {
            StrategyKind::DirectParallel => "direct-parallel",
            StrategyKind::Batched => "batched",
            StrategyKind::Adaptive => "adaptive",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Strategy {
    pub kind: StrategyKind,
    pub concurrency: usize,
    /// `None` when the set is not split
    pub batch_size: Option<usize>,
    pub throttling: bool,
}

impl Strategy {
    pub fn is_batched(&self) -> bool {
        self.batch_size.is_some()
    }

    /// Number of batches a set of `count` files is split into
    pub fn batch_count(&self, count: usize) -> usize {
        match self.batch_size {
            Some(size) => count.div_ceil(size),
            None => usize::from(count > 0),
        }
    }
}

/// Pick the strategy for `count` unique files
pub fn select_strategy(count: usize, config: &StrategyConfig) -> Strategy {
    let concurrency = config.max_concurrency.min(count).max(1);

    if count <= config.direct_threshold {
        Strategy {
            kind: StrategyKind::DirectParallel,
            concurrency,
            batch_size: None,
            throttling: false,
        }
    } else if count <= config.adaptive_threshold {
        Strategy {
            kind: StrategyKind::Batched,
            concurrency,
            batch_size: Some(config.batch_size.max(1)),
            throttling: false,
        }
    } else {
        let adaptive = count.div_ceil(100).min(config.max_batch_size).max(1);
        Strategy {
            kind: StrategyKind::Adaptive,
            concurrency,
            batch_size: Some(adaptive),
            throttling: true,
        }
    }
}

/// Split items into consecutive chunks of at most `batch_size` (`None` = one chunk)
pub fn partition<T>(items: Vec<T>, batch_size: Option<usize>) -> Vec<Vec<T>> {
    if items.is_empty() {
        return Vec::new();
    }

    let size = match batch_size {
        Some(size) => size.max(1),
        None => return vec![items],
    };

    let mut batches = Vec::with_capacity(items.len().div_ceil(size));
    let mut current = Vec::with_capacity(size);
    for item in items {
        current.push(item);
        if current.len() == size {
            batches.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_concurrency: usize) -> StrategyConfig {
        StrategyConfig {
            max_concurrency,
            ..StrategyConfig::default()
        }
    }

    #[test]
    fn test_small_set_is_direct() {
        let strategy = select_strategy(5, &config(3));
        assert_eq!(strategy.kind, StrategyKind::DirectParallel);
        assert_eq!(strategy.concurrency, 3);
        assert_eq!(strategy.batch_size, None);
        assert!(!strategy.throttling);
        assert_eq!(strategy.batch_count(5), 1);
    }

    #[test]
    fn test_concurrency_capped_by_count() {
        let strategy = select_strategy(2, &config(10));
        assert_eq!(strategy.concurrency, 2);

        let strategy = select_strategy(0, &config(10));
        assert_eq!(strategy.concurrency, 1);
        assert_eq!(strategy.batch_count(0), 0);
    }

    #[test]
    fn test_boundaries() {
        assert_eq!(select_strategy(100, &config(5)).kind, StrategyKind::DirectParallel);
        assert_eq!(select_strategy(101, &config(5)).kind, StrategyKind::Batched);
        assert_eq!(select_strategy(1000, &config(5)).kind, StrategyKind::Batched);
        assert_eq!(select_strategy(1001, &config(5)).kind, StrategyKind::Adaptive);
    }

    #[test]
    fn test_batched_uses_fixed_size() {
        let strategy = select_strategy(250, &config(5));
        assert_eq!(strategy.batch_size, Some(50));
        assert_eq!(strategy.concurrency, 5);
        assert!(!strategy.throttling);
        assert_eq!(strategy.batch_count(250), 5);
    }

    #[test]
    fn test_adaptive_batch_size() {
        let strategy = select_strategy(1001, &config(5));
        assert_eq!(strategy.batch_size, Some(11));
        assert!(strategy.throttling);

        let strategy = select_strategy(5000, &config(5));
        assert_eq!(strategy.batch_size, Some(50));

        let strategy = select_strategy(50_000, &config(5));
        assert_eq!(strategy.batch_size, Some(100));
    }

    #[test]
    fn test_selection_is_deterministic() {
        let cfg = config(7);
        for n in [0, 1, 99, 100, 101, 500, 1000, 1001, 12_345, 99_999] {
            assert_eq!(select_strategy(n, &cfg), select_strategy(n, &cfg));
        }
    }

    #[test]
    fn test_partition() {
        let batches = partition((0..250).collect(), Some(50));
        assert_eq!(batches.len(), 5);
        assert!(batches.iter().all(|b| b.len() == 50));

        let batches = partition((0..7).collect(), Some(3));
        assert_eq!(batches, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);

        let batches = partition((0..7).collect::<Vec<i32>>(), None);
        assert_eq!(batches.len(), 1);

        assert!(partition(Vec::<i32>::new(), Some(3)).is_empty());
    }
}

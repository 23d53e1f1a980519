use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use taskpilot_core::SchedulerError;
use tracing::debug;

/// 参与选择的端点视图
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub name: String,
    pub priority: u32,
    pub success_rate: f64,
    pub avg_latency_ms: Option<f64>,
}

/// 端点选择策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectionStrategy {
    /// 优先级数字最小者，成功率高者优先
    Priority,
    RoundRobin,
    /// 平均延迟最低者，尚无成功样本的端点视为0
    LeastLatency,
    Random,
}

impl SelectionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            SelectionStrategy::Priority => "priority",
            SelectionStrategy::RoundRobin => "round_robin",
            SelectionStrategy::LeastLatency => "least_latency",
            SelectionStrategy::Random => "random",
        }
    }

    /// 从候选中选出一个，返回其下标
    ///
    /// 候选列表需按 (priority, name) 排好序，轮询游标才有稳定含义。
    pub fn pick(self, candidates: &[Candidate], cursor: &AtomicUsize) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        let index = match self {
            SelectionStrategy::Priority => candidates
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    a.priority.cmp(&b.priority).then_with(|| {
                        b.success_rate
                            .partial_cmp(&a.success_rate)
                            .unwrap_or(CmpOrdering::Equal)
                    })
                })
                .map(|(i, _)| i)?,
            SelectionStrategy::RoundRobin => {
                cursor.fetch_add(1, Ordering::Relaxed) % candidates.len()
            }
            SelectionStrategy::LeastLatency => candidates
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    a.avg_latency_ms
                        .unwrap_or(0.0)
                        .partial_cmp(&b.avg_latency_ms.unwrap_or(0.0))
                        .unwrap_or(CmpOrdering::Equal)
                })
                .map(|(i, _)| i)?,
            SelectionStrategy::Random => rand::rng().random_range(0..candidates.len()),
        };

        debug!(
            "{} 策略选择端点: {} ({}/{})",
            self,
            candidates[index].name,
            index + 1,
            candidates.len()
        );
        Some(index)
    }
}

impl Default for SelectionStrategy {
    fn default() -> Self {
        SelectionStrategy::Priority
    }
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionStrategy {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "priority" => Ok(SelectionStrategy::Priority),
            "round_robin" | "round-robin" => Ok(SelectionStrategy::RoundRobin),
            "least_latency" | "least-latency" => Ok(SelectionStrategy::LeastLatency),
            "random" => Ok(SelectionStrategy::Random),
            other => Err(SchedulerError::Validation(format!(
                "未知的端点选择策略: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(name: &str, priority: u32, success_rate: f64, latency: Option<f64>) -> Candidate {
        Candidate {
            name: name.to_string(),
            priority,
            success_rate,
            avg_latency_ms: latency,
        }
    }

    #[test]
    fn test_priority_breaks_ties_by_success_rate() {
        let cursor = AtomicUsize::new(0);
        let candidates = vec![
            candidate("a", 2, 1.0, None),
            candidate("b", 1, 0.6, None),
            candidate("c", 1, 0.9, None),
        ];
        assert_eq!(SelectionStrategy::Priority.pick(&candidates, &cursor), Some(2));
    }

    #[test]
    fn test_round_robin_rotates() {
        let cursor = AtomicUsize::new(0);
        let candidates = vec![candidate("a", 1, 1.0, None), candidate("b", 1, 1.0, None)];
        let picks: Vec<_> = (0..4)
            .filter_map(|_| SelectionStrategy::RoundRobin.pick(&candidates, &cursor))
            .collect();
        assert_eq!(picks, vec![0, 1, 0, 1]);
    }

    #[test]
    fn test_least_latency_prefers_fastest() {
        let cursor = AtomicUsize::new(0);
        let candidates = vec![
            candidate("slow", 1, 1.0, Some(800.0)),
            candidate("fast", 2, 1.0, Some(120.0)),
        ];
        assert_eq!(
            SelectionStrategy::LeastLatency.pick(&candidates, &cursor),
            Some(1)
        );
    }

    #[test]
    fn test_empty_and_parse() {
        let cursor = AtomicUsize::new(0);
        assert_eq!(SelectionStrategy::Random.pick(&[], &cursor), None);
        assert_eq!(
            "round-robin".parse::<SelectionStrategy>().unwrap(),
            SelectionStrategy::RoundRobin
        );
        assert!("fastest".parse::<SelectionStrategy>().is_err());
    }
}

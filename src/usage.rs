//! Token usage accounting shared by concurrent work units.
//!
//! The ledger is the only state mutated across section work units, so it is
//! plain atomic counters: monotonically increasing, never reset mid-run.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-call token counts as reported by a backend response.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UsageCounts {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// Running totals for one run. Updated only on successful calls.
#[derive(Debug, Default)]
pub struct UsageLedger {
    calls: AtomicU64,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    total_tokens: AtomicU64,
}

/// Serializable snapshot written to `usage.json` at the end of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageTotals {
    pub calls: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, counts: UsageCounts) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.prompt_tokens
            .fetch_add(counts.prompt_tokens, Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(counts.completion_tokens, Ordering::Relaxed);
        self.total_tokens
            .fetch_add(counts.total_tokens, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> UsageTotals {
        UsageTotals {
            calls: self.calls.load(Ordering::Relaxed),
            prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: self.completion_tokens.load(Ordering::Relaxed),
            total_tokens: self.total_tokens.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_accumulate() {
        let ledger = UsageLedger::new();
        ledger.record(UsageCounts {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        });
        ledger.record(UsageCounts {
            prompt_tokens: 1,
            completion_tokens: 2,
            total_tokens: 3,
        });
        let totals = ledger.snapshot();
        assert_eq!(totals.calls, 2);
        assert_eq!(totals.prompt_tokens, 11);
        assert_eq!(totals.completion_tokens, 7);
        assert_eq!(totals.total_tokens, 18);
    }

    #[test]
    fn concurrent_writers_do_not_lose_counts() {
        let ledger = UsageLedger::new();
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        ledger.record(UsageCounts {
                            prompt_tokens: 1,
                            completion_tokens: 1,
                            total_tokens: 2,
                        });
                    }
                });
            }
        });
        let totals = ledger.snapshot();
        assert_eq!(totals.calls, 800);
        assert_eq!(totals.total_tokens, 1600);
    }
}

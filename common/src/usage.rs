use std::ops::AddAssign;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Token/request accounting for a single LLM or embedding call, or a running
/// total. Mirrors the accumulator pattern used by the knowledge-base builder
/// this system is modeled on, which threads a usage object through every
/// generative and embedding call and sums it per item, per source, and
/// globally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageTotals {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl UsageTotals {
    pub fn generative(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            requests: 1,
            input_tokens,
            output_tokens,
        }
    }

    pub fn embedding(input_tokens: u64) -> Self {
        Self {
            requests: 1,
            input_tokens,
            output_tokens: 0,
        }
    }
}

impl AddAssign for UsageTotals {
    fn add_assign(&mut self, rhs: Self) {
        self.requests += rhs.requests;
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
    }
}

/// Process-wide generative and embedding usage counters. Never hold the
/// inner mutex across an `.await` on an LLM or embedding call -- acquire it
/// only to add the totals once the call returns.
#[derive(Clone, Default)]
pub struct UsageAccumulator {
    generative: Arc<Mutex<UsageTotals>>,
    embedding: Arc<Mutex<UsageTotals>>,
}

impl UsageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_generative(&self, totals: UsageTotals) {
        let mut guard = self.generative.lock().await;
        *guard += totals;
    }

    pub async fn record_embedding(&self, totals: UsageTotals) {
        let mut guard = self.embedding.lock().await;
        *guard += totals;
    }

    pub async fn total_generative(&self) -> UsageTotals {
        *self.generative.lock().await
    }

    pub async fn total_embedding(&self) -> UsageTotals {
        *self.embedding.lock().await
    }
}

//! Sliding-window provider health

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// When a provider counts as unhealthy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthPolicy {
    /// Number of recent outcomes kept
    pub window: usize,
    /// Outcomes required before the rate is trusted
    pub min_samples: usize,
    /// Success rate below which the provider is skipped
    pub min_success_rate: f64,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            window: 20,
            min_samples: 5,
            min_success_rate: 0.0,
        }
    }
}

/// Last N call outcomes of one provider
#[derive(Debug, Clone)]
pub struct HealthWindow {
    capacity: usize,
    outcomes: VecDeque<bool>,
}

impl HealthWindow {
    /// Empty window keeping `capacity` outcomes
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            outcomes: VecDeque::with_capacity(capacity),
        }
    }

    /// Record one outcome, evicting the oldest when full
    pub fn record(&mut self, success: bool) {
        if self.outcomes.len() == self.capacity {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(success);
    }

    /// Number of outcomes held
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// True when nothing has been recorded
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Fraction of successes, `None` when empty
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> Option<f64> {
        if self.outcomes.is_empty() {
            return None;
        }
        let ok = self.outcomes.iter().filter(|s| **s).count();
        Some(ok as f64 / self.outcomes.len() as f64)
    }

    /// Healthy unless enough samples show a rate below the policy minimum
    #[must_use]
    pub fn is_healthy(&self, policy: &HealthPolicy) -> bool {
        if self.outcomes.len() < policy.min_samples.max(1) {
            return true;
        }
        self.success_rate()
            .map_or(true, |rate| rate >= policy.min_success_rate)
    }
}

// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Token and cost budget tracking.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::config::BudgetConfig;

use super::types::TokenUsage;

/// USD per 1K input and output tokens for known models.
const MODEL_PRICE_PER_1K: &[(&str, f64, f64)] = &[("o3", 0.010, 0.030), ("o4-mini", 0.003, 0.012)];

/// Price used for models not in the table.
const DEFAULT_PRICE_PER_1K: (f64, f64) = (0.004, 0.012);

/// Why a worker may not start.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BudgetError {
    #[error("max_total_tokens exceeded ({used} >= {limit})")]
    TotalTokens { used: u64, limit: u64 },

    #[error("max_total_cost exceeded (${used:.4} >= ${limit:.4})")]
    TotalCost { used: f64, limit: f64 },

    #[error("max_worker_cost exceeded for {worker_id} (${used:.4} >= ${limit:.4})")]
    WorkerCost {
        worker_id: String,
        used: f64,
        limit: f64,
    },
}

/// Point-in-time view of spending.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    /// Set once spending crosses the warning threshold.
    pub warned: bool,
}

/// Result of recording usage.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetUpdate {
    pub cost: f64,
    pub snapshot: BudgetSnapshot,
    /// True only for the update that first crossed the warning threshold.
    pub crossed_warning: bool,
}

#[derive(Debug, Default)]
struct BudgetState {
    total_input_tokens: u64,
    total_output_tokens: u64,
    total_cost: f64,
    warned: bool,
    worker_costs: HashMap<String, f64>,
}

/// Shared budget for one session. A zero limit disables that check.
#[derive(Debug)]
pub struct BudgetTracker {
    config: BudgetConfig,
    state: Mutex<BudgetState>,
}

impl BudgetTracker {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BudgetState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BudgetState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Rough usage for workers that report none: ~4 characters per output token.
    pub fn estimate_usage_from_text(text: &str) -> TokenUsage {
        TokenUsage {
            input_tokens: 0,
            cached_input_tokens: 0,
            output_tokens: (text.len() / 4).max(1) as u64,
        }
    }

    /// Price per 1K input/output tokens for a model.
    pub fn price_for(model: Option<&str>) -> (f64, f64) {
        model
            .and_then(|m| {
                MODEL_PRICE_PER_1K
                    .iter()
                    .find(|(name, _, _)| name.eq_ignore_ascii_case(m.trim()))
            })
            .map(|(_, input, output)| (*input, *output))
            .unwrap_or(DEFAULT_PRICE_PER_1K)
    }

    /// Cost of `usage` in USD. Cached input tokens are not billed.
    pub fn estimate_cost(model: Option<&str>, usage: &TokenUsage) -> f64 {
        let (input_price, output_price) = Self::price_for(model);
        let billable_input = usage.input_tokens.saturating_sub(usage.cached_input_tokens);
        (billable_input as f64 / 1000.0) * input_price
            + (usage.output_tokens as f64 / 1000.0) * output_price
    }

    /// Record usage for a worker.
    pub fn add_usage(&self, usage: &TokenUsage, model: Option<&str>, worker_id: &str) -> BudgetUpdate {
        let cost = Self::estimate_cost(model, usage);
        let mut state = self.state();

        state.total_input_tokens += usage.input_tokens;
        state.total_output_tokens += usage.output_tokens;
        state.total_cost += cost;
        *state.worker_costs.entry(worker_id.to_string()).or_insert(0.0) += cost;

        let mut crossed_warning = false;
        if !state.warned && self.config.max_total_cost > 0.0 {
            let percent = state.total_cost / self.config.max_total_cost * 100.0;
            if percent >= f64::from(self.config.warn_at_percent) {
                state.warned = true;
                crossed_warning = true;
            }
        }

        BudgetUpdate {
            cost,
            snapshot: snapshot_of(&state),
            crossed_warning,
        }
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        snapshot_of(&self.state())
    }

    /// Whether the session may start another worker.
    pub fn can_spawn(&self) -> Result<(), BudgetError> {
        let state = self.state();
        let used = state.total_input_tokens + state.total_output_tokens;
        if self.config.max_total_tokens > 0 && used >= self.config.max_total_tokens {
            return Err(BudgetError::TotalTokens {
                used,
                limit: self.config.max_total_tokens,
            });
        }
        if self.config.max_total_cost > 0.0 && state.total_cost >= self.config.max_total_cost {
            return Err(BudgetError::TotalCost {
                used: state.total_cost,
                limit: self.config.max_total_cost,
            });
        }
        Ok(())
    }

    /// Whether a worker has stayed under the per-worker cost cap.
    pub fn worker_within_budget(&self, worker_id: &str) -> Result<(), BudgetError> {
        let state = self.state();
        let used = state.worker_costs.get(worker_id).copied().unwrap_or(0.0);
        if self.config.max_worker_cost > 0.0 && used >= self.config.max_worker_cost {
            return Err(BudgetError::WorkerCost {
                worker_id: worker_id.to_string(),
                used,
                limit: self.config.max_worker_cost,
            });
        }
        Ok(())
    }
}

fn snapshot_of(state: &BudgetState) -> BudgetSnapshot {
    BudgetSnapshot {
        total_input_tokens: state.total_input_tokens,
        total_output_tokens: state.total_output_tokens,
        total_tokens: state.total_input_tokens + state.total_output_tokens,
        total_cost: (state.total_cost * 1_000_000.0).round() / 1_000_000.0,
        warned: state.warned,
    }
}

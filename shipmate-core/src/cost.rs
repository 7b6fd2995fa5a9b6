//! Cost accounting — per-call provider cost recording with budgets and
//! optimization heuristics.
//!
//! Every skill that invokes a paid provider records here. Entries live in a
//! bounded ring (oldest evicted); pricing comes from the configured rate
//! table, never from logic.

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use crate::config::{CostConfig, CostRate};
use crate::types::TaskType;

/// One recorded provider call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostEntry {
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// USD, computed from the rate table at record time.
    pub estimated_cost: f64,
    pub task_type: TaskType,
}

/// Summary period for cost queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostPeriod {
    CurrentMonth,
    LastDays(u32),
}

/// Aggregated cost summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostSummary {
    pub total: f64,
    pub entry_count: usize,
    /// provider -> total USD.
    pub by_provider: BTreeMap<String, f64>,
    /// "provider/model/task_type" -> total USD.
    pub by_breakdown: BTreeMap<String, f64>,
}

/// Budget standing for the current month.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub budget: f64,
    pub spent: f64,
    pub remaining: f64,
    /// Linear projection of month-end spend from the month so far.
    pub projected_month_end: f64,
    pub over_budget: bool,
}

/// A single optimization suggestion from the static rule set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationSuggestion {
    pub rule: String,
    pub message: String,
    /// Rough USD the rule estimates could be saved per month.
    pub estimated_savings: f64,
}

#[derive(Debug)]
struct CostInner {
    entries: VecDeque<CostEntry>,
    budget: Option<f64>,
}

/// Ring-buffered cost tracker.
#[derive(Debug)]
pub struct CostTracker {
    inner: Mutex<CostInner>,
    rates: BTreeMap<String, CostRate>,
    free_providers: Vec<String>,
    capacity: usize,
}

impl CostTracker {
    pub fn new(config: &CostConfig) -> Self {
        Self {
            inner: Mutex::new(CostInner {
                entries: VecDeque::new(),
                budget: config.monthly_budget,
            }),
            rates: config.rates.clone(),
            free_providers: config.free_providers.clone(),
            capacity: config.ring_capacity.max(1),
        }
    }

    /// Record a provider call. Returns the estimated cost in USD.
    ///
    /// Models absent from the rate table record at zero; the call is still
    /// retained so usage patterns stay visible.
    pub fn record(
        &self,
        provider: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        task_type: TaskType,
    ) -> f64 {
        let cost = self.price(provider, model, input_tokens, output_tokens);
        let entry = CostEntry {
            timestamp: Utc::now(),
            provider: provider.to_string(),
            model: model.to_string(),
            input_tokens,
            output_tokens,
            estimated_cost: cost,
            task_type,
        };
        let mut inner = self.inner.lock().expect("cost lock poisoned");
        if inner.entries.len() == self.capacity {
            inner.entries.pop_front();
        }
        inner.entries.push_back(entry);
        cost
    }

    fn price(&self, provider: &str, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let key = format!("{provider}/{model}");
        match self.rates.get(&key) {
            Some(rate) => {
                (input_tokens as f64 / 1_000_000.0) * rate.input_per_million
                    + (output_tokens as f64 / 1_000_000.0) * rate.output_per_million
            }
            None => {
                tracing::debug!(key, "no rate configured, recording at zero cost");
                0.0
            }
        }
    }

    /// Aggregate retained entries within the period.
    pub fn summary(&self, period: CostPeriod) -> CostSummary {
        let cutoff = period_start(period, Utc::now());
        let inner = self.inner.lock().expect("cost lock poisoned");

        let mut total = 0.0;
        let mut entry_count = 0;
        let mut by_provider: BTreeMap<String, f64> = BTreeMap::new();
        let mut by_breakdown: BTreeMap<String, f64> = BTreeMap::new();

        for entry in inner.entries.iter().filter(|e| e.timestamp >= cutoff) {
            total += entry.estimated_cost;
            entry_count += 1;
            *by_provider.entry(entry.provider.clone()).or_default() += entry.estimated_cost;
            let key = format!(
                "{}/{}/{}",
                entry.provider,
                entry.model,
                entry.task_type.as_str()
            );
            *by_breakdown.entry(key).or_default() += entry.estimated_cost;
        }

        CostSummary {
            total,
            entry_count,
            by_provider,
            by_breakdown,
        }
    }

    /// Set (or clear) the monthly budget.
    pub fn set_budget(&self, amount: Option<f64>) {
        self.inner.lock().expect("cost lock poisoned").budget = amount;
    }

    /// Budget standing for the current month, if a budget is set.
    pub fn budget_status(&self) -> Option<BudgetStatus> {
        let budget = self.inner.lock().expect("cost lock poisoned").budget?;
        let now = Utc::now();
        let spent = self.summary(CostPeriod::CurrentMonth).total;

        let elapsed_days = now.day() as f64;
        let days_in_month = days_in_month(now) as f64;
        let projected = if elapsed_days > 0.0 {
            spent / elapsed_days * days_in_month
        } else {
            spent
        };

        Some(BudgetStatus {
            budget,
            spent,
            remaining: budget - spent,
            projected_month_end: projected,
            over_budget: spent > budget,
        })
    }

    /// Static optimization rule set over the retained log.
    ///
    /// `cache_hit_rate` is the router's cache hit rate in [0,1], supplied by
    /// the caller so this component never reaches across ownership lines.
    pub fn optimization_suggestions(
        &self,
        cache_hit_rate: Option<f64>,
    ) -> Vec<OptimizationSuggestion> {
        let inner = self.inner.lock().expect("cost lock poisoned");
        let mut suggestions = Vec::new();

        // Rule 1: paid provider spent on trivial tasks.
        let trivial_paid: f64 = inner
            .entries
            .iter()
            .filter(|e| e.task_type.is_trivial() && e.estimated_cost > 0.0)
            .map(|e| e.estimated_cost)
            .sum();
        if trivial_paid > 0.0 {
            suggestions.push(OptimizationSuggestion {
                rule: "trivial-on-paid".into(),
                message: format!(
                    "${trivial_paid:.4} spent on greetings/chitchat/simple tasks; route these to the free tier"
                ),
                estimated_savings: trivial_paid,
            });
        }

        // Rule 2: premium model where a cheaper sibling exists. A model is
        // premium when a same-provider model costs less than half as much.
        let mut premium_spend: f64 = 0.0;
        for entry in inner.entries.iter().filter(|e| e.estimated_cost > 0.0) {
            let key = format!("{}/{}", entry.provider, entry.model);
            let Some(rate) = self.rates.get(&key) else {
                continue;
            };
            let has_cheaper = self.rates.iter().any(|(k, r)| {
                k.starts_with(&format!("{}/", entry.provider))
                    && *k != key
                    && r.input_per_million < rate.input_per_million / 2.0
            });
            if has_cheaper && !matches!(entry.task_type, TaskType::Chat) {
                premium_spend += entry.estimated_cost;
            }
        }
        if premium_spend > 0.0 {
            suggestions.push(OptimizationSuggestion {
                rule: "premium-model".into(),
                message: format!(
                    "${premium_spend:.4} of non-chat work ran on premium models; a cheaper model in the same family would suffice"
                ),
                estimated_savings: premium_spend * 0.7,
            });
        }

        // Rule 3: low classifier cache utilization.
        if let Some(rate) = cache_hit_rate {
            if rate < 0.2 && !inner.entries.is_empty() {
                suggestions.push(OptimizationSuggestion {
                    rule: "low-cache-utilization".into(),
                    message: format!(
                        "classifier cache hit rate is {:.0}%; raise the cache TTL or size",
                        rate * 100.0
                    ),
                    estimated_savings: 0.0,
                });
            }
        }

        // Rule 4: free provider under-utilized.
        let total_calls = inner.entries.len();
        if total_calls >= 10 {
            let free_calls = inner
                .entries
                .iter()
                .filter(|e| self.free_providers.contains(&e.provider))
                .count();
            let free_share = free_calls as f64 / total_calls as f64;
            if free_share < 0.25 {
                suggestions.push(OptimizationSuggestion {
                    rule: "free-tier-underused".into(),
                    message: format!(
                        "only {:.0}% of calls used the free tier ({})",
                        free_share * 100.0,
                        self.free_providers.join(", ")
                    ),
                    estimated_savings: 0.0,
                });
            }
        }

        suggestions
    }

    /// Number of retained entries.
    pub fn entry_count(&self) -> usize {
        self.inner.lock().expect("cost lock poisoned").entries.len()
    }

    /// All retained entries, oldest first. For reports.
    pub fn entries(&self) -> Vec<CostEntry> {
        self.inner
            .lock()
            .expect("cost lock poisoned")
            .entries
            .iter()
            .cloned()
            .collect()
    }
}

fn period_start(period: CostPeriod, now: DateTime<Utc>) -> DateTime<Utc> {
    match period {
        CostPeriod::CurrentMonth => now
            .date_naive()
            .with_day(1)
            .expect("day 1 always valid")
            .and_hms_opt(0, 0, 0)
            .expect("midnight always valid")
            .and_utc(),
        CostPeriod::LastDays(n) => now - Duration::days(n as i64),
    }
}

fn days_in_month(now: DateTime<Utc>) -> u32 {
    let (year, month) = (now.year(), now.month());
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    chrono::NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .expect("first of month always valid")
        .signed_duration_since(
            chrono::NaiveDate::from_ymd_opt(year, month, 1).expect("first of month always valid"),
        )
        .num_days() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> CostTracker {
        CostTracker::new(&CostConfig::default())
    }

    #[test]
    fn test_record_prices_from_rate_table() {
        let t = tracker();
        let cost = t.record(
            "anthropic",
            "claude-sonnet-4-20250514",
            1_000_000,
            1_000_000,
            TaskType::Chat,
        );
        assert!((cost - 18.0).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_model_records_at_zero() {
        let t = tracker();
        let cost = t.record("acme", "frontier-1", 500, 500, TaskType::Chat);
        assert_eq!(cost, 0.0);
        assert_eq!(t.entry_count(), 1);
    }

    #[test]
    fn test_summary_total_matches_retained_entries() {
        let mut config = CostConfig::default();
        config.ring_capacity = 5;
        let t = CostTracker::new(&config);

        for _ in 0..8 {
            t.record(
                "anthropic",
                "claude-3-5-haiku-20241022",
                1_000_000,
                0,
                TaskType::Chat,
            );
        }
        // Ring holds 5 entries at $0.8 input each.
        assert_eq!(t.entry_count(), 5);
        let summary = t.summary(CostPeriod::CurrentMonth);
        assert!((summary.total - 4.0).abs() < 1e-9);
        assert_eq!(summary.entry_count, 5);
        assert!((summary.by_provider["anthropic"] - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_breakdown_keys() {
        let t = tracker();
        t.record(
            "anthropic",
            "claude-3-5-haiku-20241022",
            1_000_000,
            0,
            TaskType::Classification,
        );
        let summary = t.summary(CostPeriod::LastDays(1));
        assert!(summary
            .by_breakdown
            .contains_key("anthropic/claude-3-5-haiku-20241022/classification"));
    }

    #[test]
    fn test_budget_status() {
        let t = tracker();
        t.set_budget(Some(10.0));
        t.record(
            "anthropic",
            "claude-sonnet-4-20250514",
            1_000_000,
            1_000_000,
            TaskType::Chat,
        );
        let status = t.budget_status().unwrap();
        assert!((status.spent - 18.0).abs() < 1e-9);
        assert!(status.over_budget);
        assert!(status.remaining < 0.0);
        assert!(status.projected_month_end >= status.spent);
    }

    #[test]
    fn test_no_budget_no_status() {
        let t = tracker();
        assert!(t.budget_status().is_none());
    }

    #[test]
    fn test_suggestion_trivial_on_paid() {
        let t = tracker();
        t.record(
            "anthropic",
            "claude-3-5-haiku-20241022",
            100_000,
            10_000,
            TaskType::Greeting,
        );
        let suggestions = t.optimization_suggestions(None);
        assert!(suggestions.iter().any(|s| s.rule == "trivial-on-paid"));
    }

    #[test]
    fn test_suggestion_low_cache() {
        let t = tracker();
        t.record("groq", "llama-3.3-70b-versatile", 100, 100, TaskType::Chat);
        let suggestions = t.optimization_suggestions(Some(0.05));
        assert!(suggestions
            .iter()
            .any(|s| s.rule == "low-cache-utilization"));
    }

    #[test]
    fn test_suggestion_free_tier_underused() {
        let t = tracker();
        for _ in 0..12 {
            t.record(
                "anthropic",
                "claude-3-5-haiku-20241022",
                1_000,
                1_000,
                TaskType::Chat,
            );
        }
        let suggestions = t.optimization_suggestions(None);
        assert!(suggestions.iter().any(|s| s.rule == "free-tier-underused"));
    }

    #[test]
    fn test_days_in_month() {
        let feb = chrono::NaiveDate::from_ymd_opt(2024, 2, 15)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
            .and_utc();
        assert_eq!(days_in_month(feb), 29);
        let jan = chrono::NaiveDate::from_ymd_opt(2025, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc();
        assert_eq!(days_in_month(jan), 31);
    }
}

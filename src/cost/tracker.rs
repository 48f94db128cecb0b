//! Pre-flight budget checks and post-flight usage recording.
//!
//! Dual-store semantics: the rusqlite ledger is authoritative, the key-value
//! counters are a derived materialized view with a 1-hour TTL that self-heals
//! by re-summing the ledger on miss.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::error::{Error, Result};
use crate::llm::ModelSpec;
use crate::prompt::PromptType;
use crate::store::{usage_key, KeyValueStore};

use super::ledger::{OperationCost, UsageLedger, UsageRecord, UsageSummary};

/// Counter cache entries live one hour before re-deriving from the ledger.
const COUNTER_TTL: Duration = Duration::from_secs(3600);

/// Single-tier spending limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BudgetLimits {
    pub per_document: f64,
    pub per_user_per_day: f64,
    pub per_user_per_month: f64,
    /// Fraction of the daily limit at which callers should warn users.
    pub daily_warning_threshold: f64,
    /// Fraction of the monthly limit at which callers should warn users.
    pub monthly_warning_threshold: f64,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            per_document: 5.0,
            per_user_per_day: 10.0,
            per_user_per_month: 50.0,
            daily_warning_threshold: 0.80,
            monthly_warning_threshold: 0.90,
        }
    }
}

/// Why a budget check denied the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DenialReason {
    DocumentLimitExceeded,
    DailyLimitExceeded,
    MonthlyLimitExceeded,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DocumentLimitExceeded => "document-limit-exceeded",
            Self::DailyLimitExceeded => "daily-limit-exceeded",
            Self::MonthlyLimitExceeded => "monthly-limit-exceeded",
        }
    }
}

/// Spend observed for the current windows, plus warning flags so callers can
/// surface upgrade prompts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CurrentUsage {
    pub today: f64,
    pub this_month: f64,
    pub approaching_daily_limit: bool,
    pub approaching_monthly_limit: bool,
}

/// Request for a pre-flight budget check.
#[derive(Debug, Clone, Default)]
pub struct BudgetCheckRequest {
    pub user_id: Option<String>,
    pub operation: Option<PromptType>,
    pub document_id: Option<String>,
    pub estimated_cost: Option<f64>,
}

/// Outcome of a pre-flight budget check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetDecision {
    pub allowed: bool,
    pub reason: Option<DenialReason>,
    pub estimated_cost: f64,
    pub current_usage: CurrentUsage,
    pub reset_at: Option<DateTime<Utc>>,
}

/// Aggregation window for summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageWindow {
    Day,
    Month,
}

/// Budget enforcement plus the usage ledger/counter dual write.
pub struct CostTracker {
    ledger: Arc<UsageLedger>,
    store: Arc<dyn KeyValueStore>,
    limits: BudgetLimits,
}

impl CostTracker {
    pub fn new(ledger: Arc<UsageLedger>, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            ledger,
            store,
            limits: BudgetLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: BudgetLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits(&self) -> &BudgetLimits {
        &self.limits
    }

    /// Cost in USD for the given token counts on a known model.
    pub fn calculate_cost(&self, input_tokens: u64, output_tokens: u64, model: &str) -> Result<f64> {
        let spec =
            ModelSpec::by_id(model).ok_or_else(|| Error::CostCalculation(model.to_string()))?;
        Ok(spec.calculate_cost(input_tokens, output_tokens))
    }

    /// Decide whether an operation's estimated cost fits inside every limit.
    ///
    /// Exactly at a limit is allowed; exceeding by any positive amount is
    /// denied. Counter or ledger failures fail closed.
    pub async fn check_budget(&self, request: &BudgetCheckRequest) -> Result<BudgetDecision> {
        let estimated_cost = request
            .estimated_cost
            .unwrap_or_else(|| default_estimate(request.operation));

        let now = Utc::now();
        let today = self.window_total(request.user_id.as_deref(), now, UsageWindow::Day).await?;
        let this_month = self
            .window_total(request.user_id.as_deref(), now, UsageWindow::Month)
            .await?;

        let current_usage = CurrentUsage {
            today,
            this_month,
            approaching_daily_limit: today
                >= self.limits.per_user_per_day * self.limits.daily_warning_threshold,
            approaching_monthly_limit: this_month
                >= self.limits.per_user_per_month * self.limits.monthly_warning_threshold,
        };

        let denial = if estimated_cost > self.limits.per_document {
            Some((DenialReason::DocumentLimitExceeded, None))
        } else if today + estimated_cost > self.limits.per_user_per_day {
            Some((DenialReason::DailyLimitExceeded, Some(next_midnight(now))))
        } else if this_month + estimated_cost > self.limits.per_user_per_month {
            Some((DenialReason::MonthlyLimitExceeded, Some(next_month(now))))
        } else {
            None
        };

        match denial {
            Some((reason, reset_at)) => Ok(BudgetDecision {
                allowed: false,
                reason: Some(reason),
                estimated_cost,
                current_usage,
                reset_at,
            }),
            None => Ok(BudgetDecision {
                allowed: true,
                reason: None,
                estimated_cost,
                current_usage,
                reset_at: None,
            }),
        }
    }

    /// Record actual spend: append to the ledger, then bump both window
    /// counters. A ledger failure surfaces; counter failures are logged and
    /// swallowed since the ledger is the source of truth.
    pub async fn record_usage(&self, record: &UsageRecord) -> Result<()> {
        self.ledger.append(record)?;

        if record.cost > 0.0 {
            let user = counter_user(record.user_id.as_deref());
            for window in [UsageWindow::Day, UsageWindow::Month] {
                let key = usage_key(&user, &window_label(record.timestamp, window));
                if let Err(e) = self.store.incr_by_float(&key, record.cost).await {
                    warn!(key, error = %e, "failed to bump usage counter");
                    continue;
                }
                if let Err(e) = self.store.expire(&key, COUNTER_TTL).await {
                    warn!(key, error = %e, "failed to refresh usage counter TTL");
                }
            }
        }
        Ok(())
    }

    /// Read-only per-user aggregation over the ledger.
    pub fn user_summary(&self, user_id: Option<&str>, window: UsageWindow) -> Result<UsageSummary> {
        let (start, end) = window_bounds(Utc::now(), window);
        self.ledger.summary(user_id, start, end)
    }

    /// Read-only per-operation cost shares over the ledger.
    pub fn cost_breakdown(
        &self,
        user_id: Option<&str>,
        window: UsageWindow,
    ) -> Result<Vec<OperationCost>> {
        let (start, end) = window_bounds(Utc::now(), window);
        self.ledger.breakdown(user_id, start, end)
    }

    /// Counter value for a window, reconstructing from the ledger on miss.
    async fn window_total(
        &self,
        user_id: Option<&str>,
        now: DateTime<Utc>,
        window: UsageWindow,
    ) -> Result<f64> {
        let key = usage_key(&counter_user(user_id), &window_label(now, window));

        match self
            .store
            .get(&key)
            .await
            .map_err(|e| Error::CostTracking(e.to_string()))?
        {
            Some(raw) => raw
                .parse::<f64>()
                .map_err(|_| Error::CostTracking(format!("counter {key} is not a float"))),
            None => {
                let (start, end) = window_bounds(now, window);
                let total = self.ledger.sum_cost(user_id, start, end)?;
                if let Err(e) = self
                    .store
                    .set_ex(&key, &total.to_string(), COUNTER_TTL)
                    .await
                {
                    warn!(key, error = %e, "failed to repopulate usage counter");
                }
                Ok(total)
            }
        }
    }
}

fn counter_user(user_id: Option<&str>) -> String {
    user_id.unwrap_or("anonymous").to_string()
}

fn window_label(at: DateTime<Utc>, window: UsageWindow) -> String {
    match window {
        UsageWindow::Day => at.format("%Y-%m-%d").to_string(),
        UsageWindow::Month => at.format("%Y-%m").to_string(),
    }
}

fn window_bounds(now: DateTime<Utc>, window: UsageWindow) -> (DateTime<Utc>, DateTime<Utc>) {
    match window {
        UsageWindow::Day => {
            let start = Utc
                .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
                .unwrap();
            (start, start + ChronoDuration::days(1))
        }
        UsageWindow::Month => {
            let start = Utc
                .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
                .unwrap();
            (start, next_month(now))
        }
    }
}

fn next_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let start = Utc
        .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
        .unwrap();
    start + ChronoDuration::days(1)
}

fn next_month(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).unwrap()
}

/// Conservative pre-flight floor when no estimate was supplied: operations
/// routed to Sonnet cost more than Haiku-routed ones.
fn default_estimate(operation: Option<PromptType>) -> f64 {
    match operation {
        Some(PromptType::ImageDescription) => 0.10,
        _ => 0.02,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    fn tracker() -> CostTracker {
        CostTracker::new(
            Arc::new(UsageLedger::in_memory().unwrap()),
            Arc::new(MemoryStore::new()),
        )
    }

    fn check_for(user: &str, estimated: f64) -> BudgetCheckRequest {
        BudgetCheckRequest {
            user_id: Some(user.to_string()),
            operation: Some(PromptType::GraphGeneration),
            document_id: None,
            estimated_cost: Some(estimated),
        }
    }

    async fn seed_counter(tracker: &CostTracker, user: &str, amount: f64) {
        let now = Utc::now();
        for window in [UsageWindow::Day, UsageWindow::Month] {
            let key = usage_key(user, &window_label(now, window));
            tracker.store.incr_by_float(&key, amount).await.unwrap();
        }
    }

    #[test]
    fn test_calculate_cost_per_model() {
        let t = tracker();
        // 1M input on haiku = $0.25; 1M output = $1.25
        let cost = t.calculate_cost(1_000_000, 1_000_000, "claude-haiku").unwrap();
        assert!((cost - 1.50).abs() < 1e-9);

        let err = t.calculate_cost(10, 10, "claude-opus").unwrap_err();
        assert_eq!(err.code(), "COST_CALCULATION_ERROR");
    }

    #[tokio::test]
    async fn test_budget_block_daily_limit() {
        let t = tracker();
        seed_counter(&t, "u1", 9.50).await;

        let decision = t.check_budget(&check_for("u1", 0.58)).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(DenialReason::DailyLimitExceeded));
        assert!((decision.current_usage.today - 9.50).abs() < 1e-9);
        assert!(decision.reset_at.is_some());
        assert!(decision.current_usage.approaching_daily_limit);
    }

    #[tokio::test]
    async fn test_budget_exactly_at_limit_allowed() {
        let t = tracker();
        seed_counter(&t, "u1", 9.50).await;

        let decision = t.check_budget(&check_for("u1", 0.50)).await.unwrap();
        assert!(decision.allowed, "exactly at the limit must pass");

        let decision = t.check_budget(&check_for("u1", 0.500001)).await.unwrap();
        assert!(!decision.allowed, "any positive epsilon over must deny");
    }

    #[tokio::test]
    async fn test_document_limit_denies_regardless_of_counters() {
        let t = tracker();
        let decision = t.check_budget(&check_for("u1", 5.01)).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(DenialReason::DocumentLimitExceeded));
        assert!(decision.reset_at.is_none());
    }

    #[tokio::test]
    async fn test_counter_reconstructed_from_ledger_on_miss() {
        let t = tracker();
        let mut record = UsageRecord::new("graph-generation", "claude-haiku");
        record.user_id = Some("u1".to_string());
        record.cost = 3.25;
        t.ledger.append(&record).unwrap();

        let decision = t.check_budget(&check_for("u1", 0.10)).await.unwrap();
        assert!((decision.current_usage.today - 3.25).abs() < 1e-9);

        // The reconstruction must have repopulated the counter.
        let key = usage_key("u1", &window_label(Utc::now(), UsageWindow::Day));
        assert_eq!(t.store.get(&key).await.unwrap(), Some("3.25".to_string()));
    }

    #[tokio::test]
    async fn test_record_usage_dual_write() {
        let t = tracker();
        // Populate counters first, as a budget check would.
        let _ = t.check_budget(&check_for("u1", 0.01)).await.unwrap();

        let mut record = UsageRecord::new("graph-generation", "claude-haiku");
        record.user_id = Some("u1".to_string());
        record.cost = 0.42;
        t.record_usage(&record).await.unwrap();

        assert_eq!(t.ledger.count().unwrap(), 1);
        let decision = t.check_budget(&check_for("u1", 0.01)).await.unwrap();
        assert!((decision.current_usage.today - 0.42).abs() < 1e-9);
        assert!((decision.current_usage.this_month - 0.42).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_default_estimate_floors() {
        let t = tracker();
        let decision = t
            .check_budget(&BudgetCheckRequest {
                user_id: Some("u1".into()),
                operation: Some(PromptType::ImageDescription),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!((decision.estimated_cost - 0.10).abs() < 1e-9);

        let decision = t
            .check_budget(&BudgetCheckRequest {
                user_id: Some("u1".into()),
                operation: Some(PromptType::QuizGeneration),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!((decision.estimated_cost - 0.02).abs() < 1e-9);
    }

    #[test]
    fn test_window_bounds_utc() {
        let at = Utc.with_ymd_and_hms(2026, 12, 15, 13, 45, 0).unwrap();
        let (start, end) = window_bounds(at, UsageWindow::Day);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 12, 15, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 12, 16, 0, 0, 0).unwrap());

        let (start, end) = window_bounds(at, UsageWindow::Month);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap());
    }
}

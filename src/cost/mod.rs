//! Cost tracking: pre-flight budget checks and the usage ledger.
//!
//! The ledger (`ai_usage` table) is authoritative; fast per-user counters in
//! the key-value store are a TTL-bounded derived view used to keep budget
//! checks off the database in the hot path.

mod ledger;
mod tracker;

pub use ledger::{OperationCost, UsageLedger, UsageRecord, UsageSummary};
pub use tracker::{
    BudgetCheckRequest, BudgetDecision, BudgetLimits, CostTracker, CurrentUsage, DenialReason,
    UsageWindow,
};

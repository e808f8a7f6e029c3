pub mod budget;
pub mod rate;

pub use budget::{BudgetEvent, BudgetEventKind, BudgetManager, Usage, UsageRecord};
pub use rate::{RateDecision, RateLimiter};

//! 风险预算与熔断安全层
//!
//! 任何会产生资金敞口的处理器在执行前都必须通过 [`RiskGuard`]：
//! 周期预算冻结或交易对熔断打开时，返回结构化的拒绝结果，
//! 由执行器记录为不可重试的失败。

pub mod budget;
pub mod circuit_breaker;
pub mod guard;

pub use budget::RiskBudgetManager;
pub use circuit_breaker::CircuitBreakerRegistry;
pub use guard::{RiskGuard, SafetyDecision, TradeRequest};

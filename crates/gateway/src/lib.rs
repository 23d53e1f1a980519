//! 多端点网关
//!
//! 按策略在多个后端端点（AI 服务商、行情数据源）之间选择，
//! 叠加每端点令牌桶限流、失败重试与指数退避，并把每次调用结果
//! 写回端点的滚动统计，由统计推导端点健康状态。

pub mod gateway;
pub mod rate_limiter;
pub mod registry;
pub mod strategies;

pub use gateway::EndpointGateway;
pub use rate_limiter::EndpointRateLimiter;
pub use registry::{EndpointHealth, EndpointRegistry, EndpointSnapshot, HealthSettings};
pub use strategies::SelectionStrategy;

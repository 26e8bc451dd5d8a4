//! 共享库
//!
//! 包含汇率换算 worker 使用的配置、错误处理、Redis 缓存、Kafka 消费等基础设施代码。

pub mod cache;
pub mod config;
pub mod error;
pub mod kafka;
pub mod observability;

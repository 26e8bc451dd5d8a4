//! 订单运费汇率换算 worker
//!
//! 消费 Kafka 中的订单生命周期事件，对新建订单的运费与总价做币种换算后写回订单库。
//! 汇率缓存在 Redis（带 TTL），由定时调度与冷启动自检两条路径刷新。
//! 消息按分区顺序串行处理，处理成功后才提交 offset（至少一次投递）。

pub mod consumer;
pub mod conversion;
pub mod error;
pub mod health;
pub mod models;
pub mod order_gateway;
pub mod rate_fetcher;
pub mod rate_manager;
pub mod rate_store;
pub mod scheduler;

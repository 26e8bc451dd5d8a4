//! 汇率缓存存储
//!
//! `RateStore` trait 抽象按币种存取汇率的能力，Redis 实现每个币种一个键（`rates:<CODE>`），
//! 值为 JSON 序列化的 `ExchangeRate`，写入时设置 TTL，过期淘汰交给 Redis。
//! 未命中是正常结果（`None` / 结果中缺失），不是错误。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use fx_shared::cache::{Cache, CacheKey};
use tracing::debug;

use crate::error::WorkerError;
use crate::models::ExchangeRate;

/// 汇率存储接口
///
/// 并发读写安全依赖后端单命令的原子性，调用方不持有任何锁。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RateStore: Send + Sync {
    /// 读取单个币种，未命中返回 `None`
    async fn get(&self, currency: &str) -> Result<Option<ExchangeRate>, WorkerError>;

    /// 写入单个币种（覆盖并重置 TTL）
    async fn set(&self, rate: &ExchangeRate) -> Result<(), WorkerError>;

    /// 批量写入，单次往返完成；跨键不保证原子性
    async fn set_multiple(&self, rates: &[ExchangeRate]) -> Result<(), WorkerError>;

    /// 批量读取，结果只包含命中的币种
    async fn get_multiple(
        &self,
        currencies: &[String],
    ) -> Result<HashMap<String, ExchangeRate>, WorkerError>;

    async fn exists(&self, currency: &str) -> Result<bool, WorkerError>;
}

/// 基于 Redis 的汇率存储
#[derive(Clone)]
pub struct RedisRateStore {
    cache: Cache,
    ttl: Duration,
}

impl RedisRateStore {
    pub fn new(cache: Cache, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[async_trait]
impl RateStore for RedisRateStore {
    async fn get(&self, currency: &str) -> Result<Option<ExchangeRate>, WorkerError> {
        let rate = self
            .cache
            .get::<ExchangeRate>(&CacheKey::exchange_rate(currency))
            .await?;
        Ok(rate)
    }

    async fn set(&self, rate: &ExchangeRate) -> Result<(), WorkerError> {
        self.cache
            .set(&CacheKey::exchange_rate(&rate.currency), rate, self.ttl)
            .await?;
        Ok(())
    }

    async fn set_multiple(&self, rates: &[ExchangeRate]) -> Result<(), WorkerError> {
        let entries: Vec<(String, &ExchangeRate)> = rates
            .iter()
            .map(|r| (CacheKey::exchange_rate(&r.currency), r))
            .collect();

        self.cache.set_many(&entries, self.ttl).await?;
        debug!(count = rates.len(), ttl_secs = self.ttl.as_secs(), "汇率已批量写入缓存");
        Ok(())
    }

    async fn get_multiple(
        &self,
        currencies: &[String],
    ) -> Result<HashMap<String, ExchangeRate>, WorkerError> {
        let keys: Vec<String> = currencies
            .iter()
            .map(|c| CacheKey::exchange_rate(c))
            .collect();

        let values = self.cache.get_many::<ExchangeRate>(&keys).await?;

        Ok(currencies
            .iter()
            .zip(values)
            .filter_map(|(currency, value)| value.map(|rate| (currency.clone(), rate)))
            .collect())
    }

    async fn exists(&self, currency: &str) -> Result<bool, WorkerError> {
        Ok(self
            .cache
            .exists(&CacheKey::exchange_rate(currency))
            .await?)
    }
}

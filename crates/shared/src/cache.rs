//! Redis 缓存管理模块
//!
//! 提供 Redis 连接管理和常用缓存操作封装。过期淘汰完全交给 Redis 的
//! `SET .. EX` 语义，这里不做任何主动清理。

use crate::config::RedisConfig;
use crate::error::{FxError, Result};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use serde::{Serialize, de::DeserializeOwned};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Redis 缓存客户端
#[derive(Clone)]
pub struct Cache {
    client: Client,
}

impl Cache {
    /// 创建 Redis 客户端
    pub fn new(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        info!("Redis client created");
        Ok(Self { client })
    }

    /// 获取连接
    async fn get_conn(&self) -> Result<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(FxError::from)
    }

    /// 健康检查
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.get_conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(FxError::from)
    }

    /// 获取值
    #[instrument(skip(self))]
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.get_conn().await?;
        let value: Option<String> = conn.get(key).await?;

        match value {
            Some(v) => {
                let parsed: T = serde_json::from_str(&v).map_err(|e| {
                    FxError::Serialization(format!("Cache deserialization error: {}", e))
                })?;
                Ok(Some(parsed))
            }
            None => Ok(None),
        }
    }

    /// 批量获取值（MGET）
    ///
    /// 返回结果与 `keys` 一一对应，缺失的键为 `None`。
    /// 无法反序列化的值按未命中处理，由下一次写入覆盖。
    #[instrument(skip(self))]
    pub async fn get_many<T: DeserializeOwned>(&self, keys: &[String]) -> Result<Vec<Option<T>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.get_conn().await?;
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await?;

        let parsed = keys
            .iter()
            .zip(values)
            .map(|(key, value)| {
                value.and_then(|v| match serde_json::from_str::<T>(&v) {
                    Ok(parsed) => Some(parsed),
                    Err(e) => {
                        warn!(key = %key, error = %e, "缓存值反序列化失败，按未命中处理");
                        None
                    }
                })
            })
            .collect();

        Ok(parsed)
    }

    /// 设置值
    #[instrument(skip(self, value))]
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let serialized = serde_json::to_string(value)
            .map_err(|e| FxError::Serialization(format!("Cache serialization error: {}", e)))?;

        let _: () = conn.set_ex(key, serialized, ttl.as_secs()).await?;
        Ok(())
    }

    /// 批量设置值，所有写入在一次 pipeline 往返中完成
    ///
    /// pipeline 不是 MULTI/EXEC 事务：中途失败可能只写入部分键。
    #[instrument(skip(self, entries), fields(count = entries.len()))]
    pub async fn set_many<T: Serialize>(
        &self,
        entries: &[(String, T)],
        ttl: Duration,
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        for (key, value) in entries {
            let serialized = serde_json::to_string(value).map_err(|e| {
                FxError::Serialization(format!("Cache serialization error: {}", e))
            })?;
            pipe.set_ex(key, serialized, ttl.as_secs()).ignore();
        }

        let mut conn = self.get_conn().await?;
        let _: () = pipe.query_async(&mut conn).await?;

        debug!(count = entries.len(), "批量写入缓存完成");
        Ok(())
    }

    /// 检查键是否存在
    pub async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.get_conn().await?;
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }
}

/// 缓存键生成器
pub struct CacheKey;

impl CacheKey {
    /// 单个货币的汇率，如 `rates:USD`
    pub fn exchange_rate(currency: &str) -> String {
        format!("rates:{}", currency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_generation() {
        assert_eq!(CacheKey::exchange_rate("USD"), "rates:USD");
        assert_eq!(CacheKey::exchange_rate("RUB"), "rates:RUB");
    }

    #[tokio::test]
    #[ignore] // 需要 Redis 连接
    async fn test_set_many_then_get_many() {
        let cache = Cache::new(&RedisConfig::default()).unwrap();
        let entries = vec![
            ("cache-test:a".to_string(), 1.5_f64),
            ("cache-test:b".to_string(), 2.5_f64),
        ];
        cache
            .set_many(&entries, Duration::from_secs(30))
            .await
            .unwrap();

        let keys = vec![
            "cache-test:a".to_string(),
            "cache-test:missing".to_string(),
            "cache-test:b".to_string(),
        ];
        let values: Vec<Option<f64>> = cache.get_many(&keys).await.unwrap();
        assert_eq!(values, vec![Some(1.5), None, Some(2.5)]);
    }
}

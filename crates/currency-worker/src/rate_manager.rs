//! 汇率管理器
//!
//! 编排 `RateFetcher` -> `RateStore` 的刷新流程，对外提供汇率读取、币种换算、
//! 冷启动自检和健康查询。
//!
//! 容错策略：
//! - 汇率 API 不可用时只记录告警并返回降级结果，worker 继续使用已缓存的汇率
//! - 缓存写入失败直接向上传播：无法落地的刷新没有意义
//! - 汇率陈旧（超过两倍 TTL）只告警，不拒绝读取

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fx_shared::config::RatesConfig;
use fx_shared::observability::metrics;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::WorkerError;
use crate::models::ExchangeRate;
use crate::rate_fetcher::RateFetcher;
use crate::rate_store::RateStore;

/// 汇率管理器配置
#[derive(Debug, Clone)]
pub struct RateManagerConfig {
    pub base_currency: String,
    pub supported_currencies: Vec<String>,
    pub ttl: Duration,
}

impl From<&RatesConfig> for RateManagerConfig {
    fn from(config: &RatesConfig) -> Self {
        Self {
            base_currency: normalize_currency(&config.base_currency),
            supported_currencies: config
                .supported_currencies
                .iter()
                .map(|c| normalize_currency(c))
                .collect(),
            ttl: config.ttl(),
        }
    }
}

/// 一次刷新的结果
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// 已写入缓存的汇率条数
    Stored { count: usize },
    /// 汇率源不可用，缓存保持原状
    Degraded { reason: String },
}

/// 基准货币汇率的健康状态，供健康检查接口读取
#[derive(Debug, Clone, Serialize)]
pub struct RateHealth {
    pub base_currency: String,
    pub present: bool,
    pub updated_at: Option<DateTime<Utc>>,
    pub age_seconds: Option<u64>,
    pub stale: bool,
}

/// 币种代码统一为大写并去除空白
pub fn normalize_currency(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

pub struct RateManager {
    store: Arc<dyn RateStore>,
    fetcher: Arc<dyn RateFetcher>,
    config: RateManagerConfig,
}

impl RateManager {
    pub fn new(
        store: Arc<dyn RateStore>,
        fetcher: Arc<dyn RateFetcher>,
        config: RateManagerConfig,
    ) -> Self {
        Self {
            store,
            fetcher,
            config,
        }
    }

    pub fn base_currency(&self) -> &str {
        &self.config.base_currency
    }

    /// 从汇率 API 拉取全部汇率并批量写入缓存
    ///
    /// 汇率源失败时返回 `Ok(RefreshOutcome::Degraded)`，缓存不做任何改动。
    pub async fn fetch_and_store_rates(&self) -> Result<RefreshOutcome, WorkerError> {
        let envelope = match self.fetcher.fetch_rates().await {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "拉取汇率失败，继续使用已缓存的汇率");
                metrics::record_rate_refresh("degraded", 0);
                return Ok(RefreshOutcome::Degraded {
                    reason: e.to_string(),
                });
            }
        };

        // 报价基准与配置不一致时，补齐的 1.0 与交叉汇率都会错位，整批丢弃
        let declared_base = normalize_currency(&envelope.base);
        if declared_base != self.config.base_currency {
            let e = WorkerError::RateDecode(format!(
                "汇率 API 基准货币 {declared_base} 与配置的 {} 不一致",
                self.config.base_currency
            ));
            error!(error = %e, "汇率响应基准货币不匹配，缓存保持原状");
            metrics::record_rate_refresh("degraded", 0);
            return Ok(RefreshOutcome::Degraded {
                reason: e.to_string(),
            });
        }

        let now = Utc::now();
        let mut rates: Vec<ExchangeRate> = Vec::with_capacity(envelope.rates.len() + 1);
        for (currency, rate) in envelope.rates {
            if !ExchangeRate::is_valid_rate(rate) {
                warn!(currency = %currency, rate, "忽略非法汇率");
                continue;
            }
            rates.push(ExchangeRate::new(normalize_currency(&currency), rate, now));
        }

        // 报价接口通常不返回基准货币自身，补齐 1.0 以便健康检查和 X -> base 换算
        if !rates.iter().any(|r| r.currency == declared_base) {
            rates.push(ExchangeRate::new(declared_base, 1.0, now));
        }

        if let Err(e) = self.store.set_multiple(&rates).await {
            metrics::record_rate_refresh("failed", 0);
            return Err(e);
        }

        let count = rates.len();
        metrics::record_rate_refresh("success", count);
        info!(count, base = %self.config.base_currency, "汇率已刷新");

        Ok(RefreshOutcome::Stored { count })
    }

    /// 读取单个币种汇率，陈旧时仅告警
    pub async fn get_rate(&self, currency: &str) -> Result<ExchangeRate, WorkerError> {
        let currency = normalize_currency(currency);
        let rate = self
            .store
            .get(&currency)
            .await?
            .ok_or_else(|| WorkerError::RateNotFound {
                currency: currency.clone(),
            })?;

        self.warn_if_stale(&rate);
        Ok(rate)
    }

    /// 批量读取汇率，缺失的币种不出现在结果中
    pub async fn get_rates(
        &self,
        currencies: &[String],
    ) -> Result<HashMap<String, ExchangeRate>, WorkerError> {
        self.store.get_multiple(currencies).await
    }

    /// 币种换算，返回 (换算后金额, 使用的交叉汇率)
    ///
    /// 交叉汇率 = to.rate / from.rate，两个汇率通过一次批量读取获得。
    /// 同币种直接返回原金额，不访问缓存。
    pub async fn convert_currency(
        &self,
        amount: f64,
        from: &str,
        to: &str,
    ) -> Result<(f64, f64), WorkerError> {
        let from = normalize_currency(from);
        let to = normalize_currency(to);

        if from == to {
            return Ok((amount, 1.0));
        }

        let rates = self
            .store
            .get_multiple(&[from.clone(), to.clone()])
            .await?;

        let from_rate = rates
            .get(&from)
            .ok_or_else(|| WorkerError::RateNotFound {
                currency: from.clone(),
            })?;
        let to_rate = rates
            .get(&to)
            .ok_or_else(|| WorkerError::RateNotFound {
                currency: to.clone(),
            })?;

        self.warn_if_stale(from_rate);
        self.warn_if_stale(to_rate);

        let cross_rate = to_rate.rate / from_rate.rate;
        let converted = amount * cross_rate;

        debug!(amount, from = %from, to = %to, cross_rate, converted, "币种换算完成");

        Ok((converted, cross_rate))
    }

    /// 冷启动自检：任一支持币种缺失时触发一次完整刷新
    ///
    /// 返回是否触发了刷新。一次刷新即覆盖全部币种，因此发现第一个缺失后立即返回。
    pub async fn ensure_rates_available(&self) -> Result<bool, WorkerError> {
        for currency in &self.config.supported_currencies {
            if !self.store.exists(currency).await? {
                info!(currency = %currency, "缓存中缺少汇率，触发刷新");
                self.fetch_and_store_rates().await?;
                return Ok(true);
            }
        }

        debug!("所有支持币种的汇率均已缓存");
        Ok(false)
    }

    /// 基准货币汇率是否存在及其新鲜度
    pub async fn rate_health(&self) -> Result<RateHealth, WorkerError> {
        let base = self.config.base_currency.clone();
        let now = Utc::now();

        let health = match self.store.get(&base).await? {
            Some(rate) => RateHealth {
                base_currency: base,
                present: true,
                updated_at: Some(rate.updated_at),
                age_seconds: Some(rate.age(now).as_secs()),
                stale: rate.is_stale(now, self.config.ttl),
            },
            None => RateHealth {
                base_currency: base,
                present: false,
                updated_at: None,
                age_seconds: None,
                stale: false,
            },
        };

        Ok(health)
    }

    fn warn_if_stale(&self, rate: &ExchangeRate) {
        let now = Utc::now();
        if rate.is_stale(now, self.config.ttl) {
            warn!(
                currency = %rate.currency,
                updated_at = %rate.updated_at,
                age_secs = rate.age(now).as_secs(),
                "汇率已陈旧，仍继续使用"
            );
        }
    }
}

//! 汇率报价 API 客户端
//!
//! 调用外部 HTTP 接口获取相对基准货币的汇率表，响应格式：
//!
//! ```json
//! {"base": "USD", "date": "2024-07-01", "rates": {"EUR": 0.93, "RUB": 91.23}}
//! ```
//!
//! 本模块不做重试，重试与降级策略由 `RateManager` 决定。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::WorkerError;

/// 汇率 API 响应信封
#[derive(Debug, Clone, Deserialize)]
pub struct RatesEnvelope {
    pub base: String,
    #[serde(default)]
    pub date: String,
    pub rates: HashMap<String, f64>,
}

impl RatesEnvelope {
    pub fn new(base: impl Into<String>, rates: HashMap<String, f64>) -> Self {
        Self {
            base: base.into(),
            date: String::new(),
            rates,
        }
    }
}

/// 汇率获取接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RateFetcher: Send + Sync {
    /// 返回完整响应，`rates` 中的数值相对于 `base`
    async fn fetch_rates(&self) -> Result<RatesEnvelope, WorkerError>;
}

/// 基于 reqwest 的汇率 API 客户端
pub struct HttpRateFetcher {
    client: reqwest::Client,
    url: String,
}

impl HttpRateFetcher {
    /// 创建客户端，`timeout` 覆盖连接与读取的整个请求周期
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, WorkerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WorkerError::RateFetch(format!("创建 HTTP 客户端失败: {e}")))?;

        let url = url.into();
        info!(url = %url, timeout_secs = timeout.as_secs(), "汇率 API 客户端已初始化");

        Ok(Self { client, url })
    }
}

#[async_trait]
impl RateFetcher for HttpRateFetcher {
    async fn fetch_rates(&self) -> Result<RatesEnvelope, WorkerError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| WorkerError::RateFetch(e.to_string()))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(WorkerError::RateDecode(format!(
                "汇率 API 返回非预期状态码: {status}"
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| WorkerError::RateFetch(format!("读取响应体失败: {e}")))?;

        let envelope = parse_envelope(&body)?;

        debug!(
            base = %envelope.base,
            date = %envelope.date,
            count = envelope.rates.len(),
            "汇率 API 响应已解析"
        );

        Ok(envelope)
    }
}

/// 解析响应体；单独抽出便于脱离网络测试
pub fn parse_envelope(body: &[u8]) -> Result<RatesEnvelope, WorkerError> {
    serde_json::from_slice(body).map_err(|e| WorkerError::RateDecode(e.to_string()))
}

//! 汇率换算 worker 专用错误类型
//!
//! 在共享库 FxError 基础上定义本服务特有的错误变体。
//! 除汇率源不可用外，其余错误对单条消息而言都是永久性的：
//! 消费者不提交 offset，消息会被重新投递。

use fx_shared::error::FxError;
use uuid::Uuid;

/// 汇率换算处理错误
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// 缓存中没有该币种的汇率（冷启动未完成或已过期）
    #[error("汇率未找到: {currency}")]
    RateNotFound { currency: String },

    /// 事件引用的订单在订单库中不存在
    #[error("订单未找到: {order_id}")]
    OrderNotFound { order_id: Uuid },

    /// 订单数据不满足换算前置条件
    #[error("订单校验失败: {0}")]
    InvalidOrder(String),

    /// 汇率 API 网络层失败（连接拒绝、超时、取消）
    #[error("汇率 API 请求失败: {0}")]
    RateFetch(String),

    /// 汇率 API 返回非 200 或响应体无法解析
    #[error("汇率 API 响应解析失败: {0}")]
    RateDecode(String),

    /// Kafka 消息负载无法解析为订单事件
    #[error("订单事件解析失败: {0}")]
    EventDecode(String),

    /// 透传共享库错误，避免在每个 match 分支手动转换
    #[error(transparent)]
    Shared(#[from] FxError),
}

impl WorkerError {
    /// 汇率源层面的瞬时失败，调用方应降级而不是中断
    pub fn is_rate_source_failure(&self) -> bool {
        matches!(self, Self::RateFetch(_) | Self::RateDecode(_))
    }

    /// 单条消息层面的永久错误：重试同一条消息不会得到不同结果
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::RateNotFound { .. }
            | Self::OrderNotFound { .. }
            | Self::InvalidOrder(_)
            | Self::EventDecode(_) => true,
            Self::RateFetch(_) | Self::RateDecode(_) => false,
            Self::Shared(e) => !e.is_retryable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = WorkerError::RateNotFound {
            currency: "EUR".to_string(),
        };
        assert_eq!(err.to_string(), "汇率未找到: EUR");

        let err = WorkerError::InvalidOrder("currency 为空".to_string());
        assert_eq!(err.to_string(), "订单校验失败: currency 为空");

        let err = WorkerError::RateFetch("connection refused".to_string());
        assert_eq!(err.to_string(), "汇率 API 请求失败: connection refused");

        let shared_err = FxError::Kafka("broker 不可达".to_string());
        let err = WorkerError::Shared(shared_err);
        assert_eq!(err.to_string(), "Kafka 错误: broker 不可达");
    }

    #[test]
    fn test_permanence_classification() {
        assert!(WorkerError::EventDecode("bad json".to_string()).is_permanent());
        assert!(
            WorkerError::OrderNotFound {
                order_id: Uuid::nil()
            }
            .is_permanent()
        );
        assert!(!WorkerError::RateFetch("timeout".to_string()).is_permanent());
        assert!(WorkerError::RateDecode("status 500".to_string()).is_rate_source_failure());

        let redis_down = WorkerError::Shared(FxError::Kafka("down".to_string()));
        assert!(!redis_down.is_permanent());
    }
}

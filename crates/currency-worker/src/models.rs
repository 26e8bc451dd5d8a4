//! 领域模型
//!
//! - `ExchangeRate`: Redis 中按币种缓存的汇率，值相对于基准货币
//! - `OrderEvent`: Kafka 订单事件的线上格式
//! - `Order`: 订单库中的订单记录（由订单服务拥有，本服务只改价格与币种）
//! - `DeliveryCalculation`: 单次换算的中间结果，仅用于日志与返回值，不落库

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// ExchangeRate
// ---------------------------------------------------------------------------

/// 单个币种相对基准货币的汇率
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRate {
    pub currency: String,
    /// 1 单位基准货币可兑换的该币种数量，恒大于 0
    pub rate: f64,
    pub updated_at: DateTime<Utc>,
}

impl ExchangeRate {
    pub fn new(currency: impl Into<String>, rate: f64, updated_at: DateTime<Utc>) -> Self {
        Self {
            currency: currency.into(),
            rate,
            updated_at,
        }
    }

    /// 汇率是否可用于换算（正数且有限）
    pub fn is_valid_rate(rate: f64) -> bool {
        rate.is_finite() && rate > 0.0
    }

    /// 距上次更新经过的时间，时钟回拨时按 0 处理
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.updated_at).to_std().unwrap_or_default()
    }

    /// 超过两倍 TTL 视为陈旧（仅用于告警，不影响读取）
    pub fn is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.age(now) > ttl * 2
    }
}

// ---------------------------------------------------------------------------
// OrderEvent
// ---------------------------------------------------------------------------

/// 订单事件类型
///
/// 只有 `OrderCreated` 会触发换算，其余类型（包括无法识别的类型）一律视为成功的空操作。
/// 未知类型通过 `#[serde(other)]` 落到 `Unknown`，避免新增事件类型导致反序列化失败。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderEventType {
    OrderCreated,
    OrderUpdated,
    OrderStatusChanged,
    OrderCancelled,
    OrderDeleted,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for OrderEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::OrderCreated => "ORDER_CREATED",
            Self::OrderUpdated => "ORDER_UPDATED",
            Self::OrderStatusChanged => "ORDER_STATUS_CHANGED",
            Self::OrderCancelled => "ORDER_CANCELLED",
            Self::OrderDeleted => "ORDER_DELETED",
            Self::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

/// Kafka 订单事件
///
/// 只有 `event_type` 与 `order_id` 参与业务逻辑，其余字段仅作日志上下文，
/// 因此都带有默认值，字段缺失不会导致整条消息解析失败。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvent {
    pub event_type: OrderEventType,
    pub order_id: Uuid,
    #[serde(default)]
    pub user_id: Uuid,
    #[serde(default)]
    pub total_price: f64,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub items_count: i32,
    #[serde(default)]
    pub timestamp: DateTime<Utc>,
}

impl OrderEvent {
    /// 构造 ORDER_CREATED 事件（主要用于测试与回放工具）
    pub fn order_created(order: &Order, items_count: i32) -> Self {
        Self {
            event_type: OrderEventType::OrderCreated,
            order_id: order.id,
            user_id: order.user_id,
            total_price: order.total_price,
            currency: order.currency.clone(),
            status: order.status.clone(),
            items_count,
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Order
// ---------------------------------------------------------------------------

/// 订单记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    /// 含运费的订单总价
    pub total_price: f64,
    pub delivery_price: f64,
    pub currency: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// 不含运费的商品金额
    pub fn goods_price(&self) -> f64 {
        self.total_price - self.delivery_price
    }
}

// ---------------------------------------------------------------------------
// DeliveryCalculation
// ---------------------------------------------------------------------------

/// 单次运费换算结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryCalculation {
    pub order_id: Uuid,
    pub original_delivery: f64,
    pub original_currency: String,
    pub converted_delivery: f64,
    pub converted_currency: String,
    pub exchange_rate: f64,
    pub new_total_price: f64,
    pub calculated_at: DateTime<Utc>,
}

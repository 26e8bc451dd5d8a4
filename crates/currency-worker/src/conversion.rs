//! 订单运费换算引擎
//!
//! 按事件类型分发：
//! - **ORDER_CREATED**: 读取订单 -> 运费为 0 时跳过 -> 校验 -> 运费与商品金额分别换算 -> 单次回写
//! - 其他类型（包括无法识别的类型）: 记录日志后按成功处理
//!
//! 以下情况直接跳过，不修改订单：
//! - 运费为 0：不需要做币种归一
//! - 订单币种已是目标币种：消息在回写后、提交 offset 前崩溃会被重投，
//!   这里保证重复处理不会对已换算的金额再换算一次

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use fx_shared::observability::metrics;
use tracing::{debug, info, warn};

use crate::error::WorkerError;
use crate::models::{DeliveryCalculation, Order, OrderEvent, OrderEventType};
use crate::order_gateway::OrderGateway;
use crate::rate_manager::{RateManager, normalize_currency};

/// 单条事件的处理结果
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// 已换算并回写
    Converted(DeliveryCalculation),
    /// 运费为 0，未做任何修改
    SkippedZeroDelivery,
    /// 订单已是目标币种，未做任何修改
    SkippedAlreadyConverted,
    /// 非 ORDER_CREATED 事件，空操作
    Ignored { event_type: OrderEventType },
}

/// 订单事件处理接口
///
/// 消费者只依赖这个 trait，便于在测试中替换为 mock。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderEventHandler: Send + Sync {
    async fn handle(&self, event: &OrderEvent) -> Result<ProcessOutcome, WorkerError>;
}

/// 订单校验：ID 非空、币种非空、价格非负
pub fn validate_order(order: &Order) -> Result<(), WorkerError> {
    if order.id.is_nil() {
        return Err(WorkerError::InvalidOrder("order id 为空".to_string()));
    }
    if order.user_id.is_nil() {
        return Err(WorkerError::InvalidOrder(format!(
            "订单 {} 的 user id 为空",
            order.id
        )));
    }
    if order.currency.trim().is_empty() {
        return Err(WorkerError::InvalidOrder(format!(
            "订单 {} 的 currency 为空",
            order.id
        )));
    }
    let price_ok = |p: f64| p.is_finite() && p >= 0.0;
    if !price_ok(order.total_price) || !price_ok(order.delivery_price) {
        return Err(WorkerError::InvalidOrder(format!(
            "订单 {} 价格非法: total={}, delivery={}",
            order.id, order.total_price, order.delivery_price
        )));
    }
    Ok(())
}

/// 运费换算引擎
pub struct ConversionEngine {
    rate_manager: Arc<RateManager>,
    orders: Arc<dyn OrderGateway>,
    target_currency: String,
}

impl ConversionEngine {
    pub fn new(
        rate_manager: Arc<RateManager>,
        orders: Arc<dyn OrderGateway>,
        target_currency: &str,
    ) -> Self {
        Self {
            rate_manager,
            orders,
            target_currency: normalize_currency(target_currency),
        }
    }

    /// 根据事件类型分发
    pub async fn process_order_event(
        &self,
        event: &OrderEvent,
    ) -> Result<ProcessOutcome, WorkerError> {
        match event.event_type {
            OrderEventType::OrderCreated => self.process_order_created(event).await,
            ref other => {
                debug!(
                    order_id = %event.order_id,
                    event_type = %other,
                    "非 ORDER_CREATED 事件，忽略"
                );
                Ok(ProcessOutcome::Ignored {
                    event_type: other.clone(),
                })
            }
        }
    }

    /// 处理新建订单：换算运费与总价并回写
    pub async fn process_order_created(
        &self,
        event: &OrderEvent,
    ) -> Result<ProcessOutcome, WorkerError> {
        let mut order = self.orders.get_by_id(event.order_id).await?;

        if order.delivery_price == 0.0 {
            debug!(order_id = %order.id, "运费为 0，跳过换算");
            metrics::record_order_conversion("skipped", &self.target_currency);
            return Ok(ProcessOutcome::SkippedZeroDelivery);
        }

        if order.currency.trim().is_empty() {
            order.currency = self.rate_manager.base_currency().to_string();
        } else {
            order.currency = normalize_currency(&order.currency);
        }

        validate_order(&order)?;

        // 折扣订单的商品部分为负，照常换算
        if order.total_price < order.delivery_price {
            warn!(
                order_id = %order.id,
                total_price = order.total_price,
                delivery_price = order.delivery_price,
                "订单总价小于运费"
            );
        }

        if order.currency == self.target_currency {
            info!(
                order_id = %order.id,
                currency = %order.currency,
                "订单已是目标币种，跳过重复换算"
            );
            metrics::record_order_conversion("skipped", &self.target_currency);
            return Ok(ProcessOutcome::SkippedAlreadyConverted);
        }

        let calculation = match self.calculate_delivery(&order).await {
            Ok(calc) => calc,
            Err(e) => {
                metrics::record_order_conversion("failed", &self.target_currency);
                return Err(e);
            }
        };

        if let Err(e) = self
            .orders
            .update_order_with_currency(
                order.id,
                calculation.converted_delivery,
                calculation.new_total_price,
                &calculation.converted_currency,
            )
            .await
        {
            warn!(order_id = %order.id, error = %e, "回写换算结果失败");
            metrics::record_order_conversion("failed", &self.target_currency);
            return Err(e);
        }

        metrics::record_order_conversion("converted", &self.target_currency);
        info!(
            order_id = %calculation.order_id,
            original_delivery = calculation.original_delivery,
            original_currency = %calculation.original_currency,
            converted_delivery = calculation.converted_delivery,
            converted_currency = %calculation.converted_currency,
            exchange_rate = calculation.exchange_rate,
            new_total_price = calculation.new_total_price,
            "订单运费换算完成"
        );

        Ok(ProcessOutcome::Converted(calculation))
    }

    /// 运费与商品金额分别换算，新总价为两者之和
    async fn calculate_delivery(&self, order: &Order) -> Result<DeliveryCalculation, WorkerError> {
        let (converted_delivery, rate) = self
            .rate_manager
            .convert_currency(order.delivery_price, &order.currency, &self.target_currency)
            .await?;

        let (converted_goods, _) = self
            .rate_manager
            .convert_currency(order.goods_price(), &order.currency, &self.target_currency)
            .await?;

        Ok(DeliveryCalculation {
            order_id: order.id,
            original_delivery: order.delivery_price,
            original_currency: order.currency.clone(),
            converted_delivery,
            converted_currency: self.target_currency.clone(),
            exchange_rate: rate,
            new_total_price: converted_delivery + converted_goods,
            calculated_at: Utc::now(),
        })
    }
}

#[async_trait]
impl OrderEventHandler for ConversionEngine {
    async fn handle(&self, event: &OrderEvent) -> Result<ProcessOutcome, WorkerError> {
        self.process_order_event(event).await
    }
}

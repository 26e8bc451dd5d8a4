//! 订单网关
//!
//! 订单数据归订单服务所有，本服务只需要按 ID 读取订单、回写换算后的价格与币种。
//! `OrderGateway` trait 便于测试时注入 mock，PostgreSQL 实现直接操作 `orders` 表。
//! 回写只涉及 `delivery_price`、`total_price`、`currency` 三列，不触碰订单服务维护的其他字段。

use std::time::Duration;

use async_trait::async_trait;
use fx_shared::config::DatabaseConfig;
use fx_shared::error::FxError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::WorkerError;
use crate::models::Order;

/// 回写换算结果，只更新价格与币种三列
const UPDATE_PRICES_SQL: &str = r#"
    UPDATE orders
    SET delivery_price = $2, total_price = $3, currency = $4
    WHERE id = $1
"#;

/// 订单读写接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderGateway: Send + Sync {
    /// 按 ID 读取订单，不存在时返回 `OrderNotFound`
    async fn get_by_id(&self, order_id: Uuid) -> Result<Order, WorkerError>;

    /// 单条语句回写运费、总价与币种
    async fn update_order_with_currency(
        &self,
        order_id: Uuid,
        delivery_price: f64,
        total_price: f64,
        currency: &str,
    ) -> Result<(), WorkerError>;

    /// 订单库是否可达
    async fn ping(&self) -> Result<(), WorkerError>;
}

/// PostgreSQL 订单网关
pub struct PgOrderGateway {
    pool: PgPool,
}

impl PgOrderGateway {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 建立订单库连接池
    #[instrument(skip(config))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, WorkerError> {
        info!(
            max_connections = config.max_connections,
            "Connecting to orders database..."
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .connect(&config.url)
            .await
            .map_err(FxError::from)?;

        info!("Orders database pool created");
        Ok(Self::new(pool))
    }

    /// 关闭连接池，等待借出的连接归还
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Orders database pool closed");
    }
}

#[async_trait]
impl OrderGateway for PgOrderGateway {
    #[instrument(skip(self))]
    async fn get_by_id(&self, order_id: Uuid) -> Result<Order, WorkerError> {
        let order = sqlx::query_as::<_, Order>(
            r#"
            SELECT id, user_id, total_price, delivery_price, currency, status, created_at
            FROM orders
            WHERE id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(FxError::from)?;

        order.ok_or(WorkerError::OrderNotFound { order_id })
    }

    #[instrument(skip(self))]
    async fn update_order_with_currency(
        &self,
        order_id: Uuid,
        delivery_price: f64,
        total_price: f64,
        currency: &str,
    ) -> Result<(), WorkerError> {
        let result = sqlx::query(UPDATE_PRICES_SQL)
            .bind(order_id)
            .bind(delivery_price)
            .bind(total_price)
            .bind(currency)
            .execute(&self.pool)
            .await
            .map_err(FxError::from)?;

        if result.rows_affected() == 0 {
            return Err(WorkerError::OrderNotFound { order_id });
        }

        debug!(%order_id, delivery_price, total_price, currency, "订单价格已回写");
        Ok(())
    }

    async fn ping(&self) -> Result<(), WorkerError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(FxError::from)?;
        Ok(())
    }
}

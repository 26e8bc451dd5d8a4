//! 健康检查与指标监听
//!
//! - `GET /health`: 基准货币汇率是否存在、是否陈旧，订单库是否可达，以及消费者状态；
//!   汇率缺失时返回 503，汇率陈旧或订单库不可达时为 degraded
//! - `GET /metrics`: Prometheus 文本格式指标
//! - `GET /stats`: 消费者统计

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use fx_shared::observability::metrics::MetricsHandle;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::consumer::{ConsumerState, ConsumerStatsSnapshot, OrderEventConsumer};
use crate::order_gateway::OrderGateway;
use crate::rate_manager::{RateHealth, RateManager};

#[derive(Clone)]
pub struct HealthState {
    pub service_name: String,
    pub rate_manager: Arc<RateManager>,
    pub orders: Arc<dyn OrderGateway>,
    pub consumer: Arc<OrderEventConsumer>,
    pub metrics: Option<MetricsHandle>,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub service: String,
    pub consumer: ConsumerState,
    pub database: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rates: Option<RateHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .route("/stats", get(stats))
        .with_state(state)
}

/// 启动监听，`shutdown` 置为 true 后优雅退出
pub async fn serve(
    addr: &str,
    state: HealthState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr, "健康检查监听已启动");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    info!("健康检查监听已停止");
    Ok(())
}

async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthReport>) {
    let consumer = state.consumer.state();
    let database_up = match state.orders.ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "订单库健康检查失败");
            false
        }
    };
    let database = if database_up { "up" } else { "down" };

    let (code, report) = match state.rate_manager.rate_health().await {
        Ok(rates) if rates.present => {
            let status = if rates.stale || !database_up {
                "degraded"
            } else {
                "ok"
            };
            (
                StatusCode::OK,
                HealthReport {
                    status,
                    service: state.service_name.clone(),
                    consumer,
                    database,
                    rates: Some(rates),
                    error: None,
                },
            )
        }
        Ok(rates) => (
            StatusCode::SERVICE_UNAVAILABLE,
            HealthReport {
                status: "unavailable",
                service: state.service_name.clone(),
                consumer,
                database,
                rates: Some(rates),
                error: None,
            },
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            HealthReport {
                status: "unavailable",
                service: state.service_name.clone(),
                consumer,
                database,
                rates: None,
                error: Some(e.to_string()),
            },
        ),
    };

    (code, Json(report))
}

async fn render_metrics(State(state): State<HealthState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}

async fn stats(State(state): State<HealthState>) -> Json<ConsumerStatsSnapshot> {
    Json(state.consumer.get_stats())
}

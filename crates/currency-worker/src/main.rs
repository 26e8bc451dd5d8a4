//! 订单运费汇率换算服务
//!
//! 消费 Kafka 订单事件，按缓存汇率换算新建订单的运费与总价。

use std::sync::Arc;

use currency_worker::consumer::{ConsumerSettings, KafkaEventSource, OrderEventConsumer};
use currency_worker::conversion::ConversionEngine;
use currency_worker::health::{self, HealthState};
use currency_worker::order_gateway::PgOrderGateway;
use currency_worker::rate_fetcher::HttpRateFetcher;
use currency_worker::rate_manager::{RateManager, RateManagerConfig};
use currency_worker::rate_store::RedisRateStore;
use currency_worker::scheduler::{RateRefreshScheduler, refresh_once};
use fx_shared::{cache::Cache, config::AppConfig, observability};
use tokio::sync::watch;
use tracing::{error, info, warn};

const SERVICE_NAME: &str = "currency-worker";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match AppConfig::load(SERVICE_NAME) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("加载配置失败，使用默认配置: {e}");
            AppConfig {
                service_name: SERVICE_NAME.to_string(),
                ..Default::default()
            }
        }
    };
    config.validate()?;

    let guard = observability::init(&config.service_name, &config.observability)?;

    info!(
        environment = %config.environment,
        topic = %config.kafka.topic,
        base_currency = %config.rates.base_currency,
        target_currency = %config.rates.target_currency,
        "Starting currency-worker..."
    );

    // 基础设施
    let orders = Arc::new(PgOrderGateway::connect(&config.database).await?);
    let cache = Cache::new(&config.redis)?;
    if let Err(e) = cache.health_check().await {
        warn!(error = %e, "Redis 暂不可用，汇率读写将在恢复后继续");
    }

    // 端口适配器
    let store = Arc::new(RedisRateStore::new(cache, config.rates.ttl()));
    let fetcher = Arc::new(HttpRateFetcher::new(
        config.rates.api_url.clone(),
        config.rates.fetch_timeout(),
    )?);

    // 业务组件
    let rate_manager = Arc::new(RateManager::new(
        store,
        fetcher,
        RateManagerConfig::from(&config.rates),
    ));
    let engine = Arc::new(ConversionEngine::new(
        rate_manager.clone(),
        orders.clone(),
        &config.rates.target_currency,
    ));
    let source = Arc::new(KafkaEventSource::connect(&config.kafka)?);
    let consumer = Arc::new(OrderEventConsumer::new(
        source,
        engine,
        rate_manager.clone(),
        ConsumerSettings::from(&config.kafka),
    ));
    let scheduler = if config.scheduler.enabled {
        Some(RateRefreshScheduler::new(
            rate_manager.clone(),
            &config.scheduler,
        )?)
    } else {
        info!("汇率定时刷新已禁用");
        None
    };

    // 启动后台任务；调度器启动时自带一次立即刷新
    match &scheduler {
        Some(scheduler) => scheduler.start(),
        None => refresh_once(&rate_manager).await,
    }
    consumer.start().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let health_state = HealthState {
        service_name: config.service_name.clone(),
        rate_manager: rate_manager.clone(),
        orders: orders.clone(),
        consumer: consumer.clone(),
        metrics: guard.metrics_handle(),
    };
    let health_addr = config.server_addr();
    let health_task = tokio::spawn(async move {
        if let Err(e) = health::serve(&health_addr, health_state, shutdown_rx).await {
            error!(error = %e, "健康检查监听异常退出");
        }
    });

    shutdown_signal().await;

    // 先停消费者，保证正在处理的消息完成并提交，再停调度与监听
    consumer.stop().await;
    if let Some(scheduler) = &scheduler {
        scheduler.stop().await;
    }
    shutdown_tx.send_replace(true);
    if let Err(e) = health_task.await {
        error!(error = %e, "健康检查任务异常退出");
    }
    orders.close().await;

    info!("currency-worker shutdown complete");
    Ok(())
}

/// 等待 Ctrl+C 或 SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "注册 Ctrl+C 处理器失败");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "注册 SIGTERM 处理器失败");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
    }
}

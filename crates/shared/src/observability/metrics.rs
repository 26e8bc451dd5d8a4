//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集。
//! 这里只安装 recorder，`/metrics` 的 HTTP 暴露由服务自身的健康检查监听器负责。

use anyhow::Result;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Metrics handle，clone 后可在任意位置渲染指标快照
pub type MetricsHandle = PrometheusHandle;

/// 安装 Prometheus recorder 并注册指标描述
pub fn init(service_name: &str) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_common_metrics(service_name);

    Ok(handle)
}

/// 注册通用指标
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!(
        "fx_events_consumed_total",
        "Total number of order events fetched from Kafka"
    );
    metrics::describe_histogram!(
        "fx_event_processing_duration_seconds",
        "Order event processing duration in seconds"
    );
    metrics::describe_counter!(
        "fx_offsets_committed_total",
        "Total number of committed Kafka offsets"
    );
    metrics::describe_gauge!("fx_consumer_lag", "Estimated consumer lag per partition");

    metrics::describe_counter!(
        "fx_rate_refresh_total",
        "Total number of exchange rate refresh attempts"
    );
    metrics::describe_gauge!(
        "fx_rates_cached",
        "Number of exchange rates written by the last refresh"
    );

    metrics::describe_counter!(
        "fx_order_conversions_total",
        "Total number of order delivery price conversions"
    );

    metrics::describe_gauge!(
        "fx_worker_last_run_timestamp",
        "Unix timestamp of the last background worker run"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录一条订单事件的处理结果
#[inline]
pub fn record_event_processed(event_type: &str, result: &str, duration_secs: f64) {
    metrics::counter!(
        "fx_events_consumed_total",
        "event_type" => event_type.to_string(),
        "result" => result.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "fx_event_processing_duration_seconds",
        "event_type" => event_type.to_string(),
        "result" => result.to_string()
    )
    .record(duration_secs);
}

/// 记录 offset 提交
#[inline]
pub fn record_offset_committed(topic: &str, partition: i32) {
    metrics::counter!(
        "fx_offsets_committed_total",
        "topic" => topic.to_string(),
        "partition" => partition.to_string()
    )
    .increment(1);
}

/// 更新分区消费延迟
#[inline]
pub fn set_consumer_lag(topic: &str, partition: i32, lag: i64) {
    metrics::gauge!(
        "fx_consumer_lag",
        "topic" => topic.to_string(),
        "partition" => partition.to_string()
    )
    .set(lag as f64);
}

/// 记录汇率刷新结果（success / degraded / failed）
#[inline]
pub fn record_rate_refresh(result: &str, rates_written: usize) {
    metrics::counter!("fx_rate_refresh_total", "result" => result.to_string()).increment(1);

    if result == "success" {
        metrics::gauge!("fx_rates_cached").set(rates_written as f64);
    }
}

/// 记录订单运费换算结果（converted / skipped / failed）
#[inline]
pub fn record_order_conversion(result: &str, target_currency: &str) {
    metrics::counter!(
        "fx_order_conversions_total",
        "result" => result.to_string(),
        "target_currency" => target_currency.to_string()
    )
    .increment(1);
}

/// 记录后台任务最后一次运行时间，供告警判断任务是否存活
#[inline]
pub fn set_worker_last_run(worker: &str) {
    metrics::gauge!("fx_worker_last_run_timestamp", "worker" => worker.to_string())
        .set(chrono::Utc::now().timestamp() as f64);
}

//! Kafka 订单事件消费者
//!
//! 单个后台任务串行拉取并处理消息，处理成功后才提交 offset（至少一次投递）。
//! 处理失败（包括负载无法解析）时不提交，并把分区位置回退到失败的消息，
//! 等待一个短暂的退避后重新拉取同一条消息。
//!
//! 状态机：`Idle -> Running -> Stopping -> Stopped`，`start` / `stop` 均可重复调用。

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fx_shared::config::KafkaConfig;
use fx_shared::error::FxError;
use fx_shared::kafka::{ConsumerMessage, KafkaConsumer};
use fx_shared::observability::metrics;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::conversion::OrderEventHandler;
use crate::error::WorkerError;
use crate::models::OrderEvent;
use crate::rate_manager::RateManager;

/// 回退 offset 时等待 broker 响应的上限
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// EventSource
// ---------------------------------------------------------------------------

/// 消息来源接口
///
/// 生产环境由 Kafka 实现，测试中替换为内存实现。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventSource: Send + Sync {
    /// 拉取下一条消息，`timeout` 内没有消息时返回 `Ok(None)`
    async fn fetch(&self, timeout: Duration) -> Result<Option<ConsumerMessage>, WorkerError>;

    /// 提交该消息（下一次从其后一条开始消费）
    fn commit(&self, msg: &ConsumerMessage) -> Result<(), WorkerError>;

    /// 回退到该消息，使其被再次拉取
    fn rewind(&self, msg: &ConsumerMessage) -> Result<(), WorkerError>;

    /// 该消息所在分区的消费延迟，无法获取时返回 `None`
    fn lag(&self, msg: &ConsumerMessage) -> Option<i64>;

    /// 释放底层连接
    fn close(&self);
}

/// 基于 rdkafka 的消息来源
pub struct KafkaEventSource {
    consumer: KafkaConsumer,
}

impl KafkaEventSource {
    /// 创建消费者并订阅配置中的 topic
    pub fn connect(config: &KafkaConfig) -> Result<Self, WorkerError> {
        let consumer = KafkaConsumer::new(config)?;
        consumer.subscribe(&[config.topic.as_str()])?;
        Ok(Self { consumer })
    }
}

#[async_trait]
impl EventSource for KafkaEventSource {
    async fn fetch(&self, timeout: Duration) -> Result<Option<ConsumerMessage>, WorkerError> {
        Ok(self.consumer.recv(timeout).await?)
    }

    fn commit(&self, msg: &ConsumerMessage) -> Result<(), WorkerError> {
        Ok(self.consumer.commit(msg)?)
    }

    fn rewind(&self, msg: &ConsumerMessage) -> Result<(), WorkerError> {
        Ok(self.consumer.seek(msg, SEEK_TIMEOUT)?)
    }

    fn lag(&self, msg: &ConsumerMessage) -> Option<i64> {
        self.consumer.lag(msg)
    }

    fn close(&self) {
        self.consumer.unsubscribe();
    }
}

// ---------------------------------------------------------------------------
// 状态与统计
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// 消费统计计数器
struct ConsumerStats {
    fetched: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    decode_failures: AtomicU64,
    committed: AtomicU64,
    fetch_errors: AtomicU64,
    /// -1 表示尚未消费任何消息
    last_offset: AtomicI64,
    /// -1 表示未知
    lag: AtomicI64,
}

impl Default for ConsumerStats {
    fn default() -> Self {
        Self {
            fetched: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            fetch_errors: AtomicU64::new(0),
            last_offset: AtomicI64::new(-1),
            lag: AtomicI64::new(-1),
        }
    }
}

/// 统计快照，供 `/stats` 与日志使用
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerStatsSnapshot {
    pub state: ConsumerState,
    pub started_at: Option<DateTime<Utc>>,
    pub fetched: u64,
    pub processed: u64,
    pub failed: u64,
    pub decode_failures: u64,
    pub committed: u64,
    pub fetch_errors: u64,
    pub last_offset: Option<i64>,
    pub lag: Option<i64>,
}

/// 消费循环参数
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// 单次拉取的等待上限
    pub fetch_timeout: Duration,
    /// 拉取或处理失败后的退避时间
    pub error_backoff: Duration,
}

impl From<&KafkaConfig> for ConsumerSettings {
    fn from(config: &KafkaConfig) -> Self {
        Self {
            fetch_timeout: config.fetch_timeout(),
            error_backoff: config.error_backoff(),
        }
    }
}

// ---------------------------------------------------------------------------
// OrderEventConsumer
// ---------------------------------------------------------------------------

/// 消费循环与外部句柄共享的部分
struct ConsumerCore {
    source: Arc<dyn EventSource>,
    handler: Arc<dyn OrderEventHandler>,
    settings: ConsumerSettings,
    stats: ConsumerStats,
    state: Mutex<ConsumerState>,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

/// 订单事件消费者
pub struct OrderEventConsumer {
    core: Arc<ConsumerCore>,
    rate_manager: Arc<RateManager>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl OrderEventConsumer {
    pub fn new(
        source: Arc<dyn EventSource>,
        handler: Arc<dyn OrderEventHandler>,
        rate_manager: Arc<RateManager>,
        settings: ConsumerSettings,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            core: Arc::new(ConsumerCore {
                source,
                handler,
                settings,
                stats: ConsumerStats::default(),
                state: Mutex::new(ConsumerState::Idle),
                started_at: Mutex::new(None),
            }),
            rate_manager,
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConsumerState {
        *self.core.state.lock()
    }

    /// 启动消费循环
    ///
    /// 先尽力确保汇率已缓存（失败只记录日志），再派生后台任务。
    /// 已在运行时为空操作；停止后不能再次启动。
    pub async fn start(&self) -> Result<(), WorkerError> {
        {
            let mut state = self.core.state.lock();
            let current = *state;
            match current {
                ConsumerState::Idle => *state = ConsumerState::Running,
                ConsumerState::Running => {
                    debug!("消费者已在运行，忽略重复启动");
                    return Ok(());
                }
                ConsumerState::Stopping | ConsumerState::Stopped => {
                    return Err(FxError::Internal("消费者已停止，不能重新启动".to_string()).into());
                }
            }
        }

        match self.rate_manager.ensure_rates_available().await {
            Ok(true) => info!("启动前已补齐汇率缓存"),
            Ok(false) => debug!("汇率缓存完整"),
            Err(e) => warn!(error = %e, "启动前汇率自检失败，继续启动消费者"),
        }

        *self.core.started_at.lock() = Some(Utc::now());

        let core = Arc::clone(&self.core);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            core.run(shutdown_rx).await;
        });
        *self.task.lock() = Some(handle);

        info!(
            fetch_timeout_ms = self.core.settings.fetch_timeout.as_millis() as u64,
            "订单事件消费者已启动"
        );
        Ok(())
    }

    /// 停止消费：发出信号、等待正在处理的消息完成、释放连接
    pub async fn stop(&self) {
        {
            let mut state = self.core.state.lock();
            let current = *state;
            match current {
                ConsumerState::Idle => {
                    *state = ConsumerState::Stopped;
                    drop(state);
                    self.core.source.close();
                    return;
                }
                ConsumerState::Running => *state = ConsumerState::Stopping,
                ConsumerState::Stopping | ConsumerState::Stopped => return,
            }
        }

        info!("正在停止订单事件消费者...");
        self.shutdown_tx.send_replace(true);

        let handle = self.task.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            error!(error = %e, "消费循环异常退出");
        }

        self.core.source.close();
        *self.core.state.lock() = ConsumerState::Stopped;

        let stats = self.get_stats();
        info!(
            processed = stats.processed,
            failed = stats.failed,
            committed = stats.committed,
            "订单事件消费者已停止"
        );
    }

    pub fn get_stats(&self) -> ConsumerStatsSnapshot {
        let stats = &self.core.stats;
        let last_offset = stats.last_offset.load(Ordering::Relaxed);
        let lag = stats.lag.load(Ordering::Relaxed);

        ConsumerStatsSnapshot {
            state: self.state(),
            started_at: *self.core.started_at.lock(),
            fetched: stats.fetched.load(Ordering::Relaxed),
            processed: stats.processed.load(Ordering::Relaxed),
            failed: stats.failed.load(Ordering::Relaxed),
            decode_failures: stats.decode_failures.load(Ordering::Relaxed),
            committed: stats.committed.load(Ordering::Relaxed),
            fetch_errors: stats.fetch_errors.load(Ordering::Relaxed),
            last_offset: (last_offset >= 0).then_some(last_offset),
            lag: (lag >= 0).then_some(lag),
        }
    }

    /// 处理单条消息，测试可绕过消费循环直接调用
    pub async fn handle_message(&self, msg: &ConsumerMessage) -> Result<(), WorkerError> {
        self.core.handle_message(msg).await
    }
}

impl ConsumerCore {
    /// 消费主循环
    ///
    /// 关闭信号只在拉取与退避期间被观察；正在处理的消息总会处理完毕。
    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("订单事件消费循环已启动");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let fetched = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                result = self.source.fetch(self.settings.fetch_timeout) => result,
            };

            let failed = match fetched {
                Ok(None) => false,
                Ok(Some(msg)) => self.handle_message(&msg).await.is_err(),
                Err(e) => {
                    self.stats.fetch_errors.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, "拉取 Kafka 消息失败");
                    true
                }
            };

            if failed {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(self.settings.error_backoff) => {}
                }
            }
        }

        info!("订单事件消费循环已退出");
    }

    async fn handle_message(&self, msg: &ConsumerMessage) -> Result<(), WorkerError> {
        let started = Instant::now();

        self.stats.fetched.fetch_add(1, Ordering::Relaxed);
        self.stats.last_offset.store(msg.offset, Ordering::Relaxed);
        if let Some(lag) = self.source.lag(msg) {
            self.stats.lag.store(lag, Ordering::Relaxed);
            metrics::set_consumer_lag(&msg.topic, msg.partition, lag);
        }

        let event: OrderEvent = match msg.deserialize_payload() {
            Ok(event) => event,
            Err(e) => {
                let err = WorkerError::EventDecode(e.to_string());
                self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                metrics::record_event_processed(
                    "unknown",
                    "decode_error",
                    started.elapsed().as_secs_f64(),
                );
                warn!(
                    topic = %msg.topic,
                    partition = msg.partition,
                    offset = msg.offset,
                    error = %err,
                    "订单事件无法解析，不提交 offset"
                );
                self.rewind(msg);
                return Err(err);
            }
        };

        let event_type = event.event_type.to_string();

        match self.handler.handle(&event).await {
            Ok(outcome) => {
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
                metrics::record_event_processed(
                    &event_type,
                    "success",
                    started.elapsed().as_secs_f64(),
                );
                debug!(
                    order_id = %event.order_id,
                    offset = msg.offset,
                    ?outcome,
                    "订单事件处理完成"
                );
                self.commit(msg);
                Ok(())
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                metrics::record_event_processed(
                    &event_type,
                    "error",
                    started.elapsed().as_secs_f64(),
                );
                error!(
                    order_id = %event.order_id,
                    event_type = %event_type,
                    partition = msg.partition,
                    offset = msg.offset,
                    permanent = e.is_permanent(),
                    error = %e,
                    "订单事件处理失败，不提交 offset"
                );
                self.rewind(msg);
                Err(e)
            }
        }
    }

    /// 提交失败只记录日志：消息已处理，重投时由幂等检查跳过
    fn commit(&self, msg: &ConsumerMessage) {
        match self.source.commit(msg) {
            Ok(()) => {
                self.stats.committed.fetch_add(1, Ordering::Relaxed);
                metrics::record_offset_committed(&msg.topic, msg.partition);
            }
            Err(e) => {
                warn!(
                    partition = msg.partition,
                    offset = msg.offset,
                    error = %e,
                    "提交 offset 失败"
                );
            }
        }
    }

    fn rewind(&self, msg: &ConsumerMessage) {
        if let Err(e) = self.source.rewind(msg) {
            warn!(
                partition = msg.partition,
                offset = msg.offset,
                error = %e,
                "回退 offset 失败，消息将在重新分配分区后重投"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversion::{MockOrderEventHandler, ProcessOutcome};
    use crate::rate_fetcher::MockRateFetcher;
    use crate::rate_manager::RateManagerConfig;
    use crate::rate_store::MockRateStore;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn message(offset: i64, payload: &[u8]) -> ConsumerMessage {
        ConsumerMessage {
            topic: "orders.events".to_string(),
            partition: 0,
            offset,
            key: None,
            payload: payload.to_vec(),
            timestamp: None,
            headers: HashMap::new(),
        }
    }

    fn created_payload() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "event_type": "ORDER_CREATED",
            "order_id": Uuid::now_v7(),
        }))
        .unwrap()
    }

    fn rate_manager(store: MockRateStore) -> Arc<RateManager> {
        Arc::new(RateManager::new(
            Arc::new(store),
            Arc::new(MockRateFetcher::new()),
            RateManagerConfig {
                base_currency: "USD".to_string(),
                supported_currencies: vec!["USD".to_string()],
                ttl: Duration::from_secs(1800),
            },
        ))
    }

    fn settings() -> ConsumerSettings {
        ConsumerSettings {
            fetch_timeout: Duration::from_millis(20),
            error_backoff: Duration::from_millis(10),
        }
    }

    fn consumer(source: MockEventSource, handler: MockOrderEventHandler) -> OrderEventConsumer {
        OrderEventConsumer::new(
            Arc::new(source),
            Arc::new(handler),
            rate_manager(MockRateStore::new()),
            settings(),
        )
    }

    #[tokio::test]
    async fn test_success_commits_once() {
        let mut source = MockEventSource::new();
        source.expect_lag().returning(|_| Some(3));
        source
            .expect_commit()
            .times(1)
            .withf(|m| m.offset == 7)
            .returning(|_| Ok(()));
        source.expect_rewind().never();

        let mut handler = MockOrderEventHandler::new();
        handler
            .expect_handle()
            .times(1)
            .returning(|_| Ok(ProcessOutcome::SkippedZeroDelivery));

        let consumer = consumer(source, handler);
        consumer
            .handle_message(&message(7, &created_payload()))
            .await
            .unwrap();

        let stats = consumer.get_stats();
        assert_eq!(stats.fetched, 1);
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.committed, 1);
        assert_eq!(stats.last_offset, Some(7));
        assert_eq!(stats.lag, Some(3));
    }

    /// 无法解析的负载不会交给处理器，也不会提交
    #[tokio::test]
    async fn test_decode_failure_rewinds_without_commit() {
        let mut source = MockEventSource::new();
        source.expect_lag().returning(|_| None);
        source.expect_commit().never();
        source
            .expect_rewind()
            .times(1)
            .withf(|m| m.offset == 3)
            .returning(|_| Ok(()));

        let mut handler = MockOrderEventHandler::new();
        handler.expect_handle().never();

        let consumer = consumer(source, handler);
        let err = consumer
            .handle_message(&message(3, b"{not json"))
            .await
            .unwrap_err();

        assert!(matches!(err, WorkerError::EventDecode(_)));
        let stats = consumer.get_stats();
        assert_eq!(stats.decode_failures, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.committed, 0);
        assert_eq!(stats.lag, None);
    }

    #[tokio::test]
    async fn test_handler_failure_rewinds_without_commit() {
        let mut source = MockEventSource::new();
        source.expect_lag().returning(|_| None);
        source.expect_commit().never();
        source.expect_rewind().times(1).returning(|_| Ok(()));

        let mut handler = MockOrderEventHandler::new();
        handler.expect_handle().returning(|e| {
            Err(WorkerError::OrderNotFound {
                order_id: e.order_id,
            })
        });

        let consumer = consumer(source, handler);
        let err = consumer
            .handle_message(&message(1, &created_payload()))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::OrderNotFound { .. }));
        assert_eq!(consumer.get_stats().failed, 1);
    }

    /// 提交失败不影响处理结果
    #[tokio::test]
    async fn test_commit_failure_is_logged_only() {
        let mut source = MockEventSource::new();
        source.expect_lag().returning(|_| None);
        source
            .expect_commit()
            .returning(|_| Err(FxError::Kafka("coordinator moved".to_string()).into()));

        let mut handler = MockOrderEventHandler::new();
        handler
            .expect_handle()
            .returning(|_| Ok(ProcessOutcome::SkippedAlreadyConverted));

        let consumer = consumer(source, handler);
        assert!(
            consumer
                .handle_message(&message(1, &created_payload()))
                .await
                .is_ok()
        );
        let stats = consumer.get_stats();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.committed, 0);
    }

    /// stop 在未启动时同样释放连接，之后不能再启动
    #[tokio::test]
    async fn test_stop_before_start() {
        let mut source = MockEventSource::new();
        source.expect_close().times(1).return_const(());

        let consumer = consumer(source, MockOrderEventHandler::new());
        consumer.stop().await;
        consumer.stop().await;

        assert_eq!(consumer.state(), ConsumerState::Stopped);
        assert!(consumer.start().await.is_err());
    }

    #[test]
    fn test_settings_from_kafka_config() {
        let settings = ConsumerSettings::from(&KafkaConfig::default());
        assert_eq!(settings.fetch_timeout, Duration::from_millis(1000));
        assert_eq!(settings.error_backoff, Duration::from_millis(1000));
    }

    #[test]
    fn test_state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ConsumerState::Running).unwrap(),
            "\"running\""
        );
        assert_eq!(ConsumerState::Stopping.to_string(), "stopping");
    }
}

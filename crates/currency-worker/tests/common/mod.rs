//! 集成测试共享的内存实现
//!
//! 用 HashMap 模拟 Redis 汇率缓存、订单库与 Kafka 分区，
//! 让换算与消费流程可以在没有外部依赖的情况下端到端运行。

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use currency_worker::consumer::EventSource;
use currency_worker::error::WorkerError;
use currency_worker::models::{ExchangeRate, Order};
use currency_worker::order_gateway::OrderGateway;
use currency_worker::rate_fetcher::{RateFetcher, RatesEnvelope};
use currency_worker::rate_manager::{RateManager, RateManagerConfig};
use currency_worker::rate_store::RateStore;
use fx_shared::error::FxError;
use fx_shared::kafka::ConsumerMessage;
use parking_lot::Mutex;
use tokio::sync::RwLock;
use uuid::Uuid;

// ==================== RateStore ====================

#[derive(Default)]
pub struct InMemoryRateStore {
    rates: Arc<RwLock<HashMap<String, ExchangeRate>>>,
    reads: AtomicUsize,
}

impl InMemoryRateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, pairs: &[(&str, f64)]) {
        let now = Utc::now();
        let mut rates = self.rates.write().await;
        for (currency, rate) in pairs {
            rates.insert(currency.to_string(), ExchangeRate::new(*currency, *rate, now));
        }
    }

    pub async fn len(&self) -> usize {
        self.rates.read().await.len()
    }

    /// get / get_multiple 的调用次数
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RateStore for InMemoryRateStore {
    async fn get(&self, currency: &str) -> Result<Option<ExchangeRate>, WorkerError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.rates.read().await.get(currency).cloned())
    }

    async fn set(&self, rate: &ExchangeRate) -> Result<(), WorkerError> {
        self.rates
            .write()
            .await
            .insert(rate.currency.clone(), rate.clone());
        Ok(())
    }

    async fn set_multiple(&self, rates: &[ExchangeRate]) -> Result<(), WorkerError> {
        let mut stored = self.rates.write().await;
        for rate in rates {
            stored.insert(rate.currency.clone(), rate.clone());
        }
        Ok(())
    }

    async fn get_multiple(
        &self,
        currencies: &[String],
    ) -> Result<HashMap<String, ExchangeRate>, WorkerError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let stored = self.rates.read().await;
        Ok(currencies
            .iter()
            .filter_map(|c| stored.get(c).map(|r| (c.clone(), r.clone())))
            .collect())
    }

    async fn exists(&self, currency: &str) -> Result<bool, WorkerError> {
        Ok(self.rates.read().await.contains_key(currency))
    }
}

// ==================== RateFetcher ====================

/// 返回以 USD 为基准的固定汇率表，或在 `fail` 为 true 时模拟网络失败
pub struct StaticRateFetcher {
    base: String,
    rates: HashMap<String, f64>,
    fail: bool,
    calls: AtomicUsize,
}

impl StaticRateFetcher {
    pub fn new(pairs: &[(&str, f64)]) -> Self {
        Self {
            base: "USD".to_string(),
            rates: pairs.iter().map(|(c, r)| (c.to_string(), *r)).collect(),
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            base: "USD".to_string(),
            rates: HashMap::new(),
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }

    /// 报价声明的基准货币
    pub fn with_base(mut self, base: &str) -> Self {
        self.base = base.to_string();
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RateFetcher for StaticRateFetcher {
    async fn fetch_rates(&self) -> Result<RatesEnvelope, WorkerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(WorkerError::RateFetch("connection refused".to_string()));
        }
        Ok(RatesEnvelope::new(self.base.clone(), self.rates.clone()))
    }
}

// ==================== OrderGateway ====================

#[derive(Default)]
pub struct InMemoryOrderGateway {
    orders: Arc<RwLock<HashMap<Uuid, Order>>>,
    updates: AtomicUsize,
}

impl InMemoryOrderGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, order: Order) {
        self.orders.write().await.insert(order.id, order);
    }

    pub async fn order(&self, id: Uuid) -> Option<Order> {
        self.orders.read().await.get(&id).cloned()
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OrderGateway for InMemoryOrderGateway {
    async fn get_by_id(&self, order_id: Uuid) -> Result<Order, WorkerError> {
        self.orders
            .read()
            .await
            .get(&order_id)
            .cloned()
            .ok_or(WorkerError::OrderNotFound { order_id })
    }

    async fn update_order_with_currency(
        &self,
        order_id: Uuid,
        delivery_price: f64,
        total_price: f64,
        currency: &str,
    ) -> Result<(), WorkerError> {
        let mut orders = self.orders.write().await;
        let order = orders
            .get_mut(&order_id)
            .ok_or(WorkerError::OrderNotFound { order_id })?;
        order.delivery_price = delivery_price;
        order.total_price = total_price;
        order.currency = currency.to_string();
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self) -> Result<(), WorkerError> {
        Ok(())
    }
}

// ==================== EventSource ====================

#[derive(Default)]
struct Partition {
    pending: VecDeque<ConsumerMessage>,
    fetched: Vec<i64>,
    committed: Vec<i64>,
    rewound: Vec<i64>,
    closed: bool,
    /// 接下来的拉取中需要返回错误的次数
    failing_fetches: usize,
    /// 为 true 时拉取一直挂起，不受超时约束
    stalled: bool,
    fetch_attempts: usize,
}

/// 单分区内存消息源，回退时把消息放回队首，与 Kafka seek 行为一致
///
/// 可注入连续的拉取错误，或让拉取一直挂起以模拟 broker 无响应。
#[derive(Default)]
pub struct FakeEventSource {
    partition: Mutex<Partition>,
}

impl FakeEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, offset: i64, payload: &[u8]) {
        self.partition.lock().pending.push_back(ConsumerMessage {
            topic: "orders.events".to_string(),
            partition: 0,
            offset,
            key: None,
            payload: payload.to_vec(),
            timestamp: Some(Utc::now().timestamp_millis()),
            headers: HashMap::new(),
        });
    }

    /// 接下来 `n` 次拉取返回 broker 错误
    pub fn fail_next_fetches(&self, n: usize) {
        self.partition.lock().failing_fetches = n;
    }

    /// 之后的拉取一直挂起
    pub fn stall(&self) {
        self.partition.lock().stalled = true;
    }

    /// 包括出错与挂起在内的拉取调用次数
    pub fn fetch_attempts(&self) -> usize {
        self.partition.lock().fetch_attempts
    }

    pub fn fetched(&self) -> Vec<i64> {
        self.partition.lock().fetched.clone()
    }

    pub fn committed(&self) -> Vec<i64> {
        self.partition.lock().committed.clone()
    }

    pub fn rewound(&self) -> Vec<i64> {
        self.partition.lock().rewound.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.partition.lock().closed
    }
}

#[async_trait]
impl EventSource for FakeEventSource {
    async fn fetch(&self, timeout: Duration) -> Result<Option<ConsumerMessage>, WorkerError> {
        let (next, stalled) = {
            let mut partition = self.partition.lock();
            partition.fetch_attempts += 1;
            if partition.failing_fetches > 0 {
                partition.failing_fetches -= 1;
                return Err(FxError::Kafka("broker transport failure".to_string()).into());
            }
            if partition.stalled {
                (None, true)
            } else {
                let next = partition.pending.pop_front();
                if let Some(msg) = &next {
                    partition.fetched.push(msg.offset);
                }
                (next, false)
            }
        };

        if stalled {
            std::future::pending::<()>().await;
        }
        if next.is_none() {
            tokio::time::sleep(timeout.min(Duration::from_millis(5))).await;
        }
        Ok(next)
    }

    fn commit(&self, msg: &ConsumerMessage) -> Result<(), WorkerError> {
        self.partition.lock().committed.push(msg.offset);
        Ok(())
    }

    fn rewind(&self, msg: &ConsumerMessage) -> Result<(), WorkerError> {
        let mut partition = self.partition.lock();
        partition.rewound.push(msg.offset);
        partition.pending.push_front(msg.clone());
        Ok(())
    }

    fn lag(&self, _msg: &ConsumerMessage) -> Option<i64> {
        Some(self.partition.lock().pending.len() as i64)
    }

    fn close(&self) {
        self.partition.lock().closed = true;
    }
}

// ==================== 辅助函数 ====================

pub fn manager_config(supported: &[&str]) -> RateManagerConfig {
    RateManagerConfig {
        base_currency: "USD".to_string(),
        supported_currencies: supported.iter().map(|c| c.to_string()).collect(),
        ttl: Duration::from_secs(1800),
    }
}

pub fn rate_manager(
    store: Arc<InMemoryRateStore>,
    fetcher: Arc<StaticRateFetcher>,
    supported: &[&str],
) -> Arc<RateManager> {
    Arc::new(RateManager::new(store, fetcher, manager_config(supported)))
}

pub fn order(total: f64, delivery: f64, currency: &str) -> Order {
    Order {
        id: Uuid::now_v7(),
        user_id: Uuid::now_v7(),
        total_price: total,
        delivery_price: delivery,
        currency: currency.to_string(),
        status: "pending".to_string(),
        created_at: Utc::now(),
    }
}

pub fn event_payload(event_type: &str, order_id: Uuid) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "event_type": event_type,
        "order_id": order_id,
        "user_id": Uuid::now_v7(),
        "total_price": 110.0,
        "currency": "USD",
        "status": "pending",
        "items_count": 1,
        "timestamp": Utc::now(),
    }))
    .expect("序列化测试事件失败")
}

/// 轮询等待条件成立，超时返回 false
pub async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

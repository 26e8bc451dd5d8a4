//! Kafka 基础设施封装
//!
//! 将 rdkafka 的底层 API 封装为业务友好的 Consumer 抽象，
//! 统一消息反序列化、错误映射与手动提交语义。
//! 自动提交被显式关闭：offset 只在业务处理成功后由调用方提交。

use std::collections::HashMap;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{Offset, TopicPartitionList};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::config::KafkaConfig;
use crate::error::FxError;

// ---------------------------------------------------------------------------
// ConsumerMessage
// ---------------------------------------------------------------------------

/// 消费到的 Kafka 消息的统一表示
///
/// 将 rdkafka 的 `BorrowedMessage`（带生命周期约束）转换为拥有所有权的结构体，
/// 使消息可以安全地跨 await 点传递给异步处理函数。
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

impl ConsumerMessage {
    /// 从 rdkafka 的借用消息构造，提取并拥有所有字段
    fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let key = msg
            .key()
            .and_then(|k| std::str::from_utf8(k).ok())
            .map(String::from);

        let payload = msg.payload().map(|p| p.to_vec()).unwrap_or_default();

        let timestamp = msg.timestamp().to_millis();

        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for idx in 0..h.count() {
                let header = h.get(idx);
                if let Some(raw) = header.value
                    && let Ok(value) = std::str::from_utf8(raw)
                {
                    headers.insert(header.key.to_string(), value.to_string());
                }
            }
        }

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            payload,
            timestamp,
            headers,
        }
    }

    /// 将 JSON 格式负载反序列化为目标类型
    pub fn deserialize_payload<T: DeserializeOwned>(&self) -> Result<T, FxError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| FxError::Serialization(format!("负载反序列化失败: {e}")))
    }
}

// ---------------------------------------------------------------------------
// KafkaConsumer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 消费者
///
/// 封装 `StreamConsumer`，提供带超时的单条拉取、手动提交与回退重投。
pub struct KafkaConsumer {
    consumer: StreamConsumer,
}

impl KafkaConsumer {
    /// 创建消费者，关闭自动提交，offset 只在处理成功后由调用方提交
    pub fn new(config: &KafkaConfig) -> Result<Self, FxError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.consumer_group)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .create()
            .map_err(|e| FxError::Kafka(format!("创建消费者失败: {e}")))?;

        info!(
            brokers = %config.brokers,
            group_id = %config.consumer_group,
            "Kafka 消费者已初始化"
        );
        Ok(Self { consumer })
    }

    /// 订阅指定的 topic 列表
    pub fn subscribe(&self, topics: &[&str]) -> Result<(), FxError> {
        self.consumer
            .subscribe(topics)
            .map_err(|e| FxError::Kafka(format!("订阅 topic 失败: {e}")))?;

        info!(?topics, "已订阅 Kafka topics");
        Ok(())
    }

    /// 拉取下一条消息，最多等待 `timeout`
    ///
    /// 超时返回 `Ok(None)`，表示当前没有新消息。
    pub async fn recv(&self, timeout: Duration) -> Result<Option<ConsumerMessage>, FxError> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(borrowed_msg)) => {
                let msg = ConsumerMessage::from_borrowed(&borrowed_msg);
                debug!(
                    topic = %msg.topic,
                    partition = msg.partition,
                    offset = msg.offset,
                    "收到 Kafka 消息"
                );
                Ok(Some(msg))
            }
            Ok(Err(e)) => Err(FxError::Kafka(format!("接收消息失败: {e}"))),
        }
    }

    /// 提交消息 offset（提交值为 offset + 1，即下一条待消费位置）
    pub fn commit(&self, msg: &ConsumerMessage) -> Result<(), FxError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&msg.topic, msg.partition, Offset::Offset(msg.offset + 1))
            .map_err(|e| FxError::Kafka(format!("构造提交列表失败: {e}")))?;

        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| FxError::Kafka(format!("提交 offset 失败: {e}")))?;

        debug!(
            topic = %msg.topic,
            partition = msg.partition,
            offset = msg.offset,
            "offset 已提交"
        );
        Ok(())
    }

    /// 将分区位置回退到该消息，使其被再次拉取
    pub fn seek(&self, msg: &ConsumerMessage, timeout: Duration) -> Result<(), FxError> {
        self.consumer
            .seek(&msg.topic, msg.partition, Offset::Offset(msg.offset), timeout)
            .map_err(|e| FxError::Kafka(format!("回退 offset 失败: {e}")))
    }

    /// 根据本地缓存的高水位估算该分区的消费延迟
    pub fn lag(&self, msg: &ConsumerMessage) -> Option<i64> {
        self.consumer
            .get_watermark_offsets(&msg.topic, msg.partition)
            .ok()
            .map(|(_, high)| (high - msg.offset - 1).max(0))
    }

    /// 取消订阅，释放分区分配
    pub fn unsubscribe(&self) {
        self.consumer.unsubscribe();
        info!("Kafka 消费者已取消订阅");
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------

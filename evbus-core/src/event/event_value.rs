use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// 总线上的通信单元
///
/// - `topic`：逻辑通道名，所有适配器的权威路由键；
/// - `payload`：不透明的结构化值，总线只在 Codec 的 Schema 钩子中查看它；
/// - `key`：分区亲和/有序键，缺省即不承诺顺序；
/// - `headers`：横切元数据，是否随传输保留取决于适配器；
/// - `tenant_id`：租户范围，原样透传，总线不做解释。
///
/// ```
/// use evbus_core::event::Event;
/// use serde_json::json;
///
/// let event = Event::builder()
///     .topic("order.created")
///     .payload(json!({"order_id": "o1"}))
///     .key("o1")
///     .build();
/// assert_eq!(event.topic(), "order.created");
/// assert_eq!(event.key(), Some("o1"));
/// assert!(!event.id().is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
pub struct Event {
    /// 全局唯一标识，缺省时构造即生成，用于幂等与链路关联
    #[builder(into, default = Uuid::new_v4().to_string())]
    id: String,
    #[builder(into)]
    topic: String,
    payload: Value,
    #[builder(into)]
    key: Option<String>,
    #[builder(default)]
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[builder(into)]
    tenant_id: Option<String>,
    /// 创建时间，只设置一次
    #[builder(skip = Utc::now())]
    timestamp: DateTime<Utc>,
    /// 请求应答的隐藏回复通道引用，仅由适配器注入
    #[builder(skip)]
    #[serde(skip)]
    reply_to: Option<String>,
}

impl Event {
    /// 以最少字段构造事件
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self::builder().topic(topic).payload(payload).build()
    }

    /// 从线上形态还原事件，保留原 `id` 与 `timestamp`
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn restore(
        id: String,
        topic: String,
        payload: Value,
        key: Option<String>,
        headers: BTreeMap<String, String>,
        tenant_id: Option<String>,
        timestamp: DateTime<Utc>,
        reply_to: Option<String>,
    ) -> Self {
        Self {
            id,
            topic,
            payload,
            key,
            headers,
            tenant_id,
            timestamp,
            reply_to,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// 请求应答的关联引用；普通发布的事件为空
    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    /// 返回附加了头部的副本（`id` 与 `timestamp` 不变）
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// 将载荷反序列化为具体类型
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

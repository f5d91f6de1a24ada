use super::Event;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// 事件的线上形态：元数据原样保留，载荷为 Codec 编码后的字节
///
/// 适配器只搬运 `Envelope`，从不解释 `payload`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub topic: String,
    pub key: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub tenant_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: Vec<u8>,
    /// 请求应答的隐藏回复通道引用（按请求事件 `id` 关联）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl Envelope {
    pub fn seal(event: &Event, payload: Vec<u8>) -> Self {
        Self {
            id: event.id().to_string(),
            topic: event.topic().to_string(),
            key: event.key().map(str::to_string),
            headers: event.headers().clone(),
            tenant_id: event.tenant_id().map(str::to_string),
            timestamp: event.timestamp(),
            payload,
            reply_to: event.reply_to().map(str::to_string),
        }
    }

    /// 以解码后的载荷还原事件
    pub fn open(self, payload: Value) -> Event {
        Event::restore(
            self.id,
            self.topic,
            payload,
            self.key,
            self.headers,
            self.tenant_id,
            self.timestamp,
            self.reply_to,
        )
    }
}

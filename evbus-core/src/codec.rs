//! 载荷编解码（Codec）
//!
//! - `encode(topic, payload)`：先运行可选的 Schema 校验钩子，再序列化为字节；
//! - `decode(topic, bytes)`：还原为结构化值；
//! - 校验失败属于生产端不可重试的 `EncodeError`，不会进入死信队列。
//!
use crate::error::{DecodeError, EncodeError};
use serde_json::Value;
use std::sync::Arc;

/// 编解码协议
pub trait Codec: Send + Sync {
    fn encode(&self, topic: &str, payload: &Value) -> Result<Vec<u8>, EncodeError>;

    fn decode(&self, topic: &str, bytes: &[u8]) -> Result<Value, DecodeError>;
}

/// Schema 校验钩子：返回 `Err(reason)` 即拒绝发布
pub trait SchemaValidator: Send + Sync {
    fn validate(&self, topic: &str, payload: &Value) -> Result<(), String>;
}

impl<F> SchemaValidator for F
where
    F: Fn(&str, &Value) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, topic: &str, payload: &Value) -> Result<(), String> {
        self(topic, payload)
    }
}

/// 默认编解码：与 Schema 无关的 JSON 序列化
#[derive(Clone, Default)]
pub struct JsonCodec {
    validator: Option<Arc<dyn SchemaValidator>>,
}

impl JsonCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_validator(validator: impl SchemaValidator + 'static) -> Self {
        Self {
            validator: Some(Arc::new(validator)),
        }
    }
}

impl Codec for JsonCodec {
    fn encode(&self, topic: &str, payload: &Value) -> Result<Vec<u8>, EncodeError> {
        if let Some(validator) = &self.validator {
            validator
                .validate(topic, payload)
                .map_err(|reason| EncodeError::Validation {
                    topic: topic.to_string(),
                    reason,
                })?;
        }

        serde_json::to_vec(payload).map_err(|source| EncodeError::Serialize {
            topic: topic.to_string(),
            source,
        })
    }

    fn decode(&self, topic: &str, bytes: &[u8]) -> Result<Value, DecodeError> {
        serde_json::from_slice(bytes).map_err(|source| DecodeError::Deserialize {
            topic: topic.to_string(),
            source,
        })
    }
}

/// 要求对象载荷包含给定字段的简单校验器，按主题前缀匹配
#[derive(Clone, Debug, Default)]
pub struct RequiredFields {
    rules: Vec<(String, Vec<String>)>,
}

impl RequiredFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, topic_prefix: impl Into<String>, fields: &[&str]) -> Self {
        self.rules.push((
            topic_prefix.into(),
            fields.iter().map(|f| f.to_string()).collect(),
        ));
        self
    }
}

impl SchemaValidator for RequiredFields {
    fn validate(&self, topic: &str, payload: &Value) -> Result<(), String> {
        for (prefix, fields) in &self.rules {
            if !topic.starts_with(prefix.as_str()) {
                continue;
            }
            let Some(object) = payload.as_object() else {
                return Err("payload must be an object".to_string());
            };
            if let Some(missing) = fields.iter().find(|f| !object.contains_key(f.as_str())) {
                return Err(format!("missing field `{missing}`"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_inverts_encode() {
        let codec = JsonCodec::new();
        let payloads = [
            json!({"order_id": "o1", "items": [1, 2, 3]}),
            json!(null),
            json!("plain"),
            json!({"nested": {"deep": [true, false, {"x": 1.5}]}}),
        ];
        for payload in payloads {
            let bytes = codec.encode("t", &payload).unwrap();
            assert_eq!(codec.decode("t", &bytes).unwrap(), payload);
        }
    }

    #[test]
    fn validator_runs_before_encode() {
        let codec = JsonCodec::with_validator(
            RequiredFields::new().require("order.", &["order_id"]),
        );

        let err = codec.encode("order.created", &json!({"sku": "x"})).unwrap_err();
        match err {
            EncodeError::Validation { topic, reason } => {
                assert_eq!(topic, "order.created");
                assert!(reason.contains("order_id"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // 其他主题不受该规则约束
        assert!(codec.encode("billing.paid", &json!({"sku": "x"})).is_ok());
    }

    #[test]
    fn closure_validator() {
        let codec = JsonCodec::with_validator(|_topic: &str, payload: &Value| {
            if payload.is_null() {
                Err("null payload".to_string())
            } else {
                Ok(())
            }
        });
        assert!(codec.encode("t", &Value::Null).is_err());
        assert!(codec.encode("t", &json!(1)).is_ok());
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = JsonCodec::new().decode("t", b"\xff\x00").unwrap_err();
        assert!(matches!(err, DecodeError::Deserialize { .. }));
    }
}

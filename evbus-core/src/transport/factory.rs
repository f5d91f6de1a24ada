use super::TransportAdapter;
use super::log::{
    InProcessPartitionedLog, InProcessStreamLog, PartitionedLogAdapter, StreamLogAdapter,
};
use super::memory::MemoryAdapter;
use crate::config::AdapterConfig;
use crate::error::ConfigError;
use std::sync::Arc;

/// 按配置构造适配器；日志型变体接入进程内参考 broker
///
/// 需要接入外部 broker 时，直接以对应的客户端实现构造
/// `PartitionedLogAdapter::new` / `StreamLogAdapter::new`。
pub fn build_adapter(config: &AdapterConfig) -> Result<Arc<dyn TransportAdapter>, ConfigError> {
    config.validate()?;
    let adapter: Arc<dyn TransportAdapter> = match config {
        AdapterConfig::Memory(c) => Arc::new(MemoryAdapter::new(c.clone())?),
        AdapterConfig::PartitionedLog(c) => {
            let log = InProcessPartitionedLog::new(c.partitions).with_retention(c.retention_records);
            Arc::new(PartitionedLogAdapter::new(Arc::new(log), c.clone())?)
        }
        AdapterConfig::StreamLog(c) => Arc::new(StreamLogAdapter::new(
            Arc::new(InProcessStreamLog::new()),
            c.clone(),
        )?),
    };
    Ok(adapter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MemoryConfig, PartitionedLogConfig, StreamLogConfig};
    use crate::transport::AdapterKind;

    #[test]
    fn selects_variant_from_config() {
        let kinds: Vec<AdapterKind> = [
            AdapterConfig::Memory(MemoryConfig::default()),
            AdapterConfig::PartitionedLog(PartitionedLogConfig::default()),
            AdapterConfig::StreamLog(StreamLogConfig::default()),
        ]
        .iter()
        .map(|c| build_adapter(c).unwrap().kind())
        .collect();
        assert_eq!(
            kinds,
            vec![AdapterKind::Memory, AdapterKind::PartitionedLog, AdapterKind::StreamLog]
        );
    }

    #[test]
    fn invalid_config_fails_at_construction() {
        let config = AdapterConfig::PartitionedLog(PartitionedLogConfig {
            partitions: 0,
            ..PartitionedLogConfig::default()
        });
        assert!(build_adapter(&config).is_err());
    }
}

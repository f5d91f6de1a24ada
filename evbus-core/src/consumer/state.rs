use std::fmt;

/// 订阅的生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    Running,
    /// 已停止拉取，等待处理中的事件完成
    Draining,
    Stopped,
    /// 传输层重连耗尽，订阅不再消费（需要外部告警）
    Failed,
}

impl SubscriptionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// 单个在途事件的状态：`Received → Processing → {Acked | Retrying | DeadLettered | Dropped}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryState {
    Received,
    Processing,
    Acked,
    Retrying,
    DeadLettered,
    /// 重试耗尽且未配置死信主题，或载荷无法解码
    Dropped,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Processing => "processing",
            Self::Acked => "acked",
            Self::Retrying => "retrying",
            Self::DeadLettered => "dead_lettered",
            Self::Dropped => "dropped",
        }
    }
}

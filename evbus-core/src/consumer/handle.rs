use super::SubscriptionState;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 订阅句柄
///
/// - `cancel()` 立即停止拉取，处理中的事件在排空超时内完成后释放会话；
/// - `join()` 等待消费循环退出；
/// - 句柄被丢弃时同样会取消订阅。
#[derive(Debug)]
pub struct SubscriptionHandle {
    topic: String,
    group: Option<String>,
    token: CancellationToken,
    state: watch::Receiver<SubscriptionState>,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub(crate) fn new(
        topic: impl Into<String>,
        group: Option<&str>,
        token: CancellationToken,
        state: watch::Receiver<SubscriptionState>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            topic: topic.into(),
            group: group.map(str::to_string),
            token,
            state,
            task: Some(task),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 等待订阅进入指定状态；状态已不可能再变化时返回 `false`
    pub async fn wait_for(&self, target: SubscriptionState) -> bool {
        let mut state = self.state.clone();
        state.wait_for(|current| *current == target).await.is_ok()
    }

    /// 等待消费循环退出，返回最终状态
    pub async fn join(mut self) -> SubscriptionState {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.state()
    }

    /// 取消并等待排空完成
    pub async fn shutdown(self) -> SubscriptionState {
        self.cancel();
        self.join().await
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

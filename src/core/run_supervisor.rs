//! 运行监管：取消与断开检测
//!
//! 每次运行持有一个 CancellationToken；调用方取消、断开（事件接收端被丢弃）或整体超时都会触发它，
//! 检索 Agent 使用子 token，父 token 取消时一并取消。后台任务不挂在该 token 上。

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// 单次运行的生命周期管理：取消令牌 + 完成令牌
#[derive(Debug, Clone)]
pub struct RunSupervisor {
    /// 调用方 Cancel / 断开时触发
    cancel_token: CancellationToken,
    /// 运行进入 DONE 时触发，用于结束断开监听
    done_token: CancellationToken,
}

impl RunSupervisor {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            done_token: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 触发取消
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 创建子 token（用于单个检索任务）
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    /// 标记运行结束
    pub fn finish(&self) {
        self.done_token.cancel();
    }

    /// 监听事件通道：接收端被丢弃视为调用方断开，取消本次运行；运行结束后监听自动退出
    pub fn watch_disconnect<T: Send + 'static>(&self, tx: mpsc::UnboundedSender<T>) {
        let cancel = self.cancel_token.clone();
        let done = self.done_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tx.closed() => {
                    if !done.is_cancelled() {
                        tracing::info!("Event consumer disconnected, cancelling run");
                        cancel.cancel();
                    }
                }
                _ = done.cancelled() => {}
            }
        });
    }
}

impl Default for RunSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use taskpilot_core::TaskId;
use tokio::sync::oneshot;

/// 正在执行的任务及其中断信号
#[derive(Default)]
pub struct RunningTaskTracker {
    running: Mutex<HashMap<TaskId, oneshot::Sender<()>>>,
}

impl RunningTaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), tx);
        rx
    }

    pub fn remove(&self, id: &str) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    /// 向运行中的处理器发送中断信号，任务不在运行时返回 false
    pub fn interrupt(&self, id: &str) -> bool {
        let sender = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        sender.is_some_and(|tx| tx.send(()).is_ok())
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

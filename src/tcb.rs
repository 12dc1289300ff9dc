//! 线程控制块 (TCB)
//!
//! 每个用户级线程的簿记：保存的上下文、入口闭包、独占的执行栈与状态标签

use crate::context::Context;
use crate::stack::Stack;
use crate::ThreadId;

/// 线程状态
///
/// 一个控制块任一时刻只位于就绪队列、运行槽、阻塞记账三者之一
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcbState {
    /// 就绪，位于就绪队列中等待被调度
    Ready,
    /// 正在运行（任一时刻至多一个）
    Running,
    /// 已阻塞，等待外部 unblock 唤醒
    Blocked,
}

/// 线程控制块
pub struct Tcb {
    /// 线程唯一 ID
    pub id: ThreadId,
    /// 线程状态
    pub state: TcbState,
    /// 保存的执行上下文
    pub context: Context,
    /// 线程独占的执行栈；根控制块运行在调用者的原生栈上，没有独立栈
    pub stack: Option<Stack>,
    /// 入口闭包，首次运行时由跳板函数取走
    pub entry: Option<Box<dyn FnOnce()>>,
}

impl Tcb {
    /// 创建新线程控制块，初始状态 Ready
    pub fn new(id: ThreadId, stack: Stack, context: Context, entry: Box<dyn FnOnce()>) -> Self {
        Self {
            id,
            state: TcbState::Ready,
            context,
            stack: Some(stack),
            entry: Some(entry),
        }
    }

    /// 创建根控制块
    ///
    /// 代表进入 run 循环的调用者，直接处于 Running；
    /// 其上下文在首次切出时才被填充
    pub fn new_root(id: ThreadId) -> Self {
        Self {
            id,
            state: TcbState::Running,
            context: Context::new(),
            stack: None,
            entry: None,
        }
    }

    /// 检查是否就绪
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.state == TcbState::Ready
    }

    /// 检查是否正在运行
    #[inline]
    pub fn is_running(&self) -> bool {
        self.state == TcbState::Running
    }

    /// 检查是否已阻塞
    #[inline]
    pub fn is_blocked(&self) -> bool {
        self.state == TcbState::Blocked
    }
}

impl std::fmt::Debug for Tcb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tcb")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("has_stack", &self.stack.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_tcb_is_ready() {
        let stack = Stack::new(Stack::MIN_SIZE).unwrap();
        let tcb = Tcb::new(1, stack, Context::new(), Box::new(|| {}));
        assert!(tcb.is_ready());
        assert!(tcb.stack.is_some());
        assert!(tcb.entry.is_some());
    }

    #[test]
    fn test_root_tcb_is_running() {
        let tcb = Tcb::new_root(0);
        assert!(tcb.is_running());
        assert!(!tcb.is_blocked());
        assert!(tcb.stack.is_none());
    }
}

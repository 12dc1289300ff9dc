//! 执行上下文
//!
//! 基于 ucontext 的保存/切换原语。调度逻辑不接触任何平台细节，
//! 只使用这里的四个操作：空白捕获、带入口初始化、双向切换、单向切换
//!
//! ucontext 会随上下文保存信号掩码，这正是抢占屏蔽能够跟随
//! 每个逻辑线程走的原因

use std::mem::MaybeUninit;

use crate::stack::Stack;

/// 上下文初始化失败错误
#[derive(Debug, Clone)]
pub struct ContextError;

impl std::fmt::Display for ContextError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to initialize execution context")
    }
}

impl std::error::Error for ContextError {}

/// 线程入口跳板函数类型
///
/// makecontext 只可靠传递 int 宽度的参数，64 位线程 ID 拆成高低两半传入
pub type EntryFn = extern "C" fn(u32, u32);

/// 保存的执行上下文
pub struct Context {
    raw: libc::ucontext_t,
}

impl Context {
    /// 创建空白上下文，首次切出时由 switch 填充
    pub fn new() -> Self {
        Self {
            // ucontext_t 是纯数据结构，全零即为有效的未初始化状态
            raw: unsafe { MaybeUninit::zeroed().assume_init() },
        }
    }

    /// 创建恢复后从 entry(hi, lo) 开始执行的上下文，运行在给定的栈上
    pub fn with_entry(
        stack: &Stack,
        entry: EntryFn,
        hi: u32,
        lo: u32,
    ) -> Result<Self, ContextError> {
        let mut ctx = Self::new();
        if unsafe { libc::getcontext(&mut ctx.raw) } == -1 {
            return Err(ContextError);
        }
        ctx.raw.uc_stack.ss_sp = stack.base() as *mut libc::c_void;
        ctx.raw.uc_stack.ss_size = stack.capacity();
        ctx.raw.uc_link = std::ptr::null_mut();
        unsafe {
            let f: extern "C" fn() = std::mem::transmute(entry);
            libc::makecontext(
                &mut ctx.raw,
                f,
                2,
                hi as libc::c_int,
                lo as libc::c_int,
            );
        }
        Ok(ctx)
    }

    /// 从 from 切换到 to
    ///
    /// 调用只在之后某个线程切回 from 时才返回
    ///
    /// # Safety
    ///
    /// 两个上下文必须均属于当前调度器，且 to 处于可恢复状态
    pub unsafe fn switch(from: &mut Context, to: &Context) {
        libc::swapcontext(&mut from.raw, &to.raw);
    }

    /// 单向切换到 to，当前上下文不再保存（线程退出路径）
    ///
    /// # Safety
    ///
    /// 调用者的执行流在此终结，其栈此后不得再被引用
    pub unsafe fn set(to: &Context) -> ! {
        libc::setcontext(&to.raw);
        // setcontext 成功时不会返回
        std::process::abort();
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").finish_non_exhaustive()
    }
}

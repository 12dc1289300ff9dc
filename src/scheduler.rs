//! 调度器
//!
//! 线程生命周期状态机的核心：拥有就绪队列（严格 FIFO）、阻塞记账区
//! 与当前线程身份，并提供把控制权在就绪线程间轮转的顶层 run 循环。
//!
//! 状态迁移：
//! - Ready -> Running：被选中执行
//! - Running -> Ready：让出，回到就绪队列尾部
//! - Running -> Blocked：主动阻塞
//! - Blocked -> Ready：被 unblock 唤醒
//! - Running -> 销毁：退出
//!
//! 所有读写调度器状态的操作都以抢占守卫包住，
//! 对定时器中断而言是原子的

use std::cell::Cell;
use std::collections::HashMap;

use log::{debug, trace, warn};

use crate::context::{Context, ContextError};
use crate::preempt::{self, PreemptConfig, PreemptGuard};
use crate::queue::Queue;
use crate::stack::{Stack, StackAllocError};
use crate::tcb::{Tcb, TcbState};
use crate::ThreadId;

/// 根控制块的线程 ID
const ROOT_ID: ThreadId = 0;

/// 调度器错误
#[derive(Debug)]
pub enum SchedError {
    /// 当前 OS 线程上已有调度器在运行
    AlreadyRunning,
    /// 没有正在运行的调度器
    NotRunning,
    /// 栈分配失败
    Stack(StackAllocError),
    /// 上下文初始化失败
    Context(ContextError),
}

impl std::fmt::Display for SchedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedError::AlreadyRunning => write!(f, "a scheduler is already running on this thread"),
            SchedError::NotRunning => write!(f, "no scheduler is running on this thread"),
            SchedError::Stack(e) => write!(f, "{}", e),
            SchedError::Context(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SchedError {}

impl From<StackAllocError> for SchedError {
    fn from(e: StackAllocError) -> Self {
        SchedError::Stack(e)
    }
}

impl From<ContextError> for SchedError {
    fn from(e: ContextError) -> Self {
        SchedError::Context(e)
    }
}

/// 调度器配置
#[derive(Debug, Clone)]
pub struct SchedConfig {
    /// 抢占配置
    pub preempt: PreemptConfig,
    /// 线程栈大小（字节）
    pub stack_size: usize,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            preempt: PreemptConfig::default(),
            stack_size: Stack::DEFAULT_SIZE,
        }
    }
}

thread_local! {
    /// 当前 OS 线程上活跃的调度器
    ///
    /// run 期间发布原始指针，结束后清空；信号处理函数与自由函数 API
    /// 都经由这个槽位访问调度器
    static ACTIVE: Cell<*mut Scheduler> = Cell::new(std::ptr::null_mut());
}

/// 调度器
///
/// 把全部进程级可变状态捆绑在一个对象里，由 run 构造并在结束时析构
pub struct Scheduler {
    /// 所有存活线程的控制块；Box 保证上下文地址在表扩容时保持稳定
    threads: HashMap<ThreadId, Box<Tcb>>,
    /// 就绪队列，严格 FIFO
    ready: Queue<ThreadId>,
    /// 阻塞记账区：block 压入一个令牌，unblock 消费一个，
    /// 长度即未配对的 block 数，令牌内容不参与匹配
    hold: Queue<ThreadId>,
    /// 当前运行线程
    current: ThreadId,
    /// 下一个待分配的线程 ID
    next_id: ThreadId,
    /// 已退出待回收的控制块
    ///
    /// 退出线程的栈在切走瞬间仍承载着调用帧，放到下一次调度操作再释放
    graveyard: Option<Box<Tcb>>,
    /// 配置
    config: SchedConfig,
}

impl Scheduler {
    fn new(config: SchedConfig) -> Self {
        Self {
            threads: HashMap::new(),
            ready: Queue::new(),
            hold: Queue::new(),
            current: ROOT_ID,
            next_id: ROOT_ID + 1,
            graveyard: None,
            config,
        }
    }

    /// 回收上一个退出线程的控制块与栈
    fn reap(&mut self) {
        if let Some(tcb) = self.graveyard.take() {
            trace!("reap thread {}", tcb.id);
        }
    }

    /// 创建新线程并追加到就绪队列尾部
    ///
    /// 栈或上下文分配失败时整体回退，不留下部分构造的对象
    fn spawn_inner(&mut self, entry: Box<dyn FnOnce()>) -> Result<ThreadId, SchedError> {
        let _guard = PreemptGuard::disable();
        self.reap();

        let id = self.next_id;
        let stack = Stack::new(self.config.stack_size)?;
        let context =
            Context::with_entry(&stack, trampoline, (id >> 32) as u32, id as u32)?;
        self.next_id += 1;
        self.threads
            .insert(id, Box::new(Tcb::new(id, stack, context, entry)));
        self.ready.enqueue(id);
        trace!("spawn thread {}", id);
        Ok(id)
    }

    /// 让出：把当前线程放回就绪队列尾部并切换到队头线程
    ///
    /// 就绪队列为空时是无操作，当前线程继续运行
    fn yield_now(&mut self) {
        let _guard = PreemptGuard::disable();
        self.reap();
        self.reschedule(true);
    }

    /// 阻塞当前线程直到被 unblock
    fn block(&mut self) {
        let _guard = PreemptGuard::disable();
        self.reap();

        let cur = self.current;
        if let Some(tcb) = self.threads.get_mut(&cur) {
            tcb.state = TcbState::Blocked;
        }
        self.hold.enqueue(cur);
        trace!("block thread {}", cur);

        if self.ready.is_empty() {
            // 没有可切换的对象，维持原语义直接返回
            warn!("block: ready queue empty, thread {} keeps running", cur);
            return;
        }
        self.reschedule(false);
    }

    /// 唤醒 target：消费一个阻塞令牌并把 target 放回就绪队列尾部
    ///
    /// 被消费令牌的身份与 target 无关，记账区只是计数器
    fn unblock(&mut self, target: ThreadId) {
        let _guard = PreemptGuard::disable();

        if self.hold.dequeue().is_none() {
            return;
        }
        match self.threads.get_mut(&target) {
            Some(tcb) => tcb.state = TcbState::Ready,
            None => {
                warn!("unblock: unknown thread {}", target);
                return;
            }
        }
        self.ready.enqueue(target);
        trace!("unblock thread {}", target);
    }

    /// 退出当前线程，控制块延后释放，单向切换到下一个就绪线程
    fn exit(&mut self) {
        // 切走后掩码由下一个线程的上下文恢复，这里不配对 enable
        preempt::disable();
        self.reap();

        let cur = self.current;
        trace!("exit thread {}", cur);
        self.graveyard = self.threads.remove(&cur);

        let next = match self.ready.dequeue() {
            Some(next) => next,
            None => {
                warn!("exit: ready queue empty, returning to caller");
                preempt::enable();
                return;
            }
        };
        if let Some(tcb) = self.threads.get_mut(&next) {
            tcb.state = TcbState::Running;
        }
        self.current = next;
        let to = match self.threads.get(&next) {
            Some(tcb) => &tcb.context as *const Context,
            None => {
                preempt::enable();
                return;
            }
        };
        unsafe { Context::set(&*to) }
    }

    /// 在当前线程与就绪队列头之间执行一次上下文切换
    ///
    /// requeue_current 决定切出线程是回到就绪队列（让出）
    /// 还是留在调度器之外（阻塞）
    fn reschedule(&mut self, requeue_current: bool) {
        let next = match self.ready.dequeue() {
            Some(next) => next,
            None => return,
        };
        let prev = self.current;
        if requeue_current {
            if let Some(tcb) = self.threads.get_mut(&prev) {
                tcb.state = TcbState::Ready;
            }
            self.ready.enqueue(prev);
        }
        if let Some(tcb) = self.threads.get_mut(&next) {
            tcb.state = TcbState::Running;
        }
        self.current = next;
        trace!("switch {} -> {}", prev, next);

        let from = match self.threads.get_mut(&prev) {
            Some(tcb) => &mut tcb.context as *mut Context,
            None => return,
        };
        let to = match self.threads.get(&next) {
            Some(tcb) => &tcb.context as *const Context,
            None => return,
        };
        // 切出线程把自己的临界区深度留在本地变量里，
        // 切回来之后恢复；信号掩码由 ucontext 随上下文走
        let depth = preempt::depth();
        unsafe { Context::switch(&mut *from, &*to) };
        preempt::restore(depth);
    }

    #[inline]
    fn current_id(&self) -> ThreadId {
        self.current
    }
}

/// 新线程的入口跳板：执行入口闭包，随后退出
extern "C" fn trampoline(hi: u32, lo: u32) {
    let id = ((hi as u64) << 32) | (lo as u64);
    // makecontext 捕获的信号掩码来自创建时的临界区，先复位再进入用户代码
    preempt::reset();

    let entry = {
        let _guard = PreemptGuard::disable();
        with_active(|s| s.threads.get_mut(&id).and_then(|tcb| tcb.entry.take())).flatten()
    };
    if let Some(entry) = entry {
        entry();
    }
    let _ = with_active(|s| s.exit());
    // exit 单向切走后不应回到这里
    std::process::abort();
}

/// 在当前 OS 线程的活跃调度器上执行 f
fn with_active<R>(f: impl FnOnce(&mut Scheduler) -> R) -> Option<R> {
    let ptr = ACTIVE.with(|a| a.get());
    if ptr.is_null() {
        None
    } else {
        Some(f(unsafe { &mut *ptr }))
    }
}

/// 启动调度并执行 entry，直到所有派生线程退出后返回
///
/// preempt_enabled 控制是否武装定时器抢占，其余参数取默认配置
pub fn run<F>(preempt_enabled: bool, entry: F) -> Result<(), SchedError>
where
    F: FnOnce() + 'static,
{
    let config = SchedConfig {
        preempt: PreemptConfig {
            enabled: preempt_enabled,
            ..PreemptConfig::default()
        },
        ..SchedConfig::default()
    };
    run_with_config(config, entry)
}

/// 以指定配置启动调度
///
/// 同一 OS 线程上拒绝嵌套启动；初始化任一步失败时
/// 已建立的结构全部回收后返回错误
pub fn run_with_config<F>(config: SchedConfig, entry: F) -> Result<(), SchedError>
where
    F: FnOnce() + 'static,
{
    if !ACTIVE.with(|a| a.get()).is_null() {
        return Err(SchedError::AlreadyRunning);
    }

    let preempt_config = config.preempt.clone();
    let mut sched = Box::new(Scheduler::new(config));
    // 根控制块代表调用者自身：不参与轮转计数之外的任何执行
    sched
        .threads
        .insert(ROOT_ID, Box::new(Tcb::new_root(ROOT_ID)));

    let ptr = Box::into_raw(sched);
    ACTIVE.with(|a| a.set(ptr));
    preempt::start(&preempt_config);
    debug!("scheduler started (preempt: {})", preempt_config.enabled);

    if let Err(e) = unsafe { (*ptr).spawn_inner(Box::new(entry)) } {
        teardown(ptr);
        return Err(e);
    }

    // 就绪队列非空就持续让出，直到所有派生线程退出
    unsafe {
        while (*ptr).ready.len() > 0 {
            (*ptr).yield_now();
        }
    }

    teardown(ptr);
    debug!("scheduler stopped");
    Ok(())
}

/// 解除发布并析构调度器，连同仍然阻塞着的线程一起回收
fn teardown(ptr: *mut Scheduler) {
    preempt::stop();
    ACTIVE.with(|a| a.set(std::ptr::null_mut()));
    let sched = unsafe { Box::from_raw(ptr) };
    let leaked = sched.threads.len().saturating_sub(1);
    if leaked > 0 {
        warn!("{} thread(s) still blocked at scheduler shutdown", leaked);
    }
}

// ============================================================================
// 自由函数 API：经由活跃调度器槽位转发
// ============================================================================

/// 创建新线程并加入就绪队列尾部
pub fn spawn<F>(entry: F) -> Result<ThreadId, SchedError>
where
    F: FnOnce() + 'static,
{
    match with_active(|s| s.spawn_inner(Box::new(entry))) {
        Some(result) => result,
        None => Err(SchedError::NotRunning),
    }
}

/// 主动让出，轮转到下一个就绪线程
///
/// 没有活跃调度器或没有其他就绪线程时是无操作
pub fn yield_now() {
    let _ = with_active(|s| s.yield_now());
}

/// 阻塞当前线程，直到有线程以它为目标调用 unblock
pub fn block() {
    let _ = with_active(|s| s.block());
}

/// 唤醒 target，将其放回就绪队列尾部
pub fn unblock(target: ThreadId) {
    let _ = with_active(|s| s.unblock(target));
}

/// 当前运行线程的 ID；没有活跃调度器时返回 None
pub fn current() -> Option<ThreadId> {
    with_active(|s| s.current_id())
}

/// 定时器信号到达：对启用了抢占的调度器强制让出
pub(crate) fn preempt_tick() {
    let _ = with_active(|s| {
        if s.config.preempt.enabled {
            s.yield_now();
        }
    });
}

//! 用户级协作式线程库
//!
//! 在单个物理执行流上复用多个逻辑线程：线程通过显式 yield 主动让出，
//! 也可以启用由虚拟定时器驱动的异步抢占强制让出。
//! 任一时刻只有一个逻辑线程在执行，不存在真正的并行
//!
//! 核心组件：
//! - Queue: 系统中唯一的容器，支持 O(1) 任意位置删除
//! - Scheduler: 线程生命周期状态机，严格 FIFO 轮转的就绪队列
//! - Semaphore: 建立在 block/unblock 之上的计数信号量
//!
//! ```no_run
//! qthread::run(false, || {
//!     qthread::spawn(|| {
//!         println!("hello from a green thread");
//!         qthread::yield_now();
//!     })
//!     .unwrap();
//! })
//! .unwrap();
//! ```

pub mod context;
pub mod preempt;
pub mod queue;
pub mod scheduler;
pub mod sem;
pub mod stack;
pub mod tcb;

pub use preempt::{PreemptConfig, PreemptGuard};
pub use queue::{IterStep, Queue, QueueError};
pub use scheduler::{
    block, current, run, run_with_config, spawn, unblock, yield_now, SchedConfig, SchedError,
    Scheduler,
};
pub use sem::{SemError, Semaphore};
pub use stack::Stack;
pub use tcb::{Tcb, TcbState};

/// 线程 ID 类型
pub type ThreadId = u64;

//! 信号量
//!
//! 计数同步原语：共享计数加一条阻塞等待队列，
//! 完全建立在 Queue 与调度器的 block/unblock 之上

use log::trace;
use parking_lot::Mutex;

use crate::preempt::PreemptGuard;
use crate::queue::Queue;
use crate::{scheduler, ThreadId};

/// 信号量错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemError {
    /// 等待队列非空，拒绝销毁
    WaitersPending,
    /// 没有活跃调度器，无法阻塞当前线程
    NoCurrentThread,
}

impl std::fmt::Display for SemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SemError::WaitersPending => write!(f, "semaphore still has blocked waiters"),
            SemError::NoCurrentThread => write!(f, "no current thread to block"),
        }
    }
}

impl std::error::Error for SemError {}

struct SemInner {
    /// 非负计数
    count: usize,
    /// 阻塞在本信号量上的线程，FIFO 唤醒
    waiting: Queue<ThreadId>,
}

/// 计数信号量
///
/// 通常以 Arc 在线程间共享；锁从不跨越上下文切换持有
pub struct Semaphore {
    inner: Mutex<SemInner>,
}

impl Semaphore {
    /// 创建初始计数为 count 的信号量
    pub fn new(count: usize) -> Self {
        Self {
            inner: Mutex::new(SemInner {
                count,
                waiting: Queue::new(),
            }),
        }
    }

    /// 当前计数
    #[inline]
    pub fn count(&self) -> usize {
        self.inner.lock().count
    }

    /// 当前等待者数量
    #[inline]
    pub fn waiters(&self) -> usize {
        self.inner.lock().waiting.len()
    }

    /// P 操作
    ///
    /// 计数大于零时直接递减返回（快速路径，不阻塞）；否则把当前线程
    /// 排入等待队列并阻塞。被唤醒即视为已获得信号量，
    /// 恢复后不再查验或递减计数
    pub fn down(&self) -> Result<(), SemError> {
        let _guard = PreemptGuard::disable();

        let must_block = {
            let mut inner = self.inner.lock();
            if inner.count > 0 {
                inner.count -= 1;
                false
            } else {
                let cur = scheduler::current().ok_or(SemError::NoCurrentThread)?;
                inner.waiting.enqueue(cur);
                trace!("sem down: thread {} waiting", cur);
                true
            }
        };
        if must_block {
            // 锁已释放，此处切走
            scheduler::block();
        }
        Ok(())
    }

    /// V 操作
    ///
    /// 计数无条件加一；等待队列非空时按 FIFO 唤醒一个等待者。
    /// 即使唤醒了等待者计数也照常递增，被唤醒方不会再扣回
    pub fn up(&self) {
        let _guard = PreemptGuard::disable();

        let woken = {
            let mut inner = self.inner.lock();
            inner.count += 1;
            inner.waiting.dequeue()
        };
        if let Some(tid) = woken {
            trace!("sem up: waking thread {}", tid);
            scheduler::unblock(tid);
        }
    }

    /// 销毁检查
    ///
    /// 仍有线程阻塞在等待队列上时拒绝并保持信号量完全可用；
    /// 返回 Ok 后即可安全丢弃，实际内存释放由 Drop 完成
    pub fn destroy(&self) -> Result<(), SemError> {
        let _guard = PreemptGuard::disable();
        if !self.inner.lock().waiting.is_empty() {
            return Err(SemError::WaitersPending);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Semaphore")
            .field("count", &inner.count)
            .field("waiters", &inner.waiting.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{run, spawn, yield_now};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_fast_path_without_scheduler() {
        let sem = Semaphore::new(2);
        assert!(sem.down().is_ok());
        assert_eq!(sem.count(), 1);
        assert!(sem.down().is_ok());
        assert_eq!(sem.count(), 0);
        // 计数耗尽且没有可阻塞的线程
        assert_eq!(sem.down(), Err(SemError::NoCurrentThread));
    }

    #[test]
    fn test_up_increments_count() {
        let sem = Semaphore::new(0);
        sem.up();
        sem.up();
        assert_eq!(sem.count(), 2);
        assert!(sem.down().is_ok());
        assert_eq!(sem.count(), 1);
    }

    #[test]
    fn test_destroy_without_waiters() {
        let sem = Semaphore::new(3);
        assert!(sem.destroy().is_ok());
    }

    #[test]
    fn test_mutual_exclusion() {
        let sem = Arc::new(Semaphore::new(1));
        let in_section = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let s = Arc::clone(&sem);
        let flag = Arc::clone(&in_section);
        let max = Arc::clone(&max_seen);
        run(false, move || {
            for _ in 0..2 {
                let sem = Arc::clone(&s);
                let flag = Arc::clone(&flag);
                let max = Arc::clone(&max);
                spawn(move || {
                    sem.down().unwrap();
                    let now = flag.fetch_add(1, Ordering::AcqRel) + 1;
                    max.fetch_max(now, Ordering::AcqRel);
                    // 在临界区内让出，给另一个线程制造闯入机会
                    yield_now();
                    flag.fetch_sub(1, Ordering::AcqRel);
                    sem.up();
                })
                .unwrap();
            }
        })
        .unwrap();
        assert_eq!(max_seen.load(Ordering::Acquire), 1);
    }

    #[test]
    fn test_destroy_with_waiter_fails_then_functional() {
        let sem = Arc::new(Semaphore::new(0));
        let woken = Arc::new(AtomicUsize::new(0));

        let s = Arc::clone(&sem);
        let w = Arc::clone(&woken);
        run(false, move || {
            let sem_waiter = Arc::clone(&s);
            let w2 = Arc::clone(&w);
            spawn(move || {
                sem_waiter.down().unwrap();
                w2.fetch_add(1, Ordering::AcqRel);
            })
            .unwrap();

            let sem_main = Arc::clone(&s);
            spawn(move || {
                // 等待者已挂起，销毁必须被拒绝
                assert_eq!(sem_main.destroy(), Err(SemError::WaitersPending));
                assert_eq!(sem_main.waiters(), 1);
                // 信号量依旧可用
                sem_main.up();
            })
            .unwrap();
        })
        .unwrap();
        assert_eq!(woken.load(Ordering::Acquire), 1);
        assert!(sem.destroy().is_ok());
    }

    #[test]
    fn test_up_count_with_waiter() {
        // up 在唤醒等待者时同样递增计数，被唤醒的 down 不再扣回，
        // 因此一次 up/唤醒配对之后计数为 1 而不是 0
        let sem = Arc::new(Semaphore::new(0));

        let s = Arc::clone(&sem);
        run(false, move || {
            let sem_waiter = Arc::clone(&s);
            spawn(move || {
                sem_waiter.down().unwrap();
            })
            .unwrap();

            let sem_up = Arc::clone(&s);
            spawn(move || {
                sem_up.up();
            })
            .unwrap();
        })
        .unwrap();
        assert_eq!(sem.count(), 1);
        assert_eq!(sem.waiters(), 0);
    }

    #[test]
    fn test_fifo_wakeup_order() {
        let record = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sem = Arc::new(Semaphore::new(0));

        let s = Arc::clone(&sem);
        let r = Arc::clone(&record);
        run(false, move || {
            for name in ["first", "second"] {
                let sem = Arc::clone(&s);
                let r = Arc::clone(&r);
                spawn(move || {
                    sem.down().unwrap();
                    r.lock().push(name);
                })
                .unwrap();
            }
            let sem = Arc::clone(&s);
            spawn(move || {
                sem.up();
                sem.up();
            })
            .unwrap();
        })
        .unwrap();
        assert_eq!(*record.lock(), vec!["first", "second"]);
    }
}

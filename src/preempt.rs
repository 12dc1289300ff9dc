//! 抢占式调度
//!
//! 基于 SIGVTALRM 虚拟定时器的异步强制让出，以及屏蔽该信号的临界区守卫。
//! 临界区只针对定时器：任一时刻只有一个逻辑线程在执行，
//! 不存在真正的并行写者，因此不需要互斥锁

use std::cell::Cell;

use parking_lot::Mutex;

/// 抢占配置
#[derive(Debug, Clone)]
pub struct PreemptConfig {
    /// 是否启用抢占
    pub enabled: bool,
    /// 时间片大小（微秒）
    pub interval_us: u64,
}

impl Default for PreemptConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_us: 10_000, // 10ms
        }
    }
}

thread_local! {
    /// 当前 OS 线程上的临界区嵌套深度
    ///
    /// 信号掩码只在 0 与 1 之间的边沿变化时真正更新，
    /// 嵌套让一个受保护的操作可以安全地调用另一个
    static DEPTH: Cell<u32> = Cell::new(0);
}

/// 屏蔽抢占信号，可嵌套
pub fn disable() {
    DEPTH.with(|d| {
        if d.get() == 0 {
            set_mask(true);
        }
        d.set(d.get() + 1);
    });
}

/// 解除一层屏蔽，递减到 0 时真正放开信号
pub fn enable() {
    DEPTH.with(|d| {
        let depth = d.get();
        debug_assert!(depth > 0, "enable without matching disable");
        if depth <= 1 {
            d.set(0);
            set_mask(false);
        } else {
            d.set(depth - 1);
        }
    });
}

/// 读取当前嵌套深度
///
/// 上下文切换前由切出线程记在自己栈上的局部变量里
#[inline]
pub fn depth() -> u32 {
    DEPTH.with(|d| d.get())
}

/// 恢复嵌套深度
///
/// 切回本线程后调用；信号掩码本身由 ucontext 随上下文恢复，
/// 这里只需要把计数对齐
#[inline]
pub fn restore(depth: u32) {
    DEPTH.with(|d| d.set(depth));
}

/// 复位为无屏蔽状态
///
/// 新线程的跳板入口调用：makecontext 捕获的掩码来自创建时的临界区，
/// 入口闭包必须在放开抢占后执行
pub fn reset() {
    DEPTH.with(|d| d.set(0));
    set_mask(false);
}

/// 更新当前 OS 线程的 SIGVTALRM 掩码
fn set_mask(block: bool) {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGVTALRM);
        let how = if block { libc::SIG_BLOCK } else { libc::SIG_UNBLOCK };
        libc::pthread_sigmask(how, &set, std::ptr::null_mut());
    }
}

/// 抢占守卫
///
/// RAII 风格的临界区：构造时屏蔽，析构时解除
pub struct PreemptGuard {
    _priv: (),
}

impl PreemptGuard {
    /// 屏蔽抢占并创建守卫
    pub fn disable() -> Self {
        disable();
        Self { _priv: () }
    }
}

impl Drop for PreemptGuard {
    fn drop(&mut self) {
        enable();
    }
}

// ============================================================================
// 定时器
// ============================================================================

/// start 时保存的先前信号处理器与定时器配置，stop 时恢复
struct SavedTimer {
    action: libc::sigaction,
    timer: libc::itimerval,
}

static SAVED: Mutex<Option<SavedTimer>> = Mutex::new(None);

/// 定时器信号处理函数：转发给当前 OS 线程上活跃的调度器
extern "C" fn timer_handler(_sig: libc::c_int) {
    crate::scheduler::preempt_tick();
}

/// 安装信号处理器并按配置武装虚拟定时器
///
/// enabled 为 false 时不做任何事
pub(crate) fn start(config: &PreemptConfig) {
    if !config.enabled {
        return;
    }
    unsafe {
        let mut act: libc::sigaction = std::mem::zeroed();
        act.sa_sigaction = timer_handler as usize;
        libc::sigemptyset(&mut act.sa_mask);
        act.sa_flags = libc::SA_RESTART;
        let mut old_act: libc::sigaction = std::mem::zeroed();
        libc::sigaction(libc::SIGVTALRM, &act, &mut old_act);

        let interval = libc::timeval {
            tv_sec: (config.interval_us / 1_000_000) as libc::time_t,
            tv_usec: (config.interval_us % 1_000_000) as libc::suseconds_t,
        };
        let timer = libc::itimerval {
            it_interval: interval,
            it_value: interval,
        };
        let mut old_timer: libc::itimerval = std::mem::zeroed();
        libc::setitimer(libc::ITIMER_VIRTUAL, &timer, &mut old_timer);

        *SAVED.lock() = Some(SavedTimer {
            action: old_act,
            timer: old_timer,
        });
    }
}

/// 恢复 start 之前的定时器与信号处理器配置
pub(crate) fn stop() {
    if let Some(saved) = SAVED.lock().take() {
        unsafe {
            libc::setitimer(libc::ITIMER_VIRTUAL, &saved.timer, std::ptr::null_mut());
            libc::sigaction(libc::SIGVTALRM, &saved.action, std::ptr::null_mut());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_nesting() {
        assert_eq!(depth(), 0);
        {
            let _outer = PreemptGuard::disable();
            assert_eq!(depth(), 1);
            {
                let _inner = PreemptGuard::disable();
                assert_eq!(depth(), 2);
            }
            // 内层守卫析构后外层仍然生效
            assert_eq!(depth(), 1);
        }
        assert_eq!(depth(), 0);
    }

    #[test]
    fn test_depth_save_restore() {
        let _guard = PreemptGuard::disable();
        let saved = depth();
        restore(0);
        assert_eq!(depth(), 0);
        restore(saved);
        assert_eq!(depth(), saved);
    }

    #[test]
    fn test_config_default() {
        let config = PreemptConfig::default();
        assert!(config.enabled);
        assert_eq!(config.interval_us, 10_000);
    }
}

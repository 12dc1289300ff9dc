//! 线程栈管理
//!
//! 为每个用户级线程分配固定大小、16 字节对齐并清零的执行栈

use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// 栈分配失败错误
#[derive(Debug, Clone)]
pub struct StackAllocError;

impl std::fmt::Display for StackAllocError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stack allocation failed")
    }
}

impl std::error::Error for StackAllocError {}

/// 线程栈
///
/// 固定大小的堆分配，由持有它的线程控制块独占；释放随 Drop 进行
pub struct Stack {
    /// 栈底（低地址）
    base: NonNull<u8>,
    /// 已分配容量
    capacity: usize,
}

impl Stack {
    /// 默认栈大小：64KB
    pub const DEFAULT_SIZE: usize = 64 * 1024;
    /// 最小栈大小：16KB
    pub const MIN_SIZE: usize = 16 * 1024;
    /// 栈对齐：16 字节
    const ALIGNMENT: usize = 16;

    /// 分配指定大小的栈（不足最小值时向上取齐）
    pub fn new(capacity: usize) -> Result<Self, StackAllocError> {
        let capacity = capacity.max(Self::MIN_SIZE);
        let layout = Layout::from_size_align(capacity, Self::ALIGNMENT)
            .map_err(|_| StackAllocError)?;

        let base = unsafe {
            let ptr = alloc::alloc_zeroed(layout);
            if ptr.is_null() {
                return Err(StackAllocError);
            }
            NonNull::new_unchecked(ptr)
        };

        Ok(Self { base, capacity })
    }

    /// 获取栈底地址
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// 获取栈顶地址（高地址端）
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.capacity) }
    }

    /// 获取已分配容量
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        if let Ok(layout) = Layout::from_size_align(self.capacity, Self::ALIGNMENT) {
            unsafe {
                alloc::dealloc(self.base.as_ptr(), layout);
            }
        }
    }
}

// Stack 含原始指针，通过持有者（线程控制块）的使用纪律保证安全
unsafe impl Send for Stack {}

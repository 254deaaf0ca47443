//! 可睡眠互斥锁
//!
//! 基于 `lock_api::RawMutex` 实现。竞争时不关中断自旋，而是通过
//! [`ArchOps::yield_now`](crate::ArchOps::yield_now) 让出 CPU，
//! 因此持锁期间允许发生缺页、分配内存等可能阻塞的操作。

use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch_ops;

/// 可睡眠互斥锁的底层实现
pub struct RawSleepMutex {
    locked: AtomicBool,
}

impl RawSleepMutex {
    /// 创建一个新的 RawSleepMutex 实例。
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }
}

impl Default for RawSleepMutex {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl lock_api::RawMutex for RawSleepMutex {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();

    type GuardMarker = lock_api::GuardNoSend;

    fn lock(&self) {
        while !self.try_lock() {
            arch_ops().yield_now();
        }
    }

    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// 可睡眠互斥锁
pub type Mutex<T> = lock_api::Mutex<RawSleepMutex, T>;

/// [`Mutex`] 的 RAII 保护器
pub type MutexGuard<'a, T> = lock_api::MutexGuard<'a, RawSleepMutex, T>;

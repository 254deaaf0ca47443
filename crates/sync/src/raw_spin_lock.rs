//! 关中断自旋锁的底层实现
//!
//! 加锁前关闭本地中断，拿到锁后把进入前的中断状态存进锁里，解锁时取回并恢复。
//! 嵌套持有多把自旋锁时必须按加锁的逆序释放，否则会提前打开中断。

use core::hint;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arch_ops;

/// 关中断自旋锁
///
/// 持锁期间本地中断关闭，临界区内不能睡眠，也不能再去拿可睡眠的 [`Mutex`](crate::Mutex)。
pub struct RawSpinLock {
    locked: AtomicBool,
    saved_flags: AtomicUsize,
}

impl RawSpinLock {
    /// 创建一个未上锁的实例
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            saved_flags: AtomicUsize::new(0),
        }
    }

    fn acquire(&self) -> bool {
        self.locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl lock_api::RawMutex for RawSpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();

    type GuardMarker = lock_api::GuardNoSend;

    fn lock(&self) {
        // SAFETY: 状态字在解锁时原样恢复
        let flags = unsafe { arch_ops().read_and_disable_interrupts() };
        while !self.acquire() {
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
        self.saved_flags.store(flags, Ordering::Relaxed);
    }

    fn try_lock(&self) -> bool {
        // SAFETY: 失败时立即恢复
        let flags = unsafe { arch_ops().read_and_disable_interrupts() };
        let ok = self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok();
        if ok {
            self.saved_flags.store(flags, Ordering::Relaxed);
        } else {
            unsafe { arch_ops().restore_interrupts(flags) };
        }
        ok
    }

    unsafe fn unlock(&self) {
        let flags = self.saved_flags.load(Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        // SAFETY: flags 来自本次加锁时保存的状态字
        unsafe { arch_ops().restore_interrupts(flags) };
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

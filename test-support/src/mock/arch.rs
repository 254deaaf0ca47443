//! 中断控制与调度钩子的 Mock 实现
//!
//! 中断状态只有一个全局位，多个测试线程共享；只用于驱动锁的加解锁路径，不做断言。

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Mock 架构操作
pub struct MockArchOps {
    pub interrupt_state: AtomicBool,
    pub yields: AtomicUsize,
}

impl MockArchOps {
    pub const fn new() -> Self {
        Self {
            interrupt_state: AtomicBool::new(true),
            yields: AtomicUsize::new(0),
        }
    }

    pub unsafe fn read_and_disable_interrupts(&self) -> usize {
        self.interrupt_state.swap(false, Ordering::SeqCst) as usize
    }

    pub unsafe fn restore_interrupts(&self, flags: usize) {
        self.interrupt_state.store(flags != 0, Ordering::SeqCst);
    }

    pub fn yield_now(&self) {
        self.yields.fetch_add(1, Ordering::Relaxed);
        core::hint::spin_loop();
    }
}

/// 全局 Mock 实例
pub static MOCK_ARCH_OPS: MockArchOps = MockArchOps::new();

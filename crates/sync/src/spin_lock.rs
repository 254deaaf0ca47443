//! 自旋锁
//!
//! 物理页空闲链表、LRU 链表、文件映射页表、ASID 池和页表本身都用它保护。

use crate::raw_spin_lock::RawSpinLock;

/// 关中断自旋锁保护的数据
///
/// 不可重入；持锁时只做有界的短操作。
pub type SpinLock<T> = lock_api::Mutex<RawSpinLock, T>;

/// [`SpinLock`] 的 RAII 保护器，析构时解锁并恢复中断状态
pub type SpinLockGuard<'a, T> = lock_api::MutexGuard<'a, RawSpinLock, T>;

#[cfg(test)]
mod tests {
    extern crate std;

    use std::sync::Arc;
    use std::thread;
    use std::vec::Vec;

    use super::*;

    #[test]
    fn lock_gives_exclusive_access() {
        crate::test_setup();
        let lock = SpinLock::new(0usize);
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(lock.is_locked());
            assert!(lock.try_lock().is_none());
        }
        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn contended_counter() {
        crate::test_setup();
        let lock = Arc::new(SpinLock::new(0usize));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(*lock.lock(), 4000);
    }
}

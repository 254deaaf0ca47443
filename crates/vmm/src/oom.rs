//! 内存不足监控
//!
//! 空闲内存低于回收阈值时主动回收页缓存；回收后仍低于低水位时认为内存不足，
//! 交给登记的 [`OomKiller`] 选择并结束一个进程。

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use sync::SpinLock;

use crate::address::{PAGE_SIZE, bytes_to_pages};
use crate::error::{VmError, VmResult};
use crate::page_cache::PageCache;

/// 选择并结束一个进程的钩子，由进程管理层提供
pub trait OomKiller: Send + Sync {
    /// 结束一个进程，成功时返回 `true`
    fn kill_victim(&self) -> bool;
}

/// 一次检查的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OomStatus {
    /// 空闲内存充足
    Normal,
    /// 回收了若干页缓存后恢复正常
    Reclaimed(usize),
    /// 回收后仍低于低水位
    LowMemory {
        /// 是否结束了一个进程
        killed: bool,
    },
}

/// OOM 监控
pub struct OomMonitor {
    enabled: AtomicBool,
    low_mem_threshold: AtomicUsize,
    reclaim_mem_threshold: AtomicUsize,
    killer: SpinLock<Option<Arc<dyn OomKiller>>>,
}

impl OomMonitor {
    /// 以给定阈值（字节）创建，初始为启用状态
    pub fn new(low_mem_threshold: usize, reclaim_mem_threshold: usize) -> Self {
        Self {
            enabled: AtomicBool::new(true),
            low_mem_threshold: AtomicUsize::new(low_mem_threshold),
            reclaim_mem_threshold: AtomicUsize::new(reclaim_mem_threshold.max(low_mem_threshold)),
            killer: SpinLock::new(None),
        }
    }

    /// 启用
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    /// 停用
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    /// 是否启用
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// 低水位（字节）
    pub fn low_mem_threshold(&self) -> usize {
        self.low_mem_threshold.load(Ordering::Relaxed)
    }

    /// 回收阈值（字节）
    pub fn reclaim_mem_threshold(&self) -> usize {
        self.reclaim_mem_threshold.load(Ordering::Relaxed)
    }

    /// 设置低水位，不能高于回收阈值
    pub fn set_low_mem_threshold(&self, bytes: usize) -> VmResult<()> {
        if bytes > self.reclaim_mem_threshold() {
            return Err(VmError::InvalidArgs);
        }
        self.low_mem_threshold.store(bytes, Ordering::Relaxed);
        Ok(())
    }

    /// 设置回收阈值，不能低于低水位
    pub fn set_reclaim_mem_threshold(&self, bytes: usize) -> VmResult<()> {
        if bytes < self.low_mem_threshold() {
            return Err(VmError::InvalidArgs);
        }
        self.reclaim_mem_threshold.store(bytes, Ordering::Relaxed);
        Ok(())
    }

    /// 登记结束进程的钩子
    pub fn set_killer(&self, killer: Arc<dyn OomKiller>) {
        *self.killer.lock() = Some(killer);
    }

    /// 检查空闲内存，必要时回收页缓存或结束进程
    pub fn check(&self, cache: &PageCache) -> OomStatus {
        if !self.is_enabled() {
            return OomStatus::Normal;
        }
        let free_bytes = || cache.phys().free_pages() * PAGE_SIZE;
        let reclaim_at = self.reclaim_mem_threshold();

        let mut reclaimed = 0;
        let mut free = free_bytes();
        while free < reclaim_at {
            let n = cache.try_shrink(bytes_to_pages(reclaim_at - free));
            if n == 0 {
                break;
            }
            reclaimed += n;
            free = free_bytes();
        }

        if free < self.low_mem_threshold() {
            let killer = self.killer.lock().clone();
            let killed = killer.is_some_and(|k| k.kill_victim());
            log::warn!(
                "oom: free {:#x} below low-water {:#x} after reclaiming {} pages, killed={}",
                free,
                self.low_mem_threshold(),
                reclaimed,
                killed
            );
            return OomStatus::LowMemory { killed };
        }
        if reclaimed != 0 {
            log::debug!("oom: reclaimed {} pages, free {:#x}", reclaimed, free);
            return OomStatus::Reclaimed(reclaimed);
        }
        OomStatus::Normal
    }

    /// 打印当前状态
    pub fn dump(&self, cache: &PageCache) {
        let (active, inactive) = cache.lru_counts();
        log::info!(
            "oom: enabled={} low={:#x} reclaim={:#x} free={:#x} cache active={} inactive={}",
            self.is_enabled(),
            self.low_mem_threshold(),
            self.reclaim_mem_threshold(),
            cache.phys().free_pages() * PAGE_SIZE,
            active,
            inactive
        );
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use core::sync::atomic::AtomicUsize;

    use test_support::mock::fs::MockFileData;

    use super::*;
    use crate::config::DEFAULT_SHRINK_SCAN;
    use crate::test_utils::test_phys;

    struct CountingKiller(AtomicUsize);

    impl OomKiller for CountingKiller {
        fn kill_victim(&self) -> bool {
            self.0.fetch_add(1, Ordering::Relaxed);
            true
        }
    }

    #[test]
    fn thresholds_stay_ordered() {
        let oom = OomMonitor::new(0x1000, 0x4000);
        assert_eq!(oom.set_low_mem_threshold(0x8000), Err(VmError::InvalidArgs));
        assert_eq!(oom.set_reclaim_mem_threshold(0x800), Err(VmError::InvalidArgs));
        oom.set_reclaim_mem_threshold(0x10000).unwrap();
        oom.set_low_mem_threshold(0x8000).unwrap();
        assert_eq!((oom.low_mem_threshold(), oom.reclaim_mem_threshold()), (0x8000, 0x10000));
    }

    #[test]
    fn plenty_of_memory_is_normal() {
        let (_ram, phys) = test_phys(32);
        let cache = PageCache::new(phys, DEFAULT_SHRINK_SCAN);
        let oom = OomMonitor::new(PAGE_SIZE, 2 * PAGE_SIZE);
        assert_eq!(oom.check(&cache), OomStatus::Normal);
    }

    #[test]
    fn reclaims_cache_below_threshold() {
        let (_ram, phys) = test_phys(16);
        let cache = PageCache::new(phys.clone(), DEFAULT_SHRINK_SCAN);
        let data: Vec<u8> = (0..14 * PAGE_SIZE).map(|i| i as u8).collect();
        let mapping = cache.mapping_for(Arc::new(MockFileData::new(1, &data)));
        for pgoff in 0..14 {
            cache.alloc(&mapping, pgoff).unwrap();
        }
        assert_eq!(phys.free_pages(), 2);

        let oom = OomMonitor::new(PAGE_SIZE, 6 * PAGE_SIZE);
        assert_eq!(oom.check(&cache), OomStatus::Reclaimed(4));
        assert_eq!(phys.free_pages(), 6);

        oom.disable();
        oom.set_reclaim_mem_threshold(12 * PAGE_SIZE).unwrap();
        assert_eq!(oom.check(&cache), OomStatus::Normal);
        assert_eq!(phys.free_pages(), 6);
    }

    #[test]
    fn low_memory_asks_killer() {
        let (_ram, phys) = test_phys(8);
        let cache = PageCache::new(phys.clone(), DEFAULT_SHRINK_SCAN);
        let held = phys.alloc_pages(7).unwrap();
        let oom = OomMonitor::new(4 * PAGE_SIZE, 4 * PAGE_SIZE);
        assert_eq!(oom.check(&cache), OomStatus::LowMemory { killed: false });

        let killer = Arc::new(CountingKiller(AtomicUsize::new(0)));
        oom.set_killer(killer.clone());
        assert_eq!(oom.check(&cache), OomStatus::LowMemory { killed: true });
        assert_eq!(killer.0.load(Ordering::Relaxed), 1);
        for page in held {
            phys.put_page(page);
        }
    }
}

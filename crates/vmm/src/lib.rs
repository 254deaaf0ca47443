//! 虚拟内存管理子系统
//!
//! 面向 ARMv6/v7 短描述符页表的 VMM：伙伴物理页分配、页表管理、地址空间与区域、
//! 缺页处理、文件页缓存与回收，以及 mmap 一族系统调用。
//!
//! # 架构解耦
//!
//! 通过 trait 与架构、文件系统和进程管理解耦：
//! - [`ArchMmOps`]: 物理地址转换、TLB 与 TTBR 操作
//! - [`MmInode`] / [`MmFile`] / [`VmFileOps`]: 文件与设备映射
//! - [`OomKiller`]: 内存不足时结束进程
//!
//! 使用前必须调用 [`register_arch_ops`] 注册架构操作，再用 [`VmSubsystem::new`] 构造子系统。

#![no_std]

extern crate alloc;

mod arch_ops;
mod asid;
mod config;
mod error;
mod file;

pub mod address;
pub mod arch;
pub mod fault;
pub mod oom;
pub mod page_cache;
pub mod phys;
pub mod region;
pub mod space;
pub mod syscall;

#[cfg(test)]
mod test_utils;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicPtr, Ordering};

pub use address::{AlignOps, PAGE_SIZE, SECTION_SIZE};
pub use arch::{ArchMmu, MmuFlags};
pub use arch_ops::{ArchMmOps, TlbBatch, arch_ops, register_arch_ops};
pub use asid::{Asid, KERNEL_ASID, NR_ASIDS, alloc_asid, free_asid};
pub use config::{DEFAULT_SHRINK_SCAN, MAX_ORDER, NR_ORDERS, VmConfig};
pub use error::{VmError, VmResult};
pub use fault::{FaultFlags, FaultFrame, apply_fixup, register_fixup, search_fixup};
pub use file::{MmFile, MmInode, VmFault, VmFileOps};
pub use oom::{OomKiller, OomMonitor, OomStatus};
pub use page_cache::{FileMapping, FilePage, PageCache};
pub use phys::{PageFlags, PageId, PhysAllocator};
pub use region::{Region, RegionBacking, RegionFlags};
pub use space::{Placement, VmSpace};

/// 整个虚拟内存子系统
///
/// 按依赖顺序持有物理页分配器、页缓存和内核地址空间；析构顺序与构造相反。
pub struct VmSubsystem {
    kernel: VmSpace,
    cache: Arc<PageCache>,
    phys: Arc<PhysAllocator>,
    oom: OomMonitor,
    config: VmConfig,
}

impl VmSubsystem {
    /// 用给定配置和物理内存段 `(起始地址, 字节数)` 构造子系统
    pub fn new(config: VmConfig, ranges: &[(usize, usize)]) -> VmResult<Self> {
        config.validate()?;
        let phys = Arc::new(PhysAllocator::new(ranges)?);
        let cache = Arc::new(PageCache::new(phys.clone(), config.shrink_scan));
        let kernel = VmSpace::new_kernel(cache.clone(), &config)?;
        let oom = OomMonitor::new(config.oom_low_mem_threshold, config.oom_reclaim_mem_threshold);
        log::info!(
            "vmm: {} pages managed, kernel {:#x}+{:#x}, user {:#x}+{:#x}",
            phys.total_pages(),
            config.kernel_base,
            config.kernel_size,
            config.user_base,
            config.user_size
        );
        Ok(Self {
            kernel,
            cache,
            phys,
            oom,
            config,
        })
    }

    /// 配置
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// 物理页分配器
    pub fn phys(&self) -> &Arc<PhysAllocator> {
        &self.phys
    }

    /// 页缓存
    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    /// 内核地址空间
    pub fn kernel_space(&self) -> &VmSpace {
        &self.kernel
    }

    /// OOM 监控
    pub fn oom(&self) -> &OomMonitor {
        &self.oom
    }

    /// 为新进程创建用户地址空间
    pub fn create_user_space(&self) -> VmResult<VmSpace> {
        VmSpace::new_user(self.cache.clone(), &self.config)
    }

    /// 在 vmalloc 区分配 `size` 字节虚拟连续、物理不连续的内核内存
    pub fn vmalloc(&self, size: usize) -> VmResult<usize> {
        let len = size.page_ceil().filter(|&l| l != 0).ok_or(VmError::InvalidArgs)?;
        let count = len / PAGE_SIZE;
        let pages = match self.phys.alloc_pages(count) {
            Err(VmError::NoMemory) if self.cache.try_shrink(count) != 0 => self.phys.alloc_pages(count)?,
            r => r?,
        };

        let space = &self.kernel;
        let mut inner = space.inner.lock();
        let flags = RegionFlags::READ | RegionFlags::WRITE | RegionFlags::VMALLOC;
        let region = match space.alloc_region_locked(
            &mut inner,
            Placement::Any,
            len,
            flags,
            0,
            RegionBacking::Anonymous,
        ) {
            Ok(r) => r,
            Err(e) => {
                pages.iter().for_each(|&p| {
                    self.phys.put_page(p);
                });
                return Err(e);
            }
        };

        for (i, &page) in pages.iter().enumerate() {
            let va = region.base() + i * PAGE_SIZE;
            if let Err(e) = space.mmu.map(va, self.phys.page_to_paddr(page), 1, region.mmu_flags()) {
                log::warn!("vmalloc: mapping {:#x} failed: {}", va, e);
                space.remove_range_locked(&mut inner, region.base(), len);
                pages[i..].iter().for_each(|&p| {
                    self.phys.put_page(p);
                });
                return Err(e);
            }
        }
        log::debug!("vmalloc: {:#x}+{:#x}", region.base(), len);
        Ok(region.base())
    }

    /// 释放 [`vmalloc`](Self::vmalloc) 得到的内存
    pub fn vfree(&self, addr: usize) -> VmResult<()> {
        let region = self
            .kernel
            .find(addr)
            .filter(|r| r.base() == addr && r.flags().contains(RegionFlags::VMALLOC))
            .ok_or(VmError::InvalidArgs)?;
        self.kernel.free_region(&region)
    }

    /// 陷入层的缺页入口
    ///
    /// 内核地址在内核地址空间中处理，其余地址在 `current` 中处理。
    /// 内核态缺页无法解决时查异常修复表，命中则改写返回地址并视为已处理。
    pub fn handle_trap_fault(
        &self,
        current: Option<&VmSpace>,
        vaddr: usize,
        flags: FaultFlags,
        frame: &mut dyn FaultFrame,
    ) -> VmResult<()> {
        let space = if self.config.is_kernel_addr(vaddr) {
            Some(&self.kernel)
        } else {
            current
        };
        let result = space.map_or(Err(VmError::NotFound), |s| s.handle_fault(vaddr, flags));
        match result {
            Err(_) if !flags.contains(FaultFlags::USER) && apply_fixup(frame) => Ok(()),
            Err(e) => {
                log::warn!(
                    "vmm: unresolved {} fault at {:#x} pc {:#x}: {}",
                    if flags.contains(FaultFlags::USER) { "user" } else { "kernel" },
                    vaddr,
                    frame.pc(),
                    e
                );
                Err(e)
            }
            ok => ok,
        }
    }

    /// `vaddr` 在 `space` 中映射到的物理地址
    pub fn paddr_query(&self, space: &VmSpace, vaddr: usize) -> Option<usize> {
        space.query(vaddr).ok().map(|(paddr, _)| paddr)
    }

    /// 运行一次 OOM 检查
    pub fn check_oom(&self) -> OomStatus {
        self.oom.check(&self.cache)
    }

    /// 打印物理内存、页缓存和 OOM 状态
    pub fn dump(&self) {
        self.phys.dump();
        self.oom.dump(&self.cache);
        self.kernel.dump();
    }
}

impl core::fmt::Debug for VmSubsystem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmSubsystem")
            .field("total_pages", &self.phys.total_pages())
            .field("free_pages", &self.phys.free_pages())
            .field("cached_pages", &self.cache.nr_pages())
            .finish()
    }
}

static VM_SUBSYSTEM: AtomicPtr<VmSubsystem> = AtomicPtr::new(core::ptr::null_mut());

/// 发布已构造好的子系统，供陷入入口等全局路径使用
pub fn register_vm_subsystem(vm: &'static VmSubsystem) {
    VM_SUBSYSTEM.store(vm as *const VmSubsystem as *mut VmSubsystem, Ordering::Release);
}

/// 已发布的子系统
pub fn vm_subsystem() -> Option<&'static VmSubsystem> {
    let ptr = VM_SUBSYSTEM.load(Ordering::Acquire);
    // SAFETY: 只会存入 'static 引用
    unsafe { ptr.as_ref() }
}

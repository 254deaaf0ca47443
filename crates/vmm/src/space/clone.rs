//! fork 时复制地址空间
//!
//! 复制全部区域描述，已映射的页按后备类型共享给子空间：
//! 私有页双方都改为只读并增加引用计数，留给写缺页做写时复制；
//! 共享页和页缓存页按原权限映射，缓存页另外登记一条反向映射。

use alloc::collections::BTreeMap;

use super::{SpaceInner, VmSpace};
use crate::address::{AlignOps, PAGE_SIZE};
use crate::arch::{ArchMmu, MmuFlags};
use crate::error::{VmError, VmResult};
use crate::region::{Region, RegionBacking};

impl VmSpace {
    /// 复制出一个新的地址空间（fork）
    ///
    /// 中途失败时新空间被整体销毁，返回 `NoMemory`。
    pub fn clone_space(&self) -> VmResult<VmSpace> {
        let inner = self.inner.lock();
        let mmu = ArchMmu::new(self.cache.phys().clone())?;
        let child = VmSpace::with_mmu(
            mmu,
            self.cache.clone(),
            self.base(),
            self.size(),
            SpaceInner {
                regions: BTreeMap::new(),
                heap_base: inner.heap_base,
                brk: inner.brk,
                map_base: inner.map_base,
                map_end: inner.map_end,
            },
        );

        for region in inner.regions.values() {
            child.inner.lock().regions.insert(region.base(), region.clone());
            for va in (region.base()..region.end()).step_by(PAGE_SIZE) {
                let Ok((paddr, flags)) = self.mmu.query(va) else {
                    continue;
                };
                if let Err(e) = self.clone_page(&child, region, va, paddr.page_floor(), flags) {
                    log::warn!("space {}: fork failed at {:#x}: {}", self.asid(), va, e);
                    drop(child);
                    return Err(VmError::NoMemory);
                }
            }
        }
        log::debug!(
            "space {}: forked into {} with {} regions",
            self.asid(),
            child.asid(),
            inner.regions.len()
        );
        Ok(child)
    }

    fn clone_page(&self, child: &VmSpace, region: &Region, va: usize, paddr: usize, flags: MmuFlags) -> VmResult<()> {
        match region.backing() {
            RegionBacking::Device(_) => return child.mmu.map(va, paddr, 1, flags).map(|_| ()),
            RegionBacking::File(mapping) => {
                if self
                    .cache
                    .share_page(mapping, region.pgoff_of(va), &self.mmu, &child.mmu, va, flags)?
                {
                    return Ok(());
                }
            }
            RegionBacking::Anonymous => {}
        }

        let phys = self.cache.phys();
        let Some(page) = phys.paddr_to_page(paddr) else {
            return child.mmu.map(va, paddr, 1, flags).map(|_| ());
        };
        let child_flags = if region.is_shared() {
            flags
        } else {
            flags - MmuFlags::PERM_WRITE
        };
        phys.get_page(page);
        if let Err(e) = child.mmu.map(va, paddr, 1, child_flags) {
            phys.put_page(page);
            return Err(e);
        }
        if child_flags != flags {
            self.mmu.change_protection(va, 1, child_flags)?;
        }
        Ok(())
    }
}

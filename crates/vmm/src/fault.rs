//! 缺页处理
//!
//! 入口是 [`VmSpace::handle_fault`]：按区域后备类型分派到匿名页、文件页或设备页的处理。
//! 整个处理过程持有地址空间的区域锁，与 `munmap`/`mprotect` 互斥。
//!
//! 内核态访问用户内存的辅助函数可能合法地触发无法解决的缺页，这些代码段登记在
//! 异常修复表中，陷入层通过 [`search_fixup`] 把返回地址改到修复入口。

use alloc::vec::Vec;

use bitflags::bitflags;
use lazy_static::lazy_static;
use sync::SpinLock;

use crate::address::AlignOps;
use crate::arch::MmuFlags;
use crate::error::{VmError, VmResult};
use crate::file::{VmFault, VmFileOps};
use crate::page_cache::FileMapping;
use crate::region::{Region, RegionBacking};
use crate::space::VmSpace;

bitflags! {
    /// 缺页访问类型
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultFlags: u32 {
        /// 读访问
        const READ = 1 << 0;
        /// 写访问
        const WRITE = 1 << 1;
        /// 取指
        const EXECUTE = 1 << 2;
        /// 用户态发生
        const USER = 1 << 3;
        /// 页表中没有该地址的映射
        const NOT_PRESENT = 1 << 4;
    }
}

impl VmSpace {
    /// 处理 `vaddr` 处的缺页
    ///
    /// 没有区域覆盖该地址返回 `NotFound`，区域权限不允许这种访问返回 `AccessDenied`。
    pub fn handle_fault(&self, vaddr: usize, flags: FaultFlags) -> VmResult<()> {
        let inner = self.inner.lock();
        let Some(region) = inner.find(vaddr) else {
            log::debug!("fault: no region at {:#x} ({:?})", vaddr, flags);
            return Err(VmError::NotFound);
        };
        if !region.permits(flags) {
            log::debug!(
                "fault: {:?} denied at {:#x} in region {:#x}..{:#x} {:?}",
                flags,
                vaddr,
                region.base(),
                region.end(),
                region.flags()
            );
            return Err(VmError::AccessDenied);
        }

        let va = vaddr.page_floor();
        let present = self.mmu.query(va).ok();
        let result = match region.backing() {
            RegionBacking::Anonymous => self.fault_anonymous(region, va, present, flags),
            RegionBacking::File(mapping) => self.fault_file(region, mapping, va, present, flags),
            RegionBacking::Device(ops) => self.fault_device(region, ops.as_ref(), va, present, flags),
        };
        if let Err(e) = result {
            log::warn!("fault: {:?} at {:#x} failed: {}", flags, vaddr, e);
        }
        result
    }

    fn fault_anonymous(
        &self,
        region: &Region,
        va: usize,
        present: Option<(usize, MmuFlags)>,
        flags: FaultFlags,
    ) -> VmResult<()> {
        let mmu_flags = region.mmu_flags();
        match present {
            None => {
                let page = self.cache.alloc_page()?;
                let phys = self.cache.phys();
                if let Err(e) = self.mmu.map(va, phys.page_to_paddr(page), 1, mmu_flags) {
                    phys.put_page(page);
                    return Err(e);
                }
                Ok(())
            }
            Some((paddr, cur)) if flags.contains(FaultFlags::WRITE) && !cur.contains(MmuFlags::PERM_WRITE) => {
                // 共享匿名页在各地址空间之间始终是同一物理页
                if region.is_shared() {
                    return self.mmu.change_protection(va, 1, mmu_flags);
                }
                self.break_cow(va, paddr, mmu_flags)
            }
            Some(_) => Ok(()),
        }
    }

    /// 写入只读映射的私有页：独占时原地升级权限，否则复制一份
    fn break_cow(&self, va: usize, paddr: usize, mmu_flags: MmuFlags) -> VmResult<()> {
        let phys = self.cache.phys();
        let Some(old) = phys.paddr_to_page(paddr.page_floor()) else {
            return self.mmu.change_protection(va, 1, mmu_flags);
        };
        if phys.page(old).refcount() == 1 {
            return self.mmu.change_protection(va, 1, mmu_flags);
        }

        let new = self.cache.alloc_page()?;
        phys.copy_page(new, old);
        self.mmu.unmap(va, 1)?;
        if let Err(e) = self.mmu.map(va, phys.page_to_paddr(new), 1, mmu_flags) {
            phys.put_page(new);
            return Err(e);
        }
        phys.put_page(old);
        log::trace!("fault: copied shared page at {:#x}", va);
        Ok(())
    }

    fn fault_file(
        &self,
        region: &Region,
        mapping: &alloc::sync::Arc<FileMapping>,
        va: usize,
        present: Option<(usize, MmuFlags)>,
        flags: FaultFlags,
    ) -> VmResult<()> {
        let pgoff = region.pgoff_of(va);
        let mmu_flags = region.mmu_flags();

        if !flags.contains(FaultFlags::WRITE) {
            if present.is_some() {
                return Ok(());
            }
            return self.cache.map_read(mapping, pgoff, &self.mmu, va, mmu_flags);
        }
        if present.is_some_and(|(_, cur)| cur.contains(MmuFlags::PERM_WRITE)) {
            return Ok(());
        }
        if region.is_shared() {
            return self.cache.map_shared_write(mapping, pgoff, &self.mmu, va, mmu_flags);
        }

        // 私有写：已有的只读映射若不是缓存页本身，说明是 fork 后共享的私有副本
        if let Some((paddr, _)) = present {
            if !self.cache.is_mapped_at(mapping, pgoff, &self.mmu, va) {
                return self.break_cow(va, paddr, mmu_flags);
            }
        }
        let page = self.cache.cow_page(mapping, pgoff, &self.mmu, va)?;
        let phys = self.cache.phys();
        if let Err(e) = self.mmu.map(va, phys.page_to_paddr(page), 1, mmu_flags) {
            phys.put_page(page);
            return Err(e);
        }
        Ok(())
    }

    fn fault_device(
        &self,
        region: &Region,
        ops: &dyn VmFileOps,
        va: usize,
        present: Option<(usize, MmuFlags)>,
        flags: FaultFlags,
    ) -> VmResult<()> {
        if present.is_some() {
            return Ok(());
        }
        let mut vmf = VmFault {
            vaddr: va,
            pgoff: region.pgoff_of(va),
            flags,
            paddr: None,
        };
        ops.fault(region, &mut vmf)?;
        let paddr = vmf.paddr.ok_or(VmError::NotFound)?;
        if !paddr.is_aligned(crate::address::PAGE_SIZE) {
            return Err(VmError::InvalidArgs);
        }
        self.mmu.map(va, paddr, 1, region.mmu_flags()).map(|_| ())
    }
}

/// 异常修复表项：`[start, end)` 内的指令缺页时跳转到 `fixup`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixupEntry {
    /// 起始指令地址
    pub start: usize,
    /// 结束指令地址（不含）
    pub end: usize,
    /// 修复入口
    pub fixup: usize,
}

lazy_static! {
    static ref FIXUP_TABLE: SpinLock<Vec<FixupEntry>> = SpinLock::new(Vec::new());
}

/// 登记一段可以合法缺页的代码
pub fn register_fixup(start: usize, end: usize, fixup: usize) -> VmResult<()> {
    if start >= end {
        return Err(VmError::InvalidArgs);
    }
    let mut table = FIXUP_TABLE.lock();
    if table.iter().any(|e| e.start < end && start < e.end) {
        return Err(VmError::AlreadyExists);
    }
    let pos = table.partition_point(|e| e.start < start);
    table.insert(pos, FixupEntry { start, end, fixup });
    Ok(())
}

/// 查找 `pc` 所在代码段的修复入口
pub fn search_fixup(pc: usize) -> Option<usize> {
    let table = FIXUP_TABLE.lock();
    let pos = table.partition_point(|e| e.start <= pc);
    let entry = table[..pos].last()?;
    (pc < entry.end).then_some(entry.fixup)
}

/// 陷入层保存的寄存器现场
pub trait FaultFrame {
    /// 发生异常的指令地址
    fn pc(&self) -> usize;

    /// 修改返回地址
    fn set_pc(&mut self, pc: usize);
}

/// 若异常指令位于修复表登记的代码段中，把返回地址改到修复入口
pub fn apply_fixup(frame: &mut dyn FaultFrame) -> bool {
    match search_fixup(frame.pc()) {
        Some(fixup) => {
            log::debug!("fault: fixup {:#x} -> {:#x}", frame.pc(), fixup);
            frame.set_pc(fixup);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Frame(usize);

    impl FaultFrame for Frame {
        fn pc(&self) -> usize {
            self.0
        }

        fn set_pc(&mut self, pc: usize) {
            self.0 = pc;
        }
    }

    #[test]
    fn fixup_lookup_by_range() {
        register_fixup(0x9000_1000, 0x9000_1100, 0x9000_2000).unwrap();
        register_fixup(0x9000_0100, 0x9000_0200, 0x9000_3000).unwrap();

        assert_eq!(search_fixup(0x9000_1000), Some(0x9000_2000));
        assert_eq!(search_fixup(0x9000_10fc), Some(0x9000_2000));
        assert_eq!(search_fixup(0x9000_1100), None);
        assert_eq!(search_fixup(0x9000_0180), Some(0x9000_3000));
        assert_eq!(search_fixup(0x9000_0500), None);
    }

    #[test]
    fn fixup_rejects_bad_ranges() {
        assert_eq!(register_fixup(0x9100_0000, 0x9100_0000, 0), Err(VmError::InvalidArgs));
        register_fixup(0x9100_1000, 0x9100_2000, 0x9100_f000).unwrap();
        assert_eq!(
            register_fixup(0x9100_1800, 0x9100_2800, 0x9100_f000),
            Err(VmError::AlreadyExists)
        );
    }

    #[test]
    fn apply_fixup_rewrites_pc() {
        register_fixup(0x9200_0000, 0x9200_0040, 0x9200_1000).unwrap();
        let mut frame = Frame(0x9200_0010);
        assert!(apply_fixup(&mut frame));
        assert_eq!(frame.pc(), 0x9200_1000);

        let mut frame = Frame(0x9200_0040);
        assert!(!apply_fixup(&mut frame));
        assert_eq!(frame.pc(), 0x9200_0040);
    }
}

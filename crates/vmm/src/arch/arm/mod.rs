//! ARMv6/v7 短描述符页表
//!
//! 每个地址空间拥有一张 16 KiB 的一级表（4096 项，每项覆盖 1 MiB）。
//! 一级表项可以是段映射，也可以指向一张 1 KiB 的二级表（256 项，每项 4 KiB）。
//!
//! 二级表以页为单位向伙伴系统申请：一页容纳 4 张二级表，由一组对齐的
//! 4 个相邻一级表项共享。只有当这 4 个一级表项都不再指向二级表时才归还该页。
//!
//! VA 与 PA 同时 1 MiB 对齐、且剩余页数不少于 256 时使用段映射，否则使用小页。
//! 对段映射的一部分做解除映射或修改权限时，先把段拆分为一张二级表。

mod pte;

pub use pte::MmuFlags;

use alloc::sync::Arc;
use alloc::vec::Vec;

use pte::{
    L1_TYPE_INVALID, L1_TYPE_PAGE_TABLE, L1_TYPE_SECTION, l1_page_table, l1_page_table_ns,
    l1_page_table_paddr, l1_section, l1_section_flags, l1_section_paddr, l1_type, l2_flags,
    l2_is_valid, l2_paddr, l2_small,
};
use sync::SpinLock;

use crate::address::{
    AlignOps, PAGE_SIZE, PAGES_PER_SECTION, SECTION_SHIFT, SECTION_SIZE, l1_index, l2_index,
};
use crate::arch_ops::{TlbBatch, arch_ops, phys_ptr};
use crate::asid::{Asid, KERNEL_ASID, alloc_asid, free_asid};
use crate::error::{VmError, VmResult};
use crate::phys::{PageFlags, PageId, PhysAllocator};

/// 一级表项数
pub const L1_ENTRIES: usize = 4096;
/// 二级表项数
pub const L2_ENTRIES: usize = 256;
/// 二级表大小（字节）
const L2_TABLE_SIZE: usize = L2_ENTRIES * 4;
/// 共享一页的二级表数量
const L2_TABLES_PER_PAGE: usize = PAGE_SIZE / L2_TABLE_SIZE;
/// 一级表占用的页阶（4 页，16 KiB）
const L1_TABLE_ORDER: usize = 2;

struct MmuState {
    l2_pages: usize,
}

/// 一个地址空间的硬件页表
///
/// 所有修改都在内部自旋锁下完成，修改后的 TLB 失效按批提交。
pub struct ArchMmu {
    asid: Asid,
    ttb: usize,
    l1_head: PageId,
    phys: Arc<PhysAllocator>,
    state: SpinLock<MmuState>,
}

impl ArchMmu {
    /// 为用户地址空间创建页表，并分配一个新的 ASID
    pub fn new(phys: Arc<PhysAllocator>) -> VmResult<Self> {
        let asid = alloc_asid()?;
        match Self::with_asid(phys, asid) {
            Ok(mmu) => Ok(mmu),
            Err(e) => {
                free_asid(asid);
                Err(e)
            }
        }
    }

    /// 为内核地址空间创建页表（ASID 0）
    pub fn new_kernel(phys: Arc<PhysAllocator>) -> VmResult<Self> {
        Self::with_asid(phys, KERNEL_ASID)
    }

    fn with_asid(phys: Arc<PhysAllocator>, asid: Asid) -> VmResult<Self> {
        let l1_head = phys.alloc(L1_TABLE_ORDER)?;
        let ttb = phys.page_to_paddr(l1_head);
        for i in 0..(1 << L1_TABLE_ORDER) {
            let page = PageId(l1_head.0 + i);
            phys.zero_page(page);
            phys.page(page).set(PageFlags::PGTABLE);
        }
        log::debug!("mmu: new table at {:#x} asid {}", ttb, asid);
        Ok(Self {
            asid,
            ttb,
            l1_head,
            phys,
            state: SpinLock::new(MmuState { l2_pages: 0 }),
        })
    }

    /// 地址空间标识
    pub fn asid(&self) -> Asid {
        self.asid
    }

    /// 一级表的物理地址（写入 TTBR0 的值）
    pub fn ttb(&self) -> usize {
        self.ttb
    }

    /// 当前持有的二级表页数
    pub fn table_pages(&self) -> usize {
        self.state.lock().l2_pages
    }

    /// 切换到本地址空间
    pub fn context_switch(&self) {
        let ops = arch_ops();
        ops.barrier();
        ops.switch_ttbr(self.ttb, self.asid);
        ops.barrier();
    }

    /// 将 `[vaddr, vaddr + count 页)` 映射到从 `paddr` 开始的物理内存
    ///
    /// 目标范围内已有映射时返回 [`VmError::AlreadyExists`]，本次调用已建立的映射会被撤销。
    /// 返回建立映射的页数。
    pub fn map(&self, vaddr: usize, paddr: usize, count: usize, flags: MmuFlags) -> VmResult<usize> {
        check_range(vaddr, count)?;
        if !paddr.is_page_aligned() || (paddr as u64) + (count as u64) * (PAGE_SIZE as u64) > 1 << 32 {
            return Err(VmError::InvalidArgs);
        }
        let mut st = self.state.lock();
        let mut batch = TlbBatch::new(self.asid);
        let mut mapped = 0;
        if let Err(e) = self.map_locked(&mut st, vaddr, paddr, count, flags, &mut mapped) {
            if mapped != 0 {
                let _ = self.unmap_locked(&mut st, &mut batch, vaddr, mapped);
            }
            return Err(e);
        }
        arch_ops().barrier();
        Ok(mapped)
    }

    fn map_locked(
        &self,
        st: &mut MmuState,
        vaddr: usize,
        paddr: usize,
        count: usize,
        flags: MmuFlags,
        mapped: &mut usize,
    ) -> VmResult<()> {
        while *mapped < count {
            let va = vaddr + *mapped * PAGE_SIZE;
            let pa = paddr + *mapped * PAGE_SIZE;
            let l1i = l1_index(va);
            let desc = self.read_l1(l1i);

            if va.is_section_aligned()
                && pa.is_section_aligned()
                && count - *mapped >= PAGES_PER_SECTION
            {
                if l1_type(desc) != L1_TYPE_INVALID {
                    return Err(VmError::AlreadyExists);
                }
                self.write_l1(l1i, l1_section(pa, flags));
                *mapped += PAGES_PER_SECTION;
                continue;
            }

            let table = match l1_type(desc) {
                L1_TYPE_INVALID => {
                    let table = self.alloc_l2_table(st, l1i)?;
                    self.write_l1(l1i, l1_page_table(table, flags));
                    table
                }
                L1_TYPE_PAGE_TABLE => l1_page_table_paddr(desc),
                _ => crate::vm_fatal!(
                    "mmu: page mapping at {:#x} hits l1 entry {:#010x}",
                    va,
                    desc
                ),
            };
            let mut l2i = l2_index(va);
            while l2i < L2_ENTRIES && *mapped < count {
                if l2_is_valid(read_l2(table, l2i)) {
                    return Err(VmError::AlreadyExists);
                }
                write_l2(table, l2i, l2_small(paddr + *mapped * PAGE_SIZE, flags));
                *mapped += 1;
                l2i += 1;
            }
        }
        Ok(())
    }

    /// 解除 `[vaddr, vaddr + count 页)` 的映射，未映射的页直接跳过
    ///
    /// 返回实际解除映射的页数。只有拆分段映射需要分配二级表时才会失败。
    pub fn unmap(&self, vaddr: usize, count: usize) -> VmResult<usize> {
        check_range(vaddr, count)?;
        let mut st = self.state.lock();
        let mut batch = TlbBatch::new(self.asid);
        self.unmap_locked(&mut st, &mut batch, vaddr, count)
    }

    fn unmap_locked(
        &self,
        st: &mut MmuState,
        batch: &mut TlbBatch,
        vaddr: usize,
        count: usize,
    ) -> VmResult<usize> {
        let mut done = 0;
        let mut unmapped = 0;
        while done < count {
            let va = vaddr + done * PAGE_SIZE;
            let l1i = l1_index(va);
            let desc = self.read_l1(l1i);
            match l1_type(desc) {
                L1_TYPE_SECTION => {
                    if va.is_section_aligned() && count - done >= PAGES_PER_SECTION {
                        self.write_l1(l1i, 0);
                        batch.add(va);
                        done += PAGES_PER_SECTION;
                        unmapped += PAGES_PER_SECTION;
                    } else {
                        self.split_section(st, batch, l1i)?;
                    }
                }
                L1_TYPE_PAGE_TABLE => {
                    let table = l1_page_table_paddr(desc);
                    let mut l2i = l2_index(va);
                    while l2i < L2_ENTRIES && done < count {
                        if l2_is_valid(read_l2(table, l2i)) {
                            write_l2(table, l2i, 0);
                            batch.add(vaddr + done * PAGE_SIZE);
                            unmapped += 1;
                        }
                        l2i += 1;
                        done += 1;
                    }
                    self.release_l2_if_empty(st, l1i, table);
                }
                _ => done += (PAGES_PER_SECTION - l2_index(va)).min(count - done),
            }
        }
        Ok(unmapped)
    }

    /// 查询 `vaddr` 处的映射，返回 `(物理地址, 属性)`
    pub fn query(&self, vaddr: usize) -> VmResult<(usize, MmuFlags)> {
        let _st = self.state.lock();
        self.query_locked(vaddr)
    }

    fn query_locked(&self, vaddr: usize) -> VmResult<(usize, MmuFlags)> {
        let desc = self.read_l1(l1_index(vaddr));
        match l1_type(desc) {
            L1_TYPE_SECTION => Ok((
                l1_section_paddr(desc) + (vaddr & (SECTION_SIZE - 1)),
                l1_section_flags(desc),
            )),
            L1_TYPE_PAGE_TABLE => {
                let pte = read_l2(l1_page_table_paddr(desc), l2_index(vaddr));
                if !l2_is_valid(pte) {
                    return Err(VmError::NotFound);
                }
                Ok((
                    l2_paddr(pte) + (vaddr & (PAGE_SIZE - 1)),
                    l2_flags(pte, l1_page_table_ns(desc)),
                ))
            }
            _ => Err(VmError::NotFound),
        }
    }

    /// 修改 `[vaddr, vaddr + count 页)` 中已映射页的属性，物理地址不变
    pub fn change_protection(&self, vaddr: usize, count: usize, flags: MmuFlags) -> VmResult<()> {
        check_range(vaddr, count)?;
        let mut st = self.state.lock();
        let mut batch = TlbBatch::new(self.asid);
        let mut done = 0;
        while done < count {
            let va = vaddr + done * PAGE_SIZE;
            let l1i = l1_index(va);
            let desc = self.read_l1(l1i);
            match l1_type(desc) {
                L1_TYPE_SECTION => {
                    if va.is_section_aligned() && count - done >= PAGES_PER_SECTION {
                        self.write_l1(l1i, l1_section(l1_section_paddr(desc), flags));
                        batch.add(va);
                        done += PAGES_PER_SECTION;
                    } else {
                        self.split_section(&mut st, &mut batch, l1i)?;
                    }
                }
                L1_TYPE_PAGE_TABLE => {
                    let table = l1_page_table_paddr(desc);
                    let mut l2i = l2_index(va);
                    while l2i < L2_ENTRIES && done < count {
                        let pte = read_l2(table, l2i);
                        if l2_is_valid(pte) {
                            write_l2(table, l2i, l2_small(l2_paddr(pte), flags));
                            batch.add(vaddr + done * PAGE_SIZE);
                        }
                        l2i += 1;
                        done += 1;
                    }
                }
                _ => done += (PAGES_PER_SECTION - l2_index(va)).min(count - done),
            }
        }
        Ok(())
    }

    /// 把 `old` 处的映射逐页搬到 `new`，使用新的属性
    ///
    /// 目标范围内已有映射时返回 [`VmError::AlreadyExists`]，不做任何修改。
    /// 先建立全部新映射再解除旧映射；中途失败时撤销已建立的新映射，旧映射保持不变。
    pub fn move_range(&self, old: usize, new: usize, count: usize, flags: MmuFlags) -> VmResult<()> {
        check_range(old, count)?;
        check_range(new, count)?;
        let mut st = self.state.lock();
        if (0..count).any(|i| self.query_locked(new + i * PAGE_SIZE).is_ok()) {
            return Err(VmError::AlreadyExists);
        }
        let mut batch = TlbBatch::new(self.asid);

        // 旧映射逐页解除，源范围内的段先拆成二级表，之后的解除不再需要分配
        let old_end = old + count * PAGE_SIZE;
        let mut va = old;
        while va < old_end {
            let l1i = l1_index(va);
            if l1_type(self.read_l1(l1i)) == L1_TYPE_SECTION {
                self.split_section(&mut st, &mut batch, l1i)?;
            }
            va = (va & !(SECTION_SIZE - 1)) + SECTION_SIZE;
        }

        let mut moved = Vec::new();
        for i in 0..count {
            let Ok((paddr, _)) = self.query_locked(old + i * PAGE_SIZE) else {
                continue;
            };
            let mut mapped = 0;
            if let Err(e) = self.map_locked(&mut st, new + i * PAGE_SIZE, paddr.page_floor(), 1, flags, &mut mapped) {
                for &j in &moved {
                    let _ = self.unmap_locked(&mut st, &mut batch, new + j * PAGE_SIZE, 1);
                }
                return Err(e);
            }
            moved.push(i);
        }
        for &i in &moved {
            self.unmap_locked(&mut st, &mut batch, old + i * PAGE_SIZE, 1)?;
        }
        batch.flush();
        Ok(())
    }

    /// 取得一张清零的二级表，优先复用同组一级表项已占用的页
    fn alloc_l2_table(&self, st: &mut MmuState, l1i: usize) -> VmResult<usize> {
        let group = l1i & !(L2_TABLES_PER_PAGE - 1);
        let slot_off = (l1i - group) * L2_TABLE_SIZE;
        for sib in group..group + L2_TABLES_PER_PAGE {
            let desc = self.read_l1(sib);
            if sib != l1i && l1_type(desc) == L1_TYPE_PAGE_TABLE {
                return Ok(l1_page_table_paddr(desc).page_floor() + slot_off);
            }
        }
        let page = self.phys.alloc_zeroed_page()?;
        self.phys.page(page).set(PageFlags::PGTABLE);
        st.l2_pages += 1;
        Ok(self.phys.page_to_paddr(page) + slot_off)
    }

    /// 二级表为空时清除一级表项；同组 4 个表项都空闲后归还整页
    fn release_l2_if_empty(&self, st: &mut MmuState, l1i: usize, table: usize) {
        if (0..L2_ENTRIES).any(|i| read_l2(table, i) != 0) {
            return;
        }
        self.write_l1(l1i, 0);
        let group = l1i & !(L2_TABLES_PER_PAGE - 1);
        if (group..group + L2_TABLES_PER_PAGE)
            .any(|sib| l1_type(self.read_l1(sib)) == L1_TYPE_PAGE_TABLE)
        {
            return;
        }
        self.free_table_page(st, table.page_floor());
    }

    fn free_table_page(&self, st: &mut MmuState, paddr: usize) {
        match self.phys.paddr_to_page(paddr) {
            Some(page) => {
                self.phys.page(page).clear(PageFlags::PGTABLE);
                self.phys.free(page);
                st.l2_pages -= 1;
            }
            None => crate::vm_fatal!("mmu: l2 table {:#x} is outside managed memory", paddr),
        }
    }

    /// 把一个段映射拆成 256 个小页，属性保持不变
    fn split_section(&self, st: &mut MmuState, batch: &mut TlbBatch, l1i: usize) -> VmResult<()> {
        let desc = self.read_l1(l1i);
        let base = l1_section_paddr(desc);
        let flags = l1_section_flags(desc);
        let table = self.alloc_l2_table(st, l1i)?;
        for i in 0..L2_ENTRIES {
            write_l2(table, i, l2_small(base + i * PAGE_SIZE, flags));
        }
        self.write_l1(l1i, l1_page_table(table, flags));
        batch.add(l1i << SECTION_SHIFT);
        log::trace!("mmu: split section {:#x}", l1i << SECTION_SHIFT);
        Ok(())
    }

    fn read_l1(&self, idx: usize) -> u32 {
        // SAFETY: 一级表由本对象独占，idx < 4096
        unsafe { (phys_ptr(self.ttb + idx * 4) as *const u32).read_volatile() }
    }

    fn write_l1(&self, idx: usize, desc: u32) {
        // SAFETY: 同上，调用者持有内部锁
        unsafe { (phys_ptr(self.ttb + idx * 4) as *mut u32).write_volatile(desc) }
    }
}

fn read_l2(table: usize, idx: usize) -> u32 {
    // SAFETY: table 指向本地址空间拥有的二级表，idx < 256
    unsafe { (phys_ptr(table + idx * 4) as *const u32).read_volatile() }
}

fn write_l2(table: usize, idx: usize, desc: u32) {
    // SAFETY: 同上，调用者持有内部锁
    unsafe { (phys_ptr(table + idx * 4) as *mut u32).write_volatile(desc) }
}

fn check_range(vaddr: usize, count: usize) -> VmResult<()> {
    if count == 0 || !vaddr.is_page_aligned() {
        return Err(VmError::InvalidArgs);
    }
    match (count as u64).checked_mul(PAGE_SIZE as u64) {
        Some(len) if (vaddr as u64) + len <= 1 << 32 => Ok(()),
        _ => Err(VmError::InvalidArgs),
    }
}

impl Drop for ArchMmu {
    fn drop(&mut self) {
        let mut st = self.state.lock();
        for group in (0..L1_ENTRIES).step_by(L2_TABLES_PER_PAGE) {
            let table = (group..group + L2_TABLES_PER_PAGE)
                .map(|i| self.read_l1(i))
                .find(|&d| l1_type(d) == L1_TYPE_PAGE_TABLE)
                .map(l1_page_table_paddr);
            if let Some(table) = table {
                self.free_table_page(&mut st, table.page_floor());
            }
        }
        drop(st);
        for i in 0..(1 << L1_TABLE_ORDER) {
            self.phys.page(PageId(self.l1_head.0 + i)).clear(PageFlags::PGTABLE);
        }
        self.phys.free(self.l1_head);
        free_asid(self.asid);
    }
}

impl core::fmt::Debug for ArchMmu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ArchMmu")
            .field("asid", &self.asid)
            .field("ttb", &format_args!("{:#x}", self.ttb))
            .finish()
    }
}

#[cfg(test)]
mod tests;

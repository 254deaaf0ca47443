//! 地址空间
//!
//! [`VmSpace`] 管理一个地址空间的全部 [`Region`] 和它的硬件页表。
//! 区域按起始地址保存在有序表中，任意两个区域互不重叠；
//! 对区域表的修改连同对应的页表修改都在区域锁（可睡眠的互斥锁）下完成。

mod clone;
mod user_copy;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use sync::Mutex;

use crate::address::{AlignOps, PAGE_SIZE};
use crate::arch::{ArchMmu, MmuFlags};
use crate::asid::Asid;
use crate::config::VmConfig;
use crate::error::{VmError, VmResult};
use crate::page_cache::PageCache;
use crate::region::{Region, RegionBacking, RegionFlags};

/// 新区域的放置方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// 在映射区内首次适配
    Any,
    /// 优先使用给定地址，被占用时退回首次适配
    Hint(usize),
    /// 必须使用给定地址，先解除该范围内已有的映射
    Fixed(usize),
    /// 必须使用给定地址，被占用时返回 `AlreadyExists`
    FixedNoReplace(usize),
}

pub(crate) struct SpaceInner {
    pub(crate) regions: BTreeMap<usize, Region>,
    pub(crate) heap_base: usize,
    pub(crate) brk: usize,
    pub(crate) map_base: usize,
    pub(crate) map_end: usize,
}

impl SpaceInner {
    /// 覆盖 `vaddr` 的区域
    pub(crate) fn find(&self, vaddr: usize) -> Option<&Region> {
        self.regions
            .range(..=vaddr)
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.contains(vaddr))
    }

    /// 与 `[base, base + len)` 重叠的区域起始地址
    pub(crate) fn overlapping(&self, base: usize, len: usize) -> Vec<usize> {
        let end = base + len;
        let first = self
            .regions
            .range(..base)
            .next_back()
            .filter(|(_, r)| r.end() > base)
            .map(|(k, _)| *k);
        first
            .into_iter()
            .chain(self.regions.range(base..end).map(|(k, _)| *k))
            .collect()
    }

    pub(crate) fn is_free(&self, base: usize, len: usize) -> bool {
        self.overlapping(base, len).is_empty()
    }

    /// `[base, base + len)` 是否完全被区域覆盖（允许跨越多个相邻区域）
    pub(crate) fn is_covered(&self, base: usize, len: usize) -> bool {
        let end = base + len;
        let mut cursor = base;
        while cursor < end {
            match self.find(cursor) {
                Some(r) => cursor = r.end(),
                None => return false,
            }
        }
        true
    }

    /// 在 `[lo, hi)` 内首次适配一段长度为 `len` 的空闲地址
    pub(crate) fn first_fit(&self, lo: usize, hi: usize, len: usize) -> Option<usize> {
        let mut cursor = lo;
        for r in self.regions.values() {
            if r.end() <= cursor {
                continue;
            }
            if r.base() >= hi {
                break;
            }
            if r.base() >= cursor && r.base() - cursor >= len {
                return Some(cursor);
            }
            cursor = cursor.max(r.end());
        }
        (cursor <= hi && hi - cursor >= len).then_some(cursor)
    }

    /// 若有区域跨越 `at`，在 `at` 处把它切成两段
    pub(crate) fn split_at(&mut self, at: usize) {
        let Some(base) = self.find(at).map(Region::base) else {
            return;
        };
        if base == at {
            return;
        }
        if let Some(region) = self.regions.get_mut(&base) {
            let tail = region.split_off(at);
            self.regions.insert(at, tail);
        }
    }

    /// 合并 `[start, end]` 附近可以合并的相邻匿名区域
    pub(crate) fn merge_around(&mut self, start: usize, end: usize) {
        let mut keys: Vec<usize> = self
            .regions
            .range(..start)
            .next_back()
            .map(|(k, _)| *k)
            .into_iter()
            .chain(self.regions.range(start..=end).map(|(k, _)| *k))
            .collect();
        keys.dedup();
        let mut i = 0;
        while i + 1 < keys.len() {
            let (a, b) = (keys[i], keys[i + 1]);
            let mergeable = match (self.regions.get(&a), self.regions.get(&b)) {
                (Some(ra), Some(rb)) => ra.can_merge(rb),
                _ => false,
            };
            if mergeable {
                if let Some(rb) = self.regions.remove(&b) {
                    if let Some(ra) = self.regions.get_mut(&a) {
                        ra.set_size(ra.size() + rb.size());
                    }
                }
                keys.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }
}

/// 一个地址空间
pub struct VmSpace {
    base: usize,
    size: usize,
    pub(crate) mmu: Arc<ArchMmu>,
    pub(crate) cache: Arc<PageCache>,
    pub(crate) inner: Mutex<SpaceInner>,
}

impl VmSpace {
    fn with_mmu(mmu: ArchMmu, cache: Arc<PageCache>, base: usize, size: usize, inner: SpaceInner) -> Self {
        Self {
            base,
            size,
            mmu: Arc::new(mmu),
            cache,
            inner: Mutex::new(inner),
        }
    }

    /// 创建用户地址空间
    pub fn new_user(cache: Arc<PageCache>, config: &VmConfig) -> VmResult<Self> {
        let mmu = ArchMmu::new(cache.phys().clone())?;
        let inner = SpaceInner {
            regions: BTreeMap::new(),
            heap_base: config.user_heap_base,
            brk: config.user_heap_base,
            map_base: config.user_map_base,
            map_end: config.user_base + config.user_size,
        };
        Ok(Self::with_mmu(mmu, cache, config.user_base, config.user_size, inner))
    }

    /// 创建内核地址空间，可分配范围为 vmalloc 区
    pub fn new_kernel(cache: Arc<PageCache>, config: &VmConfig) -> VmResult<Self> {
        let mmu = ArchMmu::new_kernel(cache.phys().clone())?;
        let inner = SpaceInner {
            regions: BTreeMap::new(),
            heap_base: config.vmalloc_base,
            brk: config.vmalloc_base,
            map_base: config.vmalloc_base,
            map_end: config.vmalloc_base + config.vmalloc_size,
        };
        Ok(Self::with_mmu(mmu, cache, config.kernel_base, config.kernel_size, inner))
    }

    /// 起始地址
    pub fn base(&self) -> usize {
        self.base
    }

    /// 大小（字节）
    pub fn size(&self) -> usize {
        self.size
    }

    /// 硬件页表
    pub fn mmu(&self) -> &Arc<ArchMmu> {
        &self.mmu
    }

    /// 地址空间标识
    pub fn asid(&self) -> Asid {
        self.mmu.asid()
    }

    /// 页缓存
    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    /// `[vaddr, vaddr + len)` 是否完全位于本地址空间内
    pub fn contains_range(&self, vaddr: usize, len: usize) -> bool {
        vaddr >= self.base && len <= self.size && vaddr - self.base <= self.size - len
    }

    /// 校验页对齐的起始地址和非零长度，返回按页向上取整后的长度
    pub(crate) fn check_range(&self, vaddr: usize, len: usize) -> VmResult<usize> {
        let len = len.page_ceil().ok_or(VmError::InvalidArgs)?;
        if len == 0 || !vaddr.is_aligned(PAGE_SIZE) || !self.contains_range(vaddr, len) {
            return Err(VmError::InvalidArgs);
        }
        Ok(len)
    }

    /// 查询 `vaddr` 的映射
    pub fn query(&self, vaddr: usize) -> VmResult<(usize, MmuFlags)> {
        self.mmu.query(vaddr)
    }

    /// 切换到本地址空间
    pub fn activate(&self) {
        self.mmu.context_switch();
    }

    /// 建立一个新区域
    ///
    /// 只登记区域，不分配物理页；页在首次访问时由缺页处理分配。
    pub fn alloc_region(
        &self,
        placement: Placement,
        len: usize,
        flags: RegionFlags,
        pgoff: u64,
        backing: RegionBacking,
    ) -> VmResult<Region> {
        let mut inner = self.inner.lock();
        self.alloc_region_locked(&mut inner, placement, len, flags, pgoff, backing)
    }

    pub(crate) fn alloc_region_locked(
        &self,
        inner: &mut SpaceInner,
        placement: Placement,
        len: usize,
        flags: RegionFlags,
        pgoff: u64,
        backing: RegionBacking,
    ) -> VmResult<Region> {
        if len == 0 || !len.is_aligned(PAGE_SIZE) {
            return Err(VmError::InvalidArgs);
        }
        let base = match placement {
            Placement::Any => self.place_any(inner, len)?,
            Placement::Hint(addr) => {
                let addr = addr.page_floor();
                if addr != 0 && self.contains_range(addr, len) && inner.is_free(addr, len) {
                    addr
                } else {
                    self.place_any(inner, len)?
                }
            }
            Placement::Fixed(addr) | Placement::FixedNoReplace(addr) => {
                if !addr.is_aligned(PAGE_SIZE) || !self.contains_range(addr, len) {
                    return Err(VmError::InvalidArgs);
                }
                if !inner.is_free(addr, len) {
                    if matches!(placement, Placement::FixedNoReplace(_)) {
                        return Err(VmError::AlreadyExists);
                    }
                    self.remove_range_locked(inner, addr, len);
                }
                addr
            }
        };

        let region = Region::new(base, len, flags, pgoff, backing);
        inner.regions.insert(base, region.clone());
        log::trace!("space {}: region {:#x}..{:#x} {:?}", self.asid(), base, base + len, flags);
        Ok(region)
    }

    fn place_any(&self, inner: &SpaceInner, len: usize) -> VmResult<usize> {
        inner
            .first_fit(inner.map_base, inner.map_end, len)
            .ok_or_else(|| {
                log::warn!("space {}: no room for {:#x} bytes", self.asid(), len);
                VmError::NoMemory
            })
    }

    /// 覆盖 `vaddr` 的区域
    pub fn find(&self, vaddr: usize) -> Option<Region> {
        self.inner.lock().find(vaddr).cloned()
    }

    /// 全部区域（按地址升序）
    pub fn regions(&self) -> Vec<Region> {
        self.inner.lock().regions.values().cloned().collect()
    }

    /// 区域数
    pub fn region_count(&self) -> usize {
        self.inner.lock().regions.len()
    }

    /// 删除一个区域并解除它的全部映射
    pub fn free_region(&self, region: &Region) -> VmResult<()> {
        let mut inner = self.inner.lock();
        let same = inner
            .regions
            .get(&region.base())
            .is_some_and(|r| r.size() == region.size());
        if !same {
            return Err(VmError::NotFound);
        }
        if let Some(r) = inner.regions.remove(&region.base()) {
            self.release_pages(&r, r.base(), r.end());
        }
        Ok(())
    }

    /// 在 `vaddr` 和 `vaddr + len` 处切分跨越边界的区域，使该范围只包含完整的区域
    pub fn split_or_merge_for(&self, vaddr: usize, len: usize) -> VmResult<()> {
        if !vaddr.is_aligned(PAGE_SIZE) || !len.is_aligned(PAGE_SIZE) || !self.contains_range(vaddr, len) {
            return Err(VmError::InvalidArgs);
        }
        let mut inner = self.inner.lock();
        inner.split_at(vaddr);
        inner.split_at(vaddr + len);
        Ok(())
    }

    /// 解除 `[vaddr, vaddr + len)` 内的全部映射并删除对应的区域
    pub fn unmap_range(&self, vaddr: usize, len: usize) -> VmResult<()> {
        let len = self.check_range(vaddr, len)?;
        let mut inner = self.inner.lock();
        self.remove_range_locked(&mut inner, vaddr, len);
        Ok(())
    }

    pub(crate) fn remove_range_locked(&self, inner: &mut SpaceInner, vaddr: usize, len: usize) {
        inner.split_at(vaddr);
        inner.split_at(vaddr + len);
        for base in inner.overlapping(vaddr, len) {
            if let Some(region) = inner.regions.remove(&base) {
                self.release_pages(&region, region.base(), region.end());
            }
        }
    }

    /// 修改 `[vaddr, vaddr + len)` 的访问权限
    ///
    /// 范围必须完全被区域覆盖。已映射为只读的页不会被直接升级为可写，
    /// 写时复制和脏页跟踪仍由下一次写缺页处理。
    /// 修改页表失败时恢复原有的区域权限和页表项。
    pub fn protect(&self, vaddr: usize, len: usize, perms: RegionFlags) -> VmResult<()> {
        let len = self.check_range(vaddr, len)?;
        let mut inner = self.inner.lock();
        if !inner.is_covered(vaddr, len) {
            return Err(VmError::NoMemory);
        }
        inner.split_at(vaddr);
        inner.split_at(vaddr + len);

        let perms = perms & RegionFlags::PERM_MASK;
        let mut saved: Vec<(usize, RegionFlags)> = Vec::new();
        let mut changed: Vec<(usize, MmuFlags)> = Vec::new();
        let mut result = Ok(());
        'regions: for base in inner.overlapping(vaddr, len) {
            let Some(region) = inner.regions.get_mut(&base) else {
                continue;
            };
            saved.push((base, region.flags()));
            region.set_flags((region.flags() - RegionFlags::PERM_MASK) | perms);
            let new = region.mmu_flags();
            for va in (region.base()..region.end()).step_by(PAGE_SIZE) {
                let Ok((_, cur)) = self.mmu.query(va) else {
                    continue;
                };
                let flags = if cur.contains(MmuFlags::PERM_WRITE) {
                    new
                } else {
                    new - MmuFlags::PERM_WRITE
                };
                if flags == cur {
                    continue;
                }
                if let Err(e) = self.mmu.change_protection(va, 1, flags) {
                    result = Err(e);
                    break 'regions;
                }
                changed.push((va, cur));
            }
        }

        if let Err(e) = result {
            for (va, cur) in changed {
                let _ = self.mmu.change_protection(va, 1, cur);
            }
            for (base, flags) in saved {
                if let Some(region) = inner.regions.get_mut(&base) {
                    region.set_flags(flags);
                }
            }
            inner.merge_around(vaddr, vaddr + len);
            log::warn!("space {}: protect {:#x}+{:#x} rolled back: {}", self.asid(), vaddr, len, e);
            return Err(e);
        }
        inner.merge_around(vaddr, vaddr + len);
        Ok(())
    }

    /// 解除区域在 `[start, end)` 内各页的映射，并按后备类型释放页
    pub(crate) fn release_pages(&self, region: &Region, start: usize, end: usize) {
        let phys = self.cache.phys();
        for va in (start..end).step_by(PAGE_SIZE) {
            let Ok((paddr, _)) = self.mmu.query(va) else {
                continue;
            };
            match region.backing() {
                RegionBacking::Anonymous => {
                    if self.mmu.unmap(va, 1).is_ok() {
                        if let Some(page) = phys.paddr_to_page(paddr.page_floor()) {
                            phys.put_page(page);
                        }
                    }
                }
                RegionBacking::File(mapping) => {
                    if let Err(e) = self.cache.unmap_page(mapping, region.pgoff_of(va), &self.mmu, va) {
                        log::warn!("space {}: unmapping file page at {:#x}: {}", self.asid(), va, e);
                    }
                }
                RegionBacking::Device(ops) => {
                    ops.remove(region, &self.mmu, region.pgoff_of(va));
                    let _ = self.mmu.unmap(va, 1);
                }
            }
        }
    }

    /// 已映射的页数
    pub fn resident_pages(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .regions
            .values()
            .map(|r| {
                (r.base()..r.end())
                    .step_by(PAGE_SIZE)
                    .filter(|&va| self.mmu.query(va).is_ok())
                    .count()
            })
            .sum()
    }

    /// 打印区域表
    pub fn dump(&self) {
        let inner = self.inner.lock();
        log::info!(
            "space asid={} range={:#x}..{:#x} brk={:#x} regions={}",
            self.asid(),
            self.base,
            self.base + self.size,
            inner.brk,
            inner.regions.len()
        );
        for r in inner.regions.values() {
            log::info!(
                "  {:#010x}-{:#010x} {:?} pgoff={} {:?}",
                r.base(),
                r.end(),
                r.flags(),
                r.pgoff(),
                r.backing()
            );
        }
    }
}

impl Drop for VmSpace {
    fn drop(&mut self) {
        let regions = core::mem::take(&mut self.inner.get_mut().regions);
        for region in regions.values() {
            self.release_pages(region, region.base(), region.end());
        }
    }
}

impl core::fmt::Debug for VmSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmSpace")
            .field("asid", &self.asid())
            .field("base", &self.base)
            .field("size", &self.size)
            .finish()
    }
}

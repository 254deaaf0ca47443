//! 文件页缓存
//!
//! 每个被映射的文件对应一个 [`FileMapping`]，其中按页偏移有序地保存 [`FilePage`]。
//! 缓存只按 inode 编号登记文件映射的弱引用，强引用由映射该文件的区域持有；
//! 最后一个区域释放时文件映射随之销毁，脏页先写回，缓存页全部归还。
//! 缓存页本身持有物理页的一个引用，每条反向映射（某个页表中的某个虚拟地址）再各持有一个。
//!
//! 锁顺序：地址空间的区域锁 → 文件映射的页表锁 → 物理段的 LRU 锁。
//! 持有文件映射锁时可以修改页表（页表内部锁更靠后），但不会分配可能触发回收的内存，
//! 也不会做文件 I/O。

pub(crate) mod lru;
mod reclaim;

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use hashbrown::HashMap;
use sync::SpinLock;

use crate::address::{AlignOps, PAGE_SIZE};
use crate::arch::{ArchMmu, MmuFlags};
use crate::error::{VmError, VmResult};
use crate::file::{MmInode, io_error};
use crate::phys::{PageFlags, PageId, PhysAllocator};
use lru::LruKind;

/// 一条反向映射
#[derive(Clone)]
pub(crate) struct Rmap {
    mmu: Weak<ArchMmu>,
    vaddr: usize,
}

impl Rmap {
    fn new(mmu: &Arc<ArchMmu>, vaddr: usize) -> Self {
        Self {
            mmu: Arc::downgrade(mmu),
            vaddr,
        }
    }

    fn is(&self, mmu: &ArchMmu, vaddr: usize) -> bool {
        self.vaddr == vaddr && core::ptr::eq(self.mmu.as_ptr(), mmu)
    }

    fn is_executable(&self) -> bool {
        self.mmu.upgrade().is_some_and(|mmu| {
            mmu.query(self.vaddr)
                .is_ok_and(|(_, flags)| flags.contains(MmuFlags::PERM_EXECUTE))
        })
    }

    fn unmap(&self) {
        if let Some(mmu) = self.mmu.upgrade() {
            let _ = mmu.unmap(self.vaddr, 1);
        }
    }

    fn write_protect(&self) {
        let Some(mmu) = self.mmu.upgrade() else {
            return;
        };
        if let Ok((_, flags)) = mmu.query(self.vaddr) {
            if flags.contains(MmuFlags::PERM_WRITE) {
                let _ = mmu.change_protection(self.vaddr, 1, flags - MmuFlags::PERM_WRITE);
            }
        }
    }
}

/// 页缓存中的一页
#[derive(Clone)]
pub struct FilePage {
    page: PageId,
    pgoff: u64,
    rmaps: Vec<Rmap>,
    dirty_off: usize,
    dirty_end: usize,
}

impl FilePage {
    fn new(page: PageId, pgoff: u64) -> Self {
        Self {
            page,
            pgoff,
            rmaps: Vec::new(),
            dirty_off: 0,
            dirty_end: 0,
        }
    }

    /// 物理页
    pub fn page(&self) -> PageId {
        self.page
    }

    /// 文件页偏移
    pub fn pgoff(&self) -> u64 {
        self.pgoff
    }

    /// 反向映射数
    pub fn map_count(&self) -> usize {
        self.rmaps.len()
    }

    /// 是否为脏页
    pub fn is_dirty(&self) -> bool {
        self.dirty_end > self.dirty_off
    }

    /// 页内的脏字节范围 `[off, end)`
    pub fn dirty_range(&self) -> Option<(usize, usize)> {
        self.is_dirty().then_some((self.dirty_off, self.dirty_end))
    }

    fn mark_dirty(&mut self, offset: usize, len: usize) {
        let end = offset + len;
        if self.is_dirty() {
            self.dirty_off = self.dirty_off.min(offset);
            self.dirty_end = self.dirty_end.max(end);
        } else {
            self.dirty_off = offset;
            self.dirty_end = end;
        }
    }

    fn take_dirty(&mut self) -> Option<(usize, usize)> {
        let range = self.dirty_range();
        self.dirty_off = 0;
        self.dirty_end = 0;
        range
    }

    fn rmap_position(&self, mmu: &ArchMmu, vaddr: usize) -> Option<usize> {
        self.rmaps.iter().position(|r| r.is(mmu, vaddr))
    }
}

/// 一个文件在页缓存中的全部页
pub struct FileMapping {
    ino: u64,
    inode: Arc<dyn MmInode>,
    phys: Arc<PhysAllocator>,
    pages: SpinLock<BTreeMap<u64, FilePage>>,
}

impl FileMapping {
    fn new(inode: Arc<dyn MmInode>, phys: Arc<PhysAllocator>) -> Self {
        Self {
            ino: inode.ino(),
            inode,
            phys,
            pages: SpinLock::new(BTreeMap::new()),
        }
    }

    /// inode 编号
    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// 后备 inode
    pub fn inode(&self) -> &Arc<dyn MmInode> {
        &self.inode
    }

    /// 缓存的页数
    pub fn nr_pages(&self) -> usize {
        self.pages.lock().len()
    }

    /// 已缓存的页偏移（升序）
    pub fn pgoffs(&self) -> Vec<u64> {
        self.pages.lock().keys().copied().collect()
    }

    /// 缓存页的快照，不影响 LRU
    pub fn lookup(&self, pgoff: u64) -> Option<FilePage> {
        self.pages.lock().get(&pgoff).cloned()
    }

    /// 从文件读入一页，超出文件末尾的部分保持为零
    fn read_page(&self, pgoff: u64, page: PageId) -> VmResult<()> {
        // SAFETY: 页刚分配且处于 LOCKED 状态，只有本函数访问
        let buf = unsafe { core::slice::from_raw_parts_mut(self.phys.page_ptr(page), PAGE_SIZE) };
        let base = pgoff as usize * PAGE_SIZE;
        let mut done = 0;
        while done < PAGE_SIZE {
            let n = self
                .inode
                .read_at(base + done, &mut buf[done..])
                .map_err(io_error)?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(())
    }

    /// 把页内 `[off, end)` 写回文件
    fn write_back(&self, page: PageId, pgoff: u64, off: usize, end: usize) -> VmResult<()> {
        // SAFETY: 调用者持有该页的引用；与用户态并发写入的语义同共享映射一致
        let buf = unsafe { core::slice::from_raw_parts(self.phys.page_ptr(page).add(off), end - off) };
        let n = self
            .inode
            .write_at(pgoff as usize * PAGE_SIZE + off, buf)
            .map_err(io_error)?;
        if n != buf.len() {
            log::warn!("page cache: short write-back of ino {} pgoff {}", self.ino, pgoff);
            return Err(VmError::Io(0));
        }
        Ok(())
    }
}

impl Drop for FileMapping {
    fn drop(&mut self) {
        let pages = core::mem::take(&mut *self.pages.lock());
        for (pgoff, mut fp) in pages {
            if let Some((off, end)) = fp.take_dirty() {
                if let Err(e) = self.write_back(fp.page, pgoff, off, end) {
                    log::warn!("page cache: dropping dirty page of ino {}: {}", self.ino, e);
                }
            }
            lru::lru_del(&self.phys, fp.page);
            for r in &fp.rmaps {
                r.unmap();
                self.phys.put_page(fp.page);
            }
            self.phys.page(fp.page).clear(PageFlags::CACHED | PageFlags::DIRTY);
            self.phys.put_page(fp.page);
        }
    }
}

impl core::fmt::Debug for FileMapping {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FileMapping").field("ino", &self.ino).finish()
    }
}

/// 页缓存
pub struct PageCache {
    phys: Arc<PhysAllocator>,
    mappings: SpinLock<HashMap<u64, Weak<FileMapping>>>,
    shrink_scan: usize,
}

impl PageCache {
    /// 创建页缓存，`shrink_scan` 为单次回收最多扫描的页数
    pub fn new(phys: Arc<PhysAllocator>, shrink_scan: usize) -> Self {
        Self {
            phys,
            mappings: SpinLock::new(HashMap::new()),
            shrink_scan: shrink_scan.max(1),
        }
    }

    /// 物理页分配器
    pub fn phys(&self) -> &Arc<PhysAllocator> {
        &self.phys
    }

    /// 取得 inode 对应的文件映射，不存在时创建
    pub fn mapping_for(&self, inode: Arc<dyn MmInode>) -> Arc<FileMapping> {
        let ino = inode.ino();
        let mut mappings = self.mappings.lock();
        if let Some(m) = mappings.get(&ino).and_then(Weak::upgrade) {
            return m;
        }
        mappings.retain(|_, m| m.strong_count() != 0);
        let mapping = Arc::new(FileMapping::new(inode, self.phys.clone()));
        mappings.insert(ino, Arc::downgrade(&mapping));
        mapping
    }

    /// 查找已注册的文件映射
    pub fn lookup_mapping(&self, ino: u64) -> Option<Arc<FileMapping>> {
        self.mappings.lock().get(&ino).and_then(Weak::upgrade)
    }

    /// 仍然存活的文件映射数
    pub fn nr_mappings(&self) -> usize {
        self.mappings.lock().values().filter(|m| m.strong_count() != 0).count()
    }

    /// 所有物理段上活跃/非活跃链表的长度之和
    pub fn lru_counts(&self) -> (usize, usize) {
        self.phys.segments().iter().fold((0, 0), |(a, i), seg| {
            let lists = seg.lru.lock();
            (a + lists.len(LruKind::Active), i + lists.len(LruKind::Inactive))
        })
    }

    /// 缓存页总数
    pub fn nr_pages(&self) -> usize {
        let (a, i) = self.lru_counts();
        a + i
    }

    /// 分配一页清零的物理页，内存不足时先回收页缓存再重试一次
    pub fn alloc_page(&self) -> VmResult<PageId> {
        match self.phys.alloc_zeroed_page() {
            Err(VmError::NoMemory) => {
                let reclaimed = self.try_shrink(self.shrink_scan);
                log::debug!("page cache: reclaimed {} pages on allocation failure", reclaimed);
                if reclaimed == 0 {
                    return Err(VmError::NoMemory);
                }
                self.phys.alloc_zeroed_page()
            }
            r => r,
        }
    }

    /// 查找 `pgoff` 处的缓存页，命中时更新 LRU
    pub fn find(&self, mapping: &FileMapping, pgoff: u64) -> Option<PageId> {
        let pages = mapping.pages.lock();
        let page = pages.get(&pgoff)?.page;
        lru::mark_accessed(&self.phys, page);
        Some(page)
    }

    /// 确保 `pgoff` 处有缓存页：不存在时分配并从文件读入
    pub fn alloc(&self, mapping: &Arc<FileMapping>, pgoff: u64) -> VmResult<PageId> {
        let page = self.grab(mapping, pgoff)?;
        self.phys.put_page(page);
        Ok(page)
    }

    /// 取得 `pgoff` 处的缓存页并为调用者加一个引用
    pub(crate) fn grab(&self, mapping: &Arc<FileMapping>, pgoff: u64) -> VmResult<PageId> {
        {
            let pages = mapping.pages.lock();
            if let Some(fp) = pages.get(&pgoff) {
                self.phys.get_page(fp.page);
                lru::mark_accessed(&self.phys, fp.page);
                return Ok(fp.page);
            }
        }

        let new = self.alloc_page()?;
        self.phys.page(new).set(PageFlags::LOCKED);
        if let Err(e) = mapping.read_page(pgoff, new) {
            log::warn!("page cache: reading ino {} pgoff {} failed: {}", mapping.ino, pgoff, e);
            self.phys.put_page(new);
            return Err(e);
        }

        let mut pages = mapping.pages.lock();
        if let Some(fp) = pages.get(&pgoff) {
            let existing = fp.page;
            self.phys.get_page(existing);
            drop(pages);
            self.phys.put_page(new);
            return Ok(existing);
        }
        self.phys.get_page(new);
        let desc = self.phys.page(new);
        desc.set(PageFlags::CACHED);
        desc.clear(PageFlags::LOCKED);
        pages.insert(pgoff, FilePage::new(new, pgoff));
        lru::lru_add(&self.phys, new, Arc::downgrade(mapping), pgoff);
        Ok(new)
    }

    /// 标记页内 `[offset, offset + len)` 为脏
    pub fn mark_dirty(&self, mapping: &FileMapping, pgoff: u64, offset: usize, len: usize) -> VmResult<()> {
        if len == 0 || offset.checked_add(len).is_none_or(|end| end > PAGE_SIZE) {
            return Err(VmError::InvalidArgs);
        }
        let mut pages = mapping.pages.lock();
        let fp = pages.get_mut(&pgoff).ok_or(VmError::NotFound)?;
        fp.mark_dirty(offset, len);
        self.phys.page(fp.page).set(PageFlags::DIRTY);
        Ok(())
    }

    /// 写回整个文件映射的脏页，返回写回的页数
    pub fn flush(&self, mapping: &FileMapping) -> VmResult<usize> {
        self.flush_range(mapping, 0, u64::MAX)
    }

    /// 写回页偏移在 `[start, end)` 内的脏页
    ///
    /// 写回前去掉这些页所有映射的写权限，之后的写入会重新缺页并重新标脏。
    pub fn flush_range(&self, mapping: &FileMapping, start: u64, end: u64) -> VmResult<usize> {
        let mut work = Vec::new();
        {
            let mut pages = mapping.pages.lock();
            for (_, fp) in pages.range_mut(start..end) {
                let Some((off, dirty_end)) = fp.take_dirty() else {
                    continue;
                };
                self.phys.page(fp.page).clear(PageFlags::DIRTY);
                self.phys.get_page(fp.page);
                fp.rmaps.iter().for_each(Rmap::write_protect);
                work.push((fp.page, fp.pgoff, off, dirty_end));
            }
        }

        let mut result = Ok(work.len());
        for &(page, pgoff, off, end) in &work {
            if let Err(e) = mapping.write_back(page, pgoff, off, end) {
                log::warn!("page cache: write-back of ino {} pgoff {} failed: {}", mapping.ino, pgoff, e);
                let _ = self.mark_dirty(mapping, pgoff, off, end - off);
                result = Err(e);
            }
            self.phys.put_page(page);
        }
        result
    }

    /// 写回并丢弃文件映射的全部缓存页，然后注销该映射
    pub fn remove(&self, mapping: &FileMapping) -> VmResult<()> {
        let flushed = self.flush(mapping);
        let pages = core::mem::take(&mut *mapping.pages.lock());
        for fp in pages.into_values() {
            lru::lru_del(&self.phys, fp.page);
            for r in &fp.rmaps {
                r.unmap();
                self.phys.put_page(fp.page);
            }
            self.phys.page(fp.page).clear(PageFlags::CACHED | PageFlags::DIRTY);
            self.phys.put_page(fp.page);
        }
        let mut mappings = self.mappings.lock();
        if mappings
            .get(&mapping.ino)
            .is_some_and(|m| core::ptr::eq(m.as_ptr(), mapping))
        {
            mappings.remove(&mapping.ino);
        }
        flushed.map(|_| ())
    }

    /// 读缺页：把 `pgoff` 处的缓存页只读映射到 `vaddr`
    pub(crate) fn map_read(
        &self,
        mapping: &Arc<FileMapping>,
        pgoff: u64,
        mmu: &Arc<ArchMmu>,
        vaddr: usize,
        flags: MmuFlags,
    ) -> VmResult<()> {
        self.map_cached(mapping, pgoff, mmu, vaddr, flags - MmuFlags::PERM_WRITE, false)
    }

    /// 共享写缺页：可写映射缓存页并整页标脏
    ///
    /// `vaddr` 已经只读映射着该页时原地升级权限。
    pub(crate) fn map_shared_write(
        &self,
        mapping: &Arc<FileMapping>,
        pgoff: u64,
        mmu: &Arc<ArchMmu>,
        vaddr: usize,
        flags: MmuFlags,
    ) -> VmResult<()> {
        {
            let mut pages = mapping.pages.lock();
            if let Some(fp) = pages.get_mut(&pgoff) {
                if fp.rmap_position(mmu, vaddr).is_some() {
                    mmu.change_protection(vaddr, 1, flags)?;
                    fp.mark_dirty(0, PAGE_SIZE);
                    self.phys.page(fp.page).set(PageFlags::DIRTY);
                    lru::mark_accessed(&self.phys, fp.page);
                    return Ok(());
                }
            }
        }
        self.map_cached(mapping, pgoff, mmu, vaddr, flags, true)
    }

    fn map_cached(
        &self,
        mapping: &Arc<FileMapping>,
        pgoff: u64,
        mmu: &Arc<ArchMmu>,
        vaddr: usize,
        flags: MmuFlags,
        dirty: bool,
    ) -> VmResult<()> {
        for _ in 0..2 {
            let page = self.grab(mapping, pgoff)?;
            let mut pages = mapping.pages.lock();
            let Some(fp) = pages.get_mut(&pgoff).filter(|fp| fp.page == page) else {
                drop(pages);
                self.phys.put_page(page);
                continue;
            };
            if let Err(e) = mmu.map(vaddr, self.phys.page_to_paddr(page), 1, flags) {
                drop(pages);
                self.phys.put_page(page);
                return Err(e);
            }
            fp.rmaps.push(Rmap::new(mmu, vaddr));
            if dirty {
                fp.mark_dirty(0, PAGE_SIZE);
                self.phys.page(page).set(PageFlags::DIRTY);
            }
            return Ok(());
        }
        Err(VmError::Busy)
    }

    /// 私有写缺页：返回一页内容与文件一致、只由调用者持有的页
    ///
    /// `vaddr` 处原有的只读缓存页映射会被撤销。缓存页没有其它使用者且是干净的，
    /// 就直接把它从缓存中摘下来使用，否则复制一份。
    pub(crate) fn cow_page(
        &self,
        mapping: &Arc<FileMapping>,
        pgoff: u64,
        mmu: &ArchMmu,
        vaddr: usize,
    ) -> VmResult<PageId> {
        {
            let mut pages = mapping.pages.lock();
            if let Some(fp) = pages.get_mut(&pgoff) {
                if let Some(pos) = fp.rmap_position(mmu, vaddr) {
                    mmu.unmap(vaddr, 1)?;
                    fp.rmaps.swap_remove(pos);
                    self.phys.put_page(fp.page);
                }
            }
        }

        let page = self.grab(mapping, pgoff)?;
        {
            let mut pages = mapping.pages.lock();
            let desc = self.phys.page(page);
            let stealable = pages.get(&pgoff).is_some_and(|fp| {
                fp.page == page
                    && fp.rmaps.is_empty()
                    && !fp.is_dirty()
                    && !desc.test(PageFlags::LOCKED)
                    && desc.refcount() == 2
            });
            if stealable {
                pages.remove(&pgoff);
                lru::lru_del(&self.phys, page);
                desc.clear(PageFlags::CACHED);
                self.phys.put_page(page);
                log::trace!("page cache: ino {} pgoff {} taken for a private copy", mapping.ino, pgoff);
                return Ok(page);
            }
        }

        let copy = match self.alloc_page() {
            Ok(p) => p,
            Err(e) => {
                self.phys.put_page(page);
                return Err(e);
            }
        };
        self.phys.copy_page(copy, page);
        self.phys.put_page(page);
        Ok(copy)
    }

    /// `vaddr` 处是否映射着本文件映射在 `pgoff` 处的缓存页
    pub(crate) fn is_mapped_at(&self, mapping: &FileMapping, pgoff: u64, mmu: &ArchMmu, vaddr: usize) -> bool {
        mapping
            .pages
            .lock()
            .get(&pgoff)
            .is_some_and(|fp| fp.rmap_position(mmu, vaddr).is_some())
    }

    /// 解除文件区域中 `vaddr` 处的映射
    ///
    /// 缓存页去掉对应的反向映射；写时复制得到的私有页直接释放。
    pub(crate) fn unmap_page(&self, mapping: &FileMapping, pgoff: u64, mmu: &ArchMmu, vaddr: usize) -> VmResult<()> {
        let mut pages = mapping.pages.lock();
        let Ok((paddr, _)) = mmu.query(vaddr) else {
            return Ok(());
        };
        mmu.unmap(vaddr, 1)?;
        if let Some(fp) = pages.get_mut(&pgoff) {
            if let Some(pos) = fp.rmap_position(mmu, vaddr) {
                fp.rmaps.swap_remove(pos);
                self.phys.put_page(fp.page);
                return Ok(());
            }
        }
        drop(pages);
        if let Some(page) = self.phys.paddr_to_page(paddr.page_floor()) {
            self.phys.put_page(page);
        }
        Ok(())
    }

    /// 让 `child` 在 `vaddr` 处共享父页表映射着的缓存页
    ///
    /// 返回 `false` 表示该地址映射的不是缓存页（或已被回收）。
    pub(crate) fn share_page(
        &self,
        mapping: &FileMapping,
        pgoff: u64,
        parent: &ArchMmu,
        child: &Arc<ArchMmu>,
        vaddr: usize,
        flags: MmuFlags,
    ) -> VmResult<bool> {
        let mut pages = mapping.pages.lock();
        let Some(fp) = pages.get_mut(&pgoff) else {
            return Ok(false);
        };
        if fp.rmap_position(parent, vaddr).is_none() {
            return Ok(false);
        }
        child.map(vaddr, self.phys.page_to_paddr(fp.page), 1, flags)?;
        self.phys.get_page(fp.page);
        fp.rmaps.push(Rmap::new(child, vaddr));
        Ok(true)
    }

    /// 把 `old` 处的一页映射搬到 `new`，缓存页的反向映射随之更新
    pub(crate) fn move_page(
        &self,
        mapping: &FileMapping,
        pgoff: u64,
        mmu: &ArchMmu,
        old: usize,
        new: usize,
        flags: MmuFlags,
    ) -> VmResult<()> {
        let mut pages = mapping.pages.lock();
        mmu.move_range(old, new, 1, flags)?;
        if let Some(fp) = pages.get_mut(&pgoff) {
            if let Some(pos) = fp.rmap_position(mmu, old) {
                fp.rmaps[pos].vaddr = new;
            }
        }
        Ok(())
    }
}

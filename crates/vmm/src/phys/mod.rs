//! 物理页帧分配器
//!
//! 经典的二进制伙伴分配器，管理一个或多个物理段。
//!
//! - [`PhysAllocator::alloc`]：分配 `2^order` 页的块
//! - [`PhysAllocator::alloc_contig`]：分配任意 `n` 页的连续内存。先取满足
//!   `2^order >= n` 的最小块，再立即把多出来的尾部页退回伙伴系统；
//!   请求的页数记录在首页上，供 [`PhysAllocator::free_contig`] 原样释放
//! - [`PhysAllocator::get_page`] / [`PhysAllocator::put_page`]：单页引用计数，
//!   计数归零时自动释放
//!
//! 分配失败返回 [`VmError::NoMemory`]，由调用者决定是否先回收页缓存再重试。

mod page;
mod segment;

pub use page::{PageFlags, PageId, PhysPage};
pub use segment::{ORDER_NONE, PhysSegment};

use alloc::vec::Vec;

use crate::address::{AlignOps, PAGE_SIZE, SECTION_SIZE, ranges_overlap};
use crate::arch_ops::phys_ptr;
use crate::config::{MAX_ORDER, NR_ORDERS};
use crate::error::{VmError, VmResult};
use segment::order_for;

/// 物理页帧分配器
pub struct PhysAllocator {
    pages: Vec<PhysPage>,
    segments: Vec<PhysSegment>,
}

impl PhysAllocator {
    /// 用若干 `(起始物理地址, 字节数)` 描述的物理段创建分配器
    ///
    /// 段起始地址必须 1 MiB 对齐，大小必须是页大小的整数倍且互不重叠。
    pub fn new(ranges: &[(usize, usize)]) -> VmResult<Self> {
        if ranges.is_empty() || ranges.len() > u8::MAX as usize {
            return Err(VmError::InvalidArgs);
        }
        for (i, &(start, size)) in ranges.iter().enumerate() {
            if size == 0 || !start.is_aligned(SECTION_SIZE) || !size.is_page_aligned() {
                return Err(VmError::InvalidArgs);
            }
            if ranges[..i]
                .iter()
                .any(|&(s, l)| ranges_overlap(s, l, start, size))
            {
                return Err(VmError::InvalidArgs);
            }
        }

        let total: usize = ranges.iter().map(|&(_, size)| size / PAGE_SIZE).sum();
        if total > u32::MAX as usize {
            return Err(VmError::InvalidArgs);
        }
        let mut pages = Vec::with_capacity(total);
        let mut segments = Vec::with_capacity(ranges.len());
        for (id, &(start, size)) in ranges.iter().enumerate() {
            let nr = size / PAGE_SIZE;
            let first = pages.len() as u32;
            pages.extend((0..nr).map(|i| PhysPage::new(start + i * PAGE_SIZE, id as u8)));
            segments.push(PhysSegment::new(id as u8, start, nr, first));
            log::debug!(
                "phys: segment {} [{:#x}, {:#x}) {} pages",
                id,
                start,
                start + size,
                nr
            );
        }
        Ok(Self { pages, segments })
    }

    /// 所有物理段
    pub fn segments(&self) -> &[PhysSegment] {
        &self.segments
    }

    /// 页描述符
    #[inline]
    pub fn page(&self, id: PageId) -> &PhysPage {
        &self.pages[id.index()]
    }

    /// 页所属的物理段
    pub fn segment_of(&self, id: PageId) -> &PhysSegment {
        let seg = self.page(id).seg_id() as usize;
        &self.segments[seg]
    }

    /// 页的物理地址
    #[inline]
    pub fn page_to_paddr(&self, id: PageId) -> usize {
        self.page(id).paddr()
    }

    /// 物理地址所在的页；不受本分配器管理时返回 `None`
    pub fn paddr_to_page(&self, paddr: usize) -> Option<PageId> {
        self.segments
            .iter()
            .find(|seg| seg.contains_paddr(paddr))
            .map(|seg| PageId(seg.first() + ((paddr - seg.start()) / PAGE_SIZE) as u32))
    }

    /// 分配 `2^order` 页的块，首页引用计数为 1
    pub fn alloc(&self, order: usize) -> VmResult<PageId> {
        if order > MAX_ORDER {
            return Err(VmError::InvalidArgs);
        }
        self.alloc_contig(1 << order)
    }

    /// 分配单页
    pub fn alloc_page(&self) -> VmResult<PageId> {
        self.alloc(0)
    }

    /// 分配单页并清零
    pub fn alloc_zeroed_page(&self) -> VmResult<PageId> {
        let page = self.alloc(0)?;
        self.zero_page(page);
        Ok(page)
    }

    /// 分配 `count` 个物理连续的页，首页引用计数为 1
    pub fn alloc_contig(&self, count: usize) -> VmResult<PageId> {
        if count == 0 || count > u32::MAX as usize {
            return Err(VmError::InvalidArgs);
        }
        for seg in &self.segments {
            if let Some(idx) = Self::alloc_from(seg, count) {
                let head = PageId(seg.first() + idx);
                for i in 0..count {
                    let p = self.page(PageId(head.0 + i as u32));
                    p.reset_flags(PageFlags::empty());
                    p.set_refcount(0);
                }
                let p = self.page(head);
                p.set_refcount(1);
                p.set_nr_pages(count as u32);
                return Ok(head);
            }
        }
        log::debug!("phys: out of memory allocating {} pages", count);
        Err(VmError::NoMemory)
    }

    fn alloc_from(seg: &PhysSegment, count: usize) -> Option<u32> {
        let mut area = seg.free_area.lock();
        let order = order_for(count);
        let (idx, reserved) = if order <= MAX_ORDER {
            (area.alloc_block(order)?, 1usize << order)
        } else {
            let blocks = count.div_ceil(1 << MAX_ORDER);
            (area.alloc_large(blocks)?, blocks << MAX_ORDER)
        };
        if reserved > count {
            area.free_range(idx + count as u32, reserved - count);
        }
        Some(idx)
    }

    /// 分配 `count` 个不要求连续的单页，失败时已取得的页全部退回
    pub fn alloc_pages(&self, count: usize) -> VmResult<Vec<PageId>> {
        let mut pages = Vec::with_capacity(count);
        for _ in 0..count {
            match self.alloc(0) {
                Ok(p) => pages.push(p),
                Err(e) => {
                    for p in pages {
                        self.free(p);
                    }
                    return Err(e);
                }
            }
        }
        Ok(pages)
    }

    /// 释放由 `alloc` / `alloc_contig` 得到的整块
    pub fn free(&self, head: PageId) {
        let count = self.page(head).nr_pages() as usize;
        if count == 0 {
            crate::vm_fatal!("phys: freeing page {:#x} that is not an allocation head", self.page_to_paddr(head));
        }
        self.release(head, count);
    }

    /// 释放 `alloc_contig(count)` 得到的内存，`count` 必须与分配时一致
    pub fn free_contig(&self, head: PageId, count: usize) -> VmResult<()> {
        let recorded = self.page(head).nr_pages() as usize;
        if recorded == 0 || recorded != count {
            log::warn!(
                "phys: free_contig({:#x}, {}) does not match allocation of {} pages",
                self.page_to_paddr(head),
                count,
                recorded
            );
            return Err(VmError::InvalidArgs);
        }
        self.release(head, count);
        Ok(())
    }

    fn release(&self, head: PageId, count: usize) {
        for i in 0..count {
            let p = self.page(PageId(head.0 + i as u32));
            p.set_refcount(0);
            p.set_nr_pages(0);
            p.reset_flags(PageFlags::FREE);
        }
        let seg = self.segment_of(head);
        seg.free_area
            .lock()
            .free_range(head.0 - seg.first(), count);
    }

    /// 引用计数加一
    pub fn get_page(&self, id: PageId) {
        self.page(id).inc_ref();
    }

    /// 引用计数减一，归零时释放该页所在的整块；返回是否已释放
    pub fn put_page(&self, id: PageId) -> bool {
        let old = self.page(id).dec_ref();
        match old {
            0 => crate::vm_fatal!("phys: refcount underflow on page {:#x}", self.page_to_paddr(id)),
            1 => {
                self.free(id);
                true
            }
            _ => false,
        }
    }

    /// 页内容在直接映射区中的起始指针
    pub fn page_ptr(&self, id: PageId) -> *mut u8 {
        phys_ptr(self.page_to_paddr(id))
    }

    /// 将页清零
    pub fn zero_page(&self, id: PageId) {
        // SAFETY: 页由调用者持有，直接映射区可写
        unsafe { core::ptr::write_bytes(phys_ptr(self.page_to_paddr(id)), 0, PAGE_SIZE) };
    }

    /// 复制整页内容
    pub fn copy_page(&self, dst: PageId, src: PageId) {
        copy_phys_page(self.page_to_paddr(dst), self.page_to_paddr(src));
    }

    /// 空闲页总数
    pub fn free_pages(&self) -> usize {
        self.segments.iter().map(|s| s.free_pages()).sum()
    }

    /// 受管理的页总数
    pub fn total_pages(&self) -> usize {
        self.pages.len()
    }

    /// 已分配的页数
    pub fn used_pages(&self) -> usize {
        self.total_pages() - self.free_pages()
    }

    /// 各阶空闲块数量（所有段之和）
    pub fn order_counts(&self) -> [usize; NR_ORDERS] {
        let mut counts = [0; NR_ORDERS];
        for seg in &self.segments {
            for (o, c) in seg.order_counts().iter().enumerate() {
                counts[o] += c;
            }
        }
        counts
    }

    /// 打印各段的空闲链表统计
    pub fn dump(&self) {
        for seg in &self.segments {
            log::info!(
                "phys seg {}: start {:#x} pages {} free {}",
                seg.id(),
                seg.start(),
                seg.nr_pages(),
                seg.free_pages()
            );
            for (order, count) in seg.order_counts().iter().enumerate() {
                if *count != 0 {
                    log::info!("  order {:>2}: {} blocks", order, count);
                }
            }
        }
    }
}

/// 在直接映射区内复制一整页
pub(crate) fn copy_phys_page(dst: usize, src: usize) {
    // SAFETY: 两个物理页均已分配且不重叠
    unsafe { core::ptr::copy_nonoverlapping(phys_ptr(src), phys_ptr(dst), PAGE_SIZE) };
}

//! 物理页描述符
//!
//! 所有物理页描述符存放在 [`PhysAllocator`](super::PhysAllocator) 持有的数组中，
//! 通过 [`PageId`] 下标访问，伙伴链表与 LRU 链表都只保存下标而不保存指针。

use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

/// 物理页编号：页描述符数组的下标
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct PageId(pub u32);

impl PageId {
    /// 作为数组下标
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    /// 物理页状态位
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// 位于伙伴空闲链表中
        const FREE = 1 << 0;
        /// 已锁定：正在填充内容或被缺页路径占用，不可回收
        const LOCKED = 1 << 1;
        /// 最近被访问
        const REFERENCED = 1 << 2;
        /// 位于活跃 LRU 链表
        const ACTIVE = 1 << 3;
        /// 内容与后备文件不一致
        const DIRTY = 1 << 4;
        /// 被多个地址空间共享
        const SHARED = 1 << 5;
        /// 属于页缓存
        const CACHED = 1 << 6;
        /// 用作页表
        const PGTABLE = 1 << 7;
    }
}

/// 物理页描述符
#[derive(Debug)]
pub struct PhysPage {
    paddr: usize,
    seg_id: u8,
    refcount: AtomicU32,
    flags: AtomicU32,
    /// 分配时记录在首页上的页数，用于按原数量释放
    nr_pages: AtomicU32,
}

impl PhysPage {
    pub(crate) fn new(paddr: usize, seg_id: u8) -> Self {
        Self {
            paddr,
            seg_id,
            refcount: AtomicU32::new(0),
            flags: AtomicU32::new(PageFlags::FREE.bits()),
            nr_pages: AtomicU32::new(0),
        }
    }

    /// 物理地址
    pub fn paddr(&self) -> usize {
        self.paddr
    }

    /// 所属物理段
    pub fn seg_id(&self) -> u8 {
        self.seg_id
    }

    /// 当前引用计数
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub(crate) fn set_refcount(&self, v: u32) {
        self.refcount.store(v, Ordering::Release);
    }

    /// 引用计数加一，返回新值
    pub(crate) fn inc_ref(&self) -> u32 {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// 引用计数减一，返回旧值
    pub(crate) fn dec_ref(&self) -> u32 {
        self.refcount.fetch_sub(1, Ordering::AcqRel)
    }

    /// 当前状态位
    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// 是否设置了所有给定状态位
    pub fn test(&self, flags: PageFlags) -> bool {
        self.flags().contains(flags)
    }

    /// 置位
    pub fn set(&self, flags: PageFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// 清位
    pub fn clear(&self, flags: PageFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// 置位并返回之前是否已全部置位
    pub fn test_and_set(&self, flags: PageFlags) -> bool {
        let old = self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
        PageFlags::from_bits_truncate(old).contains(flags)
    }

    pub(crate) fn reset_flags(&self, flags: PageFlags) {
        self.flags.store(flags.bits(), Ordering::Release);
    }

    pub(crate) fn nr_pages(&self) -> u32 {
        self.nr_pages.load(Ordering::Acquire)
    }

    pub(crate) fn set_nr_pages(&self, n: u32) {
        self.nr_pages.store(n, Ordering::Release);
    }
}

//! 物理内存段与伙伴空闲链表
//!
//! 每个段维护 `NR_ORDERS` 条空闲链表，下标为块大小（页数）的 log2。
//! 链表以段内页下标为键保存在 `BTreeSet` 中，便于按地址删除任意伙伴块；
//! 每页的 `free_order` 仅在该页是空闲块首页时有效，否则为 [`ORDER_NONE`]。
//!
//! 段上的所有伙伴操作都在同一把自旋锁内完成，不会阻塞，也不会递归调用分配器。

use alloc::collections::BTreeSet;
use alloc::vec;
use alloc::vec::Vec;

use sync::SpinLock;

use crate::config::{MAX_ORDER, NR_ORDERS};
use crate::page_cache::lru::LruLists;

/// 表示“已分配或位于空闲块内部”的阶
pub const ORDER_NONE: u8 = u8::MAX;

/// 伙伴系统的空闲区
pub(crate) struct FreeArea {
    lists: [BTreeSet<u32>; NR_ORDERS],
    free_order: Vec<u8>,
    free_pages: usize,
}

impl FreeArea {
    fn new(nr_pages: usize) -> Self {
        Self {
            lists: core::array::from_fn(|_| BTreeSet::new()),
            free_order: vec![ORDER_NONE; nr_pages],
            free_pages: 0,
        }
    }

    fn nr_pages(&self) -> usize {
        self.free_order.len()
    }

    /// 从 `order` 阶开始向上查找第一个非空链表，取出并拆分到恰好 `order` 阶
    pub(crate) fn alloc_block(&mut self, order: usize) -> Option<u32> {
        let found = (order..NR_ORDERS).find(|&o| !self.lists[o].is_empty())?;
        let idx = self.lists[found].pop_first()?;
        self.free_order[idx as usize] = ORDER_NONE;

        let mut cur = found;
        while cur > order {
            cur -= 1;
            let half = idx + (1u32 << cur);
            self.push(half, cur);
        }
        self.free_pages -= 1 << order;
        Some(idx)
    }

    /// 释放一个 `order` 阶的块，并与空闲伙伴逐级合并
    ///
    /// 块首页已经处于空闲状态说明链表被破坏，直接停机。
    pub(crate) fn free_block(&mut self, idx: u32, order: usize) {
        if self.free_order[idx as usize] != ORDER_NONE {
            crate::vm_fatal!("buddy: double free of page index {} order {}", idx, order);
        }
        self.free_pages += 1 << order;

        let mut idx = idx;
        let mut order = order;
        while order < MAX_ORDER {
            let buddy = idx ^ (1u32 << order);
            if buddy as usize + (1 << order) > self.nr_pages()
                || self.free_order[buddy as usize] != order as u8
            {
                break;
            }
            self.lists[order].remove(&buddy);
            self.free_order[buddy as usize] = ORDER_NONE;
            idx = idx.min(buddy);
            order += 1;
        }
        self.push(idx, order);
    }

    /// 按“最大对齐的 2 的幂前缀”逐段释放 `[idx, idx + count)`
    pub(crate) fn free_range(&mut self, mut idx: u32, mut count: usize) {
        while count > 0 {
            let order = largest_order(idx, count);
            self.free_block(idx, order);
            idx += 1 << order;
            count -= 1 << order;
        }
    }

    /// 在最大阶链表中寻找 `blocks` 个物理连续的块
    pub(crate) fn alloc_large(&mut self, blocks: usize) -> Option<u32> {
        let step = 1u32 << MAX_ORDER;
        let mut run_start = None;
        let mut run_len = 0;
        let mut prev: Option<u32> = None;
        for &idx in &self.lists[MAX_ORDER] {
            match prev {
                Some(p) if p + step == idx => run_len += 1,
                _ => {
                    run_start = Some(idx);
                    run_len = 1;
                }
            }
            prev = Some(idx);
            if run_len == blocks {
                break;
            }
        }
        if run_len != blocks {
            return None;
        }
        let start = run_start?;
        for i in 0..blocks as u32 {
            let idx = start + i * step;
            self.lists[MAX_ORDER].remove(&idx);
            self.free_order[idx as usize] = ORDER_NONE;
        }
        self.free_pages -= blocks << MAX_ORDER;
        Some(start)
    }

    fn push(&mut self, idx: u32, order: usize) {
        self.lists[order].insert(idx);
        self.free_order[idx as usize] = order as u8;
    }

    pub(crate) fn free_pages(&self) -> usize {
        self.free_pages
    }

    pub(crate) fn order_counts(&self) -> [usize; NR_ORDERS] {
        core::array::from_fn(|o| self.lists[o].len())
    }

    /// 各阶空闲链表的完整内容（段内页下标）
    pub(crate) fn snapshot(&self) -> [Vec<u32>; NR_ORDERS] {
        core::array::from_fn(|o| self.lists[o].iter().copied().collect())
    }
}

/// 不超过 `count` 且满足 `idx` 对齐的最大阶
fn largest_order(idx: u32, count: usize) -> usize {
    let align = if idx == 0 {
        MAX_ORDER
    } else {
        idx.trailing_zeros() as usize
    };
    let fit = (usize::BITS - 1 - count.leading_zeros()) as usize;
    align.min(fit).min(MAX_ORDER)
}

/// 满足 `(1 << order) >= count` 的最小阶
pub(crate) fn order_for(count: usize) -> usize {
    count.next_power_of_two().trailing_zeros() as usize
}

/// 一段物理连续的内存
pub struct PhysSegment {
    id: u8,
    start: usize,
    nr_pages: usize,
    first: u32,
    pub(crate) free_area: SpinLock<FreeArea>,
    /// 页缓存的活跃/非活跃链表
    pub(crate) lru: SpinLock<LruLists>,
}

impl PhysSegment {
    pub(crate) fn new(id: u8, start: usize, nr_pages: usize, first: u32) -> Self {
        let mut area = FreeArea::new(nr_pages);
        area.free_range(0, nr_pages);
        Self {
            id,
            start,
            nr_pages,
            first,
            free_area: SpinLock::new(area),
            lru: SpinLock::new(LruLists::new()),
        }
    }

    /// 段编号
    pub fn id(&self) -> u8 {
        self.id
    }

    /// 起始物理地址
    pub fn start(&self) -> usize {
        self.start
    }

    /// 段内总页数
    pub fn nr_pages(&self) -> usize {
        self.nr_pages
    }

    /// 段内第一页的全局编号
    pub(crate) fn first(&self) -> u32 {
        self.first
    }

    /// 全局页编号是否属于本段
    pub(crate) fn contains_id(&self, id: u32) -> bool {
        id >= self.first && ((id - self.first) as usize) < self.nr_pages
    }

    /// 物理地址是否属于本段
    pub fn contains_paddr(&self, paddr: usize) -> bool {
        paddr >= self.start && (paddr - self.start) / crate::address::PAGE_SIZE < self.nr_pages
    }

    /// 当前空闲页数
    pub fn free_pages(&self) -> usize {
        self.free_area.lock().free_pages()
    }

    /// 各阶空闲块的数量
    pub fn order_counts(&self) -> [usize; NR_ORDERS] {
        self.free_area.lock().order_counts()
    }

    /// 各阶空闲链表的内容（段内页下标，升序）
    pub fn free_lists(&self) -> [Vec<u32>; NR_ORDERS] {
        self.free_area.lock().snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_population_uses_largest_blocks() {
        let mut area = FreeArea::new(256 + 3);
        area.free_range(0, 256 + 3);
        let counts = area.order_counts();
        assert_eq!(counts[MAX_ORDER], 1);
        assert_eq!(counts[1], 1);
        assert_eq!(counts[0], 1);
        assert_eq!(area.free_pages(), 259);
    }

    #[test]
    fn split_then_merge_restores_block() {
        let mut area = FreeArea::new(256);
        area.free_range(0, 256);
        let a = area.alloc_block(0).unwrap();
        assert_eq!(a, 0);
        let counts = area.order_counts();
        assert_eq!(counts[MAX_ORDER], 0);
        for o in 0..MAX_ORDER {
            assert_eq!(counts[o], 1, "order {}", o);
        }
        area.free_block(a, 0);
        assert_eq!(area.order_counts()[MAX_ORDER], 1);
        assert_eq!(area.free_pages(), 256);
    }

    #[test]
    fn non_buddy_neighbours_do_not_merge() {
        let mut area = FreeArea::new(4);
        area.free_range(0, 4);
        let a = area.alloc_block(0).unwrap();
        let b = area.alloc_block(0).unwrap();
        let c = area.alloc_block(0).unwrap();
        assert_eq!((a, b, c), (0, 1, 2));
        // 1 和 2 相邻但不是伙伴，2 只会与 3 合并
        area.free_block(1, 0);
        area.free_block(2, 0);
        assert_eq!(area.order_counts()[0], 1);
        assert_eq!(area.order_counts()[1], 1);
        area.free_block(0, 0);
        assert_eq!(area.order_counts()[2], 1);
    }

    #[test]
    fn largest_order_peels_aligned_prefixes() {
        assert_eq!(largest_order(0, 3), 1);
        assert_eq!(largest_order(2, 1), 0);
        assert_eq!(largest_order(4, 8), 2);
        assert_eq!(largest_order(0, 1000), MAX_ORDER);
        assert_eq!(order_for(1), 0);
        assert_eq!(order_for(3), 2);
        assert_eq!(order_for(256), 8);
    }

    #[test]
    fn large_alloc_takes_consecutive_max_blocks() {
        let mut area = FreeArea::new(1024);
        area.free_range(0, 1024);
        let first = area.alloc_block(MAX_ORDER).unwrap();
        assert_eq!(first, 0);
        let start = area.alloc_large(2).unwrap();
        assert_eq!(start, 256);
        assert_eq!(area.free_pages(), 256);
        assert!(area.alloc_large(2).is_none());
    }
}

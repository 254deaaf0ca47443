//! 页缓存的活跃/非活跃链表
//!
//! 每个物理段各有一对链表，由段上的自旋锁保护。链表不使用侵入式指针：
//! 两个 `BTreeMap` 以单调递增的时间戳为键保存页号，键最小者为链表头（最久未用），
//! 另有一张按页号索引的表记录页所在的链表、时间戳和所属文件映射。
//!
//! 命中时的两位时钟提升：
//!
//! ```text
//! Referenced && !Active  => Active, !Referenced，移到活跃链表尾
//! !Referenced            => Referenced，移到当前链表尾
//! ```
//!
//! 回收时的降级与之相反：`Active && !Referenced` 降到非活跃链表并置 Referenced，
//! 否则仅清除 Referenced。

use alloc::collections::BTreeMap;
use alloc::sync::Weak;
use alloc::vec::Vec;

use hashbrown::HashMap;

use super::FileMapping;
use crate::phys::{PageFlags, PageId, PhysAllocator, PhysPage};

/// 页所在的链表
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LruKind {
    /// 活跃链表
    Active,
    /// 非活跃链表
    Inactive,
}

struct LruEntry {
    kind: LruKind,
    stamp: u64,
    owner: Weak<FileMapping>,
    pgoff: u64,
}

/// 回收候选：页号、所属文件映射、页偏移
pub(crate) type Candidate = (PageId, Weak<FileMapping>, u64);

/// 一个物理段上的两条 LRU 链表
pub(crate) struct LruLists {
    active: BTreeMap<u64, PageId>,
    inactive: BTreeMap<u64, PageId>,
    entries: HashMap<PageId, LruEntry>,
    next_stamp: u64,
}

impl LruLists {
    pub(crate) fn new() -> Self {
        Self {
            active: BTreeMap::new(),
            inactive: BTreeMap::new(),
            entries: HashMap::new(),
            next_stamp: 0,
        }
    }

    fn list_mut(&mut self, kind: LruKind) -> &mut BTreeMap<u64, PageId> {
        match kind {
            LruKind::Active => &mut self.active,
            LruKind::Inactive => &mut self.inactive,
        }
    }

    fn stamp(&mut self) -> u64 {
        self.next_stamp += 1;
        self.next_stamp
    }

    /// 加入 `kind` 链表尾
    pub(crate) fn insert(&mut self, page: PageId, kind: LruKind, owner: Weak<FileMapping>, pgoff: u64) {
        self.remove(page);
        let stamp = self.stamp();
        self.list_mut(kind).insert(stamp, page);
        self.entries.insert(
            page,
            LruEntry {
                kind,
                stamp,
                owner,
                pgoff,
            },
        );
    }

    /// 从链表中删除，返回页是否在链表上
    pub(crate) fn remove(&mut self, page: PageId) -> bool {
        match self.entries.remove(&page) {
            Some(e) => {
                self.list_mut(e.kind).remove(&e.stamp);
                true
            }
            None => false,
        }
    }

    /// 移到 `kind` 链表尾
    pub(crate) fn move_to_tail(&mut self, page: PageId, kind: LruKind) {
        let stamp = self.stamp();
        let Some(e) = self.entries.get_mut(&page) else {
            return;
        };
        let (old_kind, old_stamp) = (e.kind, e.stamp);
        e.kind = kind;
        e.stamp = stamp;
        self.list_mut(old_kind).remove(&old_stamp);
        self.list_mut(kind).insert(stamp, page);
    }

    /// 页所在的链表
    pub(crate) fn kind_of(&self, page: PageId) -> Option<LruKind> {
        self.entries.get(&page).map(|e| e.kind)
    }

    /// 链表长度
    pub(crate) fn len(&self, kind: LruKind) -> usize {
        match kind {
            LruKind::Active => self.active.len(),
            LruKind::Inactive => self.inactive.len(),
        }
    }

    /// 从链表头开始的至多 `n` 个页
    pub(crate) fn head(&self, kind: LruKind, n: usize) -> Vec<PageId> {
        let list = match kind {
            LruKind::Active => &self.active,
            LruKind::Inactive => &self.inactive,
        };
        list.values().take(n).copied().collect()
    }

    /// 非活跃链表头部的至多 `n` 个回收候选
    pub(crate) fn candidates(&self, n: usize) -> Vec<Candidate> {
        self.inactive
            .values()
            .take(n)
            .filter_map(|p| self.entries.get(p).map(|e| (*p, e.owner.clone(), e.pgoff)))
            .collect()
    }
}

/// 新缓存页加入非活跃链表尾，访问位清零
pub(crate) fn lru_add(phys: &PhysAllocator, page: PageId, owner: Weak<FileMapping>, pgoff: u64) {
    let mut lists = phys.segment_of(page).lru.lock();
    phys.page(page).clear(PageFlags::ACTIVE | PageFlags::REFERENCED);
    lists.insert(page, LruKind::Inactive, owner, pgoff);
}

/// 从 LRU 链表中删除
pub(crate) fn lru_del(phys: &PhysAllocator, page: PageId) {
    let mut lists = phys.segment_of(page).lru.lock();
    lists.remove(page);
    phys.page(page).clear(PageFlags::ACTIVE | PageFlags::REFERENCED);
}

/// 页缓存命中
pub(crate) fn mark_accessed(phys: &PhysAllocator, page: PageId) {
    let mut lists = phys.segment_of(page).lru.lock();
    let Some(kind) = lists.kind_of(page) else {
        return;
    };
    let desc = phys.page(page);
    let kind = promote(desc, kind);
    lists.move_to_tail(page, kind);
}

fn promote(desc: &PhysPage, kind: LruKind) -> LruKind {
    let referenced = desc.test(PageFlags::REFERENCED);
    if referenced && !desc.test(PageFlags::ACTIVE) {
        desc.clear(PageFlags::REFERENCED);
        desc.set(PageFlags::ACTIVE);
        LruKind::Active
    } else {
        if !referenced {
            desc.set(PageFlags::REFERENCED);
        }
        kind
    }
}

fn demote(desc: &PhysPage, kind: LruKind) -> LruKind {
    if desc.test(PageFlags::ACTIVE) && !desc.test(PageFlags::REFERENCED) {
        desc.clear(PageFlags::ACTIVE);
        desc.set(PageFlags::REFERENCED);
        LruKind::Inactive
    } else {
        desc.clear(PageFlags::REFERENCED);
        kind
    }
}

/// 活跃链表比非活跃链表长时，从活跃链表头开始降级多出的部分
pub(crate) fn shrink_active(phys: &PhysAllocator, lists: &mut LruLists) -> usize {
    let active = lists.len(LruKind::Active);
    let inactive = lists.len(LruKind::Inactive);
    if active <= inactive {
        return 0;
    }
    let mut moved = 0;
    for page in lists.head(LruKind::Active, active - inactive) {
        let kind = demote(phys.page(page), LruKind::Active);
        if kind == LruKind::Inactive {
            moved += 1;
        }
        lists.move_to_tail(page, kind);
    }
    moved
}

//! 页缓存回收
//!
//! 两遍扫描：先在活跃链表过长时把多出的部分降级，再从非活跃链表头开始淘汰。
//! 候选页在 LRU 锁下取快照，随后放开 LRU 锁、按 文件映射锁 → LRU 锁 的顺序逐个处理。
//!
//! 跳过的页：被锁定的、有在途引用的、已映射且可执行的、已映射且为脏的。
//! 已映射的干净页先通过反向映射解除所有映射；未映射的脏页从缓存摘下后
//! 先写回再释放，每个脏页恰好写回一次。

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::{FileMapping, FilePage, PageCache, Rmap, lru};
use crate::phys::{PageFlags, PageId};

impl PageCache {
    /// 尝试回收至多 `nr` 个缓存页，返回实际回收的页数
    pub fn try_shrink(&self, nr: usize) -> usize {
        let mut reclaimed = 0;
        let mut writeback: Vec<(Arc<FileMapping>, FilePage)> = Vec::new();

        for seg in self.phys.segments() {
            if reclaimed >= nr {
                break;
            }
            let candidates = {
                let mut lists = seg.lru.lock();
                lru::shrink_active(&self.phys, &mut lists);
                lists.candidates(self.shrink_scan.max(nr))
            };
            for (page, owner, pgoff) in candidates {
                if reclaimed >= nr {
                    break;
                }
                let Some(mapping) = owner.upgrade() else {
                    continue;
                };
                let Some(fp) = self.evict(&mapping, pgoff, page) else {
                    continue;
                };
                reclaimed += 1;
                if fp.is_dirty() {
                    writeback.push((mapping, fp));
                } else {
                    self.phys.put_page(page);
                }
            }
        }

        for (mapping, mut fp) in writeback {
            if let Some((off, end)) = fp.take_dirty() {
                if let Err(e) = mapping.write_back(fp.page, fp.pgoff, off, end) {
                    log::warn!(
                        "page cache: lost dirty page ino {} pgoff {} during reclaim: {}",
                        mapping.ino(),
                        fp.pgoff,
                        e
                    );
                }
            }
            self.phys.page(fp.page).clear(PageFlags::DIRTY);
            self.phys.put_page(fp.page);
        }

        if reclaimed != 0 {
            log::debug!("page cache: reclaimed {} of {} requested pages", reclaimed, nr);
        }
        reclaimed
    }

    /// 把一页从缓存中摘下，返回时页上只剩缓存自身的那个引用
    fn evict(&self, mapping: &FileMapping, pgoff: u64, page: PageId) -> Option<FilePage> {
        let mut pages = mapping.pages.lock();
        let fp = pages.get(&pgoff).filter(|fp| fp.page == page)?;
        let desc = self.phys.page(page);
        if desc.test(PageFlags::LOCKED) || desc.refcount() as usize > 1 + fp.rmaps.len() {
            return None;
        }
        if !fp.rmaps.is_empty() {
            if fp.is_dirty() || fp.rmaps.iter().any(Rmap::is_executable) {
                return None;
            }
            fp.rmaps.iter().for_each(Rmap::unmap);
        }
        let fp = pages.remove(&pgoff)?;
        lru::lru_del(&self.phys, page);
        drop(pages);

        for _ in &fp.rmaps {
            self.phys.put_page(page);
        }
        desc.clear(PageFlags::CACHED);
        Some(fp)
    }
}

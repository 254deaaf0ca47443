//! ASID 分配
//!
//! ARMv7 的 CONTEXTIDR 提供 8 位 ASID，TLB 表项按 ASID 打标签，
//! 切换地址空间时无需整体刷新 TLB。ASID 0 保留给内核地址空间。

use lazy_static::lazy_static;
use sync::SpinLock;

use crate::arch_ops::arch_ops;
use crate::error::{VmError, VmResult};

/// 地址空间标识
pub type Asid = u16;

/// 可用 ASID 的数量
pub const NR_ASIDS: usize = 256;

/// 内核地址空间使用的 ASID
pub const KERNEL_ASID: Asid = 0;

/// ASID 位图
struct AsidPool {
    bitmap: [u64; NR_ASIDS / 64],
    next: usize,
}

impl AsidPool {
    const fn new() -> Self {
        Self {
            bitmap: [1, 0, 0, 0],
            next: 1,
        }
    }

    fn alloc(&mut self) -> Option<Asid> {
        for i in 0..NR_ASIDS {
            let asid = (self.next + i) % NR_ASIDS;
            let (word, bit) = (asid / 64, asid % 64);
            if self.bitmap[word] & (1 << bit) == 0 {
                self.bitmap[word] |= 1 << bit;
                self.next = (asid + 1) % NR_ASIDS;
                return Some(asid as Asid);
            }
        }
        None
    }

    fn free(&mut self, asid: Asid) -> bool {
        let asid = asid as usize;
        let (word, bit) = (asid / 64, asid % 64);
        let was_set = self.bitmap[word] & (1 << bit) != 0;
        self.bitmap[word] &= !(1 << bit);
        was_set
    }
}

lazy_static! {
    /// 全局 ASID 池，由自旋锁保护。
    static ref ASID_POOL: SpinLock<AsidPool> = SpinLock::new(AsidPool::new());
}

/// 分配一个空闲 ASID
pub fn alloc_asid() -> VmResult<Asid> {
    ASID_POOL.lock().alloc().ok_or_else(|| {
        log::warn!("asid: pool exhausted");
        VmError::NoMemory
    })
}

/// 归还 ASID，并使其全部 TLB 表项失效
pub fn free_asid(asid: Asid) {
    if asid == KERNEL_ASID {
        return;
    }
    if !ASID_POOL.lock().free(asid) {
        log::warn!("asid: freeing unallocated asid {}", asid);
        return;
    }
    let ops = arch_ops();
    ops.tlb_invalidate_asid(asid);
    ops.barrier();
}

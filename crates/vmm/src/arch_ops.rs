//! 架构相关内存管理操作 trait 定义和注册

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::asid::Asid;

/// 架构相关内存管理操作
///
/// 此 trait 抽象了架构特定的内存操作，包括物理地址到直接映射区的转换、TLB 维护和 TTBR 切换。
/// 内核需要为具体平台实现此 trait。
pub trait ArchMmOps: Send + Sync {
    /// 将物理地址转换为直接映射区的虚拟地址
    fn paddr_to_vaddr(&self, paddr: usize) -> usize;

    /// 使某个 ASID 下单个虚拟页的 TLB 表项失效（TLBIMVA）
    fn tlb_invalidate_page(&self, asid: Asid, vaddr: usize);

    /// 使某个 ASID 的全部 TLB 表项失效（TLBIASID）
    fn tlb_invalidate_asid(&self, asid: Asid);

    /// 数据与指令同步屏障（DSB + ISB）
    fn barrier(&self);

    /// 切换 TTBR0 与 CONTEXTIDR
    fn switch_ttbr(&self, ttbr: usize, asid: Asid);
}

/// TLB 批处理上下文
///
/// 收集一次页表修改中需要失效的虚拟页，在 [`TlbBatch::flush`] 或 drop 时统一提交，
/// 屏障每批只发一次。待失效的页过多时退化为按 ASID 整体失效。
pub struct TlbBatch {
    asid: Asid,
    pending: [usize; TlbBatch::CAPACITY],
    len: usize,
    overflow: bool,
}

impl TlbBatch {
    const CAPACITY: usize = 32;

    /// 创建新的批处理上下文
    pub fn new(asid: Asid) -> Self {
        Self {
            asid,
            pending: [0; Self::CAPACITY],
            len: 0,
            overflow: false,
        }
    }

    /// 记录一个需要失效的虚拟页
    pub fn add(&mut self, vaddr: usize) {
        if self.len < Self::CAPACITY {
            self.pending[self.len] = vaddr;
            self.len += 1;
        } else {
            self.overflow = true;
        }
    }

    /// 批中是否有待处理项
    pub fn is_empty(&self) -> bool {
        self.len == 0 && !self.overflow
    }

    /// 提交所有待处理的 TLB 失效
    pub fn flush(&mut self) {
        if self.is_empty() {
            return;
        }
        let ops = arch_ops();
        if self.overflow {
            ops.tlb_invalidate_asid(self.asid);
        } else {
            for &va in &self.pending[..self.len] {
                ops.tlb_invalidate_page(self.asid, va);
            }
        }
        ops.barrier();
        self.len = 0;
        self.overflow = false;
    }

    /// 在批处理上下文中执行操作，结束后统一提交
    pub fn execute<F, R>(asid: Asid, f: F) -> R
    where
        F: FnOnce(&mut Self) -> R,
    {
        let mut batch = Self::new(asid);
        let result = f(&mut batch);
        batch.flush();
        result
    }
}

impl Drop for TlbBatch {
    fn drop(&mut self) {
        self.flush();
    }
}

static ARCH_OPS_DATA: AtomicUsize = AtomicUsize::new(0);
static ARCH_OPS_VTABLE: AtomicUsize = AtomicUsize::new(0);

/// 注册架构操作实现
///
/// # Safety
/// 必须在单线程环境下调用；重复注册时新旧实现必须可以互换
pub unsafe fn register_arch_ops(ops: &'static dyn ArchMmOps) {
    let ptr = ops as *const dyn ArchMmOps;
    // SAFETY: 将 fat pointer 拆分为 data 和 vtable 两部分存储
    let (data, vtable) =
        unsafe { core::mem::transmute::<*const dyn ArchMmOps, (usize, usize)>(ptr) };
    ARCH_OPS_VTABLE.store(vtable, Ordering::Release);
    ARCH_OPS_DATA.store(data, Ordering::Release);
}

/// 获取已注册的架构操作实现
///
/// # Panics
/// 如果尚未调用 [`register_arch_ops`] 注册实现，则 panic
#[inline]
pub fn arch_ops() -> &'static dyn ArchMmOps {
    let data = ARCH_OPS_DATA.load(Ordering::Acquire);
    let vtable = ARCH_OPS_VTABLE.load(Ordering::Acquire);
    if data == 0 {
        panic!("vmm: ArchMmOps not registered");
    }
    // SAFETY: 重组 fat pointer
    unsafe { &*core::mem::transmute::<(usize, usize), *const dyn ArchMmOps>((data, vtable)) }
}

/// 物理地址处的字节指针
pub(crate) fn phys_ptr(paddr: usize) -> *mut u8 {
    arch_ops().paddr_to_vaddr(paddr) as *mut u8
}

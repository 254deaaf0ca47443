//! 内存管理配置
//!
//! 描述内核/用户地址空间布局和内存回收策略。页大小固定为 4 KiB，
//! 伙伴分配器最大阶固定为 8（256 页）。

use crate::address::{AlignOps, PAGE_SIZE, SECTION_SIZE};
use crate::error::{VmError, VmResult};

/// 伙伴分配器的最大阶（含）
pub const MAX_ORDER: usize = 8;
/// 伙伴空闲链表的数量
pub const NR_ORDERS: usize = MAX_ORDER + 1;
/// 单次回收最多扫描的页数
pub const DEFAULT_SHRINK_SCAN: usize = 64;

/// 内存管理配置
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// 内核地址空间起始地址
    pub kernel_base: usize,
    /// 内核地址空间大小
    pub kernel_size: usize,
    /// vmalloc 区起始地址（位于内核地址空间内）
    pub vmalloc_base: usize,
    /// vmalloc 区大小
    pub vmalloc_size: usize,
    /// 用户地址空间起始地址
    pub user_base: usize,
    /// 用户地址空间大小
    pub user_size: usize,
    /// 用户堆起始地址
    pub user_heap_base: usize,
    /// mmap 首次适配扫描的起始地址，同时也是堆的上界
    pub user_map_base: usize,
    /// 空闲内存低于该值（字节）时 OOM 监控认为内存不足
    pub oom_low_mem_threshold: usize,
    /// 空闲内存低于该值（字节）时 OOM 监控主动回收页缓存
    pub oom_reclaim_mem_threshold: usize,
    /// 单次回收最多扫描的页数
    pub shrink_scan: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            kernel_base: 0x4000_0000,
            kernel_size: 0x4000_0000,
            vmalloc_base: 0x7000_0000,
            vmalloc_size: 0x0800_0000,
            user_base: 0x0100_0000,
            user_size: 0x3e00_0000,
            user_heap_base: 0x0200_0000,
            user_map_base: 0x1000_0000,
            oom_low_mem_threshold: 0x8_0000,
            oom_reclaim_mem_threshold: 0x10_0000,
            shrink_scan: DEFAULT_SHRINK_SCAN,
        }
    }
}

impl VmConfig {
    /// 校验布局：全部对齐、互不重叠、位于 32 位地址空间内
    pub fn validate(&self) -> VmResult<()> {
        let aligned = [
            self.kernel_base,
            self.kernel_size,
            self.user_base,
            self.user_size,
            self.vmalloc_base,
            self.vmalloc_size,
        ]
        .iter()
        .all(|v| v.is_aligned(SECTION_SIZE))
            && self.user_heap_base.is_aligned(PAGE_SIZE)
            && self.user_map_base.is_aligned(PAGE_SIZE);
        if !aligned {
            return Err(VmError::InvalidArgs);
        }

        let kernel_end = self.kernel_base.checked_add(self.kernel_size);
        let user_end = self.user_base.checked_add(self.user_size);
        let (Some(kernel_end), Some(user_end)) = (kernel_end, user_end) else {
            return Err(VmError::InvalidArgs);
        };
        if kernel_end as u64 > 1u64 << 32 || user_end as u64 > 1u64 << 32 {
            return Err(VmError::InvalidArgs);
        }
        if crate::address::ranges_overlap(
            self.kernel_base,
            self.kernel_size,
            self.user_base,
            self.user_size,
        ) {
            return Err(VmError::InvalidArgs);
        }
        if self.vmalloc_base < self.kernel_base
            || self.vmalloc_base + self.vmalloc_size > kernel_end
        {
            return Err(VmError::InvalidArgs);
        }
        if !(self.user_base <= self.user_heap_base
            && self.user_heap_base <= self.user_map_base
            && self.user_map_base < user_end)
        {
            return Err(VmError::InvalidArgs);
        }
        if self.oom_low_mem_threshold > self.oom_reclaim_mem_threshold {
            return Err(VmError::InvalidArgs);
        }
        Ok(())
    }

    /// 地址是否落在内核地址空间
    pub fn is_kernel_addr(&self, vaddr: usize) -> bool {
        vaddr >= self.kernel_base && vaddr - self.kernel_base < self.kernel_size
    }

    /// 地址是否落在用户地址空间
    pub fn is_user_addr(&self, vaddr: usize) -> bool {
        vaddr >= self.user_base && vaddr - self.user_base < self.user_size
    }
}

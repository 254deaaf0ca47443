//! 映射区域
//!
//! 一个 [`Region`] 描述地址空间中一段连续、权限一致的虚拟地址。
//! 区域本身不拥有物理页：匿名页由页表持有引用，文件页由页缓存持有。

use alloc::sync::Arc;

use bitflags::bitflags;

use crate::address::PAGE_SIZE;
use crate::arch::MmuFlags;
use crate::fault::FaultFlags;
use crate::file::VmFileOps;
use crate::page_cache::FileMapping;

bitflags! {
    /// 区域属性
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        /// 可读
        const READ = 1 << 0;
        /// 可写
        const WRITE = 1 << 1;
        /// 可执行
        const EXECUTE = 1 << 2;
        /// 用户态可访问
        const USER = 1 << 3;
        /// 共享映射：写入对所有映射者可见
        const SHARED = 1 << 4;
        /// 私有映射：写入触发写时复制
        const PRIVATE = 1 << 5;
        /// 不可缓存的普通内存
        const UNCACHED = 1 << 6;
        /// 设备内存
        const DEVICE = 1 << 7;
        /// 用户堆（brk）
        const HEAP = 1 << 8;
        /// 用户栈
        const STACK = 1 << 9;
        /// 由 MAP_FIXED 建立
        const FIXED = 1 << 10;
        /// 内核 vmalloc 区
        const VMALLOC = 1 << 11;

        /// 权限位
        const PERM_MASK = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

impl RegionFlags {
    /// 转换为页表属性
    pub fn mmu_flags(self) -> MmuFlags {
        let mut flags = MmuFlags::empty();
        if self.contains(RegionFlags::READ) {
            flags |= MmuFlags::PERM_READ;
        }
        if self.contains(RegionFlags::WRITE) {
            flags |= MmuFlags::PERM_READ | MmuFlags::PERM_WRITE;
        }
        if self.contains(RegionFlags::EXECUTE) {
            flags |= MmuFlags::PERM_EXECUTE;
        }
        if self.contains(RegionFlags::USER) {
            flags |= MmuFlags::PERM_USER;
        }
        if self.contains(RegionFlags::DEVICE) {
            flags |= MmuFlags::UNCACHED_DEVICE;
        } else if self.contains(RegionFlags::UNCACHED) {
            flags |= MmuFlags::UNCACHED;
        }
        flags
    }
}

/// 区域的后备
#[derive(Clone)]
pub enum RegionBacking {
    /// 匿名内存，首次访问时分配清零页
    Anonymous,
    /// 通过页缓存映射的文件
    File(Arc<FileMapping>),
    /// 驱动提供映射操作表
    Device(Arc<dyn VmFileOps>),
}

impl core::fmt::Debug for RegionBacking {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RegionBacking::Anonymous => write!(f, "Anonymous"),
            RegionBacking::File(mapping) => write!(f, "File(ino={})", mapping.ino()),
            RegionBacking::Device(_) => write!(f, "Device"),
        }
    }
}

/// 一段映射区域
#[derive(Debug, Clone)]
pub struct Region {
    base: usize,
    size: usize,
    flags: RegionFlags,
    pgoff: u64,
    backing: RegionBacking,
}

impl Region {
    /// 创建区域，`base` 与 `size` 必须页对齐
    pub fn new(base: usize, size: usize, flags: RegionFlags, pgoff: u64, backing: RegionBacking) -> Self {
        debug_assert!(base % PAGE_SIZE == 0 && size % PAGE_SIZE == 0 && size != 0);
        Self {
            base,
            size,
            flags,
            pgoff,
            backing,
        }
    }

    /// 起始地址
    pub fn base(&self) -> usize {
        self.base
    }

    /// 大小（字节）
    pub fn size(&self) -> usize {
        self.size
    }

    /// 结束地址（不含）
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    /// 页数
    pub fn pages(&self) -> usize {
        self.size / PAGE_SIZE
    }

    /// 属性
    pub fn flags(&self) -> RegionFlags {
        self.flags
    }

    /// 起始地址对应的文件页偏移
    pub fn pgoff(&self) -> u64 {
        self.pgoff
    }

    /// 后备
    pub fn backing(&self) -> &RegionBacking {
        &self.backing
    }

    /// 文件区域的页缓存映射
    pub fn mapping(&self) -> Option<&Arc<FileMapping>> {
        match &self.backing {
            RegionBacking::File(mapping) => Some(mapping),
            _ => None,
        }
    }

    /// 是否为匿名区域
    pub fn is_anonymous(&self) -> bool {
        matches!(self.backing, RegionBacking::Anonymous)
    }

    /// 是否为共享映射
    pub fn is_shared(&self) -> bool {
        self.flags.contains(RegionFlags::SHARED)
    }

    /// 是否包含 `vaddr`
    pub fn contains(&self, vaddr: usize) -> bool {
        vaddr >= self.base && vaddr < self.end()
    }

    /// 是否与 `[base, base + len)` 重叠
    pub fn overlaps(&self, base: usize, len: usize) -> bool {
        crate::address::ranges_overlap(self.base, self.size, base, len)
    }

    /// `vaddr` 所在页的文件页偏移
    pub fn pgoff_of(&self, vaddr: usize) -> u64 {
        self.pgoff + ((vaddr - self.base) / PAGE_SIZE) as u64
    }

    /// 本区域页面的页表属性
    pub fn mmu_flags(&self) -> MmuFlags {
        self.flags.mmu_flags()
    }

    /// 区域权限是否允许这种访问
    pub fn permits(&self, access: FaultFlags) -> bool {
        if access.contains(FaultFlags::USER) && !self.flags.contains(RegionFlags::USER) {
            return false;
        }
        if access.contains(FaultFlags::WRITE) {
            return self.flags.contains(RegionFlags::WRITE);
        }
        if access.contains(FaultFlags::EXECUTE) {
            return self.flags.contains(RegionFlags::EXECUTE);
        }
        self.flags.intersects(RegionFlags::READ | RegionFlags::WRITE)
    }

    /// 在 `at` 处切开，自身保留前半段，返回后半段
    ///
    /// 后半段复制全部元数据，文件页偏移按切分点重新计算。
    pub(crate) fn split_off(&mut self, at: usize) -> Region {
        debug_assert!(at > self.base && at < self.end() && at % PAGE_SIZE == 0);
        let tail = Region {
            base: at,
            size: self.end() - at,
            flags: self.flags,
            pgoff: self.pgoff_of(at),
            backing: self.backing.clone(),
        };
        self.size = at - self.base;
        tail
    }

    /// 与紧邻的后一个区域是否可以合并
    pub(crate) fn can_merge(&self, next: &Region) -> bool {
        self.end() == next.base
            && self.flags == next.flags
            && self.is_anonymous()
            && next.is_anonymous()
    }

    pub(crate) fn set_flags(&mut self, flags: RegionFlags) {
        self.flags = flags;
    }

    pub(crate) fn set_size(&mut self, size: usize) {
        self.size = size;
    }

    pub(crate) fn set_base(&mut self, base: usize, pgoff: u64) {
        self.base = base;
        self.pgoff = pgoff;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anon(base: usize, pages: usize, flags: RegionFlags) -> Region {
        Region::new(base, pages * PAGE_SIZE, flags, 0, RegionBacking::Anonymous)
    }

    #[test]
    fn split_recomputes_offset() {
        let mut r = Region::new(
            0x1000_0000,
            4 * PAGE_SIZE,
            RegionFlags::READ | RegionFlags::USER,
            10,
            RegionBacking::Anonymous,
        );
        let tail = r.split_off(0x1000_1000);
        assert_eq!((r.base(), r.size()), (0x1000_0000, PAGE_SIZE));
        assert_eq!((tail.base(), tail.pages(), tail.pgoff()), (0x1000_1000, 3, 11));
        assert_eq!(tail.pgoff_of(0x1000_3000), 13);
        assert!(r.can_merge(&tail));
    }

    #[test]
    fn write_implies_read_in_mmu_flags() {
        let f = (RegionFlags::WRITE | RegionFlags::USER).mmu_flags();
        assert_eq!(f, MmuFlags::PERM_READ | MmuFlags::PERM_WRITE | MmuFlags::PERM_USER);
        let dev = (RegionFlags::READ | RegionFlags::DEVICE).mmu_flags();
        assert_eq!(dev.cache_policy(), MmuFlags::UNCACHED_DEVICE);
    }

    #[test]
    fn permission_checks() {
        let ro = anon(0x1000, 1, RegionFlags::READ | RegionFlags::USER);
        assert!(ro.permits(FaultFlags::READ | FaultFlags::USER));
        assert!(!ro.permits(FaultFlags::WRITE | FaultFlags::USER));
        assert!(!ro.permits(FaultFlags::EXECUTE | FaultFlags::USER));

        let kernel = anon(0x1000, 1, RegionFlags::READ | RegionFlags::WRITE);
        assert!(kernel.permits(FaultFlags::WRITE));
        assert!(!kernel.permits(FaultFlags::READ | FaultFlags::USER));
    }

    #[test]
    fn merge_requires_same_flags_and_adjacency() {
        let a = anon(0x1000, 1, RegionFlags::READ);
        let b = anon(0x2000, 1, RegionFlags::READ | RegionFlags::WRITE);
        let c = anon(0x3000, 1, RegionFlags::READ);
        assert!(!a.can_merge(&b));
        assert!(!a.can_merge(&c));
    }
}

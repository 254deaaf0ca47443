//! 地址模块
//!
//! 页、段（section）相关常量，以及对 `usize` 地址的对齐与换算操作。
//!
//! 短描述符格式下虚拟地址按如下方式划分：
//!
//! ```text
//!  31            20 19        12 11          0
//! +----------------+------------+-------------+
//! |   L1 index     |  L2 index  | page offset |
//! +----------------+------------+-------------+
//! ```

/// 页大小（4 KiB）
pub const PAGE_SIZE: usize = 4096;
/// 页大小的位移
pub const PAGE_SHIFT: usize = 12;
/// 段映射大小（1 MiB）
pub const SECTION_SIZE: usize = 1 << SECTION_SHIFT;
/// 段映射大小的位移
pub const SECTION_SHIFT: usize = 20;
/// 一个段覆盖的页数
pub const PAGES_PER_SECTION: usize = SECTION_SIZE / PAGE_SIZE;

/// [AlignOps] Trait
/// ---------------------
/// 定义了地址对齐操作，例如检查对齐、向上对齐和向下对齐。
///
/// 注意: 所有对齐操作都要求 `alignment` 是 2 的幂。
pub trait AlignOps: Copy {
    /// 检查地址是否已对齐到给定的对齐边界。
    fn is_aligned(self, alignment: usize) -> bool;
    /// 将地址向上对齐到给定的对齐边界，溢出时返回 `None`。
    fn checked_align_up(self, alignment: usize) -> Option<Self>;
    /// 将地址向下对齐到给定的对齐边界。
    fn align_down(self, alignment: usize) -> Self;

    /// 检查地址是否已页对齐。
    fn is_page_aligned(self) -> bool {
        self.is_aligned(PAGE_SIZE)
    }
    /// 检查地址是否已段对齐。
    fn is_section_aligned(self) -> bool {
        self.is_aligned(SECTION_SIZE)
    }
    /// 向下对齐到页边界。
    fn page_floor(self) -> Self {
        self.align_down(PAGE_SIZE)
    }
    /// 向上对齐到页边界，溢出时返回 `None`。
    fn page_ceil(self) -> Option<Self> {
        self.checked_align_up(PAGE_SIZE)
    }
}

impl AlignOps for usize {
    fn is_aligned(self, alignment: usize) -> bool {
        debug_assert!(alignment.is_power_of_two(), "alignment must be a power of two");
        self & (alignment - 1) == 0
    }

    fn checked_align_up(self, alignment: usize) -> Option<Self> {
        debug_assert!(alignment.is_power_of_two(), "alignment must be a power of two");
        let mask = alignment - 1;
        self.checked_add(mask).map(|v| v & !mask)
    }

    fn align_down(self, alignment: usize) -> Self {
        debug_assert!(alignment.is_power_of_two(), "alignment must be a power of two");
        self & !(alignment - 1)
    }
}

/// 字节数换算为页数（向上取整）
#[inline]
pub const fn bytes_to_pages(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}

/// 虚拟地址对应的一级页表下标（bits [31:20]）
#[inline]
pub const fn l1_index(vaddr: usize) -> usize {
    (vaddr >> SECTION_SHIFT) & 0xfff
}

/// 虚拟地址对应的二级页表下标（bits [19:12]）
#[inline]
pub const fn l2_index(vaddr: usize) -> usize {
    (vaddr >> PAGE_SHIFT) & 0xff
}

/// 判断两个半开区间 `[a, a + a_len)` 与 `[b, b + b_len)` 是否重叠
#[inline]
pub const fn ranges_overlap(a: usize, a_len: usize, b: usize, b_len: usize) -> bool {
    a < b + b_len && b < a + a_len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_helpers() {
        assert!(0x2000usize.is_page_aligned());
        assert!(!0x2001usize.is_page_aligned());
        assert_eq!(0x2001usize.page_floor(), 0x2000);
        assert_eq!(0x2001usize.page_ceil(), Some(0x3000));
        assert_eq!(usize::MAX.page_ceil(), None);
        assert!(0x0030_0000usize.is_section_aligned());
        assert_eq!(bytes_to_pages(1), 1);
        assert_eq!(bytes_to_pages(8192), 2);
    }

    #[test]
    fn descriptor_indices() {
        let va = 0x1234_5678usize;
        assert_eq!(l1_index(va), 0x123);
        assert_eq!(l2_index(va), 0x45);
    }

    #[test]
    fn adjacent_ranges_do_not_overlap() {
        assert!(!ranges_overlap(0x1000, 0x1000, 0x2000, 0x1000));
        assert!(ranges_overlap(0x1000, 0x2000, 0x2000, 0x1000));
    }
}

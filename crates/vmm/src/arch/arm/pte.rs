//! ARMv7 短描述符格式的编码与解码
//!
//! 一级描述符（每项 4 字节，共 4096 项，16 KiB 对齐）：
//!
//! ```text
//! 页表:  [31:10] L2 基址 | [8:5] domain | [3] NS | [1:0] = 0b01
//! 段:    [31:20] 段基址 | [19] NS | [17] nG | [16] S | [15] AP2 | [14:12] TEX
//!        | [11:10] AP | [8:5] domain | [4] XN | [3] C | [2] B | [1:0] = 0b10
//! ```
//!
//! 二级小页描述符（每个表 256 项，1 KiB）：
//!
//! ```text
//! [31:12] 页基址 | [11] nG | [10] S | [9] AP2 | [8:6] TEX | [5:4] AP | [3] C | [2] B | [1] 1 | [0] XN
//! ```

use bitflags::bitflags;

bitflags! {
    /// 与体系结构无关的映射属性
    ///
    /// 低两位是缓存策略（0 表示普通可缓存内存），其余为权限位。
    /// 硬件无法表达“只写”，因此编码时 `PERM_WRITE` 隐含 `PERM_READ`。
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MmuFlags: u32 {
        /// 普通内存，不可缓存
        const UNCACHED = 1;
        /// 设备内存
        const UNCACHED_DEVICE = 2;
        /// 强序内存
        const STRONGLY_ORDERED = 3;
        /// 缓存策略掩码
        const CACHE_MASK = 3;
        /// 用户态可访问
        const PERM_USER = 1 << 2;
        /// 可读
        const PERM_READ = 1 << 3;
        /// 可写
        const PERM_WRITE = 1 << 4;
        /// 可执行
        const PERM_EXECUTE = 1 << 5;
        /// 非安全世界
        const NS = 1 << 6;
    }
}

impl MmuFlags {
    /// 缓存策略部分
    pub fn cache_policy(self) -> MmuFlags {
        self & MmuFlags::CACHE_MASK
    }

    /// 硬件可表达的规范形式
    pub fn normalize(self) -> MmuFlags {
        if self.contains(MmuFlags::PERM_WRITE) {
            self | MmuFlags::PERM_READ
        } else {
            self
        }
    }
}

pub(crate) const L1_TYPE_MASK: u32 = 0b11;
pub(crate) const L1_TYPE_INVALID: u32 = 0b00;
pub(crate) const L1_TYPE_PAGE_TABLE: u32 = 0b01;
pub(crate) const L1_TYPE_SECTION: u32 = 0b10;

const L1_PT_NS: u32 = 1 << 3;
const L1_PT_ADDR_MASK: u32 = 0xffff_fc00;
const L1_SECTION_ADDR_MASK: u32 = 0xfff0_0000;

const L1_SEC_B: u32 = 1 << 2;
const L1_SEC_C: u32 = 1 << 3;
const L1_SEC_XN: u32 = 1 << 4;
const L1_SEC_AP_SHIFT: u32 = 10;
const L1_SEC_TEX_SHIFT: u32 = 12;
const L1_SEC_AP2: u32 = 1 << 15;
const L1_SEC_S: u32 = 1 << 16;
const L1_SEC_NG: u32 = 1 << 17;
const L1_SEC_NS: u32 = 1 << 19;

pub(crate) const L2_TYPE_SMALL: u32 = 1 << 1;
const L2_XN: u32 = 1 << 0;
const L2_B: u32 = 1 << 2;
const L2_C: u32 = 1 << 3;
const L2_AP_SHIFT: u32 = 4;
const L2_TEX_SHIFT: u32 = 6;
const L2_AP2: u32 = 1 << 9;
const L2_S: u32 = 1 << 10;
const L2_NG: u32 = 1 << 11;
const L2_ADDR_MASK: u32 = 0xffff_f000;

/// 与位置无关的属性字段，两种描述符共用
struct Attrs {
    ap: u32,
    ap2: bool,
    tex: u32,
    c: bool,
    b: bool,
    s: bool,
    xn: bool,
    ng: bool,
}

fn encode_attrs(flags: MmuFlags) -> Attrs {
    let flags = flags.normalize();
    let user = flags.contains(MmuFlags::PERM_USER);
    let (ap, ap2) = if !flags.contains(MmuFlags::PERM_READ) {
        (0b00, false)
    } else {
        let ap = if user { 0b11 } else { 0b01 };
        (ap, !flags.contains(MmuFlags::PERM_WRITE))
    };
    let policy = flags.cache_policy();
    let (tex, c, b, s) = if policy == MmuFlags::UNCACHED {
        (0b001, false, false, true)
    } else if policy == MmuFlags::UNCACHED_DEVICE {
        (0b000, false, true, false)
    } else if policy == MmuFlags::STRONGLY_ORDERED {
        (0b000, false, false, false)
    } else {
        (0b001, true, true, true)
    };
    Attrs {
        ap,
        ap2,
        tex,
        c,
        b,
        s,
        xn: !flags.contains(MmuFlags::PERM_EXECUTE),
        ng: user,
    }
}

fn decode_attrs(a: &Attrs) -> MmuFlags {
    let mut flags = match (a.ap2, a.ap) {
        (_, 0b00) => MmuFlags::empty(),
        (false, 0b01) => MmuFlags::PERM_READ | MmuFlags::PERM_WRITE,
        (false, 0b11) => MmuFlags::PERM_READ | MmuFlags::PERM_WRITE | MmuFlags::PERM_USER,
        (true, 0b01) => MmuFlags::PERM_READ,
        _ => MmuFlags::PERM_READ | MmuFlags::PERM_USER,
    };
    if !a.xn {
        flags |= MmuFlags::PERM_EXECUTE;
    }
    flags |= match (a.tex, a.c, a.b) {
        (0b001, true, true) => MmuFlags::empty(),
        (0b001, false, false) => MmuFlags::UNCACHED,
        (0b000, false, true) => MmuFlags::UNCACHED_DEVICE,
        _ => MmuFlags::STRONGLY_ORDERED,
    };
    flags
}

#[inline]
fn bit(cond: bool, b: u32) -> u32 {
    if cond { b } else { 0 }
}

/// 描述符类型
#[inline]
pub(crate) fn l1_type(desc: u32) -> u32 {
    desc & L1_TYPE_MASK
}

/// 编码段描述符
pub(crate) fn l1_section(paddr: usize, flags: MmuFlags) -> u32 {
    let a = encode_attrs(flags);
    (paddr as u32 & L1_SECTION_ADDR_MASK)
        | L1_TYPE_SECTION
        | bit(a.b, L1_SEC_B)
        | bit(a.c, L1_SEC_C)
        | bit(a.xn, L1_SEC_XN)
        | (a.ap << L1_SEC_AP_SHIFT)
        | (a.tex << L1_SEC_TEX_SHIFT)
        | bit(a.ap2, L1_SEC_AP2)
        | bit(a.s, L1_SEC_S)
        | bit(a.ng, L1_SEC_NG)
        | bit(flags.contains(MmuFlags::NS), L1_SEC_NS)
}

/// 段描述符的物理基址
#[inline]
pub(crate) fn l1_section_paddr(desc: u32) -> usize {
    (desc & L1_SECTION_ADDR_MASK) as usize
}

/// 解码段描述符的属性
pub(crate) fn l1_section_flags(desc: u32) -> MmuFlags {
    let a = Attrs {
        ap: (desc >> L1_SEC_AP_SHIFT) & 0b11,
        ap2: desc & L1_SEC_AP2 != 0,
        tex: (desc >> L1_SEC_TEX_SHIFT) & 0b111,
        c: desc & L1_SEC_C != 0,
        b: desc & L1_SEC_B != 0,
        s: desc & L1_SEC_S != 0,
        xn: desc & L1_SEC_XN != 0,
        ng: desc & L1_SEC_NG != 0,
    };
    let mut flags = decode_attrs(&a);
    if desc & L1_SEC_NS != 0 {
        flags |= MmuFlags::NS;
    }
    flags
}

/// 编码页表描述符
pub(crate) fn l1_page_table(l2_paddr: usize, flags: MmuFlags) -> u32 {
    (l2_paddr as u32 & L1_PT_ADDR_MASK)
        | L1_TYPE_PAGE_TABLE
        | bit(flags.contains(MmuFlags::NS), L1_PT_NS)
}

/// 页表描述符指向的二级表物理地址
#[inline]
pub(crate) fn l1_page_table_paddr(desc: u32) -> usize {
    (desc & L1_PT_ADDR_MASK) as usize
}

/// 页表描述符上的 NS 位
#[inline]
pub(crate) fn l1_page_table_ns(desc: u32) -> bool {
    desc & L1_PT_NS != 0
}

/// 编码二级小页描述符
pub(crate) fn l2_small(paddr: usize, flags: MmuFlags) -> u32 {
    let a = encode_attrs(flags);
    (paddr as u32 & L2_ADDR_MASK)
        | L2_TYPE_SMALL
        | bit(a.xn, L2_XN)
        | bit(a.b, L2_B)
        | bit(a.c, L2_C)
        | (a.ap << L2_AP_SHIFT)
        | (a.tex << L2_TEX_SHIFT)
        | bit(a.ap2, L2_AP2)
        | bit(a.s, L2_S)
        | bit(a.ng, L2_NG)
}

/// 二级描述符是否有效
#[inline]
pub(crate) fn l2_is_valid(desc: u32) -> bool {
    desc & L2_TYPE_SMALL != 0
}

/// 二级描述符的物理基址
#[inline]
pub(crate) fn l2_paddr(desc: u32) -> usize {
    (desc & L2_ADDR_MASK) as usize
}

/// 解码二级描述符的属性（NS 位来自一级页表描述符）
pub(crate) fn l2_flags(desc: u32, ns: bool) -> MmuFlags {
    let a = Attrs {
        ap: (desc >> L2_AP_SHIFT) & 0b11,
        ap2: desc & L2_AP2 != 0,
        tex: (desc >> L2_TEX_SHIFT) & 0b111,
        c: desc & L2_C != 0,
        b: desc & L2_B != 0,
        s: desc & L2_S != 0,
        xn: desc & L2_XN != 0,
        ng: desc & L2_NG != 0,
    };
    let mut flags = decode_attrs(&a);
    if ns {
        flags |= MmuFlags::NS;
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER_RW: MmuFlags = MmuFlags::PERM_USER
        .union(MmuFlags::PERM_READ)
        .union(MmuFlags::PERM_WRITE);

    #[test]
    fn small_page_round_trip() {
        let cases = [
            USER_RW,
            MmuFlags::PERM_USER | MmuFlags::PERM_READ | MmuFlags::PERM_EXECUTE,
            MmuFlags::PERM_READ | MmuFlags::PERM_WRITE,
            MmuFlags::PERM_READ | MmuFlags::UNCACHED,
            MmuFlags::PERM_READ | MmuFlags::PERM_WRITE | MmuFlags::UNCACHED_DEVICE,
            MmuFlags::PERM_READ | MmuFlags::STRONGLY_ORDERED,
        ];
        for flags in cases {
            let desc = l2_small(0x4012_3000, flags);
            assert!(l2_is_valid(desc));
            assert_eq!(l2_paddr(desc), 0x4012_3000);
            assert_eq!(l2_flags(desc, false), flags, "{:?}", flags);
        }
    }

    #[test]
    fn section_round_trip_with_ns() {
        let flags = USER_RW | MmuFlags::NS;
        let desc = l1_section(0x4030_0000, flags);
        assert_eq!(l1_type(desc), L1_TYPE_SECTION);
        assert_eq!(l1_section_paddr(desc), 0x4030_0000);
        assert_eq!(l1_section_flags(desc), flags);
    }

    #[test]
    fn write_implies_read() {
        let desc = l2_small(0x1000, MmuFlags::PERM_WRITE | MmuFlags::PERM_USER);
        assert_eq!(l2_flags(desc, false), USER_RW);
    }

    #[test]
    fn user_pages_are_not_global() {
        assert_ne!(l2_small(0x1000, USER_RW) & L2_NG, 0);
        assert_eq!(l2_small(0x1000, MmuFlags::PERM_READ) & L2_NG, 0);
    }

    #[test]
    fn page_table_descriptor() {
        let desc = l1_page_table(0x4000_0400, MmuFlags::NS);
        assert_eq!(l1_type(desc), L1_TYPE_PAGE_TABLE);
        assert_eq!(l1_page_table_paddr(desc), 0x4000_0400);
        assert!(l1_page_table_ns(desc));
    }
}

//! 物理内存相关操作的 Mock 实现
//!
//! 注意：这里不直接依赖 `vmm` crate（避免循环依赖）。
//! `vmm` 在 `cfg(test)` 下为这些类型实现其 trait（例如 `ArchMmOps`）。
//!
//! 每个 [`MockPhysMemory`] 占用全局窗口表中的一个槽位，槽位 `i` 对应的
//! 模拟物理地址从 `PHYS_WINDOW_BASE + i * WINDOW_SPAN` 开始。
//! 这样多个测试可以并行地各自拥有一段"物理内存"，而 [`MockMmOps`]
//! 仍然是一个全局实例。物理地址始终低于 4 GiB，可以放进 32 位描述符。

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// 页大小
pub const PAGE_SIZE: usize = 4096;

/// 第一个窗口的模拟物理基址
pub const PHYS_WINDOW_BASE: usize = 0x4000_0000;

/// 每个窗口占用的模拟物理地址跨度（32 MiB，1 MiB 对齐）
pub const WINDOW_SPAN: usize = 32 << 20;

const MAX_WINDOWS: usize = 64;

static WINDOW_USED: [AtomicBool; MAX_WINDOWS] = [const { AtomicBool::new(false) }; MAX_WINDOWS];
static WINDOW_HOST: [AtomicUsize; MAX_WINDOWS] = [const { AtomicUsize::new(0) }; MAX_WINDOWS];
static WINDOW_LEN: [AtomicUsize; MAX_WINDOWS] = [const { AtomicUsize::new(0) }; MAX_WINDOWS];
static WINDOW_TTBR_SWITCHES: [AtomicUsize; MAX_WINDOWS] =
    [const { AtomicUsize::new(0) }; MAX_WINDOWS];
static WINDOW_LAST_ASID: [AtomicUsize; MAX_WINDOWS] = [const { AtomicUsize::new(0) }; MAX_WINDOWS];

/// 由 Vec 支撑的一段模拟物理内存
pub struct MockPhysMemory {
    slot: usize,
    base: usize,
    len: usize,
    _backing: Vec<u64>,
}

impl MockPhysMemory {
    /// 分配 `pages` 页模拟物理内存并注册到窗口表
    ///
    /// # Panics
    /// 窗口表已满或请求超过单个窗口跨度时 panic
    pub fn new(pages: usize) -> Self {
        let len = pages * PAGE_SIZE;
        assert!(len <= WINDOW_SPAN, "mock phys memory too large");
        let mut backing = vec![0u64; len / 8];
        let host = backing.as_mut_ptr() as usize;

        for slot in 0..MAX_WINDOWS {
            if WINDOW_USED[slot]
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                WINDOW_LEN[slot].store(len, Ordering::Release);
                WINDOW_TTBR_SWITCHES[slot].store(0, Ordering::Relaxed);
                WINDOW_LAST_ASID[slot].store(0, Ordering::Relaxed);
                WINDOW_HOST[slot].store(host, Ordering::Release);
                return Self {
                    slot,
                    base: PHYS_WINDOW_BASE + slot * WINDOW_SPAN,
                    len,
                    _backing: backing,
                };
            }
        }
        panic!("mock phys memory: window table exhausted");
    }

    /// 模拟物理内存起始地址
    pub fn base(&self) -> usize {
        self.base
    }

    /// 模拟物理内存大小（字节）
    pub fn len(&self) -> usize {
        self.len
    }

    /// 本窗口上发生过的 TTBR 切换次数
    pub fn ttbr_switches(&self) -> usize {
        WINDOW_TTBR_SWITCHES[self.slot].load(Ordering::Acquire)
    }

    /// 本窗口上最近一次 TTBR 切换使用的 ASID
    pub fn last_asid(&self) -> usize {
        WINDOW_LAST_ASID[self.slot].load(Ordering::Acquire)
    }
}

impl Drop for MockPhysMemory {
    fn drop(&mut self) {
        WINDOW_HOST[self.slot].store(0, Ordering::Release);
        WINDOW_LEN[self.slot].store(0, Ordering::Release);
        WINDOW_USED[self.slot].store(false, Ordering::Release);
    }
}

fn window_of(paddr: usize) -> Option<(usize, usize)> {
    if paddr < PHYS_WINDOW_BASE {
        return None;
    }
    let slot = (paddr - PHYS_WINDOW_BASE) / WINDOW_SPAN;
    let off = (paddr - PHYS_WINDOW_BASE) % WINDOW_SPAN;
    if slot >= MAX_WINDOWS || off >= WINDOW_LEN[slot].load(Ordering::Acquire) {
        return None;
    }
    Some((slot, off))
}

/// Mock 的内存管理架构操作
///
/// 地址转换通过全局窗口表完成；TLB 操作只做计数。
pub struct MockMmOps {
    pub tlb_page_flushes: AtomicUsize,
    pub tlb_asid_flushes: AtomicUsize,
    pub barriers: AtomicUsize,
}

impl MockMmOps {
    pub const fn new() -> Self {
        Self {
            tlb_page_flushes: AtomicUsize::new(0),
            tlb_asid_flushes: AtomicUsize::new(0),
            barriers: AtomicUsize::new(0),
        }
    }

    /// 将模拟物理地址转换为主机地址
    pub fn paddr_to_vaddr(&self, paddr: usize) -> usize {
        match window_of(paddr) {
            Some((slot, off)) => WINDOW_HOST[slot].load(Ordering::Acquire) + off,
            None => panic!("mock mm: paddr {:#x} is not backed", paddr),
        }
    }

    pub fn tlb_invalidate_page(&self, _asid: u16, _vaddr: usize) {
        self.tlb_page_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tlb_invalidate_asid(&self, _asid: u16) {
        self.tlb_asid_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn barrier(&self) {
        self.barriers.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录 TTBR 切换（按 TTBR 所在窗口计数）
    pub fn switch_ttbr(&self, ttbr: usize, asid: u16) {
        if let Some((slot, _)) = window_of(ttbr) {
            WINDOW_TTBR_SWITCHES[slot].fetch_add(1, Ordering::AcqRel);
            WINDOW_LAST_ASID[slot].store(asid as usize, Ordering::Release);
        }
    }
}

/// 全局 Mock 实例
pub static MOCK_MM_OPS: MockMmOps = MockMmOps::new();

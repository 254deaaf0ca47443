//! 集成测试公共环境
//!
//! 把 `test-support` 的 Mock 包装成本地类型，接到 `vmm` 与 `sync` 的 trait 上。

#![allow(dead_code)]

use std::sync::{Arc, Once};

use test_support::mock::arch::MOCK_ARCH_OPS;
use test_support::mock::fs::MockFileData;
use test_support::mock::mm::{MOCK_MM_OPS, MockPhysMemory};
use vmm::{ArchMmOps, Asid, MmFile, MmInode, PAGE_SIZE, VmConfig, VmSubsystem};

struct Arch;

impl sync::ArchOps for Arch {
    unsafe fn read_and_disable_interrupts(&self) -> usize {
        unsafe { MOCK_ARCH_OPS.read_and_disable_interrupts() }
    }

    unsafe fn restore_interrupts(&self, flags: usize) {
        unsafe { MOCK_ARCH_OPS.restore_interrupts(flags) }
    }

    fn yield_now(&self) {
        MOCK_ARCH_OPS.yield_now()
    }
}

struct MmOps;

impl ArchMmOps for MmOps {
    fn paddr_to_vaddr(&self, paddr: usize) -> usize {
        MOCK_MM_OPS.paddr_to_vaddr(paddr)
    }

    fn tlb_invalidate_page(&self, asid: Asid, vaddr: usize) {
        MOCK_MM_OPS.tlb_invalidate_page(asid, vaddr)
    }

    fn tlb_invalidate_asid(&self, asid: Asid) {
        MOCK_MM_OPS.tlb_invalidate_asid(asid)
    }

    fn barrier(&self) {
        MOCK_MM_OPS.barrier()
    }

    fn switch_ttbr(&self, ttbr: usize, asid: Asid) {
        MOCK_MM_OPS.switch_ttbr(ttbr, asid)
    }
}

static ARCH: Arch = Arch;
static MM_OPS: MmOps = MmOps;
static INIT: Once = Once::new();

/// 注册 Mock 架构操作（只执行一次）
pub fn setup() {
    INIT.call_once(|| unsafe {
        sync::register_arch_ops(&ARCH);
        vmm::register_arch_ops(&MM_OPS);
    });
}

/// 内存中的文件
pub struct Inode(pub MockFileData);

impl MmInode for Inode {
    fn ino(&self) -> u64 {
        self.0.ino()
    }

    fn size(&self) -> usize {
        self.0.size()
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, isize> {
        Ok(self.0.read_at(offset, buf))
    }

    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, isize> {
        Ok(self.0.write_at(offset, buf))
    }
}

/// 以读写方式打开的文件
pub struct OpenFile {
    pub inode: Arc<Inode>,
}

impl OpenFile {
    pub fn new(ino: u64, contents: &[u8]) -> Arc<dyn MmFile> {
        Self::open(&Arc::new(Inode(MockFileData::new(ino, contents))))
    }

    /// 同一个 inode 的又一次打开
    pub fn open(inode: &Arc<Inode>) -> Arc<dyn MmFile> {
        Arc::new(Self { inode: inode.clone() })
    }
}

impl MmFile for OpenFile {
    fn inode(&self) -> Result<Arc<dyn MmInode>, isize> {
        Ok(self.inode.clone())
    }

    fn readable(&self) -> bool {
        true
    }

    fn writable(&self) -> bool {
        true
    }
}

/// 子系统与其模拟物理内存；`vm` 先于 `ram` 析构
pub struct Env {
    pub vm: VmSubsystem,
    pub ram: MockPhysMemory,
}

impl Env {
    pub fn new(pages: usize) -> Self {
        setup();
        let ram = MockPhysMemory::new(pages);
        let vm = VmSubsystem::new(VmConfig::default(), &[(ram.base(), pages * PAGE_SIZE)]).unwrap();
        Self { vm, ram }
    }
}

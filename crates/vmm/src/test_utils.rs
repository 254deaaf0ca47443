//! 单元测试辅助
//!
//! 把 `test-support` 中的 Mock 接到本 crate 的 trait 上，并构造模拟物理内存。

extern crate std;

use alloc::sync::Arc;
use std::sync::Once;

use test_support::mock::arch::MOCK_ARCH_OPS;
use test_support::mock::fs::MockFileData;
use test_support::mock::mm::{MOCK_MM_OPS, MockMmOps, MockPhysMemory, PAGE_SIZE};

use crate::arch_ops::{ArchMmOps, register_arch_ops};
use crate::asid::Asid;
use crate::config::VmConfig;
use crate::file::{MmFile, MmInode};
use crate::phys::PhysAllocator;
use crate::VmSubsystem;

struct TestArch;

impl sync::ArchOps for TestArch {
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

static TEST_ARCH: TestArch = TestArch;

impl ArchMmOps for MockMmOps {
    fn paddr_to_vaddr(&self, paddr: usize) -> usize {
        MockMmOps::paddr_to_vaddr(self, paddr)
    }

    fn tlb_invalidate_page(&self, asid: Asid, vaddr: usize) {
        MockMmOps::tlb_invalidate_page(self, asid, vaddr)
    }

    fn tlb_invalidate_asid(&self, asid: Asid) {
        MockMmOps::tlb_invalidate_asid(self, asid)
    }

    fn barrier(&self) {
        MockMmOps::barrier(self)
    }

    fn switch_ttbr(&self, ttbr: usize, asid: Asid) {
        MockMmOps::switch_ttbr(self, ttbr, asid)
    }
}

impl MmInode for MockFileData {
    fn ino(&self) -> u64 {
        MockFileData::ino(self)
    }

    fn size(&self) -> usize {
        MockFileData::size(self)
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, isize> {
        Ok(MockFileData::read_at(self, offset, buf))
    }

    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, isize> {
        Ok(MockFileData::write_at(self, offset, buf))
    }
}

static INIT: Once = Once::new();

/// 注册 Mock 架构操作（只执行一次）
pub fn setup() {
    INIT.call_once(|| unsafe {
        sync::register_arch_ops(&TEST_ARCH);
        register_arch_ops(&MOCK_MM_OPS);
    });
}

/// 创建 `pages` 页的模拟物理内存及其分配器
pub fn test_phys(pages: usize) -> (MockPhysMemory, Arc<PhysAllocator>) {
    setup();
    let ram = MockPhysMemory::new(pages);
    let phys = PhysAllocator::new(&[(ram.base(), pages * PAGE_SIZE)]).unwrap();
    (ram, Arc::new(phys))
}

/// 测试用的打开文件
pub struct TestFile {
    pub data: Arc<MockFileData>,
    pub readable: bool,
    pub writable: bool,
}

impl TestFile {
    /// 可读写的文件
    pub fn new(ino: u64, contents: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            data: Arc::new(MockFileData::new(ino, contents)),
            readable: true,
            writable: true,
        })
    }

    /// 只读打开的文件
    pub fn read_only(ino: u64, contents: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            data: Arc::new(MockFileData::new(ino, contents)),
            readable: true,
            writable: false,
        })
    }
}

impl MmFile for TestFile {
    fn inode(&self) -> Result<Arc<dyn MmInode>, isize> {
        Ok(self.data.clone())
    }

    fn readable(&self) -> bool {
        self.readable
    }

    fn writable(&self) -> bool {
        self.writable
    }
}

/// 一套完整的测试环境
///
/// 字段按声明顺序析构：先析构 `vm`，最后释放模拟物理内存。
pub struct TestVm {
    pub vm: VmSubsystem,
    pub ram: MockPhysMemory,
}

impl TestVm {
    /// 用 `pages` 页模拟物理内存和默认配置创建子系统
    pub fn new(pages: usize) -> Self {
        Self::with_config(pages, VmConfig::default())
    }

    /// 用指定配置创建子系统
    pub fn with_config(pages: usize, config: VmConfig) -> Self {
        setup();
        let ram = MockPhysMemory::new(pages);
        let vm = VmSubsystem::new(config, &[(ram.base(), pages * PAGE_SIZE)]).unwrap();
        Self { vm, ram }
    }
}

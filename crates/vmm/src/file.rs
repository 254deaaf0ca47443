//! 文件映射接口 trait 定义
//!
//! 文件系统与设备驱动通过这些 trait 接入 VMM：
//! - [`MmInode`]：页缓存读取与写回所用的最小 I/O 接口
//! - [`MmFile`]：一个打开的文件，`mmap` 通过它取得 inode 并检查打开模式
//! - [`VmFileOps`]：驱动自带的映射操作表，VMM 只在缺页和解除映射时回调它

use alloc::sync::Arc;

use crate::arch::ArchMmu;
use crate::error::{VmError, VmResult};
use crate::fault::FaultFlags;
use crate::region::Region;

/// 可用于内存映射读写的 Inode 接口
///
/// 此 trait 抽象了文件 I/O 所需的最小接口，错误以负的 errno 返回。
pub trait MmInode: Send + Sync {
    /// inode 编号，作为页缓存中文件映射的键
    fn ino(&self) -> u64;

    /// 文件当前大小（字节）
    fn size(&self) -> usize;

    /// 从指定偏移读取数据到缓冲区
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, isize>;

    /// 将缓冲区数据写入指定偏移
    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, isize>;
}

/// 可映射到内存的文件接口
///
/// vfs 层的 File 需要实现此 trait。
pub trait MmFile: Send + Sync {
    /// 获取底层 Inode 用于读写操作
    fn inode(&self) -> Result<Arc<dyn MmInode>, isize>;

    /// 打开模式是否可读
    fn readable(&self) -> bool;

    /// 打开模式是否可写
    fn writable(&self) -> bool;

    /// 驱动提供的映射操作表；返回 `None` 时通过页缓存映射文件内容
    fn mmap_ops(&self) -> Option<Arc<dyn VmFileOps>> {
        None
    }
}

/// 一次缺页的描述，由 [`VmFileOps::fault`] 填写要映射的物理地址
#[derive(Debug, Clone)]
pub struct VmFault {
    /// 缺页虚拟地址（页对齐）
    pub vaddr: usize,
    /// 对应的文件页偏移
    pub pgoff: u64,
    /// 访问类型
    pub flags: FaultFlags,
    /// 回调填写：要映射到 `vaddr` 的物理页地址
    pub paddr: Option<usize>,
}

/// 驱动提供的映射操作表
pub trait VmFileOps: Send + Sync {
    /// 为 `vmf.vaddr` 提供物理页
    fn fault(&self, region: &Region, vmf: &mut VmFault) -> VmResult<()>;

    /// `pgoff` 对应的页即将从 `mmu` 中解除映射
    fn remove(&self, region: &Region, mmu: &ArchMmu, pgoff: u64) {
        let _ = (region, mmu, pgoff);
    }
}

/// 把文件层返回的负 errno 转换为 [`VmError`]
pub(crate) fn io_error(errno: isize) -> VmError {
    VmError::Io(errno.unsigned_abs() as i32)
}

//! 内核访问用户内存
//!
//! 逐页查询页表，缺页或只读时走缺页处理补齐映射，无法补齐时返回 `Fault`。

use super::VmSpace;
use crate::address::{AlignOps, PAGE_SIZE};
use crate::arch::MmuFlags;
use crate::arch_ops::phys_ptr;
use crate::error::{VmError, VmResult};
use crate::fault::FaultFlags;

impl VmSpace {
    /// 把 `src` 写到用户地址 `uaddr`
    pub fn copy_to_user(&self, uaddr: usize, src: &[u8]) -> VmResult<()> {
        let mut done = 0;
        while done < src.len() {
            let va = uaddr + done;
            let n = (PAGE_SIZE - va % PAGE_SIZE).min(src.len() - done);
            let paddr = self.user_page(va.page_floor(), true)?;
            // SAFETY: 该页已可写映射在本地址空间中，且 n 不越过页边界
            unsafe {
                core::ptr::copy_nonoverlapping(
                    src[done..].as_ptr(),
                    phys_ptr(paddr + va % PAGE_SIZE),
                    n,
                );
            }
            done += n;
        }
        Ok(())
    }

    /// 从用户地址 `uaddr` 读取到 `dst`
    pub fn copy_from_user(&self, uaddr: usize, dst: &mut [u8]) -> VmResult<()> {
        let mut done = 0;
        while done < dst.len() {
            let va = uaddr + done;
            let n = (PAGE_SIZE - va % PAGE_SIZE).min(dst.len() - done);
            let paddr = self.user_page(va.page_floor(), false)?;
            // SAFETY: 同上
            unsafe {
                core::ptr::copy_nonoverlapping(
                    phys_ptr(paddr + va % PAGE_SIZE),
                    dst[done..].as_mut_ptr(),
                    n,
                );
            }
            done += n;
        }
        Ok(())
    }

    fn user_page(&self, va: usize, write: bool) -> VmResult<usize> {
        if !self.contains_range(va, PAGE_SIZE) {
            return Err(VmError::Fault);
        }
        let usable = |flags: MmuFlags| {
            flags.contains(MmuFlags::PERM_USER | MmuFlags::PERM_READ)
                && (!write || flags.contains(MmuFlags::PERM_WRITE))
        };
        let present = match self.mmu.query(va) {
            Ok((paddr, flags)) if usable(flags) => return Ok(paddr),
            Ok(_) => true,
            Err(_) => false,
        };

        let mut access = FaultFlags::USER | if write { FaultFlags::WRITE } else { FaultFlags::READ };
        if !present {
            access |= FaultFlags::NOT_PRESENT;
        }
        self.handle_fault(va, access).map_err(|_| VmError::Fault)?;
        match self.mmu.query(va) {
            Ok((paddr, flags)) if usable(flags) => Ok(paddr),
            _ => Err(VmError::Fault),
        }
    }
}

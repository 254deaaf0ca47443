//! 内存管理系统调用
//!
//! 参数按用户态传入的原样接收，成功返回地址或 0，失败返回负的 errno。
//! 文件描述符由调用者解析为 [`MmFile`] 后传入。

use alloc::sync::Arc;
use alloc::vec::Vec;

use uapi::errno::{EACCES, EBADF, EFAULT, EINVAL, ENOMEM};
use uapi::mm::{MapFlags, MremapFlags, MsyncFlags, ProtFlags};

use crate::address::{AlignOps, PAGE_SIZE};
use crate::arch::MmuFlags;
use crate::error::{VmError, VmResult};
use crate::fault::FaultFlags;
use crate::file::MmFile;
use crate::region::{Region, RegionBacking, RegionFlags};
use crate::space::{Placement, SpaceInner, VmSpace};

fn errno(e: i32) -> isize {
    -(e as isize)
}

fn prot_to_region(prot: ProtFlags) -> RegionFlags {
    let mut flags = RegionFlags::empty();
    if prot.contains(ProtFlags::READ) {
        flags |= RegionFlags::READ;
    }
    if prot.contains(ProtFlags::WRITE) {
        flags |= RegionFlags::WRITE;
    }
    if prot.contains(ProtFlags::EXEC) {
        flags |= RegionFlags::EXECUTE;
    }
    flags
}

/// mmap
pub fn mmap(
    space: &VmSpace,
    addr: usize,
    len: usize,
    prot: i32,
    flags: i32,
    file: Option<&Arc<dyn MmFile>>,
    offset: usize,
) -> isize {
    let Some(prot) = ProtFlags::from_bits(prot) else {
        return errno(EINVAL);
    };
    let flags = MapFlags::from_bits_truncate(flags);
    if !flags.is_valid() || len == 0 || !offset.is_aligned(PAGE_SIZE) {
        return errno(EINVAL);
    }
    let Some(len) = len.page_ceil() else {
        return errno(ENOMEM);
    };
    let fixed = flags.intersects(MapFlags::FIXED | MapFlags::FIXED_NOREPLACE);
    if fixed && !addr.is_aligned(PAGE_SIZE) {
        return errno(EINVAL);
    }

    let mut region_flags = prot_to_region(prot) | RegionFlags::USER;
    region_flags |= if flags.contains(MapFlags::SHARED) {
        RegionFlags::SHARED
    } else {
        RegionFlags::PRIVATE
    };
    if flags.contains(MapFlags::STACK) {
        region_flags |= RegionFlags::STACK;
    }
    if fixed {
        region_flags |= RegionFlags::FIXED;
    }

    let (backing, pgoff) = if flags.contains(MapFlags::ANONYMOUS) {
        (RegionBacking::Anonymous, 0)
    } else {
        let Some(file) = file else {
            return errno(EBADF);
        };
        if !file.readable()
            || (flags.contains(MapFlags::SHARED) && prot.contains(ProtFlags::WRITE) && !file.writable())
        {
            return errno(EACCES);
        }
        let pgoff = (offset / PAGE_SIZE) as u64;
        if let Some(ops) = file.mmap_ops() {
            region_flags |= RegionFlags::DEVICE;
            (RegionBacking::Device(ops), pgoff)
        } else {
            match file.inode() {
                Ok(inode) => (RegionBacking::File(space.cache().mapping_for(inode)), pgoff),
                Err(e) => return e,
            }
        }
    };

    let placement = if flags.contains(MapFlags::FIXED_NOREPLACE) {
        Placement::FixedNoReplace(addr)
    } else if flags.contains(MapFlags::FIXED) {
        Placement::Fixed(addr)
    } else if addr != 0 {
        Placement::Hint(addr)
    } else {
        Placement::Any
    };

    let region = match space.alloc_region(placement, len, region_flags, pgoff, backing) {
        Ok(r) => r,
        Err(e) => {
            log::debug!("mmap: {:#x}+{:#x} {:?} failed: {}", addr, len, flags, e);
            return e.to_errno();
        }
    };
    if flags.contains(MapFlags::POPULATE) {
        populate(space, &region);
    }
    region.base() as isize
}

/// 预先为区域的每一页触发缺页，失败的页留给之后的访问
fn populate(space: &VmSpace, region: &Region) {
    let mut access = FaultFlags::USER | FaultFlags::NOT_PRESENT | FaultFlags::READ;
    if region.is_anonymous() && region.flags().contains(RegionFlags::WRITE) {
        access |= FaultFlags::WRITE;
    }
    for va in (region.base()..region.end()).step_by(PAGE_SIZE) {
        if let Err(e) = space.handle_fault(va, access) {
            log::debug!("mmap: populate stopped at {:#x}: {}", va, e);
            break;
        }
    }
}

/// munmap
pub fn munmap(space: &VmSpace, addr: usize, len: usize) -> isize {
    match space.unmap_range(addr, len) {
        Ok(()) => 0,
        Err(e) => e.to_errno(),
    }
}

/// mprotect
///
/// 范围内存在未映射的空洞时返回 `-ENOMEM`。
pub fn mprotect(space: &VmSpace, addr: usize, len: usize, prot: i32) -> isize {
    let Some(prot) = ProtFlags::from_bits(prot) else {
        return errno(EINVAL);
    };
    if !addr.is_aligned(PAGE_SIZE) {
        return errno(EINVAL);
    }
    if len == 0 {
        return 0;
    }
    match space.protect(addr, len, prot_to_region(prot)) {
        Ok(()) => 0,
        Err(e) => e.to_errno(),
    }
}

/// brk
///
/// `addr` 为 0 时查询当前堆顶；调整失败时返回原堆顶。
pub fn brk(space: &VmSpace, addr: usize) -> isize {
    let mut inner = space.inner.lock();
    let cur = inner.brk;
    if addr == 0 || addr < inner.heap_base {
        return cur as isize;
    }
    let (Some(old_end), Some(new_end)) = (cur.page_ceil(), addr.page_ceil()) else {
        return cur as isize;
    };
    if new_end > inner.map_base {
        log::debug!("brk: {:#x} beyond heap limit {:#x}", addr, inner.map_base);
        return cur as isize;
    }

    if new_end > old_end {
        let flags = RegionFlags::READ
            | RegionFlags::WRITE
            | RegionFlags::USER
            | RegionFlags::PRIVATE
            | RegionFlags::HEAP;
        let placed = space.alloc_region_locked(
            &mut inner,
            Placement::FixedNoReplace(old_end),
            new_end - old_end,
            flags,
            0,
            RegionBacking::Anonymous,
        );
        if let Err(e) = placed {
            log::debug!("brk: growing to {:#x} failed: {}", addr, e);
            return cur as isize;
        }
        inner.merge_around(old_end, new_end);
    } else if new_end < old_end {
        space.remove_range_locked(&mut inner, new_end, old_end - new_end);
    }
    inner.brk = addr;
    addr as isize
}

/// mremap
pub fn mremap(space: &VmSpace, old_addr: usize, old_len: usize, new_len: usize, flags: i32, new_addr: usize) -> isize {
    let Some(flags) = MremapFlags::from_bits(flags) else {
        return errno(EINVAL);
    };
    if !flags.is_valid() || !old_addr.is_aligned(PAGE_SIZE) || new_len == 0 {
        return errno(EINVAL);
    }
    let (Some(old_len), Some(new_len)) = (old_len.page_ceil(), new_len.page_ceil()) else {
        return errno(EINVAL);
    };
    if old_len == 0 {
        return errno(EINVAL);
    }

    let mut inner = space.inner.lock();
    let Some(region) = inner.find(old_addr).cloned() else {
        return errno(EFAULT);
    };
    if old_len > region.end() - old_addr {
        return errno(EFAULT);
    }
    let old_end = old_addr + old_len;

    if flags.contains(MremapFlags::FIXED) {
        if !new_addr.is_aligned(PAGE_SIZE)
            || !space.contains_range(new_addr, new_len)
            || crate::address::ranges_overlap(old_addr, old_len, new_addr, new_len)
        {
            return errno(EINVAL);
        }
        return match move_region(space, &mut inner, old_addr, old_len, new_len, Some(new_addr)) {
            Ok(base) => base as isize,
            Err(e) => e.to_errno(),
        };
    }

    if new_len <= old_len {
        if new_len < old_len {
            space.remove_range_locked(&mut inner, old_addr + new_len, old_len - new_len);
        }
        return old_addr as isize;
    }

    let grow = new_len - old_len;
    if old_end == region.end() && space.contains_range(old_addr, new_len) && inner.is_free(old_end, grow) {
        if let Some(r) = inner.regions.get_mut(&region.base()) {
            r.set_size(r.size() + grow);
        }
        return old_addr as isize;
    }
    if !flags.contains(MremapFlags::MAYMOVE) {
        return errno(ENOMEM);
    }
    match move_region(space, &mut inner, old_addr, old_len, new_len, None) {
        Ok(base) => base as isize,
        Err(e) => e.to_errno(),
    }
}

/// 把 `[old_addr, old_addr + old_len)` 搬到新位置，已映射的页原样搬过去
fn move_region(
    space: &VmSpace,
    inner: &mut SpaceInner,
    old_addr: usize,
    old_len: usize,
    new_len: usize,
    fixed: Option<usize>,
) -> VmResult<usize> {
    inner.split_at(old_addr);
    inner.split_at(old_addr + old_len);
    let new_base = match fixed {
        Some(addr) => {
            space.remove_range_locked(inner, addr, new_len);
            addr
        }
        None => inner
            .first_fit(inner.map_base, inner.map_end, new_len)
            .ok_or(VmError::NoMemory)?,
    };
    let Some(old) = inner.regions.remove(&old_addr) else {
        return Err(VmError::Fault);
    };

    let keep = old_len.min(new_len);
    let mut moved = Vec::new();
    let mut failure = None;
    for off in (0..keep).step_by(PAGE_SIZE) {
        let (from, to) = (old_addr + off, new_base + off);
        let Ok((_, flags)) = space.mmu.query(from) else {
            continue;
        };
        let pgoff = old.pgoff_of(from);
        match move_page(space, &old, pgoff, from, to, flags) {
            Ok(()) => moved.push((pgoff, from, to, flags)),
            Err(e) => {
                failure = Some((from, to, e));
                break;
            }
        }
    }

    if let Some((from, to, e)) = failure {
        log::warn!("mremap: moving {:#x} -> {:#x} failed: {}", from, to, e);
        let mut at_new = old.clone();
        at_new.set_base(new_base, old.pgoff());
        for (pgoff, from, to, flags) in moved {
            if move_page(space, &old, pgoff, to, from, flags).is_err() {
                space.release_pages(&at_new, to, to + PAGE_SIZE);
            }
        }
        inner.regions.insert(old_addr, old);
        inner.merge_around(old_addr, old_addr + old_len);
        return Err(e);
    }

    if new_len < old_len {
        space.release_pages(&old, old_addr + new_len, old_addr + old_len);
    }
    let mut region = old;
    region.set_base(new_base, region.pgoff());
    region.set_size(new_len);
    inner.regions.insert(new_base, region);
    log::trace!("mremap: {:#x}+{:#x} -> {:#x}+{:#x}", old_addr, old_len, new_base, new_len);
    Ok(new_base)
}

fn move_page(space: &VmSpace, region: &Region, pgoff: u64, from: usize, to: usize, flags: MmuFlags) -> VmResult<()> {
    match region.mapping() {
        Some(mapping) => space.cache.move_page(mapping, pgoff, &space.mmu, from, to, flags),
        None => space.mmu.move_range(from, to, 1, flags),
    }
}

/// msync：写回范围内共享文件映射的脏页
pub fn msync(space: &VmSpace, addr: usize, len: usize, flags: i32) -> isize {
    let Some(flags) = MsyncFlags::from_bits(flags) else {
        return errno(EINVAL);
    };
    if !flags.is_valid() || !addr.is_aligned(PAGE_SIZE) {
        return errno(EINVAL);
    }
    if len == 0 {
        return 0;
    }
    let len = match space.check_range(addr, len) {
        Ok(len) => len,
        Err(_) => return errno(ENOMEM),
    };

    let inner = space.inner.lock();
    if !inner.is_covered(addr, len) {
        return errno(ENOMEM);
    }
    let end = addr + len;
    for base in inner.overlapping(addr, len) {
        let Some(region) = inner.regions.get(&base) else {
            continue;
        };
        let Some(mapping) = region.mapping().filter(|_| region.is_shared()) else {
            continue;
        };
        let start = addr.max(region.base());
        let stop = end.min(region.end());
        if let Err(e) = space
            .cache
            .flush_range(mapping, region.pgoff_of(start), region.pgoff_of(stop))
        {
            return e.to_errno();
        }
    }
    0
}

#[cfg(test)]
mod tests;

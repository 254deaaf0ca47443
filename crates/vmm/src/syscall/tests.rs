use alloc::sync::Arc;

use uapi::errno::{EEXIST, EINVAL};

use super::*;
use crate::address::PAGE_SIZE;
use crate::arch::MmuFlags;
use crate::test_utils::{TestFile, TestVm};

const R: i32 = ProtFlags::READ.bits();
const RW: i32 = ProtFlags::READ.bits() | ProtFlags::WRITE.bits();
const PRIVATE_ANON: i32 = MapFlags::PRIVATE.bits() | MapFlags::ANONYMOUS.bits();
const SHARED: i32 = MapFlags::SHARED.bits();

fn map_anon(space: &VmSpace, pages: usize) -> usize {
    let addr = mmap(space, 0, pages * PAGE_SIZE, RW, PRIVATE_ANON, None, 0);
    assert!(addr > 0, "mmap failed: {}", addr);
    addr as usize
}

#[test]
fn anonymous_mmap_is_lazy() {
    let t = TestVm::new(256);
    let space = t.vm.create_user_space().unwrap();
    let addr = mmap(&space, 0, 8192, RW, PRIVATE_ANON, None, 0);
    assert!(addr > 0);
    let addr = addr as usize;
    assert_eq!(addr % PAGE_SIZE, 0);
    assert_eq!(space.query(addr), Err(VmError::NotFound));

    space.copy_to_user(addr, &[1]).unwrap();
    let (_, flags) = space.query(addr).unwrap();
    assert!(flags.contains(MmuFlags::PERM_WRITE));
}

#[test]
fn mmap_rejects_bad_arguments() {
    let t = TestVm::new(256);
    let space = t.vm.create_user_space().unwrap();
    let ro: Arc<dyn MmFile> = TestFile::read_only(1, b"data");

    assert_eq!(mmap(&space, 0, 0, RW, PRIVATE_ANON, None, 0), -(EINVAL as isize));
    assert_eq!(mmap(&space, 0, PAGE_SIZE, RW, PRIVATE_ANON | SHARED, None, 0), -(EINVAL as isize));
    assert_eq!(mmap(&space, 0, PAGE_SIZE, 0x100, PRIVATE_ANON, None, 0), -(EINVAL as isize));
    assert_eq!(
        mmap(&space, 0, PAGE_SIZE, R, MapFlags::PRIVATE.bits(), Some(&ro), 100),
        -(EINVAL as isize)
    );
    assert_eq!(
        mmap(&space, 0x2000_0001, PAGE_SIZE, RW, PRIVATE_ANON | MapFlags::FIXED.bits(), None, 0),
        -(EINVAL as isize)
    );
    assert_eq!(mmap(&space, 0, PAGE_SIZE, R, MapFlags::PRIVATE.bits(), None, 0), -(EBADF as isize));
    assert_eq!(mmap(&space, 0, PAGE_SIZE, RW, SHARED, Some(&ro), 0), -(EACCES as isize));
    assert_eq!(space.region_count(), 0);

    assert!(mmap(&space, 0, PAGE_SIZE, RW, MapFlags::PRIVATE.bits(), Some(&ro), 0) > 0);
}

#[test]
fn fixed_mappings() {
    let t = TestVm::new(256);
    let space = t.vm.create_user_space().unwrap();
    let fixed = MapFlags::FIXED.bits();
    let noreplace = MapFlags::FIXED_NOREPLACE.bits();

    assert_eq!(mmap(&space, 0x2000_0000, 2 * PAGE_SIZE, RW, PRIVATE_ANON | fixed, None, 0), 0x2000_0000);
    assert_eq!(
        mmap(&space, 0x2000_1000, PAGE_SIZE, RW, PRIVATE_ANON | noreplace, None, 0),
        -(EEXIST as isize)
    );
    assert_eq!(mmap(&space, 0x2000_1000, PAGE_SIZE, R, PRIVATE_ANON | fixed, None, 0), 0x2000_1000);
    assert_eq!(space.region_count(), 2);
    assert!(space.find(0x2000_1000).unwrap().flags().contains(RegionFlags::FIXED));
}

#[test]
fn populate_and_stack_flags() {
    let t = TestVm::new(256);
    let space = t.vm.create_user_space().unwrap();
    let flags = PRIVATE_ANON | MapFlags::POPULATE.bits() | MapFlags::STACK.bits();
    let addr = mmap(&space, 0, 4 * PAGE_SIZE, RW, flags, None, 0) as usize;
    assert_eq!(space.resident_pages(), 4);
    assert!(space.query(addr + 3 * PAGE_SIZE).unwrap().1.contains(MmuFlags::PERM_WRITE));
    assert!(space.find(addr).unwrap().flags().contains(RegionFlags::STACK));
}

#[test]
fn munmap_and_mprotect() {
    let t = TestVm::new(256);
    let space = t.vm.create_user_space().unwrap();
    let addr = map_anon(&space, 3);
    space.copy_to_user(addr, &[1]).unwrap();

    assert_eq!(mprotect(&space, addr, 3 * PAGE_SIZE, R), 0);
    assert!(!space.query(addr).unwrap().1.contains(MmuFlags::PERM_WRITE));
    assert_eq!(space.copy_to_user(addr, &[2]), Err(VmError::Fault));
    assert_eq!(mprotect(&space, addr, 4 * PAGE_SIZE, RW), -(ENOMEM as isize));
    assert_eq!(mprotect(&space, addr + 1, PAGE_SIZE, RW), -(EINVAL as isize));
    assert_eq!(mprotect(&space, addr, 0, RW), 0);

    assert_eq!(munmap(&space, addr + 1, PAGE_SIZE), -(EINVAL as isize));
    assert_eq!(munmap(&space, addr, PAGE_SIZE), 0);
    assert_eq!(space.query(addr), Err(VmError::NotFound));
    assert_eq!(munmap(&space, addr, PAGE_SIZE), 0);
    assert_eq!(space.region_count(), 1);
}

#[test]
fn brk_grows_and_shrinks_heap() {
    let t = TestVm::new(256);
    let space = t.vm.create_user_space().unwrap();
    let heap = t.vm.config().user_heap_base;

    assert_eq!(brk(&space, 0), heap as isize);
    let top = heap + 3 * PAGE_SIZE + 100;
    assert_eq!(brk(&space, top), top as isize);
    assert_eq!(brk(&space, 0), top as isize);
    let region = space.find(heap).unwrap();
    assert!(region.flags().contains(RegionFlags::HEAP));
    assert_eq!(region.size(), 4 * PAGE_SIZE);
    space.copy_to_user(heap, &[8]).unwrap();
    space.copy_to_user(top - 1, &[9]).unwrap();

    let top2 = heap + 6 * PAGE_SIZE;
    assert_eq!(brk(&space, top2), top2 as isize);
    assert_eq!(space.region_count(), 1);
    assert_eq!(space.find(heap).unwrap().size(), 6 * PAGE_SIZE);

    let free = t.vm.phys().free_pages();
    assert_eq!(brk(&space, heap + PAGE_SIZE), (heap + PAGE_SIZE) as isize);
    assert_eq!(space.query(top - 1), Err(VmError::NotFound));
    assert_eq!(t.vm.phys().free_pages(), free + 1);

    let limit = t.vm.config().user_map_base;
    assert_eq!(brk(&space, limit + PAGE_SIZE), (heap + PAGE_SIZE) as isize);
    assert_eq!(brk(&space, heap - PAGE_SIZE), (heap + PAGE_SIZE) as isize);
}

#[test]
fn mremap_shrinks_in_place() {
    let t = TestVm::new(256);
    let space = t.vm.create_user_space().unwrap();
    let addr = map_anon(&space, 3);
    for i in 0..3 {
        space.copy_to_user(addr + i * PAGE_SIZE, &[i as u8]).unwrap();
    }

    assert_eq!(mremap(&space, addr, 3 * PAGE_SIZE, PAGE_SIZE, 0, 0), addr as isize);
    assert!(space.query(addr).is_ok());
    assert_eq!(space.query(addr + PAGE_SIZE), Err(VmError::NotFound));
    assert_eq!(space.query(addr + 2 * PAGE_SIZE), Err(VmError::NotFound));
    assert_eq!(space.find(addr).unwrap().size(), PAGE_SIZE);
}

#[test]
fn mremap_grows_in_place_or_moves() {
    let t = TestVm::new(256);
    let space = t.vm.create_user_space().unwrap();
    let a = map_anon(&space, 1);
    space.copy_to_user(a + 5, &[0x5a]).unwrap();

    assert_eq!(mremap(&space, a, PAGE_SIZE, 2 * PAGE_SIZE, 0, 0), a as isize);
    assert_eq!(space.find(a).unwrap().size(), 2 * PAGE_SIZE);

    let b = map_anon(&space, 1);
    assert_eq!(b, a + 2 * PAGE_SIZE);
    assert_eq!(mremap(&space, a, 2 * PAGE_SIZE, 4 * PAGE_SIZE, 0, 0), -(ENOMEM as isize));

    let maymove = MremapFlags::MAYMOVE.bits();
    let moved = mremap(&space, a, 2 * PAGE_SIZE, 4 * PAGE_SIZE, maymove, 0);
    assert_eq!(moved, (b + PAGE_SIZE) as isize);
    let moved = moved as usize;
    assert_eq!(space.query(a), Err(VmError::NotFound));
    assert!(space.find(a).is_none());
    let mut byte = [0u8];
    space.copy_from_user(moved + 5, &mut byte).unwrap();
    assert_eq!(byte, [0x5a]);
    assert_eq!(space.find(moved).unwrap().size(), 4 * PAGE_SIZE);
}

#[test]
fn mremap_fixed_and_errors() {
    let t = TestVm::new(256);
    let space = t.vm.create_user_space().unwrap();
    let a = map_anon(&space, 2);
    space.copy_to_user(a, &[3]).unwrap();
    let both = (MremapFlags::MAYMOVE | MremapFlags::FIXED).bits();

    assert_eq!(mremap(&space, a, PAGE_SIZE, PAGE_SIZE, MremapFlags::FIXED.bits(), 0x2000_0000), -(EINVAL as isize));
    assert_eq!(mremap(&space, a, 2 * PAGE_SIZE, PAGE_SIZE, both, a + PAGE_SIZE), -(EINVAL as isize));
    assert_eq!(mremap(&space, 0x3000_0000, PAGE_SIZE, PAGE_SIZE, 0, 0), -(EFAULT as isize));
    assert_eq!(mremap(&space, a, 3 * PAGE_SIZE, PAGE_SIZE, 0, 0), -(EFAULT as isize));

    assert_eq!(mremap(&space, a, PAGE_SIZE, PAGE_SIZE, both, 0x2000_0000), 0x2000_0000);
    let mut byte = [0u8];
    space.copy_from_user(0x2000_0000, &mut byte).unwrap();
    assert_eq!(byte, [3]);
    assert_eq!(space.find(a + PAGE_SIZE).unwrap().base(), a + PAGE_SIZE);
    assert!(space.find(a).is_none());
}

#[test]
fn msync_writes_back_shared_file_pages() {
    let t = TestVm::new(256);
    let space = t.vm.create_user_space().unwrap();
    let tf = TestFile::new(7, &[0u8; 2 * PAGE_SIZE]);
    let file: Arc<dyn MmFile> = tf.clone();
    let addr = mmap(&space, 0, 2 * PAGE_SIZE, RW, SHARED, Some(&file), 0) as usize;

    space.copy_to_user(addr + PAGE_SIZE, b"sync").unwrap();
    assert!(tf.data.writes().is_empty());
    assert_eq!(msync(&space, addr, 2 * PAGE_SIZE, MsyncFlags::SYNC.bits()), 0);
    assert_eq!(tf.data.writes(), alloc::vec![(PAGE_SIZE, PAGE_SIZE)]);
    assert_eq!(&tf.data.contents()[PAGE_SIZE..PAGE_SIZE + 4], b"sync");

    let bad = (MsyncFlags::SYNC | MsyncFlags::ASYNC).bits();
    assert_eq!(msync(&space, addr, PAGE_SIZE, bad), -(EINVAL as isize));
    assert_eq!(msync(&space, addr, 3 * PAGE_SIZE, MsyncFlags::SYNC.bits()), -(ENOMEM as isize));
}

#[test]
fn failed_mremap_move_restores_source() {
    let t = TestVm::new(256);
    let space = t.vm.create_user_space().unwrap();
    let a = map_anon(&space, 2);
    space.copy_to_user(a, &[1]).unwrap();
    space.copy_to_user(a + PAGE_SIZE, &[2]).unwrap();
    let phys = t.vm.phys();
    let held = phys.alloc_pages(phys.free_pages()).unwrap();

    let both = (MremapFlags::MAYMOVE | MremapFlags::FIXED).bits();
    assert_eq!(
        mremap(&space, a, 2 * PAGE_SIZE, 2 * PAGE_SIZE, both, 0x2000_0000),
        -(ENOMEM as isize)
    );
    assert_eq!(space.region_count(), 1);
    assert_eq!(space.find(a).unwrap().size(), 2 * PAGE_SIZE);
    assert!(space.find(0x2000_0000).is_none());
    let mut byte = [0u8];
    space.copy_from_user(a + PAGE_SIZE, &mut byte).unwrap();
    assert_eq!(byte, [2]);

    for page in held {
        phys.put_page(page);
    }
    assert_eq!(mremap(&space, a, 2 * PAGE_SIZE, 2 * PAGE_SIZE, both, 0x2000_0000), 0x2000_0000);
    space.copy_from_user(0x2000_0000, &mut byte).unwrap();
    assert_eq!(byte, [1]);
    assert_eq!(space.query(a), Err(VmError::NotFound));
}

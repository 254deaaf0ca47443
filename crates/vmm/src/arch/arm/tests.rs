use super::*;
use crate::test_utils::test_phys;

const USER_RW: MmuFlags = MmuFlags::PERM_USER
    .union(MmuFlags::PERM_READ)
    .union(MmuFlags::PERM_WRITE);
const USER_RO: MmuFlags = MmuFlags::PERM_USER.union(MmuFlags::PERM_READ);

#[test]
fn map_unmap_is_inverse() {
    let (_ram, phys) = test_phys(64);
    let mmu = ArchMmu::new(phys.clone()).unwrap();
    let (va, pa) = (0x0010_1000, 0x8000_3000);

    assert_eq!(mmu.map(va, pa, 3, USER_RW), Ok(3));
    for k in 0..3 {
        assert_eq!(mmu.query(va + k * PAGE_SIZE), Ok((pa + k * PAGE_SIZE, USER_RW)));
    }
    assert_eq!(mmu.table_pages(), 1);

    assert_eq!(mmu.unmap(va, 3), Ok(3));
    for k in 0..3 {
        assert_eq!(mmu.query(va + k * PAGE_SIZE), Err(VmError::NotFound));
    }
    assert_eq!(mmu.table_pages(), 0);

    assert_eq!(mmu.map(va, pa, 3, USER_RW), Ok(3));
    assert_eq!(mmu.query(va + 2 * PAGE_SIZE), Ok((pa + 2 * PAGE_SIZE, USER_RW)));
}

#[test]
fn aligned_runs_use_sections() {
    let (_ram, phys) = test_phys(64);
    let mmu = ArchMmu::new(phys.clone()).unwrap();
    let flags = MmuFlags::PERM_READ | MmuFlags::PERM_WRITE | MmuFlags::PERM_EXECUTE;

    assert_eq!(mmu.map(0x0030_0000, 0x8010_0000, PAGES_PER_SECTION + 2, flags), Ok(258));
    assert_eq!(mmu.table_pages(), 1);
    assert_eq!(mmu.query(0x0030_1234), Ok((0x8010_1234, flags)));
    assert_eq!(mmu.query(0x0040_1000), Ok((0x8020_1000, flags)));

    assert_eq!(mmu.unmap(0x0030_0000, PAGES_PER_SECTION), Ok(PAGES_PER_SECTION));
    assert_eq!(mmu.query(0x0030_1000), Err(VmError::NotFound));
    assert!(mmu.query(0x0040_0000).is_ok());
}

#[test]
fn partial_section_unmap_splits() {
    let (_ram, phys) = test_phys(64);
    let mmu = ArchMmu::new(phys.clone()).unwrap();
    mmu.map(0x0050_0000, 0x8030_0000, PAGES_PER_SECTION, USER_RW).unwrap();
    assert_eq!(mmu.table_pages(), 0);

    assert_eq!(mmu.unmap(0x0050_5000, 1), Ok(1));
    assert_eq!(mmu.table_pages(), 1);
    assert_eq!(mmu.query(0x0050_5000), Err(VmError::NotFound));
    assert_eq!(mmu.query(0x0050_4000), Ok((0x8030_4000, USER_RW)));
    assert_eq!(mmu.query(0x0050_6000), Ok((0x8030_6000, USER_RW)));
}

#[test]
fn map_over_existing_rolls_back() {
    let (_ram, phys) = test_phys(64);
    let mmu = ArchMmu::new(phys.clone()).unwrap();
    mmu.map(0x0010_3000, 0x8000_0000, 1, USER_RO).unwrap();

    assert_eq!(
        mmu.map(0x0010_1000, 0x8001_0000, 3, USER_RW),
        Err(VmError::AlreadyExists)
    );
    assert_eq!(mmu.query(0x0010_1000), Err(VmError::NotFound));
    assert_eq!(mmu.query(0x0010_2000), Err(VmError::NotFound));
    assert_eq!(mmu.query(0x0010_3000), Ok((0x8000_0000, USER_RO)));
}

#[test]
fn second_level_tables_share_a_page() {
    let (_ram, phys) = test_phys(64);
    let mmu = ArchMmu::new(phys.clone()).unwrap();
    let free = phys.free_pages();

    mmu.map(0x0010_0000, 0x8000_0000, 1, USER_RW).unwrap();
    mmu.map(0x0020_0000, 0x8000_1000, 1, USER_RW).unwrap();
    assert_eq!(mmu.table_pages(), 1);
    mmu.map(0x0040_0000, 0x8000_2000, 1, USER_RW).unwrap();
    assert_eq!(mmu.table_pages(), 2);

    mmu.unmap(0x0010_0000, 1).unwrap();
    assert_eq!(mmu.table_pages(), 2);
    mmu.unmap(0x0020_0000, 1).unwrap();
    mmu.unmap(0x0040_0000, 1).unwrap();
    assert_eq!(mmu.table_pages(), 0);
    assert_eq!(phys.free_pages(), free);
}

#[test]
fn change_protection_keeps_address() {
    let (_ram, phys) = test_phys(64);
    let mmu = ArchMmu::new(phys.clone()).unwrap();
    mmu.map(0x0010_0000, 0x8000_0000, 2, USER_RW).unwrap();

    mmu.change_protection(0x0010_0000, 4, USER_RO).unwrap();
    assert_eq!(mmu.query(0x0010_1000), Ok((0x8000_1000, USER_RO)));
    assert_eq!(mmu.query(0x0010_2000), Err(VmError::NotFound));
}

#[test]
fn move_range_relocates_mappings() {
    let (_ram, phys) = test_phys(64);
    let mmu = ArchMmu::new(phys.clone()).unwrap();
    mmu.map(0x0010_0000, 0x8000_0000, 2, USER_RW).unwrap();

    mmu.move_range(0x0010_0000, 0x0070_0000, 3, USER_RO).unwrap();
    assert_eq!(mmu.query(0x0010_0000), Err(VmError::NotFound));
    assert_eq!(mmu.query(0x0070_1000), Ok((0x8000_1000, USER_RO)));
    assert_eq!(mmu.query(0x0070_2000), Err(VmError::NotFound));

    mmu.map(0x0010_0000, 0x8000_5000, 1, USER_RW).unwrap();
    assert_eq!(
        mmu.move_range(0x0010_0000, 0x0070_0000, 1, USER_RW),
        Err(VmError::AlreadyExists)
    );
}

#[test]
fn failed_move_leaves_source_mapped() {
    let (_ram, phys) = test_phys(64);
    let mmu = ArchMmu::new(phys.clone()).unwrap();
    mmu.map(0x0010_0000, 0x8000_0000, 2, USER_RW).unwrap();
    let held = phys.alloc_pages(phys.free_pages()).unwrap();

    assert_eq!(
        mmu.move_range(0x0010_0000, 0x0070_0000, 2, USER_RW),
        Err(VmError::NoMemory)
    );
    assert_eq!(mmu.query(0x0010_1000), Ok((0x8000_1000, USER_RW)));
    assert_eq!(mmu.query(0x0070_0000), Err(VmError::NotFound));
    assert_eq!(mmu.table_pages(), 1);

    for page in held {
        phys.put_page(page);
    }
    mmu.move_range(0x0010_0000, 0x0070_0000, 2, USER_RW).unwrap();
    assert_eq!(mmu.query(0x0070_1000), Ok((0x8000_1000, USER_RW)));
    assert_eq!(mmu.table_pages(), 1);
}

#[test]
#[should_panic(expected = "vmm fatal")]
fn page_inside_section_is_fatal() {
    let (_ram, phys) = test_phys(64);
    let mmu = ArchMmu::new(phys.clone()).unwrap();
    mmu.map(0x0030_0000, 0x8010_0000, PAGES_PER_SECTION, USER_RW).unwrap();
    let _ = mmu.map(0x0030_8000, 0x8000_0000, 1, USER_RW);
}

#[test]
fn invalid_ranges_are_rejected() {
    let (_ram, phys) = test_phys(64);
    let mmu = ArchMmu::new(phys.clone()).unwrap();
    assert_eq!(mmu.map(0x0010_0001, 0x8000_0000, 1, USER_RW), Err(VmError::InvalidArgs));
    assert_eq!(mmu.map(0x0010_0000, 0x8000_0000, 0, USER_RW), Err(VmError::InvalidArgs));
    assert_eq!(mmu.map(0xffff_f000, 0x8000_0000, 2, USER_RW), Err(VmError::InvalidArgs));
    assert_eq!(mmu.unmap(0x0010_0000, 300), Ok(0));
}

#[test]
fn context_switch_loads_ttbr() {
    let (ram, phys) = test_phys(64);
    let mmu = ArchMmu::new(phys.clone()).unwrap();
    mmu.context_switch();
    assert_eq!(ram.ttbr_switches(), 1);
    assert_eq!(ram.last_asid(), mmu.asid() as usize);
}

#[test]
fn drop_returns_every_table_page() {
    let (_ram, phys) = test_phys(64);
    let free = phys.free_pages();
    {
        let mmu = ArchMmu::new(phys.clone()).unwrap();
        mmu.map(0x0010_0000, 0x8000_0000, 300, USER_RW).unwrap();
        mmu.map(0x0200_0000, 0x8000_0000, 1, USER_RW).unwrap();
        assert!(phys.free_pages() < free);
    }
    assert_eq!(phys.free_pages(), free);
}

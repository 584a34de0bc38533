#![cfg(not(target_arch = "wasm32"))]

use ember_mem::{AccessType, ChunkSpec, FaultKind, MemoryConfig, MemorySystem, PAGE_SIZE};

#[test]
fn committed_page_reads_back_what_was_written() {
    let mut mem = MemorySystem::new(MemoryConfig::default());
    let space = mem.create_space();
    let chunk = mem.reserve(space, ChunkSpec::local("data", 0x4000)).unwrap();
    mem.commit(chunk, 0, 0x1000).unwrap();
    let base = mem.chunk(chunk).unwrap().base();

    mem.write(space, base, &[0xAB; 0x1000]).unwrap();
    let mut back = vec![0u8; 0x1000];
    mem.read(space, base, &mut back).unwrap();
    assert!(back.iter().all(|&b| b == 0xAB));

    // Reserved but not committed.
    let err = mem.read_u8(space, base + 0x1000).unwrap_err();
    assert_eq!(err.kind, FaultKind::Unmapped);
    assert_eq!(err.addr, base + 0x1000);
    assert_eq!(err.access, AccessType::Read);
}

#[test]
fn write_past_committed_range_faults_and_changes_nothing() {
    let mut mem = MemorySystem::new(MemoryConfig::default());
    let space = mem.create_space();
    let chunk = mem.reserve(space, ChunkSpec::local("data", 0x2000)).unwrap();
    mem.commit(chunk, 0, 0x1000).unwrap();
    let base = mem.chunk(chunk).unwrap().base();
    mem.write(space, base, &[0xAB; 0x1000]).unwrap();

    let err = mem.write_u8(space, base + 0x1000, 0x11).unwrap_err();
    assert_eq!(err.kind, FaultKind::Unmapped);
    assert_eq!(err.addr, base + 0x1000);
    assert_eq!(err.access, AccessType::Write);

    // Straddles the committed edge; the committed half stays untouched.
    let err = mem.write(space, base + 0xFFE, &[0x22; 4]).unwrap_err();
    assert_eq!(err.kind, FaultKind::Unmapped);
    assert_eq!(mem.read_u8(space, base + 0xFFE).unwrap(), 0xAB);
    assert_eq!(mem.read_u8(space, base + 0xFFF).unwrap(), 0xAB);
    assert_eq!(mem.chunk(chunk).unwrap().committed_size(), 0x1000);
}

#[test]
fn last_byte_of_chunk_is_accessible_and_one_past_faults() {
    let mut mem = MemorySystem::new(MemoryConfig::default());
    let space = mem.create_space();
    let chunk = mem.reserve(space, ChunkSpec::local("data", PAGE_SIZE)).unwrap();
    mem.commit(chunk, 0, PAGE_SIZE).unwrap();
    let c = mem.chunk(chunk).unwrap();
    let last = c.base() + c.reserved_size() - 1;

    mem.write_u8(space, last, 0x5A).unwrap();
    assert_eq!(mem.read_u8(space, last).unwrap(), 0x5A);
    assert_eq!(
        mem.read_u8(space, last + 1).unwrap_err().kind,
        FaultKind::Unmapped
    );
}

#[test]
fn decommit_then_recommit_yields_zeroed_page() {
    let mut mem = MemorySystem::new(MemoryConfig::default());
    let space = mem.create_space();
    let chunk = mem.reserve(space, ChunkSpec::local("data", PAGE_SIZE)).unwrap();
    let base = mem.chunk(chunk).unwrap().base();
    mem.commit(chunk, 0, PAGE_SIZE).unwrap();
    mem.write_u32(space, base, 0xFFFF_FFFF).unwrap();

    mem.decommit(chunk, 0, PAGE_SIZE).unwrap();
    assert!(mem.read_u32(space, base).is_err());
    mem.commit(chunk, 0, PAGE_SIZE).unwrap();
    assert_eq!(mem.read_u32(space, base).unwrap(), 0);
}

#[test]
fn released_chunk_address_is_unmapped() {
    let mut mem = MemorySystem::new(MemoryConfig::default());
    let space = mem.create_space();
    let chunk = mem.reserve(space, ChunkSpec::local("data", PAGE_SIZE)).unwrap();
    let base = mem.chunk(chunk).unwrap().base();
    mem.commit(chunk, 0, PAGE_SIZE).unwrap();
    mem.release(chunk).unwrap();

    assert_eq!(mem.space(space).unwrap().chunk_at(base), None);
    assert_eq!(mem.committed_bytes(), 0);
    assert!(mem.chunk(chunk).is_err());
}

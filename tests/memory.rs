//! Integration tests for the guest address space: permissions, bulk copies, forks and
//! execute segment eviction.

use std::sync::Arc;

use rvmem::{
    memory::{Page, TrapEvent, TrapKind},
    prelude::*,
};

fn options() -> MachineOptions<u64> {
    MachineOptions::default().with_memory_max(16 << 20)
}

/// Changing the permissions of part of a range leaves its neighbours alone.
#[test]
fn test_attribute_split() -> Result<()> {
    let mut memory = Memory::<u64>::new(&options())?;
    memory.memset(0x10_000, 0x55, 4 * 4096)?;
    memory.set_page_attr(0x11_000, 2 * 4096, PageAttributes::read_only())?;

    memory.write::<u8>(0x10_fff, 1)?;
    assert!(memory.write::<u8>(0x11_000, 1).is_err());
    assert!(memory.write::<u8>(0x12_fff, 1).is_err());
    memory.write::<u8>(0x13_000, 1)?;

    // Still readable, data intact
    assert_eq!(memory.read::<u8>(0x12_000)?, 0x55);
    assert_eq!(
        memory.get_page(0x11_000)?.attr,
        PageAttributes::read_only()
    );
    Ok(())
}

/// A two-byte range across a page boundary flips exactly the two pages it touches.
#[test]
fn test_attribute_split_unaligned() -> Result<()> {
    let mut memory = Memory::<u64>::new(&options())?;
    memory.memset(0x30_000, 0, 4 * 4096)?;
    memory.set_page_attr(0x30_fff, 2, PageAttributes::read_only())?;

    assert!(memory.get_page(0x30_000)?.attr.write);
    assert!(!memory.get_page(0x31_000)?.attr.write);
    assert!(!memory.get_page(0x32_000)?.attr.write);
    assert!(memory.get_page(0x33_000)?.attr.write);
    Ok(())
}

/// A copy that straddles pages reads back through a gathered view.
#[test]
fn test_memcpy_memview_across_pages() -> Result<()> {
    let mut memory = Memory::<u64>::new(&options())?;
    let text: Vec<u8> = (0..=255).cycle().take(10_000).collect();
    memory.memcpy(0x20_ff0, &text)?;

    let copy = memory.memview(0x20_ff0, text.len(), 1 << 16, |bytes| bytes.to_vec())?;
    assert_eq!(copy, text);

    let mut out = vec![0; 32];
    memory.memcpy_out(&mut out, 0x20_ff0 + 100)?;
    assert_eq!(out, &text[100..132]);

    assert!(memory.memview(0x20_ff0, 64, 32, |_| ()).is_err());
    Ok(())
}

/// Page 0 faults on every kind of access.
#[test]
fn test_guard_page() -> Result<()> {
    let mut memory = Memory::<u32>::new(&MachineOptions::default())?;
    assert!(matches!(
        memory.read::<u32>(0xffc),
        Err(Error::ProtectionFault { addr: 0xffc })
    ));
    assert!(memory.write::<u8>(0, 1).is_err());
    assert!(memory.memcpy(0xff0, &[0; 32]).is_err());
    assert_eq!(memory.pages_active(), 1);
    Ok(())
}

/// Writes after a fork are visible only on the side that made them.
#[test]
fn test_fork_is_isolated_in_both_directions() -> Result<()> {
    let mut master = Memory::<u64>::new(&options())?;
    master.write::<u64>(0x4000, 1)?;
    master.write::<u64>(0x5000, 2)?;

    let mut fork = Memory::fork(&master, &options())?;
    assert_eq!(fork.read::<u64>(0x4000)?, 1);

    fork.write::<u64>(0x4000, 10)?;
    master.write::<u64>(0x5000, 20)?;

    assert_eq!(master.read::<u64>(0x4000)?, 1);
    assert_eq!(fork.read::<u64>(0x4000)?, 10);
    assert_eq!(master.read::<u64>(0x5000)?, 20);
    assert_eq!(fork.read::<u64>(0x5000)?, 2);
    Ok(())
}

/// Pages marked `dont_fork` and minimal forks leave the fork without them.
#[test]
fn test_fork_exclusions() -> Result<()> {
    let mut master = Memory::<u64>::new(&options())?;
    master.write::<u32>(0x4000, 7)?;
    master.write::<u32>(0x6000, 8)?;
    let mut private = PageAttributes::default();
    private.dont_fork = true;
    master.set_page_attr(0x6000, 4096, private)?;

    let fork = Memory::fork(&master, &options())?;
    assert_eq!(fork.read::<u32>(0x4000)?, 7);
    assert_eq!(fork.read::<u32>(0x6000)?, 0);

    let minimal = Memory::fork(&master, &options().with_minimal_fork(true))?;
    assert_eq!(minimal.pages_active(), 1);
    assert_eq!(minimal.read::<u32>(0x4000)?, 0);
    Ok(())
}

/// Evicting execute segments twice is harmless, and released shared segments leave the
/// registry.
#[test]
fn test_evict_is_idempotent() -> Result<()> {
    let shared = Arc::new(SharedExecuteSegments::<u64>::new(true));
    let options = options().with_shared_segments(shared.clone());
    let mut memory = Memory::<u64>::new(&options)?;

    let code = [0x13, 0x05, 0x10, 0x00, 0x73, 0x00, 0x10, 0x00];
    let segment = memory.create_execute_segment(&code, 0x1_0000, true, false)?;
    assert_eq!(shared.len(), 1);
    drop(segment);

    memory.evict_execute_segments();
    assert_eq!(memory.execute_segments_count(), 0);
    assert!(shared.is_empty());

    memory.evict_execute_segments();
    assert_eq!(memory.execute_segments_count(), 0);
    assert_eq!(shared.keys(), 1);
    Ok(())
}

/// MMIO traps see reads and writes and may override loaded values.
#[test]
fn test_mmio_trap() -> Result<()> {
    let mut memory = Memory::<u64>::new(&options())?;
    memory.trap(
        0x7000,
        Some(Arc::new(|_: &Page, event: TrapEvent| {
            (event.kind == TrapKind::Read).then_some(event.offset as u64)
        })),
    )?;

    assert_eq!(memory.read::<u32>(0x7010)?, 0x10);
    memory.write::<u32>(0x7010, 5)?;
    assert_eq!(memory.read::<u32>(0x7010)?, 0x10);
    assert!(memory.get_page(0x7000)?.has_trap());
    Ok(())
}

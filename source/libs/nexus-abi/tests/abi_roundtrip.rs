//! CONTEXT: Contract tests for the shared-frame view and capability references
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 2 integration tests
//!
//! TEST_SCENARIOS:
//!   - clones_share_memory(): Two mappings of one frame observe each other's writes
//!   - cap_ref_roundtrip(): Slot numbers survive wrapping
//!
//! ADR: docs/adr/0016-kernel-libs-architecture.md
use nexus_abi::sync::Ordering;
use nexus_abi::{CapRef, MappedFrame};

#[test]
fn clones_share_memory() {
    let local = MappedFrame::zeroed(4096);
    let remote = local.clone();
    assert!(local.write_bytes(100, b"shared\0"));
    assert_eq!(remote.read_cstr(100).unwrap(), b"shared");
    remote.store(3, 0xdead_beef, Ordering::Release);
    assert_eq!(local.load(3, Ordering::Acquire), 0xdead_beef);
}

#[test]
fn cap_ref_roundtrip() {
    let cap = CapRef::new(42);
    assert_eq!(cap.slot(), 42);
    assert_eq!(cap.to_string(), "cap#42");
}

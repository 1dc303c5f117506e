//! Property-based tests for the employee code format.
//!
//! 1. Format/parse round-trip holds for any prefix, width, and number.
//! 2. Codes with a foreign prefix never parse.
//! 3. The proposed next code is always max+1 over the existing set.
//!
//! Run with: cargo test --test proptest_codes

use once_cell::sync::Lazy;
use proptest::prelude::*;
use sqlx::sqlite::SqlitePool;
use tenantd::onboarding::EmployeeCodeAllocator;
use tokio::runtime::Runtime;

/// Even a lazy pool spawns sqlx maintenance tasks, which needs a Tokio
/// runtime context; proptest bodies are sync, so enter one explicitly.
static RT: Lazy<Runtime> = Lazy::new(|| Runtime::new().unwrap());

/// The pure helpers under test never touch the database; a lazy pool
/// satisfies the constructor without opening anything.
fn allocator(prefix: &str, width: usize) -> EmployeeCodeAllocator {
    let _rt = RT.enter();
    let pool = SqlitePool::connect_lazy("sqlite::memory:").unwrap();
    EmployeeCodeAllocator::new(pool, prefix, width, 5)
}

proptest! {
    /// Formatting then parsing returns the original number, padded or not.
    #[test]
    fn format_parse_roundtrip(
        prefix in "[A-Z]{1,4}",
        width in 1_usize..6,
        n in 0_u64..1_000_000,
    ) {
        let alloc = allocator(&prefix, width);
        let code = alloc.format_code(n);
        prop_assert!(code.starts_with(&prefix));
        prop_assert_eq!(alloc.parse_code(&code), Some(n));
    }

    /// Codes issued under a different prefix are not ours.
    #[test]
    fn foreign_prefixes_are_rejected(n in 0_u64..100_000) {
        let ours = allocator("EMP", 3);
        let theirs = allocator("STAFF", 3);
        prop_assert_eq!(ours.parse_code(&theirs.format_code(n)), None);
    }

    /// The proposal is max+1 over the existing codes and never collides
    /// with any of them.
    #[test]
    fn propose_is_always_max_plus_one(
        existing in prop::collection::vec(0_u64..10_000, 0..50),
    ) {
        let alloc = allocator("EMP", 3);
        let codes: Vec<String> = existing.iter().map(|n| alloc.format_code(*n)).collect();
        let proposed = alloc.propose(&codes);

        let expected = existing.iter().max().map(|max| max + 1).unwrap_or(1);
        prop_assert_eq!(alloc.parse_code(&proposed), Some(expected));
        prop_assert!(!codes.contains(&proposed));
    }
}

//! Every corruption or exhaustion check aborts the process. Each test re-runs
//! itself in a child process and inspects how the child died.

use std::{env, mem::size_of, process::Command, ptr::NonNull};

use partition_alloc::{
  COOKIE_OVERHEAD, INTEGRITY_CHECKS, MAX_FIXED_ALLOCATION, PARTITION_PAGE_SIZE, PageSource,
  PartitionError, PartitionRoot, PartitionRootGeneric, SUPER_PAGE_SIZE,
  SizeSpecificPartitionAllocator, SystemPages,
};

const CHILD_ENV: &str = "PARTITION_ALLOC_FATAL_CHILD";

/// Runs `body` in a child copy of this test binary and asserts that it
/// aborted with a diagnostic containing `expected`.
fn expect_fatal(test_name: &str, expected: &str, body: impl FnOnce()) {
  if env::var_os(CHILD_ENV).is_some() {
    body();
    panic!("survived, expected a fatal error mentioning {expected:?}");
  }

  let output = Command::new(env::current_exe().unwrap())
    .args([test_name, "--exact", "--nocapture", "--test-threads=1"])
    .env(CHILD_ENV, "1")
    .output()
    .unwrap();
  let stderr = String::from_utf8_lossy(&output.stderr);
  assert!(!output.status.success(), "child exited cleanly:\n{stderr}");
  #[cfg(unix)]
  {
    use std::os::unix::process::ExitStatusExt;
    assert_eq!(output.status.signal(), Some(libc::SIGABRT), "child did not abort:\n{stderr}");
  }
  assert!(stderr.contains("partition_alloc: fatal:"), "no fatal diagnostic:\n{stderr}");
  assert!(stderr.contains(expected), "expected {expected:?} in:\n{stderr}");
}

/// A page source that never has memory.
struct NoPages;

impl PageSource for NoPages {
  fn map_super_page(&mut self, _hint: usize) -> Result<NonNull<u8>, PartitionError> {
    Err(PartitionError::MapFailed)
  }

  unsafe fn unmap_super_page(&mut self, _base: NonNull<u8>) {}
}

/// Hands out the same real super page on every call, so a partition can run
/// through its whole address space budget on 2MB of memory.
#[derive(Default)]
struct RecycledSuperPage {
  base: Option<NonNull<u8>>,
}

impl PageSource for RecycledSuperPage {
  fn map_super_page(&mut self, _hint: usize) -> Result<NonNull<u8>, PartitionError> {
    if self.base.is_none() {
      self.base = Some(SystemPages.map_super_page(0)?);
    }
    self.base.ok_or(PartitionError::MapFailed)
  }

  unsafe fn unmap_super_page(&mut self, _base: NonNull<u8>) {}
}

#[test]
fn fixed_double_free_aborts() {
  expect_fatal("fixed_double_free_aborts", "double free", || {
    let mut allocator = SizeSpecificPartitionAllocator::<64>::new();
    allocator.init();
    let root = allocator.root();
    let p = root.alloc(16);
    unsafe {
      root.free(p);
      root.free(p);
    }
  });
}

#[test]
fn generic_double_free_aborts() {
  expect_fatal("generic_double_free_aborts", "double free", || {
    let root = PartitionRootGeneric::new();
    root.init();
    let _keep = root.alloc_generic(100);
    let p = root.alloc_generic(100);
    unsafe {
      root.free_generic(p.as_ptr());
      root.free_generic(p.as_ptr());
    }
  });
}

#[test]
fn overwritten_trailing_cookie_aborts() {
  if !INTEGRITY_CHECKS {
    return;
  }
  expect_fatal("overwritten_trailing_cookie_aborts", "cookie mismatch", || {
    let mut root = PartitionRoot::new();
    root.init(0, 64);
    let p = root.alloc(16);
    unsafe {
      // One byte past the end of the allocation.
      p.as_ptr().add(16).write(0);
      root.free(p);
    }
  });
}

#[test]
fn corrupted_freelist_link_aborts() {
  expect_fatal("corrupted_freelist_link_aborts", "corrupted freelist link", || {
    let root = PartitionRootGeneric::new();
    root.init();
    let p = root.alloc_generic(64);
    let _keep = root.alloc_generic(64);
    unsafe {
      root.free_generic(p.as_ptr());
      // The freed slot's first word is its freelist link.
      let link = p.as_ptr().sub(COOKIE_OVERHEAD / 2).cast::<usize>();
      link.write_unaligned(usize::from_ne_bytes([0x41; size_of::<usize>()]));
    }
    root.alloc_generic(64);
  });
}

#[test]
fn fixed_allocation_above_the_cap_aborts() {
  expect_fatal(
    "fixed_allocation_above_the_cap_aborts",
    "exceeds the partition maximum",
    || {
      let mut allocator = SizeSpecificPartitionAllocator::<64>::new();
      allocator.init();
      allocator.root().alloc(SizeSpecificPartitionAllocator::<64>::MAX_ALLOCATION + 1);
    },
  );
}

#[test]
fn generic_allocation_above_i32_max_aborts() {
  expect_fatal(
    "generic_allocation_above_i32_max_aborts",
    "exceeds the partition maximum",
    || {
      let root = PartitionRootGeneric::new();
      root.init();
      root.alloc_generic(i32::MAX as usize + 1);
    },
  );
}

#[test]
fn exhausted_page_source_aborts() {
  expect_fatal("exhausted_page_source_aborts", "could not map a super page", || {
    let mut root = PartitionRoot::with_page_source(NoPages);
    root.init(0, 64);
    root.alloc(8);
  });
}

#[test]
fn never_allocated_address_aborts() {
  expect_fatal("never_allocated_address_aborts", "is not a live allocation", || {
    let root = PartitionRootGeneric::new();
    root.init();
    let p = root.alloc_generic(64);
    let super_page = p.as_ptr() as usize & !(SUPER_PAGE_SIZE - 1);
    let stray = p.as_ptr().with_addr(super_page + 100 * PARTITION_PAGE_SIZE + 64);
    assert!(root.owns(stray));
    unsafe { root.free_generic(stray) };
  });
}

#[test]
fn interior_pointer_aborts() {
  if !INTEGRITY_CHECKS {
    return;
  }
  expect_fatal("interior_pointer_aborts", "is not a live allocation", || {
    let root = PartitionRootGeneric::new();
    root.init();
    let p = root.alloc_generic(64);
    unsafe { root.free_generic(p.as_ptr().add(8)) };
  });
}

#[test]
fn freeing_into_a_released_span_aborts() {
  expect_fatal("freeing_into_a_released_span_aborts", "is not a live allocation", || {
    let mut root = PartitionRoot::new();
    root.init(0, 8192);
    // 8000 byte requests fit two to a span, so the third opens a second span.
    let a = root.alloc(8000);
    let b = root.alloc(8000);
    let _c = root.alloc(8000);
    unsafe {
      root.free(a);
      root.free(b);
      // The first span is empty now and parked on the free list.
      root.free(a);
    }
  });
}

#[test]
fn double_free_behind_the_freelist_head_aborts() {
  if !INTEGRITY_CHECKS {
    return;
  }
  expect_fatal("double_free_behind_the_freelist_head_aborts", "double free", || {
    let mut root = PartitionRoot::new();
    root.init(0, 64);
    let a = root.alloc(16);
    let b = root.alloc(16);
    let _c = root.alloc(16);
    unsafe {
      root.free(a);
      root.free(b);
      // `a` is now second on the freelist.
      root.free(a);
    }
  });
}

#[test]
fn fixed_cap_beyond_a_slot_span_aborts() {
  expect_fatal("fixed_cap_beyond_a_slot_span_aborts", "exceeds the partition maximum", || {
    let mut root = PartitionRoot::new();
    root.init(16, usize::MAX);
  });
}

#[test]
fn fixed_cap_one_past_the_largest_slot_aborts() {
  expect_fatal(
    "fixed_cap_one_past_the_largest_slot_aborts",
    "exceeds the partition maximum",
    || {
      let mut root = PartitionRoot::new();
      root.init(0, MAX_FIXED_ALLOCATION + 1);
    },
  );
}

#[test]
fn exceeding_the_partition_size_aborts() {
  expect_fatal("exceeding_the_partition_size_aborts", "partition exhausted", || {
    let mut root = PartitionRoot::with_page_source(RecycledSuperPage::default());
    root.init(0, MAX_FIXED_ALLOCATION);
    // Every allocation takes a whole span, so super pages run out quickly.
    loop {
      root.alloc(MAX_FIXED_ALLOCATION);
    }
  });
}

use crate::*;

fn page_of(ptr: NonNull<u8>) -> PagePtr {
  unsafe { pointer_to_page(ptr) }.expect("pointer in a guard partition page")
}

fn state_of(page: PagePtr) -> PageState {
  unsafe { (*page.as_ptr()).state }
}

fn allocated_in(page: PagePtr) -> u16 {
  unsafe { (*page.as_ptr()).num_allocated_slots }
}

fn unprovisioned_in(page: PagePtr) -> u16 {
  unsafe { (*page.as_ptr()).num_unprovisioned_slots }
}

/// Request size that lands exactly in a fixed bucket of `slot_size`.
fn fixed_request_for_slot(slot_size: usize) -> usize {
  slot_size - COOKIE_OVERHEAD
}

#[test]
fn freelist_mask_round_trips() {
  for addr in [0, 8, 0x1000, 0x7f12_3456_7890, usize::MAX & !7] {
    let ptr = ptr::without_provenance_mut::<FreelistEntry>(addr);
    assert_eq!(freelist_unmask(freelist_mask(ptr)), ptr, "{addr:#x}");
  }
  assert!(freelist_unmask(freelist_mask(null_mut())).is_null());
}

#[test]
fn masked_links_do_not_point_into_the_partition() {
  let root = PartitionRootGeneric::new();
  root.init();
  let ptrs: Vec<_> = (0..64).map(|_| root.alloc_generic(24)).collect();
  for ptr in &ptrs {
    let masked = freelist_mask(ptr.as_ptr().cast());
    assert_ne!(masked.addr(), ptr.as_ptr().addr());
    assert!(!root.owns(masked.cast_const().cast()), "{:?} masks to {masked:?}", ptr);
  }
  for ptr in ptrs {
    unsafe { root.free_generic(ptr.as_ptr()) };
  }
  assert!(root.shutdown());
}

#[test]
fn generic_buckets_cover_every_size() {
  let mut previous = 0;
  for size in 1..=GENERIC_MAX_BUCKETED {
    let index = generic_size_to_bucket(size);
    assert_ne!(index, GENERIC_PAGED_BUCKET, "size {size} was paged");
    let slot = GENERIC_SLOT_SIZES[index];
    let smallest = GENERIC_SLOT_SIZES
      .iter()
      .copied()
      .filter(|&s| s % GENERIC_SMALLEST_BUCKET == 0 && s >= size)
      .min()
      .unwrap();
    assert_eq!(slot, smallest, "size {size}");
    assert!(slot >= previous, "size {size} picked a smaller bucket than size {}", size - 1);
    if size >= 64 {
      assert!((slot - size) * 8 < size, "size {size} wastes {} bytes", slot - size);
    }
    previous = slot;
  }
}

#[test]
fn oversized_generic_requests_are_paged() {
  for size in [GENERIC_MAX_BUCKETED + 1, 65536, 1 << 40, usize::MAX] {
    assert_eq!(generic_size_to_bucket(size), GENERIC_PAGED_BUCKET, "{size}");
  }
  assert_eq!(GENERIC_SLOT_SIZES[GENERIC_NUM_BUCKETS - 1], GENERIC_MAX_BUCKETED);
}

#[test]
fn generic_4000_lands_in_the_4096_bucket() {
  let index = generic_size_to_bucket(cookie_size_adjust_add(4000));
  assert_eq!(GENERIC_SLOT_SIZES[index], 4096);

  let root = PartitionRootGeneric::new();
  root.init();
  let ptr = root.alloc_generic(4000);
  let page = page_of(ptr);
  let bucket = unsafe { (*page.as_ptr()).bucket } as usize;
  assert_eq!(GENERIC_SLOT_SIZES[bucket], 4096);
  unsafe { root.free_generic(ptr.as_ptr()) };
  assert!(root.shutdown());
}

#[test]
fn fixed_buckets_are_exact() {
  let mut root = PartitionRoot::new();
  root.init(0, 256);
  for size in 1..=256 {
    let rounded = cookie_size_adjust_add(align_up(size, ALLOCATION_GRANULARITY));
    assert_eq!(root.buckets[rounded >> BUCKET_SHIFT].slot_size(), rounded);
  }
  assert!(root.shutdown());
}

#[test]
fn span_sizes_minimise_waste() {
  assert_eq!(bucket_num_system_pages(8), 4);
  assert_eq!(bucket_num_system_pages(24), 12);
  assert_eq!(bucket_num_system_pages(4096), 4);
  assert_eq!(bucket_num_system_pages(30720), 15);
  assert_eq!(bucket_num_system_pages(0), 0);
  assert_eq!(bucket_num_system_pages(MAX_SLOT_SIZE + 1), 0);

  for bucket in GENERIC_BUCKETS.iter().filter(|b| b.slot_size() % GENERIC_SMALLEST_BUCKET == 0) {
    assert!(bucket.num_slots() >= 1, "slot {}", bucket.slot_size());
    assert!(bucket.num_partition_pages() <= MAX_PARTITION_PAGES_PER_SLOT_SPAN);
  }
}

#[test]
#[cfg(target_pointer_width = "64")]
fn registry_grows_contiguous_extents() {
  let mut registry = Box::new(SuperPageRegistry::new());
  let base = 0x40_0000_0000;
  registry.register_super_page(base);
  registry.register_super_page(base + SUPER_PAGE_SIZE);
  registry.register_super_page(base + 8 * SUPER_PAGE_SIZE);
  assert_eq!(registry.num_extents, 2);

  assert!(registry.contains(base));
  assert!(registry.contains(base + 2 * SUPER_PAGE_SIZE - 1));
  assert!(!registry.contains(base + 2 * SUPER_PAGE_SIZE));
  assert!(registry.contains(base + 8 * SUPER_PAGE_SIZE + 5));
  assert!(!registry.contains(base - 1));
  assert_eq!(
    registry.super_pages().collect::<Vec<_>>(),
    vec![base, base + SUPER_PAGE_SIZE, base + 8 * SUPER_PAGE_SIZE]
  );

  registry.clear();
  assert!(!registry.contains(base));
  assert_eq!(registry.super_pages().count(), 0);
}

#[test]
fn super_page_bitmap_tracks_membership() {
  let mut bitmap = SuperPageBitmap::new();
  let base = 0x4000_0000;
  bitmap.set(base);
  assert!(bitmap.contains(base));
  assert!(bitmap.contains(base + SUPER_PAGE_SIZE - 1));
  assert!(!bitmap.contains(base + SUPER_PAGE_SIZE));
  assert!(!bitmap.contains(base - 1));
  bitmap.clear(base);
  assert!(!bitmap.contains(base));
}

#[test]
fn fixed_partition_reuses_a_freed_slot() {
  let mut root = PartitionRoot::new();
  root.init(16, 128);
  let first = root.alloc(10);
  assert_eq!(first.as_ptr() as usize % ALLOCATION_GRANULARITY, 0);
  unsafe { root.free(first) };
  let second = root.alloc(10);
  assert_eq!(first, second);
  unsafe { root.free(second) };
  assert!(root.shutdown());
}

#[test]
fn pages_move_between_active_full_and_free() {
  let mut root = PartitionRoot::new();
  root.init(0, 8192);
  // 4096 byte slots: one partition page per span, four slots each.
  let size = fixed_request_for_slot(4096);
  let index = 4096 >> BUCKET_SHIFT;
  assert_eq!(root.buckets[index].num_slots(), 4);

  let a: Vec<_> = (0..4).map(|_| root.alloc(size)).collect();
  let first = page_of(a[0]);
  assert!(a.iter().all(|&p| page_of(p) == first));
  assert_eq!(state_of(first), PageState::Active { freelist_head: None });
  assert_eq!(allocated_in(first), 4);
  assert_eq!(unprovisioned_in(first), 0);

  // An exhausted head is marked full and a new span takes over.
  let b = root.alloc(size);
  let second = page_of(b);
  assert_ne!(first, second);
  assert_eq!(state_of(first), PageState::Full);
  assert_eq!(root.buckets[index].num_full_pages, 1);
  assert_eq!(root.buckets[index].active_pages_head, Some(second));

  // Freeing from a full page makes it the head again.
  unsafe { root.free(a[1]) };
  let bucket = &root.buckets[index];
  assert_eq!(bucket.num_full_pages, 0);
  assert_eq!(bucket.active_pages_head, Some(first));
  assert_eq!(unsafe { (*first.as_ptr()).active_next }, Some(second));
  assert_eq!(allocated_in(first), 3);
  let c = root.alloc(size);
  assert_eq!(c, a[1]);

  // An emptied page behind the head goes to the free list.
  unsafe { root.free(b) };
  assert_eq!(state_of(second), PageState::Free { next_free: None });
  assert_eq!(root.buckets[index].free_pages_head, Some(second));
  assert_eq!(unsafe { (*first.as_ptr()).active_next }, None);

  // The last active page stays active when it empties.
  for p in [a[0], c, a[2], a[3]] {
    unsafe { root.free(p) };
  }
  assert!(matches!(
    state_of(first),
    PageState::Active {
      freelist_head: Some(_)
    }
  ));
  assert_eq!(allocated_in(first), 0);
  assert_eq!(root.buckets[index].active_pages_head, Some(first));

  let d = root.alloc(size);
  assert_eq!(page_of(d), first);
  unsafe { root.free(d) };

  // A fresh span is only needed once the kept page is full again; then the
  // free list is drained before any new span is carved.
  let e: Vec<_> = (0..5).map(|_| root.alloc(size)).collect();
  assert_eq!(page_of(e[4]), second);
  assert_eq!(root.buckets[index].free_pages_head, None);
  for p in e {
    unsafe { root.free(p) };
  }
  assert!(root.shutdown());
}

#[test]
fn multi_page_spans_resolve_through_page_offset() {
  let mut root = PartitionRoot::new();
  root.init(0, 64);
  // 24 byte slots pack 12 system pages, three partition pages, exactly.
  let size = fixed_request_for_slot(24);
  let index = 24 >> BUCKET_SHIFT;
  let bucket = root.buckets[index];
  assert_eq!(bucket.num_partition_pages(), 3);
  assert_eq!(bucket.num_slots(), 2048);

  let ptrs: Vec<_> = (0..2048).map(|_| root.alloc(size)).collect();
  let page = page_of(ptrs[0]);
  let span = page_to_pointer(page).as_ptr() as usize;
  assert!(ptrs.windows(2).all(|w| w[0] < w[1]));
  assert!(ptrs.iter().all(|&p| page_of(p) == page));
  assert!(ptrs[2047].as_ptr() as usize >= span + 2 * PARTITION_PAGE_SIZE);
  assert_eq!(page_descriptor(page_to_pointer(page)).0, page);
  for i in 1..3 {
    let follower = unsafe { &*page.as_ptr().byte_add(i << PAGE_METADATA_SHIFT) };
    assert_eq!(follower.page_offset, i as u16);
  }

  for p in ptrs {
    unsafe { root.free(p) };
  }
  assert!(root.shutdown());
}

#[test]
fn freelists_are_provisioned_one_system_page_at_a_time() {
  let mut root = PartitionRoot::new();
  root.init(0, 64);
  let size = fixed_request_for_slot(24);

  let first = root.alloc(size);
  let page = page_of(first);
  // The returned slot plus every slot whose link fits in the first system page.
  let entries = 1 + (SYSTEM_PAGE_SIZE - (24 + size_of::<usize>())) / 24;
  let provisioned = entries + 1;
  assert_eq!(unprovisioned_in(page) as usize, 2048 - provisioned);

  let mut ptrs = vec![first];
  ptrs.extend((1..provisioned).map(|_| root.alloc(size)));
  assert_eq!(state_of(page), PageState::Active { freelist_head: None });
  assert_eq!(unprovisioned_in(page) as usize, 2048 - provisioned);

  // The next allocation provisions the following system page.
  ptrs.push(root.alloc(size));
  assert!((unprovisioned_in(page) as usize) < 2048 - provisioned);
  assert_eq!(allocated_in(page) as usize, provisioned + 1);

  for p in ptrs {
    unsafe { root.free(p) };
  }
  assert!(root.shutdown());
}

#[test]
fn shutdown_reports_leaks_and_allows_reinit() {
  let mut root = PartitionRoot::new();
  root.init(0, 128);
  let _leaked = root.alloc(64);
  assert!(root.total_size_of_super_pages() >= SUPER_PAGE_SIZE);
  assert!(!root.shutdown());
  assert!(root.shutdown());
  assert_eq!(root.total_size_of_super_pages(), 0);
  assert!(!root.is_initialized());

  root.init(0, 128);
  let p = root.alloc(64);
  assert!(root.owns(p.as_ptr()));
  unsafe { root.free(p) };
  assert!(root.shutdown());
}

#[test]
fn cookies_bracket_each_slot() {
  if !INTEGRITY_CHECKS {
    return;
  }
  let mut root = PartitionRoot::new();
  root.init(0, 64);
  let p = root.alloc(16);
  unsafe {
    let slot = p.as_ptr().sub(COOKIE_SIZE);
    assert_eq!(slot.cast::<usize>().read_unaligned(), COOKIE_VALUE);
    assert_eq!(slot.add(16 + COOKIE_SIZE).cast::<usize>().read_unaligned(), COOKIE_VALUE);
    assert!(std::slice::from_raw_parts(p.as_ptr(), 16).iter().all(|&b| b == UNINITIALIZED_BYTE));
    root.free(p);
    // Past the freelist link the slot carries the freed pattern.
    assert!(
      std::slice::from_raw_parts(slot.add(size_of::<usize>()), 16)
        .iter()
        .all(|&b| b == FREED_BYTE)
    );
  }
  assert!(root.shutdown());
}

/// Forwards to the OS and remembers every guard and decommit, as offsets
/// into the super page.
#[derive(Default)]
struct RecordingPages {
  calls: Vec<(&'static str, usize, usize)>,
}

impl PageSource for RecordingPages {
  fn map_super_page(&mut self, hint: usize) -> Result<NonNull<u8>, PartitionError> {
    SystemPages.map_super_page(hint)
  }

  unsafe fn unmap_super_page(&mut self, base: NonNull<u8>) {
    unsafe { SystemPages.unmap_super_page(base) };
  }

  unsafe fn set_inaccessible(&mut self, ptr: NonNull<u8>, len: usize) {
    self.calls.push(("guard", ptr.as_ptr() as usize & SUPER_PAGE_OFFSET_MASK, len));
    unsafe { SystemPages.set_inaccessible(ptr, len) };
  }

  unsafe fn decommit(&mut self, ptr: NonNull<u8>, len: usize) {
    self.calls.push(("decommit", ptr.as_ptr() as usize & SUPER_PAGE_OFFSET_MASK, len));
    unsafe { SystemPages.decommit(ptr, len) };
  }
}

#[test]
fn super_pages_get_guards_and_parked_spans_are_decommitted() {
  let mut root = PartitionRoot::with_page_source(RecordingPages::default());
  root.init(0, 8192);
  let size = fixed_request_for_slot(4096);

  // Three single partition page spans: two full, one with a single slot.
  let ptrs: Vec<_> = (0..9).map(|_| root.alloc(size)).collect();
  assert_eq!(
    root.base.pages.calls,
    vec![
      ("guard", 0, SYSTEM_PAGE_SIZE),
      ("guard", 2 * SYSTEM_PAGE_SIZE, PARTITION_PAGE_SIZE - 2 * SYSTEM_PAGE_SIZE),
      ("guard", SUPER_PAGE_SIZE - PARTITION_PAGE_SIZE, PARTITION_PAGE_SIZE),
    ]
  );

  // Emptying the two full spans parks them; the last one stays active.
  for p in ptrs {
    unsafe { root.free(p) };
  }
  assert_eq!(
    root.base.pages.calls[3..],
    [
      ("decommit", PARTITION_PAGE_SIZE, PARTITION_PAGE_SIZE),
      ("decommit", 2 * PARTITION_PAGE_SIZE, PARTITION_PAGE_SIZE),
    ]
  );
  assert!(root.shutdown());
}

#[test]
fn largest_fixed_cap_fills_a_whole_span() {
  let mut root = PartitionRoot::new();
  root.init(0, MAX_FIXED_ALLOCATION);
  let p = root.alloc(MAX_FIXED_ALLOCATION);
  let page = page_of(p);
  let bucket = root.buckets[unsafe { (*page.as_ptr()).bucket } as usize];
  assert_eq!(bucket.slot_size(), MAX_SLOT_SIZE);
  assert_eq!(bucket.num_slots(), 1);
  assert_eq!(bucket.num_partition_pages(), MAX_PARTITION_PAGES_PER_SLOT_SPAN);
  unsafe { root.free(p) };
  assert!(root.shutdown());
}

#![allow(clippy::missing_safety_doc)]

use core::{
  alloc::{GlobalAlloc, Layout},
  cell::UnsafeCell,
  fmt, hint,
  mem::size_of,
  ptr::{self, NonNull, null_mut},
  sync::atomic::{AtomicBool, Ordering},
};

use std::io::Write as _;

use log::{debug, warn};

// =============================================================================
// Constants
// =============================================================================

/// Every pointer handed out is aligned to this, and every size is rounded up to it.
pub const ALLOCATION_GRANULARITY: usize = size_of::<usize>();
/// Fixed partitions index their buckets by `size >> BUCKET_SHIFT`.
pub const BUCKET_SHIFT: usize = if ALLOCATION_GRANULARITY == 8 { 3 } else { 2 };

const SYSTEM_PAGE_SHIFT: usize = 12;
pub const SYSTEM_PAGE_SIZE: usize = 1 << SYSTEM_PAGE_SHIFT; // 4KB

const PARTITION_PAGE_SHIFT: usize = 14;
pub const PARTITION_PAGE_SIZE: usize = 1 << PARTITION_PAGE_SHIFT; // 16KB
const NUM_SYSTEM_PAGES_PER_PARTITION_PAGE: usize = PARTITION_PAGE_SIZE / SYSTEM_PAGE_SIZE;
/// A slot span never covers more partition pages than this.
const MAX_PARTITION_PAGES_PER_SLOT_SPAN: usize = 4;
const MAX_SYSTEM_PAGES_PER_SLOT_SPAN: usize =
  MAX_PARTITION_PAGES_PER_SLOT_SPAN * NUM_SYSTEM_PAGES_PER_PARTITION_PAGE;
/// Largest slot a bucket can carve from a single span.
pub const MAX_SLOT_SIZE: usize = MAX_SYSTEM_PAGES_PER_SLOT_SPAN * SYSTEM_PAGE_SIZE;

const SUPER_PAGE_SHIFT: usize = 21;
pub const SUPER_PAGE_SIZE: usize = 1 << SUPER_PAGE_SHIFT; // 2MB
const SUPER_PAGE_OFFSET_MASK: usize = SUPER_PAGE_SIZE - 1;
const SUPER_PAGE_BASE_MASK: usize = !SUPER_PAGE_OFFSET_MASK;
const NUM_PARTITION_PAGES_PER_SUPER_PAGE: usize = SUPER_PAGE_SIZE / PARTITION_PAGE_SIZE;

const PAGE_METADATA_SHIFT: usize = 5;
const PAGE_METADATA_SIZE: usize = 1 << PAGE_METADATA_SHIFT; // 32 bytes

/// Address space a single partition may reserve in super pages.
pub const MAX_PARTITION_SIZE: usize = 2046 * 1024 * 1024;
const MAX_SUPER_PAGES: usize = MAX_PARTITION_SIZE / SUPER_PAGE_SIZE;

const BITS_PER_SIZE_T: usize = usize::BITS as usize;

// Generic buckets: 8 per power-of-two order, from order 4 (8..15) to order 15 (16384..30720).
const GENERIC_MIN_BUCKETED_ORDER: usize = 4;
const GENERIC_MAX_BUCKETED_ORDER: usize = 15;
const GENERIC_NUM_BUCKETED_ORDERS: usize =
  GENERIC_MAX_BUCKETED_ORDER - GENERIC_MIN_BUCKETED_ORDER + 1;
const GENERIC_NUM_BUCKETS_PER_ORDER_BITS: usize = 3;
const GENERIC_NUM_BUCKETS_PER_ORDER: usize = 1 << GENERIC_NUM_BUCKETS_PER_ORDER_BITS;
const GENERIC_SMALLEST_BUCKET: usize = 1 << (GENERIC_MIN_BUCKETED_ORDER - 1);
/// Largest cookie-adjusted size served from a generic bucket. Anything larger is paged.
pub const GENERIC_MAX_BUCKETED: usize = (1 << (GENERIC_MAX_BUCKETED_ORDER - 1))
  + ((GENERIC_NUM_BUCKETS_PER_ORDER - 1) << (GENERIC_MAX_BUCKETED_ORDER - 1 - GENERIC_NUM_BUCKETS_PER_ORDER_BITS));
const GENERIC_NUM_BUCKETS: usize = GENERIC_NUM_BUCKETED_ORDERS * GENERIC_NUM_BUCKETS_PER_ORDER;
/// Pseudo bucket index for sizes above [`GENERIC_MAX_BUCKETED`].
const GENERIC_PAGED_BUCKET: usize = GENERIC_NUM_BUCKETS;
const GENERIC_NUM_BUCKET_LOOKUPS: usize = (BITS_PER_SIZE_T + 1) * GENERIC_NUM_BUCKETS_PER_ORDER + 1;
/// Generic requests above this are refused outright.
pub const MAX_GENERIC_ALLOCATION: usize = i32::MAX as usize;

/// Cookies and fill patterns are on in debug builds, or on demand with `debug-tripwire`.
pub const INTEGRITY_CHECKS: bool = cfg!(any(debug_assertions, feature = "debug-tripwire"));
const COOKIE_VALUE: usize = 0xDEAD_BEEF_DEAD_BEEF_u64 as usize;
const COOKIE_SIZE: usize = if INTEGRITY_CHECKS { size_of::<usize>() } else { 0 };
/// Bytes each slot spends on the leading and trailing cookie.
pub const COOKIE_OVERHEAD: usize = 2 * COOKIE_SIZE;
/// Largest cap a fixed partition accepts: its slot, cookies included, fills a whole span.
pub const MAX_FIXED_ALLOCATION: usize = MAX_SLOT_SIZE - COOKIE_OVERHEAD;
const UNINITIALIZED_BYTE: u8 = 0xAB;
const FREED_BYTE: u8 = 0xCD;

/// With `memory-tool`, every request is handed to the fallback allocator.
const MEMORY_TOOL_REPLACES_ALLOCATOR: bool = cfg!(feature = "memory-tool");

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(ALLOCATION_GRANULARITY.is_power_of_two());
const _: () = assert!(1 << BUCKET_SHIFT == ALLOCATION_GRANULARITY);
const _: () = assert!(PARTITION_PAGE_SIZE % SYSTEM_PAGE_SIZE == 0);
const _: () = assert!(SUPER_PAGE_SIZE % PARTITION_PAGE_SIZE == 0);
// Partition page 0 holds a guard system page, then the metadata system page.
const _: () = assert!(PARTITION_PAGE_SIZE >= 2 * SYSTEM_PAGE_SIZE);
const _: () = assert!(NUM_PARTITION_PAGES_PER_SUPER_PAGE * PAGE_METADATA_SIZE <= SYSTEM_PAGE_SIZE);
const _: () = assert!(size_of::<PartitionPage>() <= PAGE_METADATA_SIZE);
const _: () = assert!(MAX_PARTITION_SIZE % SUPER_PAGE_SIZE == 0);
const _: () = assert!(GENERIC_MAX_BUCKETED == 30720);
const _: () = assert!(GENERIC_MAX_BUCKETED <= MAX_SLOT_SIZE);
const _: () = assert!(GENERIC_SMALLEST_BUCKET % ALLOCATION_GRANULARITY == 0);
const _: () = assert!(MAX_SLOT_SIZE / ALLOCATION_GRANULARITY <= u16::MAX as usize);
const _: () = assert!(MAX_FIXED_ALLOCATION % ALLOCATION_GRANULARITY == 0);

// =============================================================================
// Errors
// =============================================================================

/// Every way a partition can fail. Only a [`PageSource`] ever returns one; inside
/// the engine each of them is terminal, printed to stderr before the process aborts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionError {
  /// The page source could not supply a super page.
  MapFailed,
  /// The partition already reserved [`MAX_PARTITION_SIZE`] bytes of super pages.
  PartitionExhausted,
  AllocationTooLarge { size: usize, max: usize },
  FallbackFailed { size: usize },
  DoubleFree { ptr: usize },
  /// A leading or trailing cookie was overwritten.
  CookieMismatch { ptr: usize },
  FreelistCorrupted { ptr: usize },
  /// Pointer inside a registered super page that does not name a live slot.
  UnownedPointer { ptr: usize },
}

impl fmt::Display for PartitionError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match *self {
      Self::MapFailed => write!(f, "could not map a super page"),
      Self::PartitionExhausted => {
        write!(f, "partition exhausted its {MAX_PARTITION_SIZE} bytes of super pages")
      }
      Self::AllocationTooLarge { size, max } => {
        write!(f, "allocation of {size} bytes exceeds the partition maximum of {max}")
      }
      Self::FallbackFailed { size } => {
        write!(f, "fallback allocator could not provide {size} bytes")
      }
      Self::DoubleFree { ptr } => write!(f, "double free of {ptr:#x}"),
      Self::CookieMismatch { ptr } => write!(f, "cookie mismatch around {ptr:#x}"),
      Self::FreelistCorrupted { ptr } => write!(f, "corrupted freelist link {ptr:#x}"),
      Self::UnownedPointer { ptr } => {
        write!(f, "{ptr:#x} is not a live allocation of this partition")
      }
    }
  }
}

impl std::error::Error for PartitionError {}

// =============================================================================
// Types
// =============================================================================

/// Overlays the first word of a free slot. `next` is always stored masked.
#[repr(C)]
struct FreelistEntry {
  next: *mut FreelistEntry,
}

type PagePtr = NonNull<PartitionPage>;

/// Lifecycle of a slot span descriptor. Metadata pages come zeroed from the
/// page source, so a descriptor no span ever claimed reads as `Unused`.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PageState {
  Unused = 0,
  /// Linked from the bucket's active list. An empty freelist is fine as long
  /// as there are unprovisioned slots left.
  Active { freelist_head: Option<NonNull<FreelistEntry>> } = 1,
  /// Every slot handed out. On no list until one of them comes back.
  Full = 2,
  /// No live slots; linked from the bucket's free list.
  Free { next_free: Option<PagePtr> } = 3,
}

/// Slot span descriptor, living in the metadata page of its super page.
/// Only the first partition page of a span carries a meaningful descriptor;
/// the others just record how far back it is in `page_offset`.
#[repr(C)]
struct PartitionPage {
  state: PageState,
  active_next: Option<PagePtr>,
  bucket: u16,
  num_allocated_slots: u16,
  num_unprovisioned_slots: u16,
  page_offset: u16,
}

/// One size class: every slot in every span of the bucket is `slot_size` bytes.
#[derive(Clone, Copy, Debug)]
struct Bucket {
  active_pages_head: Option<PagePtr>,
  free_pages_head: Option<PagePtr>,
  slot_size: u32,
  num_system_pages_per_slot_span: u16,
  num_full_pages: u32,
}

impl Bucket {
  const fn new(slot_size: usize) -> Self {
    Self {
      active_pages_head: None,
      free_pages_head: None,
      slot_size: slot_size as u32,
      num_system_pages_per_slot_span: bucket_num_system_pages(slot_size) as u16,
      num_full_pages: 0,
    }
  }

  #[inline]
  fn slot_size(&self) -> usize {
    self.slot_size as usize
  }

  /// System pages per slot span.
  #[inline]
  fn num_system_pages(&self) -> usize {
    self.num_system_pages_per_slot_span as usize
  }

  #[inline]
  fn span_size(&self) -> usize {
    self.num_system_pages() << SYSTEM_PAGE_SHIFT
  }

  #[inline]
  fn num_slots(&self) -> u16 {
    (self.span_size() / self.slot_size()) as u16
  }

  #[inline]
  fn num_partition_pages(&self) -> usize {
    self.num_system_pages().div_ceil(NUM_SYSTEM_PAGES_PER_PARTITION_PAGE)
  }

  fn reset(&mut self) {
    self.active_pages_head = None;
    self.free_pages_head = None;
    self.num_full_pages = 0;
  }
}

/// Picks the span length, in system pages, that wastes the fewest bytes per
/// byte for `slot_size`. Spans shorter than a whole number of partition pages
/// leave system pages unfaulted, which costs a page table entry; that is
/// charged as one pointer per page.
const fn bucket_num_system_pages(slot_size: usize) -> usize {
  if slot_size == 0 || slot_size > MAX_SLOT_SIZE {
    return 0;
  }

  // Ratios are compared as cross products, starting from a ratio of 1.
  let mut best_waste = 1u64;
  let mut best_span = 1u64;
  let mut best_pages = 0;
  let mut i = NUM_SYSTEM_PAGES_PER_PARTITION_PAGE - 1;
  while i <= MAX_SYSTEM_PAGES_PER_SLOT_SPAN {
    let span = SYSTEM_PAGE_SIZE * i;
    let num_slots = span / slot_size;
    let mut waste = span - num_slots * slot_size;
    let remainder_pages = i & (NUM_SYSTEM_PAGES_PER_PARTITION_PAGE - 1);
    if remainder_pages != 0 {
      waste += size_of::<usize>() * (NUM_SYSTEM_PAGES_PER_PARTITION_PAGE - remainder_pages);
    }
    if (waste as u64) * best_span < best_waste * (span as u64) {
      best_waste = waste as u64;
      best_span = span as u64;
      best_pages = i;
    }
    i += 1;
  }
  best_pages
}

// =============================================================================
// Platform
// =============================================================================

/// Supplies super pages: [`SUPER_PAGE_SIZE`] bytes, aligned to [`SUPER_PAGE_SIZE`],
/// zero filled.
pub trait PageSource {
  /// Maps a fresh super page, preferably at `hint` so the partition's extent
  /// stays contiguous. A hint of 0 means no preference.
  fn map_super_page(&mut self, hint: usize) -> Result<NonNull<u8>, PartitionError>;

  /// # Safety
  /// `base` came from `map_super_page` of this source and nothing in it is used again.
  unsafe fn unmap_super_page(&mut self, base: NonNull<u8>);

  /// Makes a guard region fault on any access.
  ///
  /// # Safety
  /// The range lies inside a super page mapped by this source.
  unsafe fn set_inaccessible(&mut self, _ptr: NonNull<u8>, _len: usize) {}

  /// Gives the physical backing of a range back to the OS. The range must read
  /// as zeroes when touched again.
  ///
  /// # Safety
  /// The range lies inside a super page mapped by this source and holds no live data.
  unsafe fn decommit(&mut self, _ptr: NonNull<u8>, _len: usize) {}
}

/// Anonymous private mappings from the OS.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPages;

impl PageSource for SystemPages {
  fn map_super_page(&mut self, hint: usize) -> Result<NonNull<u8>, PartitionError> {
    if hint != 0 {
      let ptr = unsafe { os_mmap(hint, SUPER_PAGE_SIZE) };
      if !ptr.is_null() {
        if ptr as usize & SUPER_PAGE_OFFSET_MASK == 0 {
          return NonNull::new(ptr).ok_or(PartitionError::MapFailed);
        }
        unsafe { os_munmap(ptr, SUPER_PAGE_SIZE) };
      }
    }

    // Over-reserve and trim both ends down to one aligned super page.
    let raw = unsafe { os_mmap(0, 2 * SUPER_PAGE_SIZE) };
    if raw.is_null() {
      return Err(PartitionError::MapFailed);
    }
    let head = align_up(raw as usize, SUPER_PAGE_SIZE) - raw as usize;
    let tail = SUPER_PAGE_SIZE - head;
    unsafe {
      if head > 0 {
        os_munmap(raw, head);
      }
      if tail > 0 {
        os_munmap(raw.add(head + SUPER_PAGE_SIZE), tail);
      }
      NonNull::new(raw.add(head)).ok_or(PartitionError::MapFailed)
    }
  }

  unsafe fn unmap_super_page(&mut self, base: NonNull<u8>) {
    unsafe { os_munmap(base.as_ptr(), SUPER_PAGE_SIZE) };
  }

  unsafe fn set_inaccessible(&mut self, ptr: NonNull<u8>, len: usize) {
    // Guards only line up with the metadata layout on 4KB pages.
    if os_page_size() != SYSTEM_PAGE_SIZE {
      return;
    }
    unsafe { libc::mprotect(ptr.as_ptr().cast(), len, libc::PROT_NONE) };
  }

  unsafe fn decommit(&mut self, ptr: NonNull<u8>, len: usize) {
    if cfg!(feature = "release-mem") && os_page_size() == SYSTEM_PAGE_SIZE {
      unsafe { libc::madvise(ptr.as_ptr().cast(), len, libc::MADV_DONTNEED) };
    }
  }
}

unsafe fn os_mmap(hint: usize, size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      ptr::without_provenance_mut(hint),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

fn os_page_size() -> usize {
  let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
  if size > 0 { size as usize } else { SYSTEM_PAGE_SIZE }
}

/// General purpose allocator behind the generic partition: pointers it does
/// not recognise are handed back here, and so are paged sizes.
pub trait FallbackAllocator {
  /// Returns null on failure.
  fn malloc(&self, size: usize) -> *mut u8;

  /// Returns null on failure, or when the allocator has no aligned entry point.
  fn malloc_aligned(&self, _size: usize, _align: usize) -> *mut u8 {
    null_mut()
  }

  /// # Safety
  /// `ptr` came from this allocator and is not used again.
  unsafe fn free(&self, ptr: *mut u8);

  /// # Safety
  /// `ptr` came from this allocator.
  unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8;
}

/// The C library's allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemFallback;

impl FallbackAllocator for SystemFallback {
  fn malloc(&self, size: usize) -> *mut u8 {
    unsafe { libc::malloc(size).cast() }
  }

  fn malloc_aligned(&self, size: usize, align: usize) -> *mut u8 {
    let align = align.max(size_of::<usize>());
    let mut out = null_mut();
    if unsafe { libc::posix_memalign(&mut out, align, size) } != 0 {
      return null_mut();
    }
    out.cast()
  }

  unsafe fn free(&self, ptr: *mut u8) {
    unsafe { libc::free(ptr.cast()) };
  }

  unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
    unsafe { libc::realloc(ptr.cast(), size).cast() }
  }
}

// =============================================================================
// Lock
// =============================================================================

struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  fn lock(&self) -> SpinLockGuard<'_> {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
    SpinLockGuard { lock: self }
  }

  #[inline]
  fn unlock(&self) {
    self.locked.store(false, Ordering::Release);
  }
}

struct SpinLockGuard<'a> {
  lock: &'a SpinLock,
}

impl Drop for SpinLockGuard<'_> {
  #[inline]
  fn drop(&mut self) {
    self.lock.unlock();
  }
}

// =============================================================================
// Super Page Registry
// =============================================================================

/// A run of contiguous super pages, `[base, end)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct SuperPageExtent {
  base: usize,
  end: usize,
}

/// Address ranges a partition owns. Consulted on every free to decide whether
/// a pointer is ours. 64-bit targets walk the extents, which almost always
/// number one; 32-bit targets test a bit per possible super page instead.
struct SuperPageRegistry {
  extents: [SuperPageExtent; MAX_SUPER_PAGES],
  num_extents: usize,
  #[cfg(target_pointer_width = "32")]
  bitmap: SuperPageBitmap,
}

impl SuperPageRegistry {
  const fn new() -> Self {
    Self {
      extents: [SuperPageExtent { base: 0, end: 0 }; MAX_SUPER_PAGES],
      num_extents: 0,
      #[cfg(target_pointer_width = "32")]
      bitmap: SuperPageBitmap::new(),
    }
  }

  fn register_super_page(&mut self, base: usize) {
    debug_assert!(base & SUPER_PAGE_OFFSET_MASK == 0, "unaligned super page {base:#x}");
    #[cfg(target_pointer_width = "32")]
    self.bitmap.set(base);

    if let Some(last) = self.extents[..self.num_extents].last_mut()
      && last.end == base
    {
      last.end += SUPER_PAGE_SIZE;
      return;
    }
    // The partition size cap keeps this below MAX_SUPER_PAGES.
    debug_assert!(self.num_extents < MAX_SUPER_PAGES);
    self.extents[self.num_extents] = SuperPageExtent {
      base,
      end: base + SUPER_PAGE_SIZE,
    };
    self.num_extents += 1;
  }

  #[inline]
  #[cfg(target_pointer_width = "32")]
  fn contains(&self, addr: usize) -> bool {
    self.bitmap.contains(addr)
  }

  #[inline]
  #[cfg(not(target_pointer_width = "32"))]
  fn contains(&self, addr: usize) -> bool {
    self.extents[..self.num_extents]
      .iter()
      .any(|extent| extent.base <= addr && addr < extent.end)
  }

  /// Base address of every registered super page, in mapping order.
  fn super_pages(&self) -> impl Iterator<Item = usize> + '_ {
    self.extents[..self.num_extents]
      .iter()
      .flat_map(|extent| (extent.base..extent.end).step_by(SUPER_PAGE_SIZE))
  }

  fn clear(&mut self) {
    #[cfg(target_pointer_width = "32")]
    for extent in &self.extents[..self.num_extents] {
      for base in (extent.base..extent.end).step_by(SUPER_PAGE_SIZE) {
        self.bitmap.clear(base);
      }
    }
    self.num_extents = 0;
  }
}

/// One bit per super-page-aligned address of a 4GB address space.
#[cfg(any(target_pointer_width = "32", test))]
struct SuperPageBitmap {
  bits: [u8; SUPER_PAGE_BITMAP_BYTES],
}

#[cfg(any(target_pointer_width = "32", test))]
const SUPER_PAGE_BITMAP_BYTES: usize = (1usize << (32 - SUPER_PAGE_SHIFT)) / 8;

#[cfg(any(target_pointer_width = "32", test))]
impl SuperPageBitmap {
  const fn new() -> Self {
    Self {
      bits: [0; SUPER_PAGE_BITMAP_BYTES],
    }
  }

  #[inline]
  fn locate(addr: usize) -> (usize, u8) {
    let index = (addr as u64 & u32::MAX as u64) as usize >> SUPER_PAGE_SHIFT;
    (index >> 3, 1 << (index & 7))
  }

  fn set(&mut self, addr: usize) {
    let (byte, bit) = Self::locate(addr);
    self.bits[byte] |= bit;
  }

  fn clear(&mut self, addr: usize) {
    let (byte, bit) = Self::locate(addr);
    self.bits[byte] &= !bit;
  }

  #[inline]
  fn contains(&self, addr: usize) -> bool {
    let (byte, bit) = Self::locate(addr);
    self.bits[byte] & bit != 0
  }
}

// =============================================================================
// Generic Bucket Tables
// =============================================================================

/// Slot size of every generic bucket. Each order starts at its power of two
/// and is split into 8 equal steps; sizes that are not a multiple of 8 exist
/// in the table but are never selected.
const GENERIC_SLOT_SIZES: [usize; GENERIC_NUM_BUCKETS] = {
  let mut sizes = [0; GENERIC_NUM_BUCKETS];
  let mut current = GENERIC_SMALLEST_BUCKET;
  let mut increment = GENERIC_SMALLEST_BUCKET >> GENERIC_NUM_BUCKETS_PER_ORDER_BITS;
  let mut i = 0;
  while i < GENERIC_NUM_BUCKETED_ORDERS {
    let mut j = 0;
    while j < GENERIC_NUM_BUCKETS_PER_ORDER {
      sizes[i * GENERIC_NUM_BUCKETS_PER_ORDER + j] = current;
      current += increment;
      j += 1;
    }
    increment <<= 1;
    i += 1;
  }
  sizes
};

const GENERIC_BUCKETS: [Bucket; GENERIC_NUM_BUCKETS] = {
  let mut buckets = [Bucket::new(0); GENERIC_NUM_BUCKETS];
  let mut i = 0;
  while i < GENERIC_NUM_BUCKETS {
    buckets[i] = Bucket::new(GENERIC_SLOT_SIZES[i]);
    i += 1;
  }
  buckets
};

/// Shift that brings the 3 bits below an order's top bit down to the bottom.
const GENERIC_ORDER_INDEX_SHIFTS: [u8; BITS_PER_SIZE_T + 1] = {
  let mut shifts = [0; BITS_PER_SIZE_T + 1];
  let mut order = 0;
  while order <= BITS_PER_SIZE_T {
    if order >= GENERIC_NUM_BUCKETS_PER_ORDER_BITS + 1 {
      shifts[order] = (order - (GENERIC_NUM_BUCKETS_PER_ORDER_BITS + 1)) as u8;
    }
    order += 1;
  }
  shifts
};

/// Bits below the order index. Any of them set rounds up to the next bucket.
const GENERIC_ORDER_SUB_INDEX_MASKS: [usize; BITS_PER_SIZE_T + 1] = {
  let mut masks = [0; BITS_PER_SIZE_T + 1];
  let mut order = 0;
  while order <= BITS_PER_SIZE_T {
    masks[order] = if order == BITS_PER_SIZE_T {
      usize::MAX >> (GENERIC_NUM_BUCKETS_PER_ORDER_BITS + 1)
    } else {
      ((1usize << order) - 1) >> (GENERIC_NUM_BUCKETS_PER_ORDER_BITS + 1)
    };
    order += 1;
  }
  masks
};

/// `(order << 3) + order_index` to bucket index. The trailing entry catches a
/// round up out of the top order.
const GENERIC_BUCKET_LOOKUPS: [u16; GENERIC_NUM_BUCKET_LOOKUPS] = {
  let mut lookups = [GENERIC_PAGED_BUCKET as u16; GENERIC_NUM_BUCKET_LOOKUPS];
  let mut next_bucket = 0;
  let mut order = 0;
  while order <= BITS_PER_SIZE_T {
    let mut j = 0;
    while j < GENERIC_NUM_BUCKETS_PER_ORDER {
      let entry = (order << GENERIC_NUM_BUCKETS_PER_ORDER_BITS) + j;
      if order < GENERIC_MIN_BUCKETED_ORDER {
        // Tiny sizes, malloc(0) included, share the finest bucket.
        lookups[entry] = 0;
      } else if order <= GENERIC_MAX_BUCKETED_ORDER {
        let mut valid = next_bucket;
        while GENERIC_SLOT_SIZES[valid] % GENERIC_SMALLEST_BUCKET != 0 {
          valid += 1;
        }
        lookups[entry] = valid as u16;
        next_bucket += 1;
      }
      j += 1;
    }
    order += 1;
  }
  lookups
};

/// Maps a cookie-adjusted size to a generic bucket index, or
/// [`GENERIC_PAGED_BUCKET`] when no bucket is large enough.
#[inline]
fn generic_size_to_bucket(size: usize) -> usize {
  let order = BITS_PER_SIZE_T - size.leading_zeros() as usize;
  let order_index =
    (size >> GENERIC_ORDER_INDEX_SHIFTS[order]) & (GENERIC_NUM_BUCKETS_PER_ORDER - 1);
  let sub_order_index = size & GENERIC_ORDER_SUB_INDEX_MASKS[order];
  GENERIC_BUCKET_LOOKUPS[(order << GENERIC_NUM_BUCKETS_PER_ORDER_BITS)
    + order_index
    + (sub_order_index != 0) as usize] as usize
}

// =============================================================================
// Freelist Masking & Page Resolution
// =============================================================================

#[inline(always)]
fn mask_addr(addr: usize) -> usize {
  if cfg!(target_endian = "little") { addr.swap_bytes() } else { !addr }
}

/// Freelist links are stored scrambled so a stray read of a freed object, or a
/// partial overwrite of a link, never yields a usable pointer.
#[inline(always)]
fn freelist_mask(ptr: *mut FreelistEntry) -> *mut FreelistEntry {
  ptr.map_addr(mask_addr)
}

#[inline(always)]
fn freelist_unmask(ptr: *mut FreelistEntry) -> *mut FreelistEntry {
  // Both masks are involutions.
  ptr.map_addr(mask_addr)
}

#[inline]
fn super_page_to_metadata_area(super_page: usize) -> usize {
  super_page + SYSTEM_PAGE_SIZE
}

/// Descriptor slot of the partition page holding `ptr`, with that page's index
/// inside its super page. Does not follow `page_offset`.
#[inline]
fn page_descriptor(ptr: NonNull<u8>) -> (PagePtr, usize) {
  let addr = ptr.as_ptr() as usize;
  let super_page = addr & SUPER_PAGE_BASE_MASK;
  let index = (addr & SUPER_PAGE_OFFSET_MASK) >> PARTITION_PAGE_SHIFT;
  let descriptor = super_page_to_metadata_area(super_page) + (index << PAGE_METADATA_SHIFT);
  // Metadata lives inside the super page, past its first system page.
  let page = unsafe { NonNull::new_unchecked(ptr.as_ptr().with_addr(descriptor).cast()) };
  (page, index)
}

/// Canonical descriptor of the span holding `ptr`, found by following
/// `page_offset` back to the span's first partition page. Returns `None` for
/// the guard partition pages at either end of the super page.
///
/// # Safety
/// `ptr` lies inside a super page mapped by the partition.
#[inline]
unsafe fn pointer_to_page(ptr: NonNull<u8>) -> Option<PagePtr> {
  let (descriptor, index) = page_descriptor(ptr);
  if index == 0 || index == NUM_PARTITION_PAGES_PER_SUPER_PAGE - 1 {
    return None;
  }
  let page_offset = unsafe { (*descriptor.as_ptr()).page_offset } as usize;
  if page_offset >= index {
    return None;
  }
  Some(unsafe { descriptor.byte_sub(page_offset << PAGE_METADATA_SHIFT) })
}

/// First byte of the span a descriptor describes.
#[inline]
fn page_to_pointer(page: PagePtr) -> NonNull<u8> {
  let addr = page.as_ptr() as usize;
  let super_page = addr & SUPER_PAGE_BASE_MASK;
  let index = (addr - super_page_to_metadata_area(super_page)) >> PAGE_METADATA_SHIFT;
  debug_assert!(
    index > 0 && index < NUM_PARTITION_PAGES_PER_SUPER_PAGE - 1,
    "descriptor {addr:#x} names a guard partition page"
  );
  let span = super_page + (index << PARTITION_PAGE_SHIFT);
  // A super page base plus a non-zero index is never null.
  unsafe { NonNull::new_unchecked(page.as_ptr().cast::<u8>().with_addr(span)) }
}

// =============================================================================
// Engine
// =============================================================================

/// What both partition flavours share: the page source, the super page
/// cursors and the registry of owned address ranges.
struct PartitionRootBase<P: PageSource> {
  pages: P,
  initialized: bool,
  total_size_of_super_pages: usize,
  /// Where the next super page is requested, to keep the extent contiguous.
  next_super_page: usize,
  next_partition_page: *mut u8,
  next_partition_page_end: *mut u8,
  registry: SuperPageRegistry,
}

impl<P: PageSource> PartitionRootBase<P> {
  const fn new(pages: P) -> Self {
    Self {
      pages,
      initialized: false,
      total_size_of_super_pages: 0,
      next_super_page: 0,
      next_partition_page: null_mut(),
      next_partition_page_end: null_mut(),
      registry: SuperPageRegistry::new(),
    }
  }

  /// Takes a slot from `bucket`, which sits at `index` in the root's bucket
  /// array. The slot comes back raw, without cookies.
  #[inline(always)]
  fn bucket_alloc(&mut self, bucket: &mut Bucket, index: usize) -> NonNull<u8> {
    if let Some(page) = bucket.active_pages_head
      && let PageState::Active {
        freelist_head: Some(entry),
      } = unsafe { (*page.as_ptr()).state }
    {
      return unsafe { pop_freelist(bucket, page, entry) };
    }
    self.alloc_slow_path(bucket, index)
  }

  /// The active head had nothing on its freelist. Finds a page that can serve:
  /// an active page with free or unprovisioned slots, then a page from the free
  /// list, then a brand new span.
  #[cold]
  #[inline(never)]
  fn alloc_slow_path(&mut self, bucket: &mut Bucket, index: usize) -> NonNull<u8> {
    let head = bucket.active_pages_head;
    let page = match unsafe { set_new_active_page(bucket, head) } {
      Some(page) => page,
      None => {
        let page = match bucket.free_pages_head {
          Some(page) => unsafe { take_free_page(bucket, page) },
          None => page_descriptor(self.alloc_partition_pages(bucket.num_partition_pages())).0,
        };
        unsafe { page_reset(page, bucket, index) };
        bucket.active_pages_head = Some(page);
        page
      }
    };

    match unsafe { (*page.as_ptr()).state } {
      PageState::Active {
        freelist_head: Some(entry),
      } => unsafe { pop_freelist(bucket, page, entry) },
      _ => unsafe { alloc_and_fill_freelist(bucket, page) },
    }
  }

  /// Carves `num_partition_pages` contiguous partition pages, mapping a new
  /// super page when the current one has no room left.
  fn alloc_partition_pages(&mut self, num_partition_pages: usize) -> NonNull<u8> {
    let total = num_partition_pages << PARTITION_PAGE_SHIFT;
    let available = self.next_partition_page_end as usize - self.next_partition_page as usize;
    if available >= total
      && let Some(ret) = NonNull::new(self.next_partition_page)
    {
      self.next_partition_page = unsafe { self.next_partition_page.add(total) };
      return ret;
    }

    if self.total_size_of_super_pages + SUPER_PAGE_SIZE > MAX_PARTITION_SIZE {
      partition_fatal(PartitionError::PartitionExhausted);
    }
    let super_page = match self.pages.map_super_page(self.next_super_page) {
      Ok(super_page) => super_page,
      Err(err) => partition_fatal(err),
    };
    let base = super_page.as_ptr() as usize;
    debug_assert!(
      base & SUPER_PAGE_OFFSET_MASK == 0,
      "page source returned unaligned super page {base:#x}"
    );
    self.total_size_of_super_pages += SUPER_PAGE_SIZE;
    self.registry.register_super_page(base);
    self.next_super_page = base + SUPER_PAGE_SIZE;

    // Guards: system page 0, the rest of partition page 0 after the metadata
    // page, and the whole last partition page.
    unsafe {
      self.pages.set_inaccessible(super_page, SYSTEM_PAGE_SIZE);
      self.pages.set_inaccessible(
        super_page.add(2 * SYSTEM_PAGE_SIZE),
        PARTITION_PAGE_SIZE - 2 * SYSTEM_PAGE_SIZE,
      );
      self
        .pages
        .set_inaccessible(super_page.add(SUPER_PAGE_SIZE - PARTITION_PAGE_SIZE), PARTITION_PAGE_SIZE);

      let ret = super_page.add(PARTITION_PAGE_SIZE);
      self.next_partition_page = ret.as_ptr().add(total);
      self.next_partition_page_end = super_page.as_ptr().add(SUPER_PAGE_SIZE - PARTITION_PAGE_SIZE);
      ret
    }
  }

  /// Returns `slot` to `page`, which must be its live descriptor.
  /// `user` is the pointer the caller passed in, for diagnostics.
  ///
  /// # Safety
  /// `page` was resolved from `slot` by [`slot_to_live_page`] and belongs to `bucket`.
  #[inline(always)]
  unsafe fn free_with_page(&mut self, bucket: &mut Bucket, page: PagePtr, slot: NonNull<u8>, user: usize) {
    let entry = slot.cast::<FreelistEntry>();
    let p = unsafe { &mut *page.as_ptr() };
    let (head, was_full) = match p.state {
      PageState::Active { freelist_head } => (freelist_head, false),
      PageState::Full => (None, true),
      _ => partition_fatal(PartitionError::UnownedPointer { ptr: user }),
    };
    if let Some(head) = head {
      if head == entry {
        partition_fatal(PartitionError::DoubleFree { ptr: user });
      }
      if INTEGRITY_CHECKS && freelist_unmask(unsafe { (*head.as_ptr()).next }) == entry.as_ptr() {
        partition_fatal(PartitionError::DoubleFree { ptr: user });
      }
    }
    if p.num_allocated_slots == 0 {
      partition_fatal(PartitionError::UnownedPointer { ptr: user });
    }

    unsafe {
      integrity_on_free(slot, bucket.slot_size());
      (*entry.as_ptr()).next = freelist_mask(head.map_or(null_mut(), NonNull::as_ptr));
    }
    p.state = PageState::Active {
      freelist_head: Some(entry),
    };
    p.num_allocated_slots -= 1;
    if was_full || p.num_allocated_slots == 0 {
      unsafe { self.free_slow_path(bucket, page, was_full) };
    }
  }

  /// A free either brought a full page back into play or emptied a page.
  #[cold]
  #[inline(never)]
  unsafe fn free_slow_path(&mut self, bucket: &mut Bucket, page: PagePtr, was_full: bool) {
    let p = page.as_ptr();
    if was_full {
      // Make it the head so the next allocations reuse its already faulted memory.
      unsafe { (*p).active_next = bucket.active_pages_head };
      bucket.active_pages_head = Some(page);
      bucket.num_full_pages -= 1;
      if unsafe { (*p).num_allocated_slots } != 0 {
        return;
      }
    }

    if bucket.active_pages_head == Some(page) {
      let next = unsafe { (*p).active_next };
      // Keep the last usable page active rather than bouncing it through the
      // free list on every alloc/free pair.
      if next.is_none() || unsafe { set_new_active_page(bucket, next) }.is_none() {
        bucket.active_pages_head = Some(page);
        unsafe { (*p).active_next = None };
        return;
      }
    } else {
      unsafe { unlink_active_page(bucket, page) };
    }
    unsafe { self.put_page_on_free_list(bucket, page) };
  }

  unsafe fn put_page_on_free_list(&mut self, bucket: &mut Bucket, page: PagePtr) {
    unsafe {
      self.pages.decommit(page_to_pointer(page), bucket.span_size());
      let p = &mut *page.as_ptr();
      p.state = PageState::Free {
        next_free: bucket.free_pages_head,
      };
      p.active_next = None;
    }
    bucket.free_pages_head = Some(page);
  }

  /// Unmaps every super page and forgets them. Returns how many were released.
  fn release_super_pages(&mut self) -> usize {
    let mut released = 0;
    for base in self.registry.super_pages() {
      if let Some(super_page) = NonNull::new(ptr::without_provenance_mut(base)) {
        unsafe { self.pages.unmap_super_page(super_page) };
        released += 1;
      }
    }
    self.registry.clear();
    self.total_size_of_super_pages = 0;
    self.next_super_page = 0;
    self.next_partition_page = null_mut();
    self.next_partition_page_end = null_mut();
    released
  }
}

/// Pops `entry`, the head of `page`'s freelist.
///
/// # Safety
/// `page` is an active page of `bucket` and `entry` is its freelist head.
#[inline(always)]
unsafe fn pop_freelist(bucket: &Bucket, page: PagePtr, entry: NonNull<FreelistEntry>) -> NonNull<u8> {
  let next = freelist_unmask(unsafe { (*entry.as_ptr()).next });
  if !next.is_null() {
    let offset = (next as usize).wrapping_sub(page_to_pointer(page).as_ptr() as usize);
    let span_bytes = bucket.num_slots() as usize * bucket.slot_size();
    if offset >= span_bytes || (INTEGRITY_CHECKS && offset % bucket.slot_size() != 0) {
      partition_fatal(PartitionError::FreelistCorrupted { ptr: next as usize });
    }
  }
  let p = unsafe { &mut *page.as_ptr() };
  p.state = PageState::Active {
    freelist_head: NonNull::new(next),
  };
  p.num_allocated_slots += 1;
  entry.cast()
}

/// Walks the active list from `start` until a page that can serve an
/// allocation turns up, and makes it the head. Exhausted pages met on the way
/// are marked full and dropped from the list.
///
/// # Safety
/// `start` is `None` or a page on `bucket`'s active list.
unsafe fn set_new_active_page(bucket: &mut Bucket, start: Option<PagePtr>) -> Option<PagePtr> {
  let mut cursor = start;
  while let Some(page) = cursor {
    let p = unsafe { &mut *page.as_ptr() };
    cursor = p.active_next;
    match p.state {
      PageState::Active {
        freelist_head: Some(_),
      } => {
        bucket.active_pages_head = Some(page);
        return Some(page);
      }
      PageState::Active { freelist_head: None } if p.num_unprovisioned_slots > 0 => {
        bucket.active_pages_head = Some(page);
        return Some(page);
      }
      PageState::Active { freelist_head: None } => {
        p.state = PageState::Full;
        p.active_next = None;
        bucket.num_full_pages += 1;
      }
      state => debug_assert!(false, "page in state {state:?} on the active list"),
    }
  }
  bucket.active_pages_head = None;
  None
}

/// Drops `page` from the singly linked active list. Linear in the number of
/// active pages ahead of it; only a free that empties a non-head page pays it.
///
/// # Safety
/// `page` is on `bucket`'s active list and is not its head.
unsafe fn unlink_active_page(bucket: &mut Bucket, page: PagePtr) {
  let mut cursor = bucket.active_pages_head;
  while let Some(prev) = cursor {
    let prev = unsafe { &mut *prev.as_ptr() };
    if prev.active_next == Some(page) {
      prev.active_next = unsafe { (*page.as_ptr()).active_next };
      return;
    }
    cursor = prev.active_next;
  }
  debug_assert!(false, "emptied page missing from the active list");
}

/// # Safety
/// `page` is `bucket`'s free list head.
unsafe fn take_free_page(bucket: &mut Bucket, page: PagePtr) -> PagePtr {
  match unsafe { (*page.as_ptr()).state } {
    PageState::Free { next_free } => {
      bucket.free_pages_head = next_free;
      page
    }
    _ => partition_fatal(PartitionError::FreelistCorrupted {
      ptr: page.as_ptr() as usize,
    }),
  }
}

/// Claims the span described by `page` for bucket `index`, with every slot
/// unprovisioned. Trailing partition pages of the span point back at `page`.
///
/// # Safety
/// `page` is the descriptor of a span not owned by any other bucket.
unsafe fn page_reset(page: PagePtr, bucket: &Bucket, index: usize) {
  let p = unsafe { &mut *page.as_ptr() };
  p.state = PageState::Active { freelist_head: None };
  p.active_next = None;
  p.bucket = index as u16;
  p.num_allocated_slots = 0;
  p.num_unprovisioned_slots = bucket.num_slots();
  p.page_offset = 0;
  for i in 1..bucket.num_partition_pages() {
    unsafe { (*page.as_ptr().byte_add(i << PAGE_METADATA_SHIFT)).page_offset = i as u16 };
  }
}

/// Hands out the next unprovisioned slot and threads a freelist through the
/// rest of its system page. Later system pages stay untouched, and unfaulted,
/// until they are needed.
///
/// # Safety
/// `page` is the active head of `bucket`, with an empty freelist and
/// unprovisioned slots left.
unsafe fn alloc_and_fill_freelist(bucket: &Bucket, page: PagePtr) -> NonNull<u8> {
  let p = unsafe { &mut *page.as_ptr() };
  debug_assert!(p.num_unprovisioned_slots > 0, "no unprovisioned slots to carve");
  let size = bucket.slot_size();
  // With an empty freelist every provisioned slot is allocated.
  let return_object = unsafe { page_to_pointer(page).add(size * p.num_allocated_slots as usize) };
  let first_entry = unsafe { return_object.add(size) };

  let first_entry_extent = first_entry.as_ptr() as usize + size_of::<FreelistEntry>();
  let sub_page_limit = align_up(first_entry.as_ptr() as usize, SYSTEM_PAGE_SIZE);
  let slots_limit = return_object.as_ptr() as usize + size * p.num_unprovisioned_slots as usize;
  let freelist_limit = sub_page_limit.min(slots_limit);

  let mut num_new_entries = 0;
  if first_entry_extent <= freelist_limit {
    num_new_entries = 1 + (freelist_limit - first_entry_extent) / size;
  }
  p.num_unprovisioned_slots -= (num_new_entries + 1) as u16;
  p.num_allocated_slots += 1;

  if num_new_entries == 0 {
    p.state = PageState::Active { freelist_head: None };
    return return_object;
  }
  let mut entry = first_entry.cast::<FreelistEntry>();
  p.state = PageState::Active {
    freelist_head: Some(entry),
  };
  for _ in 1..num_new_entries {
    unsafe {
      let next = entry.byte_add(size);
      (*entry.as_ptr()).next = freelist_mask(next.as_ptr());
      entry = next;
    }
  }
  unsafe { (*entry.as_ptr()).next = freelist_mask(null_mut()) };
  return_object
}

/// Resolves `slot` to the descriptor of the span it was handed out from, or
/// aborts when the pointer cannot be a live slot: a guard page, a page no span
/// owns, a span on the free list, or an address past the span's last slot.
/// Debug builds also reject pointers into the middle of a slot.
///
/// # Safety
/// `slot` lies inside a super page registered with the partition.
unsafe fn slot_to_live_page(slot: NonNull<u8>, buckets: &[Bucket], user: usize) -> PagePtr {
  let unowned = PartitionError::UnownedPointer { ptr: user };
  let Some(page) = (unsafe { pointer_to_page(slot) }) else {
    partition_fatal(unowned);
  };
  let p = unsafe { &*page.as_ptr() };
  if !matches!(p.state, PageState::Active { .. } | PageState::Full) {
    partition_fatal(unowned);
  }
  let Some(bucket) = buckets.get(p.bucket as usize) else {
    partition_fatal(unowned);
  };
  if bucket.slot_size() == 0 {
    partition_fatal(unowned);
  }
  let offset = slot.as_ptr() as usize - page_to_pointer(page).as_ptr() as usize;
  if offset >= bucket.num_slots() as usize * bucket.slot_size()
    || (INTEGRITY_CHECKS && offset % bucket.slot_size() != 0)
  {
    partition_fatal(unowned);
  }
  page
}

fn bucket_has_no_live_slots(bucket: &Bucket) -> bool {
  if bucket.num_full_pages != 0 {
    return false;
  }
  let mut cursor = bucket.active_pages_head;
  while let Some(page) = cursor {
    let p = unsafe { &*page.as_ptr() };
    if p.num_allocated_slots != 0 {
      return false;
    }
    cursor = p.active_next;
  }
  true
}

// =============================================================================
// Debug Integrity
// =============================================================================

#[inline(always)]
fn cookie_size_adjust_add(size: usize) -> usize {
  size + COOKIE_OVERHEAD
}

/// Maps the pointer a caller frees back to the start of its slot.
#[inline(always)]
fn cookie_free_pointer_adjust(ptr: *mut u8) -> *mut u8 {
  ptr.wrapping_sub(COOKIE_SIZE)
}

/// Fills a freshly popped slot with the uninitialized pattern, brackets it with
/// cookies and returns the user pointer past the leading one.
///
/// # Safety
/// `slot` is a whole slot of `slot_size` bytes owned by the caller.
#[inline(always)]
unsafe fn integrity_on_alloc(slot: NonNull<u8>, slot_size: usize) -> NonNull<u8> {
  if !INTEGRITY_CHECKS {
    return slot;
  }
  unsafe {
    ptr::write_bytes(slot.as_ptr(), UNINITIALIZED_BYTE, slot_size);
    slot.cast::<usize>().write_unaligned(COOKIE_VALUE);
    slot.add(slot_size - COOKIE_SIZE).cast::<usize>().write_unaligned(COOKIE_VALUE);
    slot.add(COOKIE_SIZE)
  }
}

/// Checks both cookies of a slot on its way back, then overwrites it with the
/// freed pattern.
///
/// # Safety
/// `slot` is a whole live slot of `slot_size` bytes.
#[inline(always)]
unsafe fn integrity_on_free(slot: NonNull<u8>, slot_size: usize) {
  if !INTEGRITY_CHECKS {
    return;
  }
  unsafe {
    let leading = slot.cast::<usize>().read_unaligned();
    let trailing = slot.add(slot_size - COOKIE_SIZE).cast::<usize>().read_unaligned();
    if leading != COOKIE_VALUE || trailing != COOKIE_VALUE {
      partition_fatal(PartitionError::CookieMismatch {
        ptr: slot.as_ptr() as usize + COOKIE_SIZE,
      });
    }
    ptr::write_bytes(slot.as_ptr(), FREED_BYTE, slot_size);
  }
}

// =============================================================================
// Fixed Partition
// =============================================================================

/// A partition with one exact bucket per granule, up to `max_allocation`.
///
/// Single threaded by contract: every entry point takes `&mut self`, so the
/// owner serializes access.
pub struct PartitionRoot<P: PageSource = SystemPages> {
  base: PartitionRootBase<P>,
  buckets: Box<[Bucket]>,
  max_allocation: usize,
}

unsafe impl<P: PageSource + Send> Send for PartitionRoot<P> {}

impl PartitionRoot {
  pub fn new() -> Self {
    Self::with_page_source(SystemPages)
  }
}

impl Default for PartitionRoot {
  fn default() -> Self {
    Self::new()
  }
}

impl<P: PageSource> PartitionRoot<P> {
  pub fn with_page_source(pages: P) -> Self {
    Self {
      base: PartitionRootBase::new(pages),
      buckets: Box::default(),
      max_allocation: 0,
    }
  }

  /// Sets up `num_buckets` exact buckets and caps requests at `max_allocation`.
  /// The bucket count grows when needed so that every size up to the cap,
  /// cookies included, has a bucket of its own. A cap whose slot would not
  /// fit in a slot span is fatal.
  pub fn init(&mut self, num_buckets: usize, max_allocation: usize) {
    assert!(!self.base.initialized, "partition initialized twice");
    // Checked before rounding so a cap near usize::MAX cannot wrap.
    if max_allocation > MAX_FIXED_ALLOCATION {
      partition_fatal(PartitionError::AllocationTooLarge {
        size: max_allocation,
        max: MAX_FIXED_ALLOCATION,
      });
    }
    let largest_slot = cookie_size_adjust_add(align_up(max_allocation.max(1), ALLOCATION_GRANULARITY));
    debug_assert!(largest_slot <= MAX_SLOT_SIZE);
    let num_buckets = num_buckets.max((largest_slot >> BUCKET_SHIFT) + 1);
    self.buckets = (0..num_buckets).map(|i| Bucket::new(i << BUCKET_SHIFT)).collect();
    self.max_allocation = max_allocation;
    self.base.initialized = true;
    debug!("fixed partition initialized: {num_buckets} buckets, max allocation {max_allocation}");
  }

  /// Allocates `size` bytes, aligned to [`ALLOCATION_GRANULARITY`]. Never
  /// returns on failure: sizes above the cap and an exhausted page source abort.
  #[inline]
  pub fn alloc(&mut self, size: usize) -> NonNull<u8> {
    if MEMORY_TOOL_REPLACES_ALLOCATOR {
      return fallback_alloc(&SystemFallback, size.max(1));
    }
    assert!(self.base.initialized, "alloc from an uninitialized partition");
    if size > self.max_allocation {
      partition_fatal(PartitionError::AllocationTooLarge {
        size,
        max: self.max_allocation,
      });
    }
    let size = cookie_size_adjust_add(align_up(size.max(1), ALLOCATION_GRANULARITY));
    let index = size >> BUCKET_SHIFT;
    debug_assert!(index < self.buckets.len(), "no bucket for {size} bytes");
    let bucket = &mut self.buckets[index];
    let slot = self.base.bucket_alloc(bucket, index);
    unsafe { integrity_on_alloc(slot, bucket.slot_size()) }
  }

  /// # Safety
  /// `ptr` came from [`PartitionRoot::alloc`] on this partition and is not used again.
  #[inline]
  pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
    if MEMORY_TOOL_REPLACES_ALLOCATOR {
      unsafe { SystemFallback.free(ptr.as_ptr()) };
      return;
    }
    let user = ptr.as_ptr() as usize;
    if !self.base.registry.contains(user) {
      partition_fatal(PartitionError::UnownedPointer { ptr: user });
    }
    let Some(slot) = NonNull::new(cookie_free_pointer_adjust(ptr.as_ptr())) else {
      partition_fatal(PartitionError::UnownedPointer { ptr: user });
    };
    unsafe {
      let page = slot_to_live_page(slot, &self.buckets, user);
      let bucket = &mut self.buckets[(*page.as_ptr()).bucket as usize];
      self.base.free_with_page(bucket, page, slot, user);
    }
  }

  /// Unmaps every super page and resets the buckets, after which `init` may
  /// run again. Returns `false` when allocations were still live. Shutting
  /// down a partition that is not initialized does nothing.
  pub fn shutdown(&mut self) -> bool {
    if !self.base.initialized {
      return true;
    }
    let no_leaks = self.buckets.iter().all(bucket_has_no_live_slots);
    let released = self.base.release_super_pages();
    self.buckets.iter_mut().for_each(Bucket::reset);
    self.base.initialized = false;
    log_shutdown("fixed", released, no_leaks);
    no_leaks
  }

  /// Whether `ptr` falls inside one of this partition's super pages.
  pub fn owns(&self, ptr: *const u8) -> bool {
    self.base.registry.contains(ptr as usize)
  }

  pub fn total_size_of_super_pages(&self) -> usize {
    self.base.total_size_of_super_pages
  }

  pub fn is_initialized(&self) -> bool {
    self.base.initialized
  }

  pub fn max_allocation(&self) -> usize {
    self.max_allocation
  }
}

impl<P: PageSource> Drop for PartitionRoot<P> {
  fn drop(&mut self) {
    self.shutdown();
  }
}

/// A fixed partition sized at compile time: buckets for every size below `N`.
pub struct SizeSpecificPartitionAllocator<const N: usize, P: PageSource = SystemPages> {
  root: PartitionRoot<P>,
}

impl<const N: usize> SizeSpecificPartitionAllocator<N> {
  pub const MAX_ALLOCATION: usize = N - ALLOCATION_GRANULARITY;
  pub const NUM_BUCKETS: usize = N / ALLOCATION_GRANULARITY;

  pub fn new() -> Self {
    Self::with_page_source(SystemPages)
  }
}

impl<const N: usize> Default for SizeSpecificPartitionAllocator<N> {
  fn default() -> Self {
    Self::new()
  }
}

impl<const N: usize, P: PageSource> SizeSpecificPartitionAllocator<N, P> {
  pub fn with_page_source(pages: P) -> Self {
    Self {
      root: PartitionRoot::with_page_source(pages),
    }
  }

  pub fn init(&mut self) {
    self.root.init(
      SizeSpecificPartitionAllocator::<N>::NUM_BUCKETS,
      SizeSpecificPartitionAllocator::<N>::MAX_ALLOCATION,
    );
  }

  pub fn shutdown(&mut self) -> bool {
    self.root.shutdown()
  }

  pub fn root(&mut self) -> &mut PartitionRoot<P> {
    &mut self.root
  }
}

// =============================================================================
// Generic Partition
// =============================================================================

struct GenericState<P: PageSource> {
  base: PartitionRootBase<P>,
  buckets: [Bucket; GENERIC_NUM_BUCKETS],
}

/// A thread safe partition for arbitrary sizes. One spinlock covers every
/// operation. Sizes above [`GENERIC_MAX_BUCKETED`] and pointers the partition
/// does not own go to the fallback allocator.
pub struct PartitionRootGeneric<P: PageSource = SystemPages, F: FallbackAllocator = SystemFallback> {
  lock: SpinLock,
  initialized: AtomicBool,
  state: UnsafeCell<GenericState<P>>,
  fallback: F,
}

// All access to `state` happens under `lock`.
unsafe impl<P: PageSource + Send, F: FallbackAllocator + Send> Send for PartitionRootGeneric<P, F> {}
unsafe impl<P: PageSource + Send, F: FallbackAllocator + Sync> Sync for PartitionRootGeneric<P, F> {}

impl PartitionRootGeneric {
  pub const fn new() -> Self {
    Self::with_collaborators(SystemPages, SystemFallback)
  }
}

impl Default for PartitionRootGeneric {
  fn default() -> Self {
    Self::new()
  }
}

impl<P: PageSource, F: FallbackAllocator> PartitionRootGeneric<P, F> {
  pub const fn with_collaborators(pages: P, fallback: F) -> Self {
    Self {
      lock: SpinLock::new(),
      initialized: AtomicBool::new(false),
      state: UnsafeCell::new(GenericState {
        base: PartitionRootBase::new(pages),
        buckets: GENERIC_BUCKETS,
      }),
      fallback,
    }
  }

  /// Idempotent.
  pub fn init(&self) {
    if self.initialized.load(Ordering::Acquire) {
      return;
    }
    {
      let _guard = self.lock.lock();
      let state = unsafe { &mut *self.state.get() };
      if state.base.initialized {
        return;
      }
      state.buckets = GENERIC_BUCKETS;
      state.base.initialized = true;
      self.initialized.store(true, Ordering::Release);
    }
    debug!(
      "generic partition initialized: {GENERIC_NUM_BUCKETS} buckets up to {GENERIC_MAX_BUCKETED} bytes"
    );
  }

  /// Allocates `size` bytes, aligned to [`ALLOCATION_GRANULARITY`]. Never
  /// returns on failure.
  pub fn alloc_generic(&self, size: usize) -> NonNull<u8> {
    if size > MAX_GENERIC_ALLOCATION {
      partition_fatal(PartitionError::AllocationTooLarge {
        size,
        max: MAX_GENERIC_ALLOCATION,
      });
    }
    if MEMORY_TOOL_REPLACES_ALLOCATOR {
      return fallback_alloc(&self.fallback, size.max(1));
    }
    let index = generic_size_to_bucket(cookie_size_adjust_add(size));
    if index == GENERIC_PAGED_BUCKET {
      return fallback_alloc(&self.fallback, size);
    }
    assert!(
      self.initialized.load(Ordering::Acquire),
      "alloc from an uninitialized partition"
    );

    let _guard = self.lock.lock();
    let state = unsafe { &mut *self.state.get() };
    let bucket = &mut state.buckets[index];
    let slot = state.base.bucket_alloc(bucket, index);
    unsafe { integrity_on_alloc(slot, bucket.slot_size()) }
  }

  /// Frees `ptr`. Null is ignored, and a pointer outside the partition's super
  /// pages is passed to the fallback allocator untouched.
  ///
  /// # Safety
  /// `ptr` is null, came from [`PartitionRootGeneric::alloc_generic`] on this
  /// partition, or came from its fallback allocator. It is not used again.
  pub unsafe fn free_generic(&self, ptr: *mut u8) {
    if ptr.is_null() {
      return;
    }
    if MEMORY_TOOL_REPLACES_ALLOCATOR {
      unsafe { self.fallback.free(ptr) };
      return;
    }
    let user = ptr as usize;
    {
      let _guard = self.lock.lock();
      let state = unsafe { &mut *self.state.get() };
      if state.base.registry.contains(user) {
        let Some(slot) = NonNull::new(cookie_free_pointer_adjust(ptr)) else {
          partition_fatal(PartitionError::UnownedPointer { ptr: user });
        };
        unsafe {
          let page = slot_to_live_page(slot, &state.buckets, user);
          let bucket = &mut state.buckets[(*page.as_ptr()).bucket as usize];
          state.base.free_with_page(bucket, page, slot, user);
        }
        return;
      }
    }
    unsafe { self.fallback.free(ptr) };
  }

  /// Resizes `ptr` to `new_size` bytes. Null allocates and a size of 0 frees.
  /// A new size that lands in the same bucket keeps the pointer; otherwise the
  /// contents move to a new allocation.
  ///
  /// # Safety
  /// Same as [`PartitionRootGeneric::free_generic`].
  pub unsafe fn realloc_generic(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
    if MEMORY_TOOL_REPLACES_ALLOCATOR {
      return unsafe { self.fallback.realloc(ptr, new_size) };
    }
    if ptr.is_null() {
      return self.alloc_generic(new_size).as_ptr();
    }
    if new_size == 0 {
      unsafe { self.free_generic(ptr) };
      return null_mut();
    }
    if new_size > MAX_GENERIC_ALLOCATION {
      partition_fatal(PartitionError::AllocationTooLarge {
        size: new_size,
        max: MAX_GENERIC_ALLOCATION,
      });
    }

    let user = ptr as usize;
    let new_bucket = generic_size_to_bucket(cookie_size_adjust_add(new_size));
    let old_bucket = {
      let _guard = self.lock.lock();
      let state = unsafe { &*self.state.get() };
      if state.base.registry.contains(user) {
        let Some(slot) = NonNull::new(cookie_free_pointer_adjust(ptr)) else {
          partition_fatal(PartitionError::UnownedPointer { ptr: user });
        };
        let page = unsafe { slot_to_live_page(slot, &state.buckets, user) };
        let old_bucket = unsafe { (*page.as_ptr()).bucket } as usize;
        if old_bucket == new_bucket {
          return ptr;
        }
        Some(old_bucket)
      } else {
        None
      }
    };

    let Some(old_bucket) = old_bucket else {
      let ret = unsafe { self.fallback.realloc(ptr, new_size) };
      if ret.is_null() {
        partition_fatal(PartitionError::FallbackFailed { size: new_size });
      }
      return ret;
    };

    // Moving takes the lock once per step. Only the caller may free `ptr`, so
    // its slot stays live between the steps.
    let ret = self.alloc_generic(new_size);
    let old_usable = GENERIC_SLOT_SIZES[old_bucket] - COOKIE_OVERHEAD;
    unsafe {
      ptr::copy_nonoverlapping(ptr, ret.as_ptr(), old_usable.min(new_size));
      self.free_generic(ptr);
    }
    ret.as_ptr()
  }

  /// Bytes usable behind a request of `size`: its bucket's slot less the
  /// cookies, or `size` itself when the request is paged.
  pub fn actual_size(&self, size: usize) -> usize {
    if size > MAX_GENERIC_ALLOCATION {
      return size;
    }
    match generic_size_to_bucket(cookie_size_adjust_add(size)) {
      GENERIC_PAGED_BUCKET => size,
      index => GENERIC_SLOT_SIZES[index] - COOKIE_OVERHEAD,
    }
  }

  /// Same contract as [`PartitionRoot::shutdown`]. No other thread may be
  /// using the partition.
  pub fn shutdown(&self) -> bool {
    let (released, no_leaks) = {
      let _guard = self.lock.lock();
      let state = unsafe { &mut *self.state.get() };
      if !state.base.initialized {
        return true;
      }
      let no_leaks = state.buckets.iter().all(bucket_has_no_live_slots);
      let released = state.base.release_super_pages();
      state.buckets.iter_mut().for_each(Bucket::reset);
      state.base.initialized = false;
      self.initialized.store(false, Ordering::Release);
      (released, no_leaks)
    };
    log_shutdown("generic", released, no_leaks);
    no_leaks
  }

  /// Whether `ptr` falls inside one of this partition's super pages.
  pub fn owns(&self, ptr: *const u8) -> bool {
    let _guard = self.lock.lock();
    unsafe { (*self.state.get()).base.registry.contains(ptr as usize) }
  }

  pub fn total_size_of_super_pages(&self) -> usize {
    let _guard = self.lock.lock();
    unsafe { (*self.state.get()).base.total_size_of_super_pages }
  }

  pub fn is_initialized(&self) -> bool {
    self.initialized.load(Ordering::Acquire)
  }

  pub fn fallback(&self) -> &F {
    &self.fallback
  }
}

impl<P: PageSource, F: FallbackAllocator> Drop for PartitionRootGeneric<P, F> {
  fn drop(&mut self) {
    self.shutdown();
  }
}

// =============================================================================
// GlobalAlloc
// =============================================================================

unsafe impl<P: PageSource, F: FallbackAllocator> GlobalAlloc for PartitionRootGeneric<P, F> {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    let size = layout.size();
    if size > MAX_GENERIC_ALLOCATION {
      return null_mut();
    }
    // Buckets only guarantee granule alignment.
    if layout.align() > ALLOCATION_GRANULARITY {
      return self.fallback.malloc_aligned(size, layout.align());
    }
    self.init();
    self.alloc_generic(size).as_ptr()
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    unsafe { self.free_generic(ptr) };
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if layout.align() <= ALLOCATION_GRANULARITY && new_size <= MAX_GENERIC_ALLOCATION {
      return unsafe { self.realloc_generic(ptr, new_size) };
    }

    let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
    let new_ptr = unsafe { self.alloc(new_layout) };
    if !new_ptr.is_null() {
      unsafe {
        ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
        self.dealloc(ptr, layout);
      }
    }
    new_ptr
  }
}

// =============================================================================
// Utils
// =============================================================================

#[inline]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

fn fallback_alloc<F: FallbackAllocator>(fallback: &F, size: usize) -> NonNull<u8> {
  match NonNull::new(fallback.malloc(size)) {
    Some(ptr) => ptr,
    None => partition_fatal(PartitionError::FallbackFailed { size }),
  }
}

/// Reports a fatal condition and aborts. Nothing here may allocate or unwind.
#[cold]
#[inline(never)]
fn partition_fatal(err: PartitionError) -> ! {
  let _ = writeln!(std::io::stderr(), "partition_alloc: fatal: {err}");
  std::process::abort()
}

fn log_shutdown(kind: &str, released: usize, no_leaks: bool) {
  debug!("{kind} partition shut down, released {released} super pages");
  if !no_leaks {
    warn!("{kind} partition shut down with live allocations");
  }
}

#[cfg(test)]
mod tests;

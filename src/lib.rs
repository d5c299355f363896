//! An object-caching slab allocator in the style of Bonwick '94.
//!
//! The organization is as follows (top-down):
//!
//!  * A `CacheHeap` owns every cache and obtains pages from the host
//!    through a `PageProvider`.
//!  * A `Cache` hands out objects of exactly one size from a circular,
//!    doubly linked list of slabs, kept ordered full, then partial, then
//!    empty. A cache-level freelist pointer names the first slab with
//!    capacity, so allocation is O(1).
//!  * A `Slab` is one page carved into equally sized buffers, with a
//!    freelist and a reference count.
//!  * Small objects (under an eighth of a page) keep their freelist links
//!    inside the free buffers and the slab record at the page tail. Larger
//!    objects use off-page `Bufctl` records and a buffer-to-bufctl hash,
//!    so the whole page is available for objects.
//!
//! The allocator hosts its own metadata: cache records, slab records,
//! bufctls and hash nodes all come from internal caches, bootstrapped by
//! placing the cache-of-caches inside the first slab of itself.
#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;


mod hash;

use core::fmt;
use core::mem;
use core::ptr::{self, NonNull};

use log::{trace, warn};
use spin::Mutex;

use crate::hash::BufHash;

/// Controls whether an allocation may block while the backing allocator
/// finds a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocFlags {
    /// The caller permits blocking; growth retries until a page arrives.
    Sleep,
    /// Growth must not block; a failed page acquisition surfaces as
    /// [`AllocationError::OutOfMemory`].
    NoSleep,
}

/// The one recoverable failure: the backing allocator could not provide a
/// page without blocking. Everything else is a caller contract violation
/// and is asserted or undefined.
#[derive(Debug)]
pub enum AllocationError {
    /// Can't satisfy the request without blocking.
    OutOfMemory,
}

/// The backing allocator the host must supply.
///
/// The heap queries the page size once at construction and derives its
/// page mask from it, so the value must not change over the provider's
/// lifetime.
///
/// # Safety
///
/// `page_size` must return a power of two, and `allocate_page` must return
/// regions of exactly `page_size()` bytes aligned to `page_size()`, valid
/// until they are passed back to `release_page`.
pub unsafe trait PageProvider {
    /// The host's page size in bytes.
    fn page_size(&self) -> usize;

    /// Obtain one page. Under [`AllocFlags::Sleep`] the provider may block
    /// until a page is available; under [`AllocFlags::NoSleep`] it must
    /// return `None` rather than block.
    fn allocate_page(&mut self, flags: AllocFlags) -> Option<NonNull<u8>>;

    /// Return a page previously handed out by `allocate_page`.
    fn release_page(&mut self, page: NonNull<u8>);
}

/// Rawlink is a type like Option<T> but for holding a raw pointer.
struct Rawlink<T> {
    p: *mut T,
}

impl<T> Clone for Rawlink<T> {
    fn clone(&self) -> Self {
        Rawlink { p: self.p }
    }
}

impl<T> Copy for Rawlink<T> {}

impl<T> Rawlink<T> {
    /// Like Option::None for Rawlink.
    #[inline]
    fn none() -> Rawlink<T> {
        Rawlink { p: ptr::null_mut() }
    }

    /// Like Option::Some for Rawlink.
    #[inline]
    fn from_raw(p: *mut T) -> Rawlink<T> {
        Rawlink { p }
    }

    #[inline]
    fn is_none(&self) -> bool {
        self.p.is_null()
    }

    #[inline]
    fn as_ptr(&self) -> *mut T {
        self.p
    }

    /// Return the `Rawlink` and replace it with `Rawlink::none()`.
    #[inline]
    fn take(&mut self) -> Rawlink<T> {
        mem::replace(self, Rawlink::none())
    }
}

/// Which slab layout a cache uses; fixed at create time so the dispatch in
/// alloc and free is a single branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlabLayout {
    /// Freelist links inside the free buffers, slab record at the page
    /// tail. Chosen when the object size is under an eighth of a page.
    Small,
    /// Off-page slab record and bufctls, buffer-to-bufctl hash.
    Large,
}

/// Off-slab metadata record for one buffer of a large-object slab.
#[repr(C)]
struct Bufctl {
    /// Next free bufctl in the owning slab's freelist.
    next: Rawlink<Bufctl>,
    /// The slab this buffer belongs to.
    slab: Rawlink<Slab>,
    /// The buffer this record controls.
    buf: *mut u8,
}

/// One page's worth of equally sized buffers.
///
/// In small layout the record sits at the tail of the page it describes;
/// in large layout it lives in the internal slab cache. The freelist ends
/// `first` and `last` hold buffer addresses in small layout and bufctl
/// addresses in large layout; the owning cache's layout tag decides which
/// reading is in effect.
#[repr(C)]
struct Slab {
    prev: Rawlink<Slab>,
    next: Rawlink<Slab>,
    /// Head of this slab's freelist.
    first: *mut u8,
    /// Tail of this slab's freelist.
    last: *mut u8,
    /// Advertised buffer capacity.
    size: usize,
    /// Buffers currently allocated out of this slab.
    refcount: usize,
    /// Base address of the backing page.
    start: *mut u8,
}

impl Slab {
    #[inline]
    fn is_full(&self) -> bool {
        self.refcount == self.size
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.refcount == 0
    }

    #[inline]
    fn has_space(&self) -> bool {
        self.refcount < self.size
    }
}

/// One object cache: a circular list of slabs holding objects of a single
/// rounded size.
#[repr(C)]
struct Cache {
    name: &'static str,
    /// Number of slabs on the list.
    slab_count: usize,
    /// Per-object size after alignment rounding.
    object_size: usize,
    align: usize,
    layout: SlabLayout,
    /// Head of the circular slab list: full slabs first, then partial,
    /// then empty.
    slabs: Rawlink<Slab>,
    /// First slab with free capacity; none when every slab is full.
    freelist: Rawlink<Slab>,
    /// Buffer-to-bufctl index; large layout only, none for small caches.
    hash: Rawlink<BufHash>,
}

impl Cache {
    /// Links `slab` into the circular list immediately before `pos`.
    unsafe fn insert_before(pos: *mut Slab, slab: *mut Slab) {
        let prev = (*pos).prev.as_ptr();
        (*prev).next = Rawlink::from_raw(slab);
        (*slab).prev = Rawlink::from_raw(prev);
        (*slab).next = Rawlink::from_raw(pos);
        (*pos).prev = Rawlink::from_raw(slab);
    }

    /// Detaches `slab` from the circular list, repointing the list head if
    /// it referenced the slab. The caller settles `freelist` and
    /// `slab_count`.
    unsafe fn unlink(cp: *mut Cache, slab: *mut Slab) {
        if (*slab).next.as_ptr() == slab {
            // Sole slab.
            (*cp).slabs = Rawlink::none();
        } else {
            let prev = (*slab).prev.as_ptr();
            let next = (*slab).next.as_ptr();
            (*prev).next = Rawlink::from_raw(next);
            (*next).prev = Rawlink::from_raw(prev);
            if (*cp).slabs.as_ptr() == slab {
                (*cp).slabs = Rawlink::from_raw(next);
            }
        }
        (*slab).prev = Rawlink::none();
        (*slab).next = Rawlink::none();
    }

    /// Appends a freshly grown slab at the tail of the list, which is the
    /// empty region, and fixes the freelist pointer.
    unsafe fn add_slab(cp: *mut Cache, slab: *mut Slab) {
        if (*cp).slabs.is_none() {
            (*slab).next = Rawlink::from_raw(slab);
            (*slab).prev = Rawlink::from_raw(slab);
            (*cp).slabs = Rawlink::from_raw(slab);
            (*cp).freelist = Rawlink::from_raw(slab);
        } else {
            Cache::insert_before((*cp).slabs.as_ptr(), slab);
            let fl = (*cp).freelist.as_ptr();
            if fl.is_null() || (*fl).is_full() {
                (*cp).freelist = Rawlink::from_raw(slab);
            }
        }
        (*cp).slab_count += 1;
        trace!(
            "cache {} grew to {} slabs (new slab {:p})",
            (*cp).name,
            (*cp).slab_count,
            slab
        );
    }

    /// Advances the freelist pointer past `slab` to its successor, or to
    /// none when the successor has no capacity either.
    unsafe fn advance_freelist(cp: *mut Cache, slab: *mut Slab) {
        if (*cp).freelist.as_ptr() != slab {
            return;
        }
        let successor = (*slab).next.as_ptr();
        (*cp).freelist = if successor != slab && (*successor).has_space() {
            Rawlink::from_raw(successor)
        } else {
            Rawlink::none()
        };
    }

    /// Moves a slab that just filled to the front of the list, the full
    /// region, and advances the freelist pointer past it.
    unsafe fn mark_complete(cp: *mut Cache, slab: *mut Slab) {
        debug_assert!((*slab).is_full());
        Cache::advance_freelist(cp, slab);
        if (*cp).slabs.as_ptr() != slab {
            Cache::unlink(cp, slab);
            Cache::insert_before((*cp).slabs.as_ptr(), slab);
            (*cp).slabs = Rawlink::from_raw(slab);
        }
    }

    /// Moves a slab that just left the full state to the front of the
    /// non-full region and points the freelist at it.
    unsafe fn mark_partial(cp: *mut Cache, slab: *mut Slab) {
        debug_assert!((*slab).has_space());
        let fl = (*cp).freelist.as_ptr();
        debug_assert!(fl != slab);
        if fl.is_null() {
            // Every other slab is full, so the tail is the boundary. The
            // head may well be this slab (a freshly completed slab is
            // moved to the front); unlink advances it to the successor.
            if (*slab).next.as_ptr() != slab {
                Cache::unlink(cp, slab);
                Cache::insert_before((*cp).slabs.as_ptr(), slab);
            }
        } else {
            Cache::unlink(cp, slab);
            Cache::insert_before(fl, slab);
            // The head marks the front of the full region; when no full
            // slab remains, this slab is the new front of the list.
            if (*(*cp).slabs.as_ptr()).has_space() {
                (*cp).slabs = Rawlink::from_raw(slab);
            }
        }
        (*cp).freelist = Rawlink::from_raw(slab);
    }

    /// Moves a freshly drained slab into the empty region at the tail,
    /// where the next reap will find it.
    unsafe fn mark_empty(cp: *mut Cache, slab: *mut Slab) {
        debug_assert!((*slab).is_empty());
        debug_assert!((*cp).slab_count > 1);
        Cache::advance_freelist(cp, slab);
        if (*slab).next.as_ptr() != slab {
            Cache::unlink(cp, slab);
            Cache::insert_before((*cp).slabs.as_ptr(), slab);
        }
    }

    /// Unlinks `slab` and settles the cache pointers and slab count.
    unsafe fn remove_slab(cp: *mut Cache, slab: *mut Slab) {
        Cache::advance_freelist(cp, slab);
        Cache::unlink(cp, slab);
        (*cp).slab_count -= 1;
        if (*cp).slabs.is_none() {
            (*cp).freelist = Rawlink::none();
        }
        trace!(
            "cache {} dropped slab {:p}, {} remain",
            (*cp).name,
            slab,
            (*cp).slab_count
        );
    }
}

/// Handle to a cache created by [`CacheHeap::create`].
///
/// The cache record lives inside allocator-owned memory; the handle stays
/// valid until [`CacheHeap::destroy`] consumes it.
#[derive(Clone, Copy)]
pub struct CacheRef(NonNull<Cache>);

impl CacheRef {
    #[inline]
    fn link(self) -> Rawlink<Cache> {
        Rawlink::from_raw(self.0.as_ptr())
    }
}

impl fmt::Debug for CacheRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CacheRef({:p})", self.0.as_ptr())
    }
}

/// Rounds `size` up so consecutive buffers respect `align`, with a floor
/// of one machine word so a free buffer can always hold its freelist link.
fn effective_size(size: usize, align: usize) -> usize {
    let size = size.max(mem::size_of::<*mut u8>());
    if align == 0 {
        size
    } else {
        (size + align - 1) & !(align - 1)
    }
}

/// An object-cache heap.
///
/// Owns the internal metadata caches and, transitively, every page drawn
/// from the provider. All operations take `&mut self`; the core is single
/// threaded, and callers who need to share a heap wrap it in
/// [`SafeCacheHeap`].
pub struct CacheHeap<P: PageProvider> {
    pager: P,
    page_size: usize,
    /// The cache-of-caches; none until the first create bootstraps it.
    cache_cache: Rawlink<Cache>,
    slab_cache: Rawlink<Cache>,
    bufctl_cache: Rawlink<Cache>,
    hash_cache: Rawlink<Cache>,
    hash_node_cache: Rawlink<Cache>,
}

// The heap exclusively owns every page its internal pointers reach.
unsafe impl<P: PageProvider + Send> Send for CacheHeap<P> {}

impl<P: PageProvider> CacheHeap<P> {
    /// Creates a heap over the given page provider.
    ///
    /// The page size is queried once here and cached.
    pub fn new(pager: P) -> CacheHeap<P> {
        let page_size = pager.page_size();
        assert!(
            page_size.is_power_of_two(),
            "page size must be a power of two"
        );
        assert!(
            page_size >= 8 * mem::size_of::<Slab>(),
            "page size too small to lay out a slab"
        );
        CacheHeap {
            pager,
            page_size,
            cache_cache: Rawlink::none(),
            slab_cache: Rawlink::none(),
            bufctl_cache: Rawlink::none(),
            hash_cache: Rawlink::none(),
            hash_node_cache: Rawlink::none(),
        }
    }

    /// Creates a cache for objects of `size` bytes aligned to `align`.
    ///
    /// `align` must be zero or a power of two; the stored object size is
    /// rounded up so consecutive buffers respect it. One slab is grown
    /// eagerly so the first allocation needs no page from the host.
    pub fn create(
        &mut self,
        name: &'static str,
        size: usize,
        align: usize,
    ) -> Result<CacheRef, AllocationError> {
        assert!(size > 0, "object size must be positive");
        assert!(
            align == 0 || align.is_power_of_two(),
            "alignment must be zero or a power of two"
        );

        let object_size = effective_size(size, align);
        assert!(
            object_size <= self.page_size,
            "objects larger than a page are not supported"
        );

        if self.cache_cache.is_none() {
            unsafe { self.bootstrap()? };
        }

        let layout = if object_size < self.page_size / 8 {
            SlabLayout::Small
        } else {
            SlabLayout::Large
        };
        trace!(
            "create cache {}: object_size={} align={} layout={:?}",
            name,
            object_size,
            align,
            layout
        );

        unsafe {
            let cache_cache = Self::handle(self.cache_cache);
            let cp = self.alloc(cache_cache, AllocFlags::Sleep)?.cast::<Cache>();
            cp.as_ptr().write(Cache {
                name,
                slab_count: 0,
                object_size,
                align,
                layout,
                slabs: Rawlink::none(),
                freelist: Rawlink::none(),
                hash: Rawlink::none(),
            });
            if layout == SlabLayout::Large {
                let hash = self.hash_create(AllocFlags::Sleep)?;
                (*cp.as_ptr()).hash = Rawlink::from_raw(hash);
            }
            // Eager first slab, so the cache is ready at first allocation.
            self.grow(cp.as_ptr(), AllocFlags::Sleep)?;
            Ok(CacheRef(cp))
        }
    }

    /// Takes one buffer from `cache`.
    ///
    /// The returned region's contents are indeterminate. Growth is the
    /// only operation that can block; under [`AllocFlags::NoSleep`] a
    /// failed page acquisition surfaces as an error and leaves the cache
    /// unchanged.
    pub fn alloc(
        &mut self,
        cache: CacheRef,
        flags: AllocFlags,
    ) -> Result<NonNull<u8>, AllocationError> {
        let cp = cache.0.as_ptr();
        unsafe {
            let mut slab = (*cp).freelist.as_ptr();
            while slab.is_null() || (*slab).is_full() {
                slab = self.grow(cp, flags)?;
            }

            let buf = match (*cp).layout {
                SlabLayout::Small => Self::slab_take_small(slab),
                SlabLayout::Large => Self::slab_take_large(slab),
            };

            if (*slab).is_full() {
                trace!("cache {}: slab {:p} is now complete", (*cp).name, slab);
                Cache::mark_complete(cp, slab);
            }

            trace!("cache {} handed out {:p}", (*cp).name, buf);
            Ok(NonNull::new_unchecked(buf))
        }
    }

    /// Returns `buf` to `cache`.
    ///
    /// A slab drained by the free is moved to the reap region, and every
    /// empty slab beyond the first is returned to the provider.
    ///
    /// # Safety
    ///
    /// `buf` must have been returned by a prior [`alloc`](Self::alloc) on
    /// this same cache and must not already have been freed. Double free
    /// and cross-cache free are undefined behavior.
    pub unsafe fn free(&mut self, cache: CacheRef, buf: NonNull<u8>) {
        let cp = cache.0.as_ptr();
        match (*cp).layout {
            SlabLayout::Small => self.free_small(cp, buf.as_ptr()),
            SlabLayout::Large => self.free_large(cp, buf.as_ptr()),
        }
    }

    /// Destroys `cache`: releases its hash, force-reaps every slab, then
    /// returns the cache record to the cache-of-caches.
    ///
    /// # Safety
    ///
    /// Every buffer allocated from `cache` must have been freed, and the
    /// handle must not be used afterwards.
    pub unsafe fn destroy(&mut self, cache: CacheRef) {
        let cp = cache.0.as_ptr();
        trace!("destroying cache {}", (*cp).name);
        let hash = (*cp).hash.take();
        if !hash.is_none() {
            self.hash_destroy(hash.as_ptr());
        }
        self.reap(cp, true);
        let cache_cache = Self::handle(self.cache_cache);
        self.free(cache_cache, NonNull::new_unchecked(cp as *mut u8));
    }

    /// Number of slabs currently held by `cache`.
    pub fn slab_count(&self, cache: CacheRef) -> usize {
        unsafe { (*cache.0.as_ptr()).slab_count }
    }

    /// The per-object size of `cache` after alignment rounding.
    pub fn object_size(&self, cache: CacheRef) -> usize {
        unsafe { (*cache.0.as_ptr()).object_size }
    }

    /// The alignment `cache` was created with.
    pub fn object_align(&self, cache: CacheRef) -> usize {
        unsafe { (*cache.0.as_ptr()).align }
    }

    /// Buffers currently allocated out of `cache`.
    pub fn live_objects(&self, cache: CacheRef) -> usize {
        unsafe {
            let cp = cache.0.as_ptr();
            let head = (*cp).slabs.as_ptr();
            if head.is_null() {
                return 0;
            }
            let mut total = 0;
            let mut slab = head;
            loop {
                total += (*slab).refcount;
                slab = (*slab).next.as_ptr();
                if slab == head {
                    break;
                }
            }
            total
        }
    }

    #[inline]
    unsafe fn handle(link: Rawlink<Cache>) -> CacheRef {
        debug_assert!(!link.is_none());
        CacheRef(NonNull::new_unchecked(link.as_ptr()))
    }

    /// One page from the provider.
    ///
    /// Under [`AllocFlags::Sleep`] a refusal is retried; the provider is
    /// the party that actually blocks.
    fn obtain_page(&mut self, flags: AllocFlags) -> Result<*mut u8, AllocationError> {
        loop {
            match self.pager.allocate_page(flags) {
                Some(page) => {
                    let page = page.as_ptr();
                    assert_eq!(
                        page as usize % self.page_size,
                        0,
                        "provider returned a page not aligned to the page size"
                    );
                    return Ok(page);
                }
                None if flags == AllocFlags::NoSleep => return Err(AllocationError::OutOfMemory),
                None => continue,
            }
        }
    }

    /// Address of the slab record stored at the tail of a small-layout
    /// page.
    #[inline]
    fn slab_at_page_tail(&self, page: *mut u8) -> *mut Slab {
        (page as usize + self.page_size - mem::size_of::<Slab>()) as *mut Slab
    }

    /// Adds one freshly initialized slab to `cache`.
    unsafe fn grow(
        &mut self,
        cp: *mut Cache,
        flags: AllocFlags,
    ) -> Result<*mut Slab, AllocationError> {
        trace!("growing cache {}", (*cp).name);
        let page = self.obtain_page(flags)?;
        let slab = match (*cp).layout {
            SlabLayout::Small => self.slab_init_small(cp, page, 0),
            SlabLayout::Large => match self.slab_init_large(cp, page, flags) {
                Ok(slab) => slab,
                Err(e) => {
                    self.pager.release_page(NonNull::new_unchecked(page));
                    return Err(e);
                }
            },
        };
        Cache::add_slab(cp, slab);
        Ok(slab)
    }

    /// Lays a small-object slab over `page`: buffers at the base, the
    /// record at the tail, and a link word in every free buffer chaining
    /// it to its neighbor.
    ///
    /// `offset` reserves the first `offset` buffer slots for the caller;
    /// the bootstrap places the cache-of-caches record there. Reserved
    /// slots are charged to `refcount` up front, so a slab carrying one
    /// can never look empty to the reaper. The capacity leaves one buffer
    /// of headroom beyond `size`, which keeps the freelist queue non-empty
    /// whenever `refcount < size`, so neither take nor put needs a null
    /// branch and the tail link write always lands in a free buffer.
    unsafe fn slab_init_small(&self, cp: *mut Cache, page: *mut u8, offset: usize) -> *mut Slab {
        let object_size = (*cp).object_size;
        let total = (self.page_size - mem::size_of::<Slab>()) / object_size;
        debug_assert!(total > offset + 1);

        let first = page.add(offset * object_size);
        let last = page.add((total - 1) * object_size);

        // Chain every buffer to its neighbor. The tail's own link is left
        // unwritten; the refcount accounting keeps the chain from being
        // followed that far.
        let mut cur = first;
        while cur < last {
            let next = cur.add(object_size);
            (cur as *mut *mut u8).write_unaligned(next);
            cur = next;
        }

        let slab = self.slab_at_page_tail(page);
        slab.write(Slab {
            prev: Rawlink::none(),
            next: Rawlink::none(),
            first,
            last,
            size: total - 1,
            refcount: offset,
            start: page,
        });
        trace!(
            "small slab {:p}: {} buffers of {} bytes",
            slab,
            total - offset - 1,
            object_size
        );
        slab
    }

    /// Builds a large-object slab over `page`. The record comes from the
    /// slab cache and one bufctl per buffer from the bufctl cache; every
    /// buffer is entered into the cache's hash.
    unsafe fn slab_init_large(
        &mut self,
        cp: *mut Cache,
        page: *mut u8,
        flags: AllocFlags,
    ) -> Result<*mut Slab, AllocationError> {
        let object_size = (*cp).object_size;
        let count = self.page_size / object_size;
        let hash = (*cp).hash.as_ptr();
        debug_assert!(count >= 1);
        debug_assert!(!hash.is_null());

        let slab_cache = Self::handle(self.slab_cache);
        let slab = self.alloc(slab_cache, flags)?.cast::<Slab>().as_ptr();
        slab.write(Slab {
            prev: Rawlink::none(),
            next: Rawlink::none(),
            first: ptr::null_mut(),
            last: ptr::null_mut(),
            size: count,
            refcount: 0,
            start: page,
        });

        let bufctl_cache = Self::handle(self.bufctl_cache);
        let mut tail: *mut Bufctl = ptr::null_mut();
        for i in 0..count {
            let ctl = match self.alloc(bufctl_cache, flags) {
                Ok(p) => p.cast::<Bufctl>().as_ptr(),
                Err(e) => {
                    self.release_large_meta(cp, slab);
                    return Err(e);
                }
            };
            ctl.write(Bufctl {
                next: Rawlink::none(),
                slab: Rawlink::from_raw(slab),
                buf: page.add(i * object_size),
            });
            if tail.is_null() {
                (*slab).first = ctl as *mut u8;
            } else {
                (*tail).next = Rawlink::from_raw(ctl);
            }
            (*slab).last = ctl as *mut u8;
            tail = ctl;

            if let Err(e) = self.hash_insert(hash, (*ctl).buf, ctl, flags) {
                self.release_large_meta(cp, slab);
                return Err(e);
            }
        }
        trace!(
            "large slab {:p}: {} buffers of {} bytes",
            slab,
            count,
            object_size
        );
        Ok(slab)
    }

    /// Takes the freelist head of a small-layout slab.
    unsafe fn slab_take_small(slab: *mut Slab) -> *mut u8 {
        debug_assert!((*slab).has_space());
        let buf = (*slab).first;
        (*slab).first = (buf as *mut *mut u8).read_unaligned();
        (*slab).refcount += 1;
        buf
    }

    /// Appends `buf` to a small-layout slab's freelist by writing the link
    /// word of the current tail, which the capacity headroom guarantees is
    /// a free buffer.
    unsafe fn slab_put_small(slab: *mut Slab, buf: *mut u8) {
        debug_assert!((*slab).refcount > 0);
        let tail = (*slab).last;
        (tail as *mut *mut u8).write_unaligned(buf);
        (*slab).last = buf;
        (*slab).refcount -= 1;
    }

    /// Pops the first free bufctl of a large-layout slab and returns its
    /// buffer.
    unsafe fn slab_take_large(slab: *mut Slab) -> *mut u8 {
        debug_assert!((*slab).has_space());
        let ctl = (*slab).first as *mut Bufctl;
        debug_assert!(!ctl.is_null());
        (*slab).first = (*ctl).next.as_ptr() as *mut u8;
        if (*slab).first.is_null() {
            (*slab).last = ptr::null_mut();
        }
        (*slab).refcount += 1;
        (*ctl).buf
    }

    /// Splices a bufctl onto the tail of a large-layout slab's freelist.
    unsafe fn slab_put_large(slab: *mut Slab, ctl: *mut Bufctl) {
        debug_assert!((*slab).refcount > 0);
        (*ctl).next = Rawlink::none();
        let tail = (*slab).last as *mut Bufctl;
        if tail.is_null() {
            (*slab).first = ctl as *mut u8;
        } else {
            (*tail).next = Rawlink::from_raw(ctl);
        }
        (*slab).last = ctl as *mut u8;
        (*slab).refcount -= 1;
    }

    unsafe fn free_small(&mut self, cp: *mut Cache, buf: *mut u8) {
        // The owning page, and with it the slab record at its tail, falls
        // out of the buffer address.
        let page = (buf as usize & !(self.page_size - 1)) as *mut u8;
        let slab = self.slab_at_page_tail(page);
        trace!("cache {}: free {:p} into slab {:p}", (*cp).name, buf, slab);

        let was_full = (*slab).is_full();
        Self::slab_put_small(slab, buf);
        self.settle_after_free(cp, slab, was_full);
    }

    unsafe fn free_large(&mut self, cp: *mut Cache, buf: *mut u8) {
        let hash = (*cp).hash.as_ptr();
        debug_assert!(!hash.is_null());
        let ctl = match self.hash_get(hash, buf) {
            Some(ctl) => ctl.as_ptr(),
            None => {
                warn!(
                    "cache {}: free of unknown buffer {:p} ignored",
                    (*cp).name,
                    buf
                );
                return;
            }
        };
        let slab = (*ctl).slab.as_ptr();
        debug_assert!(!slab.is_null());
        trace!("cache {}: free {:p} into slab {:p}", (*cp).name, buf, slab);

        let was_full = (*slab).is_full();
        Self::slab_put_large(slab, ctl);
        self.settle_after_free(cp, slab, was_full);
    }

    /// List bookkeeping after a buffer went back: a drained slab moves to
    /// the reap region, a formerly full slab rejoins the non-full region.
    unsafe fn settle_after_free(&mut self, cp: *mut Cache, slab: *mut Slab, was_full: bool) {
        if (*slab).is_empty() && (*cp).slab_count > 1 {
            trace!("cache {}: slab {:p} drained", (*cp).name, slab);
            Cache::mark_empty(cp, slab);
            self.reap(cp, false);
        } else if was_full {
            trace!("cache {}: slab {:p} has space again", (*cp).name, slab);
            Cache::mark_partial(cp, slab);
        }
    }

    /// Reclaims empty slabs from the tail of the list, keeping one slab
    /// resident. Under `force` every slab goes, refcounts notwithstanding;
    /// destroy uses that after the caller promised no outstanding buffers.
    unsafe fn reap(&mut self, cp: *mut Cache, force: bool) {
        loop {
            let head = (*cp).slabs.as_ptr();
            if head.is_null() {
                break;
            }
            let slab = (*head).prev.as_ptr();
            if !force && (!(*slab).is_empty() || (*cp).slab_count <= 1) {
                break;
            }

            let page = (*slab).start;
            Cache::remove_slab(cp, slab);
            if (*cp).layout == SlabLayout::Large {
                self.release_large_meta(cp, slab);
            }
            // In small layout the record lives in the page and goes with it.
            self.pager.release_page(NonNull::new_unchecked(page));
            trace!("cache {}: reaped page {:p}", (*cp).name, page);
        }
    }

    /// Releases a large slab's off-page metadata: hash entries while the
    /// cache still owns a hash, then the bufctls, then the record itself.
    /// The backing page is the caller's to release.
    unsafe fn release_large_meta(&mut self, cp: *mut Cache, slab: *mut Slab) {
        let hash = (*cp).hash.as_ptr();
        let bufctl_cache = Self::handle(self.bufctl_cache);
        let mut ctl = (*slab).first as *mut Bufctl;
        while !ctl.is_null() {
            let next = (*ctl).next.as_ptr();
            if !hash.is_null() {
                self.hash_remove(hash, (*ctl).buf);
            }
            self.free(bufctl_cache, NonNull::new_unchecked(ctl as *mut u8));
            ctl = next;
        }
        let slab_cache = Self::handle(self.slab_cache);
        self.free(slab_cache, NonNull::new_unchecked(slab as *mut u8));
    }

    /// One-time installation of the cache-of-caches inside a slab of
    /// itself, followed by creation of the other internal caches through
    /// the normal create path.
    unsafe fn bootstrap(&mut self) -> Result<(), AllocationError> {
        debug_assert!(self.cache_cache.is_none());
        trace!("bootstrapping internal caches");

        let page = self.obtain_page(AllocFlags::Sleep)?;

        // The record occupies the first buffer slot; the offset-1 slab
        // init leaves that slot off the freelist.
        let cp = page as *mut Cache;
        cp.write(Cache {
            name: "cache-of-caches",
            slab_count: 0,
            object_size: effective_size(mem::size_of::<Cache>(), 0),
            align: 0,
            layout: SlabLayout::Small,
            slabs: Rawlink::none(),
            freelist: Rawlink::none(),
            hash: Rawlink::none(),
        });
        let slab = self.slab_init_small(cp, page, 1);
        Cache::add_slab(cp, slab);
        self.cache_cache = Rawlink::from_raw(cp);

        // With the cache-of-caches live, the rest go through create. All
        // four hold objects well under an eighth of a page, so none of
        // them carries a hash or recurses into the large-layout path.
        let hash_node_cache =
            self.create("hash-node-cache", mem::size_of::<hash::HashNode>(), 0)?;
        self.hash_node_cache = hash_node_cache.link();
        let hash_cache = self.create("hash-cache", mem::size_of::<BufHash>(), 0)?;
        self.hash_cache = hash_cache.link();
        let slab_cache = self.create("slab-cache", mem::size_of::<Slab>(), 0)?;
        self.slab_cache = slab_cache.link();
        let bufctl_cache = self.create("bufctl-cache", mem::size_of::<Bufctl>(), 0)?;
        self.bufctl_cache = bufctl_cache.link();

        trace!("bootstrap complete");
        Ok(())
    }
}

impl<P: PageProvider> Drop for CacheHeap<P> {
    /// Returns every internal page to the provider. Caches created through
    /// [`create`](Self::create) must have been destroyed first; their
    /// pages are not tracked here.
    fn drop(&mut self) {
        if self.cache_cache.is_none() {
            return;
        }
        unsafe {
            // The internal caches are all small layout, so reaping them is
            // pure page release.
            for link in [
                self.bufctl_cache,
                self.slab_cache,
                self.hash_cache,
                self.hash_node_cache,
            ] {
                if !link.is_none() {
                    self.reap(link.as_ptr(), true);
                }
            }

            // The cache-of-caches record lives inside one of its own
            // pages. Free every other page first so the record stays
            // readable while the list is walked, then drop its home page
            // without touching the record again.
            let cp = self.cache_cache.as_ptr();
            let home = (cp as usize & !(self.page_size - 1)) as *mut u8;
            loop {
                let head = (*cp).slabs.as_ptr();
                if head.is_null() {
                    break;
                }
                let mut slab = head;
                let mut victim: *mut Slab = ptr::null_mut();
                loop {
                    if (*slab).start != home {
                        victim = slab;
                        break;
                    }
                    slab = (*slab).next.as_ptr();
                    if slab == head {
                        break;
                    }
                }
                if victim.is_null() {
                    break;
                }
                let page = (*victim).start;
                Cache::remove_slab(cp, victim);
                self.pager.release_page(NonNull::new_unchecked(page));
            }
            self.pager.release_page(NonNull::new_unchecked(home));
        }
    }
}

/// A [`CacheHeap`] behind a spin lock, for callers who must serialize
/// access from several contexts. The core allocator itself takes no locks.
pub struct SafeCacheHeap<P: PageProvider>(Mutex<CacheHeap<P>>);

impl<P: PageProvider> SafeCacheHeap<P> {
    pub fn new(pager: P) -> SafeCacheHeap<P> {
        SafeCacheHeap(Mutex::new(CacheHeap::new(pager)))
    }

    /// Locks the heap for a sequence of operations.
    pub fn lock(&self) -> spin::MutexGuard<'_, CacheHeap<P>> {
        self.0.lock()
    }
}

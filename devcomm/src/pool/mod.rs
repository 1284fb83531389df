//! The message pool: a process-wide, fixed-size allocator of fixed-size pages.
//!
//! No page is ever allocated or freed on the heap once a pool is constructed; pages live in a
//! single static-sized backing array for the lifetime of the pool. Exhaustion is reported to the
//! caller as `None`/`false`, never as a panic or a wait.

use core::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// A handle to one page owned by a [`Pool`].
///
/// Opaque and cheap to copy; carries no lifetime because the pool it refers to is itself
/// `'static` in every intended use (a process-wide static, or a pool owned for the lifetime of a
/// stack). Using a stale `PageIndex` against a different pool than the one that issued it is a
/// logic error the pool cannot detect, exactly like an index into the wrong `Vec`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PageIndex(u16);

/// Sentinel value for the intrusive free-list; no page index ever legitimately equals it.
const FREE_LIST_END: u16 = u16::MAX;

/// Construction-time pool error, surfaced once at startup rather than on the hot path.
#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolError {
    /// A page must hold at least one byte.
    #[error("page size must be nonzero")]
    ZeroPageSize,
    /// A pool needs at least one page to ever hand out.
    #[error("page count must be nonzero")]
    ZeroPageCount,
    /// The free list is indexed by `u16`; a bigger pool can't be tracked by this implementation.
    #[error("page count {0} exceeds the maximum of {max}", max = FREE_LIST_END)]
    TooManyPages(usize),
}

/// Object-safe view of a message pool, used by [`crate::msg::Msg`] so that it need not be
/// generic over the pool's compile-time dimensions.
pub trait Pool: Send + Sync {
    /// Bytes per page.
    fn page_size(&self) -> usize;
    /// Take one free page, refcount 1. `None` on exhaustion.
    fn acquire(&self) -> Option<PageIndex>;
    /// Share an already-acquired page: increment its refcount.
    fn acquire_existing(&self, page: PageIndex);
    /// Decrement a page's refcount; return it to the free list at zero.
    fn release(&self, page: PageIndex);
    /// Copy `out.len()` bytes starting at `offset` within `page` into `out`.
    fn read(&self, page: PageIndex, offset: usize, out: &mut [u8]);
    /// Copy `data` into `page` starting at `offset`.
    fn write(&self, page: PageIndex, offset: usize, data: &[u8]);
    /// Currently allocated (live) pages.
    fn used_pages(&self) -> usize;
    /// High-water mark of `used_pages` since the last [`Pool::clear_used_pages_max`].
    fn used_pages_max(&self) -> usize;
    /// Reset the high-water mark to the current `used_pages()`.
    fn clear_used_pages_max(&self);
}

struct State<const PAGES: usize, const PAGE_SIZE: usize> {
    pages: [[u8; PAGE_SIZE]; PAGES],
    refcounts: [u32; PAGES],
    free_stack: [u16; PAGES],
    free_len: usize,
}

/// A static array of `PAGES` pages of `PAGE_SIZE` bytes, with LIFO free-list reclamation and
/// refcounted sharing.
///
/// All operations serialize on a single mutex; contention is expected to be low since the hot
/// path only holds it for a page-sized copy. `PAGES` and `PAGE_SIZE` are compile-time constants;
/// in an embedded target the mutex compiles down to a critical section.
pub struct MessagePool<const PAGES: usize, const PAGE_SIZE: usize> {
    state: Mutex<State<PAGES, PAGE_SIZE>>,
    used_pages_max: AtomicUsize,
}

impl<const PAGES: usize, const PAGE_SIZE: usize> MessagePool<PAGES, PAGE_SIZE> {
    /// Build a pool with every page free.
    pub fn try_new() -> Result<Self, PoolError> {
        if PAGE_SIZE == 0 {
            return Err(PoolError::ZeroPageSize);
        }
        if PAGES == 0 {
            return Err(PoolError::ZeroPageCount);
        }
        if PAGES > FREE_LIST_END as usize {
            return Err(PoolError::TooManyPages(PAGES));
        }

        let mut free_stack = [0u16; PAGES];
        for (i, slot) in free_stack.iter_mut().enumerate() {
            // Order is unobservable (LIFO, not FIFO); page 0 ends up on top.
            *slot = (PAGES - 1 - i) as u16;
        }

        Ok(MessagePool {
            state: Mutex::new(State {
                pages: [[0u8; PAGE_SIZE]; PAGES],
                refcounts: [0u32; PAGES],
                free_stack,
                free_len: PAGES,
            }),
            used_pages_max: AtomicUsize::new(0),
        })
    }
}

impl<const PAGES: usize, const PAGE_SIZE: usize> Pool for MessagePool<PAGES, PAGE_SIZE> {
    fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    fn acquire(&self) -> Option<PageIndex> {
        let mut state = self.state.lock();
        if state.free_len == 0 {
            log::trace!("message pool exhausted ({} pages in use)", PAGES);
            return None;
        }
        state.free_len -= 1;
        let idx = state.free_stack[state.free_len];
        state.refcounts[idx as usize] = 1;
        let used = PAGES - state.free_len;
        drop(state);
        self.bump_high_water(used);
        Some(PageIndex(idx))
    }

    fn acquire_existing(&self, page: PageIndex) {
        let mut state = self.state.lock();
        state.refcounts[page.0 as usize] += 1;
    }

    fn release(&self, page: PageIndex) {
        let mut state = self.state.lock();
        let count = &mut state.refcounts[page.0 as usize];
        debug_assert!(*count > 0, "release of a page with a zero refcount");
        *count -= 1;
        if *count == 0 {
            let free_len = state.free_len;
            state.free_stack[free_len] = page.0;
            state.free_len += 1;
        }
    }

    fn read(&self, page: PageIndex, offset: usize, out: &mut [u8]) {
        let state = self.state.lock();
        out.copy_from_slice(&state.pages[page.0 as usize][offset..offset + out.len()]);
    }

    fn write(&self, page: PageIndex, offset: usize, data: &[u8]) {
        let mut state = self.state.lock();
        state.pages[page.0 as usize][offset..offset + data.len()].copy_from_slice(data);
    }

    fn used_pages(&self) -> usize {
        let state = self.state.lock();
        PAGES - state.free_len
    }

    fn used_pages_max(&self) -> usize {
        self.used_pages_max.load(Ordering::Relaxed)
    }

    fn clear_used_pages_max(&self) {
        self.used_pages_max.store(self.used_pages(), Ordering::Relaxed);
    }
}

impl<const PAGES: usize, const PAGE_SIZE: usize> MessagePool<PAGES, PAGE_SIZE> {
    fn bump_high_water(&self, used: usize) {
        self.used_pages_max.fetch_max(used, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_roundtrip() {
        let pool = MessagePool::<4, 16>::try_new().unwrap();
        assert_eq!(pool.used_pages(), 0);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.used_pages(), 2);
        assert_eq!(pool.used_pages_max(), 2);
        pool.release(a);
        assert_eq!(pool.used_pages(), 1);
        pool.release(b);
        assert_eq!(pool.used_pages(), 0);
        assert_eq!(pool.used_pages_max(), 2);
    }

    #[test]
    fn exhaustion_returns_none_not_panic() {
        let pool = MessagePool::<2, 8>::try_new().unwrap();
        let _a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.used_pages(), 2);
    }

    #[test]
    fn sharing_keeps_page_alive_until_every_owner_releases() {
        let pool = MessagePool::<1, 8>::try_new().unwrap();
        let page = pool.acquire().unwrap();
        pool.acquire_existing(page);
        assert_eq!(pool.used_pages(), 1);
        pool.release(page);
        assert_eq!(pool.used_pages(), 1, "still shared once");
        pool.release(page);
        assert_eq!(pool.used_pages(), 0);
    }

    #[test]
    fn clear_used_pages_max_resets_to_current() {
        let pool = MessagePool::<4, 8>::try_new().unwrap();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.used_pages_max(), 2);
        pool.clear_used_pages_max();
        assert_eq!(pool.used_pages_max(), 0);
    }

    #[test]
    fn zero_dimensions_are_rejected_at_construction() {
        assert_eq!(MessagePool::<0, 8>::try_new().unwrap_err(), PoolError::ZeroPageCount);
        assert_eq!(MessagePool::<8, 0>::try_new().unwrap_err(), PoolError::ZeroPageSize);
    }
}

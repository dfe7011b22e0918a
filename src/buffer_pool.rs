use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use log::{debug, trace};

use crate::{
    error::{ErrorKind, SmallError},
    file_manager::FileManager,
    page::{Page, PageID},
    types::StorageResult,
};

struct Frame {
    page: Arc<RwLock<Page>>,
    dirty: bool,
    pin_count: u32,
    referenced: bool,
}

struct Inner {
    file_manager: FileManager,
    frames: Vec<Frame>,
    page_table: HashMap<PageID, usize>,
    clock_hand: usize,
    capacity: usize,
}

/// The buffer pool: a fixed number of page-sized frames, backed by
/// [`FileManager`], evicted under CLOCK with a reference bit. Pages are
/// only ever handed out through a [`PageGuard`] -- there is no API that
/// returns a page without also returning the pin that protects it, so a
/// page can never be evicted while something still holds it.
pub struct BufferManager {
    inner: Mutex<Inner>,
}

impl BufferManager {
    pub fn new(file_manager: FileManager, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                file_manager,
                frames: Vec::with_capacity(capacity),
                page_table: HashMap::new(),
                clock_hand: 0,
                capacity,
            }),
        })
    }

    pub fn open_file(&self, path: impl AsRef<std::path::Path>) -> StorageResult<u32> {
        self.inner.lock().unwrap().file_manager.open_file(path)
    }

    /// Number of pages actually allocated in `file_id` -- the bound a
    /// caller must use to enumerate real pages, since `fetch` on an
    /// unallocated page number now succeeds with a zero-filled buffer
    /// rather than erroring.
    pub fn page_count(&self, file_id: u32) -> StorageResult<u32> {
        self.inner.lock().unwrap().file_manager.page_count(file_id)
    }

    pub fn allocate_page(self: &Arc<Self>, file_id: u32) -> StorageResult<PageGuard> {
        let id = {
            let mut inner = self.inner.lock().unwrap();
            inner.file_manager.allocate(file_id)?
        };
        self.fetch(id)
    }

    pub fn deallocate_page(&self, id: PageID) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(frame_idx) = inner.page_table.remove(&id) {
            inner.frames[frame_idx].pin_count = 0;
        }
        inner.file_manager.deallocate(id)
    }

    /// Pin `id` into the pool, fetching it from disk on a miss, and
    /// return a guard that unpins automatically on drop.
    pub fn fetch(self: &Arc<Self>, id: PageID) -> StorageResult<PageGuard> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(&frame_idx) = inner.page_table.get(&id) {
            let frame = &mut inner.frames[frame_idx];
            frame.pin_count += 1;
            frame.referenced = true;
            let page = frame.page.clone();
            trace!("buffer hit for {:?} (frame {})", id, frame_idx);
            return Ok(PageGuard {
                pool: self.clone(),
                frame_idx,
                id,
                page,
            });
        }

        let frame_idx = Self::find_frame(&mut inner)?;
        let page_data = inner.file_manager.read_page(id)?;
        trace!("buffer miss for {:?}, loaded into frame {}", id, frame_idx);

        let page = Arc::new(RwLock::new(page_data));
        let frame = Frame {
            page: page.clone(),
            dirty: false,
            pin_count: 1,
            referenced: true,
        };

        if frame_idx == inner.frames.len() {
            inner.frames.push(frame);
        } else {
            inner.frames[frame_idx] = frame;
        }
        inner.page_table.insert(id, frame_idx);

        Ok(PageGuard {
            pool: self.clone(),
            frame_idx,
            id,
            page,
        })
    }

    /// Run the CLOCK sweep to find a frame to use, growing the pool
    /// while it has not yet reached capacity. Returns `Fatal` if every
    /// frame is pinned.
    fn find_frame(inner: &mut Inner) -> StorageResult<usize> {
        if inner.frames.len() < inner.capacity {
            return Ok(inner.frames.len());
        }

        let n = inner.frames.len();
        for _ in 0..(2 * n) {
            let hand = inner.clock_hand;
            inner.clock_hand = (inner.clock_hand + 1) % n;

            if inner.frames[hand].pin_count > 0 {
                continue;
            }

            if inner.frames[hand].referenced {
                inner.frames[hand].referenced = false;
                continue;
            }

            Self::evict(inner, hand)?;
            return Ok(hand);
        }

        Err(SmallError::with_kind(
            ErrorKind::Fatal,
            "buffer pool exhausted: no unpinned frame available for eviction",
        ))
    }

    fn evict(inner: &mut Inner, frame_idx: usize) -> StorageResult<()> {
        let evicted_id = inner
            .page_table
            .iter()
            .find(|(_, &idx)| idx == frame_idx)
            .map(|(id, _)| *id);

        if inner.frames[frame_idx].dirty {
            let page = inner.frames[frame_idx].page.read().unwrap();
            inner.file_manager.write_page(&page)?;
        }

        if let Some(id) = evicted_id {
            debug!("evicted {:?} from frame {}", id, frame_idx);
            inner.page_table.remove(&id);
        }

        Ok(())
    }

    fn unpin(&self, frame_idx: usize, id: PageID) {
        let mut inner = self.inner.lock().unwrap();
        if inner.page_table.get(&id) == Some(&frame_idx) {
            let frame = &mut inner.frames[frame_idx];
            if frame.pin_count > 0 {
                frame.pin_count -= 1;
            }
        }
    }

    fn mark_dirty(&self, frame_idx: usize, id: PageID) {
        let mut inner = self.inner.lock().unwrap();
        if inner.page_table.get(&id) == Some(&frame_idx) {
            inner.frames[frame_idx].dirty = true;
        }
    }

    /// Flush every dirty frame to disk. Used at commit time (force
    /// policy) and before a checkpoint.
    pub fn flush_all(&self) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let ids: Vec<PageID> = inner.page_table.keys().cloned().collect();
        for id in ids {
            let frame_idx = inner.page_table[&id];
            if inner.frames[frame_idx].dirty {
                let page = inner.frames[frame_idx].page.read().unwrap();
                inner.file_manager.write_page(&page)?;
                drop(page);
                inner.frames[frame_idx].dirty = false;
            }
        }
        Ok(())
    }

    pub fn flush_page(&self, id: PageID) -> StorageResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&frame_idx) = inner.page_table.get(&id) {
            if inner.frames[frame_idx].dirty {
                let page = inner.frames[frame_idx].page.read().unwrap();
                inner.file_manager.write_page(&page)?;
                drop(page);
                inner.frames[frame_idx].dirty = false;
            }
        }
        Ok(())
    }

    /// Drop a page from the pool without writing it back, used during
    /// undo recovery when a page's pre-image must win over whatever is
    /// cached.
    pub fn discard(&self, id: PageID) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(frame_idx) = inner.page_table.remove(&id) {
            inner.frames[frame_idx].dirty = false;
            inner.frames[frame_idx].pin_count = 0;
        }
    }
}

/// A scoped handle to a pinned page. Replaces the original's raw
/// pointer hand-out: the pin is released automatically when the guard
/// drops. Page contents are reached through `read`/`write`, each of
/// which locks the page's own `RwLock` independently of the pool-wide
/// latch -- so holding a `PageGuard` never blocks other pages' traffic.
pub struct PageGuard {
    pool: Arc<BufferManager>,
    frame_idx: usize,
    pub id: PageID,
    page: Arc<RwLock<Page>>,
}

impl PageGuard {
    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.page.read().unwrap()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        self.pool.mark_dirty(self.frame_idx, self.id);
        self.page.write().unwrap()
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        self.pool.unpin(self.frame_idx, self.id);
    }
}

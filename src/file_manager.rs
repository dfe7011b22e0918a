use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use log::debug;

use crate::{
    error::{ErrorKind, SmallError},
    page::{Page, PageID, PAGE_SIZE},
    types::StorageResult,
};

/// One open file plus the bookkeeping FileManager needs per file: its
/// current page count and the set of pages freed by `deallocate` that
/// `allocate` may reuse. The free list is not persisted across restart
/// (see the crate's design notes) -- a crash loses the reuse opportunity
/// for any page freed but not yet reallocated, it does not leak data.
struct OpenFile {
    handle: Mutex<File>,
    page_count: u32,
    free_list: Vec<u32>,
}

/// Owns every open file the engine touches (heap files and index
/// files), keyed by a small integer id assigned at `open_file` time.
/// Mirrors the original `FileManager`: one component responsible for
/// raw fixed-size page I/O, with no knowledge of what a page contains.
pub struct FileManager {
    files: HashMap<u32, OpenFile>,
    next_file_id: u32,
}

impl FileManager {
    pub fn new() -> Self {
        Self {
            files: HashMap::new(),
            next_file_id: 0,
        }
    }

    /// Open (creating if necessary) the file at `path`, returning the
    /// file id future calls use to address it.
    pub fn open_file(&mut self, path: impl AsRef<Path>) -> StorageResult<u32> {
        let path: PathBuf = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let handle = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let len = handle.metadata()?.len();
        let page_count = (len / PAGE_SIZE as u64) as u32;

        let file_id = self.next_file_id;
        self.next_file_id += 1;

        debug!(
            "opened file {:?} as id {}, {} pages",
            path, file_id, page_count
        );

        self.files.insert(
            file_id,
            OpenFile {
                handle: Mutex::new(handle),
                page_count,
                free_list: Vec::new(),
            },
        );

        Ok(file_id)
    }

    fn get_file(&self, file_id: u32) -> StorageResult<&OpenFile> {
        self.files.get(&file_id).ok_or_else(|| {
            SmallError::with_kind(
                ErrorKind::NotFound,
                &format!("no open file with id {}", file_id),
            )
        })
    }

    pub fn page_count(&self, file_id: u32) -> StorageResult<u32> {
        Ok(self.get_file(file_id)?.page_count)
    }

    /// Read the page at `page_no` of `file_id`. Reading beyond the
    /// current page count yields a zero-filled buffer rather than
    /// failing -- it does not extend the file or advance `page_count`,
    /// so a subsequent `allocate` can still assign that page number.
    pub fn read_page(&self, id: PageID) -> StorageResult<Page> {
        let file = self.get_file(id.file_id)?;
        if id.page_no >= file.page_count {
            return Ok(Page::new(id));
        }

        let mut handle = file.handle.lock().unwrap();
        handle.seek(SeekFrom::Start(offset_of(id.page_no)))?;

        let mut buf = [0u8; PAGE_SIZE];
        handle.read_exact(&mut buf)?;

        Ok(Page::from_bytes(id, &buf))
    }

    /// Force `page` to disk at its own page number.
    pub fn write_page(&self, page: &Page) -> StorageResult<()> {
        let file = self.get_file(page.id.file_id)?;

        let mut handle = file.handle.lock().unwrap();
        handle.seek(SeekFrom::Start(offset_of(page.id.page_no)))?;
        handle.write_all(page.bytes())?;
        handle.flush()?;

        Ok(())
    }

    /// Allocate a page, preferring a page from the free list before
    /// extending the file. The returned page is zero-filled.
    pub fn allocate(&mut self, file_id: u32) -> StorageResult<PageID> {
        let file = self.files.get_mut(&file_id).ok_or_else(|| {
            SmallError::with_kind(
                ErrorKind::NotFound,
                &format!("no open file with id {}", file_id),
            )
        })?;

        if let Some(page_no) = file.free_list.pop() {
            debug!("reused freed page {} of file {}", page_no, file_id);
            let id = PageID::new(file_id, page_no);
            drop(file);
            self.write_page(&Page::new(id))?;
            return Ok(id);
        }

        let page_no = file.page_count;
        file.page_count += 1;
        let id = PageID::new(file_id, page_no);

        let handle = file.handle.lock().unwrap();
        let zeroed = [0u8; PAGE_SIZE];
        let mut h = handle;
        h.seek(SeekFrom::Start(offset_of(page_no)))?;
        h.write_all(&zeroed)?;
        h.flush()?;
        drop(h);

        debug!("allocated new page {:?}", id);
        Ok(id)
    }

    /// Mark a page as free for reuse. The page's content is not
    /// scrubbed; a subsequent `allocate` that reuses it always
    /// zero-fills before handing it out.
    pub fn deallocate(&mut self, id: PageID) -> StorageResult<()> {
        let file = self.files.get_mut(&id.file_id).ok_or_else(|| {
            SmallError::with_kind(
                ErrorKind::NotFound,
                &format!("no open file with id {}", id.file_id),
            )
        })?;
        file.free_list.push(id.page_no);
        Ok(())
    }
}

fn offset_of(page_no: u32) -> u64 {
    page_no as u64 * PAGE_SIZE as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::init_log;
    use tempfile_shim::temp_path;

    mod tempfile_shim {
        use std::path::PathBuf;

        /// A throwaway path under the OS temp dir, unique per call.
        /// Avoids pulling in a `tempfile` dev-dependency for a handful
        /// of file-manager tests.
        pub fn temp_path(name: &str) -> PathBuf {
            let mut p = std::env::temp_dir();
            p.push(format!(
                "wren_db_test_{}_{}",
                name,
                std::process::id()
            ));
            p
        }
    }

    #[test]
    fn test_allocate_extends_file() {
        init_log();

        let path = temp_path("allocate_extends");
        let _ = std::fs::remove_file(&path);

        let mut fm = FileManager::new();
        let file_id = fm.open_file(&path).unwrap();
        assert_eq!(fm.page_count(file_id).unwrap(), 0);

        let p0 = fm.allocate(file_id).unwrap();
        let p1 = fm.allocate(file_id).unwrap();
        assert_eq!(p0.page_no, 0);
        assert_eq!(p1.page_no, 1);
        assert_eq!(fm.page_count(file_id).unwrap(), 2);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_deallocate_then_allocate_reuses_page() {
        init_log();

        let path = temp_path("reuse_page");
        let _ = std::fs::remove_file(&path);

        let mut fm = FileManager::new();
        let file_id = fm.open_file(&path).unwrap();

        let p0 = fm.allocate(file_id).unwrap();
        let p1 = fm.allocate(file_id).unwrap();
        fm.deallocate(p0).unwrap();

        let p2 = fm.allocate(file_id).unwrap();
        assert_eq!(p2.page_no, p0.page_no);
        assert_eq!(fm.page_count(file_id).unwrap(), 2);
        assert_ne!(p2.page_no, p1.page_no);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_write_then_read_round_trips() {
        init_log();

        let path = temp_path("round_trip");
        let _ = std::fs::remove_file(&path);

        let mut fm = FileManager::new();
        let file_id = fm.open_file(&path).unwrap();
        let id = fm.allocate(file_id).unwrap();

        let mut page = Page::new(id);
        page.bytes_mut()[0..5].copy_from_slice(b"hello");
        fm.write_page(&page).unwrap();

        let read_back = fm.read_page(id).unwrap();
        assert_eq!(&read_back.bytes()[0..5], b"hello");

        let _ = std::fs::remove_file(&path);
    }
}

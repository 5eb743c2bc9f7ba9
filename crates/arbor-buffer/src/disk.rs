//! Disk manager for page-level file I/O.

use arbor_common::page::{PageId, PAGE_SIZE};
use arbor_common::{ArborError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Configuration for the disk manager.
#[derive(Debug, Clone)]
pub struct DiskManagerConfig {
    /// Base directory for the data file.
    pub data_dir: PathBuf,
    /// Enable fsync after writes.
    pub fsync_enabled: bool,
}

impl Default for DiskManagerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            fsync_enabled: true,
        }
    }
}

impl From<&arbor_common::StorageConfig> for DiskManagerConfig {
    fn from(config: &arbor_common::StorageConfig) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            fsync_enabled: config.fsync_enabled,
        }
    }
}

/// Manages reading and writing pages to the data file.
///
/// All pages live in a single file; the byte offset of a page is
/// `page_id * PAGE_SIZE`. The file grows when a page beyond the current end
/// is written or allocated.
pub struct DiskManager {
    /// Configuration.
    config: DiskManagerConfig,
    /// The open data file plus its page count.
    inner: Mutex<FileInner>,
}

struct FileInner {
    file: File,
    num_pages: u32,
}

/// File name of the page data file inside the data directory.
const DATA_FILE_NAME: &str = "arbor.pages";

impl DiskManager {
    /// Creates a new disk manager, opening or creating the data file.
    pub fn new(config: DiskManagerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let path = config.data_dir.join(DATA_FILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let file_size = file.metadata()?.len();
        let num_pages = (file_size / PAGE_SIZE as u64) as u32;

        Ok(Self {
            config,
            inner: Mutex::new(FileInner { file, num_pages }),
        })
    }

    /// Returns the data directory path.
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Reads a page from disk.
    pub fn read_page(&self, page_id: PageId) -> Result<[u8; PAGE_SIZE]> {
        let mut inner = self.inner.lock();

        if page_id.as_u32() >= inner.num_pages {
            return Err(ArborError::PageNotFound { page_id });
        }

        let offset = (page_id.as_u32() as u64) * (PAGE_SIZE as u64);
        inner.file.seek(SeekFrom::Start(offset))?;

        let mut buffer = [0u8; PAGE_SIZE];
        inner.file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    /// Writes a page to disk, extending the file if needed.
    pub fn write_page(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
        let mut inner = self.inner.lock();

        let offset = (page_id.as_u32() as u64) * (PAGE_SIZE as u64);
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(data)?;

        if self.config.fsync_enabled {
            inner.file.sync_all()?;
        }

        if page_id.as_u32() >= inner.num_pages {
            inner.num_pages = page_id.as_u32() + 1;
        }

        Ok(())
    }

    /// Allocates a new zeroed page at the end of the file.
    ///
    /// Returns the PageId of the newly allocated page.
    pub fn allocate_page(&self) -> Result<PageId> {
        let mut inner = self.inner.lock();

        let page_id = PageId::new(inner.num_pages);
        let offset = (page_id.as_u32() as u64) * (PAGE_SIZE as u64);
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(&[0u8; PAGE_SIZE])?;

        if self.config.fsync_enabled {
            inner.file.sync_all()?;
        }

        inner.num_pages = page_id.as_u32() + 1;

        Ok(page_id)
    }

    /// Returns the number of pages in the data file.
    pub fn num_pages(&self) -> u32 {
        self.inner.lock().num_pages
    }

    /// Flushes all pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let _ = self.inner.lock().file.sync_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_disk_manager() -> (DiskManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = DiskManagerConfig {
            data_dir: dir.path().to_path_buf(),
            fsync_enabled: false,
        };
        let dm = DiskManager::new(config).unwrap();
        (dm, dir)
    }

    #[test]
    fn test_disk_manager_new() {
        let (dm, _dir) = create_test_disk_manager();
        assert!(dm.data_dir().exists());
        assert_eq!(dm.num_pages(), 0);
    }

    #[test]
    fn test_disk_manager_allocate_page() {
        let (dm, _dir) = create_test_disk_manager();

        let page1 = dm.allocate_page().unwrap();
        assert_eq!(page1, PageId::new(0));

        let page2 = dm.allocate_page().unwrap();
        assert_eq!(page2, PageId::new(1));

        assert_eq!(dm.num_pages(), 2);
    }

    #[test]
    fn test_disk_manager_write_read() {
        let (dm, _dir) = create_test_disk_manager();

        let page_id = dm.allocate_page().unwrap();

        let mut data = [0u8; PAGE_SIZE];
        data[0] = 0xAB;
        data[100] = 0xCD;
        data[PAGE_SIZE - 1] = 0xEF;
        dm.write_page(page_id, &data).unwrap();

        let read_data = dm.read_page(page_id).unwrap();
        assert_eq!(read_data[0], 0xAB);
        assert_eq!(read_data[100], 0xCD);
        assert_eq!(read_data[PAGE_SIZE - 1], 0xEF);
    }

    #[test]
    fn test_disk_manager_write_extends_file() {
        let (dm, _dir) = create_test_disk_manager();

        // Writing past the end extends the page count.
        let data = [0x11u8; PAGE_SIZE];
        dm.write_page(PageId::new(4), &data).unwrap();
        assert_eq!(dm.num_pages(), 5);

        assert_eq!(dm.read_page(PageId::new(4)).unwrap()[0], 0x11);
    }

    #[test]
    fn test_disk_manager_read_nonexistent_page() {
        let (dm, _dir) = create_test_disk_manager();

        dm.allocate_page().unwrap();

        let result = dm.read_page(PageId::new(99));
        assert!(matches!(result, Err(ArborError::PageNotFound { .. })));
    }

    #[test]
    fn test_disk_manager_overwrite_page() {
        let (dm, _dir) = create_test_disk_manager();

        let page_id = dm.allocate_page().unwrap();

        let mut data1 = [0u8; PAGE_SIZE];
        data1[0] = 0xAA;
        dm.write_page(page_id, &data1).unwrap();

        let mut data2 = [0u8; PAGE_SIZE];
        data2[0] = 0xBB;
        dm.write_page(page_id, &data2).unwrap();

        assert_eq!(dm.read_page(page_id).unwrap()[0], 0xBB);
    }

    #[test]
    fn test_disk_manager_persistence() {
        let dir = tempdir().unwrap();
        let page_id;

        {
            let config = DiskManagerConfig {
                data_dir: dir.path().to_path_buf(),
                fsync_enabled: true,
            };
            let dm = DiskManager::new(config).unwrap();
            page_id = dm.allocate_page().unwrap();

            let mut data = [0u8; PAGE_SIZE];
            data[0] = 0xFF;
            dm.write_page(page_id, &data).unwrap();
        }

        {
            let config = DiskManagerConfig {
                data_dir: dir.path().to_path_buf(),
                fsync_enabled: true,
            };
            let dm = DiskManager::new(config).unwrap();

            assert_eq!(dm.num_pages(), 1);
            assert_eq!(dm.read_page(page_id).unwrap()[0], 0xFF);
        }
    }

    #[test]
    fn test_disk_manager_sync() {
        let (dm, _dir) = create_test_disk_manager();
        dm.allocate_page().unwrap();
        dm.sync().unwrap();
    }
}

use std::fs::{create_dir_all, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::{failpoint, Page, PageId, PAGE_SIZE};

fn page_offset(page_id: PageId) -> u64 {
    page_id as u64 * PAGE_SIZE as u64
}

/// Disk adapter over a single database file. Page ids are dense and handed
/// out monotonically; a page that was allocated but never written reads
/// back zeroed, as does the tail of a file that ends mid-page.
pub struct Pager {
    file: File,
    next_page_id: PageId,
}

impl Pager {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            create_dir_all(dir)?;
        }
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        // Ids restart above whatever the file already holds, counting a
        // trailing partial page as occupied.
        let next_page_id = file.metadata()?.len().div_ceil(PAGE_SIZE as u64) as PageId;
        crate::granite_debug_log!(
            "[Pager::open] {path:?} opened, next page id {next_page_id}"
        );

        Ok(Self { file, next_page_id })
    }

    pub fn read_page(&mut self, page_id: PageId) -> io::Result<Page> {
        failpoint::maybe_fail("pager::read_page")?;

        let mut page = Page::new(page_id);
        let offset = page_offset(page_id);
        let file_len = self.file.metadata()?.len();
        if offset < file_len {
            let available = ((file_len - offset) as usize).min(PAGE_SIZE);
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.read_exact(&mut page.data[..available])?;
        }
        // Anything past the end of the file stays zero.
        Ok(page)
    }

    pub fn write_page(&mut self, page: &Page) -> io::Result<()> {
        failpoint::maybe_fail("pager::write_page")?;

        self.file.seek(SeekFrom::Start(page_offset(page.id)))?;
        self.file.write_all(&page.data)?;
        self.file.sync_all()?;
        self.next_page_id = self.next_page_id.max(page.id + 1);
        Ok(())
    }

    pub fn allocate_page(&mut self) -> io::Result<PageId> {
        let page_id = self.next_page_id;
        self.next_page_id += 1;
        crate::granite_debug_log!("[Pager::allocate_page] handing out page {page_id}");
        Ok(page_id)
    }

    /// Storage reclamation is out of scope; freed ids are simply retired.
    pub fn deallocate_page(&mut self, _page_id: PageId) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_persist_and_ids_resume_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pages.db");

        {
            let mut pager = Pager::open(&path).unwrap();
            assert_eq!(pager.allocate_page().unwrap(), 0);
            assert_eq!(pager.allocate_page().unwrap(), 1);

            let mut page = Page::new(1);
            page.data[7] = 0x7E;
            page.data[PAGE_SIZE - 1] = 0x7F;
            pager.write_page(&page).unwrap();
        }

        let mut pager = Pager::open(&path).unwrap();
        // Pages 0 and 1 occupy the file, so the next id is 2.
        assert_eq!(pager.allocate_page().unwrap(), 2);

        let page = pager.read_page(1).unwrap();
        assert_eq!(page.data[7], 0x7E);
        assert_eq!(page.data[PAGE_SIZE - 1], 0x7F);

        // Page 0 is a hole in the file and reads back zeroed.
        assert!(pager.read_page(0).unwrap().data.iter().all(|&b| b == 0));
    }

    #[test]
    fn unwritten_pages_read_zeroed() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("pages.db")).unwrap();

        let id = pager.allocate_page().unwrap();
        assert!(pager.read_page(id).unwrap().data.iter().all(|&b| b == 0));
        assert!(pager.read_page(12).unwrap().data.iter().all(|&b| b == 0));
    }

    #[test]
    fn failpoints_block_io() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("pages.db")).unwrap();

        {
            let _fp = failpoint::scoped("pager::write_page");
            assert!(pager.write_page(&Page::new(0)).is_err());
        }
        pager.write_page(&Page::new(0)).unwrap();

        {
            let _fp = failpoint::scoped("pager::read_page");
            assert!(pager.read_page(0).is_err());
        }
        assert!(pager.read_page(0).is_ok());
    }
}

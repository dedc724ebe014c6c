use crate::pages::{Page, PageID, PageNo, VolNo, NIL, PAGE_SIZE};
use crate::printdbg;
use anyhow::{anyhow, Context, Result};
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

pub const DISK_STORAGE: &str = "data/data/";

/// File holding the volume header: volume number, allocation frontier and
/// the catalog page id.
const VOLUME_HEADER: &str = "volume";

#[cfg(test)]
pub fn test_path() -> String {
    use uuid::Uuid;

    let id = Uuid::new_v4(); // Generate a unique UUID
    format!("data/test/test_{}/", id)
}

/// Raw disk manager for one volume: a directory with one file per train,
/// named by page number, plus a small volume header. Trains are written and
/// read whole.
#[derive(Debug)]
pub struct DiskManager {
    path: String,
    vol_no: VolNo,
    next_page_no: PageNo,
    catalog_page_no: PageNo,
}

impl DiskManager {
    /// Create a fresh volume directory and header. Page numbers start at 0.
    pub fn format(path: &str, vol_no: VolNo) -> Result<Self> {
        std::fs::create_dir_all(Path::new(path))?;

        let mut disk = Self {
            path: path.to_string(),
            vol_no,
            next_page_no: 0,
            catalog_page_no: NIL,
        };
        disk.write_header()?;

        Ok(disk)
    }

    /// Open an already formatted volume.
    pub fn mount(path: &str) -> Result<Self> {
        let header_path = Path::join(Path::new(path), VOLUME_HEADER);
        let mut file = OpenOptions::new()
            .read(true)
            .open(header_path)
            .context("volume header opened for reading")?;

        let mut buffer = [0u8; 12];
        file.read_exact(&mut buffer)?;

        Ok(Self {
            path: path.to_string(),
            vol_no: i32::from_le_bytes(buffer[0..4].try_into().unwrap()),
            next_page_no: i32::from_le_bytes(buffer[4..8].try_into().unwrap()),
            catalog_page_no: i32::from_le_bytes(buffer[8..12].try_into().unwrap()),
        })
    }

    fn write_header(&mut self) -> Result<()> {
        let mut buffer = [0u8; 12];
        buffer[0..4].copy_from_slice(&self.vol_no.to_le_bytes());
        buffer[4..8].copy_from_slice(&self.next_page_no.to_le_bytes());
        buffer[8..12].copy_from_slice(&self.catalog_page_no.to_le_bytes());

        let header_path = Path::join(Path::new(&self.path), VOLUME_HEADER);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(header_path)?;
        file.write_all(&buffer)?;

        Ok(())
    }

    pub fn vol_no(&self) -> VolNo {
        self.vol_no
    }

    pub fn catalog_page_no(&self) -> PageNo {
        self.catalog_page_no
    }

    /// Record where the catalog lives; persisted so `mount` finds it again.
    pub fn set_catalog_page_no(&mut self, page_no: PageNo) -> Result<()> {
        self.catalog_page_no = page_no;
        self.write_header()
    }

    fn train_path(&self, page_no: PageNo) -> PathBuf {
        Path::join(Path::new(&self.path), page_no.to_string())
    }

    /// Hand out the id of a fresh train of `train_size` pages. The frontier
    /// is persisted immediately so a remount never re-issues an id.
    pub fn alloc_train(&mut self, train_size: usize) -> Result<PageID> {
        let page_no = self.next_page_no;
        self.next_page_no += train_size as PageNo;
        self.write_header()?;

        printdbg!("Allocated train {} of {} page(s)", page_no, train_size);

        Ok(PageID::new(self.vol_no, page_no))
    }

    /// Return a destroyed train's backing file to the volume.
    pub fn dealloc_train(&mut self, pid: &PageID) -> Result<()> {
        let path = self.train_path(pid.page_no);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        printdbg!("Deallocated train {}", pid);
        Ok(())
    }

    pub fn write_train(&self, pid: &PageID, page: &Page) -> Result<()> {
        if pid.page_no == NIL {
            return Err(anyhow!("Asked to write a train with an invalid id"));
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false) // don't overwrite existing file
            .open(self.train_path(pid.page_no))?;

        file.write_all(page.as_bytes())
            .expect("train written successfully");

        Ok(())
    }

    pub fn read_train(&self, pid: &PageID, train_size: usize) -> Result<Page> {
        if pid.page_no == NIL {
            return Err(anyhow!("Asked to read a train with an invalid id"));
        }

        let mut file = OpenOptions::new()
            .read(true)
            .open(self.train_path(pid.page_no))
            .context("train opened for reading")?;

        let mut buffer = vec![0u8; train_size * PAGE_SIZE];
        file.read_exact(&mut buffer)
            .context("train read from disk")?;

        Ok(Page::from_bytes(&buffer))
    }
}

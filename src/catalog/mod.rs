use crate::buffer_pool::{ArcBufferPool, BufType, PageGuard};
use crate::errors::Error;
use crate::pages::slotted_page::{ObjectHeader, SlottedPage};
use crate::pages::{aligned_4, FileID, ObjectID, PageID, ShortPageID, NIL};
use anyhow::{bail, Result};

/// Object tags distinguishing catalog entry kinds.
pub const TAG_DATA_FILE: u16 = 1;
pub const TAG_BTREE_FILE: u16 = 2;

/// The catalog: one slotted page whose objects describe the volume's files.
/// Callers address files by the `ObjectID` of their catalog entry, exactly
/// like any other object.
pub struct Catalog {
    bpm: ArcBufferPool,
    page: PageID,
}

impl Catalog {
    /// Format-time setup: allocate the catalog page and remember it in the
    /// volume header.
    pub fn create(bpm: &ArcBufferPool) -> Result<Self> {
        let pid = bpm.lock().alloc_train(BufType::Page)?;
        {
            let mut guard = PageGuard::pin_new(bpm, pid, BufType::Page)?;
            let mut page = guard.slotted();
            page.init(
                pid,
                FileID {
                    vol_no: pid.vol_no,
                    file_no: pid.page_no,
                },
            );
            guard.set_dirty()?;
        }
        bpm.lock().disk_manager().set_catalog_page_no(pid.page_no)?;

        Ok(Self {
            bpm: bpm.clone(),
            page: pid,
        })
    }

    /// Open the catalog of a mounted volume.
    pub fn open(bpm: &ArcBufferPool) -> Result<Self> {
        let page = {
            let mut locked = bpm.lock();
            let page_no = locked.disk_manager().catalog_page_no();
            if page_no == NIL {
                bail!(Error::BadCatalogObject);
            }
            PageID::new(locked.vol_no(), page_no)
        };

        Ok(Self {
            bpm: bpm.clone(),
            page,
        })
    }

    /// Mint a data file: its first page is allocated, formatted and seeded
    /// into the widest available-space band; the returned `ObjectID` names
    /// the file's catalog entry.
    pub fn create_data_file(&self) -> Result<ObjectID> {
        let first = self.bpm.lock().alloc_train(BufType::Page)?;
        let fid = FileID {
            vol_no: first.vol_no,
            file_no: first.page_no,
        };

        {
            let mut guard = PageGuard::pin_new(&self.bpm, first, BufType::Page)?;
            guard.slotted().init(first, fid);
            guard.set_dirty()?;
        }

        let mut entry = DataFileEntry {
            fid,
            first_page: first.page_no,
            last_page: first.page_no,
            avail: [NIL; 5],
        };
        // an empty page has nearly the whole data region free
        entry.avail[4] = first.page_no;

        self.append_entry(TAG_DATA_FILE, &entry.encode())
    }

    /// Mint a b-tree file entry. The root page is allocated later, when the
    /// index is created.
    pub fn create_btree_file(&self) -> Result<ObjectID> {
        let entry = BtreeFileEntry {
            fid: FileID {
                vol_no: self.page.vol_no,
                file_no: NIL,
            },
            root_page: NIL,
        };
        self.append_entry(TAG_BTREE_FILE, &entry.encode())
    }

    fn append_entry(&self, tag: u16, data: &[u8]) -> Result<ObjectID> {
        let mut guard = PageGuard::pin(&self.bpm, self.page, BufType::Page)?;
        let mut page = guard.slotted();

        let hdr = ObjectHeader::new(tag, data.len() as u32);
        let offset = page.free() as u16;
        page.write_object(offset, hdr, data);

        let slot_no = page.nslots();
        let unique = page.next_unique();
        page.set_slot(slot_no, offset, unique);
        page.set_nslots(slot_no + 1);
        page.set_free(offset as usize + hdr.occupied());
        page.set_unused(page.unused() + aligned_4(data.len()) - data.len());

        guard.set_dirty()?;

        Ok(ObjectID::new(
            self.page.vol_no,
            self.page.page_no,
            slot_no as i16,
            unique,
        ))
    }
}

/// Pin the catalog page and return the entry payload for `oid` after
/// checking the slot, generation and tag.
fn read_entry(bpm: &ArcBufferPool, oid: &ObjectID, tag: u16) -> Result<Vec<u8>> {
    let mut guard = PageGuard::pin(bpm, oid.page_id(), BufType::Page)?;
    let page = guard.slotted();

    let data = entry_payload(&page, oid, tag)?.to_vec();
    Ok(data)
}

fn write_entry(bpm: &ArcBufferPool, oid: &ObjectID, tag: u16, data: &[u8]) -> Result<()> {
    let mut guard = PageGuard::pin(bpm, oid.page_id(), BufType::Page)?;
    let mut page = guard.slotted();

    // locate and validate before overwriting in place
    entry_payload(&page, oid, tag)?;
    let (offset, _) = page.slot(oid.slot_no as usize);
    let hdr = page.object_header(offset);
    if hdr.length as usize != data.len() {
        bail!(Error::BadCatalogObject);
    }
    page.write_object(offset, hdr, data);

    guard.set_dirty()
}

fn entry_payload<'a>(page: &'a SlottedPage, oid: &ObjectID, tag: u16) -> Result<&'a [u8]> {
    if oid.slot_no < 0 || oid.slot_no as usize >= page.nslots() {
        bail!(Error::BadCatalogObject);
    }
    let (offset, unique) = page.slot(oid.slot_no as usize);
    if offset == crate::pages::slotted_page::EMPTY_SLOT || unique != oid.unique {
        bail!(Error::BadCatalogObject);
    }
    if page.object_header(offset).tag != tag {
        bail!(Error::BadCatalogObject);
    }
    Ok(page.object_data(offset))
}

/// Catalog entry for a data file: the page list bounds and the five
/// available-space list heads, bucketed by free-space band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFileEntry {
    pub fid: FileID,
    pub first_page: ShortPageID,
    pub last_page: ShortPageID,
    /// `avail[0]` holds pages 10-20% free, ..., `avail[4]` pages >= 50%.
    pub avail: [ShortPageID; 5],
}

impl DataFileEntry {
    const SIZE: usize = 36;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.fid.vol_no.to_le_bytes());
        buf[4..8].copy_from_slice(&self.fid.file_no.to_le_bytes());
        buf[8..12].copy_from_slice(&self.first_page.to_le_bytes());
        buf[12..16].copy_from_slice(&self.last_page.to_le_bytes());
        for (i, head) in self.avail.iter().enumerate() {
            buf[16 + i * 4..20 + i * 4].copy_from_slice(&head.to_le_bytes());
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Self {
        let mut avail = [NIL; 5];
        for (i, head) in avail.iter_mut().enumerate() {
            *head = i32::from_le_bytes(bytes[16 + i * 4..20 + i * 4].try_into().unwrap());
        }
        Self {
            fid: FileID {
                vol_no: i32::from_le_bytes(bytes[0..4].try_into().unwrap()),
                file_no: i32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            },
            first_page: i32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            last_page: i32::from_le_bytes(bytes[12..16].try_into().unwrap()),
            avail,
        }
    }

    pub fn read(bpm: &ArcBufferPool, oid: &ObjectID) -> Result<Self> {
        Ok(Self::decode(&read_entry(bpm, oid, TAG_DATA_FILE)?))
    }

    pub fn write(&self, bpm: &ArcBufferPool, oid: &ObjectID) -> Result<()> {
        write_entry(bpm, oid, TAG_DATA_FILE, &self.encode())
    }
}

/// Catalog entry for a b-tree file: just the root page, which stays put for
/// the life of the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtreeFileEntry {
    pub fid: FileID,
    pub root_page: ShortPageID,
}

impl BtreeFileEntry {
    const SIZE: usize = 12;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.fid.vol_no.to_le_bytes());
        buf[4..8].copy_from_slice(&self.fid.file_no.to_le_bytes());
        buf[8..12].copy_from_slice(&self.root_page.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Self {
        Self {
            fid: FileID {
                vol_no: i32::from_le_bytes(bytes[0..4].try_into().unwrap()),
                file_no: i32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            },
            root_page: i32::from_le_bytes(bytes[8..12].try_into().unwrap()),
        }
    }

    pub fn read(bpm: &ArcBufferPool, oid: &ObjectID) -> Result<Self> {
        Ok(Self::decode(&read_entry(bpm, oid, TAG_BTREE_FILE)?))
    }

    pub fn write(&self, bpm: &ArcBufferPool, oid: &ObjectID) -> Result<()> {
        write_entry(bpm, oid, TAG_BTREE_FILE, &self.encode())
    }
}

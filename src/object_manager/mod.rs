use crate::buffer_pool::{ArcBufferPool, BufType, PageGuard};
use crate::catalog::DataFileEntry;
use crate::errors::Error;
use crate::pages::slotted_page::{
    ObjectHeader, SlottedPage, EMPTY_SLOT, LRGOBJ_THRESHOLD, OBJECT_HDR_SIZE, SLOT_SIZE,
};
use crate::pages::{aligned_4, ObjectID, PageID, NIL, PAGE_SIZE};
use crate::printdbg;
use anyhow::{bail, Result};

pub mod iterator;

/// Width of one available-space band: pages are bucketed by how many tenths
/// of a page they could still hold after compaction.
const BAND: usize = PAGE_SIZE / 10;

/// Which list a page with `total_free` reclaimable bytes belongs on; pages
/// under 10% free are on none.
fn avail_bucket(total_free: usize) -> Option<usize> {
    match total_free / BAND {
        0 => None,
        n @ 1..=4 => Some(n - 1),
        _ => Some(4),
    }
}

/// The smallest band that could satisfy `needed`, walking 50 -> 10 the way
/// the placement policy expects.
fn bucket_for_needed(needed: usize) -> usize {
    let mut bucket = 4;
    if needed < 5 * BAND {
        bucket = 3;
    }
    if needed < 4 * BAND {
        bucket = 2;
    }
    if needed < 3 * BAND {
        bucket = 1;
    }
    if needed < 2 * BAND {
        bucket = 0;
    }
    bucket
}

/// Manages variable-sized records in slotted data pages: creation with a
/// placement policy over the available-space lists, destruction with page
/// reclamation, and file-order iteration.
pub struct ObjectManager {
    bpm: ArcBufferPool,
    /// Pages emptied by destruction, waiting for [`reclaim`].
    ///
    /// [`reclaim`]: Self::reclaim
    dealloc_list: Vec<PageID>,
}

impl ObjectManager {
    pub fn new(bpm: ArcBufferPool) -> Self {
        Self {
            bpm,
            dealloc_list: Vec::new(),
        }
    }

    /// Create an object in the file described by the catalog entry `cat`,
    /// near `near` when given. Returns the new object's identifier.
    pub fn create_object(
        &self,
        cat: &ObjectID,
        near: Option<&ObjectID>,
        tag: u16,
        data: &[u8],
    ) -> Result<ObjectID> {
        if aligned_4(data.len()) > LRGOBJ_THRESHOLD {
            bail!(Error::UnsupportedObjectSize(data.len()));
        }

        self.create_object_at(cat, near, ObjectHeader::new(tag, data.len() as u32), data)
    }

    fn create_object_at(
        &self,
        cat: &ObjectID,
        near: Option<&ObjectID>,
        hdr: ObjectHeader,
        data: &[u8],
    ) -> Result<ObjectID> {
        let mut entry = DataFileEntry::read(&self.bpm, cat)?;
        let vol_no = entry.fid.vol_no;
        let aligned = aligned_4(data.len());
        let needed = OBJECT_HDR_SIZE + aligned + SLOT_SIZE;

        let (pid, mut guard) = self.choose_page(&mut entry, near, needed)?;
        let mut page = guard.slotted();

        let offset = page.free() as u16;
        page.write_object(offset, hdr, data);

        // reuse the first freed slot, else grow the slot array
        let nslots = page.nslots();
        let slot_no = (0..nslots)
            .find(|&i| page.slot_is_empty(i))
            .unwrap_or(nslots);
        let unique = page.next_unique();
        page.set_slot(slot_no, offset, unique);
        if slot_no == nslots {
            page.set_nslots(nslots + 1);
        }

        page.set_free(offset as usize + OBJECT_HDR_SIZE + aligned);
        // tail padding is counted as unused by convention; the arithmetic
        // downstream relies on it
        page.set_unused(page.unused() + aligned - data.len());

        self.put_in_avail(&mut entry, &pid, &mut page)?;
        guard.set_dirty()?;
        entry.write(&self.bpm, cat)?;

        printdbg!("Created object in page {pid}, slot {slot_no}");

        Ok(ObjectID::new(vol_no, pid.page_no, slot_no as i16, unique))
    }

    /// Placement policy: the near page if it fits, else the smallest
    /// available-space band that could fit, else the file's last page, else
    /// a freshly allocated page spliced into the file list.
    fn choose_page(
        &self,
        entry: &mut DataFileEntry,
        near: Option<&ObjectID>,
        needed: usize,
    ) -> Result<(PageID, PageGuard)> {
        let vol_no = entry.fid.vol_no;

        if let Some(near_oid) = near {
            let near_pid = PageID::new(near_oid.vol_no, near_oid.page_no);
            let mut guard = PageGuard::pin(&self.bpm, near_pid, BufType::Page)?;
            let mut page = guard.slotted();

            if page.total_free() >= needed {
                self.remove_from_avail(entry, &near_pid, &mut page)?;
                if page.contiguous_free() < needed {
                    page.compact(None);
                }
                return Ok((near_pid, guard));
            }

            drop(guard);
            return self.alloc_file_page(entry, Some(&near_pid));
        }

        let bucket = bucket_for_needed(needed);
        let head = entry.avail[bucket];
        if needed <= 5 * BAND && head != NIL {
            let pid = PageID::new(vol_no, head);
            let mut guard = PageGuard::pin(&self.bpm, pid, BufType::Page)?;
            let mut page = guard.slotted();

            // the band only guarantees its lower bound; fall through when
            // the head page is still too small
            if page.total_free() >= needed {
                self.remove_from_avail(entry, &pid, &mut page)?;
                if page.contiguous_free() < needed {
                    page.compact(None);
                }
                return Ok((pid, guard));
            }
        }

        if entry.last_page != NIL {
            let last_pid = PageID::new(vol_no, entry.last_page);
            let mut guard = PageGuard::pin(&self.bpm, last_pid, BufType::Page)?;
            let mut page = guard.slotted();

            if page.total_free() >= needed {
                self.remove_from_avail(entry, &last_pid, &mut page)?;
                if page.contiguous_free() < needed {
                    page.compact(None);
                }
                return Ok((last_pid, guard));
            }
        }

        self.alloc_file_page(entry, None)
    }

    /// Allocate and format a fresh page for the file, splicing it after
    /// `near` or at the tail of the page list.
    fn alloc_file_page(
        &self,
        entry: &mut DataFileEntry,
        near: Option<&PageID>,
    ) -> Result<(PageID, PageGuard)> {
        let pid = self.bpm.lock().alloc_train(BufType::Page)?;
        let mut guard = PageGuard::pin_new(&self.bpm, pid, BufType::Page)?;
        let mut page = guard.slotted();
        page.init(pid, entry.fid);

        self.file_map_add(entry, near, &pid, &mut page)?;

        Ok((pid, guard))
    }

    /// Payload of a live object; stale or out-of-range identifiers fail.
    pub fn read_object(&self, oid: &ObjectID) -> Result<Vec<u8>> {
        let mut guard = PageGuard::pin(&self.bpm, oid.page_id(), BufType::Page)?;
        let page = guard.slotted();
        let offset = check_oid(&page, oid)?;
        Ok(page.object_data(offset).to_vec())
    }

    /// Destroy an object: empty its slot, hand its bytes back to the page,
    /// and deallocate the page once no object is left on it.
    pub fn destroy_object(&mut self, cat: &ObjectID, oid: &ObjectID) -> Result<()> {
        let mut entry = DataFileEntry::read(&self.bpm, cat)?;
        let pid = oid.page_id();
        let mut guard = PageGuard::pin(&self.bpm, pid, BufType::Page)?;
        let mut page = guard.slotted();

        let offset = check_oid(&page, oid)?;
        let last = oid.slot_no as usize == page.nslots() - 1;

        self.remove_from_avail(&mut entry, &pid, &mut page)?;

        let occupied = page.object_header(offset).occupied();
        page.set_slot_empty(oid.slot_no as usize);

        let mut relinquished = occupied;
        if last {
            page.set_nslots(page.nslots() - 1);
            relinquished += SLOT_SIZE;
        }

        if offset as usize + occupied == page.free() {
            page.set_free(offset as usize);
        } else {
            page.set_unused(page.unused() + relinquished);
        }

        if page.free() == 0 {
            // no object left: unlink from the file and queue for reclamation
            self.file_map_delete(&mut entry, &pid, &mut page)?;
            self.dealloc_list.push(pid);
            printdbg!("Page {pid} emptied, queued for deallocation");
        } else {
            self.put_in_avail(&mut entry, &pid, &mut page)?;
        }

        guard.set_dirty()?;
        entry.write(&self.bpm, cat)?;
        Ok(())
    }

    /// Hand pages emptied by [`destroy_object`] back to the volume. Returns
    /// how many were reclaimed.
    ///
    /// [`destroy_object`]: Self::destroy_object
    pub fn reclaim(&mut self) -> Result<usize> {
        let count = self.dealloc_list.len();
        for pid in self.dealloc_list.drain(..) {
            self.bpm.lock().dealloc_train(&pid, BufType::Page)?;
        }
        Ok(count)
    }

    #[cfg(test)]
    pub fn dealloc_pending(&self) -> &[PageID] {
        &self.dealloc_list
    }

    /// First live object after `cur` in file order, or the file's first
    /// object when `cur` is `None`. `None` means end of scan.
    pub fn next_object(
        &self,
        cat: &ObjectID,
        cur: Option<&ObjectID>,
    ) -> Result<Option<(ObjectID, ObjectHeader)>> {
        let entry = DataFileEntry::read(&self.bpm, cat)?;
        let vol_no = entry.fid.vol_no;

        let (mut page_no, mut slot) = match cur {
            None => (entry.first_page, 0usize),
            Some(oid) => {
                if oid.slot_no < 0 {
                    bail!(Error::BadObjectId);
                }
                (oid.page_no, oid.slot_no as usize + 1)
            }
        };

        while page_no != NIL {
            let mut guard = PageGuard::pin(&self.bpm, PageID::new(vol_no, page_no), BufType::Page)?;
            let page = guard.slotted();

            for i in slot..page.nslots() {
                if !page.slot_is_empty(i) {
                    let (offset, unique) = page.slot(i);
                    return Ok(Some((
                        ObjectID::new(vol_no, page_no, i as i16, unique),
                        page.object_header(offset),
                    )));
                }
            }

            page_no = page.next_page();
            slot = 0;
        }

        Ok(None)
    }

    /// Mirror of [`next_object`], walking slots and pages backwards from
    /// `cur` (or from the file's last object).
    ///
    /// [`next_object`]: Self::next_object
    pub fn prev_object(
        &self,
        cat: &ObjectID,
        cur: Option<&ObjectID>,
    ) -> Result<Option<(ObjectID, ObjectHeader)>> {
        let entry = DataFileEntry::read(&self.bpm, cat)?;
        let vol_no = entry.fid.vol_no;

        let (mut page_no, mut slot) = match cur {
            None => (entry.last_page, None),
            Some(oid) => (oid.page_no, Some(oid.slot_no as i32 - 1)),
        };

        while page_no != NIL {
            let mut guard = PageGuard::pin(&self.bpm, PageID::new(vol_no, page_no), BufType::Page)?;
            let page = guard.slotted();

            let mut i = match slot {
                Some(s) => s.min(page.nslots() as i32 - 1),
                None => page.nslots() as i32 - 1,
            };
            while i >= 0 {
                let idx = i as usize;
                if !page.slot_is_empty(idx) {
                    let (offset, unique) = page.slot(idx);
                    return Ok(Some((
                        ObjectID::new(vol_no, page_no, idx as i16, unique),
                        page.object_header(offset),
                    )));
                }
                i -= 1;
            }

            page_no = page.prev_page();
            slot = None;
        }

        Ok(None)
    }

    /// Iterator over the file's live objects in page-list order.
    pub fn scan(&self, cat: &ObjectID) -> iterator::ObjectScan<'_> {
        iterator::ObjectScan::new(self, *cat)
    }

    // available-space list maintenance

    /// Unlink a page from whichever avail list holds it. A page on no list
    /// (full, or freshly allocated) is left alone.
    fn remove_from_avail(
        &self,
        entry: &mut DataFileEntry,
        pid: &PageID,
        page: &mut SlottedPage,
    ) -> Result<()> {
        let prev = page.avail_prev();
        let next = page.avail_next();

        if prev != NIL {
            let mut guard = PageGuard::pin(&self.bpm, PageID::new(pid.vol_no, prev), BufType::Page)?;
            guard.slotted().set_avail_next(next);
            guard.set_dirty()?;
        } else {
            match entry.avail.iter().position(|&head| head == pid.page_no) {
                Some(bucket) => entry.avail[bucket] = next,
                None => return Ok(()), // not on any list
            }
        }

        if next != NIL {
            let mut guard = PageGuard::pin(&self.bpm, PageID::new(pid.vol_no, next), BufType::Page)?;
            guard.slotted().set_avail_prev(prev);
            guard.set_dirty()?;
        }

        page.set_avail_prev(NIL);
        page.set_avail_next(NIL);
        Ok(())
    }

    /// Push a page onto the head of the list matching its free-space band.
    fn put_in_avail(
        &self,
        entry: &mut DataFileEntry,
        pid: &PageID,
        page: &mut SlottedPage,
    ) -> Result<()> {
        let Some(bucket) = avail_bucket(page.total_free()) else {
            return Ok(()); // too full for any list
        };

        let head = entry.avail[bucket];
        page.set_avail_prev(NIL);
        page.set_avail_next(head);
        if head != NIL {
            let mut guard = PageGuard::pin(&self.bpm, PageID::new(pid.vol_no, head), BufType::Page)?;
            guard.slotted().set_avail_prev(pid.page_no);
            guard.set_dirty()?;
        }
        entry.avail[bucket] = pid.page_no;
        Ok(())
    }

    // file page list maintenance

    fn file_map_add(
        &self,
        entry: &mut DataFileEntry,
        near: Option<&PageID>,
        pid: &PageID,
        page: &mut SlottedPage,
    ) -> Result<()> {
        match near {
            Some(near_pid) => {
                let mut guard = PageGuard::pin(&self.bpm, *near_pid, BufType::Page)?;
                let mut near_page = guard.slotted();
                let follow = near_page.next_page();
                near_page.set_next_page(pid.page_no);
                guard.set_dirty()?;

                page.set_prev_page(near_pid.page_no);
                page.set_next_page(follow);

                if follow != NIL {
                    let mut guard =
                        PageGuard::pin(&self.bpm, PageID::new(pid.vol_no, follow), BufType::Page)?;
                    guard.slotted().set_prev_page(pid.page_no);
                    guard.set_dirty()?;
                } else {
                    entry.last_page = pid.page_no;
                }
            }
            None => {
                let old_last = entry.last_page;
                page.set_prev_page(old_last);
                page.set_next_page(NIL);

                if old_last != NIL {
                    let mut guard =
                        PageGuard::pin(&self.bpm, PageID::new(pid.vol_no, old_last), BufType::Page)?;
                    guard.slotted().set_next_page(pid.page_no);
                    guard.set_dirty()?;
                } else {
                    entry.first_page = pid.page_no;
                }
                entry.last_page = pid.page_no;
            }
        }
        Ok(())
    }

    fn file_map_delete(
        &self,
        entry: &mut DataFileEntry,
        pid: &PageID,
        page: &mut SlottedPage,
    ) -> Result<()> {
        let prev = page.prev_page();
        let next = page.next_page();

        if prev != NIL {
            let mut guard = PageGuard::pin(&self.bpm, PageID::new(pid.vol_no, prev), BufType::Page)?;
            guard.slotted().set_next_page(next);
            guard.set_dirty()?;
        } else {
            entry.first_page = next;
        }

        if next != NIL {
            let mut guard = PageGuard::pin(&self.bpm, PageID::new(pid.vol_no, next), BufType::Page)?;
            guard.slotted().set_prev_page(prev);
            guard.set_dirty()?;
        } else {
            entry.last_page = prev;
        }

        page.set_prev_page(NIL);
        page.set_next_page(NIL);
        Ok(())
    }
}

fn check_oid(page: &SlottedPage, oid: &ObjectID) -> Result<u16> {
    if oid.slot_no < 0 || oid.slot_no as usize >= page.nslots() {
        bail!(Error::BadObjectId);
    }
    let (offset, unique) = page.slot(oid.slot_no as usize);
    if offset == EMPTY_SLOT || unique != oid.unique {
        bail!(Error::BadObjectId);
    }
    Ok(offset)
}

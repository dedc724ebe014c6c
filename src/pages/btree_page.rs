use super::{aligned_4, ObjectID, Page, PageID, ShortPageID, NIL, OBJECT_ID_SIZE, PAGE_SIZE};
use crate::btree::key::{key_compare, KeyDesc, KeyValue};
use crate::errors::Error;
use anyhow::{bail, Result};
use std::cmp::Ordering;

/// B+-tree page type bits. A page is INTERNAL or LEAF, optionally flagged as
/// the root on top.
pub const INTERNAL: u16 = 0x1;
pub const LEAF: u16 = 0x2;
pub const ROOT: u16 = 0x4;

/// Byte layout of a b-tree page:
///
/// ```text
/// pid(8) type(2) nSlots(2) free(2) unused(2) | variant fields | data ... slots
/// ```
///
/// Internal pages carry `p0(4)` (the leftmost child), leaves carry
/// `prevPage(4) nextPage(4)`. Slots are 2-byte offsets into the data region,
/// growing down from the page end. `free` and slot offsets are relative to
/// the variant's data start.
const OFF_PID_VOL: usize = 0;
const OFF_PID_PAGE: usize = 4;
const OFF_TYPE: usize = 8;
const OFF_NSLOTS: usize = 10;
const OFF_FREE: usize = 12;
const OFF_UNUSED: usize = 14;
const OFF_P0: usize = 16;
const OFF_PREV_PAGE: usize = 16;
const OFF_NEXT_PAGE: usize = 20;

pub const INTERNAL_DATA_START: usize = 20;
pub const LEAF_DATA_START: usize = 24;

pub const BTREE_SLOT_SIZE: usize = 2;

/// Length of a leaf entry: `nObjects(2) klen(2) kval[aligned] oid(12)`.
pub const fn leaf_entry_len(klen: usize) -> usize {
    2 + 2 + aligned_4(klen) + OBJECT_ID_SIZE
}

/// Length of an internal entry: `spid(4) klen(2) kval[klen]`, padded to 4.
pub const fn internal_entry_len(klen: usize) -> usize {
    4 + aligned_4(2 + klen)
}

/// Encode a leaf entry off-page, for redistribution during splits.
pub fn encode_leaf_entry(key: &KeyValue, oid: &ObjectID) -> Vec<u8> {
    let mut buf = vec![0u8; leaf_entry_len(key.len())];
    buf[0..2].copy_from_slice(&1u16.to_le_bytes());
    buf[2..4].copy_from_slice(&(key.len() as u16).to_le_bytes());
    buf[4..4 + key.len()].copy_from_slice(key.as_bytes());
    let at = 4 + aligned_4(key.len());
    buf[at..at + OBJECT_ID_SIZE].copy_from_slice(&oid.to_bytes());
    buf
}

/// Encode an internal entry off-page.
pub fn encode_internal_entry(spid: ShortPageID, key: &KeyValue) -> Vec<u8> {
    let mut buf = vec![0u8; internal_entry_len(key.len())];
    buf[0..4].copy_from_slice(&spid.to_le_bytes());
    buf[4..6].copy_from_slice(&(key.len() as u16).to_le_bytes());
    buf[6..6 + key.len()].copy_from_slice(key.as_bytes());
    buf
}

/// View over a pinned b-tree page. Holds a raw pointer into the buffer
/// frame, valid only while the pin that produced it is held.
pub struct BtreePage {
    ptr: *mut Page,
}

impl BtreePage {
    pub(crate) fn new(page: &mut Page) -> Self {
        Self { ptr: page }
    }

    fn page(&self) -> &Page {
        unsafe { &*self.ptr }
    }

    fn page_mut(&mut self) -> &mut Page {
        unsafe { &mut *self.ptr }
    }

    pub fn init_leaf(&mut self, pid: PageID, root: bool) {
        let page = self.page_mut();
        page.write_bytes(0, &[0u8; LEAF_DATA_START]);
        page.put_i32(OFF_PID_VOL, pid.vol_no);
        page.put_i32(OFF_PID_PAGE, pid.page_no);
        page.put_u16(OFF_TYPE, if root { LEAF | ROOT } else { LEAF });
        page.put_i32(OFF_PREV_PAGE, NIL);
        page.put_i32(OFF_NEXT_PAGE, NIL);
    }

    pub fn init_internal(&mut self, pid: PageID, root: bool) {
        let page = self.page_mut();
        page.write_bytes(0, &[0u8; INTERNAL_DATA_START]);
        page.put_i32(OFF_PID_VOL, pid.vol_no);
        page.put_i32(OFF_PID_PAGE, pid.page_no);
        page.put_u16(OFF_TYPE, if root { INTERNAL | ROOT } else { INTERNAL });
        page.put_i32(OFF_P0, NIL);
    }

    pub fn pid(&self) -> PageID {
        PageID::new(
            self.page().get_i32(OFF_PID_VOL),
            self.page().get_i32(OFF_PID_PAGE),
        )
    }

    pub fn set_pid(&mut self, pid: PageID) {
        self.page_mut().put_i32(OFF_PID_VOL, pid.vol_no);
        self.page_mut().put_i32(OFF_PID_PAGE, pid.page_no);
    }

    pub fn type_bits(&self) -> u16 {
        self.page().get_u16(OFF_TYPE)
    }

    pub fn set_type_bits(&mut self, bits: u16) {
        self.page_mut().put_u16(OFF_TYPE, bits);
    }

    pub fn is_leaf(&self) -> bool {
        self.type_bits() & LEAF != 0
    }

    pub fn is_internal(&self) -> bool {
        self.type_bits() & INTERNAL != 0
    }

    pub fn is_root(&self) -> bool {
        self.type_bits() & ROOT != 0
    }

    /// A page must be exactly one of internal or leaf; anything else is a
    /// corrupt type tag.
    pub fn check_type(&self) -> Result<()> {
        if self.is_leaf() == self.is_internal() {
            bail!(Error::BadBtreePage(self.type_bits()));
        }
        Ok(())
    }

    pub fn nslots(&self) -> usize {
        self.page().get_u16(OFF_NSLOTS) as usize
    }

    pub fn set_nslots(&mut self, n: usize) {
        self.page_mut().put_u16(OFF_NSLOTS, n as u16);
    }

    pub fn free(&self) -> usize {
        self.page().get_u16(OFF_FREE) as usize
    }

    pub fn set_free(&mut self, free: usize) {
        self.page_mut().put_u16(OFF_FREE, free as u16);
    }

    pub fn unused(&self) -> usize {
        self.page().get_u16(OFF_UNUSED) as usize
    }

    pub fn set_unused(&mut self, unused: usize) {
        self.page_mut().put_u16(OFF_UNUSED, unused as u16);
    }

    pub fn p0(&self) -> ShortPageID {
        self.page().get_i32(OFF_P0)
    }

    pub fn set_p0(&mut self, page_no: ShortPageID) {
        self.page_mut().put_i32(OFF_P0, page_no);
    }

    pub fn prev_page(&self) -> ShortPageID {
        self.page().get_i32(OFF_PREV_PAGE)
    }

    pub fn set_prev_page(&mut self, page_no: ShortPageID) {
        self.page_mut().put_i32(OFF_PREV_PAGE, page_no);
    }

    pub fn next_page(&self) -> ShortPageID {
        self.page().get_i32(OFF_NEXT_PAGE)
    }

    pub fn set_next_page(&mut self, page_no: ShortPageID) {
        self.page_mut().put_i32(OFF_NEXT_PAGE, page_no);
    }

    fn data_start(&self) -> usize {
        if self.is_leaf() {
            LEAF_DATA_START
        } else {
            INTERNAL_DATA_START
        }
    }

    fn data_size(&self) -> usize {
        PAGE_SIZE - self.data_start()
    }

    fn slot_pos(i: usize) -> usize {
        PAGE_SIZE - (i + 1) * BTREE_SLOT_SIZE
    }

    pub fn slot(&self, i: usize) -> u16 {
        self.page().get_u16(Self::slot_pos(i))
    }

    pub fn set_slot(&mut self, i: usize, offset: u16) {
        self.page_mut().put_u16(Self::slot_pos(i), offset);
    }

    /// Contiguous bytes between the append frontier and the slot array.
    pub fn contiguous_free(&self) -> usize {
        self.data_size() - self.free() - self.nslots() * BTREE_SLOT_SIZE
    }

    /// Contiguous free plus the bytes reclaimable by compaction.
    pub fn total_free(&self) -> usize {
        self.contiguous_free() + self.unused()
    }

    pub fn snapshot(&self) -> Page {
        self.page().clone()
    }

    // leaf entries

    fn leaf_base(&self, offset: u16) -> usize {
        LEAF_DATA_START + offset as usize
    }

    pub fn leaf_klen(&self, i: usize) -> usize {
        let base = self.leaf_base(self.slot(i));
        self.page().get_u16(base + 2) as usize
    }

    pub fn leaf_key(&self, i: usize) -> KeyValue {
        let base = self.leaf_base(self.slot(i));
        let klen = self.page().get_u16(base + 2) as usize;
        KeyValue::new(self.page().read_bytes(base + 4, base + 4 + klen).to_vec())
    }

    pub fn leaf_oid(&self, i: usize) -> ObjectID {
        let base = self.leaf_base(self.slot(i));
        let klen = self.page().get_u16(base + 2) as usize;
        let at = base + 4 + aligned_4(klen);
        ObjectID::from_bytes(self.page().read_bytes(at, at + OBJECT_ID_SIZE))
    }

    fn write_leaf_entry(&mut self, offset: u16, nobjects: u16, key: &KeyValue, oid: &ObjectID) {
        let base = self.leaf_base(offset);
        let klen = key.len();
        let page = self.page_mut();
        page.put_u16(base, nobjects);
        page.put_u16(base + 2, klen as u16);
        page.write_bytes(base + 4, key.as_bytes());
        page.write_bytes(base + 4 + aligned_4(klen), &oid.to_bytes());
    }

    // internal entries

    fn internal_base(&self, offset: u16) -> usize {
        INTERNAL_DATA_START + offset as usize
    }

    pub fn internal_spid(&self, i: usize) -> ShortPageID {
        self.page().get_i32(self.internal_base(self.slot(i)))
    }

    pub fn internal_klen(&self, i: usize) -> usize {
        let base = self.internal_base(self.slot(i));
        self.page().get_u16(base + 4) as usize
    }

    pub fn internal_key(&self, i: usize) -> KeyValue {
        let base = self.internal_base(self.slot(i));
        let klen = self.page().get_u16(base + 4) as usize;
        KeyValue::new(self.page().read_bytes(base + 6, base + 6 + klen).to_vec())
    }

    fn write_internal_entry(&mut self, offset: u16, spid: ShortPageID, key: &KeyValue) {
        let base = self.internal_base(offset);
        let page = self.page_mut();
        page.put_i32(base, spid);
        page.put_u16(base + 4, key.len() as u16);
        page.write_bytes(base + 6, key.as_bytes());
    }

    /// Give an entry's bytes back: roll the append frontier back when the
    /// entry sits at the tail, otherwise account them as reclaimable.
    pub fn reclaim_entry(&mut self, offset: u16, len: usize) {
        if offset as usize + len == self.free() {
            self.set_free(self.free() - len);
        } else {
            self.set_unused(self.unused() + len);
        }
    }

    /// Greatest slot whose key is less than or equal to `kval` (`-1` if every
    /// key is greater), plus whether that slot's key equals `kval`.
    pub fn binary_search_leaf(&self, kdesc: &KeyDesc, kval: &KeyValue) -> (bool, i32) {
        self.binary_search(kdesc, kval, |page, i| page.leaf_key(i))
    }

    pub fn binary_search_internal(&self, kdesc: &KeyDesc, kval: &KeyValue) -> (bool, i32) {
        self.binary_search(kdesc, kval, |page, i| page.internal_key(i))
    }

    fn binary_search(
        &self,
        kdesc: &KeyDesc,
        kval: &KeyValue,
        key_at: impl Fn(&Self, usize) -> KeyValue,
    ) -> (bool, i32) {
        let mut lo = 0i32;
        let mut hi = self.nslots() as i32 - 1;
        let mut idx = -1i32;
        let mut found = false;

        while lo <= hi {
            let mid = (lo + hi) / 2;
            let mid_key = key_at(self, mid as usize);
            match key_compare(kdesc, mid_key.as_bytes(), kval.as_bytes()) {
                Ordering::Greater => hi = mid - 1,
                ordering => {
                    idx = mid;
                    found = ordering == Ordering::Equal;
                    lo = mid + 1;
                }
            }
        }

        (found, idx)
    }

    /// Insert a leaf entry at slot `idx`, shifting later slots up. The caller
    /// has checked `total_free`; compaction runs here if the contiguous run
    /// is too short.
    pub fn insert_leaf_entry(&mut self, idx: usize, key: &KeyValue, oid: &ObjectID) {
        let entry_len = leaf_entry_len(key.len());
        if entry_len + BTREE_SLOT_SIZE > self.contiguous_free() {
            self.compact(None);
        }

        let offset = self.free() as u16;
        self.write_leaf_entry(offset, 1, key, oid);
        self.open_slot(idx, offset);
        self.set_free(offset as usize + entry_len);
    }

    /// Internal-page counterpart of [`insert_leaf_entry`].
    ///
    /// [`insert_leaf_entry`]: Self::insert_leaf_entry
    pub fn insert_internal_entry(&mut self, idx: usize, spid: ShortPageID, key: &KeyValue) {
        let entry_len = internal_entry_len(key.len());
        if entry_len + BTREE_SLOT_SIZE > self.contiguous_free() {
            self.compact(None);
        }

        let offset = self.free() as u16;
        self.write_internal_entry(offset, spid, key);
        self.open_slot(idx, offset);
        self.set_free(offset as usize + entry_len);
    }

    fn open_slot(&mut self, idx: usize, offset: u16) {
        let nslots = self.nslots();
        for i in (idx..nslots).rev() {
            let moved = self.slot(i);
            self.set_slot(i + 1, moved);
        }
        self.set_slot(idx, offset);
        self.set_nslots(nslots + 1);
    }

    pub fn entry_len_at(&self, i: usize) -> usize {
        if self.is_leaf() {
            leaf_entry_len(self.leaf_klen(i))
        } else {
            internal_entry_len(self.internal_klen(i))
        }
    }

    pub fn entry_bytes(&self, i: usize) -> &[u8] {
        let base = self.data_start() + self.slot(i) as usize;
        self.page().read_bytes(base, base + self.entry_len_at(i))
    }

    /// Append raw entry bytes at the frontier and give them the next slot.
    /// Used when redistributing entries during a split.
    pub fn append_entry_bytes(&mut self, bytes: &[u8]) {
        let offset = self.free();
        let start = self.data_start() + offset;
        let nslots = self.nslots();
        self.page_mut().write_bytes(start, bytes);
        self.set_slot(nslots, offset as u16);
        self.set_nslots(nslots + 1);
        self.set_free(offset + bytes.len());
    }

    /// Rewrite the data region so entries sit contiguously in slot order,
    /// optionally forcing one slot's entry to the end. Afterwards
    /// `unused == 0`.
    pub fn compact(&mut self, keep_last: Option<usize>) {
        let mut snapshot_raw = self.snapshot();
        let snapshot = BtreePage::new(&mut snapshot_raw);

        let mut new_free = 0usize;
        let mut relocate = |this: &mut Self, i: usize| {
            let bytes = snapshot.entry_bytes(i).to_vec();
            let start = this.data_start() + new_free;
            this.page_mut().write_bytes(start, &bytes);
            this.set_slot(i, new_free as u16);
            new_free += bytes.len();
        };

        for i in 0..self.nslots() {
            if keep_last == Some(i) {
                continue;
            }
            relocate(self, i);
        }
        if let Some(i) = keep_last {
            relocate(self, i);
        }

        self.set_free(new_free);
        self.set_unused(0);
    }
}

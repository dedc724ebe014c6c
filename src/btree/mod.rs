pub mod cursor;
pub mod key;

use crate::buffer_pool::{ArcBufferPool, BufType, PageGuard};
use crate::catalog::BtreeFileEntry;
use crate::errors::Error;
use crate::pages::btree_page::{
    internal_entry_len, leaf_entry_len, BtreePage, BTREE_SLOT_SIZE, LEAF, ROOT,
};
use crate::pages::{FileID, ObjectID, PageID, ShortPageID, NIL};
use crate::printdbg;
use anyhow::{anyhow, bail, Result};
use key::{KeyDesc, KeyValue};

/// Entry handed up to the parent when a page splits: the new right page and
/// the key separating it from its left sibling.
#[derive(Debug, Clone)]
pub struct InternalItem {
    pub spid: ShortPageID,
    pub key: KeyValue,
}

/// B+-tree index manager. Orders object identifiers by composite keys;
/// trees are addressed by their root page, which never moves.
pub struct BTreeManager {
    bpm: ArcBufferPool,
}

impl BTreeManager {
    pub fn new(bpm: ArcBufferPool) -> Self {
        Self { bpm }
    }

    pub(crate) fn bpm(&self) -> &ArcBufferPool {
        &self.bpm
    }

    /// Create an index for the b-tree file `cat`: one leaf page carrying the
    /// root flag. Its id stays valid across unlimited insertions.
    pub fn create_index(&self, cat: &ObjectID) -> Result<PageID> {
        let mut entry = BtreeFileEntry::read(&self.bpm, cat)?;

        let root = self.bpm.lock().alloc_train(BufType::Page)?;
        {
            let mut guard = PageGuard::pin_new(&self.bpm, root, BufType::Page)?;
            guard.btree().init_leaf(root, true);
            guard.set_dirty()?;
        }

        entry.fid = FileID {
            vol_no: root.vol_no,
            file_no: root.page_no,
        };
        entry.root_page = root.page_no;
        entry.write(&self.bpm, cat)?;

        Ok(root)
    }

    /// Insert `kval -> oid`. Splits propagate from the leaf upward; if the
    /// root itself splits, it is promoted in place so its id is preserved.
    pub fn insert(
        &self,
        cat: &ObjectID,
        root: &PageID,
        kdesc: &KeyDesc,
        kval: &KeyValue,
        oid: &ObjectID,
    ) -> Result<()> {
        if root.page_no == NIL {
            bail!(Error::BadParameter("null root"));
        }
        kdesc.check_supported()?;

        if let Some(item) = self.insert_rec(root, kdesc, kval, oid)? {
            self.root_insert(cat, root, &item)?;
        }
        Ok(())
    }

    /// Recursive descent: pick the child by binary search, insert below, and
    /// absorb a promoted entry on the way back up. Returns the entry this
    /// page promotes when it splits in turn.
    fn insert_rec(
        &self,
        pid: &PageID,
        kdesc: &KeyDesc,
        kval: &KeyValue,
        oid: &ObjectID,
    ) -> Result<Option<InternalItem>> {
        let mut guard = PageGuard::pin(&self.bpm, *pid, BufType::Page)?;
        let mut page = guard.btree();
        page.check_type()?;

        if page.is_internal() {
            let (_, idx) = page.binary_search_internal(kdesc, kval);
            let child_no = if idx == -1 {
                page.p0()
            } else {
                page.internal_spid(idx as usize)
            };
            let child = PageID::new(pid.vol_no, child_no);

            match self.insert_rec(&child, kdesc, kval, oid)? {
                None => Ok(None),
                Some(item) => {
                    let (_, idx) = page.binary_search_internal(kdesc, &item.key);
                    let promoted = self.insert_internal(pid, &mut page, &item, idx)?;
                    guard.set_dirty()?;
                    Ok(promoted)
                }
            }
        } else {
            let promoted = self.insert_leaf(pid, &mut page, kdesc, kval, oid)?;
            guard.set_dirty()?;
            Ok(promoted)
        }
    }

    fn insert_leaf(
        &self,
        pid: &PageID,
        page: &mut BtreePage,
        kdesc: &KeyDesc,
        kval: &KeyValue,
        oid: &ObjectID,
    ) -> Result<Option<InternalItem>> {
        let (found, idx) = page.binary_search_leaf(kdesc, kval);
        if found {
            bail!(Error::DuplicateKey);
        }

        if leaf_entry_len(kval.len()) + BTREE_SLOT_SIZE <= page.total_free() {
            page.insert_leaf_entry((idx + 1) as usize, kval, oid);
            Ok(None)
        } else {
            Ok(Some(self.split_leaf(pid, page, idx, kval, oid)?))
        }
    }

    fn insert_internal(
        &self,
        pid: &PageID,
        page: &mut BtreePage,
        item: &InternalItem,
        high: i32,
    ) -> Result<Option<InternalItem>> {
        if internal_entry_len(item.key.len()) + BTREE_SLOT_SIZE <= page.total_free() {
            page.insert_internal_entry((high + 1) as usize, item.spid, &item.key);
            Ok(None)
        } else {
            Ok(Some(self.split_internal(pid, page, high, item)?))
        }
    }

    /// Split a full leaf around the would-be position of the new entry
    /// (slot `high + 1`). The lower half keeps its bytes in place; moved
    /// entries are reclaimed one by one so the accounting matches an
    /// in-place shift. Returns the separator for the parent.
    fn split_leaf(
        &self,
        pid: &PageID,
        fpage: &mut BtreePage,
        high: i32,
        kval: &KeyValue,
        oid: &ObjectID,
    ) -> Result<InternalItem> {
        let new_pid = self.bpm.lock().alloc_train(BufType::Page)?;
        let mut nguard = PageGuard::pin_new(&self.bpm, new_pid, BufType::Page)?;
        let mut npage = nguard.btree();
        npage.init_leaf(new_pid, false);

        let mut tpage_raw = fpage.snapshot();
        let tpage = BtreePage::new(&mut tpage_raw);

        let max_loop = fpage.nslots() as i32 + 1;
        let half = max_loop / 2;
        let item_bytes = crate::pages::btree_page::encode_leaf_entry(kval, oid);

        let mut kept: Vec<u16> = Vec::new();
        for i in 0..max_loop {
            let src = (if i > high + 1 { i - 1 } else { i }) as usize;
            let from_item = i == high + 1;

            if i <= half {
                if !from_item {
                    kept.push(tpage.slot(src));
                }
            } else if from_item {
                npage.append_entry_bytes(&item_bytes);
            } else {
                let bytes = tpage.entry_bytes(src).to_vec();
                npage.append_entry_bytes(&bytes);
                fpage.reclaim_entry(tpage.slot(src), bytes.len());
            }
        }

        fpage.set_nslots(kept.len());
        for (i, offset) in kept.iter().enumerate() {
            fpage.set_slot(i, *offset);
        }
        if high + 1 <= half {
            fpage.insert_leaf_entry((high + 1) as usize, kval, oid);
        }

        // splice the new page into the sibling chain right after fpage
        let follow = fpage.next_page();
        npage.set_next_page(follow);
        npage.set_prev_page(pid.page_no);
        fpage.set_next_page(new_pid.page_no);
        if follow != NIL {
            let mut guard =
                PageGuard::pin(&self.bpm, PageID::new(pid.vol_no, follow), BufType::Page)?;
            guard.btree().set_prev_page(new_pid.page_no);
            guard.set_dirty()?;
        }

        let ritem = InternalItem {
            spid: new_pid.page_no,
            key: npage.leaf_key(0),
        };
        nguard.set_dirty()?;

        printdbg!("Leaf {pid} split, new right sibling {new_pid}");

        Ok(ritem)
    }

    /// Split a full internal page. The middle entry is promoted rather than
    /// copied: its key rises to the parent and its child pointer becomes the
    /// new page's `p0`, keeping every subtree reachable.
    fn split_internal(
        &self,
        pid: &PageID,
        fpage: &mut BtreePage,
        high: i32,
        item: &InternalItem,
    ) -> Result<InternalItem> {
        let new_pid = self.bpm.lock().alloc_train(BufType::Page)?;
        let mut nguard = PageGuard::pin_new(&self.bpm, new_pid, BufType::Page)?;
        let mut npage = nguard.btree();
        npage.init_internal(new_pid, false);

        let mut tpage_raw = fpage.snapshot();
        let tpage = BtreePage::new(&mut tpage_raw);

        let max_loop = fpage.nslots() as i32 + 1;
        let half = max_loop / 2;
        let item_bytes = crate::pages::btree_page::encode_internal_entry(item.spid, &item.key);

        let mut kept: Vec<u16> = Vec::new();
        let mut ritem: Option<InternalItem> = None;
        for i in 0..max_loop {
            let src = (if i > high + 1 { i - 1 } else { i }) as usize;
            let from_item = i == high + 1;

            if i <= half {
                if !from_item {
                    kept.push(tpage.slot(src));
                }
            } else if i == half + 1 {
                if from_item {
                    npage.set_p0(item.spid);
                    ritem = Some(InternalItem {
                        spid: new_pid.page_no,
                        key: item.key.clone(),
                    });
                } else {
                    npage.set_p0(tpage.internal_spid(src));
                    ritem = Some(InternalItem {
                        spid: new_pid.page_no,
                        key: tpage.internal_key(src),
                    });
                    fpage.reclaim_entry(tpage.slot(src), tpage.entry_len_at(src));
                }
            } else if from_item {
                npage.append_entry_bytes(&item_bytes);
            } else {
                let bytes = tpage.entry_bytes(src).to_vec();
                npage.append_entry_bytes(&bytes);
                fpage.reclaim_entry(tpage.slot(src), bytes.len());
            }
        }

        fpage.set_nslots(kept.len());
        for (i, offset) in kept.iter().enumerate() {
            fpage.set_slot(i, *offset);
        }
        if high + 1 <= half {
            fpage.insert_internal_entry((high + 1) as usize, item.spid, &item.key);
        }

        nguard.set_dirty()?;

        printdbg!("Internal {pid} split, new right page {new_pid}");

        ritem.ok_or_else(|| anyhow!("internal split of an underfull page"))
    }

    /// The root split: move its contents to a fresh page and reinitialize
    /// the original as a one-entry internal root, so the root's id never
    /// changes. If the displaced page is a leaf, its right sibling still
    /// points back at the root and is re-aimed.
    fn root_insert(&self, _cat: &ObjectID, root: &PageID, item: &InternalItem) -> Result<()> {
        let mut rguard = PageGuard::pin(&self.bpm, *root, BufType::Page)?;

        let new_pid = self.bpm.lock().alloc_train(BufType::Page)?;
        let mut nguard = PageGuard::pin_new(&self.bpm, new_pid, BufType::Page)?;

        nguard.page_mut().write_bytes(0, rguard.page().as_bytes());
        let mut npage = nguard.btree();
        npage.set_pid(new_pid);
        npage.set_type_bits(npage.type_bits() & !ROOT);

        let mut rpage = rguard.btree();
        rpage.init_internal(*root, true);
        rpage.set_p0(new_pid.page_no);
        rpage.insert_internal_entry(0, item.spid, &item.key);

        if npage.type_bits() & LEAF != 0 {
            let next = npage.next_page();
            if next != NIL {
                let mut guard =
                    PageGuard::pin(&self.bpm, PageID::new(root.vol_no, next), BufType::Page)?;
                guard.btree().set_prev_page(new_pid.page_no);
                guard.set_dirty()?;
            }
        }

        nguard.set_dirty()?;
        rguard.set_dirty()?;

        printdbg!("Root {root} promoted, old contents moved to {new_pid}");

        Ok(())
    }
}

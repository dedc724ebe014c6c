use super::key::{key_compare, KeyDesc, KeyValue};
use super::BTreeManager;
use crate::buffer_pool::{BufType, PageGuard};
use crate::errors::Error;
use crate::pages::btree_page::BtreePage;
use crate::pages::{ObjectID, PageID, NIL};
use anyhow::{bail, Result};
use std::cmp::Ordering;

/// Comparison operators for range scans. `Bof`/`Eof` position at the ends of
/// the index; the rest compare against a key value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompOp {
    Bof,
    Eof,
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompOp {
    /// Stable integer encoding for external callers.
    pub fn code(self) -> i32 {
        match self {
            CompOp::Bof => 0,
            CompOp::Eof => 1,
            CompOp::Eq => 2,
            CompOp::Lt => 3,
            CompOp::Le => 4,
            CompOp::Gt => 5,
            CompOp::Ge => 6,
        }
    }

    pub fn from_code(code: i32) -> Result<Self> {
        Ok(match code {
            0 => CompOp::Bof,
            1 => CompOp::Eof,
            2 => CompOp::Eq,
            3 => CompOp::Lt,
            4 => CompOp::Le,
            5 => CompOp::Gt,
            6 => CompOp::Ge,
            other => bail!(Error::BadCompOp(other)),
        })
    }

    /// Scan direction implied by a stop operator: upper bounds walk forward,
    /// lower bounds backward.
    fn forward(self) -> bool {
        matches!(self, CompOp::Eq | CompOp::Lt | CompOp::Le | CompOp::Eof)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorFlag {
    /// Not produced by a fetch; unusable.
    Invalid,
    /// Points at a live index entry.
    On,
    /// End of scan; terminal.
    Eos,
}

/// A position in a range scan: the leaf and slot of the entry last seen,
/// plus its key and object identifier.
#[derive(Debug, Clone)]
pub struct BtreeCursor {
    pub flag: CursorFlag,
    pub leaf: PageID,
    pub slot_no: i32,
    pub key: KeyValue,
    pub oid: ObjectID,
}

impl BtreeCursor {
    fn eos() -> Self {
        Self {
            flag: CursorFlag::Eos,
            leaf: PageID::new(NIL, NIL),
            slot_no: -1,
            key: KeyValue::new(Vec::new()),
            oid: ObjectID::new(NIL, NIL, -1, 0),
        }
    }
}

/// Does `key` satisfy the stop condition? `Bof`/`Eof` stop operators mean
/// "no bound".
fn stop_satisfied(
    kdesc: &KeyDesc,
    key: &KeyValue,
    stop_kval: Option<&KeyValue>,
    stop_op: CompOp,
) -> Result<bool> {
    let stop = match stop_op {
        CompOp::Bof | CompOp::Eof => return Ok(true),
        _ => stop_kval.ok_or(Error::BadParameter("missing stop key"))?,
    };

    let cmp = key_compare(kdesc, key.as_bytes(), stop.as_bytes());
    Ok(match stop_op {
        CompOp::Eq => cmp == Ordering::Equal,
        CompOp::Lt => cmp == Ordering::Less,
        CompOp::Le => cmp != Ordering::Greater,
        CompOp::Gt => cmp == Ordering::Greater,
        CompOp::Ge => cmp != Ordering::Less,
        CompOp::Bof | CompOp::Eof => true,
    })
}

impl BTreeManager {
    /// Position a cursor on the first entry satisfying the start condition,
    /// then test it against the stop condition. `CURSOR_EOS` means no entry
    /// qualifies.
    pub fn fetch(
        &self,
        root: &PageID,
        kdesc: &KeyDesc,
        start_kval: Option<&KeyValue>,
        start_op: CompOp,
        stop_kval: Option<&KeyValue>,
        stop_op: CompOp,
    ) -> Result<BtreeCursor> {
        if root.page_no == NIL {
            bail!(Error::BadParameter("null root"));
        }
        kdesc.check_supported()?;

        match start_op {
            CompOp::Bof => self.edge_object(root, kdesc, stop_kval, stop_op, true),
            CompOp::Eof => self.edge_object(root, kdesc, stop_kval, stop_op, false),
            _ => {
                let start = start_kval.ok_or(Error::BadParameter("missing start key"))?;
                self.fetch_from(root, kdesc, start, start_op, stop_kval, stop_op)
            }
        }
    }

    /// Step the cursor one entry in the direction the stop operator implies,
    /// crossing leaves through the sibling chain. The current leaf is
    /// trusted as-is; with one caller at a time it cannot have moved.
    pub fn fetch_next(
        &self,
        kdesc: &KeyDesc,
        stop_kval: Option<&KeyValue>,
        stop_op: CompOp,
        current: &BtreeCursor,
    ) -> Result<BtreeCursor> {
        match current.flag {
            CursorFlag::Invalid => bail!(Error::BadCursor),
            CursorFlag::Eos => return Ok(BtreeCursor::eos()),
            CursorFlag::On => {}
        }
        kdesc.check_supported()?;

        let mut pid = current.leaf;
        let mut guard = PageGuard::pin(self.bpm(), pid, BufType::Page)?;
        let mut page = guard.btree();
        page.check_type()?;

        let mut idx = if stop_op.forward() {
            current.slot_no + 1
        } else {
            current.slot_no - 1
        };

        if idx >= page.nslots() as i32 {
            let next = page.next_page();
            if next == NIL {
                return Ok(BtreeCursor::eos());
            }
            pid = PageID::new(pid.vol_no, next);
            guard = PageGuard::pin(self.bpm(), pid, BufType::Page)?;
            page = guard.btree();
            idx = 0;
        } else if idx < 0 {
            let prev = page.prev_page();
            if prev == NIL {
                return Ok(BtreeCursor::eos());
            }
            pid = PageID::new(pid.vol_no, prev);
            guard = PageGuard::pin(self.bpm(), pid, BufType::Page)?;
            page = guard.btree();
            idx = page.nslots() as i32 - 1;
        }

        cursor_at(kdesc, &page, pid, idx as usize, stop_kval, stop_op)
    }

    /// Descend to the leftmost or rightmost leaf and take its first or last
    /// entry.
    fn edge_object(
        &self,
        root: &PageID,
        kdesc: &KeyDesc,
        stop_kval: Option<&KeyValue>,
        stop_op: CompOp,
        first: bool,
    ) -> Result<BtreeCursor> {
        let mut pid = *root;
        loop {
            let mut guard = PageGuard::pin(self.bpm(), pid, BufType::Page)?;
            let page = guard.btree();
            page.check_type()?;

            if page.is_leaf() {
                if page.nslots() == 0 {
                    return Ok(BtreeCursor::eos());
                }
                let slot = if first { 0 } else { page.nslots() - 1 };
                return cursor_at(kdesc, &page, pid, slot, stop_kval, stop_op);
            }

            let child = if first || page.nslots() == 0 {
                page.p0()
            } else {
                page.internal_spid(page.nslots() - 1)
            };
            pid = PageID::new(pid.vol_no, child);
        }
    }

    fn fetch_from(
        &self,
        root: &PageID,
        kdesc: &KeyDesc,
        start: &KeyValue,
        start_op: CompOp,
        stop_kval: Option<&KeyValue>,
        stop_op: CompOp,
    ) -> Result<BtreeCursor> {
        // descend by the separators; each level's pin is released as the
        // next is taken
        let mut pid = *root;
        let mut guard = PageGuard::pin(self.bpm(), pid, BufType::Page)?;
        loop {
            let page = guard.btree();
            page.check_type()?;
            if page.is_leaf() {
                break;
            }
            let (_, idx) = page.binary_search_internal(kdesc, start);
            let child = if idx == -1 {
                page.p0()
            } else {
                page.internal_spid(idx as usize)
            };
            pid = PageID::new(pid.vol_no, child);
            guard = PageGuard::pin(self.bpm(), pid, BufType::Page)?;
        }

        let page = guard.btree();
        let (found, mut idx) = page.binary_search_leaf(kdesc, start);
        match start_op {
            CompOp::Eq if !found => return Ok(BtreeCursor::eos()),
            CompOp::Lt if found => idx -= 1,
            CompOp::Gt => idx += 1,
            CompOp::Ge if !found => idx += 1,
            _ => {}
        }

        if idx < 0 {
            // every key here is past the start; the candidate is the
            // previous leaf's last entry
            let prev = page.prev_page();
            if prev == NIL {
                return Ok(BtreeCursor::eos());
            }
            pid = PageID::new(pid.vol_no, prev);
            guard = PageGuard::pin(self.bpm(), pid, BufType::Page)?;
            let page = guard.btree();
            let slot = page.nslots() - 1;
            return cursor_at(kdesc, &page, pid, slot, stop_kval, stop_op);
        }

        if idx >= page.nslots() as i32 {
            let next = page.next_page();
            if next == NIL {
                return Ok(BtreeCursor::eos());
            }
            pid = PageID::new(pid.vol_no, next);
            guard = PageGuard::pin(self.bpm(), pid, BufType::Page)?;
            let page = guard.btree();
            return cursor_at(kdesc, &page, pid, 0, stop_kval, stop_op);
        }

        cursor_at(kdesc, &page, pid, idx as usize, stop_kval, stop_op)
    }
}

fn cursor_at(
    kdesc: &KeyDesc,
    page: &BtreePage,
    leaf: PageID,
    slot: usize,
    stop_kval: Option<&KeyValue>,
    stop_op: CompOp,
) -> Result<BtreeCursor> {
    let key = page.leaf_key(slot);
    if !stop_satisfied(kdesc, &key, stop_kval, stop_op)? {
        return Ok(BtreeCursor::eos());
    }

    Ok(BtreeCursor {
        flag: CursorFlag::On,
        leaf,
        slot_no: slot as i32,
        oid: page.leaf_oid(slot),
        key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::tests::{insert_int, oid_for, test_btree};
    use anyhow::Result;

    fn kd() -> KeyDesc {
        KeyDesc::single_int()
    }

    fn k(v: i32) -> KeyValue {
        KeyValue::from_i32(v)
    }

    /// Drain a cursor into the visited keys, fetch_next until end of scan.
    fn drain(
        btm: &BTreeManager,
        mut cursor: BtreeCursor,
        stop_kval: Option<&KeyValue>,
        stop_op: CompOp,
    ) -> Result<Vec<i32>> {
        let mut keys = Vec::new();
        while cursor.flag == CursorFlag::On {
            keys.push(i32::from_le_bytes(cursor.key.as_bytes().try_into().unwrap()));
            cursor = btm.fetch_next(&kd(), stop_kval, stop_op, &cursor)?;
        }
        assert_eq!(cursor.flag, CursorFlag::Eos);
        Ok(keys)
    }

    #[test]
    fn test_exact_match_carries_the_object_id() -> Result<()> {
        let (_bpm, _catalog, btm, cat, root) = test_btree(16);
        for key in 1..=10 {
            insert_int(&btm, &cat, &root, key)?;
        }

        let cursor = btm.fetch(&root, &kd(), Some(&k(4)), CompOp::Eq, Some(&k(4)), CompOp::Eq)?;
        assert_eq!(cursor.flag, CursorFlag::On);
        assert_eq!(cursor.oid, oid_for(4));

        let missing = btm.fetch(&root, &kd(), Some(&k(99)), CompOp::Eq, Some(&k(99)), CompOp::Eq)?;
        assert_eq!(missing.flag, CursorFlag::Eos);
        Ok(())
    }

    #[test]
    fn test_range_scan_is_bounded_on_both_sides() -> Result<()> {
        let (_bpm, _catalog, btm, cat, root) = test_btree(16);
        for key in 1..=10 {
            insert_int(&btm, &cat, &root, key)?;
        }

        // start at the first key >= 3, stop once past 7
        let cursor = btm.fetch(&root, &kd(), Some(&k(3)), CompOp::Ge, Some(&k(7)), CompOp::Le)?;
        assert_eq!(drain(&btm, cursor, Some(&k(7)), CompOp::Le)?, vec![3, 4, 5, 6, 7]);
        Ok(())
    }

    #[test]
    fn test_full_scan_visits_every_key_once() -> Result<()> {
        let (_bpm, _catalog, btm, cat, root) = test_btree(32);
        // enough keys to split across several leaves
        for key in (1..=600).rev() {
            insert_int(&btm, &cat, &root, key)?;
        }

        let cursor = btm.fetch(&root, &kd(), None, CompOp::Bof, None, CompOp::Eof)?;
        assert_eq!(drain(&btm, cursor, None, CompOp::Eof)?, (1..=600).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn test_backward_scan_from_the_end() -> Result<()> {
        let (_bpm, _catalog, btm, cat, root) = test_btree(32);
        for key in 1..=400 {
            insert_int(&btm, &cat, &root, key)?;
        }

        // start at the last entry, walk down to the first key >= 395
        let cursor = btm.fetch(&root, &kd(), None, CompOp::Eof, Some(&k(395)), CompOp::Ge)?;
        assert_eq!(
            drain(&btm, cursor, Some(&k(395)), CompOp::Ge)?,
            vec![400, 399, 398, 397, 396, 395]
        );
        Ok(())
    }

    #[test]
    fn test_terminal_cursor_stays_terminal() -> Result<()> {
        let (_bpm, _catalog, btm, cat, root) = test_btree(16);
        for key in 1..=6 {
            insert_int(&btm, &cat, &root, key)?;
        }

        let mut cursor = btm.fetch(&root, &kd(), Some(&k(3)), CompOp::Ge, None, CompOp::Eof)?;
        assert_eq!(cursor.oid, oid_for(3));

        let mut seen = Vec::new();
        while cursor.flag == CursorFlag::On {
            seen.push(cursor.oid);
            cursor = btm.fetch_next(&kd(), None, CompOp::Eof, &cursor)?;
        }
        assert_eq!(seen, vec![oid_for(3), oid_for(4), oid_for(5), oid_for(6)]);
        assert_eq!(cursor.flag, CursorFlag::Eos);

        // a terminal cursor stays terminal
        let after = btm.fetch_next(&kd(), None, CompOp::Eof, &cursor)?;
        assert_eq!(after.flag, CursorFlag::Eos);
        Ok(())
    }

    #[test]
    fn test_fetch_next_crosses_a_split_boundary() -> Result<()> {
        let (bpm, _catalog, btm, cat, root) = test_btree(32);

        // enough ascending keys to split the leaf at least once
        for key in 1..=300 {
            insert_int(&btm, &cat, &root, key)?;
        }

        // the first key of the second leaf marks a split boundary
        let mut pid = root;
        loop {
            let mut guard = PageGuard::pin(&bpm, pid, BufType::Page)?;
            let page = guard.btree();
            if page.is_leaf() {
                break;
            }
            pid = PageID::new(pid.vol_no, page.p0());
        }
        let boundary = {
            let mut guard = PageGuard::pin(&bpm, pid, BufType::Page)?;
            let page = guard.btree();
            assert_ne!(page.next_page(), NIL, "300 keys must split the leaf");
            i32::from_le_bytes(
                page.leaf_key(page.nslots() - 1).as_bytes().try_into().unwrap(),
            ) + 1
        };

        // start below the boundary and walk across it to the end
        let start = boundary - 3;
        let mut cursor = btm.fetch(&root, &kd(), Some(&k(start)), CompOp::Ge, None, CompOp::Eof)?;
        let mut seen = Vec::new();
        let mut leaves = Vec::new();
        while cursor.flag == CursorFlag::On {
            let key = i32::from_le_bytes(cursor.key.as_bytes().try_into().unwrap());
            assert_eq!(cursor.oid, oid_for(key), "object id out of step at key {key}");
            if leaves.last() != Some(&cursor.leaf.page_no) {
                leaves.push(cursor.leaf.page_no);
            }
            seen.push(key);
            cursor = btm.fetch_next(&kd(), None, CompOp::Eof, &cursor)?;
        }

        // no gap or duplicate at the boundary, and more than one leaf visited
        assert_eq!(seen, (start..=300).collect::<Vec<_>>());
        assert!(leaves.len() >= 2);
        assert_eq!(leaves[0], pid.page_no);
        Ok(())
    }

    #[test]
    fn test_inequality_starts_land_between_keys() -> Result<()> {
        let (_bpm, _catalog, btm, cat, root) = test_btree(16);
        for key in [10, 20, 30, 40] {
            insert_int(&btm, &cat, &root, key)?;
        }

        let lt = btm.fetch(&root, &kd(), Some(&k(25)), CompOp::Lt, None, CompOp::Eof)?;
        assert_eq!(lt.oid, oid_for(20));

        let lt_exact = btm.fetch(&root, &kd(), Some(&k(20)), CompOp::Lt, None, CompOp::Eof)?;
        assert_eq!(lt_exact.oid, oid_for(10));

        let le = btm.fetch(&root, &kd(), Some(&k(25)), CompOp::Le, None, CompOp::Eof)?;
        assert_eq!(le.oid, oid_for(20));

        let gt = btm.fetch(&root, &kd(), Some(&k(20)), CompOp::Gt, None, CompOp::Bof)?;
        assert_eq!(gt.oid, oid_for(30));

        let ge = btm.fetch(&root, &kd(), Some(&k(25)), CompOp::Ge, None, CompOp::Bof)?;
        assert_eq!(ge.oid, oid_for(30));

        // off both ends
        let below = btm.fetch(&root, &kd(), Some(&k(5)), CompOp::Lt, None, CompOp::Eof)?;
        assert_eq!(below.flag, CursorFlag::Eos);
        let above = btm.fetch(&root, &kd(), Some(&k(45)), CompOp::Gt, None, CompOp::Bof)?;
        assert_eq!(above.flag, CursorFlag::Eos);
        Ok(())
    }

    #[test]
    fn test_start_position_crosses_leaf_boundaries() -> Result<()> {
        let (bpm, _catalog, btm, cat, root) = test_btree(32);
        for key in 1..=400 {
            insert_int(&btm, &cat, &root, key)?;
        }

        // find a leaf boundary: the first key of the second leaf
        let mut pid = root;
        loop {
            let mut guard = PageGuard::pin(&bpm, pid, BufType::Page)?;
            let page = guard.btree();
            if page.is_leaf() {
                break;
            }
            pid = PageID::new(pid.vol_no, page.p0());
        }
        let (first_of_second, last_of_first) = {
            let mut guard = PageGuard::pin(&bpm, pid, BufType::Page)?;
            let page = guard.btree();
            let last = i32::from_le_bytes(
                page.leaf_key(page.nslots() - 1).as_bytes().try_into().unwrap(),
            );
            (last + 1, last)
        };

        // Gt on the first leaf's last key must hop to the second leaf
        let cursor = btm.fetch(
            &root,
            &kd(),
            Some(&k(last_of_first)),
            CompOp::Gt,
            None,
            CompOp::Eof,
        )?;
        assert_eq!(cursor.oid, oid_for(first_of_second));

        // Lt on the second leaf's first key must hop back
        let cursor = btm.fetch(
            &root,
            &kd(),
            Some(&k(first_of_second)),
            CompOp::Lt,
            None,
            CompOp::Eof,
        )?;
        assert_eq!(cursor.oid, oid_for(last_of_first));
        Ok(())
    }

    #[test]
    fn test_stop_condition_rejects_first_candidate() -> Result<()> {
        let (_bpm, _catalog, btm, cat, root) = test_btree(16);
        for key in 1..=10 {
            insert_int(&btm, &cat, &root, key)?;
        }

        // the first key >= 8 is already past the stop bound 5
        let cursor = btm.fetch(&root, &kd(), Some(&k(8)), CompOp::Ge, Some(&k(5)), CompOp::Le)?;
        assert_eq!(cursor.flag, CursorFlag::Eos);
        Ok(())
    }

    #[test]
    fn test_empty_index_hits_end_of_scan() -> Result<()> {
        let (_bpm, _catalog, btm, _cat, root) = test_btree(8);

        let cursor = btm.fetch(&root, &kd(), None, CompOp::Bof, None, CompOp::Eof)?;
        assert_eq!(cursor.flag, CursorFlag::Eos);

        let eq = btm.fetch(&root, &kd(), Some(&k(1)), CompOp::Eq, Some(&k(1)), CompOp::Eq)?;
        assert_eq!(eq.flag, CursorFlag::Eos);
        Ok(())
    }

    #[test]
    fn test_invalid_cursor_is_rejected() {
        let (_bpm, _catalog, btm, _cat, _root) = test_btree(8);

        let cursor = BtreeCursor {
            flag: CursorFlag::Invalid,
            ..BtreeCursor::eos()
        };
        let err = btm.fetch_next(&kd(), None, CompOp::Eof, &cursor).unwrap_err();
        assert_eq!(err.downcast::<Error>().unwrap(), Error::BadCursor);
    }

    #[test]
    fn test_index_over_stored_objects() -> Result<()> {
        use crate::object_manager::tests::test_object_manager;

        let (bpm, catalog, om) = test_object_manager(32);
        let data_cat = catalog.create_data_file()?;
        let index_cat = catalog.create_btree_file()?;
        let btm = BTreeManager::new(bpm.clone());
        let root = btm.create_index(&index_cat)?;

        for key in [5, 1, 4, 2, 3] {
            let payload = format!("record-{key}");
            let oid = om.create_object(&data_cat, None, 0, payload.as_bytes())?;
            btm.insert(&index_cat, &root, &kd(), &k(key), &oid)?;
        }

        // the cursor's object ids resolve to the stored payloads, in key order
        let mut cursor = btm.fetch(&root, &kd(), Some(&k(2)), CompOp::Ge, Some(&k(4)), CompOp::Le)?;
        let mut payloads = Vec::new();
        while cursor.flag == CursorFlag::On {
            payloads.push(String::from_utf8(om.read_object(&cursor.oid)?).unwrap());
            cursor = btm.fetch_next(&kd(), Some(&k(4)), CompOp::Le, &cursor)?;
        }
        assert_eq!(payloads, vec!["record-2", "record-3", "record-4"]);
        Ok(())
    }

    #[test]
    fn test_comp_op_codes_round_trip() {
        for code in 0..=6 {
            assert_eq!(CompOp::from_code(code).unwrap().code(), code);
        }
        let err = CompOp::from_code(7).unwrap_err();
        assert_eq!(err.downcast::<Error>().unwrap(), Error::BadCompOp(7));
    }
}

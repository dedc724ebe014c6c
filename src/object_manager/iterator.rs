use super::ObjectManager;
use crate::pages::slotted_page::ObjectHeader;
use crate::pages::ObjectID;

/// Forward scan over a file's live objects in page-list order. Each step
/// re-resolves the position from the last identifier, so slots destroyed
/// mid-scan are simply skipped.
pub struct ObjectScan<'a> {
    om: &'a ObjectManager,
    cat: ObjectID,
    cur: Option<ObjectID>,
    done: bool,
}

impl<'a> ObjectScan<'a> {
    pub(super) fn new(om: &'a ObjectManager, cat: ObjectID) -> Self {
        Self {
            om,
            cat,
            cur: None,
            done: false,
        }
    }
}

impl Iterator for ObjectScan<'_> {
    type Item = (ObjectID, ObjectHeader);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.om.next_object(&self.cat, self.cur.as_ref()).unwrap() {
            Some((oid, hdr)) => {
                self.cur = Some(oid);
                Some((oid, hdr))
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}

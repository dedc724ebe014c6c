use super::frame::Frame;
use crate::errors::Error;
use crate::pages::PageID;
use anyhow::{bail, Result};

/// Bucket / chain-link sentinel for "no frame".
pub const NOTFOUND_IN_HTABLE: i32 = -1;

/// Maps resident page ids to frame indices. Buckets hold the head frame's
/// index; collisions chain through each frame's `next_hash_entry` link, so
/// the table itself is just the bucket array.
pub struct FrameHashTable {
    buckets: Vec<i32>,
}

impl FrameHashTable {
    /// The table is sized strictly larger than the pool it serves.
    pub fn new(nbufs: usize) -> Self {
        Self {
            buckets: vec![NOTFOUND_IN_HTABLE; nbufs * 2 + 1],
        }
    }

    fn hash(&self, key: &PageID) -> usize {
        (key.vol_no + key.page_no).rem_euclid(self.buckets.len() as i32) as usize
    }

    /// Frame index holding `key`, or [`NOTFOUND_IN_HTABLE`].
    pub fn lookup(&self, key: &PageID, frames: &[Frame]) -> i32 {
        let mut i = self.buckets[self.hash(key)];
        while i != NOTFOUND_IN_HTABLE {
            let frame = &frames[i as usize];
            if frame.key() == *key {
                return i;
            }
            i = frame.next_hash_entry();
        }
        NOTFOUND_IN_HTABLE
    }

    /// Prepend `index` to its bucket's chain.
    pub fn insert(&mut self, key: &PageID, index: i32, frames: &mut [Frame]) -> Result<()> {
        if index < 0 || index as usize >= frames.len() {
            bail!(Error::BadBufferIndex(index));
        }

        let bucket = self.hash(key);
        frames[index as usize].set_next_hash_entry(self.buckets[bucket]);
        self.buckets[bucket] = index;

        Ok(())
    }

    /// Unlink the frame holding `key`, preserving the order of the rest of
    /// the chain.
    pub fn delete(&mut self, key: &PageID, frames: &mut [Frame]) -> Result<()> {
        let bucket = self.hash(key);
        let mut prev = NOTFOUND_IN_HTABLE;
        let mut i = self.buckets[bucket];

        while i != NOTFOUND_IN_HTABLE {
            if frames[i as usize].key() == *key {
                let next = frames[i as usize].next_hash_entry();
                if prev == NOTFOUND_IN_HTABLE {
                    self.buckets[bucket] = next;
                } else {
                    frames[prev as usize].set_next_hash_entry(next);
                }
                frames[i as usize].set_next_hash_entry(NOTFOUND_IN_HTABLE);
                return Ok(());
            }
            prev = i;
            i = frames[i as usize].next_hash_entry();
        }

        bail!(Error::FrameNotFound)
    }

    /// Empty every bucket.
    pub fn reset(&mut self) {
        self.buckets.fill(NOTFOUND_IN_HTABLE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pages::PageID;

    fn frames(n: usize) -> Vec<Frame> {
        (0..n).map(|_| Frame::new(1)).collect()
    }

    #[test]
    fn test_insert_lookup_delete() -> Result<()> {
        let mut table = FrameHashTable::new(4);
        let mut frames = frames(4);

        let a = PageID::new(0, 1);
        let b = PageID::new(0, 2);

        frames[0].set_key(a);
        frames[1].set_key(b);
        table.insert(&a, 0, &mut frames)?;
        table.insert(&b, 1, &mut frames)?;

        assert_eq!(table.lookup(&a, &frames), 0);
        assert_eq!(table.lookup(&b, &frames), 1);

        table.delete(&a, &mut frames)?;
        assert_eq!(table.lookup(&a, &frames), NOTFOUND_IN_HTABLE);
        assert_eq!(table.lookup(&b, &frames), 1);

        assert!(table.delete(&a, &mut frames).is_err());
        Ok(())
    }

    #[test]
    fn test_collision_chain_survives_middle_delete() -> Result<()> {
        // bucket count for a 1-frame... use 1 bucket worth of collisions:
        // keys (0, n) and (n+buckets, 0) share buckets when sums collide
        let mut table = FrameHashTable::new(2); // 5 buckets
        let mut frames = frames(3);

        let keys = [PageID::new(0, 0), PageID::new(0, 5), PageID::new(0, 10)];
        for (i, key) in keys.iter().enumerate() {
            frames[i].set_key(*key);
            table.insert(key, i as i32, &mut frames)?;
        }

        // all three hash to bucket 0; chain is 2 -> 1 -> 0
        table.delete(&keys[1], &mut frames)?;
        assert_eq!(table.lookup(&keys[0], &frames), 0);
        assert_eq!(table.lookup(&keys[2], &frames), 2);
        assert_eq!(frames[2].next_hash_entry(), 0);
        assert_eq!(table.lookup(&keys[1], &frames), NOTFOUND_IN_HTABLE);
        Ok(())
    }

    #[test]
    fn test_bad_index_is_rejected() {
        let mut table = FrameHashTable::new(2);
        let mut frames = frames(2);
        let key = PageID::new(0, 1);

        assert!(table.insert(&key, -1, &mut frames).is_err());
        assert!(table.insert(&key, 2, &mut frames).is_err());
    }

    #[test]
    fn test_reset_empties_every_bucket() -> Result<()> {
        let mut table = FrameHashTable::new(4);
        let mut frames = frames(4);

        for i in 0..4 {
            let key = PageID::new(0, i);
            frames[i as usize].set_key(key);
            table.insert(&key, i, &mut frames)?;
        }

        table.reset();
        for i in 0..4 {
            assert_eq!(table.lookup(&PageID::new(0, i), &frames), NOTFOUND_IN_HTABLE);
        }
        Ok(())
    }
}

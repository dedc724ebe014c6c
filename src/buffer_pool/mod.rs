mod frame;
mod hash_table;

use crate::config::StorageConfig;
use crate::disk_manager::DiskManager;
use crate::errors::Error;
#[cfg(debug_assertions)]
use crate::get_caller_name;
use crate::pages::btree_page::BtreePage;
use crate::pages::slotted_page::SlottedPage;
use crate::pages::{Page, PageID};
use crate::printdbg;
use anyhow::{bail, Result};
use frame::{Frame, DIRTY, REFER, VALID};
use hash_table::{FrameHashTable, NOTFOUND_IN_HTABLE};
use parking_lot::FairMutex;
use std::sync::Arc;

pub use hash_table::NOTFOUND_IN_HTABLE as NOTFOUND_FRAME;

/// Pages per train in the large-object leaf pool.
pub const LOT_LEAF_TRAIN_SIZE: usize = 4;

pub type ArcBufferPool = Arc<FairMutex<BufferPoolManager>>;

/// Which of the two pools a train lives in. Identifiers are shared between
/// pools; the type picks the train size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufType {
    Page,
    LotLeaf,
}

impl BufType {
    fn index(self) -> usize {
        match self {
            BufType::Page => 0,
            BufType::LotLeaf => 1,
        }
    }

    pub fn train_size(self) -> usize {
        match self {
            BufType::Page => 1,
            BufType::LotLeaf => LOT_LEAF_TRAIN_SIZE,
        }
    }
}

struct BufferPool {
    frames: Vec<Frame>,
    table: FrameHashTable,
    next_victim: usize,
    train_size: usize,
}

impl BufferPool {
    fn new(nbufs: usize, train_size: usize) -> Self {
        Self {
            frames: (0..nbufs).map(|_| Frame::new(train_size)).collect(),
            table: FrameHashTable::new(nbufs),
            next_victim: 0,
            train_size,
        }
    }
}

/// The process-wide page cache: one pool of single-page frames and one of
/// large-object leaf trains, each with a chained hash index and a
/// second-chance replacement clock. Every higher layer reads and writes
/// pages through here.
pub struct BufferPoolManager {
    disk_manager: DiskManager,
    pools: [BufferPool; 2],
    use_bulk_flush: bool,
}

impl BufferPoolManager {
    pub fn new(disk_manager: DiskManager, config: &StorageConfig) -> Self {
        Self {
            disk_manager,
            pools: [
                BufferPool::new(config.page_buf_frames, BufType::Page.train_size()),
                BufferPool::new(config.lot_leaf_frames, BufType::LotLeaf.train_size()),
            ],
            use_bulk_flush: config.use_bulk_flush,
        }
    }

    /// Mount the volume at `config.data_dir`, formatting it on first use.
    pub fn open(config: &StorageConfig, vol_no: i32) -> Result<Self> {
        let disk_manager = match DiskManager::mount(&config.data_dir) {
            Ok(disk_manager) => disk_manager,
            Err(_) => DiskManager::format(&config.data_dir, vol_no)?,
        };
        Ok(Self::new(disk_manager, config))
    }

    pub fn into_shared(self) -> ArcBufferPool {
        Arc::new(FairMutex::new(self))
    }

    pub fn vol_no(&self) -> i32 {
        self.disk_manager.vol_no()
    }

    pub fn disk_manager(&mut self) -> &mut DiskManager {
        &mut self.disk_manager
    }

    /// Pin `pid`, reading it from disk on a miss. Returns a pointer to the
    /// frame's bytes, valid until the matching [`free_train`].
    ///
    /// [`free_train`]: Self::free_train
    pub fn get_train(&mut self, pid: &PageID, buf: BufType) -> Result<*mut Page> {
        let pool = &self.pools[buf.index()];
        let found = pool.table.lookup(pid, &pool.frames);

        let index = if found != NOTFOUND_IN_HTABLE {
            found as usize
        } else {
            let victim = self.alloc_buffer(buf)?;
            let page = self.disk_manager.read_train(pid, buf.train_size())?;

            let pool = &mut self.pools[buf.index()];
            pool.frames[victim].set_page(page);
            pool.frames[victim].set_key(*pid);
            pool.frames[victim].set_bits(VALID);
            pool.table.insert(pid, victim as i32, &mut pool.frames)?;
            victim
        };

        let frame = &mut self.pools[buf.index()].frames[index];
        frame.pin();
        frame.set_bits(REFER);

        printdbg!(
            "{} fetched train {pid} (frame: {index}) with pin count {}",
            get_caller_name!(),
            frame.fixed()
        );

        Ok(frame.page_ptr())
    }

    /// Pin `pid` without reading from disk; the frame's contents start
    /// undefined. For pages that are about to be fully initialized.
    pub fn get_new_train(&mut self, pid: &PageID, buf: BufType) -> Result<*mut Page> {
        let pool = &self.pools[buf.index()];
        let found = pool.table.lookup(pid, &pool.frames);

        let index = if found != NOTFOUND_IN_HTABLE {
            found as usize
        } else {
            let victim = self.alloc_buffer(buf)?;
            let pool = &mut self.pools[buf.index()];
            pool.frames[victim].set_page(Page::new(pool.train_size));
            pool.frames[victim].set_key(*pid);
            pool.frames[victim].set_bits(VALID);
            pool.table.insert(pid, victim as i32, &mut pool.frames)?;
            victim
        };

        let frame = &mut self.pools[buf.index()].frames[index];
        frame.pin();
        frame.set_bits(REFER);

        printdbg!("Created train {pid} in frame {index}");

        Ok(frame.page_ptr())
    }

    /// Drop one pin. The caller must not touch the frame's bytes afterwards.
    pub fn free_train(&mut self, pid: &PageID, buf: BufType) -> Result<()> {
        let pool = &mut self.pools[buf.index()];
        let index = pool.table.lookup(pid, &pool.frames);
        if index == NOTFOUND_IN_HTABLE {
            bail!(Error::FrameNotFound);
        }

        let frame = &mut pool.frames[index as usize];
        if frame.fixed() == 0 {
            bail!(Error::FrameNotFound);
        }
        frame.unpin();

        printdbg!(
            "{} train {pid} (frame: {index}) unpinned, pin count: {}",
            get_caller_name!(),
            frame.fixed()
        );

        Ok(())
    }

    /// Mark a resident train as needing a write-back before eviction. The
    /// dirty bit, not the pin, is what guarantees durability.
    pub fn set_dirty(&mut self, pid: &PageID, buf: BufType) -> Result<()> {
        let pool = &mut self.pools[buf.index()];
        let index = pool.table.lookup(pid, &pool.frames);
        if index == NOTFOUND_IN_HTABLE {
            bail!(Error::FrameNotFound);
        }

        pool.frames[index as usize].set_bits(DIRTY);
        Ok(())
    }

    /// Write one resident train back to disk if it is dirty.
    pub fn flush_train(&mut self, pid: &PageID, buf: BufType) -> Result<()> {
        let pool = &mut self.pools[buf.index()];
        let index = pool.table.lookup(pid, &pool.frames);
        if index == NOTFOUND_IN_HTABLE {
            bail!(Error::FrameNotFound);
        }

        let frame = &mut pool.frames[index as usize];
        if frame.is_dirty() {
            self.disk_manager.write_train(&frame.key(), frame.page())?;
            frame.clear_bits(DIRTY);
        }
        Ok(())
    }

    /// Write every dirty frame of both pools back to disk.
    pub fn flush_all(&mut self) -> Result<()> {
        for pool in self.pools.iter_mut() {
            for frame in pool.frames.iter_mut().filter(|f| f.is_valid() && f.is_dirty()) {
                self.disk_manager.write_train(&frame.key(), frame.page())?;
                frame.clear_bits(DIRTY);
            }
        }
        Ok(())
    }

    /// Empty every hash bucket of both pools.
    pub fn delete_all(&mut self) {
        for pool in self.pools.iter_mut() {
            pool.table.reset();
            for frame in pool.frames.iter_mut() {
                frame.set_next_hash_entry(NOTFOUND_IN_HTABLE);
            }
        }
    }

    /// Flush and forget everything; the manager is reusable but cold.
    pub fn shutdown(&mut self) -> Result<()> {
        self.flush_all()?;
        self.delete_all();
        for pool in self.pools.iter_mut() {
            for frame in pool.frames.iter_mut() {
                frame.reset();
            }
        }
        Ok(())
    }

    /// Pick a victim frame with the second-chance clock: skip fixed frames,
    /// strip one REFER bit per pass, flush the victim if dirty, and give up
    /// after two sweeps (one to clear REFER bits, one to claim).
    fn alloc_buffer(&mut self, buf: BufType) -> Result<usize> {
        if self.use_bulk_flush {
            bail!(Error::UnsupportedBufferMode);
        }

        let pool = &mut self.pools[buf.index()];
        let nbufs = pool.frames.len();
        let mut victim = pool.next_victim;

        for _ in 0..2 * nbufs {
            let frame = &mut pool.frames[victim];

            if frame.fixed() > 0 {
                victim = (victim + 1) % nbufs;
                continue;
            }

            if frame.has_refer() {
                frame.clear_bits(REFER);
                victim = (victim + 1) % nbufs;
                continue;
            }

            if frame.is_valid() {
                let key = frame.key();
                printdbg!(
                    "Train {key} (frame: {victim}) chosen for eviction, is dirty: {}",
                    frame.is_dirty()
                );
                if frame.is_dirty() {
                    self.disk_manager.write_train(&key, frame.page())?;
                }
                pool.table.delete(&key, &mut pool.frames)?;
            }

            pool.frames[victim].reset();
            pool.next_victim = (victim + 1) % nbufs;
            return Ok(victim);
        }

        bail!(Error::NoUnfixedBuffer)
    }

    /// Allocate a fresh train id on the volume.
    pub fn alloc_train(&mut self, buf: BufType) -> Result<PageID> {
        self.disk_manager.alloc_train(buf.train_size())
    }

    /// Drop a destroyed train: discard its frame if resident, then return
    /// the backing file. The train must not be pinned.
    pub fn dealloc_train(&mut self, pid: &PageID, buf: BufType) -> Result<()> {
        let pool = &mut self.pools[buf.index()];
        let index = pool.table.lookup(pid, &pool.frames);
        if index != NOTFOUND_IN_HTABLE {
            if pool.frames[index as usize].fixed() > 0 {
                bail!(Error::BadParameter("deallocating a pinned train"));
            }
            pool.table.delete(pid, &mut pool.frames)?;
            pool.frames[index as usize].reset();
        }

        self.disk_manager.dealloc_train(pid)
    }

    #[cfg(test)]
    pub fn pin_count(&self, pid: &PageID, buf: BufType) -> Option<i32> {
        let pool = &self.pools[buf.index()];
        let index = pool.table.lookup(pid, &pool.frames);
        (index != NOTFOUND_IN_HTABLE).then(|| pool.frames[index as usize].fixed())
    }

    #[cfg(test)]
    pub fn is_resident(&self, pid: &PageID, buf: BufType) -> bool {
        let pool = &self.pools[buf.index()];
        pool.table.lookup(pid, &pool.frames) != NOTFOUND_IN_HTABLE
    }

    #[cfg(test)]
    pub fn next_victim(&self, buf: BufType) -> usize {
        self.pools[buf.index()].next_victim
    }

    #[cfg(test)]
    pub fn frame_index(&self, pid: &PageID, buf: BufType) -> i32 {
        let pool = &self.pools[buf.index()];
        pool.table.lookup(pid, &pool.frames)
    }
}

/// A scoped pin: holds one fix on a train and releases it on drop, on every
/// exit path. The raw page pointer stays valid for the guard's lifetime
/// because a fixed frame is never evicted.
pub struct PageGuard {
    bpm: ArcBufferPool,
    pid: PageID,
    buf: BufType,
    page: *mut Page,
}

impl PageGuard {
    pub fn pin(bpm: &ArcBufferPool, pid: PageID, buf: BufType) -> Result<Self> {
        let page = bpm.lock().get_train(&pid, buf)?;
        Ok(Self {
            bpm: bpm.clone(),
            pid,
            buf,
            page,
        })
    }

    pub fn pin_new(bpm: &ArcBufferPool, pid: PageID, buf: BufType) -> Result<Self> {
        let page = bpm.lock().get_new_train(&pid, buf)?;
        Ok(Self {
            bpm: bpm.clone(),
            pid,
            buf,
            page,
        })
    }

    pub fn pid(&self) -> PageID {
        self.pid
    }

    pub fn page(&self) -> &Page {
        unsafe { &*self.page }
    }

    pub fn page_mut(&mut self) -> &mut Page {
        unsafe { &mut *self.page }
    }

    /// View the pinned train as a slotted data page.
    pub fn slotted(&mut self) -> SlottedPage {
        SlottedPage::new(self.page_mut())
    }

    /// View the pinned train as a b-tree page.
    pub fn btree(&mut self) -> BtreePage {
        BtreePage::new(self.page_mut())
    }

    pub fn set_dirty(&self) -> Result<()> {
        self.bpm.lock().set_dirty(&self.pid, self.buf)
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        // a pin balance bug would surface as FrameNotFound here
        let _ = self.bpm.lock().free_train(&self.pid, self.buf);
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::disk_manager::test_path;
    use anyhow::Result;

    pub fn test_bpm(size: usize, path: &str) -> BufferPoolManager {
        let disk = DiskManager::format(path, 0).unwrap();
        let config = StorageConfig {
            data_dir: path.to_string(),
            page_buf_frames: size,
            lot_leaf_frames: size,
            use_bulk_flush: false,
        };
        BufferPoolManager::new(disk, &config)
    }

    pub fn test_arc_bpm(size: usize) -> ArcBufferPool {
        test_bpm(size, &test_path()).into_shared()
    }

    fn alloc_pinned(bpm: &mut BufferPoolManager) -> Result<PageID> {
        let pid = bpm.alloc_train(BufType::Page)?;
        bpm.get_new_train(&pid, BufType::Page)?;
        Ok(pid)
    }

    #[test]
    fn test_eviction_picks_the_only_unfixed_frame() -> Result<()> {
        let mut bpm = test_bpm(4, &test_path());

        let a = alloc_pinned(&mut bpm)?;
        let b = alloc_pinned(&mut bpm)?;
        let c = alloc_pinned(&mut bpm)?;
        let d = alloc_pinned(&mut bpm)?;

        let c_frame = bpm.frame_index(&c, BufType::Page);
        bpm.free_train(&c, BufType::Page)?;

        // e must land in c's frame, the only unfixed one
        let e = alloc_pinned(&mut bpm)?;

        assert!(!bpm.is_resident(&c, BufType::Page));
        assert!(bpm.is_resident(&e, BufType::Page));
        assert_eq!(bpm.frame_index(&e, BufType::Page), c_frame);
        assert_eq!(bpm.next_victim(BufType::Page), (c_frame as usize + 1) % 4);

        for pid in [a, b, d, e] {
            bpm.free_train(&pid, BufType::Page)?;
        }
        Ok(())
    }

    #[test]
    fn test_all_fixed_fails_after_two_sweeps() -> Result<()> {
        let mut bpm = test_bpm(2, &test_path());

        let a = alloc_pinned(&mut bpm)?;
        let b = alloc_pinned(&mut bpm)?;

        let err = bpm.alloc_train(BufType::Page).and_then(|pid| {
            bpm.get_new_train(&pid, BufType::Page)?;
            Ok(pid)
        });
        assert_eq!(
            err.unwrap_err().downcast::<Error>().unwrap(),
            Error::NoUnfixedBuffer
        );

        bpm.free_train(&a, BufType::Page)?;
        assert!(alloc_pinned(&mut bpm).is_ok());
        bpm.free_train(&b, BufType::Page)?;
        Ok(())
    }

    #[test]
    fn test_second_chance_clears_refer_before_evicting() -> Result<()> {
        let mut bpm = test_bpm(2, &test_path());

        let a = alloc_pinned(&mut bpm)?;
        let b = alloc_pinned(&mut bpm)?;
        bpm.free_train(&a, BufType::Page)?;
        bpm.free_train(&b, BufType::Page)?;

        // both frames carry REFER; the clock strips a's bit, then b's, then
        // claims a on the second sweep
        let c = alloc_pinned(&mut bpm)?;
        assert!(!bpm.is_resident(&a, BufType::Page));
        assert!(bpm.is_resident(&b, BufType::Page));

        bpm.free_train(&c, BufType::Page)?;
        Ok(())
    }

    #[test]
    fn test_dirty_page_survives_eviction() -> Result<()> {
        let mut bpm = test_bpm(1, &test_path());

        let pid = bpm.alloc_train(BufType::Page)?;
        let page = bpm.get_new_train(&pid, BufType::Page)?;
        unsafe { (*page).put_u32(64, 0xFEED) };
        bpm.set_dirty(&pid, BufType::Page)?;
        bpm.free_train(&pid, BufType::Page)?;

        // force the only frame to turn over
        let other = alloc_pinned(&mut bpm)?;
        bpm.free_train(&other, BufType::Page)?;
        assert!(!bpm.is_resident(&pid, BufType::Page));

        let page = bpm.get_train(&pid, BufType::Page)?;
        assert_eq!(unsafe { (*page).get_u32(64) }, 0xFEED);
        bpm.free_train(&pid, BufType::Page)?;
        Ok(())
    }

    #[test]
    fn test_bulk_flush_mode_is_refused() {
        let path = test_path();
        let disk = DiskManager::format(&path, 0).unwrap();
        let config = StorageConfig {
            data_dir: path,
            page_buf_frames: 2,
            lot_leaf_frames: 2,
            use_bulk_flush: true,
        };
        let mut bpm = BufferPoolManager::new(disk, &config);

        let pid = bpm.alloc_train(BufType::Page).unwrap();
        let err = bpm.get_new_train(&pid, BufType::Page).unwrap_err();
        assert_eq!(
            err.downcast::<Error>().unwrap(),
            Error::UnsupportedBufferMode
        );
    }

    #[test]
    fn test_free_unpinned_train_is_an_error() -> Result<()> {
        let mut bpm = test_bpm(2, &test_path());

        let pid = alloc_pinned(&mut bpm)?;
        bpm.free_train(&pid, BufType::Page)?;

        let err = bpm.free_train(&pid, BufType::Page).unwrap_err();
        assert_eq!(err.downcast::<Error>().unwrap(), Error::FrameNotFound);
        Ok(())
    }

    #[test]
    fn test_pools_are_independent() -> Result<()> {
        let mut bpm = test_bpm(2, &test_path());

        let pid = bpm.alloc_train(BufType::LotLeaf)?;
        let train = bpm.get_new_train(&pid, BufType::LotLeaf)?;
        assert_eq!(
            unsafe { (*train).len() },
            LOT_LEAF_TRAIN_SIZE * crate::pages::PAGE_SIZE
        );

        assert!(!bpm.is_resident(&pid, BufType::Page));
        bpm.free_train(&pid, BufType::LotLeaf)?;
        Ok(())
    }

    #[test]
    fn test_guard_unpins_on_drop() -> Result<()> {
        let bpm = test_arc_bpm(4);

        let pid = bpm.lock().alloc_train(BufType::Page)?;
        {
            let guard = PageGuard::pin_new(&bpm, pid, BufType::Page)?;
            assert_eq!(bpm.lock().pin_count(&guard.pid(), BufType::Page), Some(1));

            // aliased pins within one operation are fine
            let alias = PageGuard::pin(&bpm, pid, BufType::Page)?;
            assert_eq!(bpm.lock().pin_count(&alias.pid(), BufType::Page), Some(2));
        }
        assert_eq!(bpm.lock().pin_count(&pid, BufType::Page), Some(0));
        Ok(())
    }

    #[test]
    fn test_flush_all_clears_dirty_bits() -> Result<()> {
        let path = test_path();
        let mut bpm = test_bpm(2, &path);

        let pid = bpm.alloc_train(BufType::Page)?;
        let page = bpm.get_new_train(&pid, BufType::Page)?;
        unsafe { (*page).put_u32(0, 42) };
        bpm.set_dirty(&pid, BufType::Page)?;
        bpm.free_train(&pid, BufType::Page)?;

        bpm.flush_all()?;

        // the write made it to disk without an eviction
        let on_disk = bpm.disk_manager().read_train(&pid, 1)?;
        assert_eq!(on_disk.get_u32(0), 42);
        Ok(())
    }

    #[test]
    fn test_flush_train_writes_one_page() -> Result<()> {
        let mut bpm = test_bpm(4, &test_path());

        let pid = bpm.alloc_train(BufType::Page)?;
        let page = bpm.get_new_train(&pid, BufType::Page)?;
        unsafe { (*page).put_u32(16, 7) };
        bpm.set_dirty(&pid, BufType::Page)?;

        // flushing while still pinned is fine; the pin only blocks eviction
        bpm.flush_train(&pid, BufType::Page)?;
        assert_eq!(bpm.disk_manager().read_train(&pid, 1)?.get_u32(16), 7);

        bpm.free_train(&pid, BufType::Page)?;

        let absent = PageID::new(0, 9999);
        let err = bpm.flush_train(&absent, BufType::Page).unwrap_err();
        assert_eq!(err.downcast::<Error>().unwrap(), Error::FrameNotFound);
        Ok(())
    }

    #[test]
    fn test_open_formats_then_mounts() -> Result<()> {
        let config = StorageConfig {
            data_dir: test_path(),
            page_buf_frames: 2,
            lot_leaf_frames: 2,
            use_bulk_flush: false,
        };

        let pid = {
            let mut bpm = BufferPoolManager::open(&config, 5)?;
            let pid = bpm.alloc_train(BufType::Page)?;
            let page = bpm.get_new_train(&pid, BufType::Page)?;
            unsafe { (*page).put_u32(8, 11) };
            bpm.set_dirty(&pid, BufType::Page)?;
            bpm.free_train(&pid, BufType::Page)?;
            bpm.shutdown()?;
            pid
        };

        // a second open mounts the same volume and sees the flushed write
        let mut bpm = BufferPoolManager::open(&config, 0)?;
        assert_eq!(bpm.vol_no(), 5);
        let page = bpm.get_train(&pid, BufType::Page)?;
        assert_eq!(unsafe { (*page).get_u32(8) }, 11);
        bpm.free_train(&pid, BufType::Page)?;
        Ok(())
    }

    #[test]
    fn test_delete_all_forgets_residency() -> Result<()> {
        let mut bpm = test_bpm(4, &test_path());

        let a = alloc_pinned(&mut bpm)?;
        bpm.free_train(&a, BufType::Page)?;
        bpm.flush_all()?;
        bpm.delete_all();

        assert!(!bpm.is_resident(&a, BufType::Page));
        Ok(())
    }
}

//! The database: files, sessions, root publication, and the trie write
//! path.
//!
//! A database directory holds three files: `ids.db` (the object table),
//! `arena.db` (node bytes) and `root.db` (a single atomic root object id).
//! Read sessions resolve a retained snapshot of the root and traverse it
//! under a gc pin; the write path builds replacement subtrees copy-on-write
//! and publishes by swapping the root cell under the root-change mutex.

use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nix::fcntl::{flock, FlockArg};
use parking_lot::Mutex;
use typed_builder::TypedBuilder;

use marl::gc::{GcQueue, GcSession, SessionGuard};
use marl::mapping::Mapping;
use marl::object_db::{IdStats, ObjectDb};
use marl::region::{RegionAllocator, RegionStats};
use marl::{AccessMode, ObjectHeader, ObjectId, ObjectInfo, ObjectKind, PAGE_SIZE};

use crate::iter::TrieIter;
use crate::key::{common_prefix_len, to_key6};
use crate::node::{self, branch_bit, child_index, InnerRef, Node};
use crate::{DbError, Result};

#[derive(TypedBuilder)]
pub struct DbConfig {
    /// Initial arena region size; must be a multiple of the page size.
    /// Regions double (and halve in count) once all 64 slots are in use.
    #[builder(default = 64 * 1024 * 1024)]
    pub initial_region_size: u64,
    #[builder(default = false)]
    pub read_only: bool,
    /// Opt into opening a database whose id file still carries the
    /// gc-in-progress flag from an interrupted recovery.
    #[builder(default = false)]
    pub allow_gc_recovery: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig::builder().build()
    }
}

#[derive(Debug, Clone)]
pub struct DbStats {
    pub ids: IdStats,
    pub regions: RegionStats,
}

pub struct Database {
    gc: Arc<GcQueue>,
    pub(crate) objects: Arc<ObjectDb>,
    pub(crate) arena: RegionAllocator,
    root_file: Mapping,
    root_change: Mutex<()>,
    _dir_lock: std::fs::File,
    read_only: bool,
}

impl Database {
    /// Open (creating if needed) the database in `dir`. The directory is
    /// flocked, so two writing processes cannot share it.
    pub fn open(dir: impl AsRef<Path>, config: DbConfig) -> Result<Arc<Database>> {
        let dir = dir.as_ref();
        if config.initial_region_size == 0 || config.initial_region_size % PAGE_SIZE != 0 {
            return Err(DbError::InvalidConfig(
                "initial_region_size must be a positive multiple of the page size",
            ));
        }
        let mode = if config.read_only {
            AccessMode::ReadOnly
        } else {
            AccessMode::ReadWrite
        };
        if mode == AccessMode::ReadWrite {
            match std::fs::create_dir(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(marl::StoreError::Io(e).into()),
            }
        }
        let dir_lock = std::fs::File::open(dir).map_err(marl::StoreError::Io)?;
        let arg = match mode {
            AccessMode::ReadWrite => FlockArg::LockExclusiveNonblock,
            AccessMode::ReadOnly => FlockArg::LockSharedNonblock,
        };
        flock(dir_lock.as_raw_fd(), arg).map_err(|_| marl::StoreError::Busy)?;

        let gc = GcQueue::new();
        let objects = ObjectDb::open(
            gc.clone(),
            &dir.join("ids.db"),
            mode,
            config.allow_gc_recovery,
        )?;
        let arena = RegionAllocator::open(
            gc.clone(),
            objects.clone(),
            &dir.join("arena.db"),
            mode,
            config.initial_region_size,
        )?;
        let root_file = Mapping::open(&dir.join("root.db"), mode)?;
        if root_file.size() == 0 {
            if mode == AccessMode::ReadOnly {
                return Err(marl::StoreError::Corrupt(format!(
                    "empty root file in {}",
                    dir.display()
                ))
                .into());
            }
            root_file.resize(PAGE_SIZE)?;
        }
        log::debug!("opened database at {}", dir.display());
        Ok(Arc::new(Database {
            gc,
            objects,
            arena,
            root_file,
            root_change: Mutex::new(()),
            _dir_lock: dir_lock,
            read_only: config.read_only,
        }))
    }

    pub fn start_read_session(self: &Arc<Self>) -> Result<ReadSession> {
        let mut session = ReadSession {
            db: self.clone(),
            gc: self.gc.register(),
            root: ObjectId::NULL,
        };
        session.refresh()?;
        Ok(session)
    }

    pub fn start_write_session(self: &Arc<Self>) -> Result<WriteSession> {
        if self.read_only {
            return Err(DbError::ReadOnly);
        }
        let read = self.start_read_session()?;
        let mut session = WriteSession { read, version: 1 };
        session.adopt_version();
        Ok(session)
    }

    fn root_cell(&self) -> &AtomicU64 {
        unsafe { &*(self.root_file.data() as *const AtomicU64) }
    }

    /// Retained snapshot of the published root. The caller owns one
    /// reference and must release it (sessions do this for you).
    pub fn get_root_revision(&self) -> Result<ObjectId> {
        let _lock = self.root_change.lock();
        // pin so a concurrent id-file growth cannot retire the mapping
        // under the retain
        let session = self.gc.register();
        let _pin = session.pin();
        let raw = self.root_cell().load(Ordering::Acquire);
        let id = ObjectId::new(raw);
        if !id.is_null() && !self.objects.retain(id) {
            return Err(DbError::RefsExhausted(raw));
        }
        Ok(id)
    }

    /// Rebuild all reference counts from the published root. Must run
    /// before any session is started (typically right after a recovery
    /// open); everything not reachable from the root returns to the free
    /// list.
    pub fn collect_garbage(&self) -> Result<()> {
        let _lock = self.root_change.lock();
        self.objects.gc_start();
        let root = ObjectId::new(self.root_cell().load(Ordering::Acquire));
        if !root.is_null() {
            let session = self.gc.register();
            let guard = session.pin();
            self.gc_mark(&guard, root)?;
        }
        self.objects.gc_finish();
        Ok(())
    }

    pub(crate) fn gc_mark(&self, guard: &SessionGuard, id: ObjectId) -> Result<()> {
        if id.is_null() {
            return Ok(());
        }
        let first_visit = self.objects.gc_retain(id)?;
        if !first_visit {
            return Ok(());
        }
        if let Node::Inner(inn) = self.node_at(guard, id) {
            self.gc_mark(guard, inn.value_id())?;
            for i in 0..inn.num_branches() as usize {
                self.gc_mark(guard, inn.child_at(i))?;
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> DbStats {
        DbStats {
            ids: self.objects.stats(),
            regions: self.arena.stats(),
        }
    }

    /// Flush all three files to disk.
    pub fn sync(&self) -> Result<()> {
        self.objects.flush()?;
        self.arena.flush()?;
        self.root_file.flush()?;
        Ok(())
    }

    /// Decode the node behind `id`. The returned view borrows the guard:
    /// the bytes stay valid until the guard drops, even across concurrent
    /// evacuation or file growth.
    pub(crate) fn node_at<'g>(&self, guard: &'g SessionGuard, id: ObjectId) -> Node<'g> {
        debug_assert!(!id.is_null());
        self.node_from_info(guard, self.objects.get(id))
    }

    fn node_from_info<'g>(&self, _guard: &'g SessionGuard, info: ObjectInfo) -> Node<'g> {
        let header = self.arena.get_object(info.location());
        let bytes = unsafe {
            std::slice::from_raw_parts(
                (header as *const u8).add(ObjectHeader::SIZE as usize),
                (*header).data_size() as usize,
            )
        };
        match info.kind() {
            ObjectKind::Leaf => Node::Value(node::ValueRef::new(bytes)),
            ObjectKind::Inner => Node::Inner(InnerRef::new(bytes)),
        }
    }

    /// Drop one reference to a subtree root, freeing the whole subtree
    /// when counts reach zero.
    pub(crate) fn release(&self, guard: &SessionGuard, id: ObjectId) {
        if id.is_null() {
            return;
        }
        let info = self.objects.release(id);
        if info.ref_count() == 0 {
            if info.kind() == ObjectKind::Inner {
                if let Node::Inner(inn) = self.node_from_info(guard, info) {
                    self.release(guard, inn.value_id());
                    for i in 0..inn.num_branches() as usize {
                        let child = inn.child_at(i);
                        debug_assert!(!child.is_null());
                        self.release(guard, child);
                    }
                }
            }
            self.arena.deallocate(info.location());
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.arena.shutdown();
        self.gc.drain();
    }
}

/// A reader bound to one revision of the trie. Holds a gc session so the
/// arena worker cannot reclaim bytes out from under it, and one reference
/// on its root.
pub struct ReadSession {
    pub(crate) db: Arc<Database>,
    pub(crate) gc: GcSession,
    pub(crate) root: ObjectId,
}

impl ReadSession {
    pub(crate) fn guard(&self) -> SessionGuard {
        self.gc.pin()
    }

    pub(crate) fn node<'g>(&self, guard: &'g SessionGuard, id: ObjectId) -> Node<'g> {
        self.db.node_at(guard, id)
    }

    /// The revision this session is reading.
    pub fn session_revision(&self) -> ObjectId {
        self.root
    }

    /// Point this session at a different revision. The caller must hold a
    /// reference on `id` for the duration of the call.
    pub fn set_session_revision(&mut self, id: ObjectId) -> Result<()> {
        if id == self.root {
            return Ok(());
        }
        let guard = self.guard();
        if !id.is_null() && !self.db.objects.retain(id) {
            return Err(DbError::RefsExhausted(id.raw()));
        }
        let old = std::mem::replace(&mut self.root, id);
        self.db.release(&guard, old);
        Ok(())
    }

    /// Re-read the database's published root.
    pub fn refresh(&mut self) -> Result<ObjectId> {
        let id = self.db.get_root_revision()?;
        let old = std::mem::replace(&mut self.root, id);
        let guard = self.guard();
        self.db.release(&guard, old);
        Ok(id)
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let k6 = to_key6(key);
        let guard = self.guard();
        let mut id = self.root;
        let mut key: &[u8] = &k6;
        loop {
            if id.is_null() {
                return None;
            }
            match self.node(&guard, id) {
                Node::Value(vn) => {
                    return (vn.key6() == key).then(|| vn.value().to_vec());
                }
                Node::Inner(inn) => {
                    let in_key = inn.prefix6();
                    if key.len() < in_key.len() {
                        return None;
                    }
                    if key == in_key {
                        id = inn.value_id();
                        key = &[];
                        continue;
                    }
                    if &key[..in_key.len()] != in_key {
                        return None;
                    }
                    let b = key[in_key.len()];
                    if !inn.has_branch(b) {
                        return None;
                    }
                    key = &key[in_key.len() + 1..];
                    id = inn.branch_id(b);
                }
            }
        }
    }

    /// Walk the whole revision checking that every reachable id is in
    /// range and live.
    pub fn validate(&self) -> Result<()> {
        let guard = self.guard();
        self.validate_subtree(&guard, self.root)
    }

    fn validate_subtree(&self, guard: &SessionGuard, id: ObjectId) -> Result<()> {
        if id.is_null() {
            return Ok(());
        }
        self.db.objects.validate(id)?;
        if self.db.objects.ref_count(id) == 0 {
            return Err(marl::StoreError::Corrupt(format!(
                "reference to object {} with zero ref count",
                id
            ))
            .into());
        }
        if let Node::Inner(inn) = self.node(guard, id) {
            self.validate_subtree(guard, inn.value_id())?;
            for i in 0..inn.num_branches() as usize {
                self.validate_subtree(guard, inn.child_at(i))?;
            }
        }
        Ok(())
    }
}

impl Drop for ReadSession {
    fn drop(&mut self) {
        let old = std::mem::replace(&mut self.root, ObjectId::NULL);
        let guard = self.gc.pin();
        self.db.release(&guard, old);
    }
}

/// A writer. Mutations are copy-on-write against the session's private
/// version; nothing becomes visible to other sessions until
/// [`WriteSession::set_root_revision`] publishes a root.
pub struct WriteSession {
    read: ReadSession,
    version: u64,
}

impl std::ops::Deref for WriteSession {
    type Target = ReadSession;
    fn deref(&self) -> &ReadSession {
        &self.read
    }
}

impl WriteSession {
    fn db(&self) -> &Database {
        &self.read.db
    }

    /// Pick a version strictly newer than anything reachable from the
    /// session root. Inner nodes are rebuilt bottom-up, so the root's
    /// version is the maximum in its tree.
    fn adopt_version(&mut self) {
        let guard = self.read.guard();
        self.version = if self.read.root.is_null() {
            1
        } else {
            match self.read.node(&guard, self.read.root) {
                Node::Inner(inn) => inn.version() + 1,
                Node::Value(_) => 1,
            }
        };
    }

    pub fn refresh(&mut self) -> Result<ObjectId> {
        let id = self.read.refresh()?;
        self.adopt_version();
        Ok(id)
    }

    pub fn set_session_revision(&mut self, id: ObjectId) -> Result<()> {
        self.read.set_session_revision(id)?;
        self.adopt_version();
        Ok(())
    }

    /// Insert or replace. Returns the previous value's size, or -1 if the
    /// key was absent.
    pub fn upsert(&mut self, key: &[u8], value: &[u8]) -> Result<i32> {
        let k6 = to_key6(key);
        if k6.len() > u16::MAX as usize {
            return Err(DbError::KeyTooLong);
        }
        let guard = self.read.gc.pin();
        let mut old_size = -1;
        let new_root = self.add_child(&guard, self.read.root, &k6, value, &mut old_size)?;
        debug_assert!(!new_root.is_null());
        if new_root != self.read.root {
            let old = std::mem::replace(&mut self.read.root, new_root);
            self.db().release(&guard, old);
        }
        Ok(old_size)
    }

    /// Remove a key. Returns the removed value's size, or -1 if absent.
    pub fn remove(&mut self, key: &[u8]) -> Result<i32> {
        let k6 = to_key6(key);
        let guard = self.read.gc.pin();
        let mut removed_size = -1;
        let new_root = self.remove_child(&guard, self.read.root, &k6, &mut removed_size)?;
        if new_root != self.read.root {
            let old = std::mem::replace(&mut self.read.root, new_root);
            self.db().release(&guard, old);
        }
        Ok(removed_size)
    }

    /// Release the session's tree and start from empty.
    pub fn clear(&mut self) {
        let old = std::mem::replace(&mut self.read.root, ObjectId::NULL);
        let guard = self.read.gc.pin();
        self.db().release(&guard, old);
    }

    /// Clone `from` into a fresh root owned by this session and bump the
    /// session version past it. The caller must hold a reference on
    /// `from` (the session root and published revisions qualify).
    pub fn fork_from(&mut self, from: ObjectId) -> Result<ObjectId> {
        let guard = self.read.gc.pin();
        self.version = 1;
        let new_root = if from.is_null() {
            ObjectId::NULL
        } else {
            match self.read.node(&guard, from) {
                Node::Value(vn) => self.make_value(&guard, vn.key6(), vn.value())?,
                Node::Inner(inn) => {
                    self.version = inn.version() + 1;
                    let value = self.retain_or_copy(&guard, inn.value_id())?;
                    let children = self.clone_children(&guard, &inn, inn.branches())?;
                    self.make_inner(&guard, inn.prefix6(), value, inn.branches(), &children)?
                }
            }
        };
        let old = std::mem::replace(&mut self.read.root, new_root);
        self.db().release(&guard, old);
        Ok(new_root)
    }

    /// Fork the session's current revision.
    pub fn fork(&mut self) -> Result<ObjectId> {
        self.fork_from(self.read.root)
    }

    /// Publish `id` as the database's root: retain new, swap, release
    /// old, all under the root-change mutex. Publishing the session's own
    /// root bumps the session version, so later writes in this session
    /// copy rather than touch the now-exposed nodes.
    pub fn set_root_revision(&mut self, id: ObjectId) -> Result<()> {
        let db = self.read.db.clone();
        let _lock = db.root_change.lock();
        let cell = db.root_cell();
        let old = ObjectId::new(cell.load(Ordering::Acquire));
        if old == id {
            return Ok(());
        }
        let guard = self.read.gc.pin();
        if !id.is_null() && !db.objects.retain(id) {
            return Err(DbError::RefsExhausted(id.raw()));
        }
        cell.store(id.raw(), Ordering::Release);
        log::debug!("published root revision {}", id);
        db.release(&guard, old);
        drop(guard);
        if id == self.read.root {
            self.version += 1;
        }
        Ok(())
    }

    /// Enter crash-recovery mark mode: all live ref counts reset to 1.
    /// Call [`WriteSession::recursive_retain`] for every root that must
    /// survive — including this session's own root — then
    /// [`WriteSession::end_collect_garbage`].
    pub fn start_collect_garbage(&self) {
        self.db().objects.gc_start();
    }

    /// Mark everything reachable from `id` during a collect-garbage pass.
    pub fn recursive_retain(&self, id: ObjectId) -> Result<()> {
        let guard = self.read.guard();
        self.db().gc_mark(&guard, id)?;
        Ok(())
    }

    /// Finish the mark pass: unmarked ids return to the free list.
    pub fn end_collect_garbage(&self) {
        self.db().objects.gc_finish();
    }

    // ---- node construction -------------------------------------------

    fn make_value(&self, guard: &SessionGuard, key6: &[u8], value: &[u8]) -> Result<ObjectId> {
        if key6.len() > u16::MAX as usize {
            return Err(DbError::KeyTooLong);
        }
        let size = node::value_node_size(key6, value);
        if size as u64 > ObjectHeader::MAX_DATA_SIZE {
            return Err(DbError::ValueTooLarge);
        }
        let db = self.db();
        let lock = db.objects.alloc(guard, ObjectKind::Leaf)?;
        let id = lock.id();
        db.arena.allocate(id, size as u32, |data, loc| {
            unsafe { node::write_value_node(data, key6, value) };
            ObjectDb::relocate(&lock, loc);
        })?;
        Ok(id)
    }

    /// Allocate an inner node at the session version. `children` carries
    /// ids the caller already owns (fresh or retained); ownership moves
    /// into the node.
    fn make_inner(
        &self,
        guard: &SessionGuard,
        prefix6: &[u8],
        value_id: ObjectId,
        branches: u64,
        children: &[ObjectId],
    ) -> Result<ObjectId> {
        debug_assert_eq!(branches.count_ones() as usize, children.len());
        let size = node::inner_node_size(prefix6, children.len());
        if size as u64 > ObjectHeader::MAX_DATA_SIZE {
            return Err(DbError::ValueTooLarge);
        }
        let db = self.db();
        let lock = db.objects.alloc(guard, ObjectKind::Inner)?;
        let id = lock.id();
        let version = self.version;
        db.arena.allocate(id, size as u32, |data, loc| {
            unsafe { node::write_inner_node(data, version, branches, value_id, prefix6, children) };
            ObjectDb::relocate(&lock, loc);
        })?;
        Ok(id)
    }

    /// Take shared ownership of a subtree, or clone it when its ref count
    /// has saturated.
    fn retain_or_copy(&self, guard: &SessionGuard, id: ObjectId) -> Result<ObjectId> {
        if id.is_null() || self.db().objects.retain(id) {
            return Ok(id);
        }
        log::debug!("ref count saturated on {}; cloning", id);
        self.copy_node(guard, id)
    }

    fn copy_node(&self, guard: &SessionGuard, id: ObjectId) -> Result<ObjectId> {
        match self.read.node(guard, id) {
            Node::Value(vn) => self.make_value(guard, vn.key6(), vn.value()),
            Node::Inner(inn) => {
                let value = self.retain_or_copy(guard, inn.value_id())?;
                let children = self.clone_children(guard, &inn, inn.branches())?;
                self.make_inner(guard, inn.prefix6(), value, inn.branches(), &children)
            }
        }
    }

    /// Shared-ownership child ids for every slot in `branches`, in slot
    /// order. Slots the source lacks come back null (the caller fills
    /// them before the node leaves the session). `branches` may also be a
    /// subset of the source's slots.
    fn clone_children(
        &self,
        guard: &SessionGuard,
        src: &InnerRef,
        branches: u64,
    ) -> Result<Vec<ObjectId>> {
        let mut children = Vec::with_capacity(branches.count_ones() as usize);
        let mut bits = branches;
        while bits != 0 {
            let b = bits.trailing_zeros() as u8;
            bits &= bits - 1;
            let child = if src.has_branch(b) {
                self.retain_or_copy(guard, src.branch_id(b))?
            } else {
                ObjectId::NULL
            };
            children.push(child);
        }
        Ok(children)
    }

    // ---- in-place mutation (session-private nodes only) ---------------

    fn with_node_mut<R>(&self, id: ObjectId, f: impl FnOnce(*mut u8) -> R) -> R {
        let db = self.db();
        let lock = db.objects.spin_lock(id);
        let info = db.objects.get(id);
        let header = db.arena.get_object(info.location());
        let result = f(unsafe { (header as *mut u8).add(ObjectHeader::SIZE as usize) });
        drop(lock);
        result
    }

    fn overwrite_value_in_place(&self, id: ObjectId, value: &[u8]) {
        self.with_node_mut(id, |data| unsafe { node::overwrite_value(data, value) });
    }

    fn set_branch_in_place(&self, id: ObjectId, b: u8, child: ObjectId) {
        self.with_node_mut(id, |data| unsafe { node::set_branch(data, b, child) });
    }

    fn set_value_id_in_place(&self, id: ObjectId, value_id: ObjectId) {
        self.with_node_mut(id, |data| unsafe { node::set_value_id(data, value_id) });
    }

    // ---- insertion ----------------------------------------------------

    /// Insert `key -> value` under `root`, returning the id of the new
    /// subtree root (which may be `root` itself after an in-place
    /// update). The caller releases `root` when the id changed.
    fn add_child(
        &self,
        guard: &SessionGuard,
        root: ObjectId,
        key: &[u8],
        value: &[u8],
        old_size: &mut i32,
    ) -> Result<ObjectId> {
        if root.is_null() {
            return self.make_value(guard, key, value);
        }
        let inn = match self.read.node(guard, root) {
            Node::Value(vn) => {
                if vn.key6() != key {
                    return self.combine_value_nodes(guard, vn.key6(), vn.value(), key, value);
                }
                *old_size = vn.value().len() as i32;
                return self.set_value(guard, root, key, value, vn.value().len());
            }
            Node::Inner(inn) => inn,
        };

        let in_key = inn.prefix6();
        if in_key == key {
            // the key terminates exactly at this node
            let value_id = inn.value_id();
            if !value_id.is_null() {
                if let Node::Value(v) = self.read.node(guard, value_id) {
                    *old_size = v.value().len() as i32;
                }
            }
            return self.set_inner_value(guard, root, inn, value);
        }

        let cpre = common_prefix_len(in_key, key);
        if cpre == in_key.len() {
            // the key continues below one of this node's branches
            let b = key[cpre];
            if inn.version() != self.version || !inn.has_branch(b) {
                // copy on write
                let branches = inn.branches() | branch_bit(b);
                let inner_value = self.retain_or_copy(guard, inn.value_id())?;
                let mut children = self.clone_children(guard, &inn, branches)?;
                let index = child_index(branches, b);
                let cur = children[index];
                let new = self.add_child(guard, cur, &key[cpre + 1..], value, old_size)?;
                if new != cur {
                    self.db().release(guard, cur);
                    children[index] = new;
                }
                self.make_inner(guard, in_key, inner_value, branches, &children)
            } else {
                // this session owns the node; update the branch in place
                let cur = inn.branch_id(b);
                let new = self.add_child(guard, cur, &key[cpre + 1..], value, old_size)?;
                if new != cur {
                    self.db().release(guard, cur);
                    self.set_branch_in_place(root, b, new);
                }
                Ok(root)
            }
        } else if cpre == key.len() {
            // the key stops inside this node's prefix: split, keeping the
            // new value as the split node's inner value
            let b1 = in_key[cpre];
            let sub_value = self.retain_or_copy(guard, inn.value_id())?;
            let sub_children = self.clone_children(guard, &inn, inn.branches())?;
            let sub = self.make_inner(
                guard,
                &in_key[cpre + 1..],
                sub_value,
                inn.branches(),
                &sub_children,
            )?;
            let inner_value = self.make_value(guard, &[], value)?;
            self.make_inner(guard, &key[..cpre], inner_value, branch_bit(b1), &[sub])
        } else {
            // prefixes diverge: split into two branches
            let b1 = key[cpre];
            let b2 = in_key[cpre];
            let leaf = self.make_value(guard, &key[cpre + 1..], value)?;
            let sub_value = self.retain_or_copy(guard, inn.value_id())?;
            let sub_children = self.clone_children(guard, &inn, inn.branches())?;
            let sub = self.make_inner(
                guard,
                &in_key[cpre + 1..],
                sub_value,
                inn.branches(),
                &sub_children,
            )?;
            let branches = branch_bit(b1) | branch_bit(b2);
            let children = if b1 < b2 { [leaf, sub] } else { [sub, leaf] };
            self.make_inner(guard, &key[..cpre], ObjectId::NULL, branches, &children)
        }
    }

    /// Build the minimal structure holding two distinct keys.
    fn combine_value_nodes(
        &self,
        guard: &SessionGuard,
        k1: &[u8],
        v1: &[u8],
        k2: &[u8],
        v2: &[u8],
    ) -> Result<ObjectId> {
        if k1.len() > k2.len() {
            return self.combine_value_nodes(guard, k2, v2, k1, v1);
        }
        let cpre = common_prefix_len(k1, k2);
        if cpre == k1.len() {
            // k1 is a proper prefix of k2; it becomes the inner value
            let inner_value = self.make_value(guard, &[], v1)?;
            let b2 = k2[cpre];
            let leaf = self.make_value(guard, &k2[cpre + 1..], v2)?;
            self.make_inner(guard, &k1[..cpre], inner_value, branch_bit(b2), &[leaf])
        } else {
            let b1 = k1[cpre];
            let b2 = k2[cpre];
            let l1 = self.make_value(guard, &k1[cpre + 1..], v1)?;
            let l2 = self.make_value(guard, &k2[cpre + 1..], v2)?;
            let branches = branch_bit(b1) | branch_bit(b2);
            let children = if b1 < b2 { [l1, l2] } else { [l2, l1] };
            self.make_inner(guard, &k1[..cpre], ObjectId::NULL, branches, &children)
        }
    }

    /// Replace a leaf's value: in place when this session is the sole
    /// owner and the size matches, else a fresh leaf.
    fn set_value(
        &self,
        guard: &SessionGuard,
        id: ObjectId,
        key: &[u8],
        value: &[u8],
        current_len: usize,
    ) -> Result<ObjectId> {
        if self.db().objects.ref_count(id) == 1 && current_len == value.len() {
            self.overwrite_value_in_place(id, value);
            return Ok(id);
        }
        self.make_value(guard, key, value)
    }

    /// Set the inner value of an inner node whose prefix equals the key.
    fn set_inner_value(
        &self,
        guard: &SessionGuard,
        root: ObjectId,
        inn: InnerRef,
        value: &[u8],
    ) -> Result<ObjectId> {
        if inn.version() == self.version {
            let value_id = inn.value_id();
            if !value_id.is_null() && self.db().objects.ref_count(value_id) == 1 {
                if let Node::Value(v) = self.read.node(guard, value_id) {
                    if v.value().len() == value.len() {
                        self.overwrite_value_in_place(value_id, value);
                        return Ok(root);
                    }
                }
            }
            self.db().release(guard, value_id);
            let new_value = self.make_value(guard, &[], value)?;
            self.set_value_id_in_place(root, new_value);
            Ok(root)
        } else {
            let new_value = self.make_value(guard, &[], value)?;
            let children = self.clone_children(guard, &inn, inn.branches())?;
            self.make_inner(guard, inn.prefix6(), new_value, inn.branches(), &children)
        }
    }

    // ---- deletion -----------------------------------------------------

    /// Remove `key` under `root`, returning the new subtree root (null
    /// when the subtree becomes empty). Inner nodes left with one branch
    /// and no value collapse into their child.
    fn remove_child(
        &self,
        guard: &SessionGuard,
        root: ObjectId,
        key: &[u8],
        removed_size: &mut i32,
    ) -> Result<ObjectId> {
        if root.is_null() {
            return Ok(root);
        }
        let inn = match self.read.node(guard, root) {
            Node::Value(vn) => {
                if vn.key6() == key {
                    *removed_size = vn.value().len() as i32;
                    return Ok(ObjectId::NULL);
                }
                return Ok(root);
            }
            Node::Inner(inn) => inn,
        };

        let in_key = inn.prefix6();
        if in_key.len() > key.len() {
            return Ok(root);
        }

        if in_key == key {
            // removing this node's inner value
            let value_id = inn.value_id();
            if value_id.is_null() {
                return Ok(root);
            }
            if let Node::Value(v) = self.read.node(guard, value_id) {
                *removed_size = v.value().len() as i32;
            }
            if inn.num_branches() == 1 {
                // one branch and no value left: merge prefix + branch
                // nibble + child key into a single node
                let b = inn.branches().trailing_zeros() as u8;
                return self.merge_into_child(guard, in_key, b, inn.child_at(0));
            }
            return if inn.version() == self.version {
                self.db().release(guard, value_id);
                self.set_value_id_in_place(root, ObjectId::NULL);
                Ok(root)
            } else {
                let children = self.clone_children(guard, &inn, inn.branches())?;
                self.make_inner(guard, key, ObjectId::NULL, inn.branches(), &children)
            };
        }

        let cpre = common_prefix_len(in_key, key);
        if cpre != in_key.len() {
            return Ok(root);
        }
        let b = key[in_key.len()];
        if !inn.has_branch(b) {
            return Ok(root);
        }
        let cur = inn.branch_id(b);
        let new = self.remove_child(guard, cur, &key[in_key.len() + 1..], removed_size)?;
        if new == cur {
            return Ok(root);
        }

        if !new.is_null() {
            // branch subtree replaced
            if inn.version() == self.version {
                self.db().release(guard, cur);
                self.set_branch_in_place(root, b, new);
                return Ok(root);
            }
            let value = self.retain_or_copy(guard, inn.value_id())?;
            let mut children = self.clone_children(guard, &inn, inn.branches())?;
            let index = child_index(inn.branches(), b);
            self.db().release(guard, children[index]);
            children[index] = new;
            return self.make_inner(guard, in_key, value, inn.branches(), &children);
        }

        // branch subtree removed entirely
        let new_branches = inn.branches() & !branch_bit(b);
        let has_value = !inn.value_id().is_null();
        if new_branches.count_ones() + has_value as u32 > 1 {
            // still a real inner node; rebuild without the branch
            let value = self.retain_or_copy(guard, inn.value_id())?;
            let children = self.clone_children(guard, &inn, new_branches)?;
            return self.make_inner(guard, in_key, value, new_branches, &children);
        }
        if new_branches == 0 {
            // only the inner value remains; collapse into a leaf. A
            // branchless inner node is never built, so the value must
            // exist here.
            debug_assert!(has_value);
            let value_id = inn.value_id();
            match self.read.node(guard, value_id) {
                Node::Value(v) => {
                    let mut merged = in_key.to_vec();
                    merged.extend_from_slice(v.key6());
                    self.make_value(guard, &merged, v.value())
                }
                Node::Inner(_) => unreachable!("inner value must be a leaf"),
            }
        } else {
            // exactly one branch remains and no value; merge into it
            let lb = new_branches.trailing_zeros() as u8;
            self.merge_into_child(guard, in_key, lb, inn.branch_id(lb))
        }
    }

    /// Collapse `prefix ++ nibble ++ child` into a single node.
    fn merge_into_child(
        &self,
        guard: &SessionGuard,
        prefix: &[u8],
        nibble: u8,
        child: ObjectId,
    ) -> Result<ObjectId> {
        let mut merged = prefix.to_vec();
        merged.push(nibble);
        match self.read.node(guard, child) {
            Node::Value(v) => {
                merged.extend_from_slice(v.key6());
                self.make_value(guard, &merged, v.value())
            }
            Node::Inner(ci) => {
                merged.extend_from_slice(ci.prefix6());
                let value = self.retain_or_copy(guard, ci.value_id())?;
                let children = self.clone_children(guard, &ci, ci.branches())?;
                self.make_inner(guard, &merged, value, ci.branches(), &children)
            }
        }
    }
}

impl ReadSession {
    pub fn first(&self) -> TrieIter<'_> {
        TrieIter::first(self)
    }

    pub fn last(&self) -> TrieIter<'_> {
        TrieIter::last(self)
    }

    pub fn find(&self, key: &[u8]) -> TrieIter<'_> {
        TrieIter::find(self, key)
    }

    pub fn lower_bound(&self, key: &[u8]) -> TrieIter<'_> {
        TrieIter::lower_bound(self, key)
    }

    pub fn last_with_prefix(&self, prefix: &[u8]) -> TrieIter<'_> {
        TrieIter::last_with_prefix(self, prefix)
    }
}

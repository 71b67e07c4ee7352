//! Container based chunk store.
//!
//! Chunks are packed into fixed-size containers. Open containers live in
//! the write cache until they cannot accept the next item (or go idle),
//! then they are handed over to the committer pool and written with a
//! single aligned write. The container index maps container ids to their
//! current on-disk address; after a merge or move several ids can share
//! one address, so the `data_address` handed out by [`ChunkStore::write_new`]
//! stays valid forever.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use nix::sys::uio::{pread, pwrite};
use serde::{Deserialize, Serialize};

use bds_api_types::ChunkStoreConfig;
use bds_index::Index;
use bds_tools::lru_cache::LruCache;
use proxmox_sys::process_locker::ProcessLocker;

use crate::container::Container;
use crate::error::{DedupError, ErrorContext, Result};
use crate::file_formats::ITEM_FLAG_INDEXED;
use crate::fingerprint::Fingerprint;
use crate::log_store::{LogConsumer, LogEvent, OperationLog};
use crate::{EMPTY_DATA_ADDRESS, ILLEGAL_DATA_ADDRESS, LEAST_VALID_CONTAINER_ID};

mod committer;
mod write_cache;

use committer::CommitJob;
use write_cache::WriteCache;

/// Current location of a (committed) container.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct ContainerAddress {
    pub container_id: u64,
    pub file_index: u32,
    pub slot: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    Committed,
    NotCommitted,
    WillNeverCommit,
}

#[derive(Default)]
pub struct ChunkStoreStat {
    pub written_chunks: AtomicU64,
    pub written_bytes: AtomicU64,
    pub read_chunks: AtomicU64,
    pub committed_containers: AtomicU64,
    pub merged_containers: AtomicU64,
    pub moved_containers: AtomicU64,
}

impl ChunkStoreStat {
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "written-chunks": self.written_chunks.load(Ordering::Relaxed),
            "written-bytes": self.written_bytes.load(Ordering::Relaxed),
            "read-chunks": self.read_chunks.load(Ordering::Relaxed),
            "committed-containers": self.committed_containers.load(Ordering::Relaxed),
            "merged-containers": self.merged_containers.load(Ordering::Relaxed),
            "moved-containers": self.moved_containers.load(Ordering::Relaxed),
        })
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct StoreMeta {
    next_container_id: u64,
}

struct SlotAllocator {
    free: BTreeSet<(u32, u64)>,
    total: u64,
}

impl SlotAllocator {
    fn allocate(&mut self) -> Option<(u32, u64)> {
        let slot = self.free.iter().next().copied()?;
        self.free.remove(&slot);
        Some(slot)
    }

    fn mark_used(&mut self, file_index: u32, slot: u64) {
        self.free.remove(&(file_index, slot));
    }

    fn release(&mut self, file_index: u32, slot: u64) {
        self.free.insert((file_index, slot));
    }

    fn used(&self) -> u64 {
        self.total - self.free.len() as u64
    }
}

struct IdAllocator {
    next: u64,
    reserved_until: u64,
}

#[derive(Default)]
struct CommitTracking {
    committing: HashSet<u64>,
    failed: HashSet<u64>,
}

pub(crate) struct StoreShared {
    pub(crate) config: ChunkStoreConfig,
    files: Vec<File>,
    allocator: Mutex<SlotAllocator>,
    container_index: Arc<dyn Index>,
    write_cache: WriteCache,
    read_cache: Mutex<LruCache<(u32, u64), Arc<Container>>>,
    commits: Mutex<CommitTracking>,
    commit_cond: Condvar,
    ids: Mutex<IdAllocator>,
    meta_path: PathBuf,
    pub(crate) log: Arc<OperationLog>,
    /// Fingerprints of deleted chunks, removed once compaction drops them.
    dead_chunks: Mutex<HashSet<Fingerprint>>,
    pub(crate) stats: ChunkStoreStat,
    _locker: Arc<Mutex<ProcessLocker>>,
}

pub struct ChunkStore {
    shared: Arc<StoreShared>,
    handover: Mutex<Option<Sender<CommitJob>>>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

fn id_key(container_id: u64) -> [u8; 8] {
    container_id.to_be_bytes()
}

impl StoreShared {
    fn container_size(&self) -> usize {
        self.config.container_size
    }

    fn lookup_address(&self, container_id: u64) -> Result<Option<ContainerAddress>> {
        match self.container_index.lookup(&id_key(container_id))? {
            None => Ok(None),
            Some(payload) => {
                let address = serde_json::from_slice(&payload).map_err(|err| {
                    DedupError::integrity(format!(
                        "container index entry for {container_id} undecodable: {err}"
                    ))
                })?;
                Ok(Some(address))
            }
        }
    }

    pub(crate) fn store_address(&self, container_id: u64, address: &ContainerAddress) -> Result<()> {
        let payload = serde_json::to_vec(address)
            .map_err(|err| DedupError::programming(format!("address encode failed: {err}")))?;
        self.container_index.put(&id_key(container_id), &payload)?;
        Ok(())
    }

    pub(crate) fn write_container_buf(&self, file_index: u32, slot: u64, buf: &[u8]) -> Result<()> {
        let file = &self.files[file_index as usize];
        let offset = slot * self.container_size() as u64;
        pwrite(file.as_raw_fd(), buf, offset as i64).map_err(std::io::Error::from)?;
        file.sync_data()?;
        Ok(())
    }

    fn read_container_buf(&self, address: &ContainerAddress) -> Result<Vec<u8>> {
        let file = &self.files[address.file_index as usize];
        let offset = address.slot * self.container_size() as u64;
        let mut buf = vec![0u8; self.container_size()];
        let got = pread(file.as_raw_fd(), &mut buf, offset as i64).map_err(std::io::Error::from)?;
        if got != buf.len() {
            return Err(DedupError::integrity(format!(
                "short container read at file {} slot {}",
                address.file_index, address.slot
            )));
        }
        Ok(buf)
    }

    pub(crate) fn cache_container(&self, file_index: u32, slot: u64, container: Arc<Container>) {
        self.read_cache
            .lock()
            .unwrap()
            .insert((file_index, slot), container);
    }

    fn load_container(&self, address: &ContainerAddress) -> Result<Arc<Container>> {
        if let Some(container) = self.read_cache.lock().unwrap().get_mut(&(address.file_index, address.slot)) {
            return Ok(container.clone());
        }
        let buf = self.read_container_buf(address)?;
        let container = Arc::new(Container::decode(&buf)?);
        self.cache_container(address.file_index, address.slot, container.clone());
        Ok(container)
    }

    fn begin_commit(&self, container_id: u64) {
        self.commits.lock().unwrap().committing.insert(container_id);
    }

    pub(crate) fn finish_commit(&self, container_id: u64, success: bool) {
        let mut commits = self.commits.lock().unwrap();
        commits.committing.remove(&container_id);
        if !success {
            commits.failed.insert(container_id);
        }
        drop(commits);
        self.commit_cond.notify_all();
    }

    fn mark_dead(&self, fingerprints: &[Fingerprint]) {
        let mut dead = self.dead_chunks.lock().unwrap();
        for fp in fingerprints {
            dead.insert(*fp);
        }
    }
}

impl ChunkStore {
    pub fn open(config: &ChunkStoreConfig, log: Arc<OperationLog>) -> Result<Self> {
        let base = PathBuf::from(&config.path);
        std::fs::create_dir_all(&base)?;

        let lockfile_path = base.join(".lock");
        if !lockfile_path.exists() {
            proxmox_sys::fs::replace_file(
                &lockfile_path,
                b"",
                proxmox_sys::fs::CreateOptions::new(),
                false,
            )
            .map_err(DedupError::Other)?;
        }
        let locker = ProcessLocker::new(&lockfile_path).map_err(DedupError::Other)?;

        let mut files = Vec::with_capacity(config.container_file_count);
        for file_index in 0..config.container_file_count {
            let path = base.join(format!("container-{file_index:03}.cdat"));
            let file = OpenOptions::new().create(true).read(true).write(true).open(path)?;
            files.push(file);
        }

        let container_index = crate::index_factory::open_index(&config.container_index)
            .map_err(DedupError::Other)?;

        // rebuild the slot allocator and the id high-water mark
        let total_slots = config.container_file_count as u64 * config.containers_per_file;
        let mut free: BTreeSet<(u32, u64)> = (0..config.container_file_count as u32)
            .flat_map(|file_index| {
                (0..config.containers_per_file).map(move |slot| (file_index, slot))
            })
            .collect();
        let mut max_committed_id = 0u64;
        let mut iter = container_index.iterate()?;
        while let Some((key, payload)) = iter.next_entry()? {
            let container_id = u64::from_be_bytes(
                key.as_slice()
                    .try_into()
                    .map_err(|_| DedupError::integrity("bad container index key"))?,
            );
            max_committed_id = max_committed_id.max(container_id);
            let address: ContainerAddress = serde_json::from_slice(&payload)
                .map_err(|err| DedupError::integrity(format!("bad container address: {err}")))?;
            free.remove(&(address.file_index, address.slot));
        }

        let meta_path = base.join("store.meta");
        let meta_next = match std::fs::read(&meta_path) {
            Ok(payload) => {
                let meta: StoreMeta = serde_json::from_slice(&payload)
                    .map_err(|err| DedupError::integrity(format!("bad store meta: {err}")))?;
                meta.next_container_id
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => LEAST_VALID_CONTAINER_ID,
            Err(err) => return Err(err.into()),
        };
        let next_id = meta_next.max(max_committed_id + 1);

        let shared = Arc::new(StoreShared {
            config: config.clone(),
            files,
            allocator: Mutex::new(SlotAllocator {
                free,
                total: total_slots,
            }),
            container_index,
            write_cache: WriteCache::new(config.write_cache_size, config.write_cache_strategy),
            read_cache: Mutex::new(LruCache::new(config.read_cache_size)),
            commits: Mutex::new(CommitTracking::default()),
            commit_cond: Condvar::new(),
            ids: Mutex::new(IdAllocator {
                next: next_id,
                reserved_until: next_id,
            }),
            meta_path,
            log,
            dead_chunks: Mutex::new(HashSet::new()),
            stats: ChunkStoreStat::default(),
            _locker: locker,
        });

        let (sender, receiver) = bounded::<CommitJob>(0);
        let worker_count = config.committer_threads.clamp(1, 32);
        let workers = committer::spawn_workers(&shared, receiver, worker_count);

        Ok(Self {
            shared,
            handover: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    /// The log consumer keeping the container index and compaction state in
    /// sync with replayed events. Register it before `OperationLog::start`.
    pub fn log_consumer(&self) -> Arc<dyn LogConsumer> {
        Arc::new(StoreLogConsumer {
            shared: Arc::downgrade(&self.shared),
        })
    }

    pub fn stats(&self) -> &ChunkStoreStat {
        &self.shared.stats
    }

    fn allocate_id(&self) -> Result<u64> {
        let mut ids = self.shared.ids.lock().unwrap();
        if ids.next >= ids.reserved_until {
            // reserve a block of ids and persist the high-water mark, so a
            // dirty restart can never hand out an id twice
            let reserved = ids.next + 64;
            let meta = StoreMeta {
                next_container_id: reserved,
            };
            proxmox_sys::fs::replace_file(
                &self.shared.meta_path,
                &serde_json::to_vec(&meta).unwrap(),
                proxmox_sys::fs::CreateOptions::new(),
                true,
            )
            .map_err(DedupError::Other)?;
            ids.reserved_until = reserved;
        }
        let id = ids.next;
        ids.next += 1;
        Ok(id)
    }

    /// Fraction of the configured capacity in use.
    pub fn fill_ratio(&self) -> f64 {
        let allocator = self.shared.allocator.lock().unwrap();
        if allocator.total == 0 {
            return 1.0;
        }
        allocator.used() as f64 / allocator.total as f64
    }

    pub fn check_if_full(&self) -> bool {
        self.fill_ratio() >= self.shared.config.full_threshold
    }

    fn handover(&self, container: Container) -> Result<()> {
        let (file_index, slot) = self
            .shared
            .allocator
            .lock()
            .unwrap()
            .allocate()
            .ok_or_else(|| DedupError::full("no free container slot"))?;
        let job = CommitJob {
            container,
            file_index,
            slot,
        };
        let handover = self.handover.lock().unwrap();
        match handover.as_ref() {
            Some(sender) => sender
                .send(job)
                .map_err(|_| DedupError::programming("committer pool is gone")),
            None => Err(DedupError::programming("chunk store is stopped")),
        }
    }

    /// Store a new chunk; returns its (final) data address.
    pub fn write_new(
        &self,
        fingerprint: &Fingerprint,
        data: &[u8],
        is_indexed: bool,
        ec: &mut ErrorContext,
    ) -> Result<u64> {
        if data.is_empty() || data.len() > bds_api_types::MAX_CHUNK_SIZE {
            return Err(DedupError::programming(format!(
                "illegal chunk size {}",
                data.len()
            )));
        }
        if self.check_if_full() {
            ec.set_full();
            return Err(DedupError::full("chunk store capacity exceeded"));
        }
        let flags = if is_indexed { ITEM_FLAG_INDEXED } else { 0 };

        loop {
            let closed = {
                let (_index, mut guard) = self.shared.write_cache.select();
                if guard.is_none() {
                    *guard = Some(Container::new(
                        self.allocate_id()?,
                        self.shared.container_size(),
                    ));
                }
                let container = guard.as_mut().unwrap();
                if container.can_fit(data.len()) {
                    container.add_item_with_flags(*fingerprint, data.to_vec(), flags)?;
                    let id = container.id();
                    self.shared.stats.written_chunks.fetch_add(1, Ordering::Relaxed);
                    self.shared
                        .stats
                        .written_bytes
                        .fetch_add(data.len() as u64, Ordering::Relaxed);
                    return Ok(id);
                }
                // slot container is full: swap in a fresh one and commit
                let full_container = guard.take().unwrap();
                self.shared.begin_commit(full_container.id());
                *guard = Some(Container::new(
                    self.allocate_id()?,
                    self.shared.container_size(),
                ));
                full_container
            };
            self.handover(closed)?;
        }
    }

    /// Read a chunk's bytes by data address and fingerprint.
    pub fn read(&self, data_address: u64, fingerprint: &Fingerprint) -> Result<Vec<u8>> {
        if data_address == EMPTY_DATA_ADDRESS || data_address == ILLEGAL_DATA_ADDRESS {
            return Err(DedupError::programming(format!(
                "read from reserved address {data_address}"
            )));
        }
        self.shared.stats.read_chunks.fetch_add(1, Ordering::Relaxed);

        loop {
            // open containers are readable under the slot's read lock
            if let Some(guard) = self.shared.write_cache.find(data_address) {
                let container = guard.as_ref().unwrap();
                return match container.find_item(fingerprint) {
                    Some(item) => Ok(item.data.clone()),
                    None => Err(DedupError::integrity(format!(
                        "chunk {fingerprint} missing from open container {data_address}"
                    ))),
                };
            }

            // containers in the committer pipeline block the reader
            {
                let commits = self.shared.commits.lock().unwrap();
                if commits.failed.contains(&data_address) {
                    return Err(DedupError::integrity(format!(
                        "container {data_address} failed to commit"
                    )));
                }
                if commits.committing.contains(&data_address) {
                    let _unused = self
                        .shared
                        .commit_cond
                        .wait_timeout(commits, Duration::from_secs(30))
                        .unwrap();
                    continue;
                }
            }

            let address = match self.shared.lookup_address(data_address)? {
                Some(address) => address,
                None => {
                    // a concurrent hand-over may have raced us
                    if self.shared.write_cache.contains(data_address)
                        || self.shared.commits.lock().unwrap().committing.contains(&data_address)
                    {
                        continue;
                    }
                    return Err(DedupError::integrity(format!(
                        "container {data_address} was never committed"
                    )));
                }
            };
            let container = self.shared.load_container(&address)?;
            return match container.find_item(fingerprint) {
                Some(item) => Ok(item.data.clone()),
                None => Err(DedupError::integrity(format!(
                    "chunk {fingerprint} missing from container {data_address}"
                ))),
            };
        }
    }

    pub fn is_committed(&self, data_address: u64) -> Result<CommitState> {
        if data_address == EMPTY_DATA_ADDRESS {
            return Ok(CommitState::Committed);
        }
        if data_address == ILLEGAL_DATA_ADDRESS {
            return Err(DedupError::programming("commit query for illegal address"));
        }
        if self.shared.write_cache.contains(data_address) {
            return Ok(CommitState::NotCommitted);
        }
        {
            let commits = self.shared.commits.lock().unwrap();
            if commits.committing.contains(&data_address) {
                return Ok(CommitState::NotCommitted);
            }
            if commits.failed.contains(&data_address) {
                return Ok(CommitState::WillNeverCommit);
            }
        }
        if self.shared.lookup_address(data_address)?.is_some() {
            return Ok(CommitState::Committed);
        }
        let next = self.shared.ids.lock().unwrap().next;
        if data_address >= next {
            return Err(DedupError::programming(format!(
                "commit query for unallocated container {data_address}"
            )));
        }
        Ok(CommitState::WillNeverCommit)
    }

    /// Like [`Self::is_committed`], but blocks while the state is
    /// `NotCommitted`.
    pub fn is_committed_wait(&self, data_address: u64) -> Result<CommitState> {
        loop {
            match self.is_committed(data_address)? {
                CommitState::NotCommitted => {
                    if self.shared.write_cache.contains(data_address) {
                        // still open: close it so the wait can finish
                        self.close_container(data_address)?;
                        continue;
                    }
                    let commits = self.shared.commits.lock().unwrap();
                    if commits.committing.contains(&data_address) {
                        let _unused = self
                            .shared
                            .commit_cond
                            .wait_timeout(commits, Duration::from_secs(30))
                            .unwrap();
                    }
                }
                state => return Ok(state),
            }
        }
    }

    /// Close the open container with the given id, if any.
    fn close_container(&self, container_id: u64) -> Result<()> {
        for slot in self.shared.write_cache.slots() {
            let mut guard = slot.container.write().unwrap();
            if guard.as_ref().map(Container::id) == Some(container_id) {
                let container = guard.take().unwrap();
                if container.is_empty() {
                    return Ok(());
                }
                self.shared.begin_commit(container.id());
                drop(guard);
                return self.handover(container);
            }
        }
        Ok(())
    }

    /// Close every open container and wait for the pipeline to drain.
    pub fn flush(&self) -> Result<()> {
        for slot in self.shared.write_cache.slots() {
            let container = {
                let mut guard = slot.container.write().unwrap();
                match guard.take() {
                    Some(container) if !container.is_empty() => {
                        self.shared.begin_commit(container.id());
                        Some(container)
                    }
                    _ => None,
                }
            };
            if let Some(container) = container {
                self.handover(container)?;
            }
        }
        self.wait_pipeline_empty(Duration::from_secs(60))
    }

    fn wait_pipeline_empty(&self, timeout: Duration) -> Result<()> {
        let deadline = std::time::Instant::now() + timeout;
        let mut commits = self.shared.commits.lock().unwrap();
        while !commits.committing.is_empty() {
            if std::time::Instant::now() > deadline {
                return Err(DedupError::Timeout("container commit pipeline".into()));
            }
            let (guard, _timeout) = self
                .shared
                .commit_cond
                .wait_timeout(commits, Duration::from_millis(100))
                .unwrap();
            commits = guard;
        }
        Ok(())
    }

    /// Close open containers that exceeded the configured idle time.
    pub fn close_idle_containers(&self) -> Result<usize> {
        let timeout = self.shared.config.write_cache_timeout_secs;
        let mut closed = 0;
        for slot in self.shared.write_cache.slots() {
            if slot.idle_secs() < timeout {
                continue;
            }
            let container = {
                let mut guard = match slot.container.try_write() {
                    Ok(guard) => guard,
                    Err(_) => continue,
                };
                match guard.as_ref() {
                    Some(container) if !container.is_empty() => {
                        let container = guard.take().unwrap();
                        self.shared.begin_commit(container.id());
                        container
                    }
                    _ => continue,
                }
            };
            self.handover(container)?;
            closed += 1;
        }
        Ok(closed)
    }

    fn ids_for_address(&self, address: &ContainerAddress) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        let mut iter = self.shared.container_index.iterate()?;
        while let Some((key, payload)) = iter.next_entry()? {
            let entry: ContainerAddress = serde_json::from_slice(&payload)
                .map_err(|err| DedupError::integrity(format!("bad container address: {err}")))?;
            if entry.file_index == address.file_index && entry.slot == address.slot {
                ids.push(u64::from_be_bytes(key.as_slice().try_into().unwrap()));
            }
        }
        Ok(ids)
    }

    fn live_items(&self, container: &Container) -> (usize, usize) {
        let dead = self.shared.dead_chunks.lock().unwrap();
        let mut count = 0;
        let mut bytes = 0;
        for item in container.items() {
            if !dead.contains(&item.fingerprint) {
                count += 1;
                bytes += item.data.len();
            }
        }
        (count, bytes)
    }

    /// One idle-time compaction step: merge two under-filled committed
    /// containers into one. Returns true when a merge happened.
    pub fn merge_step(&self) -> Result<bool> {
        use crate::file_formats::{CONTAINER_HEADER_SIZE, CONTAINER_ITEM_HEADER_SIZE};

        // collect distinct committed addresses with their primary id
        let mut by_address: HashMap<(u32, u64), ContainerAddress> = HashMap::new();
        let mut iter = self.shared.container_index.iterate()?;
        while let Some((_key, payload)) = iter.next_entry()? {
            let address: ContainerAddress = serde_json::from_slice(&payload)
                .map_err(|err| DedupError::integrity(format!("bad container address: {err}")))?;
            by_address.insert((address.file_index, address.slot), address);
        }

        let mut candidates: Vec<(ContainerAddress, Arc<Container>, usize, usize)> = Vec::new();
        for address in by_address.values() {
            let container = self.shared.load_container(address)?;
            let (live_count, live_bytes) = self.live_items(&container);
            candidates.push((*address, container, live_count, live_bytes));
        }
        candidates.sort_by_key(|(_, _, _, bytes)| *bytes);

        let budget = self.shared.container_size() - CONTAINER_HEADER_SIZE - 4;
        let pair = candidates.windows(2).find(|pair| {
            let (_, _, count_a, bytes_a) = &pair[0];
            let (_, _, count_b, bytes_b) = &pair[1];
            (count_a + count_b) * CONTAINER_ITEM_HEADER_SIZE + bytes_a + bytes_b <= budget
        });
        let (first, second) = match pair {
            Some(pair) => (pair[0].clone(), pair[1].clone()),
            None => return Ok(false),
        };

        let new_id = self.allocate_id()?;
        self.shared.log.append(LogEvent::ContainerMergeBegin {
            first_id: first.0.container_id,
            second_id: second.0.container_id,
            new_id,
        })?;

        let mut merged = Container::new(new_id, self.shared.container_size());
        {
            let dead = self.shared.dead_chunks.lock().unwrap();
            for source in [&first.1, &second.1] {
                for item in source.items() {
                    if !dead.contains(&item.fingerprint) {
                        merged.add_item_with_flags(item.fingerprint, item.data.clone(), item.flags)?;
                    }
                }
            }
        }

        let (file_index, slot) = self
            .shared
            .allocator
            .lock()
            .unwrap()
            .allocate()
            .ok_or_else(|| DedupError::full("no free container slot for merge"))?;
        let buf = merged.encode(self.shared.config.compression)?;
        self.shared.write_container_buf(file_index, slot, &buf)?;

        let new_address = ContainerAddress {
            container_id: new_id,
            file_index,
            slot,
        };
        // every id that resolved to one of the sources now resolves to the
        // merged container; chunk mapping addresses stay untouched
        for source in [&first.0, &second.0] {
            for container_id in self.ids_for_address(source)? {
                self.shared.store_address(container_id, &new_address)?;
            }
        }
        self.shared.store_address(new_id, &new_address)?;

        self.shared.log.append(LogEvent::ContainerMergeCommit {
            first_id: first.0.container_id,
            second_id: second.0.container_id,
            new_id,
            file_index,
            slot,
        })?;

        {
            let mut allocator = self.shared.allocator.lock().unwrap();
            allocator.release(first.0.file_index, first.0.slot);
            allocator.release(second.0.file_index, second.0.slot);
        }
        {
            let mut cache = self.shared.read_cache.lock().unwrap();
            cache.remove(&(first.0.file_index, first.0.slot));
            cache.remove(&(second.0.file_index, second.0.slot));
        }
        {
            // the merged-away chunks are gone for good
            let mut dead = self.shared.dead_chunks.lock().unwrap();
            for source in [&first.1, &second.1] {
                for item in source.items() {
                    dead.remove(&item.fingerprint);
                }
            }
        }
        self.shared.stats.merged_containers.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "merged containers {} and {} into {new_id}",
            first.0.container_id,
            second.0.container_id
        );
        Ok(true)
    }

    /// Relocate one committed container to a different slot.
    pub fn move_container(&self, container_id: u64) -> Result<()> {
        let old_address = self
            .shared
            .lookup_address(container_id)?
            .ok_or_else(|| DedupError::programming(format!("container {container_id} not committed")))?;
        let container = self.shared.load_container(&old_address)?;

        let (file_index, slot) = self
            .shared
            .allocator
            .lock()
            .unwrap()
            .allocate()
            .ok_or_else(|| DedupError::full("no free container slot for move"))?;
        let buf = self.shared.read_container_buf(&old_address)?;
        self.shared.write_container_buf(file_index, slot, &buf)?;

        let new_address = ContainerAddress {
            container_id: old_address.container_id,
            file_index,
            slot,
        };
        for id in self.ids_for_address(&old_address)? {
            self.shared.store_address(id, &new_address)?;
        }
        self.shared.log.append(LogEvent::ContainerMoved {
            container_id,
            file_index,
            slot,
        })?;

        self.shared.allocator.lock().unwrap().release(old_address.file_index, old_address.slot);
        let mut cache = self.shared.read_cache.lock().unwrap();
        cache.remove(&(old_address.file_index, old_address.slot));
        cache.insert((file_index, slot), container);
        drop(cache);
        self.shared.stats.moved_containers.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Drop the read cache, e.g. under memory pressure.
    pub fn shed_caches(&self) {
        self.shared.read_cache.lock().unwrap().clear();
    }

    /// Flush and shut the committer pool down.
    pub fn stop(&self) -> Result<()> {
        self.flush()?;
        *self.handover.lock().unwrap() = None;
        for handle in self.workers.lock().unwrap().drain(..) {
            handle
                .join()
                .map_err(|_| DedupError::programming("committer thread panicked"))?;
        }
        self.shared.container_index.sync()?;
        Ok(())
    }
}

struct StoreLogConsumer {
    shared: std::sync::Weak<StoreShared>,
}

impl LogConsumer for StoreLogConsumer {
    fn replay_background(&self, _log_id: u64, event: &LogEvent) -> Result<()> {
        let shared = match self.shared.upgrade() {
            Some(shared) => shared,
            None => return Ok(()),
        };
        if let LogEvent::OrphanChunks { fingerprints, .. } = event {
            shared.mark_dead(fingerprints);
        }
        Ok(())
    }

    fn replay_dirty_start(&self, _log_id: u64, event: &LogEvent) -> Result<()> {
        let shared = match self.shared.upgrade() {
            Some(shared) => shared,
            None => return Ok(()),
        };
        match event {
            // a logged commit means the on-disk write completed; make sure
            // the index entry survived the crash
            LogEvent::ContainerCommitted {
                container_id,
                file_index,
                slot,
            } => {
                let address = ContainerAddress {
                    container_id: *container_id,
                    file_index: *file_index,
                    slot: *slot,
                };
                if shared.lookup_address(*container_id)?.is_none() {
                    shared.store_address(*container_id, &address)?;
                }
                shared.allocator.lock().unwrap().mark_used(*file_index, *slot);
            }
            LogEvent::ContainerMergeCommit {
                first_id,
                second_id,
                new_id,
                file_index,
                slot,
            } => {
                let new_address = ContainerAddress {
                    container_id: *new_id,
                    file_index: *file_index,
                    slot: *slot,
                };
                for id in [*first_id, *second_id, *new_id] {
                    shared.store_address(id, &new_address)?;
                }
                shared.allocator.lock().unwrap().mark_used(*file_index, *slot);
            }
            LogEvent::OrphanChunks { fingerprints, .. } => {
                shared.mark_dead(fingerprints);
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bds_api_types::{CompressionType, IndexConfig, LogConfig, WriteCacheStrategy};

    struct Fixture {
        _dir: PathBuf,
        log: Arc<OperationLog>,
        store: ChunkStore,
    }

    impl Fixture {
        fn new(name: &str, containers_per_file: u64) -> Self {
            let mut dir = std::env::temp_dir();
            dir.push(format!("bds-store-{name}-{}", std::process::id()));
            let _ = std::fs::remove_dir_all(&dir);
            std::fs::create_dir_all(&dir).unwrap();

            let log_config = LogConfig {
                filename: vec![
                    dir.join("log-0.seg").to_string_lossy().into_owned(),
                    dir.join("log-1.seg").to_string_lossy().into_owned(),
                ],
                max_log_size: 1 << 20,
                replay_check_interval_ms: 5,
            };
            let log = Arc::new(OperationLog::open(&log_config).unwrap());
            log.start(true).unwrap();
            log.run();

            let config = ChunkStoreConfig {
                path: dir.join("chunks").to_string_lossy().into_owned(),
                container_size: 64 * 1024,
                container_file_count: 2,
                containers_per_file,
                write_cache_size: 2,
                write_cache_strategy: WriteCacheStrategy::EarliestFree,
                write_cache_timeout_secs: 0,
                committer_threads: 2,
                compression: CompressionType::Zstd,
                read_cache_size: 8,
                full_threshold: 0.95,
                container_index: IndexConfig::mem(),
            };
            let store = ChunkStore::open(&config, log.clone()).unwrap();
            Self {
                _dir: dir,
                log,
                store,
            }
        }
    }

    #[test]
    fn write_and_read_from_write_cache() {
        let fx = Fixture::new("wcache", 64);
        let data = vec![7u8; 1000];
        let fp = Fingerprint::of_data(&data);
        let mut ec = ErrorContext::new();
        let address = fx.store.write_new(&fp, &data, true, &mut ec).unwrap();
        assert!(address >= LEAST_VALID_CONTAINER_ID);

        // not yet committed, read is served from the open container
        assert_eq!(fx.store.is_committed(address).unwrap(), CommitState::NotCommitted);
        assert_eq!(fx.store.read(address, &fp).unwrap(), data);
        fx.store.stop().unwrap();
        fx.log.stop().unwrap();
    }

    #[test]
    fn flush_commits_and_reads_from_disk() {
        let fx = Fixture::new("flush", 64);
        let data = vec![3u8; 2000];
        let fp = Fingerprint::of_data(&data);
        let mut ec = ErrorContext::new();
        let address = fx.store.write_new(&fp, &data, true, &mut ec).unwrap();

        fx.store.flush().unwrap();
        assert_eq!(fx.store.is_committed(address).unwrap(), CommitState::Committed);
        assert_eq!(fx.store.read(address, &fp).unwrap(), data);

        // the commit event reached the log
        assert!(fx.log.wait_replayed(Duration::from_secs(5)));
        fx.store.stop().unwrap();
        fx.log.stop().unwrap();
    }

    #[test]
    fn full_containers_roll_over() {
        let fx = Fixture::new("rollover", 64);
        let mut ec = ErrorContext::new();
        let mut addresses = HashSet::new();
        // 60k per chunk: the second write cannot share the 64k container
        for index in 0..4u8 {
            let data = vec![index; 60 * 1024];
            let fp = Fingerprint::of_data(&data);
            addresses.insert(fx.store.write_new(&fp, &data, true, &mut ec).unwrap());
        }
        assert!(addresses.len() >= 2, "rollover never produced a fresh container");
        fx.store.stop().unwrap();
        fx.log.stop().unwrap();
    }

    #[test]
    fn capacity_limit_reports_full() {
        // 2 files x 1 container each, threshold 0.95
        let fx = Fixture::new("full", 1);
        let mut ec = ErrorContext::new();
        let mut result = Ok(0);
        for index in 0..8u32 {
            let data = vec![(index % 251) as u8; 60 * 1024];
            let fp = Fingerprint::of_data(&data.iter().chain(&index.to_le_bytes()).copied().collect::<Vec<u8>>());
            result = fx.store.write_new(&fp, &data, true, &mut ec);
            if result.is_err() {
                break;
            }
        }
        match result {
            Err(DedupError::Full(_)) => assert!(ec.full),
            other => panic!("expected full error, got {other:?}"),
        }
        fx.log.stop().unwrap();
    }

    #[test]
    fn is_committed_wait_closes_open_container() {
        let fx = Fixture::new("wait", 64);
        let data = vec![9u8; 512];
        let fp = Fingerprint::of_data(&data);
        let mut ec = ErrorContext::new();
        let address = fx.store.write_new(&fp, &data, true, &mut ec).unwrap();
        assert_eq!(
            fx.store.is_committed_wait(address).unwrap(),
            CommitState::Committed
        );
        fx.store.stop().unwrap();
        fx.log.stop().unwrap();
    }

    #[test]
    fn merge_combines_underfilled_containers() {
        let fx = Fixture::new("merge", 64);
        let mut ec = ErrorContext::new();
        let data_a = vec![1u8; 40 * 1024];
        let data_b = vec![2u8; 40 * 1024];
        let fp_a = Fingerprint::of_data(&data_a);
        let fp_b = Fingerprint::of_data(&data_b);

        let addr_a = fx.store.write_new(&fp_a, &data_a, true, &mut ec).unwrap();
        fx.store.flush().unwrap();
        let addr_b = fx.store.write_new(&fp_b, &data_b, true, &mut ec).unwrap();
        fx.store.flush().unwrap();
        assert_ne!(addr_a, addr_b);

        // 40k + 40k does not fit into one 64k container; no merge
        assert!(!fx.store.merge_step().unwrap());

        // declare one chunk dead, then the pair fits
        fx.store.shared.mark_dead(&[fp_a]);
        assert!(fx.store.merge_step().unwrap());

        // the old data addresses still resolve
        assert_eq!(fx.store.read(addr_b, &fp_b).unwrap(), data_b);
        assert_eq!(fx.store.stats().merged_containers.load(Ordering::Relaxed), 1);
        fx.store.stop().unwrap();
        fx.log.stop().unwrap();
    }

    #[test]
    fn move_keeps_addresses_valid() {
        let fx = Fixture::new("move", 64);
        let mut ec = ErrorContext::new();
        let data = vec![5u8; 10 * 1024];
        let fp = Fingerprint::of_data(&data);
        let address = fx.store.write_new(&fp, &data, true, &mut ec).unwrap();
        fx.store.flush().unwrap();

        fx.store.move_container(address).unwrap();
        assert_eq!(fx.store.read(address, &fp).unwrap(), data);
        fx.store.stop().unwrap();
        fx.log.stop().unwrap();
    }
}

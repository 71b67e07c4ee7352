//! Operation log.
//!
//! An append-only, replayable record of every mutation of block or chunk
//! state, persisted in a ring of equally sized segment files. The log is
//! the commit point of the engine: components register as consumers and
//! receive events at three points:
//!
//! * direct replay, synchronously before `append` returns; a consumer
//!   failure fails the append,
//! * background replay, in log order after the event is durable,
//! * dirty-start replay, once per recovered event during startup.
//!
//! A segment is recycled only after every consumer acknowledged background
//! replay of all its records. A torn record at the tail is discarded; a
//! CRC failure before the tail refuses to start.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

use anyhow::format_err;
use nix::sys::uio::{pread, pwrite};
use serde::{Deserialize, Serialize};

use bds_api_types::LogConfig;

use crate::block_mapping::BlockMappingPair;
use crate::error::{DedupError, Result};
use crate::file_formats::{
    LOG_HEADER_MAGIC_1_0, LOG_HEADER_SIZE, LOG_RECORD_ALIGNMENT, LOG_RECORD_HEADER_SIZE,
    LOG_SEGMENT_MAGIC_1_0,
};
use crate::fingerprint::Fingerprint;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case", tag = "event")]
pub enum LogEvent {
    BlockMappingWritten { pair: BlockMappingPair },
    BlockMappingDeleted { pair: BlockMappingPair },
    BlockMappingWriteFailed { pair: BlockMappingPair },
    ContainerCommitted { container_id: u64, file_index: u32, slot: u64 },
    ContainerMoved { container_id: u64, file_index: u32, slot: u64 },
    ContainerMergeBegin { first_id: u64, second_id: u64, new_id: u64 },
    ContainerMergeCommit { first_id: u64, second_id: u64, new_id: u64, file_index: u32, slot: u64 },
    OrphanChunks { container_id: u64, fingerprints: Vec<Fingerprint> },
    LogEmpty,
    LogNew,
}

impl LogEvent {
    pub fn kind(&self) -> u16 {
        match self {
            LogEvent::BlockMappingWritten { .. } => 1,
            LogEvent::BlockMappingDeleted { .. } => 2,
            LogEvent::BlockMappingWriteFailed { .. } => 3,
            LogEvent::ContainerCommitted { .. } => 4,
            LogEvent::ContainerMoved { .. } => 5,
            LogEvent::ContainerMergeBegin { .. } => 6,
            LogEvent::ContainerMergeCommit { .. } => 7,
            LogEvent::OrphanChunks { .. } => 8,
            LogEvent::LogEmpty => 9,
            LogEvent::LogNew => 10,
        }
    }
}

/// A registered replay consumer. All methods default to no-ops so
/// consumers implement only the replay points they care about.
/// Background replay is at-least-once; implementations must be idempotent
/// for a repeated `log_id`.
pub trait LogConsumer: Send + Sync {
    fn replay_direct(&self, _log_id: u64, _event: &LogEvent) -> Result<()> {
        Ok(())
    }

    fn replay_background(&self, _log_id: u64, _event: &LogEvent) -> Result<()> {
        Ok(())
    }

    fn replay_dirty_start(&self, _log_id: u64, _event: &LogEvent) -> Result<()> {
        Ok(())
    }
}

struct SegmentState {
    /// Byte offset of the next record.
    tail_offset: u64,
    first_log_id: Option<u64>,
    last_log_id: Option<u64>,
}

struct TailState {
    files: Vec<File>,
    segments: Vec<SegmentState>,
    active: usize,
    next_log_id: u64,
    oldest_live_log_id: u64,
}

struct LogInner {
    paths: Vec<PathBuf>,
    max_segment_size: u64,
    tail: Mutex<TailState>,
    queue: Mutex<VecDeque<(u64, LogEvent)>>,
    queue_cond: Condvar,
    consumers: RwLock<Vec<(String, Arc<dyn LogConsumer>)>>,
    /// First log id not yet acknowledged by background replay.
    acked: AtomicU64,
    stop: AtomicBool,
    check_interval: Duration,
    fresh: bool,
}

pub struct OperationLog {
    inner: Arc<LogInner>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

fn data_start(segment: usize) -> u64 {
    if segment == 0 {
        LOG_HEADER_SIZE as u64
    } else {
        8 // segment magic
    }
}

fn padded_record_len(payload_len: usize) -> usize {
    let raw = LOG_RECORD_HEADER_SIZE + payload_len + 4;
    raw.div_ceil(LOG_RECORD_ALIGNMENT) * LOG_RECORD_ALIGNMENT
}

fn record_crc(log_id: u64, kind: u16, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&log_id.to_le_bytes());
    hasher.update(&kind.to_le_bytes());
    hasher.update(&(payload.len() as u32).to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

impl OperationLog {
    pub fn open(config: &LogConfig) -> Result<Self> {
        if config.filename.is_empty() {
            return Err(DedupError::programming("log requires at least one segment file"));
        }

        let paths: Vec<PathBuf> = config.filename.iter().map(PathBuf::from).collect();
        if let Some(parent) = paths[0].parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut files = Vec::with_capacity(paths.len());
        let fresh = !paths[0].exists();
        for (segment, path) in paths.iter().enumerate() {
            let exists = path.exists();
            let file = OpenOptions::new().create(true).read(true).write(true).open(path)?;
            if !exists {
                Self::init_segment(&file, segment)?;
            }
            files.push(file);
        }

        let (next_log_id, oldest_live) = if fresh {
            Self::write_header(&files[0], 1, 1)?;
            (1, 1)
        } else {
            Self::read_header(&files[0])?
        };

        let segments = (0..files.len())
            .map(|segment| SegmentState {
                tail_offset: data_start(segment),
                first_log_id: None,
                last_log_id: None,
            })
            .collect();

        let inner = Arc::new(LogInner {
            paths,
            max_segment_size: config.max_log_size,
            tail: Mutex::new(TailState {
                files,
                segments,
                active: 0,
                next_log_id,
                oldest_live_log_id: oldest_live,
            }),
            queue: Mutex::new(VecDeque::new()),
            queue_cond: Condvar::new(),
            consumers: RwLock::new(Vec::new()),
            acked: AtomicU64::new(oldest_live),
            stop: AtomicBool::new(false),
            check_interval: Duration::from_millis(config.replay_check_interval_ms),
            fresh,
        });

        Ok(Self {
            inner,
            worker: Mutex::new(None),
        })
    }

    fn init_segment(file: &File, segment: usize) -> Result<()> {
        if segment == 0 {
            // header is written separately
            return Ok(());
        }
        pwrite(file.as_raw_fd(), &LOG_SEGMENT_MAGIC_1_0, 0).map_err(std::io::Error::from)?;
        file.sync_data()?;
        Ok(())
    }

    fn write_header(file: &File, next_log_id: u64, oldest_live: u64) -> Result<()> {
        let mut buf = vec![0u8; LOG_HEADER_SIZE];
        buf[0..8].copy_from_slice(&LOG_HEADER_MAGIC_1_0);
        buf[8..16].copy_from_slice(&next_log_id.to_le_bytes());
        buf[16..24].copy_from_slice(&oldest_live.to_le_bytes());
        let crc = crc32fast::hash(&buf[0..24]);
        buf[24..28].copy_from_slice(&crc.to_le_bytes());
        pwrite(file.as_raw_fd(), &buf, 0).map_err(std::io::Error::from)?;
        file.sync_data()?;
        Ok(())
    }

    fn read_header(file: &File) -> Result<(u64, u64)> {
        let mut buf = vec![0u8; LOG_HEADER_SIZE];
        let got = pread(file.as_raw_fd(), &mut buf, 0).map_err(std::io::Error::from)?;
        if got < 28 || buf[0..8] != LOG_HEADER_MAGIC_1_0 {
            return Err(DedupError::integrity("log header missing or damaged"));
        }
        let crc = u32::from_le_bytes(buf[24..28].try_into().unwrap());
        if crc != crc32fast::hash(&buf[0..24]) {
            return Err(DedupError::integrity("log header crc mismatch"));
        }
        let next_log_id = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let oldest_live = u64::from_le_bytes(buf[16..24].try_into().unwrap());
        Ok((next_log_id, oldest_live))
    }

    pub fn register_consumer<S: Into<String>>(&self, name: S, consumer: Arc<dyn LogConsumer>) {
        self.inner.consumers.write().unwrap().push((name.into(), consumer));
    }

    /// Scan the segment files and replay every recovered event through the
    /// dirty-start path; recovered events are queued for background replay
    /// afterwards (consumers are idempotent). Must run before [`Self::run`].
    pub fn start(&self, first_start: bool) -> Result<()> {
        let mut recovered: Vec<(u64, u16, Vec<u8>)> = Vec::new();
        {
            let mut tail = self.inner.tail.lock().unwrap();
            let oldest_live = tail.oldest_live_log_id;
            let segment_count = tail.segments.len();
            let mut max_seen: Option<(usize, u64, u64)> = None; // segment, log_id, end offset

            for segment in 0..segment_count {
                let (records, end_offset, torn) =
                    Self::scan_segment(&tail.files[segment], segment, self.inner.max_segment_size)?;
                let mut first = None;
                let mut last = None;
                for (log_id, kind, payload) in records {
                    first.get_or_insert(log_id);
                    last = Some(log_id);
                    if log_id >= oldest_live {
                        recovered.push((log_id, kind, payload));
                    }
                }
                if let Some(last) = last {
                    if max_seen.map_or(true, |(_, id, _)| last > id) {
                        max_seen = Some((segment, last, end_offset));
                    }
                }
                if torn && last.is_some() {
                    // only the segment holding the global tail may be torn;
                    // checked below once the tail segment is known
                }
                tail.segments[segment].first_log_id = first;
                tail.segments[segment].last_log_id = last;
                tail.segments[segment].tail_offset = end_offset;
            }

            // verify torn segments, now that the tail segment is known
            for segment in 0..segment_count {
                let (_, end_offset, torn) =
                    Self::scan_segment(&tail.files[segment], segment, self.inner.max_segment_size)?;
                if torn {
                    let is_tail_segment = max_seen.map_or(true, |(seg, _, _)| seg == segment);
                    if !is_tail_segment {
                        return Err(DedupError::integrity(format!(
                            "log segment {segment} has a damaged record before the log tail"
                        )));
                    }
                    log::warn!("discarding torn record at the tail of log segment {segment}");
                    nix::unistd::ftruncate(tail.files[segment].as_raw_fd(), end_offset as i64)
                        .map_err(std::io::Error::from)?;
                }
            }

            if let Some((segment, last_id, _)) = max_seen {
                tail.active = segment;
                if last_id + 1 > tail.next_log_id {
                    tail.next_log_id = last_id + 1;
                }
            }
        }

        recovered.sort_by_key(|(log_id, _, _)| *log_id);

        if first_start {
            let event = LogEvent::LogNew;
            let log_id = self.inner.tail.lock().unwrap().next_log_id;
            for (name, consumer) in self.inner.consumers.read().unwrap().iter() {
                consumer.replay_dirty_start(log_id, &event).map_err(|err| {
                    DedupError::Other(format_err!("consumer '{name}' failed LogNew replay: {err}"))
                })?;
            }
        }

        for (log_id, kind, payload) in &recovered {
            let event: LogEvent = serde_json::from_slice(payload).map_err(|err| {
                DedupError::integrity(format!("log event {log_id} (kind {kind}) undecodable: {err}"))
            })?;
            for (name, consumer) in self.inner.consumers.read().unwrap().iter() {
                consumer.replay_dirty_start(*log_id, &event).map_err(|err| {
                    DedupError::Other(format_err!(
                        "dirty-start replay of log id {log_id} failed in consumer '{name}': {err}"
                    ))
                })?;
            }
            self.inner.queue.lock().unwrap().push_back((*log_id, event));
        }
        self.inner.queue_cond.notify_all();
        Ok(())
    }

    /// Scan one segment; returns the valid records, the end offset of the
    /// valid prefix and whether trailing damage was found.
    fn scan_segment(
        file: &File,
        segment: usize,
        max_size: u64,
    ) -> Result<(Vec<(u64, u16, Vec<u8>)>, u64, bool)> {
        let len = file.metadata()?.len().min(max_size);
        let mut offset = data_start(segment);
        let mut records = Vec::new();

        if segment != 0 && len >= 8 {
            let mut magic = [0u8; 8];
            pread(file.as_raw_fd(), &mut magic, 0).map_err(std::io::Error::from)?;
            if magic != LOG_SEGMENT_MAGIC_1_0 {
                return Err(DedupError::integrity(format!(
                    "log segment {segment} has a bad magic"
                )));
            }
        }

        while offset + LOG_RECORD_HEADER_SIZE as u64 <= len {
            let mut header = [0u8; LOG_RECORD_HEADER_SIZE];
            let got = pread(file.as_raw_fd(), &mut header, offset as i64)
                .map_err(std::io::Error::from)?;
            if got < LOG_RECORD_HEADER_SIZE {
                return Ok((records, offset, true));
            }
            let log_id = u64::from_le_bytes(header[0..8].try_into().unwrap());
            if log_id == 0 {
                // zero padding after the last record
                break;
            }
            let kind = u16::from_le_bytes(header[8..10].try_into().unwrap());
            let payload_len = u32::from_le_bytes(header[10..14].try_into().unwrap()) as usize;
            let record_len = padded_record_len(payload_len) as u64;
            if offset + record_len > len {
                return Ok((records, offset, true));
            }

            let mut body = vec![0u8; payload_len + 4];
            let got = pread(
                file.as_raw_fd(),
                &mut body,
                (offset as usize + LOG_RECORD_HEADER_SIZE) as i64,
            )
            .map_err(std::io::Error::from)?;
            if got < body.len() {
                return Ok((records, offset, true));
            }
            let payload = body[..payload_len].to_vec();
            let crc = u32::from_le_bytes(body[payload_len..].try_into().unwrap());
            if crc != record_crc(log_id, kind, &payload) {
                return Ok((records, offset, true));
            }

            records.push((log_id, kind, payload));
            offset += record_len;
        }
        Ok((records, offset, false))
    }

    /// Append an event. Direct replay consumers run before the record
    /// becomes durable; the call returns once the record is on disk.
    pub fn append(&self, event: LogEvent) -> Result<u64> {
        let payload = serde_json::to_vec(&event).map_err(|err| {
            DedupError::programming(format!("log event serialization failed: {err}"))
        })?;
        let record_len = padded_record_len(payload.len());

        let mut tail = self.inner.tail.lock().unwrap();
        if record_len as u64 > self.inner.max_segment_size - data_start(1) {
            return Err(DedupError::programming(format!(
                "log event of {record_len} bytes exceeds the segment size"
            )));
        }

        // move to the next segment when the active one is full
        if tail.segments[tail.active].tail_offset + record_len as u64 > self.inner.max_segment_size
        {
            let next = (tail.active + 1) % tail.segments.len();
            let acked = self.inner.acked.load(Ordering::Acquire);
            let recyclable = tail.segments[next]
                .last_log_id
                .map_or(true, |last| last < acked);
            if !recyclable {
                return Err(DedupError::full("operation log ring is full"));
            }
            nix::unistd::ftruncate(tail.files[next].as_raw_fd(), 0)
                .map_err(std::io::Error::from)?;
            Self::init_segment(&tail.files[next], next)?;
            if next == 0 {
                Self::write_header(
                    &tail.files[0],
                    tail.next_log_id,
                    self.inner.acked.load(Ordering::Acquire),
                )?;
            }
            tail.segments[next] = SegmentState {
                tail_offset: data_start(next),
                first_log_id: None,
                last_log_id: None,
            };
            tail.active = next;
        }

        let log_id = tail.next_log_id;

        // direct replay happens before the event becomes durable; a failing
        // consumer fails the append (the log id is burned, never reused)
        for (name, consumer) in self.inner.consumers.read().unwrap().iter() {
            if let Err(err) = consumer.replay_direct(log_id, &event) {
                tail.next_log_id += 1;
                return Err(DedupError::Other(format_err!(
                    "direct replay of log id {log_id} failed in consumer '{name}': {err}"
                )));
            }
        }

        let mut record = vec![0u8; record_len];
        record[0..8].copy_from_slice(&log_id.to_le_bytes());
        record[8..10].copy_from_slice(&event.kind().to_le_bytes());
        record[10..14].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        record[14..14 + payload.len()].copy_from_slice(&payload);
        let crc = record_crc(log_id, event.kind(), &payload);
        record[14 + payload.len()..14 + payload.len() + 4].copy_from_slice(&crc.to_le_bytes());

        let active = tail.active;
        let offset = tail.segments[active].tail_offset;
        pwrite(tail.files[active].as_raw_fd(), &record, offset as i64)
            .map_err(std::io::Error::from)?;
        tail.files[active].sync_data()?;

        tail.segments[active].tail_offset = offset + record_len as u64;
        tail.segments[active].first_log_id.get_or_insert(log_id);
        tail.segments[active].last_log_id = Some(log_id);
        tail.next_log_id = log_id + 1;
        drop(tail);

        self.inner.queue.lock().unwrap().push_back((log_id, event));
        self.inner.queue_cond.notify_all();
        Ok(log_id)
    }

    /// Start the background replay thread.
    pub fn run(&self) {
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name("log-replay".into())
            .spawn(move || background_replay_loop(inner))
            .unwrap();
        *self.worker.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) -> Result<()> {
        self.inner.stop.store(true, Ordering::Release);
        self.inner.queue_cond.notify_all();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            handle
                .join()
                .map_err(|_| DedupError::programming("log replay thread panicked"))?;
        }
        // checkpoint the header with the final replay position
        let tail = self.inner.tail.lock().unwrap();
        Self::write_header(
            &tail.files[0],
            tail.next_log_id,
            self.inner.acked.load(Ordering::Acquire),
        )?;
        Ok(())
    }

    /// Whether this log was created by this open call (first start).
    pub fn is_first_start(&self) -> bool {
        self.inner.fresh
    }

    /// First log id not yet acknowledged by background replay.
    pub fn acked_log_id(&self) -> u64 {
        self.inner.acked.load(Ordering::Acquire)
    }

    pub fn next_log_id(&self) -> u64 {
        self.inner.tail.lock().unwrap().next_log_id
    }

    /// Wait until background replay caught up with everything appended so
    /// far. Test and shutdown helper.
    pub fn wait_replayed(&self, timeout: Duration) -> bool {
        let target = self.next_log_id();
        let deadline = std::time::Instant::now() + timeout;
        while self.acked_log_id() < target {
            if std::time::Instant::now() > deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        true
    }

    pub fn outstanding_events(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }
}

fn background_replay_loop(inner: Arc<LogInner>) {
    let mut was_empty = false;
    loop {
        let entry = {
            let mut queue = inner.queue.lock().unwrap();
            loop {
                if let Some(entry) = queue.pop_front() {
                    break Some(entry);
                }
                if inner.stop.load(Ordering::Acquire) {
                    break None;
                }
                let (q, _timeout) = inner
                    .queue_cond
                    .wait_timeout(queue, inner.check_interval)
                    .unwrap();
                queue = q;
            }
        };

        match entry {
            Some((log_id, event)) => {
                was_empty = false;
                for (name, consumer) in inner.consumers.read().unwrap().iter() {
                    // at-least-once: keep retrying a failing consumer, the
                    // log may not skip ahead of it
                    let mut delay = Duration::from_millis(10);
                    while let Err(err) = consumer.replay_background(log_id, &event) {
                        log::error!(
                            "background replay of log id {log_id} failed in consumer '{name}': {err}"
                        );
                        if inner.stop.load(Ordering::Acquire) {
                            return;
                        }
                        std::thread::sleep(delay);
                        delay = (delay * 2).min(Duration::from_secs(1));
                    }
                }
                inner.acked.store(log_id + 1, Ordering::Release);
            }
            None => {
                if inner.stop.load(Ordering::Acquire) {
                    return;
                }
                // queue drained: synthesize LogEmpty once per transition
                if !was_empty {
                    was_empty = true;
                    let log_id = inner.tail.lock().unwrap().next_log_id;
                    for (name, consumer) in inner.consumers.read().unwrap().iter() {
                        if let Err(err) = consumer.replay_background(log_id, &LogEvent::LogEmpty) {
                            log::warn!("LogEmpty replay failed in consumer '{name}': {err}");
                        }
                    }
                }
            }
        }
    }
}

impl Drop for OperationLog {
    fn drop(&mut self) {
        self.inner.stop.store(true, Ordering::Release);
        self.inner.queue_cond.notify_all();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_config(name: &str, segments: usize, max_size: u64) -> (LogConfig, PathBuf) {
        let mut dir = std::env::temp_dir();
        dir.push(format!("bds-log-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let filename = (0..segments)
            .map(|segment| dir.join(format!("log-{segment}.seg")).to_string_lossy().into_owned())
            .collect();
        (
            LogConfig {
                filename,
                max_log_size: max_size,
                replay_check_interval_ms: 5,
            },
            dir,
        )
    }

    #[derive(Default)]
    struct RecordingConsumer {
        direct: Mutex<Vec<u64>>,
        background: Mutex<Vec<(u64, u16)>>,
        dirty: Mutex<Vec<u64>>,
        log_empty_seen: AtomicUsize,
    }

    impl LogConsumer for RecordingConsumer {
        fn replay_direct(&self, log_id: u64, _event: &LogEvent) -> Result<()> {
            self.direct.lock().unwrap().push(log_id);
            Ok(())
        }

        fn replay_background(&self, log_id: u64, event: &LogEvent) -> Result<()> {
            if matches!(event, LogEvent::LogEmpty) {
                self.log_empty_seen.fetch_add(1, Ordering::SeqCst);
                return Ok(());
            }
            self.background.lock().unwrap().push((log_id, event.kind()));
            Ok(())
        }

        fn replay_dirty_start(&self, log_id: u64, _event: &LogEvent) -> Result<()> {
            self.dirty.lock().unwrap().push(log_id);
            Ok(())
        }
    }

    fn committed(container_id: u64) -> LogEvent {
        LogEvent::ContainerCommitted {
            container_id,
            file_index: 0,
            slot: container_id,
        }
    }

    #[test]
    fn append_orders_and_replays() {
        let (config, dir) = test_config("order", 2, 1 << 20);
        let log = OperationLog::open(&config).unwrap();
        let consumer = Arc::new(RecordingConsumer::default());
        log.register_consumer("test", consumer.clone());
        log.start(true).unwrap();
        log.run();

        let mut ids = Vec::new();
        for container in 1..=5 {
            ids.push(log.append(committed(container)).unwrap());
        }
        assert!(ids.windows(2).all(|pair| pair[1] == pair[0] + 1));
        assert!(log.wait_replayed(Duration::from_secs(5)));

        // direct replay saw every event in order, before the append returned
        assert_eq!(*consumer.direct.lock().unwrap(), ids);
        let background = consumer.background.lock().unwrap();
        let replayed: Vec<u64> = background.iter().map(|(id, _)| *id).collect();
        assert_eq!(replayed, ids);

        log.stop().unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn log_empty_is_synthesized() {
        let (config, dir) = test_config("empty", 2, 1 << 20);
        let log = OperationLog::open(&config).unwrap();
        let consumer = Arc::new(RecordingConsumer::default());
        log.register_consumer("test", consumer.clone());
        log.start(true).unwrap();
        log.run();

        log.append(committed(1)).unwrap();
        assert!(log.wait_replayed(Duration::from_secs(5)));
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while consumer.log_empty_seen.load(Ordering::SeqCst) == 0 {
            assert!(std::time::Instant::now() < deadline, "no LogEmpty was seen");
            std::thread::sleep(Duration::from_millis(5));
        }
        log.stop().unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn recovery_replays_unacked_events() {
        let (config, dir) = test_config("recover", 2, 1 << 20);
        {
            let log = OperationLog::open(&config).unwrap();
            log.start(true).unwrap();
            // no background thread: nothing is acked before the "crash"
            for container in 1..=3 {
                log.append(committed(container)).unwrap();
            }
            // drop without stop(); header keeps oldest_live == 1
        }

        let log = OperationLog::open(&config).unwrap();
        let consumer = Arc::new(RecordingConsumer::default());
        log.register_consumer("test", consumer.clone());
        log.start(false).unwrap();

        let dirty = consumer.dirty.lock().unwrap().clone();
        assert_eq!(dirty, vec![1, 2, 3]);
        assert_eq!(log.next_log_id(), 4);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn torn_tail_is_discarded() {
        let (config, dir) = test_config("torn", 1, 1 << 20);
        {
            let log = OperationLog::open(&config).unwrap();
            log.start(true).unwrap();
            log.append(committed(1)).unwrap();
            log.append(committed(2)).unwrap();
        }
        // truncate into the middle of the second record
        let path = &config.filename[0];
        let len = std::fs::metadata(path).unwrap().len();
        let file = OpenOptions::new().write(true).open(path).unwrap();
        file.set_len(len - 5).unwrap();
        drop(file);

        let log = OperationLog::open(&config).unwrap();
        let consumer = Arc::new(RecordingConsumer::default());
        log.register_consumer("test", consumer.clone());
        log.start(false).unwrap();
        assert_eq!(*consumer.dirty.lock().unwrap(), vec![1]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn ring_recycles_acked_segments() {
        // tiny segments so a handful of events wraps the ring
        let (config, dir) = test_config("ring", 3, 2048);
        let log = OperationLog::open(&config).unwrap();
        let consumer = Arc::new(RecordingConsumer::default());
        log.register_consumer("test", consumer.clone());
        log.start(true).unwrap();
        log.run();

        for container in 1..=40 {
            log.append(committed(container)).unwrap();
            // let replay keep up so segments stay recyclable
            assert!(log.wait_replayed(Duration::from_secs(5)));
        }
        log.stop().unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unacked_ring_overflows_with_full() {
        let (config, dir) = test_config("full", 2, 1024);
        let log = OperationLog::open(&config).unwrap();
        // no consumers acked anything: background replay never runs
        log.start(true).unwrap();

        let mut full_seen = false;
        for container in 1..=64 {
            match log.append(committed(container)) {
                Ok(_) => {}
                Err(DedupError::Full(_)) => {
                    full_seen = true;
                    break;
                }
                Err(err) => panic!("unexpected error: {err}"),
            }
        }
        assert!(full_seen, "ring never reported full");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn failing_direct_consumer_fails_append() {
        struct FailingConsumer;
        impl LogConsumer for FailingConsumer {
            fn replay_direct(&self, _log_id: u64, _event: &LogEvent) -> Result<()> {
                Err(DedupError::programming("refused"))
            }
        }

        let (config, dir) = test_config("direct-fail", 1, 1 << 20);
        let log = OperationLog::open(&config).unwrap();
        log.register_consumer("failing", Arc::new(FailingConsumer));
        log.start(true).unwrap();
        assert!(log.append(committed(1)).is_err());
        // the burned id is not reused
        log.inner.consumers.write().unwrap().clear();
        let id = log.append(committed(2)).unwrap();
        assert_eq!(id, 2);
        let _ = std::fs::remove_dir_all(&dir);
    }
}

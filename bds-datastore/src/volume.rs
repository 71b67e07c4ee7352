//! Virtual block devices.
//!
//! A volume has a unique 16 bit id, a logical size and a bounded pool of
//! I/O sessions; requests are byte-addressed, aligned to the sector size,
//! and answered with a SCSI result. Block ids are namespaced per volume,
//! so every volume owns a disjoint slice of the global block id space.

use std::sync::{Arc, Condvar, Mutex};

use bds_api_types::{ChunkerType, VolumeConfig, SECTOR_SIZE};

use crate::chunker::{Chunker, RollingChunker, StaticChunker};
use crate::error::{DedupError, ErrorContext, Result};
use crate::filter::FilterChain;
use crate::idle_detector::IdleDetector;
use crate::scsi::ScsiResult;
use crate::session::{fast_copy_block, EngineRefs, Session};

/// One block request against a volume.
pub enum Request<'a> {
    Read { offset: u64, buf: &'a mut [u8] },
    Write { offset: u64, data: &'a [u8] },
}

pub struct DedupVolume {
    id: u16,
    logical_size: u64,
    config: VolumeConfig,
    refs: Arc<EngineRefs>,
    sessions: Mutex<Vec<Session>>,
    session_returned: Condvar,
    idle: Option<Arc<IdleDetector>>,
}

impl DedupVolume {
    pub fn new(
        config: &VolumeConfig,
        refs: Arc<EngineRefs>,
        chain: Arc<FilterChain>,
        idle: Option<Arc<IdleDetector>>,
    ) -> Result<Self> {
        if config.logical_size % refs.block_size as u64 != 0 {
            return Err(DedupError::programming(format!(
                "volume {} size is not a multiple of the block size",
                config.id
            )));
        }
        let chunker: Arc<dyn Chunker> = match config.chunker {
            ChunkerType::RollingHash => Arc::new(RollingChunker::new(config.avg_chunk_size)),
            ChunkerType::Static => Arc::new(StaticChunker::new(config.avg_chunk_size)),
        };
        let sessions = (0..config.session_count.max(1))
            .map(|_| Session::new(config.id, chunker.create_session(), chain.clone(), refs.clone()))
            .collect();
        Ok(Self {
            id: config.id,
            logical_size: config.logical_size,
            config: config.clone(),
            refs,
            sessions: Mutex::new(sessions),
            session_returned: Condvar::new(),
            idle,
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    pub fn logical_size(&self) -> u64 {
        self.logical_size
    }

    /// First block id of this volume's block id range.
    pub fn base_block(&self) -> u64 {
        (self.id as u64) << 32
    }

    fn acquire_session(&self) -> Session {
        let mut sessions = self.sessions.lock().unwrap();
        loop {
            if let Some(session) = sessions.pop() {
                return session;
            }
            sessions = self.session_returned.wait(sessions).unwrap();
        }
    }

    fn release_session(&self, session: Session) {
        self.sessions.lock().unwrap().push(session);
        self.session_returned.notify_one();
    }

    fn check_range(&self, offset: u64, size: usize) -> bool {
        offset % SECTOR_SIZE as u64 == 0
            && size % SECTOR_SIZE == 0
            && size > 0
            && offset + size as u64 <= self.logical_size
    }

    /// Process one request; the SCSI result encodes success or the error
    /// class.
    pub fn make_request(&self, request: Request, ec: &mut ErrorContext) -> ScsiResult {
        if let Some(idle) = &self.idle {
            idle.note_request();
        }
        match request {
            Request::Read { offset, buf } => {
                if !self.check_range(offset, buf.len()) {
                    return ScsiResult::ILLEGAL_REQUEST;
                }
                let mut session = self.acquire_session();
                let result = session.handle_read(self.base_block(), offset, buf, ec);
                self.release_session(session);
                match result {
                    Ok(()) => ScsiResult::OK,
                    Err(err) => {
                        log::error!("read request on volume {} failed - {err}", self.id);
                        ScsiResult::from_error(&err, ec, false)
                    }
                }
            }
            Request::Write { offset, data } => {
                if !self.check_range(offset, data.len()) {
                    return ScsiResult::ILLEGAL_REQUEST;
                }
                let mut session = self.acquire_session();
                let result = session.handle_write(self.base_block(), offset, data, ec);
                self.release_session(session);
                match result {
                    Ok(()) => ScsiResult::OK,
                    Err(err) => {
                        log::error!("write request on volume {} failed - {err}", self.id);
                        ScsiResult::from_error(&err, ec, true)
                    }
                }
            }
        }
    }

    /// Clone block mappings into `target` without copying chunk data.
    /// Offsets and size must be block aligned.
    pub fn fast_copy_to(
        &self,
        src_offset: u64,
        target: &DedupVolume,
        tgt_offset: u64,
        size: u64,
    ) -> Result<()> {
        let block_size = self.refs.block_size as u64;
        if src_offset % block_size != 0 || tgt_offset % block_size != 0 || size % block_size != 0 {
            return Err(DedupError::programming(
                "fast copy requires block aligned offsets and size",
            ));
        }
        if src_offset + size > self.logical_size || tgt_offset + size > target.logical_size {
            return Err(DedupError::programming("fast copy range out of bounds"));
        }
        if let Some(idle) = &self.idle {
            idle.note_request();
        }

        let blocks = size / block_size;
        for index in 0..blocks {
            let src_block = self.base_block() + (src_offset / block_size) + index;
            let tgt_block = target.base_block() + (tgt_offset / block_size) + index;
            fast_copy_block(&self.refs, src_block, tgt_block)?;
        }
        Ok(())
    }
}

//! Background container committer pool.
//!
//! Closed containers are handed over through a rendezvous channel, so at
//! most one container is in hand-over state at any time. A worker encodes
//! the container, writes it with a single aligned write, records the
//! address in the container index and appends the `ContainerCommitted`
//! event; the commit condition is broadcast afterwards.

use std::sync::Arc;

use crossbeam_channel::Receiver;

use crate::container::Container;
use crate::error::Result;
use crate::log_store::LogEvent;

use super::StoreShared;

pub(crate) struct CommitJob {
    pub container: Container,
    pub file_index: u32,
    pub slot: u64,
}

pub(crate) fn spawn_workers(
    shared: &Arc<StoreShared>,
    receiver: Receiver<CommitJob>,
    count: usize,
) -> Vec<std::thread::JoinHandle<()>> {
    (0..count)
        .map(|worker| {
            let shared = shared.clone();
            let receiver = receiver.clone();
            std::thread::Builder::new()
                .name(format!("container-commit-{worker}"))
                .spawn(move || worker_loop(shared, receiver))
                .unwrap()
        })
        .collect()
}

fn worker_loop(shared: Arc<StoreShared>, receiver: Receiver<CommitJob>) {
    while let Ok(job) = receiver.recv() {
        let container_id = job.container.id();
        match commit_container(&shared, job) {
            Ok(()) => shared.finish_commit(container_id, true),
            Err(err) => {
                log::error!("commit of container {container_id} failed - {err}");
                shared.finish_commit(container_id, false);
            }
        }
    }
}

fn commit_container(shared: &Arc<StoreShared>, job: CommitJob) -> Result<()> {
    let container_id = job.container.id();
    let buf = job.container.encode(shared.config.compression)?;

    shared.write_container_buf(job.file_index, job.slot, &buf)?;

    let address = super::ContainerAddress {
        container_id,
        file_index: job.file_index,
        slot: job.slot,
    };
    shared.store_address(container_id, &address)?;

    // the on-disk write completed above; only now may the commit event
    // become visible in the log
    shared.log.append(LogEvent::ContainerCommitted {
        container_id,
        file_index: job.file_index,
        slot: job.slot,
    })?;

    shared.cache_container(job.file_index, job.slot, Arc::new(job.container));
    shared.stats.committed_containers.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    log::debug!(
        "committed container {container_id} to file {} slot {}",
        job.file_index,
        job.slot
    );
    Ok(())
}

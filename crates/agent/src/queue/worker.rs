use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::checkpoint::{CheckpointStore, FileKey};
use crate::model::{EventGroup, GroupMetaKey};
use crate::pipeline::PipelineRegistry;

use super::process_queue::{ProcessItem, ProcessQueueManager};
use super::sender::{SenderItem, SenderQueue};

struct WorkerShared {
    manager: Arc<ProcessQueueManager>,
    registry: Arc<PipelineRegistry>,
    sender: Arc<SenderQueue>,
    checkpoints: Arc<CheckpointStore>,
    stop: AtomicBool,
}

/// Fixed pool of processing threads.
///
/// Each worker loops pop, pipeline lookup, process, hand off to the
/// sender queue. Workers never do IO: reads happen upstream, delivery in
/// the sender thread. Cancellation is cooperative at group boundaries.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shared: Arc<WorkerShared>,
}

impl WorkerPool {
    pub fn spawn(
        manager: Arc<ProcessQueueManager>,
        registry: Arc<PipelineRegistry>,
        sender: Arc<SenderQueue>,
        checkpoints: Arc<CheckpointStore>,
    ) -> Self {
        let shared = Arc::new(WorkerShared {
            manager,
            registry,
            sender,
            checkpoints,
            stop: AtomicBool::new(false),
        });
        let workers = shared.manager.workers();
        let handles = (0..workers)
            .map(|idx| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("process-{idx}"))
                    .spawn(move || worker_loop(idx, shared))
                    .expect("spawn worker thread")
            })
            .collect();
        tracing::info!(workers, "worker pool started");
        Self { handles, shared }
    }

    /// Stop after draining: hold pops, flush with a deadline, join.
    pub fn shutdown(mut self, wait: Duration) {
        let drained = self.shared.manager.flush_out(wait);
        if !drained {
            tracing::warn!("worker pool shut down with unprocessed buffers");
        }
        self.shared.stop.store(true, Ordering::Release);
        self.shared.manager.resume();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(idx: usize, shared: Arc<WorkerShared>) {
    loop {
        let Some(item) = shared.manager.pop(idx) else {
            if shared.stop.load(Ordering::Acquire) {
                break;
            }
            continue;
        };
        process_item(&shared, item);
        shared.manager.complete();
    }
    tracing::debug!(worker = idx, "worker exiting");
}

fn process_item(shared: &WorkerShared, item: ProcessItem) {
    let Some(pipeline) = shared.registry.get(&item.config_name) else {
        tracing::warn!(config = %item.config_name, "no pipeline installed, buffer dropped");
        return;
    };

    let read_len = item.data.len() as u64;
    let mut group = EventGroup::from_raw(&item.data);
    group.set_metadata(GroupMetaKey::LogFilePath, item.source.path.as_bytes());
    group.set_metadata(
        GroupMetaKey::LogFileInode,
        item.source.inode.to_string().as_bytes(),
    );
    group.set_metadata(
        GroupMetaKey::LogFileOffset,
        item.source.offset.to_string().as_bytes(),
    );
    group.set_metadata(GroupMetaKey::LogReadLength, read_len.to_string().as_bytes());
    if let Some(format) = &item.source.log_format {
        group.set_metadata(GroupMetaKey::LogFormat, format.as_bytes());
    }
    if let Some(container_id) = &item.source.container_id {
        group.set_metadata(GroupMetaKey::ContainerId, container_id.as_bytes());
    }
    if let Some(topic) = &pipeline.context().global.topic {
        group.set_metadata(GroupMetaKey::Topic, topic.as_bytes());
    }

    pipeline.process(&mut group);

    let file = FileKey::new(
        item.config_name.clone(),
        item.source.path.clone(),
        item.source.dev,
        item.source.inode,
    );
    let now = chrono::Utc::now().timestamp();

    if group.events().is_empty() {
        // Everything was filtered or merged away; the bytes are still
        // processed, so the checkpoint advances.
        if pipeline.exactly_once() {
            let (seq, _) = shared
                .checkpoints
                .register_span(&file, item.source.offset, read_len, now);
            shared.checkpoints.ack_span(&file, seq, now);
        } else {
            shared
                .checkpoints
                .update_offset(&file, item.source.offset + read_len, now);
        }
        return;
    }

    let payload = pipeline.flusher().serialize(&group);
    drop(group);

    let seq = pipeline.exactly_once().then(|| {
        shared
            .checkpoints
            .register_span(&file, item.source.offset, read_len, now)
            .0
    });
    let sender_item = SenderItem {
        config_name: item.config_name,
        key: item.key,
        payload,
        file,
        offset: item.source.offset,
        len: read_len,
        seq,
    };
    if !shared.sender.push_blocking(sender_item) {
        tracing::warn!("sender queue closed, payload dropped");
    }
}

use crate::pipeline::KnowledgePipeline;
use atomgraph_core::{FileChangeEvent, FileChangeKind, QueueConfig, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A batch of coalesced change events, ready to process.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    pub id: Uuid,
    pub events: Vec<FileChangeEvent>,
}

#[derive(Debug)]
struct PendingBatch {
    id: Uuid,
    events: Vec<FileChangeEvent>,
    opened_at: Instant,
}

impl PendingBatch {
    fn new(now: Instant) -> Self {
        Self {
            id: Uuid::new_v4(),
            events: Vec::new(),
            opened_at: now,
        }
    }

    /// Replaces an earlier event for the same path, or appends.
    fn upsert(&mut self, event: FileChangeEvent) {
        match self.events.iter_mut().find(|e| e.path == event.path) {
            Some(existing) => *existing = event,
            None => self.events.push(event),
        }
    }
}

/// Bounded queue that groups file-change events into batches.
///
/// A batch is ready once it holds `batch_size` events or its first event is
/// older than the flush timeout. With `max_batches` pending, further events
/// are folded into the oldest batch instead of opening a new one.
#[derive(Debug)]
pub struct ChangeQueue {
    config: QueueConfig,
    batches: VecDeque<PendingBatch>,
}

impl ChangeQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            batches: VecDeque::new(),
        }
    }

    pub fn push(&mut self, event: FileChangeEvent, now: Instant) {
        if event.change_type == FileChangeKind::Deleted {
            self.cancel_pending(&event.path);
        }

        if let Some(batch) = self.batches.iter_mut().find(|b| b.events.iter().any(|e| e.path == event.path)) {
            batch.upsert(event);
            return;
        }

        let open = self
            .batches
            .back()
            .map(|b| b.events.len() < self.config.batch_size)
            .unwrap_or(false);
        if open {
            if let Some(batch) = self.batches.back_mut() {
                batch.upsert(event);
            }
        } else if self.batches.len() < self.config.max_batches {
            let mut batch = PendingBatch::new(now);
            batch.upsert(event);
            self.batches.push_back(batch);
        } else if let Some(oldest) = self.batches.front_mut() {
            debug!("Queue full; coalescing {} into batch {}", event.path, oldest.id);
            oldest.upsert(event);
        }
    }

    /// Drops queued creates/modifies for `path` in every batch.
    fn cancel_pending(&mut self, path: &str) {
        for batch in self.batches.iter_mut() {
            batch.events.retain(|e| e.path != path);
        }
        self.batches.retain(|b| !b.events.is_empty());
    }

    /// Pops the oldest batch if it is full or has waited past the flush timeout.
    pub fn pop_ready(&mut self, now: Instant) -> Option<ChangeBatch> {
        let front = self.batches.front()?;
        let full = front.events.len() >= self.config.batch_size;
        let expired = now.duration_since(front.opened_at) >= self.config.flush_timeout();
        if !(full || expired) {
            return None;
        }
        self.batches.pop_front().map(|b| ChangeBatch {
            id: b.id,
            events: b.events,
        })
    }

    pub fn drain_all(&mut self) -> Vec<ChangeBatch> {
        self.batches
            .drain(..)
            .map(|b| ChangeBatch {
                id: b.id,
                events: b.events,
            })
            .collect()
    }

    /// When the oldest batch will time out.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.batches
            .front()
            .map(|b| b.opened_at + self.config.flush_timeout())
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn pending_events(&self) -> usize {
        self.batches.iter().map(|b| b.events.len()).sum()
    }
}

/// Feeds change events from a channel through a [`ChangeQueue`] into the
/// pipeline, one batch at a time.
pub struct UpdateScheduler {
    pipeline: Arc<KnowledgePipeline>,
    queue: ChangeQueue,
}

impl UpdateScheduler {
    pub fn new(pipeline: Arc<KnowledgePipeline>, config: QueueConfig) -> Self {
        Self {
            pipeline,
            queue: ChangeQueue::new(config),
        }
    }

    /// Runs until the sender side closes, then flushes whatever is pending.
    pub async fn run(mut self, mut rx: mpsc::Receiver<FileChangeEvent>) -> Result<()> {
        let period = self.queue.config.flush_timeout().max(Duration::from_millis(1));
        let mut tick = time::interval(period);
        tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.queue.push(event, Instant::now()),
                    None => break,
                },
                _ = tick.tick() => {}
            }

            while let Some(batch) = self.queue.pop_ready(Instant::now()) {
                self.process(batch).await;
            }
        }

        for batch in self.queue.drain_all() {
            self.process(batch).await;
        }
        info!("Update scheduler stopped");
        Ok(())
    }

    async fn process(&self, batch: ChangeBatch) {
        debug!("Processing batch {} ({} events)", batch.id, batch.events.len());
        if let Err(e) = self.pipeline.process_batch(batch.events).await {
            warn!("Batch {} failed: {}", batch.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(batch_size: usize, max_batches: usize) -> QueueConfig {
        QueueConfig {
            batch_size,
            max_batches,
            flush_timeout_ms: 200,
        }
    }

    fn paths(batch: &ChangeBatch) -> Vec<&str> {
        batch.events.iter().map(|e| e.path.as_str()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn small_trickle_flushes_after_timeout() {
        let mut queue = ChangeQueue::new(config(10, 4));
        let start = Instant::now();
        queue.push(FileChangeEvent::modified("a.js"), start);

        assert!(queue.pop_ready(start + Duration::from_millis(100)).is_none());
        let batch = queue.pop_ready(start + Duration::from_millis(200)).unwrap();
        assert_eq!(paths(&batch), vec!["a.js"]);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn full_batch_is_ready_immediately() {
        let mut queue = ChangeQueue::new(config(2, 4));
        let now = Instant::now();
        queue.push(FileChangeEvent::modified("a.js"), now);
        queue.push(FileChangeEvent::modified("b.js"), now);
        queue.push(FileChangeEvent::modified("c.js"), now);

        assert_eq!(queue.len(), 2);
        let batch = queue.pop_ready(now).unwrap();
        assert_eq!(paths(&batch), vec!["a.js", "b.js"]);
        assert!(queue.pop_ready(now).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn same_path_coalesces_latest_wins() {
        let mut queue = ChangeQueue::new(config(10, 4));
        let now = Instant::now();
        queue.push(FileChangeEvent::created("a.js"), now);
        queue.push(FileChangeEvent::modified("a.js"), now);

        let batches = queue.drain_all();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].events, vec![FileChangeEvent::modified("a.js")]);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_cancels_queued_reanalysis_everywhere() {
        let mut queue = ChangeQueue::new(config(1, 4));
        let now = Instant::now();
        queue.push(FileChangeEvent::modified("a.js"), now);
        queue.push(FileChangeEvent::modified("b.js"), now);
        queue.push(FileChangeEvent::deleted("a.js"), now);

        let batches = queue.drain_all();
        let all: Vec<FileChangeEvent> = batches.into_iter().flat_map(|b| b.events).collect();
        assert_eq!(
            all,
            vec![FileChangeEvent::modified("b.js"), FileChangeEvent::deleted("a.js")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn batch_limit_coalesces_into_oldest() {
        let mut queue = ChangeQueue::new(config(1, 2));
        let now = Instant::now();
        for path in ["a.js", "b.js", "c.js", "d.js"] {
            queue.push(FileChangeEvent::modified(path), now);
        }

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pending_events(), 4);
        let batches = queue.drain_all();
        assert_eq!(paths(&batches[0]), vec!["a.js", "c.js", "d.js"]);
        assert_eq!(paths(&batches[1]), vec!["b.js"]);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_tracks_oldest_batch() {
        let mut queue = ChangeQueue::new(config(10, 4));
        assert!(queue.next_deadline().is_none());
        let now = Instant::now();
        queue.push(FileChangeEvent::modified("a.js"), now);
        assert_eq!(queue.next_deadline(), Some(now + Duration::from_millis(200)));
    }
}

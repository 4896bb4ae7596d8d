//! Per-job fan-out of agent events to live observers
//!
//! Each job gets a ring buffer of its most recent events plus a broadcast
//! channel. Publishing never waits on observers: one that falls more than the
//! buffer size behind skips ahead. The durable record is `Job.logs`, not this.

use futures_util::Stream;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::agents::AgentEvent;
use crate::models::JobId;
use crate::utils::lock_mutex_recover;

/// Events kept per job for late joiners
pub const DEFAULT_BUFFER_SIZE: usize = 500;

struct JobChannel {
    buffer: VecDeque<AgentEvent>,
    /// `None` once the job is terminal; dropping it ends every feed
    tx: Option<broadcast::Sender<AgentEvent>>,
}

impl JobChannel {
    fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            buffer: VecDeque::with_capacity(capacity.min(64)),
            tx: Some(tx),
        }
    }
}

pub struct EventBroadcaster {
    capacity: usize,
    channels: Mutex<HashMap<JobId, JobChannel>>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Buffer the event and push it to every attached observer
    pub fn publish(&self, job_id: JobId, event: AgentEvent) {
        let mut channels = lock_mutex_recover(&self.channels);
        let channel = channels
            .entry(job_id)
            .or_insert_with(|| JobChannel::new(self.capacity));

        let Some(tx) = &channel.tx else {
            log::debug!("[EventBroadcaster] Job {} is closed, dropping event", job_id);
            return;
        };

        if channel.buffer.len() == self.capacity {
            channel.buffer.pop_front();
        }
        channel.buffer.push_back(event.clone());

        // Err only means nobody is attached
        let _ = tx.send(event);
    }

    /// Live feed for a job: the buffered events, then new ones until the job closes
    pub fn attach(&self, job_id: JobId) -> EventFeed {
        let mut channels = lock_mutex_recover(&self.channels);
        let channel = channels
            .entry(job_id)
            .or_insert_with(|| JobChannel::new(self.capacity));

        // Snapshot and subscribe under one lock so nothing is missed or repeated
        EventFeed {
            job_id,
            backlog: channel.buffer.clone(),
            rx: channel.tx.as_ref().map(|tx| tx.subscribe()),
        }
    }

    /// Complete every feed for the job once it reached a terminal state
    pub fn close(&self, job_id: JobId) {
        let mut channels = lock_mutex_recover(&self.channels);
        if let Some(channel) = channels.get_mut(&job_id) {
            if channel.tx.take().is_some() {
                log::debug!("[EventBroadcaster] Closed feeds for job {}", job_id);
            }
        }
    }

    /// Drop the job's buffer entirely
    pub fn remove(&self, job_id: JobId) {
        lock_mutex_recover(&self.channels).remove(&job_id);
    }

    pub fn is_closed(&self, job_id: JobId) -> bool {
        lock_mutex_recover(&self.channels)
            .get(&job_id)
            .map(|c| c.tx.is_none())
            .unwrap_or(false)
    }

    pub fn observer_count(&self, job_id: JobId) -> usize {
        lock_mutex_recover(&self.channels)
            .get(&job_id)
            .and_then(|c| c.tx.as_ref())
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    pub fn buffered(&self, job_id: JobId) -> Vec<AgentEvent> {
        lock_mutex_recover(&self.channels)
            .get(&job_id)
            .map(|c| c.buffer.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// One observer's view of a job. Dropping it detaches.
pub struct EventFeed {
    job_id: JobId,
    backlog: VecDeque<AgentEvent>,
    rx: Option<broadcast::Receiver<AgentEvent>>,
}

impl EventFeed {
    /// Next event, `None` once the job is terminal and everything was delivered
    pub async fn next(&mut self) -> Option<AgentEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }

        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    log::debug!(
                        "[EventFeed] Observer of job {} lagged, skipped {} events",
                        self.job_id,
                        skipped
                    );
                }
                Err(RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = AgentEvent> {
        futures_util::stream::unfold(self, |mut feed| async move {
            feed.next().await.map(|event| (event, feed))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::time::Duration;

    fn text(n: usize) -> AgentEvent {
        AgentEvent::text(format!("line {}", n))
    }

    #[tokio::test]
    async fn test_late_joiner_gets_backlog_then_live_events() {
        let broadcaster = EventBroadcaster::new();
        broadcaster.publish(1, text(0));
        broadcaster.publish(1, text(1));

        let mut feed = broadcaster.attach(1);
        broadcaster.publish(1, text(2));

        assert_eq!(feed.next().await, Some(text(0)));
        assert_eq!(feed.next().await, Some(text(1)));
        assert_eq!(feed.next().await, Some(text(2)));
    }

    #[tokio::test]
    async fn test_buffer_is_bounded() {
        let broadcaster = EventBroadcaster::with_capacity(3);
        for n in 0..10 {
            broadcaster.publish(1, text(n));
        }
        assert_eq!(broadcaster.buffered(1), vec![text(7), text(8), text(9)]);
    }

    #[tokio::test]
    async fn test_close_completes_feed_after_result() {
        let broadcaster = EventBroadcaster::new();
        let feed = broadcaster.attach(4);

        broadcaster.publish(4, text(0));
        broadcaster.publish(4, AgentEvent::success("done"));
        broadcaster.close(4);
        broadcaster.publish(4, text(99));

        let events: Vec<AgentEvent> = tokio::time::timeout(
            Duration::from_secs(1),
            feed.into_stream().collect::<Vec<_>>(),
        )
        .await
        .unwrap();
        assert_eq!(events, vec![text(0), AgentEvent::success("done")]);
        assert!(broadcaster.is_closed(4));
    }

    #[tokio::test]
    async fn test_attach_after_close_replays_and_ends() {
        let broadcaster = EventBroadcaster::new();
        broadcaster.publish(2, AgentEvent::failure("boom"));
        broadcaster.close(2);

        let mut feed = broadcaster.attach(2);
        assert_eq!(feed.next().await, Some(AgentEvent::failure("boom")));
        assert_eq!(feed.next().await, None);
    }

    #[tokio::test]
    async fn test_slow_observer_never_blocks_publish() {
        let broadcaster = EventBroadcaster::with_capacity(4);
        let mut slow = broadcaster.attach(3);

        for n in 0..100 {
            broadcaster.publish(3, text(n));
        }
        broadcaster.close(3);

        // Skips ahead to whatever the channel still holds
        let mut received = Vec::new();
        while let Some(event) = slow.next().await {
            received.push(event);
        }
        assert!(received.len() <= 4);
        assert_eq!(received.last(), Some(&text(99)));
    }

    #[tokio::test]
    async fn test_detach_leaves_other_observers_alone() {
        let broadcaster = EventBroadcaster::new();
        let first = broadcaster.attach(5);
        let mut second = broadcaster.attach(5);
        assert_eq!(broadcaster.observer_count(5), 2);

        drop(first);
        assert_eq!(broadcaster.observer_count(5), 1);

        broadcaster.publish(5, text(1));
        assert_eq!(second.next().await, Some(text(1)));
    }

    #[tokio::test]
    async fn test_jobs_are_independent() {
        let broadcaster = EventBroadcaster::new();
        let mut a = broadcaster.attach(10);
        broadcaster.publish(11, text(1));
        broadcaster.publish(10, text(2));
        broadcaster.close(11);

        assert_eq!(a.next().await, Some(text(2)));
        assert!(!broadcaster.is_closed(10));
    }
}

//! Deterministic replay of a finished room session. A static, time-ordered
//! event slice is re-driven through the same [`EventConsumer`] seam as the
//! live path, under a virtual playhead that advances with wall-clock time
//! but can be paused, stopped, and seeked. One wake timer is outstanding
//! at most; every transition cancels and replaces it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use shared::event::{EventLookup, Recording, RoomEvent};
use tokio::{task::JoinHandle, time::Instant};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::{
    aggregate::EventConsumer,
    config::EngineConfig,
    error::ReplayError,
    EventLog, RoomUpdate,
};

pub struct Replay {
    inner: Arc<Mutex<ReplayInner>>,
}

struct ReplayInner {
    events: Vec<RoomEvent>,
    consumers: Vec<Box<dyn EventConsumer>>,
    started_at: DateTime<Utc>,
    /// Total replayable span, milliseconds.
    duration_ms: i64,
    /// How many events have been applied.
    cursor: usize,
    /// Virtual time already elapsed while paused or stopped.
    delta: Duration,
    /// Wall-clock instant playback last resumed; `None` while paused.
    unpaused_at: Option<Instant>,
    /// Set by `stop` (and by reaching the end); the next `play` rewinds.
    stopped: bool,
    timer: Option<JoinHandle<()>>,
    lookahead: Duration,
    updates: broadcast::Sender<RoomUpdate>,
}

impl Replay {
    /// Fetches the recording's event slice (beginning a pre-roll window
    /// before the recording start, so already-joined peers are part of the
    /// picture), primes fresh aggregators with the backlog, and applies
    /// everything up to the nominal start instant. Fails without touching
    /// the consumers if the recording has not finished.
    pub async fn load(
        event_log: &dyn EventLog,
        recording: &Recording,
        mut consumers: Vec<Box<dyn EventConsumer>>,
        updates: broadcast::Sender<RoomUpdate>,
        config: &EngineConfig,
    ) -> Result<Self, ReplayError> {
        let stopped_at = recording
            .stopped_at
            .ok_or(ReplayError::RecordingNotFinished)?;
        let duration_ms = (stopped_at - recording.started_at).num_milliseconds().max(0);

        let events = fetch_slice(
            event_log,
            recording,
            stopped_at,
            config.replay_pre_roll(),
            config.fetch_limit,
        )
        .await?;
        info!(
            room_id = %recording.room_id,
            events = events.len(),
            duration_ms,
            "recording slice loaded"
        );

        for consumer in &mut consumers {
            consumer.prepare(&events);
        }

        let mut inner = ReplayInner {
            events,
            consumers,
            started_at: recording.started_at,
            duration_ms,
            cursor: 0,
            delta: Duration::ZERO,
            unpaused_at: None,
            stopped: false,
            timer: None,
            lookahead: config.replay_lookahead(),
            updates,
        };
        // Pre-roll events sit at non-positive offsets; apply them so the
        // initial state matches the recording start.
        inner.apply_until(0);

        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    /// Starts (or resumes) playback. After a `stop` this rewinds to zero
    /// first.
    pub fn play(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.stopped {
            inner.rewind_to(0);
            inner.stopped = false;
        }
        if inner.unpaused_at.is_none() {
            inner.unpaused_at = Some(Instant::now());
        }
        Self::schedule(&self.inner, &mut inner);
    }

    /// Freezes the playhead where it is.
    pub fn pause(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.fold_elapsed();
        inner.cancel_timer();
    }

    /// Like pause, but returns the playhead to zero; the next `play`
    /// replays from the beginning.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.fold_elapsed();
        inner.cancel_timer();
        inner.delta = Duration::ZERO;
        inner.stopped = true;
    }

    /// Seeks to `position`, clamped to `[0, duration]`. State is rebuilt by
    /// resetting every consumer and re-applying events from the top; if
    /// playback was running it continues from the new position.
    pub fn rewind(&self, position: Duration) {
        let mut inner = self.inner.lock().unwrap();
        let position_ms = (position.as_millis() as i64).clamp(0, inner.duration_ms);
        inner.rewind_to(position_ms);
        inner.stopped = false;
        if inner.unpaused_at.is_some() {
            inner.unpaused_at = Some(Instant::now());
            Self::schedule(&self.inner, &mut inner);
        } else {
            inner.cancel_timer();
        }
    }

    /// Current virtual playhead.
    pub fn position(&self) -> Duration {
        let inner = self.inner.lock().unwrap();
        Duration::from_millis(inner.progress_ms().clamp(0, inner.duration_ms) as u64)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.inner.lock().unwrap().duration_ms as u64)
    }

    pub fn is_playing(&self) -> bool {
        self.inner.lock().unwrap().unpaused_at.is_some()
    }

    /// One wake of the scheduler: apply everything due, then either finish
    /// or arm the timer for the next event.
    fn tick(inner_arc: &Arc<Mutex<ReplayInner>>) {
        let mut inner = inner_arc.lock().unwrap();
        if inner.unpaused_at.is_none() {
            // A pause or stop raced this wake; its timer is already gone.
            return;
        }
        let progress = inner.progress_ms();
        inner.apply_until(progress);
        if progress >= inner.duration_ms {
            debug!("replay reached the end of the recording");
            inner.unpaused_at = None;
            inner.delta = Duration::ZERO;
            inner.stopped = true;
            inner.timer = None;
            let _ = inner.updates.send(RoomUpdate::ReplayFinished);
            return;
        }
        Self::schedule(inner_arc, &mut inner);
    }

    /// Replaces the outstanding timer with one armed for the next
    /// unconsumed event, or for the remaining span to `duration` once the
    /// slice is exhausted, so the end is always detected.
    fn schedule(inner_arc: &Arc<Mutex<ReplayInner>>, inner: &mut ReplayInner) {
        inner.cancel_timer();
        let wait_ms = match inner.events.get(inner.cursor) {
            Some(next) => (inner.offset_ms(next) - inner.progress_ms()).max(0) as u64,
            None => (inner.duration_ms - inner.progress_ms()).max(0) as u64,
        };
        let delay = Duration::from_millis(wait_ms) + inner.lookahead;
        let arc = Arc::clone(inner_arc);
        inner.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            Replay::tick(&arc);
        }));
    }
}

impl Drop for Replay {
    fn drop(&mut self) {
        self.inner.lock().unwrap().cancel_timer();
    }
}

impl ReplayInner {
    fn offset_ms(&self, event: &RoomEvent) -> i64 {
        (event.created_at - self.started_at).num_milliseconds()
    }

    fn progress_ms(&self) -> i64 {
        let running = self
            .unpaused_at
            .map(|at| at.elapsed().as_millis() as i64)
            .unwrap_or(0);
        self.delta.as_millis() as i64 + running
    }

    /// Advances the cursor, applying every event stamped at or before
    /// `position_ms`, strictly in slice order.
    fn apply_until(&mut self, position_ms: i64) {
        let ReplayInner {
            events,
            consumers,
            cursor,
            started_at,
            ..
        } = self;
        while let Some(event) = events.get(*cursor) {
            if (event.created_at - *started_at).num_milliseconds() > position_ms {
                break;
            }
            for consumer in consumers.iter_mut() {
                consumer.put(event);
            }
            *cursor += 1;
        }
    }

    /// Resets every consumer and re-applies events from the top of the
    /// slice through `position_ms`. State is always rebuilt by replaying,
    /// never mutated out of band.
    fn rewind_to(&mut self, position_ms: i64) {
        for consumer in &mut self.consumers {
            consumer.reset();
        }
        self.cursor = 0;
        self.apply_until(position_ms);
        self.delta = Duration::from_millis(position_ms as u64);
    }

    fn fold_elapsed(&mut self) {
        if let Some(at) = self.unpaused_at.take() {
            self.delta += at.elapsed();
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

async fn fetch_slice(
    event_log: &dyn EventLog,
    recording: &Recording,
    stopped_at: DateTime<Utc>,
    pre_roll: chrono::Duration,
    limit: usize,
) -> Result<Vec<RoomEvent>, ReplayError> {
    let mut events: Vec<RoomEvent> = Vec::new();
    let mut seen = HashSet::new();
    let mut since = recording.started_at - pre_roll;
    loop {
        let page = event_log
            .fetch(
                EventLookup {
                    room_id: recording.room_id.clone(),
                    since: Some(since),
                },
                limit,
            )
            .await
            .map_err(ReplayError::Fetch)?;
        let page_len = page.len();
        let Some(last) = page.last() else {
            break;
        };
        let next_since = last.created_at;
        for event in page {
            if event.created_at > stopped_at {
                continue;
            }
            if seen.insert(event.id.clone()) {
                events.push(event);
            }
        }
        // `next_since <= since` would mean the log is not advancing the
        // window; bail rather than spin.
        if page_len < limit || next_since > stopped_at || next_since <= since {
            break;
        }
        since = next_since;
    }
    // The log serves (created_at, id) order per page; enforce it across
    // page boundaries too.
    events.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.as_str().cmp(b.id.as_str()))
    });
    Ok(events)
}

#[cfg(test)]
#[path = "tests/replay_tests.rs"]
mod tests;

//! Delta aggregator
//!
//! Turns key intents and observed local drift into a single ordered stream of
//! remote volume deltas. Pure state machine: the caller passes the current
//! time in and performs the remote call for each [`Flush`] it is handed.
//!
//! - Same-direction events inside the aggregation window form one burst.
//! - A direction reversal closes the pending burst first.
//! - Local drift that matches the echo of already-counted key presses is
//!   absorbed instead of being counted a second time.
//! - At most one flush is in flight; failed flushes are retried with their
//!   recorded magnitude, then dropped.

use std::collections::VecDeque;
#[cfg(test)]
use std::time::Duration;
use std::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::{StepMode, StepSettings};
use crate::keys::Direction;
use crate::observer::RelativeDelta;

/// Aggregator state as seen from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Accumulating,
    Flushing,
}

impl Phase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Accumulating => "accumulating",
            Self::Flushing => "flushing",
        }
    }
}

/// One closed burst, ready to be applied to the remote speaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flush {
    pub id: u64,
    pub direction: Direction,
    /// Key presses plus observed steps in the burst
    pub steps: u32,
    /// Consecutive same-direction burst index, starting at 1
    pub rank: u32,
    /// Percent points to move the remote level
    pub percent: u32,
    /// Retries already spent on this flush
    pub attempt: u32,
}

impl Flush {
    /// Signed remote delta
    #[must_use]
    pub fn delta(&self) -> i32 {
        self.direction.sign() * self.percent as i32
    }
}

/// Result of a flush reported back by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Applied,
    Failed,
}

/// What [`DeltaAggregator::complete`] did with the flush
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Applied(Flush),
    /// Re-queued with the same magnitude
    Retrying(Flush),
    /// Retry budget exhausted
    Dropped(Flush),
    /// Unknown id (already completed or abandoned)
    Stale,
}

#[derive(Debug)]
struct Pending {
    direction: Direction,
    key_steps: u32,
    observed_steps: u32,
    started: Instant,
    last_event: Instant,
    /// Observed drift closes the burst without waiting for the window
    due: bool,
}

#[derive(Debug)]
struct Echo {
    direction: Direction,
    percent: u32,
    expires: Instant,
}

#[derive(Debug)]
struct Closed {
    direction: Direction,
    at: Instant,
    rank: u32,
}

/// The reconciliation state machine
#[derive(Debug)]
pub struct DeltaAggregator {
    settings: StepSettings,
    pending: Option<Pending>,
    echo: Option<Echo>,
    ready: VecDeque<(Flush, Instant)>,
    in_flight: Option<Flush>,
    last_closed: Option<Closed>,
    flush_requested: bool,
    next_id: u64,
    dropped: u64,
}

impl DeltaAggregator {
    #[must_use]
    pub fn new(settings: StepSettings) -> Self {
        Self {
            settings,
            pending: None,
            echo: None,
            ready: VecDeque::new(),
            in_flight: None,
            last_closed: None,
            flush_requested: false,
            next_id: 1,
            dropped: 0,
        }
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        if self.in_flight.is_some() || !self.ready.is_empty() {
            Phase::Flushing
        } else if self.pending.is_some() {
            Phase::Accumulating
        } else {
            Phase::Idle
        }
    }

    /// Nothing pending, queued, or in flight
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.pending.is_none() && self.ready.is_empty() && self.in_flight.is_none()
    }

    /// Deltas dropped after exhausting retries (or abandoned at shutdown)
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    // ========================================================================
    // Inputs
    // ========================================================================

    /// Count one accepted key press
    pub fn push_key(&mut self, direction: Direction, now: Instant) {
        self.expire_echo(now);
        self.close_if_reversed(direction, now);

        let pending = self.pending.get_or_insert_with(|| Pending::new(direction, now));
        pending.key_steps += 1;
        pending.last_event = now;
        trace!("Key {} ({} in burst)", direction, pending.key_steps);

        let key_echo = u32::from(self.settings.key_echo);
        if key_echo == 0 {
            return;
        }
        let expires = now + self.settings.echo_window;
        match self.echo.as_mut() {
            Some(echo) if echo.direction == direction => {
                echo.percent += key_echo;
                echo.expires = expires;
            }
            _ => {
                self.echo = Some(Echo {
                    direction,
                    percent: key_echo,
                    expires,
                });
            }
        }
    }

    /// Merge an observed local level change
    pub fn push_observed(&mut self, delta: RelativeDelta, now: Instant) {
        let Some(direction) = Direction::of(delta.percent) else {
            return;
        };
        let mut remaining = delta.steps();

        self.expire_echo(now);
        if let Some(echo) = self.echo.as_mut()
            && echo.direction == direction
        {
            let absorbed = remaining.min(echo.percent);
            echo.percent -= absorbed;
            remaining -= absorbed;
            if absorbed > 0 {
                debug!("Absorbed {}% of local drift as key echo", absorbed);
            }
            if echo.percent == 0 {
                self.echo = None;
            }
        }

        if remaining == 0 {
            return;
        }

        self.close_if_reversed(direction, now);
        let pending = self.pending.get_or_insert_with(|| Pending::new(direction, now));
        pending.observed_steps += remaining;
        pending.last_event = now;
        pending.due = true;
    }

    /// Close the pending burst at the next poll (shutdown, target inactive)
    pub fn request_flush(&mut self) {
        if self.pending.is_some() {
            self.flush_requested = true;
        }
    }

    // ========================================================================
    // Flushing
    // ========================================================================

    /// Hand out the next flush to apply, if one is due and none is in flight
    pub fn poll(&mut self, now: Instant) -> Option<Flush> {
        if self.pending_is_due(now) {
            self.close_pending(now);
        }
        self.flush_requested = false;

        if self.in_flight.is_some() {
            return None;
        }
        let (_, not_before) = self.ready.front()?;
        if *not_before > now {
            return None;
        }

        let (flush, _) = self.ready.pop_front()?;
        self.in_flight = Some(flush.clone());
        Some(flush)
    }

    /// When [`poll`](Self::poll) next has something to do
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        let pending = self.pending.as_ref().map(|p| {
            if p.due || self.flush_requested {
                p.last_event
            } else {
                (p.last_event + self.settings.aggregation_window)
                    .min(p.started + self.settings.max_burst_age)
            }
        });
        let ready = if self.in_flight.is_none() {
            self.ready.front().map(|(_, not_before)| *not_before)
        } else {
            None
        };

        match (pending, ready) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Report the outcome of the flush handed out by [`poll`](Self::poll)
    pub fn complete(&mut self, id: u64, outcome: FlushOutcome, now: Instant) -> Completion {
        let Some(flush) = self.in_flight.take_if(|f| f.id == id) else {
            return Completion::Stale;
        };

        match outcome {
            FlushOutcome::Applied => Completion::Applied(flush),
            FlushOutcome::Failed if flush.attempt < self.settings.flush_retries => {
                let retry = Flush {
                    attempt: flush.attempt + 1,
                    ..flush
                };
                debug!(
                    "Retrying flush {} ({:+}%), attempt {}",
                    retry.id,
                    retry.delta(),
                    retry.attempt
                );
                self.ready
                    .push_front((retry.clone(), now + self.settings.retry_delay));
                Completion::Retrying(retry)
            }
            FlushOutcome::Failed => {
                self.dropped += 1;
                warn!(
                    "Dropped remote delta {:+}% after {} retries",
                    flush.delta(),
                    flush.attempt
                );
                Completion::Dropped(flush)
            }
        }
    }

    /// Give up on everything not yet applied; returns how many deltas were lost
    pub fn abandon(&mut self) -> u64 {
        let mut lost = self.ready.len() as u64;
        if self.in_flight.take().is_some() {
            lost += 1;
        }
        if self.pending.take().is_some() {
            lost += 1;
        }
        self.ready.clear();
        self.flush_requested = false;
        self.dropped += lost;
        lost
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn pending_is_due(&self, now: Instant) -> bool {
        self.pending.as_ref().is_some_and(|p| {
            p.due
                || self.flush_requested
                || now.saturating_duration_since(p.last_event) >= self.settings.aggregation_window
                || now.saturating_duration_since(p.started) >= self.settings.max_burst_age
        })
    }

    fn expire_echo(&mut self, now: Instant) {
        if self.echo.as_ref().is_some_and(|e| now >= e.expires) {
            self.echo = None;
        }
    }

    fn close_if_reversed(&mut self, direction: Direction, now: Instant) {
        if self
            .pending
            .as_ref()
            .is_some_and(|p| p.direction != direction)
        {
            self.close_pending(now);
        }
    }

    fn close_pending(&mut self, now: Instant) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let steps = pending.key_steps + pending.observed_steps;
        if steps == 0 {
            return;
        }

        let rank = match &self.last_closed {
            Some(prev)
                if prev.direction == pending.direction
                    && pending.started.saturating_duration_since(prev.at)
                        <= self.settings.burst_reset =>
            {
                prev.rank + 1
            }
            _ => 1,
        };
        let percent = step_percent(&self.settings, steps, rank);

        let flush = Flush {
            id: self.next_id,
            direction: pending.direction,
            steps,
            rank,
            percent,
            attempt: 0,
        };
        self.next_id += 1;
        debug!(
            "Burst closed: {} steps {} (rank {}) -> {:+}%",
            steps,
            pending.direction,
            rank,
            flush.delta()
        );

        self.last_closed = Some(Closed {
            direction: pending.direction,
            at: now,
            rank,
        });
        self.ready.push_back((flush, now));
    }
}

impl Pending {
    fn new(direction: Direction, now: Instant) -> Self {
        Self {
            direction,
            key_steps: 0,
            observed_steps: 0,
            started: now,
            last_event: now,
            due: false,
        }
    }
}

/// Percent points for `steps` in a burst of the given rank
#[must_use]
pub fn step_percent(settings: &StepSettings, steps: u32, rank: u32) -> u32 {
    let base = f64::from(steps) * settings.volume_step;
    let percent = match settings.mode {
        StepMode::Linear => base.round(),
        StepMode::Exponential { factor } => {
            let exponent = i32::try_from(rank.saturating_sub(1)).unwrap_or(i32::MAX);
            (base * factor.powi(exponent))
                .round()
                .min(f64::from(settings.max_burst_percent))
        }
    };
    (percent.min(100.0) as u32).max(1)
}

#[cfg(test)]
pub(crate) fn default_step_settings() -> StepSettings {
    StepSettings {
        volume_step: 1.0,
        mode: StepMode::Linear,
        aggregation_window: Duration::from_millis(200),
        burst_reset: Duration::from_millis(600),
        max_burst_age: Duration::from_millis(1000),
        max_burst_percent: 10,
        echo_window: Duration::from_millis(500),
        key_echo: 0,
        flush_retries: 2,
        retry_delay: Duration::from_millis(500),
    }
}

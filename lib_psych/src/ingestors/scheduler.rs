//! # Poll Scheduler
//!
//! Fires on a fixed grid: every `interval`, counted from a time of day (the
//! time offset constant). With a 60 second interval and an offset of
//! `00:00:30` the scheduler fires at half past every minute, whatever time
//! the process started.
//!
//! The scheduler never touches the network or the pipeline state. It sends a
//! [`WorkerCommand::Tick`] and goes back to sleep; the worker decides which
//! resources actually start a cycle.

use std::time::Duration;

use chrono::{DateTime, NaiveTime, TimeDelta, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::configs::{ConfigError, PsychConfig};
use crate::ingestors::psych_polling::WorkerCommand;

/// # Next Fire
///
/// The first instant strictly after `now` on the grid
/// `reference + k * interval`, where `reference` is today at `offset`, or
/// yesterday at `offset` when today's is still ahead of `now`.
pub fn next_fire(now: DateTime<Utc>, interval: Duration, offset: NaiveTime) -> DateTime<Utc> {
    let mut reference = now.date_naive().and_time(offset).and_utc();
    if reference > now {
        reference -= TimeDelta::days(1);
    }

    let step = i64::try_from(interval.as_millis()).unwrap_or(i64::MAX).max(1);
    let elapsed = (now - reference).num_milliseconds();
    let steps = elapsed / step + 1;
    reference + TimeDelta::milliseconds(steps.saturating_mul(step))
}

/// The timer task.
pub struct Scheduler {
    interval: Duration,
    offset: NaiveTime,
    tolerable_delay: Duration,
    commands: mpsc::Sender<WorkerCommand>,
    cancel: CancellationToken,
}

impl Scheduler {
    /// A scheduler for `config`, sending ticks to `commands` until `cancel` fires.
    pub fn new(
        config: &PsychConfig,
        commands: mpsc::Sender<WorkerCommand>,
        cancel: CancellationToken,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            interval: config.interval(),
            offset: config.time_offset()?,
            tolerable_delay: config.tolerable_delay(),
            commands,
            cancel,
        })
    }

    /// # Main Loop
    ///
    /// 1. Compute the next fire time from the wall clock.
    /// 2. Sleep until then, or stop on cancellation.
    /// 3. Log how late the timer woke up.
    /// 4. Send the tick; stop if the worker is gone.
    pub async fn run(self) {
        log::info!(
            "Scheduler started: every {:?} from {}",
            self.interval,
            self.offset
        );

        loop {
            // --- Phase 1: Next Grid Point ---
            let now = Utc::now();
            let due = next_fire(now, self.interval, self.offset);
            let wait = (due - now).to_std().unwrap_or_default();

            // --- Phase 2: Sleep ---
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            // --- Phase 3: Timer Accuracy ---
            let late = (Utc::now() - due).to_std().unwrap_or_default();
            log::debug!("Timer for {} fired {}ms late", due, late.as_millis());
            if late > self.tolerable_delay {
                log::warn!(
                    "Timer for {} fired {}ms late, tolerable delay is {}ms",
                    due,
                    late.as_millis(),
                    self.tolerable_delay.as_millis()
                );
            }

            // --- Phase 4: Hand Over ---
            if self.commands.send(WorkerCommand::Tick { due }).await.is_err() {
                log::warn!("Polling worker is gone, scheduler exiting");
                break;
            }
        }

        log::info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn time(s: &str) -> NaiveTime {
        NaiveTime::parse_from_str(s, "%H:%M:%S").unwrap()
    }

    #[test]
    fn test_aligned_to_offset() {
        let next = next_fire(at("2024-03-01T10:15:42Z"), Duration::from_secs(60), time("00:00:30"));
        assert_eq!(next, at("2024-03-01T10:16:30Z"));
    }

    #[test]
    fn test_strictly_after_now() {
        let next = next_fire(at("2024-03-01T10:16:30Z"), Duration::from_secs(60), time("00:00:30"));
        assert_eq!(next, at("2024-03-01T10:17:30Z"));
    }

    #[test]
    fn test_offset_later_today_uses_yesterday() {
        // 23:00 offset has not happened yet at 10:15, so the grid starts yesterday.
        let next = next_fire(at("2024-03-01T10:15:00Z"), Duration::from_secs(3600), time("23:00:00"));
        assert_eq!(next, at("2024-03-01T11:00:00Z"));
    }

    #[test]
    fn test_daily_interval() {
        let next = next_fire(at("2024-03-01T10:15:00Z"), Duration::from_secs(86_400), time("06:00:00"));
        assert_eq!(next, at("2024-03-02T06:00:00Z"));
    }
}

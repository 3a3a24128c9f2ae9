//! The retention sweeper.
//!
//! Finished jobs keep their record and files around for a retention window so that clients can
//! poll the final status and download the result. Once the window has passed the sweeper
//! deletes the job's files and then its record.
//!
//! The sweeper runs on a [`SweepSchedule`]: either a fixed interval or a [`cron::Schedule`] for
//! deployments that prefer to clean up at quiet times of day.
//!
//! Each sweep
//!
//! - asks the backend for expired jobs ([`crate::backend::Backend::list_expired`]),
//! - skips anything that is not terminal, or became terminal less than the grace period ago,
//! - deletes the job's files best-effort, logging failures without aborting the sweep,
//! - deletes the record, and
//! - removes orphaned files in the storage directories that belong to no known job and are
//!   older than the retention window.
//!
//! Jobs that are still processing are never swept, regardless of their age.
//!
//! # Example
//!
//! Sweep every five minutes, keeping results for 12 hours:
//!
//! ```
//! # use std::time::Duration;
//! use voxjob::config::Config;
//!
//! let config = Config::default()
//!     .with_retention(Duration::from_secs(12 * 60 * 60))
//!     .with_sweep_interval(Duration::from_secs(5 * 60));
//! ```
//!
//! Or on a cron schedule, at the top of every hour:
//!
//! ```
//! use voxjob::config::Config;
//!
//! let config = Config::default().with_sweep_cron("0 0 * * * *");
//! assert!(config.sweep_schedule().is_ok());
//! ```
use std::time::Duration;

use chrono::{DateTime, Utc};

pub(crate) mod runner;

/// When the sweeper runs.
#[derive(Debug, Clone)]
pub enum SweepSchedule {
    /// Run once per interval, measured from the end of the previous sweep.
    Every(Duration),
    /// Run at every upcoming time of the cron schedule.
    Cron(Box<cron::Schedule>),
}

impl SweepSchedule {
    /// The next time the sweeper should fire, strictly after `after`.
    pub(crate) fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Every(interval) => {
                chrono::TimeDelta::from_std(*interval).ok().map(|delta| after + delta)
            }
            Self::Cron(schedule) => schedule.after(&after).next(),
        }
    }
}

/// Outcome of a single sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub jobs_removed: usize,
    pub jobs_skipped: usize,
    pub files_removed: usize,
    pub files_failed: usize,
    pub orphans_removed: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.jobs_removed == 0 && self.files_removed == 0 && self.orphans_removed == 0
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use chrono::{TimeDelta, Timelike};

    use super::*;

    #[test]
    fn interval_schedule() {
        let now = Utc::now();
        let schedule = SweepSchedule::Every(Duration::from_secs(90));
        assert_eq!(schedule.next_after(now), Some(now + TimeDelta::seconds(90)));
    }

    #[test]
    fn cron_schedule() {
        let schedule = SweepSchedule::Cron(Box::new(
            cron::Schedule::from_str("0 0 * * * *").unwrap(),
        ));
        let now = Utc::now();
        let next = schedule.next_after(now).unwrap();
        assert!(next > now);
        assert!(next - now <= TimeDelta::hours(1));
        assert_eq!(next.minute(), 0);
        assert_eq!(next.second(), 0);
    }
}

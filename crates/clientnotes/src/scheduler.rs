//! Weekly and monthly job trigger.
//!
//! Runs in its own thread on a current-thread tokio runtime and submits a
//! scheduled job whenever a cadence comes due, or when a kind is sent on
//! the manual trigger channel. Triggers that fire together each submit
//! their own job; the worker pool bounds how many run at once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::{DateTime, Datelike, Days, Local, LocalResult, Months, NaiveDate, NaiveDateTime, TimeZone};
use tokio::sync::{broadcast, Notify};

use crate::config::{MonthlySchedule, ScheduleConfig, WeeklySchedule};
use crate::error::WorkerError;
use crate::worker::job::{JobId, JobKind, JobRequest};
use crate::worker::JobQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Weekly(WeeklySchedule),
    Monthly(MonthlySchedule),
}

impl Cadence {
    pub fn kind(&self) -> JobKind {
        match self {
            Cadence::Weekly(_) => JobKind::ScheduledWeekly,
            Cadence::Monthly(_) => JobKind::ScheduledMonthly,
        }
    }

    /// Enabled cadences from configuration.
    pub fn from_config(config: &ScheduleConfig) -> Vec<Cadence> {
        if !config.enabled {
            return Vec::new();
        }
        config
            .weekly
            .map(Cadence::Weekly)
            .into_iter()
            .chain(config.monthly.map(Cadence::Monthly))
            .collect()
    }
}

/// First time strictly after `now` at which `cadence` is due, in `now`'s
/// time zone.
pub fn next_fire<Tz: TimeZone>(cadence: &Cadence, now: &DateTime<Tz>) -> DateTime<Tz> {
    let tz = now.timezone();
    let today = now.date_naive();

    let candidate = |date: NaiveDate| {
        let (hour, minute) = match cadence {
            Cadence::Weekly(w) => (w.hour, w.minute),
            Cadence::Monthly(m) => (m.hour, m.minute),
        };
        date.and_hms_opt(hour, minute, 0)
            .map(|naive| resolve_local(&tz, naive))
    };

    let mut dates: Vec<NaiveDate> = match cadence {
        Cadence::Weekly(w) => {
            let current = today.weekday().num_days_from_monday();
            let ahead = (w.weekday + 7 - current) % 7;
            [ahead, ahead + 7]
                .iter()
                .filter_map(|days| today.checked_add_days(Days::new(u64::from(*days))))
                .collect()
        }
        Cadence::Monthly(m) => {
            let first = today.with_day(1).unwrap_or(today);
            [0, 1]
                .iter()
                .filter_map(|months| first.checked_add_months(Months::new(*months)))
                .filter_map(|month| month.with_day(m.day))
                .collect()
        }
    };
    dates.sort();

    dates
        .into_iter()
        .filter_map(candidate)
        .find(|at| at > now)
        // Unreachable with validated schedules; a day later keeps the loop moving.
        .unwrap_or_else(|| now.clone() + chrono::Duration::days(1))
}

/// Maps a local wall-clock time to an instant, taking the earlier one on a
/// DST overlap and skipping forward over a DST gap.
fn resolve_local<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(at) => at,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => resolve_local(tz, naive + chrono::Duration::hours(1)),
    }
}

pub struct ScheduleTrigger {
    cadences: Vec<Cadence>,
    queue: JobQueue,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl ScheduleTrigger {
    pub fn new(config: &ScheduleConfig, queue: JobQueue) -> Self {
        Self::with_cadences(Cadence::from_config(config), queue)
    }

    pub fn with_cadences(cadences: Vec<Cadence>, queue: JobQueue) -> Self {
        Self {
            cadences,
            queue,
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn cadences(&self) -> &[Cadence] {
        &self.cadences
    }

    /// Starts the trigger loop in a background thread. Kinds sent on
    /// `trigger_rx` are submitted immediately.
    pub fn start(
        &self,
        trigger_rx: broadcast::Receiver<JobKind>,
    ) -> Result<JoinHandle<()>, WorkerError> {
        let cadences = self.cadences.clone();
        let queue = self.queue.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let wake = Arc::clone(&self.wake);

        for cadence in &cadences {
            log::info!(
                "Schedule {}: next run at {}",
                cadence.kind(),
                next_fire(cadence, &Local::now())
            );
        }

        std::thread::Builder::new()
            .name("clientnotes-scheduler".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        log::error!("Failed to start scheduler runtime: {}", e);
                        return;
                    }
                };
                rt.block_on(run_loop(cadences, queue, shutdown, wake, trigger_rx));
            })
            .map_err(|e| WorkerError::SpawnFailed(e.to_string()))
    }

    /// Signals the trigger loop to stop.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake.notify_one();
    }
}

enum Wake {
    Stop,
    Due,
    Manual(Result<JobKind, broadcast::error::RecvError>),
}

async fn run_loop(
    cadences: Vec<Cadence>,
    queue: JobQueue,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
    trigger_rx: broadcast::Receiver<JobKind>,
) {
    let mut trigger_rx = Some(trigger_rx);
    // Last due time handled per cadence, so a timer waking a hair early
    // cannot fire the same slot twice.
    let mut handled: Vec<DateTime<Local>> = vec![Local::now(); cadences.len()];

    loop {
        if shutdown.load(Ordering::Acquire) {
            break;
        }

        let now = Local::now();
        let upcoming: Vec<DateTime<Local>> = cadences
            .iter()
            .zip(&handled)
            .map(|(cadence, last)| next_fire(cadence, std::cmp::max(&now, last)))
            .collect();
        let due = upcoming.iter().min().copied();

        let sleep = async {
            match due {
                Some(at) => {
                    let wait = (at - Local::now()).to_std().unwrap_or_default();
                    tokio::time::sleep(wait).await
                }
                None => std::future::pending().await,
            }
        };
        let manual = async {
            match trigger_rx.as_mut() {
                Some(rx) => rx.recv().await,
                None => std::future::pending().await,
            }
        };

        let woke = tokio::select! {
            _ = wake.notified() => Wake::Stop,
            _ = sleep => Wake::Due,
            received = manual => Wake::Manual(received),
        };

        match woke {
            Wake::Stop => {}
            Wake::Due => {
                for (idx, at) in upcoming.iter().enumerate() {
                    if Some(*at) == due {
                        handled[idx] = *at;
                        fire(&queue, cadences[idx].kind());
                    }
                }
            }
            Wake::Manual(Ok(kind)) => {
                log::info!("Manual {} run triggered", kind);
                fire(&queue, kind);
            }
            Wake::Manual(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                log::warn!("Scheduler missed {} manual triggers", skipped);
            }
            Wake::Manual(Err(broadcast::error::RecvError::Closed)) => {
                trigger_rx = None;
            }
        }
    }

    log::debug!("Scheduler stopped");
}

/// Submits a scheduled job whose range ends today.
fn fire(queue: &JobQueue, kind: JobKind) -> Option<JobId> {
    let today = Local::now().date_naive();
    let result = JobRequest::scheduled(kind, today).and_then(|request| queue.submit_request(request));
    match result {
        Ok(id) => {
            log::info!("Scheduled {} job {} submitted", kind, id);
            Some(id)
        }
        Err(e) => {
            log::error!("Failed to submit scheduled {} job: {}", kind, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::JobStore;
    use crate::worker::job::SYSTEM_OWNER;
    use chrono::Utc;
    use std::time::{Duration, Instant};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn weekly(weekday: u32, hour: u32) -> Cadence {
        Cadence::Weekly(WeeklySchedule {
            weekday,
            hour,
            minute: 0,
        })
    }

    fn monthly(day: u32, hour: u32) -> Cadence {
        Cadence::Monthly(MonthlySchedule {
            day,
            hour,
            minute: 0,
        })
    }

    #[test]
    fn test_weekly_later_this_week() {
        // 2024-01-01 is a Monday; Tuesday 09:00 is next.
        let next = next_fire(&weekly(1, 9), &at(2024, 1, 1, 12, 0));
        assert_eq!(next, at(2024, 1, 2, 9, 0));
    }

    #[test]
    fn test_weekly_same_day_before_and_after() {
        assert_eq!(
            next_fire(&weekly(1, 9), &at(2024, 1, 2, 8, 59)),
            at(2024, 1, 2, 9, 0)
        );
        // Exactly at the due time counts as passed.
        assert_eq!(
            next_fire(&weekly(1, 9), &at(2024, 1, 2, 9, 0)),
            at(2024, 1, 9, 9, 0)
        );
    }

    #[test]
    fn test_weekly_wraps_into_next_week() {
        // Sunday 2024-01-07, Monday target.
        let next = next_fire(&weekly(0, 6), &at(2024, 1, 7, 23, 0));
        assert_eq!(next, at(2024, 1, 8, 6, 0));
    }

    #[test]
    fn test_monthly_this_and_next_month() {
        assert_eq!(
            next_fire(&monthly(15, 9), &at(2024, 1, 10, 0, 0)),
            at(2024, 1, 15, 9, 0)
        );
        assert_eq!(
            next_fire(&monthly(1, 9), &at(2024, 1, 1, 9, 30)),
            at(2024, 2, 1, 9, 0)
        );
        assert_eq!(
            next_fire(&monthly(28, 9), &at(2024, 12, 31, 0, 0)),
            at(2025, 1, 28, 9, 0)
        );
    }

    #[test]
    fn test_cadences_from_config() {
        let config = ScheduleConfig::default();
        let kinds: Vec<JobKind> = Cadence::from_config(&config)
            .iter()
            .map(Cadence::kind)
            .collect();
        assert_eq!(kinds, vec![JobKind::ScheduledWeekly, JobKind::ScheduledMonthly]);

        let disabled = ScheduleConfig {
            enabled: false,
            ..ScheduleConfig::default()
        };
        assert!(Cadence::from_config(&disabled).is_empty());
    }

    fn detached_queue(store: &Arc<JobStore>) -> (JobQueue, crossbeam_channel::Receiver<JobId>) {
        JobQueue::new(Arc::clone(store), Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn test_fire_submits_system_job_ending_today() {
        let store = Arc::new(JobStore::new());
        let (queue, receiver) = detached_queue(&store);

        let id = fire(&queue, JobKind::ScheduledMonthly).unwrap();
        assert_eq!(receiver.try_recv().unwrap(), id);

        let job = store.get(id).unwrap();
        assert_eq!(job.kind, JobKind::ScheduledMonthly);
        assert_eq!(job.owner, SYSTEM_OWNER);
        assert_eq!(job.client_limit, 0);
        assert_eq!(job.date_range.end(), Local::now().date_naive());
        assert_eq!(
            job.date_range.end() - job.date_range.start(),
            chrono::Duration::days(30)
        );
    }

    #[test]
    fn test_fire_rejects_manual_kind() {
        let store = Arc::new(JobStore::new());
        let (queue, _receiver) = detached_queue(&store);

        assert!(fire(&queue, JobKind::Manual).is_none());
        assert!(store.list().is_empty());
    }

    #[test]
    fn test_manual_triggers_queue_independently() {
        let store = Arc::new(JobStore::new());
        let (queue, receiver) = detached_queue(&store);
        let trigger = ScheduleTrigger::with_cadences(Vec::new(), queue);

        let (trigger_tx, trigger_rx) = broadcast::channel(16);
        let handle = trigger.start(trigger_rx).unwrap();

        trigger_tx.send(JobKind::ScheduledWeekly).unwrap();
        trigger_tx.send(JobKind::ScheduledWeekly).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while receiver.len() < 2 {
            assert!(Instant::now() < deadline, "triggers were not submitted");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(store.list().len(), 2);

        trigger.stop();
        handle.join().expect("scheduler thread panicked");
    }

    #[test]
    fn test_stop_wakes_idle_loop() {
        let store = Arc::new(JobStore::new());
        let (queue, _receiver) = detached_queue(&store);
        let trigger = ScheduleTrigger::with_cadences(vec![monthly(28, 9)], queue);

        let (_trigger_tx, trigger_rx) = broadcast::channel(16);
        let handle = trigger.start(trigger_rx).unwrap();

        std::thread::sleep(Duration::from_millis(50));
        trigger.stop();
        handle.join().expect("scheduler thread panicked");
        assert!(store.list().is_empty());
    }
}

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, NaiveTime, TimeZone, Utc, Weekday};
use crossbeam_channel::{Sender, tick, unbounded};

use crate::shared::config::{Config, Frequency};
use crate::shared::events::{Event, EventMessage, MissedRun};
use crate::shared::message::Message;

/// How often the worker wakes to check for due schedules (§4.8).
const TICK_PERIOD: Duration = Duration::from_secs(60);

/// One fired schedule, handed to the engine's single backup worker.
/// Jobs are enqueued in `next_run` order and run sequentially (§5: "a
/// second schedule firing while one is in progress queues behind it").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJob {
    pub schedule_id: String,
    pub destination_id: String,
    pub sources: Vec<String>,
}

/// Owns the wall-clock decision of when a backup runs (§4.8). A
/// single-threaded worker, in the style of [`super::super::shared::msg_dispatcher::MsgDispatcher`],
/// wakes on a tick and fires anything whose `next_run` has arrived. The
/// scheduler never touches the OS autostart/session glue itself — startup
/// and shutdown hooks are fired explicitly by the host through
/// [`Scheduler::fire_startup_hooks`] / [`Scheduler::fire_shutdown_hooks`].
pub struct Scheduler {
    config: Arc<Mutex<Config>>,
    job_sender: Sender<ScheduledJob>,
    event_sender: Sender<Arc<dyn Message>>,
    tick_period: Duration,
    shutdown_sender: Option<Sender<()>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(
        config: Arc<Mutex<Config>>,
        job_sender: Sender<ScheduledJob>,
        event_sender: Sender<Arc<dyn Message>>,
    ) -> Self {
        Scheduler {
            config,
            job_sender,
            event_sender,
            tick_period: TICK_PERIOD,
            shutdown_sender: None,
            thread_handle: None,
        }
    }

    /// Overrides the tick period; only tests need anything shorter than a minute.
    #[cfg(test)]
    pub fn with_tick_period(mut self, period: Duration) -> Self {
        self.tick_period = period;
        self
    }

    /// Runs missed-run recovery once, then starts the tick worker.
    pub fn start(&mut self) {
        recover_missed_runs(&self.config, &self.event_sender, Utc::now());

        let config = Arc::clone(&self.config);
        let job_sender = self.job_sender.clone();
        let period = self.tick_period;

        let (shutdown_sender, shutdown_receiver) = unbounded();
        self.shutdown_sender = Some(shutdown_sender);

        self.thread_handle = Some(thread::spawn(move || {
            let ticker = tick(period);
            loop {
                crossbeam_channel::select! {
                    recv(ticker) -> _ => {
                        fire_due_schedules(&config, &job_sender, Utc::now());
                    }
                    recv(shutdown_receiver) -> _ => break,
                }
            }
        }));
    }

    pub fn stop(&mut self) {
        if let Some(sender) = self.shutdown_sender.take() {
            let _ = sender.send(());
        }
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    /// Implements the `trigger_due_schedules_now` command (§6.4): fires
    /// everything currently due, exactly as a tick would, but callable
    /// synchronously from the UI.
    pub fn trigger_due_now(&self) {
        fire_due_schedules(&self.config, &self.job_sender, Utc::now());
    }

    /// Resolves a single missed run with "run now" / "run latest only"
    /// (§4.8): enqueues one job for `schedule_id` regardless of `next_run`.
    /// "Skip" needs no call at all — `next_run` was already advanced past
    /// the missed occurrence when it was reported.
    pub fn run_schedule_now(&self, schedule_id: &str) {
        let guard = self.config.lock().unwrap();
        if let Some(schedule) = guard.schedules.get(schedule_id) {
            if schedule.enabled {
                let _ = self.job_sender.send(ScheduledJob {
                    schedule_id: schedule.id.clone(),
                    destination_id: schedule.destination_id.clone(),
                    sources: schedule.sources.clone(),
                });
            }
        }
    }

    /// Fires every enabled `startup` schedule. Called by the host's
    /// autostart glue when it invokes the engine with an explicit
    /// "ran at startup" command (§4.8, §9 "GUI coupling to engine").
    pub fn fire_startup_hooks(&self) {
        self.fire_hook_schedules(Frequency::Startup);
    }

    /// Fires every enabled `shutdown` schedule, analogous to [`Self::fire_startup_hooks`].
    pub fn fire_shutdown_hooks(&self) {
        self.fire_hook_schedules(Frequency::Shutdown);
    }

    fn fire_hook_schedules(&self, frequency: Frequency) {
        let guard = self.config.lock().unwrap();
        for schedule in guard.schedules.values() {
            if schedule.enabled && schedule.frequency == frequency {
                let _ = self.job_sender.send(ScheduledJob {
                    schedule_id: schedule.id.clone(),
                    destination_id: schedule.destination_id.clone(),
                    sources: schedule.sources.clone(),
                });
            }
        }
    }
}

/// On worker start, every enabled periodic schedule whose `next_run` is in
/// the past is a missed run: reported to the UI, then `next_run` is
/// recomputed forward from `now` regardless of what the UI decides (§4.8).
/// Schedules that have never run yet just get their first `next_run` filled
/// in silently.
fn recover_missed_runs(config: &Arc<Mutex<Config>>, event_sender: &Sender<Arc<dyn Message>>, now: DateTime<Utc>) {
    let mut missed = Vec::new();
    let mut guard = config.lock().unwrap();
    for schedule in guard.schedules.values_mut() {
        if !schedule.enabled || !schedule.frequency.is_periodic() {
            continue;
        }
        match schedule.next_run {
            None => {
                schedule.next_run = compute_next_run(&schedule.frequency, schedule.time_of_day.as_deref(), now);
            }
            Some(next_run) if next_run <= now => {
                missed.push(MissedRun {
                    schedule_id: schedule.id.clone(),
                    scheduled_for: next_run,
                });
                schedule.next_run = compute_next_run(&schedule.frequency, schedule.time_of_day.as_deref(), now);
            }
            Some(_) => {}
        }
    }
    drop(guard);

    if !missed.is_empty() {
        let _ = event_sender.send(Arc::new(EventMessage::new(Event::MissedRuns { runs: missed })));
    }
}

/// Fires every enabled periodic schedule whose `next_run` has arrived, in
/// `next_run` order, recomputing each one's `next_run` as it fires (§4.8).
/// Firing twice back to back enqueues exactly one job per schedule, since
/// the first call always advances `next_run` past `now` (testable property 8).
fn fire_due_schedules(config: &Arc<Mutex<Config>>, job_sender: &Sender<ScheduledJob>, now: DateTime<Utc>) {
    let mut due: Vec<(String, DateTime<Utc>)> = {
        let guard = config.lock().unwrap();
        guard
            .schedules
            .values()
            .filter(|s| s.enabled && s.frequency.is_periodic())
            .filter_map(|s| s.next_run.filter(|next_run| *next_run <= now).map(|next_run| (s.id.clone(), next_run)))
            .collect()
    };
    due.sort_by_key(|(_, next_run)| *next_run);

    for (schedule_id, _) in due.drain(..) {
        let mut guard = config.lock().unwrap();
        let Some(schedule) = guard.schedules.get(&schedule_id) else { continue };
        if !schedule.enabled {
            continue;
        }
        let job = ScheduledJob {
            schedule_id: schedule.id.clone(),
            destination_id: schedule.destination_id.clone(),
            sources: schedule.sources.clone(),
        };
        drop(guard);
        let _ = job_sender.send(job);

        let mut guard = config.lock().unwrap();
        if let Some(schedule) = guard.schedules.get_mut(&schedule_id) {
            schedule.last_run = Some(now);
            schedule.next_run = compute_next_run(&schedule.frequency, schedule.time_of_day.as_deref(), now);
        }
    }
}

impl Frequency {
    /// `true` for frequencies driven by the tick worker's `next_run` clock;
    /// `false` for `startup`/`shutdown`, which the scheduler never computes
    /// a `next_run` for.
    fn is_periodic(&self) -> bool {
        !matches!(self, Frequency::Startup | Frequency::Shutdown)
    }
}

fn parse_time_of_day(time_of_day: Option<&str>) -> NaiveTime {
    time_of_day
        .and_then(|s| NaiveTime::parse_from_str(s, "%H:%M").ok())
        .unwrap_or_else(|| NaiveTime::from_hms_opt(0, 0, 0).unwrap())
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let first_of_next = if month == 12 {
        chrono::NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        chrono::NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    first_of_next.unwrap().pred_opt().unwrap().day()
}

/// Computes the next UTC instant a schedule should fire, strictly after
/// `from` (§4.8: daily time-of-day, weekly weekday set, monthly
/// day-of-month with month-end clamping). Wall-clock math is done in local
/// time since `time_of_day` is specified in local time (§3).
fn compute_next_run(frequency: &Frequency, time_of_day: Option<&str>, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match frequency {
        Frequency::Startup | Frequency::Shutdown => None,
        Frequency::Daily => next_daily(time_of_day, from),
        Frequency::Weekly { weekdays } => next_weekly(weekdays, time_of_day, from),
        Frequency::Monthly { day_of_month } => next_monthly(*day_of_month, time_of_day, from),
    }
}

fn next_daily(time_of_day: Option<&str>, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let time = parse_time_of_day(time_of_day);
    let local_from = from.with_timezone(&Local);
    let mut date = local_from.date_naive();
    let mut candidate = Local.from_local_datetime(&date.and_time(time)).single()?;
    if candidate <= local_from {
        date = date.succ_opt()?;
        candidate = Local.from_local_datetime(&date.and_time(time)).single()?;
    }
    Some(candidate.with_timezone(&Utc))
}

fn next_weekly(weekdays: &[Weekday], time_of_day: Option<&str>, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if weekdays.is_empty() {
        return None;
    }
    let time = parse_time_of_day(time_of_day);
    let local_from = from.with_timezone(&Local);
    for offset in 0..8 {
        let date = local_from.date_naive() + ChronoDuration::days(offset);
        if !weekdays.contains(&date.weekday()) {
            continue;
        }
        let candidate = Local.from_local_datetime(&date.and_time(time)).single()?;
        if candidate > local_from {
            return Some(candidate.with_timezone(&Utc));
        }
    }
    None
}

fn next_monthly(day_of_month: u32, time_of_day: Option<&str>, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let time = parse_time_of_day(time_of_day);
    let local_from = from.with_timezone(&Local);
    let mut year = local_from.year();
    let mut month = local_from.month();

    loop {
        let clamped_day = day_of_month.clamp(1, days_in_month(year, month));
        let date = chrono::NaiveDate::from_ymd_opt(year, month, clamped_day)?;
        let candidate = Local.from_local_datetime(&date.and_time(time)).single()?;
        if candidate > local_from {
            return Some(candidate.with_timezone(&Utc));
        }
        if month == 12 {
            year += 1;
            month = 1;
        } else {
            month += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::config::Schedule;
    use chrono::Timelike;
    use crossbeam_channel::unbounded;
    use std::collections::HashMap;

    fn schedule(id: &str, frequency: Frequency, next_run: Option<DateTime<Utc>>) -> Schedule {
        Schedule {
            id: id.to_string(),
            enabled: true,
            frequency,
            time_of_day: Some("02:00".to_string()),
            sources: vec!["documents".to_string()],
            destination_id: "nas".to_string(),
            last_run: None,
            next_run,
        }
    }

    fn config_with(schedules: Vec<Schedule>) -> Arc<Mutex<Config>> {
        let mut map = HashMap::new();
        for s in schedules {
            map.insert(s.id.clone(), s);
        }
        let mut config = Config::default();
        config.schedules = map;
        Arc::new(Mutex::new(config))
    }

    #[test]
    fn fires_due_schedule_and_advances_next_run() {
        let past = Utc::now() - ChronoDuration::seconds(5);
        let config = config_with(vec![schedule("nightly", Frequency::Daily, Some(past))]);
        let (job_tx, job_rx) = unbounded();

        fire_due_schedules(&config, &job_tx, Utc::now());

        let job = job_rx.try_recv().expect("job should have been enqueued");
        assert_eq!(job.schedule_id, "nightly");
        assert_eq!(job.destination_id, "nas");

        let guard = config.lock().unwrap();
        let next_run = guard.schedules["nightly"].next_run.unwrap();
        assert!(next_run > Utc::now());
    }

    #[test]
    fn firing_twice_enqueues_exactly_one_job() {
        let past = Utc::now() - ChronoDuration::seconds(5);
        let config = config_with(vec![schedule("nightly", Frequency::Daily, Some(past))]);
        let (job_tx, job_rx) = unbounded();

        fire_due_schedules(&config, &job_tx, Utc::now());
        fire_due_schedules(&config, &job_tx, Utc::now());

        assert!(job_rx.try_recv().is_ok());
        assert!(job_rx.try_recv().is_err());
    }

    #[test]
    fn missed_run_is_reported_and_next_run_moves_forward() {
        let past = Utc::now() - ChronoDuration::days(1);
        let config = config_with(vec![schedule("nightly", Frequency::Daily, Some(past))]);
        let (event_tx, event_rx) = unbounded();

        recover_missed_runs(&config, &event_tx, Utc::now());

        let msg = event_rx.try_recv().expect("missed run event expected");
        let event_msg = msg.as_any().downcast_ref::<EventMessage>().unwrap();
        match event_msg.event() {
            Event::MissedRuns { runs } => {
                assert_eq!(runs.len(), 1);
                assert_eq!(runs[0].schedule_id, "nightly");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let guard = config.lock().unwrap();
        assert!(guard.schedules["nightly"].next_run.unwrap() > Utc::now());
    }

    #[test]
    fn run_schedule_now_enqueues_regardless_of_next_run() {
        let future = Utc::now() + ChronoDuration::days(1);
        let config = config_with(vec![schedule("nightly", Frequency::Daily, Some(future))]);
        let (job_tx, job_rx) = unbounded();
        let (event_tx, _event_rx) = unbounded();

        let scheduler = Scheduler::new(config, job_tx, event_tx);
        scheduler.run_schedule_now("nightly");

        assert!(job_rx.try_recv().is_ok());
    }

    #[test]
    fn startup_hooks_fire_regardless_of_next_run() {
        let config = config_with(vec![schedule("on-boot", Frequency::Startup, None)]);
        let (job_tx, job_rx) = unbounded();
        let (event_tx, _event_rx) = unbounded();

        let scheduler = Scheduler::new(config, job_tx, event_tx);
        scheduler.fire_startup_hooks();

        let job = job_rx.try_recv().expect("startup job expected");
        assert_eq!(job.schedule_id, "on-boot");
    }

    #[test]
    fn next_daily_rolls_to_tomorrow_if_time_already_passed() {
        let from = Local
            .with_ymd_and_hms(2030, 6, 15, 10, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let next = next_daily(Some("02:00"), from).unwrap();
        let next_local = next.with_timezone(&Local);
        assert_eq!(next_local.hour(), 2);
        assert!(next_local.date_naive() > from.with_timezone(&Local).date_naive());
    }

    #[test]
    fn next_monthly_clamps_to_month_end() {
        // February 2030 has 28 days; day_of_month=31 must clamp down to it.
        let from = Local
            .with_ymd_and_hms(2030, 2, 15, 0, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let next = next_monthly(31, Some("00:00"), from).unwrap();
        let next_local = next.with_timezone(&Local);
        assert_eq!(next_local.month(), 2);
        assert_eq!(next_local.day(), 28);
    }

    #[test]
    fn next_weekly_picks_nearest_matching_weekday() {
        // 2030-06-17 is a Monday.
        let from = Local
            .with_ymd_and_hms(2030, 6, 17, 0, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let next = next_weekly(&[Weekday::Wed, Weekday::Fri], Some("09:00"), from).unwrap();
        let next_local = next.with_timezone(&Local);
        assert_eq!(next_local.weekday(), Weekday::Wed);
    }

    #[test]
    fn tick_worker_fires_due_schedule_in_background() {
        let past = Utc::now() - ChronoDuration::seconds(5);
        let config = config_with(vec![schedule("nightly", Frequency::Daily, Some(past))]);
        let (job_tx, job_rx) = unbounded();
        let (event_tx, _event_rx) = unbounded();

        let mut scheduler = Scheduler::new(config, job_tx, event_tx).with_tick_period(Duration::from_millis(20));
        scheduler.start();

        let job = job_rx.recv_timeout(Duration::from_secs(2)).expect("job expected from tick worker");
        assert_eq!(job.schedule_id, "nightly");

        scheduler.stop();
    }
}

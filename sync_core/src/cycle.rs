//! Cycle scheduling.
//!
//! Declarative descriptors (cron, fixed rate, realtime) are converted at
//! registration into tick intervals against a shared master tick. The
//! scheduler does no I/O and keeps no wall clock of its own; the caller
//! passes the current time into `advance`, which also keeps tests in full
//! control of time.
//!
//! Precision note: a 60/sec rate only approximates 60 Hz if the master tick
//! itself runs at 60 Hz or better. The scheduler guarantees cadence in
//! ticks, not in wall-clock time.

use std::fmt;

use anyhow::{bail, Context};
use chrono::{DateTime, Datelike, Timelike, Utc};
use tracing::warn;

/// Unit for a fixed-rate cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateUnit {
    /// `rate` cycles per second.
    Seconds,
    /// `rate` cycles per millisecond.
    Milliseconds,
    /// `rate` is the tick interval itself: a larger value fires *less*
    /// often. Kept for compatibility with the original registrations.
    Ticks,
}

/// Declarative cadence for a registered handler. Immutable after
/// registration.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleDescriptor {
    /// Standard 5-field cron expression, evaluated against wall-clock
    /// minutes.
    Cron(CronExpr),
    /// Fixed rate in the given unit.
    Frequency { rate: u32, unit: RateUnit },
    /// Fires once per master tick.
    Realtime,
}

/// Parsed 5-field cron expression: minute, hour, day-of-month, month,
/// day-of-week.
///
/// Supports `*`, lists, ranges, and steps (`*/5`, `10-40/3`). Weekday 0 and
/// 7 both mean Sunday. When both day fields are restricted, a timestamp
/// matches if *either* does (the standard cron union rule).
#[derive(Debug, Clone, PartialEq)]
pub struct CronExpr {
    source: String,
    minutes: u64,
    hours: u32,
    days: u32,
    months: u16,
    weekdays: u8,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpr {
    /// Parses a 5-field expression.
    pub fn parse(expr: &str) -> anyhow::Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            bail!(
                "cron expression '{}' has {} fields, expected 5",
                expr,
                fields.len()
            );
        }

        let minutes = parse_field(fields[0], 0, 59).context("minute field")?;
        let hours = parse_field(fields[1], 0, 23).context("hour field")?;
        let days = parse_field(fields[2], 1, 31).context("day-of-month field")?;
        let months = parse_field(fields[3], 1, 12).context("month field")?;
        let weekdays = parse_field(fields[4], 0, 7).context("day-of-week field")?;
        // Fold 7 onto Sunday.
        let weekdays = (weekdays | (weekdays >> 7)) & 0x7f;

        Ok(Self {
            source: expr.to_string(),
            minutes,
            hours: hours as u32,
            days: days as u32,
            months: months as u16,
            weekdays: weekdays as u8,
            dom_restricted: fields[2] != "*",
            dow_restricted: fields[4] != "*",
        })
    }

    /// True when the timestamp's minute satisfies the expression.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        if self.minutes & (1u64 << at.minute()) == 0 {
            return false;
        }
        if self.hours & (1u32 << at.hour()) == 0 {
            return false;
        }
        if self.months & (1u16 << at.month()) == 0 {
            return false;
        }

        let dom_ok = self.days & (1u32 << at.day()) != 0;
        let dow_ok = self.weekdays & (1u8 << at.weekday().num_days_from_sunday()) != 0;
        match (self.dom_restricted, self.dow_restricted) {
            // Standard union rule: either restricted day field may match.
            (true, true) => dom_ok || dow_ok,
            (true, false) => dom_ok,
            (false, true) => dow_ok,
            (false, false) => true,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl std::str::FromStr for CronExpr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Parses one cron field into a bitmask over `[min, max]`.
fn parse_field(field: &str, min: u32, max: u32) -> anyhow::Result<u64> {
    let mut mask = 0u64;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .with_context(|| format!("bad step in '{part}'"))?;
                if step == 0 {
                    bail!("step must be non-zero in '{part}'");
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            let lo: u32 = lo.parse().with_context(|| format!("bad range in '{part}'"))?;
            let hi: u32 = hi.parse().with_context(|| format!("bad range in '{part}'"))?;
            (lo, hi)
        } else {
            let v: u32 = range
                .parse()
                .with_context(|| format!("bad value in '{part}'"))?;
            (v, v)
        };

        if lo > hi || lo < min || hi > max {
            bail!("'{part}' out of range {min}-{max}");
        }
        let mut v = lo;
        while v <= hi {
            mask |= 1u64 << v;
            v += step;
        }
    }
    Ok(mask)
}

/// Handler invoked when a cycle fires. An error is logged per invocation
/// and never halts the scheduler or other entries.
pub type CycleHandler = Box<dyn FnMut(u64) -> anyhow::Result<()> + Send>;

struct CycleEntry {
    owner: String,
    name: String,
    descriptor: CycleDescriptor,
    /// Ticks between firings; unused for cron and realtime entries.
    interval: u64,
    counter: u64,
    /// Minute stamp of the last cron firing; at most one per matching
    /// minute.
    last_cron_minute: Option<i64>,
    handler: CycleHandler,
}

/// Converts declarative cycle descriptors into tick-driven invocations.
pub struct CycleScheduler {
    tick_hz: u32,
    entries: Vec<CycleEntry>,
}

impl CycleScheduler {
    pub fn new(tick_hz: u32) -> anyhow::Result<Self> {
        if tick_hz == 0 {
            bail!("tick_hz must be non-zero");
        }
        Ok(Self {
            tick_hz,
            entries: Vec::new(),
        })
    }

    pub fn tick_hz(&self) -> u32 {
        self.tick_hz
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tick interval for a fixed-rate descriptor. Rates faster than the
    /// master tick clamp to every tick.
    pub fn interval_for(&self, rate: u32, unit: RateUnit) -> anyhow::Result<u64> {
        if rate == 0 {
            bail!("cycle rate must be non-zero");
        }
        let interval = match unit {
            RateUnit::Seconds => (self.tick_hz / rate) as u64,
            RateUnit::Milliseconds => {
                ((self.tick_hz as f64 / 1000.0) / rate as f64).round() as u64
            }
            RateUnit::Ticks => rate as u64,
        };
        Ok(interval.max(1))
    }

    /// Registers a handler under an owner key. Frequency intervals are
    /// computed here, once.
    pub fn register(
        &mut self,
        owner: impl Into<String>,
        name: impl Into<String>,
        descriptor: CycleDescriptor,
        handler: CycleHandler,
    ) -> anyhow::Result<()> {
        let interval = match &descriptor {
            CycleDescriptor::Frequency { rate, unit } => self.interval_for(*rate, *unit)?,
            CycleDescriptor::Cron(_) | CycleDescriptor::Realtime => 0,
        };
        self.entries.push(CycleEntry {
            owner: owner.into(),
            name: name.into(),
            descriptor,
            interval,
            counter: 0,
            last_cron_minute: None,
            handler,
        });
        Ok(())
    }

    /// Drops every entry registered under `owner`, returning how many.
    pub fn remove_owner(&mut self, owner: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.owner != owner);
        before - self.entries.len()
    }

    /// Distinct owner keys, sorted.
    pub fn owners(&self) -> Vec<String> {
        let mut owners: Vec<String> = self.entries.iter().map(|e| e.owner.clone()).collect();
        owners.sort();
        owners.dedup();
        owners
    }

    /// Advances every entry by one master tick, invoking due handlers
    /// synchronously in registration order. Returns how many fired.
    pub fn advance(&mut self, tick: u64, now: DateTime<Utc>) -> usize {
        let minute_stamp = now.timestamp().div_euclid(60);
        let mut fired = 0;

        for entry in &mut self.entries {
            let due = match &entry.descriptor {
                CycleDescriptor::Realtime => true,
                CycleDescriptor::Frequency { .. } => {
                    entry.counter += 1;
                    if entry.counter >= entry.interval {
                        entry.counter = 0;
                        true
                    } else {
                        false
                    }
                }
                CycleDescriptor::Cron(expr) => {
                    if expr.matches(now) && entry.last_cron_minute != Some(minute_stamp) {
                        entry.last_cron_minute = Some(minute_stamp);
                        true
                    } else {
                        false
                    }
                }
            };

            if due {
                fired += 1;
                if let Err(e) = (entry.handler)(tick) {
                    warn!(
                        owner = %entry.owner,
                        cycle = %entry.name,
                        error = %e,
                        "cycle handler failed"
                    );
                }
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn counting_handler(count: Arc<AtomicU64>) -> CycleHandler {
        Box::new(move |_tick| {
            count.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }

    #[test]
    fn interval_conversions() {
        let sched = CycleScheduler::new(64).unwrap();
        assert_eq!(sched.interval_for(1, RateUnit::Seconds).unwrap(), 64);
        assert_eq!(sched.interval_for(8, RateUnit::Seconds).unwrap(), 8);
        // Faster than the master tick clamps to every tick.
        assert_eq!(sched.interval_for(128, RateUnit::Seconds).unwrap(), 1);
        assert_eq!(sched.interval_for(1, RateUnit::Milliseconds).unwrap(), 1);
        // Under Ticks the value is the interval itself.
        assert_eq!(sched.interval_for(10, RateUnit::Ticks).unwrap(), 10);
        assert!(sched.interval_for(0, RateUnit::Seconds).is_err());
    }

    #[test]
    fn realtime_fires_every_tick() {
        let mut sched = CycleScheduler::new(64).unwrap();
        let count = Arc::new(AtomicU64::new(0));
        sched
            .register(
                "engine",
                "pulse",
                CycleDescriptor::Realtime,
                counting_handler(count.clone()),
            )
            .unwrap();

        let now = at(2026, 8, 7, 12, 0, 0);
        for tick in 0..10 {
            sched.advance(tick, now);
        }
        assert_eq!(count.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn frequency_counter_fires_and_resets() {
        let mut sched = CycleScheduler::new(64).unwrap();
        let count = Arc::new(AtomicU64::new(0));
        sched
            .register(
                "game",
                "regen",
                CycleDescriptor::Frequency {
                    rate: 8,
                    unit: RateUnit::Seconds,
                },
                counting_handler(count.clone()),
            )
            .unwrap();

        let now = at(2026, 8, 7, 12, 0, 0);
        for tick in 0..64 {
            sched.advance(tick, now);
        }
        // 8/sec at 64 Hz → every 8 ticks → 8 firings over one second.
        assert_eq!(count.load(Ordering::Relaxed), 8);
    }

    #[test]
    fn ticks_unit_slows_down_as_the_value_grows() {
        let mut sched = CycleScheduler::new(64).unwrap();
        let count = Arc::new(AtomicU64::new(0));
        sched
            .register(
                "game",
                "sweep",
                CycleDescriptor::Frequency {
                    rate: 10,
                    unit: RateUnit::Ticks,
                },
                counting_handler(count.clone()),
            )
            .unwrap();

        let now = at(2026, 8, 7, 12, 0, 0);
        for tick in 0..100 {
            sched.advance(tick, now);
        }
        assert_eq!(count.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn failing_handlers_do_not_disturb_others() {
        let mut sched = CycleScheduler::new(64).unwrap();
        let count = Arc::new(AtomicU64::new(0));
        sched
            .register(
                "broken",
                "boom",
                CycleDescriptor::Realtime,
                Box::new(|_| anyhow::bail!("handler exploded")),
            )
            .unwrap();
        sched
            .register(
                "game",
                "pulse",
                CycleDescriptor::Realtime,
                counting_handler(count.clone()),
            )
            .unwrap();

        let now = at(2026, 8, 7, 12, 0, 0);
        for tick in 0..5 {
            sched.advance(tick, now);
        }
        assert_eq!(count.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn owner_grouping_and_removal() {
        let mut sched = CycleScheduler::new(64).unwrap();
        for name in ["a", "b"] {
            sched
                .register(
                    "plugin_x",
                    name,
                    CycleDescriptor::Realtime,
                    Box::new(|_| Ok(())),
                )
                .unwrap();
        }
        sched
            .register("plugin_y", "c", CycleDescriptor::Realtime, Box::new(|_| Ok(())))
            .unwrap();

        assert_eq!(sched.owners(), vec!["plugin_x".to_string(), "plugin_y".to_string()]);
        assert_eq!(sched.remove_owner("plugin_x"), 2);
        assert_eq!(sched.len(), 1);
    }

    #[test]
    fn cron_parse_accepts_standard_forms() {
        assert!(CronExpr::parse("* * * * *").is_ok());
        assert!(CronExpr::parse("*/15 * * * *").is_ok());
        assert!(CronExpr::parse("0 0 1 1 *").is_ok());
        assert!(CronExpr::parse("5,35 8-17 * * 1-5").is_ok());
        assert!(CronExpr::parse("10-40/10 * * * *").is_ok());

        assert!(CronExpr::parse("* * * *").is_err());
        assert!(CronExpr::parse("60 * * * *").is_err());
        assert!(CronExpr::parse("* 24 * * *").is_err());
        assert!(CronExpr::parse("*/0 * * * *").is_err());
        assert!(CronExpr::parse("a * * * *").is_err());
    }

    #[test]
    fn cron_matching() {
        let expr = CronExpr::parse("*/15 * * * *").unwrap();
        assert!(expr.matches(at(2026, 8, 7, 3, 0, 0)));
        assert!(expr.matches(at(2026, 8, 7, 3, 45, 12)));
        assert!(!expr.matches(at(2026, 8, 7, 3, 7, 0)));

        // 2026-08-07 is a Friday (weekday 5).
        let weekday = CronExpr::parse("0 12 * * 5").unwrap();
        assert!(weekday.matches(at(2026, 8, 7, 12, 0, 0)));
        assert!(!weekday.matches(at(2026, 8, 8, 12, 0, 0)));

        // 7 folds onto Sunday; 2026-08-09 is a Sunday.
        let sunday = CronExpr::parse("0 0 * * 7").unwrap();
        assert!(sunday.matches(at(2026, 8, 9, 0, 0, 0)));
    }

    #[test]
    fn cron_dom_dow_union_rule() {
        // Both day fields restricted: either may match.
        let expr = CronExpr::parse("0 0 9 * 5").unwrap();
        assert!(expr.matches(at(2026, 8, 9, 0, 0, 0)), "day-of-month matches");
        assert!(expr.matches(at(2026, 8, 7, 0, 0, 0)), "weekday matches");
        assert!(!expr.matches(at(2026, 8, 8, 0, 0, 0)), "neither matches");
    }

    #[test]
    fn cron_fires_at_most_once_per_matching_minute() {
        let mut sched = CycleScheduler::new(64).unwrap();
        let count = Arc::new(AtomicU64::new(0));
        sched
            .register(
                "ops",
                "minutely",
                CycleDescriptor::Cron(CronExpr::parse("* * * * *").unwrap()),
                counting_handler(count.clone()),
            )
            .unwrap();

        // 64 ticks inside one minute: one firing.
        let minute_a = at(2026, 8, 7, 12, 0, 30);
        for tick in 0..64 {
            sched.advance(tick, minute_a);
        }
        assert_eq!(count.load(Ordering::Relaxed), 1);

        // Next minute: one more.
        let minute_b = at(2026, 8, 7, 12, 1, 2);
        for tick in 64..128 {
            sched.advance(tick, minute_b);
        }
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }
}

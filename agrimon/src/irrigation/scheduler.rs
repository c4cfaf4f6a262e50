use super::IrrigationController;
use crate::errors::Error;
use crate::model::{Schedule, Trigger};
use chrono::{DateTime, Datelike, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Latest occurrence of `schedule` in the window `(after, until]`, if any.
pub fn due_occurrence(
    schedule: &Schedule,
    after: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if !schedule.enabled || until <= after {
        return None;
    }

    let mut day = until.date_naive();
    let first = after.date_naive();
    // Bound the walk so a long stall does not replay a week of schedules.
    for _ in 0..8 {
        if day < first {
            break;
        }
        if schedule.days_of_week.contains(&day.weekday()) {
            let occurrence = day.and_time(schedule.start_time).and_utc();
            if occurrence > after && occurrence <= until {
                return Some(occurrence);
            }
        }
        day = day.pred_opt()?;
    }
    None
}

/// Starts every zone whose schedule fell due in `(after, until]`.
pub async fn run_due_schedules(
    controller: &IrrigationController,
    after: DateTime<Utc>,
    until: DateTime<Utc>,
) -> usize {
    let zones = match controller.statuses().await {
        Ok(zones) => zones,
        Err(e) => {
            error!("Scheduler could not read zone table: {}", e);
            return 0;
        }
    };

    let mut started = 0;
    for zone in zones {
        let Some(schedule) = zone.schedule.as_ref() else {
            continue;
        };
        let Some(occurrence) = due_occurrence(schedule, after, until) else {
            continue;
        };

        match controller
            .start(
                &zone.zone_id,
                schedule.duration_minutes,
                schedule.water_flow_rate,
                Trigger::Schedule,
            )
            .await
        {
            Ok(_) => {
                started += 1;
                info!(
                    zone_id = %zone.zone_id,
                    %occurrence,
                    duration_minutes = schedule.duration_minutes,
                    "Scheduled irrigation started"
                );
            }
            Err(Error::Conflict(reason)) => {
                info!(zone_id = %zone.zone_id, %occurrence, "Scheduled run skipped: {}", reason);
            }
            Err(e) => {
                warn!(zone_id = %zone.zone_id, %occurrence, "Scheduled run failed: {}", e);
            }
        }
    }
    started
}

/// Evaluates recurring schedules every `tick`. Intended to be `tokio::spawn`-ed.
pub async fn run_scheduler(controller: Arc<IrrigationController>, tick: Duration) {
    info!("Starting irrigation scheduler with tick={:?}", tick);

    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut last = Utc::now();

    loop {
        ticker.tick().await;
        let now = Utc::now();
        let started = run_due_schedules(&controller, last, now).await;
        if started > 0 {
            debug!("Scheduler tick started {} zone(s)", started);
        }
        // Wall clock stepped backwards: keep the old mark so nothing repeats.
        if now > last {
            last = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ZoneState;
    use chrono::{NaiveTime, TimeZone, Weekday};

    fn schedule(days: Vec<Weekday>) -> Schedule {
        Schedule {
            start_time: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
            duration_minutes: 15,
            days_of_week: days,
            enabled: true,
            water_flow_rate: 1.5,
        }
    }

    // 2026-05-04 is a Monday.
    fn monday(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, h, m, 0).unwrap()
    }

    #[test]
    fn test_due_inside_window() {
        let s = schedule(vec![Weekday::Mon]);
        assert_eq!(
            due_occurrence(&s, monday(5, 59), monday(6, 0)),
            Some(monday(6, 0))
        );
        assert_eq!(due_occurrence(&s, monday(6, 0), monday(6, 1)), None);
        assert_eq!(due_occurrence(&s, monday(5, 0), monday(5, 30)), None);
    }

    #[test]
    fn test_wrong_day_or_disabled() {
        let s = schedule(vec![Weekday::Tue]);
        assert_eq!(due_occurrence(&s, monday(5, 59), monday(6, 1)), None);

        let mut off = schedule(vec![Weekday::Mon]);
        off.enabled = false;
        assert_eq!(due_occurrence(&off, monday(5, 59), monday(6, 1)), None);
    }

    #[test]
    fn test_window_spanning_midnight() {
        let s = schedule(vec![Weekday::Mon]);
        let sunday_night = Utc.with_ymd_and_hms(2026, 5, 3, 23, 0, 0).unwrap();
        assert_eq!(
            due_occurrence(&s, sunday_night, monday(7, 0)),
            Some(monday(6, 0))
        );
    }

    #[tokio::test]
    async fn test_run_due_starts_zone_once() {
        let controller = IrrigationController::with_zones(["field-a"]).unwrap();
        controller
            .set_schedule("field-a", Some(schedule(vec![Weekday::Mon])))
            .await
            .unwrap();

        let started = run_due_schedules(&controller, monday(5, 59), monday(6, 0)).await;
        assert_eq!(started, 1);
        let zone = controller.status("field-a").await.unwrap();
        assert_eq!(zone.state, ZoneState::Active);
        assert_eq!(zone.current_flow_rate, 1.5);

        // Already running: the occurrence is skipped, not an error.
        let again = run_due_schedules(&controller, monday(5, 59), monday(6, 0)).await;
        assert_eq!(again, 0);
    }
}

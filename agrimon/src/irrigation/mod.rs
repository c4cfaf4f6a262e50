//! Irrigation controller.
//!
//! Each zone is owned by a single actor task fed through a bounded queue,
//! so commands against one zone never interleave while different zones run
//! fully in parallel.

mod scheduler;
mod zone;

pub use scheduler::{due_occurrence, run_due_schedules, run_scheduler};
pub use zone::ZoneMachine;

use crate::errors::{Error, Result};
use crate::model::{ActivationRecord, IrrigationZone, Page, Schedule, Trigger};
use crate::query::{paginate, PageRequest, TimeRange};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::info;
use zone::{run_zone, ZoneCommand};

const COMMAND_QUEUE: usize = 64;

#[derive(Clone)]
struct ZoneHandle {
    tx: mpsc::Sender<ZoneCommand>,
}

#[derive(Default)]
pub struct IrrigationController {
    zones: RwLock<BTreeMap<String, ZoneHandle>>,
}

impl IrrigationController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Controller with the given zones provisioned. Must run inside a tokio
    /// runtime, since every zone spawns its actor.
    pub fn with_zones<I, S>(zone_ids: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let controller = Self::new();
        for id in zone_ids {
            controller.add_zone(id)?;
        }
        Ok(controller)
    }

    pub fn add_zone(&self, zone_id: impl Into<String>) -> Result<()> {
        let zone_id = zone_id.into();
        if zone_id.trim().is_empty() {
            return Err(Error::validation("zone id must not be empty"));
        }
        let mut zones = self.zones.write();
        if zones.contains_key(&zone_id) {
            return Err(Error::Conflict(format!("zone {} already exists", zone_id)));
        }
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        tokio::spawn(run_zone(ZoneMachine::new(zone_id.clone()), rx));
        info!(zone_id = %zone_id, "Irrigation zone provisioned");
        zones.insert(zone_id, ZoneHandle { tx });
        Ok(())
    }

    pub fn zone_ids(&self) -> Vec<String> {
        self.zones.read().keys().cloned().collect()
    }

    fn handle(&self, zone_id: &str) -> Result<ZoneHandle> {
        self.zones
            .read()
            .get(zone_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("zone {}", zone_id)))
    }

    async fn request<T>(
        &self,
        zone_id: &str,
        make: impl FnOnce(oneshot::Sender<T>) -> ZoneCommand,
    ) -> Result<T> {
        let handle = self.handle(zone_id)?;
        let (reply, rx) = oneshot::channel();
        handle
            .tx
            .send(make(reply))
            .await
            .map_err(|_| Error::Internal(format!("zone {} controller is not running", zone_id)))?;
        rx.await
            .map_err(|_| Error::Internal(format!("zone {} dropped the command", zone_id)))
    }

    pub async fn start(
        &self,
        zone_id: &str,
        duration_minutes: u32,
        flow_rate: f64,
        trigger: Trigger,
    ) -> Result<IrrigationZone> {
        let duration = Duration::from_secs(u64::from(duration_minutes) * 60);
        self.request(zone_id, |reply| ZoneCommand::Start {
            duration,
            flow_rate,
            trigger,
            reply,
        })
        .await?
    }

    pub async fn stop(&self, zone_id: &str) -> Result<ActivationRecord> {
        self.request(zone_id, |reply| ZoneCommand::Stop { reply })
            .await?
    }

    pub async fn pause(&self, zone_id: &str) -> Result<IrrigationZone> {
        self.request(zone_id, |reply| ZoneCommand::Pause { reply })
            .await?
    }

    pub async fn resume(&self, zone_id: &str) -> Result<IrrigationZone> {
        self.request(zone_id, |reply| ZoneCommand::Resume { reply })
            .await?
    }

    pub async fn set_schedule(
        &self,
        zone_id: &str,
        schedule: Option<Schedule>,
    ) -> Result<IrrigationZone> {
        self.request(zone_id, |reply| ZoneCommand::SetSchedule { schedule, reply })
            .await
    }

    pub async fn status(&self, zone_id: &str) -> Result<IrrigationZone> {
        self.request(zone_id, |reply| ZoneCommand::Status { reply })
            .await
    }

    /// Every zone, in zone id order.
    pub async fn statuses(&self) -> Result<Vec<IrrigationZone>> {
        let mut out = Vec::new();
        for zone_id in self.zone_ids() {
            out.push(self.status(&zone_id).await?);
        }
        Ok(out)
    }

    /// Closed activations ordered by start time, optionally for one zone.
    pub async fn history(
        &self,
        zone_id: Option<&str>,
        range: TimeRange,
        request: PageRequest,
    ) -> Result<Page<ActivationRecord>> {
        let zone_ids = match zone_id {
            Some(id) => vec![id.to_string()],
            None => self.zone_ids(),
        };

        let mut records = Vec::new();
        for id in zone_ids {
            let zone_records = self
                .request(&id, |reply| ZoneCommand::History { reply })
                .await?;
            records.extend(
                zone_records
                    .into_iter()
                    .filter(|r| range.contains(r.started_at)),
            );
        }
        records.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.zone_id.cmp(&b.zone_id))
        });
        Ok(paginate(&records, request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EndReason, ZoneState};
    use crate::query::PagingLimits;
    use std::sync::Arc;

    fn controller() -> IrrigationController {
        IrrigationController::with_zones(["field-a", "field-b"]).unwrap()
    }

    #[tokio::test]
    async fn test_start_then_status() {
        let c = controller();
        c.start("field-a", 30, 2.5, Trigger::Manual).await.unwrap();

        let status = c.status("field-a").await.unwrap();
        assert_eq!(status.state, ZoneState::Active);
        assert_eq!(status.current_flow_rate, 2.5);
        assert!(status.auto_stop_at.is_some());

        let again = c.start("field-a", 30, 2.5, Trigger::Manual).await;
        assert!(matches!(again, Err(Error::Conflict(_))));

        let other = c.status("field-b").await.unwrap();
        assert_eq!(other.state, ZoneState::Inactive);
    }

    #[tokio::test]
    async fn test_unknown_zone() {
        let c = controller();
        assert!(matches!(
            c.start("field-z", 10, 1.0, Trigger::Manual).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(c.add_zone("field-a"), Err(Error::Conflict(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_single_winner() {
        let c = Arc::new(controller());
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let c = c.clone();
                tokio::spawn(async move { c.start("field-a", 10, 1.0, Trigger::Manual).await })
            })
            .collect();

        let mut ok = 0;
        let mut conflicts = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(Error::Conflict(_)) => conflicts += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(conflicts, 31);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_stop_fires_and_accounts() {
        let c = controller();
        c.start("field-a", 1, 2.0, Trigger::Manual).await.unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;

        let status = c.status("field-a").await.unwrap();
        assert_eq!(status.state, ZoneState::Inactive);
        assert!((status.total_water_used - 120.0).abs() < 1e-6);

        let history = c
            .history(Some("field-a"), TimeRange::open(), PageRequest::new(None, None, PagingLimits::default()).unwrap())
            .await
            .unwrap();
        assert_eq!(history.total_count, 1);
        assert_eq!(history.data[0].end_reason, EndReason::AutoStop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_stop_cancels_auto_stop() {
        let c = controller();
        c.start("field-a", 1, 1.0, Trigger::Manual).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        let record = c.stop("field-a").await.unwrap();
        assert_eq!(record.end_reason, EndReason::Manual);
        assert!((record.water_used - 30.0).abs() < 1e-6);

        tokio::time::sleep(Duration::from_secs(120)).await;
        let status = c.status("field-a").await.unwrap();
        assert!((status.total_water_used - 30.0).abs() < 1e-6);

        let history = c
            .history(None, TimeRange::open(), PageRequest::new(None, None, PagingLimits::default()).unwrap())
            .await
            .unwrap();
        assert_eq!(history.total_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_holds_flow_and_budget() {
        let c = controller();
        c.start("field-a", 1, 1.0, Trigger::Manual).await.unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;

        let paused = c.pause("field-a").await.unwrap();
        assert_eq!(paused.state, ZoneState::Paused);
        assert_eq!(paused.current_flow_rate, 1.0);
        assert!(paused.auto_stop_at.is_none());

        // Paused time does not count towards the one-minute budget.
        tokio::time::sleep(Duration::from_secs(300)).await;
        c.resume("field-a").await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(c.status("field-a").await.unwrap().state, ZoneState::Active);

        tokio::time::sleep(Duration::from_secs(15)).await;
        let status = c.status("field-a").await.unwrap();
        assert_eq!(status.state, ZoneState::Inactive);
        assert!((status.total_water_used - 60.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_schedule_round_trip_through_status() {
        let c = controller();
        let schedule = Schedule {
            start_time: chrono::NaiveTime::from_hms_opt(5, 0, 0).unwrap(),
            duration_minutes: 20,
            days_of_week: vec![chrono::Weekday::Tue],
            enabled: true,
            water_flow_rate: 1.2,
        };
        let zone = c.set_schedule("field-b", Some(schedule.clone())).await.unwrap();
        assert_eq!(zone.schedule, Some(schedule));

        let cleared = c.set_schedule("field-b", None).await.unwrap();
        assert!(cleared.schedule.is_none());
    }
}

//! Per-zone state machine and the actor that serializes its commands.
//!
//! ```text
//! inactive ──start──▶ active ──pause──▶ paused
//!    ▲                 │  ▲               │
//!    │                 │  └────resume─────┘
//!    └──stop/auto-stop─┴───────stop───────┘
//! ```
//!
//! The auto-stop timer lives inside the actor's select loop, so a manual
//! stop and the timer can never both close the same activation.

use crate::errors::{Error, Result};
use crate::metrics::{ACTIVE_ZONES, IRRIGATION_TRANSITIONS_TOTAL};
use crate::model::{ActivationRecord, EndReason, IrrigationZone, Schedule, Trigger, ZoneState};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

const HISTORY_LIMIT: usize = 10_000;

/// The open activation interval of a zone.
#[derive(Debug, Clone)]
struct Activation {
    started_at: DateTime<Utc>,
    trigger: Trigger,
    flow_rate: f64,
    active_secs: f64,
    /// Set while water is flowing.
    running_since: Option<Instant>,
    /// Auto-stop budget left as of `running_since` (or frozen while paused).
    remaining: Duration,
}

#[derive(Debug, Clone)]
pub struct ZoneMachine {
    zone_id: String,
    state: ZoneState,
    total_water_used: f64,
    last_activated: Option<DateTime<Utc>>,
    schedule: Option<Schedule>,
    open: Option<Activation>,
}

impl ZoneMachine {
    pub fn new(zone_id: impl Into<String>) -> Self {
        Self {
            zone_id: zone_id.into(),
            state: ZoneState::Inactive,
            total_water_used: 0.0,
            last_activated: None,
            schedule: None,
            open: None,
        }
    }

    pub fn state(&self) -> ZoneState {
        self.state
    }

    pub fn total_water_used(&self) -> f64 {
        self.total_water_used
    }

    pub fn start(
        &mut self,
        duration: Duration,
        flow_rate: f64,
        trigger: Trigger,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> Result<()> {
        if self.state != ZoneState::Inactive {
            return Err(Error::Conflict(format!(
                "zone {} is already {}",
                self.zone_id,
                state_name(self.state)
            )));
        }
        if !(flow_rate.is_finite() && flow_rate > 0.0) {
            return Err(Error::validation("water_flow_rate must be greater than 0"));
        }
        if duration.is_zero() {
            return Err(Error::validation("duration_minutes must be greater than 0"));
        }

        self.open = Some(Activation {
            started_at: wall,
            trigger,
            flow_rate,
            active_secs: 0.0,
            running_since: Some(now),
            remaining: duration,
        });
        self.state = ZoneState::Active;
        self.last_activated = Some(wall);
        Ok(())
    }

    pub fn pause(&mut self, now: Instant) -> Result<()> {
        if self.state != ZoneState::Active {
            return Err(self.illegal("pause"));
        }
        self.accrue(now);
        self.state = ZoneState::Paused;
        Ok(())
    }

    pub fn resume(&mut self, now: Instant) -> Result<()> {
        if self.state != ZoneState::Paused {
            return Err(self.illegal("resume"));
        }
        if let Some(open) = self.open.as_mut() {
            open.running_since = Some(now);
        }
        self.state = ZoneState::Active;
        Ok(())
    }

    /// Closes the open activation, from either active or paused.
    pub fn stop(
        &mut self,
        reason: EndReason,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> Result<ActivationRecord> {
        if self.state == ZoneState::Inactive {
            return Err(self.illegal("stop"));
        }
        self.accrue(now);
        let open = self
            .open
            .take()
            .ok_or_else(|| Error::Internal(format!("zone {} has no open activation", self.zone_id)))?;
        self.state = ZoneState::Inactive;

        Ok(ActivationRecord {
            zone_id: self.zone_id.clone(),
            started_at: open.started_at,
            ended_at: wall,
            active_seconds: open.active_secs,
            flow_rate: open.flow_rate,
            water_used: open.active_secs * open.flow_rate,
            trigger: open.trigger,
            end_reason: reason,
        })
    }

    /// Folds flowing time up to `now` into the water total and stops the
    /// running clock.
    fn accrue(&mut self, now: Instant) {
        let Some(open) = self.open.as_mut() else {
            return;
        };
        let Some(since) = open.running_since else {
            return;
        };
        let elapsed = now.saturating_duration_since(since).min(open.remaining);
        let secs = elapsed.as_secs_f64();
        open.active_secs += secs;
        open.remaining = open.remaining.saturating_sub(elapsed);
        open.running_since = None;
        self.total_water_used += secs * open.flow_rate;
    }

    /// When the running activation is due to auto-stop.
    pub fn deadline(&self) -> Option<Instant> {
        match (&self.state, &self.open) {
            (ZoneState::Active, Some(open)) => open.running_since.map(|since| since + open.remaining),
            _ => None,
        }
    }

    pub fn set_schedule(&mut self, schedule: Option<Schedule>) {
        self.schedule = schedule;
    }

    pub fn snapshot(&self, now: Instant, wall: DateTime<Utc>) -> IrrigationZone {
        let auto_stop_at = self.deadline().map(|d| {
            let left = d.saturating_duration_since(now);
            wall + chrono::Duration::from_std(left).unwrap_or_else(|_| chrono::Duration::zero())
        });
        IrrigationZone {
            zone_id: self.zone_id.clone(),
            state: self.state,
            current_flow_rate: self.open.as_ref().map_or(0.0, |o| o.flow_rate),
            total_water_used: self.total_water_used,
            last_activated: self.last_activated,
            auto_stop_at,
            schedule: self.schedule.clone(),
        }
    }

    fn illegal(&self, action: &str) -> Error {
        Error::Conflict(format!(
            "cannot {} zone {} while {}",
            action,
            self.zone_id,
            state_name(self.state)
        ))
    }
}

fn state_name(state: ZoneState) -> &'static str {
    match state {
        ZoneState::Inactive => "inactive",
        ZoneState::Active => "active",
        ZoneState::Paused => "paused",
    }
}

pub enum ZoneCommand {
    Start {
        duration: Duration,
        flow_rate: f64,
        trigger: Trigger,
        reply: oneshot::Sender<Result<IrrigationZone>>,
    },
    Stop {
        reply: oneshot::Sender<Result<ActivationRecord>>,
    },
    Pause {
        reply: oneshot::Sender<Result<IrrigationZone>>,
    },
    Resume {
        reply: oneshot::Sender<Result<IrrigationZone>>,
    },
    SetSchedule {
        schedule: Option<Schedule>,
        reply: oneshot::Sender<IrrigationZone>,
    },
    Status {
        reply: oneshot::Sender<IrrigationZone>,
    },
    History {
        reply: oneshot::Sender<Vec<ActivationRecord>>,
    },
}

struct ZoneActor {
    machine: ZoneMachine,
    history: VecDeque<ActivationRecord>,
}

/// Owns one zone. Commands are handled strictly in arrival order.
pub async fn run_zone(machine: ZoneMachine, mut rx: mpsc::Receiver<ZoneCommand>) {
    let mut actor = ZoneActor {
        machine,
        history: VecDeque::new(),
    };
    debug!(zone_id = %actor.machine.zone_id, "Zone actor started");

    loop {
        let deadline = actor.machine.deadline();
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(cmd) => actor.handle(cmd),
                None => break,
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                actor.auto_stop(Instant::now());
            }
        }
    }

    debug!(zone_id = %actor.machine.zone_id, "Zone actor stopped");
}

impl ZoneActor {
    fn handle(&mut self, cmd: ZoneCommand) {
        let now = Instant::now();
        // A deadline that passed while this command was queued fires first.
        if self.machine.deadline().is_some_and(|d| d <= now) {
            self.auto_stop(now);
        }
        let before = self.machine.state();

        match cmd {
            ZoneCommand::Start {
                duration,
                flow_rate,
                trigger,
                reply,
            } => {
                let result = self
                    .machine
                    .start(duration, flow_rate, trigger, now, Utc::now())
                    .map(|()| self.snapshot(now));
                if result.is_ok() {
                    info!(
                        zone_id = %self.machine.zone_id,
                        flow_rate,
                        duration_secs = duration.as_secs(),
                        ?trigger,
                        "Irrigation started"
                    );
                }
                self.transitioned(before, "start");
                let _ = reply.send(result);
            }
            ZoneCommand::Stop { reply } => {
                let result = self.close(EndReason::Manual, now);
                self.transitioned(before, "stop");
                let _ = reply.send(result);
            }
            ZoneCommand::Pause { reply } => {
                let result = self.machine.pause(now).map(|()| self.snapshot(now));
                self.transitioned(before, "pause");
                let _ = reply.send(result);
            }
            ZoneCommand::Resume { reply } => {
                let result = self.machine.resume(now).map(|()| self.snapshot(now));
                self.transitioned(before, "resume");
                let _ = reply.send(result);
            }
            ZoneCommand::SetSchedule { schedule, reply } => {
                self.machine.set_schedule(schedule);
                let _ = reply.send(self.snapshot(now));
            }
            ZoneCommand::Status { reply } => {
                let _ = reply.send(self.snapshot(now));
            }
            ZoneCommand::History { reply } => {
                let _ = reply.send(self.history.iter().cloned().collect());
            }
        }
    }

    fn auto_stop(&mut self, now: Instant) {
        let before = self.machine.state();
        match self.close(EndReason::AutoStop, now) {
            Ok(record) => debug!(
                zone_id = %record.zone_id,
                "Auto-stop fired after {:.0}s",
                record.active_seconds
            ),
            Err(e) => debug!(zone_id = %self.machine.zone_id, "Auto-stop skipped: {}", e),
        }
        self.transitioned(before, "auto_stop");
    }

    fn close(&mut self, reason: EndReason, now: Instant) -> Result<ActivationRecord> {
        let record = self.machine.stop(reason, now, Utc::now())?;
        info!(
            zone_id = %record.zone_id,
            water_used = record.water_used,
            active_seconds = record.active_seconds,
            ?reason,
            "Irrigation stopped"
        );
        if self.history.len() >= HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(record.clone());
        Ok(record)
    }

    fn transitioned(&self, before: ZoneState, kind: &str) {
        let after = self.machine.state();
        if before == after {
            return;
        }
        IRRIGATION_TRANSITIONS_TOTAL.with_label_values(&[kind]).inc();
        match (before == ZoneState::Active, after == ZoneState::Active) {
            (false, true) => ACTIVE_ZONES.inc(),
            (true, false) => ACTIVE_ZONES.dec(),
            _ => {}
        }
    }

    fn snapshot(&self, now: Instant) -> IrrigationZone {
        self.machine.snapshot(now, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn mins(m: u64) -> Duration {
        Duration::from_secs(m * 60)
    }

    #[test]
    fn test_start_stop_accounts_water() {
        let mut zone = ZoneMachine::new("field-a");
        let t0 = Instant::now();
        zone.start(mins(30), 2.5, Trigger::Manual, t0, Utc::now()).unwrap();

        let snap = zone.snapshot(t0, Utc::now());
        assert_eq!(snap.state, ZoneState::Active);
        assert_eq!(snap.current_flow_rate, 2.5);

        let record = zone
            .stop(EndReason::Manual, t0 + Duration::from_secs(100), Utc::now())
            .unwrap();
        assert!((record.water_used - 250.0).abs() < EPS);
        assert!((zone.total_water_used() - 250.0).abs() < EPS);
        assert_eq!(zone.snapshot(t0, Utc::now()).current_flow_rate, 0.0);
    }

    #[test]
    fn test_double_start_conflicts() {
        let mut zone = ZoneMachine::new("field-a");
        let t0 = Instant::now();
        zone.start(mins(30), 2.5, Trigger::Manual, t0, Utc::now()).unwrap();
        let err = zone
            .start(mins(30), 2.5, Trigger::Manual, t0, Utc::now())
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        zone.pause(t0).unwrap();
        assert!(matches!(
            zone.start(mins(5), 1.0, Trigger::Manual, t0, Utc::now()),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn test_pause_resume_excludes_paused_time() {
        let mut zone = ZoneMachine::new("field-a");
        let t0 = Instant::now();
        zone.start(mins(30), 2.0, Trigger::Manual, t0, Utc::now()).unwrap();

        zone.pause(t0 + Duration::from_secs(60)).unwrap();
        assert_eq!(zone.deadline(), None);
        zone.resume(t0 + Duration::from_secs(600)).unwrap();
        zone.pause(t0 + Duration::from_secs(630)).unwrap();
        zone.resume(t0 + Duration::from_secs(700)).unwrap();

        let record = zone
            .stop(EndReason::Manual, t0 + Duration::from_secs(710), Utc::now())
            .unwrap();
        // 60 + 30 + 10 seconds of flow
        assert!((record.active_seconds - 100.0).abs() < EPS);
        assert!((record.water_used - 200.0).abs() < EPS);
    }

    #[test]
    fn test_resume_rearms_remaining_budget() {
        let mut zone = ZoneMachine::new("field-a");
        let t0 = Instant::now();
        zone.start(mins(10), 1.0, Trigger::Manual, t0, Utc::now()).unwrap();
        assert_eq!(zone.deadline(), Some(t0 + mins(10)));

        zone.pause(t0 + mins(4)).unwrap();
        zone.resume(t0 + mins(20)).unwrap();
        assert_eq!(zone.deadline(), Some(t0 + mins(26)));
    }

    #[test]
    fn test_flow_never_exceeds_budget() {
        let mut zone = ZoneMachine::new("field-a");
        let t0 = Instant::now();
        zone.start(mins(1), 1.0, Trigger::Manual, t0, Utc::now()).unwrap();
        let record = zone
            .stop(EndReason::AutoStop, t0 + mins(5), Utc::now())
            .unwrap();
        assert!((record.active_seconds - 60.0).abs() < EPS);
    }

    #[test]
    fn test_illegal_transitions() {
        let mut zone = ZoneMachine::new("field-a");
        let t0 = Instant::now();
        assert!(matches!(
            zone.stop(EndReason::Manual, t0, Utc::now()),
            Err(Error::Conflict(_))
        ));
        assert!(matches!(zone.pause(t0), Err(Error::Conflict(_))));
        assert!(matches!(zone.resume(t0), Err(Error::Conflict(_))));
        assert!(matches!(
            zone.start(mins(1), 0.0, Trigger::Manual, t0, Utc::now()),
            Err(Error::Validation { .. })
        ));
        assert!(matches!(
            zone.start(Duration::ZERO, 1.0, Trigger::Manual, t0, Utc::now()),
            Err(Error::Validation { .. })
        ));
    }

    #[test]
    fn test_stop_from_paused() {
        let mut zone = ZoneMachine::new("field-a");
        let t0 = Instant::now();
        zone.start(mins(10), 3.0, Trigger::Schedule, t0, Utc::now()).unwrap();
        zone.pause(t0 + Duration::from_secs(20)).unwrap();
        let record = zone
            .stop(EndReason::Manual, t0 + Duration::from_secs(500), Utc::now())
            .unwrap();
        assert!((record.water_used - 60.0).abs() < EPS);
        assert_eq!(record.trigger, Trigger::Schedule);
        assert_eq!(zone.state(), ZoneState::Inactive);
    }

    #[test]
    fn test_water_total_accumulates_across_activations() {
        let mut zone = ZoneMachine::new("field-a");
        let t0 = Instant::now();
        zone.start(mins(10), 1.0, Trigger::Manual, t0, Utc::now()).unwrap();
        zone.stop(EndReason::Manual, t0 + Duration::from_secs(10), Utc::now())
            .unwrap();
        zone.start(mins(10), 2.0, Trigger::Manual, t0 + Duration::from_secs(20), Utc::now())
            .unwrap();
        zone.stop(EndReason::Manual, t0 + Duration::from_secs(30), Utc::now())
            .unwrap();
        assert!((zone.total_water_used() - 30.0).abs() < EPS);
    }
}

// THEORY:
// The `AlertEngine` is the part of the system that talks to humans. Its job is
// to turn a noisy, per-tick stream of risk levels into a short list of alerts
// that are each worth reading. It does that with hysteresis: a condition has to
// persist before it is reported, and once reported it is not repeated until
// something changes.
//
// Key architectural principles:
// 1.  **Episodes**: For every zone, entering `High` or `Critical` opens an
//     episode. Nothing is said for the first `sustain_ms`; after that exactly one
//     alert fires and the episode is marked notified. Dropping back below `High`
//     deletes the episode, so the next spike starts a fresh timer.
// 2.  **Acknowledgement Re-arms**: Resolving an alert clears the notified mark on
//     the episode it belongs to. A condition that is still ongoing will be
//     reported again rather than being silenced forever by a single click.
// 3.  **Duplicate Suppression**: A zone never gets two risk alerts closer than
//     `zone_dedupe_window_ms`. The global signal comes straight from the
//     producer, so it skips the sustain delay and relies on its own window
//     (`global_dedupe_window_ms`) instead. It re-alerts when the severity
//     escalates, and repeats as a reminder once per window while it stays
//     elevated.
// 4.  **Checkups**: Independently of risk, each zone gets a low-severity summary
//     every `checkup_interval_ms`. Its timer shares nothing with the episodes.
// 5.  **Clock Comparisons Only**: There are no scheduled callbacks. Every decision
//     compares the `now` passed in against stored timestamps, so "cancelling" the
//     engine is simply not calling it any more.

use crate::core_modules::density_frame::GlobalStats;
use crate::core_modules::risk::RiskLevel;
use crate::core_modules::snapshot::{Snapshot, SnapshotCapture};
use crate::core_modules::zone_marker::ZoneMarker;
use crate::core_modules::zone_stats::ZoneStats;
use crate::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{info, warn};

/// Timing and retention policy for alerting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertPolicy {
    /// How long a zone must stay elevated before it alerts.
    pub sustain_ms: u64,
    /// Interval between informational checkups per zone.
    pub checkup_interval_ms: u64,
    /// Minimum gap between two risk alerts for the same zone.
    pub zone_dedupe_window_ms: u64,
    /// Minimum gap between two global alerts of the same severity.
    pub global_dedupe_window_ms: u64,
    /// Number of alerts kept in the log, newest first.
    pub max_retained: usize,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            sustain_ms: 3_000,
            checkup_interval_ms: 60_000,
            zone_dedupe_window_ms: 5_000,
            global_dedupe_window_ms: 5_000,
            max_retained: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// A zone stayed at high or critical risk for the sustain period.
    SustainedRisk,
    /// Periodic low-severity summary of a zone.
    Checkup,
    /// The frame-wide risk signal is high or critical.
    GlobalRisk,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SustainedRisk => "sustained",
            Self::Checkup => "checkup",
            Self::GlobalRisk => "global",
        }
    }
}

/// One alert, as shown to operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    /// Unique within the session.
    pub id: String,
    pub timestamp: u64,
    /// `None` for global alerts.
    pub zone_id: Option<u64>,
    pub zone_name: Option<String>,
    pub severity: RiskLevel,
    pub kind: AlertKind,
    pub message: String,
    #[serde(skip)]
    pub snapshot: Option<Snapshot>,
}

/// Changes to the alert feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertUpdate {
    Raised(AlertEvent),
    Resolved { id: String },
}

/// Externally visible view of one subject's alerting state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RiskHysteresisState {
    /// When the current elevated episode started.
    pub elevated_since: Option<u64>,
    /// Whether the current episode has already alerted.
    pub notified: bool,
    /// When the last checkup fired (or the checkup timer started).
    pub last_checkup_at: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct Episode {
    elevated_since: u64,
    /// Severity of the alert that fired for this episode, if any.
    notified: Option<RiskLevel>,
}

impl Episode {
    fn open(now: u64) -> Self {
        Self {
            elevated_since: now,
            notified: None,
        }
    }
}

/// Hysteresis-based alert state machine for zones and the global signal.
#[derive(Debug, Default)]
pub struct AlertEngine {
    policy: AlertPolicy,
    zone_episodes: HashMap<u64, Episode>,
    zone_checkups: HashMap<u64, u64>,
    zone_last_risk_alert: HashMap<u64, u64>,
    global_episode: Option<Episode>,
    global_last_alert: Option<(RiskLevel, u64)>,
    log: VecDeque<AlertEvent>,
    sequence: u64,
}

impl AlertEngine {
    pub fn new(policy: AlertPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn policy(&self) -> &AlertPolicy {
        &self.policy
    }

    /// Feeds one tick of zone stats. `markers` is the set the stats were derived
    /// from; it is used to look markers up for snapshot capture.
    pub fn observe_zones(
        &mut self,
        now: u64,
        zones: &[ZoneStats],
        markers: &[ZoneMarker],
        capture: Option<&dyn SnapshotCapture>,
    ) -> Vec<AlertEvent> {
        self.prune_zones(zones);

        let mut raised = Vec::new();
        for zone in zones {
            if let Some(alert) = self.observe_zone_risk(now, zone, markers, capture) {
                raised.push(alert);
            }
            if let Some(alert) = self.observe_zone_checkup(now, zone) {
                raised.push(alert);
            }
        }
        raised
    }

    fn observe_zone_risk(
        &mut self,
        now: u64,
        zone: &ZoneStats,
        markers: &[ZoneMarker],
        capture: Option<&dyn SnapshotCapture>,
    ) -> Option<AlertEvent> {
        let level = zone.risk_level;
        if !level.is_elevated() {
            // Episode over. The next elevation starts from scratch.
            self.zone_episodes.remove(&zone.id);
            return None;
        }

        let episode = *self
            .zone_episodes
            .entry(zone.id)
            .or_insert_with(|| Episode::open(now));
        let sustained_for = now.saturating_sub(episode.elevated_since);
        if episode.notified.is_some() || sustained_for < self.policy.sustain_ms {
            return None;
        }
        if let Some(last) = self.zone_last_risk_alert.get(&zone.id) {
            if now.saturating_sub(*last) < self.policy.zone_dedupe_window_ms {
                return None;
            }
        }

        let snapshot = capture.and_then(|capture| {
            let marker = markers.iter().find(|m| m.id == zone.id)?;
            capture
                .capture(marker)
                .map_err(|e| warn!(zone = %zone.name, "Alert will go out without a snapshot: {}", e))
                .ok()
        });

        let message = format!(
            "{} density sustained in {} for {:.1}s ({:.0}% of peak, ~{} people).",
            level.as_str().to_uppercase(),
            zone.name,
            sustained_for as f64 / 1000.0,
            zone.density * 100.0,
            zone.people_count_estimate
        );
        let id = self.next_id(now, &zone.id.to_string(), AlertKind::SustainedRisk);
        let alert = self.record(AlertEvent {
            id,
            timestamp: now,
            zone_id: Some(zone.id),
            zone_name: Some(zone.name.clone()),
            severity: level,
            kind: AlertKind::SustainedRisk,
            message,
            snapshot,
        });

        if let Some(episode) = self.zone_episodes.get_mut(&zone.id) {
            episode.notified = Some(level);
        }
        self.zone_last_risk_alert.insert(zone.id, now);
        Some(alert)
    }

    fn observe_zone_checkup(&mut self, now: u64, zone: &ZoneStats) -> Option<AlertEvent> {
        let last = self.zone_checkups.entry(zone.id).or_insert(now);
        if now.saturating_sub(*last) < self.policy.checkup_interval_ms {
            return None;
        }
        *last = now;

        let message = format!(
            "Routine check: {} at {:.0}% density, {} risk, ~{} people.",
            zone.name,
            zone.density * 100.0,
            zone.risk_level,
            zone.people_count_estimate
        );
        let id = self.next_id(now, &zone.id.to_string(), AlertKind::Checkup);
        Some(self.record(AlertEvent {
            id,
            timestamp: now,
            zone_id: Some(zone.id),
            zone_name: Some(zone.name.clone()),
            severity: RiskLevel::Low,
            kind: AlertKind::Checkup,
            message,
            snapshot: None,
        }))
    }

    /// Drops all state for zones that are no longer in the marker set.
    fn prune_zones(&mut self, zones: &[ZoneStats]) {
        let present: HashSet<u64> = zones.iter().map(|z| z.id).collect();
        self.zone_episodes.retain(|id, _| present.contains(id));
        self.zone_checkups.retain(|id, _| present.contains(id));
        self.zone_last_risk_alert.retain(|id, _| present.contains(id));
    }

    /// Feeds the global risk signal for one live frame.
    pub fn observe_global(
        &mut self,
        now: u64,
        risk: RiskLevel,
        stats: &GlobalStats,
    ) -> Option<AlertEvent> {
        if !risk.is_elevated() {
            self.global_episode = None;
            return None;
        }

        let window = self.policy.global_dedupe_window_ms;
        let episode = *self.global_episode.get_or_insert_with(|| Episode::open(now));
        let escalated = episode.notified.is_none_or(|notified| risk > notified);
        let reminder_due = self
            .global_last_alert
            .is_some_and(|(_, at)| now.saturating_sub(at) >= window);
        if !(escalated || reminder_due) {
            return None;
        }
        if let Some((severity, at)) = self.global_last_alert {
            if severity == risk && now.saturating_sub(at) < window {
                return None;
            }
        }

        let message = format!(
            "{} density detected: {:.0}% capacity, ~{:.0} people.",
            if risk == RiskLevel::Critical {
                "Critical"
            } else {
                "High"
            },
            stats.global_density * 100.0,
            stats.total_people
        );
        let id = self.next_id(now, "global", AlertKind::GlobalRisk);
        let alert = self.record(AlertEvent {
            id,
            timestamp: now,
            zone_id: None,
            zone_name: None,
            severity: risk,
            kind: AlertKind::GlobalRisk,
            message,
            snapshot: None,
        });

        if let Some(episode) = self.global_episode.as_mut() {
            episode.notified = Some(risk);
        }
        self.global_last_alert = Some((risk, now));
        Some(alert)
    }

    /// Operator acknowledgement. Removes the alert and re-arms its episode.
    pub fn resolve(&mut self, id: &str) -> PipelineResult<AlertUpdate> {
        let index = self
            .log
            .iter()
            .position(|a| a.id == id)
            .ok_or_else(|| PipelineError::UnknownAlert(id.to_string()))?;
        let Some(alert) = self.log.remove(index) else {
            return Err(PipelineError::UnknownAlert(id.to_string()));
        };

        match (alert.kind, alert.zone_id) {
            (AlertKind::SustainedRisk, Some(zone_id)) => {
                if let Some(episode) = self.zone_episodes.get_mut(&zone_id) {
                    episode.notified = None;
                }
            }
            (AlertKind::GlobalRisk, _) => {
                if let Some(episode) = self.global_episode.as_mut() {
                    episode.notified = None;
                }
            }
            _ => {}
        }

        info!(alert_id = %alert.id, "Alert resolved");
        Ok(AlertUpdate::Resolved { id: alert.id })
    }

    /// Retained alerts, newest first.
    pub fn alerts(&self) -> impl Iterator<Item = &AlertEvent> {
        self.log.iter()
    }

    pub fn zone_state(&self, zone_id: u64) -> RiskHysteresisState {
        let episode = self.zone_episodes.get(&zone_id);
        RiskHysteresisState {
            elevated_since: episode.map(|e| e.elevated_since),
            notified: episode.is_some_and(|e| e.notified.is_some()),
            last_checkup_at: self.zone_checkups.get(&zone_id).copied(),
        }
    }

    pub fn global_state(&self) -> RiskHysteresisState {
        RiskHysteresisState {
            elevated_since: self.global_episode.map(|e| e.elevated_since),
            notified: self.global_episode.is_some_and(|e| e.notified.is_some()),
            last_checkup_at: None,
        }
    }

    /// Forgets every episode, timer and retained alert.
    pub fn reset(&mut self) {
        let policy = std::mem::take(&mut self.policy);
        *self = Self::new(policy);
    }

    fn next_id(&mut self, now: u64, subject: &str, kind: AlertKind) -> String {
        self.sequence += 1;
        format!("{now}-{subject}-{}-{}", kind.as_str(), self.sequence)
    }

    fn record(&mut self, alert: AlertEvent) -> AlertEvent {
        info!(
            alert_id = %alert.id,
            severity = %alert.severity,
            zone = alert.zone_name.as_deref().unwrap_or("global"),
            "{}",
            alert.message
        );
        self.log.push_front(alert.clone());
        self.log.truncate(self.policy.max_retained.max(1));
        alert
    }
}

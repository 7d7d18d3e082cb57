//! Health reporting.
//!
//! The agent emits structured health reports through a sink owned by the
//! embedding process. The only structured descriptor is the
//! "reconfiguration stuck" report, which names the phase and the replicas
//! that are holding it up.

use std::sync::Mutex;

use peridot_types::{ActivityId, FailoverUnitId, NodeId, ReplicaId, Timestamp};

use crate::state::{ReconfigurationPhase, StuckReason};

/// Severity of a health report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthReportKind {
    Ok,
    Warning,
    Error,

    /// Clears a previously emitted warning for the same property.
    ClearWarning,
}

/// Structured descriptor attached to reconfiguration-stuck warnings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconfigurationStuckDescriptor {
    pub ft_id: FailoverUnitId,
    pub phase: ReconfigurationPhase,
    pub reason: StuckReason,

    /// The replicas that have not made progress, with their nodes.
    pub delinquent: Vec<(ReplicaId, NodeId)>,

    pub phase_started_at: Timestamp,
}

impl std::fmt::Display for ReconfigurationStuckDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "reconfiguration of {} stuck in {} ({:?}); waiting on ",
            self.ft_id, self.phase, self.reason
        )?;
        if self.delinquent.is_empty() {
            write!(f, "local progress")
        } else {
            let list: Vec<String> = self
                .delinquent
                .iter()
                .map(|(replica, node)| format!("{replica}@{node}"))
                .collect();
            write!(f, "{}", list.join(", "))
        }
    }
}

/// A health report emitted by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub kind: HealthReportKind,
    pub property: String,
    pub description: String,
    pub activity_id: ActivityId,
    pub ft_id: Option<FailoverUnitId>,
    pub stuck: Option<ReconfigurationStuckDescriptor>,
}

impl HealthReport {
    pub fn reconfiguration_stuck(
        activity_id: ActivityId,
        descriptor: ReconfigurationStuckDescriptor,
    ) -> Self {
        Self {
            kind: HealthReportKind::Warning,
            property: "Reconfiguration".to_string(),
            description: descriptor.to_string(),
            activity_id,
            ft_id: Some(descriptor.ft_id),
            stuck: Some(descriptor),
        }
    }

    pub fn reconfiguration_clear(activity_id: ActivityId, ft_id: FailoverUnitId) -> Self {
        Self {
            kind: HealthReportKind::ClearWarning,
            property: "Reconfiguration".to_string(),
            description: String::new(),
            activity_id,
            ft_id: Some(ft_id),
            stuck: None,
        }
    }

    pub fn replica_operation(
        kind: HealthReportKind,
        ft_id: FailoverUnitId,
        activity_id: ActivityId,
        description: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            property: "ReplicaOperation".to_string(),
            description: description.into(),
            activity_id,
            ft_id: Some(ft_id),
            stuck: None,
        }
    }
}

/// Sink for health reports.
pub trait HealthSink: Send + Sync {
    fn report(&self, report: HealthReport);
}

/// Sink that records every report (tests and diagnostics).
#[derive(Debug, Default)]
pub struct RecordingHealthSink {
    reports: Mutex<Vec<HealthReport>>,
}

impl RecordingHealthSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<HealthReport> {
        self.reports
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl HealthSink for RecordingHealthSink {
    fn report(&self, report: HealthReport) {
        self.reports
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(report);
    }
}

/// Sink that drops every report (embedders without health wiring).
#[derive(Debug, Default)]
pub struct NullHealthSink;

impl HealthSink for NullHealthSink {
    fn report(&self, _report: HealthReport) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stuck_descriptor_lists_delinquents() {
        let descriptor = ReconfigurationStuckDescriptor {
            ft_id: FailoverUnitId::generate(),
            phase: ReconfigurationPhase::Phase2Catchup,
            reason: StuckReason::Phase2NoReplyFromProxy,
            delinquent: vec![
                (ReplicaId::new(2), NodeId::new(20)),
                (ReplicaId::new(3), NodeId::new(30)),
            ],
            phase_started_at: Timestamp::from_nanos(1),
        };

        let text = descriptor.to_string();
        assert!(text.contains("Phase2_Catchup"));
        assert!(text.contains("2@20"));
        assert!(text.contains("3@30"));
    }

    #[test]
    fn recording_sink_captures_reports() {
        let sink = RecordingHealthSink::new();
        sink.report(HealthReport::reconfiguration_clear(
            ActivityId::generate(),
            FailoverUnitId::generate(),
        ));
        assert_eq!(sink.reports().len(), 1);
        assert_eq!(sink.reports()[0].kind, HealthReportKind::ClearWarning);
    }
}

//! The reconfiguration agent: node-level owner of all failover units.
//!
//! # Message pipeline
//!
//! 1. look up the action's routing metadata
//! 2. reject if the node is closing and the message does not flow during
//!    close
//! 3. check the generation header; stale generations are dropped, newer
//!    ones advance the receive generation
//! 4. apply the staleness check against the target unit's epoch and
//!    replica instance
//! 5. enqueue a job item on the unit's scheduler and run execution cycles
//!
//! Job items queue actions; the agent dispatches them after the entity
//! lock releases: outgoing messages to the FM and to peer agents, IPC
//! requests to the proxy, retry timers, health reports and host
//! termination.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use peridot_store::api::KeyValueStoreApi;
use peridot_store::api::RowType;
use peridot_types::{
    ActivityId, FailoverManagerKind, FailoverUnitId, NodeInstance, ReplicaId, ReplicaLifecycle,
    ReplicaRole, ServiceDescription, Timestamp,
};
use peridot_wire::{
    ConfigurationBody, GetLsnReplyBody, Message, MessageAction, MessageBody, MessageTarget,
    OperationOutcome, ProxyAction, ProxyMessageFlags, ProxyReply, ProxyRequest, ReplicaListBody,
    ReplicaMessageBody, ReplicaReplyBody, StalenessCheck, metadata_for,
};
use tracing::{debug, info, warn};

use crate::actions::StateMachineAction;
use crate::generation::{GenerationCheck, GenerationStateManager};
use crate::health::{HealthReport, HealthReportKind, HealthSink, ReconfigurationStuckDescriptor};
use crate::hosting::{HostTerminator, ProxyChannel};
use crate::infrastructure::{
    BackgroundWorkManagerWithRetry, CheckContext, Clock, DeadlockDetector, EntityMap,
    ErrorCategory, JobItem, JobItemCheck, JobItemOutcome, RetryPolicy, RetryRequirement,
};
use crate::node::{FmMessageThrottle, NodeDeactivationState, PendingReplicaUploadState};
use crate::settings::RaSettings;
use crate::state::{
    FailoverUnit, FmMessageStage, ReconfigurationPhase, RetryableErrorAction,
};
use crate::RaError;

// ============================================================================
// Transport seam
// ============================================================================

/// Outgoing message transport (the wire substrate is external).
pub trait MessageSender: Send + Sync {
    fn send_to_fm(&self, kind: FailoverManagerKind, message: Message);
    fn send_to_node(&self, node: NodeInstance, message: Message);
}

/// Sender that records messages (tests and embedders without transport).
#[derive(Debug, Default)]
pub struct RecordingSender {
    fm: Mutex<Vec<(FailoverManagerKind, Message)>>,
    nodes: Mutex<Vec<(NodeInstance, Message)>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fm_messages(&self) -> Vec<(FailoverManagerKind, Message)> {
        self.fm
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn node_messages(&self) -> Vec<(NodeInstance, Message)> {
        self.nodes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl MessageSender for RecordingSender {
    fn send_to_fm(&self, kind: FailoverManagerKind, message: Message) {
        self.fm
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((kind, message));
    }

    fn send_to_node(&self, node: NodeInstance, message: Message) {
        self.nodes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((node, message));
    }
}

// ============================================================================
// Agent
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RaLifecycle {
    Closed,
    Open,
    Closing,
}

/// External collaborators handed to the agent at construction.
pub struct RaDependencies {
    pub store: Arc<dyn KeyValueStoreApi>,
    pub sender: Arc<dyn MessageSender>,
    pub proxy_channel: Arc<dyn ProxyChannel>,
    pub health: Arc<dyn HealthSink>,
    pub terminator: Arc<dyn HostTerminator>,
    pub clock: Arc<dyn Clock>,
}

/// The node-level reconfiguration agent.
pub struct ReconfigurationAgent {
    node: NodeInstance,
    settings: RaSettings,
    deps: RaDependencies,
    lifecycle: Mutex<RaLifecycle>,
    lfum: EntityMap<FailoverUnit>,
    generations: GenerationStateManager,
    deactivation: NodeDeactivationState,
    upload: PendingReplicaUploadState,
    throttle: FmMessageThrottle,
    retry_policy: RetryPolicy,
    deadlock: std::sync::Arc<DeadlockDetector>,

    /// Coalesces and paces the replica-up backlog bursts.
    replica_up_work: BackgroundWorkManagerWithRetry,

    /// Armed per-unit retry deadlines, driven by `process_timer_tick`.
    retries: Mutex<HashMap<FailoverUnitId, Timestamp>>,
}

impl ReconfigurationAgent {
    pub fn new(node: NodeInstance, settings: RaSettings, deps: RaDependencies) -> Self {
        let throttle = FmMessageThrottle::new(settings.fm_message_batch_size);
        let deadlock = DeadlockDetector::new(
            std::time::Duration::from_millis(settings.deadlock_budget_ms),
            settings.fail_fast_on_deadlock,
        );
        let replica_up_work = BackgroundWorkManagerWithRetry::new(
            "replica-up",
            Duration::from_millis(settings.min_interval_between_fm_messages_ms),
            Duration::from_millis(settings.replica_up_retry_interval_ms),
        );
        Self {
            node,
            settings,
            deps,
            lifecycle: Mutex::new(RaLifecycle::Closed),
            lfum: EntityMap::new(),
            generations: GenerationStateManager::new(),
            deactivation: NodeDeactivationState::new(),
            upload: PendingReplicaUploadState::new(),
            throttle,
            retry_policy: RetryPolicy::new(),
            deadlock,
            replica_up_work,
            retries: Mutex::new(HashMap::new()),
        }
    }

    pub fn node(&self) -> NodeInstance {
        self.node
    }

    pub fn generations(&self) -> &GenerationStateManager {
        &self.generations
    }

    pub fn deactivation(&self) -> &NodeDeactivationState {
        &self.deactivation
    }

    pub fn failover_unit(&self, ft_id: FailoverUnitId) -> Option<FailoverUnit> {
        self.lfum.get(&ft_id).and_then(|entry| entry.read())
    }

    pub fn failover_unit_count(&self) -> usize {
        self.lfum.len()
    }

    fn lifecycle_state(&self) -> RaLifecycle {
        *self
            .lifecycle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn check_context(&self) -> CheckContext {
        let lifecycle = self.lifecycle_state();
        CheckContext {
            ra_is_open: lifecycle == RaLifecycle::Open,
            ra_is_closing: lifecycle == RaLifecycle::Closing,
        }
    }

    /// Opens the agent: loads the local failover unit map from the store
    /// and seeds the replica-up backlog. Returns the number of units
    /// loaded.
    pub fn open(&self, activity_id: ActivityId) -> Result<usize, RaError> {
        let rows = self.deps.store.enumerate(RowType::FailoverUnit)?;
        let mut loaded = 0usize;
        let mut ids = Vec::new();

        for row in rows {
            match FailoverUnit::from_persisted_bytes(&row.data) {
                Ok(mut ft) => {
                    // Everything on disk predates this node incarnation.
                    ft.upload_pending = true;
                    ids.push(ft.ft_id);
                    self.lfum.insert_persisted(ft);
                    loaded += 1;
                }
                Err(e) => {
                    warn!(row = %row.id, error = %e, "skipping unreadable failover unit record");
                }
            }
        }

        self.upload.seed(ids);
        *self
            .lifecycle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = RaLifecycle::Open;

        info!(%activity_id, loaded, "reconfiguration agent open");
        Ok(loaded)
    }

    /// Begins node close: new work is rejected unless its message flows
    /// during close.
    pub fn begin_close(&self) {
        *self
            .lifecycle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = RaLifecycle::Closing;
    }

    pub fn finish_close(&self) {
        *self
            .lifecycle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = RaLifecycle::Closed;
        self.deps.store.close();
    }

    // ========================================================================
    // Message pipeline
    // ========================================================================

    /// Processes one incoming failover message.
    pub fn process_message(&self, message: &Message) -> Result<(), RaError> {
        let metadata = metadata_for(message.action());

        let lifecycle = self.lifecycle_state();
        if lifecycle != RaLifecycle::Open && !metadata.process_during_node_close {
            return Err(RaError::NotOpen);
        }
        if lifecycle == RaLifecycle::Closed {
            return Err(RaError::NotOpen);
        }

        if let Some(header) = message.generation {
            if self.generations.check_receive(header) == GenerationCheck::Stale {
                return Err(RaError::StaleMessage(format!(
                    "generation {} superseded",
                    header.generation
                )));
            }
        }

        match metadata.target {
            MessageTarget::Ra => self.process_ra_message(message),
            MessageTarget::FailoverUnit => {
                self.process_ft_message(message, metadata.creates_entity, metadata.staleness_check)
            }
        }
    }

    fn process_ra_message(&self, message: &Message) -> Result<(), RaError> {
        match &message.body {
            MessageBody::NodeActivate(body) | MessageBody::NodeDeactivate(body) => {
                self.deactivation.process(*body);
                Ok(())
            }
            MessageBody::NodeUpAck(body) => {
                self.deactivation.process(*body);
                // Node up acknowledged: start reporting replicas.
                self.request_replica_up(message.activity_id);
                Ok(())
            }
            MessageBody::GenerationProposal(body) => {
                let reply = self.generations.handle_proposal(*body);
                self.deps.sender.send_to_fm(
                    body.generation.kind,
                    Message::new(
                        self.node,
                        message.activity_id,
                        MessageBody::GenerationProposalReply(reply),
                    ),
                );
                Ok(())
            }
            MessageBody::GenerationUpdate(body) => {
                if !self.generations.handle_update(*body) {
                    return Err(RaError::StaleMessage("stale generation update".into()));
                }
                Ok(())
            }
            MessageBody::ReplicaUpReply(body) => {
                let acked: Vec<FailoverUnitId> = body
                    .up
                    .iter()
                    .chain(body.dropped.iter())
                    .map(|info| info.failover_unit.ft_id)
                    .collect();
                self.upload.acknowledge(&acked, body.is_last);
                for ft_id in acked {
                    if let Some(entry) = self.lfum.get(&ft_id) {
                        let actions = self.lfum.schedule_and_execute(
                            &entry,
                            Box::new(ClearUploadJobItem),
                            self.deps.store.as_ref(),
                            self.check_context(),
                            self.settings.store_operation_timeout(),
                        );
                        self.dispatch_actions(actions, message.activity_id);
                    }
                }
                Ok(())
            }
            MessageBody::ServiceTypeEnabled(_) | MessageBody::ServiceTypeDisabled(_) => {
                // Tracked by the hosting subsystem; nothing to do per unit.
                Ok(())
            }
            other => {
                debug!(action = ?other.action(), "ignoring node-level message");
                Ok(())
            }
        }
    }

    fn process_ft_message(
        &self,
        message: &Message,
        creates_entity: bool,
        staleness: StalenessCheck,
    ) -> Result<(), RaError> {
        let Some(fu_desc) = message.body.failover_unit() else {
            return Err(RaError::StaleMessage("message without failover unit".into()));
        };

        let entry = match self.lfum.get(&fu_desc.ft_id) {
            Some(entry) => entry,
            None if creates_entity => self.lfum.get_or_create(&fu_desc.ft_id),
            None => return Err(RaError::UnknownFailoverUnit),
        };

        if staleness != StalenessCheck::None {
            if let Some(ft) = entry.read() {
                if fu_desc.current_epoch < ft.current_epoch {
                    return Err(RaError::StaleMessage(format!(
                        "epoch {} behind {}",
                        fu_desc.current_epoch, ft.current_epoch
                    )));
                }
                if let (MessageBody::ReplicaOpen(body) | MessageBody::ReplicaClose(body), Some(local)) =
                    (&message.body, &ft.local_replica)
                {
                    if body.replica.replica_id == local.replica_id
                        && body.replica.instance_id < local.instance_id
                    {
                        return Err(RaError::StaleMessage("superseded replica instance".into()));
                    }
                }
            }
        }

        let item = FtMessageJobItem {
            body: message.body.clone(),
            from: message.from,
            node: self.node,
            now: self.deps.clock.now(),
        };
        let _section = self.deadlock.enter("ft-execution-cycle", self.deps.clock.now());
        let actions = self.lfum.schedule_and_execute(
            &entry,
            Box::new(item),
            self.deps.store.as_ref(),
            self.check_context(),
            self.settings.store_operation_timeout(),
        );
        self.dispatch_actions(actions, message.activity_id);
        Ok(())
    }

    /// Processes a proxy reply delivered over IPC.
    pub fn process_proxy_reply(
        &self,
        reply: &ProxyReply,
        activity_id: ActivityId,
    ) -> Result<(), RaError> {
        let Some(entry) = self.lfum.get(&reply.failover_unit.ft_id) else {
            return Err(RaError::UnknownFailoverUnit);
        };

        // FtProxy staleness: a reply for an older epoch is from a previous
        // configuration of this unit.
        if let Some(ft) = entry.read() {
            if reply.failover_unit.current_epoch < ft.current_epoch {
                return Err(RaError::StaleMessage(format!(
                    "proxy reply epoch {} behind {}",
                    reply.failover_unit.current_epoch, ft.current_epoch
                )));
            }
        }

        let item = ProxyReplyJobItem {
            reply: reply.clone(),
            now: self.deps.clock.now(),
            thresholds: self.settings.retryable_error_thresholds,
        };
        let _section = self.deadlock.enter("proxy-reply-cycle", self.deps.clock.now());
        let actions = self.lfum.schedule_and_execute(
            &entry,
            Box::new(item),
            self.deps.store.as_ref(),
            self.check_context(),
            self.settings.store_operation_timeout(),
        );
        self.dispatch_actions(actions, activity_id);
        Ok(())
    }

    // ========================================================================
    // Action dispatch
    // ========================================================================

    fn dispatch_actions(&self, actions: Vec<StateMachineAction>, activity_id: ActivityId) {
        for action in actions {
            match action {
                StateMachineAction::SendToFm { kind, body } => {
                    let message = Message::new(self.node, activity_id, body)
                        .with_generation(self.generations.send_generation(kind));
                    self.deps.sender.send_to_fm(kind, message);
                }
                StateMachineAction::SendToNode { node, body } => {
                    let message = Message::new(self.node, activity_id, body);
                    self.deps.sender.send_to_node(node, message);
                }
                StateMachineAction::SendToProxy(request) => {
                    let reply = self.deps.proxy_channel.submit(&request);
                    if let Err(e) = self.process_proxy_reply(&reply, activity_id) {
                        debug!(error = %e, "proxy reply dropped");
                    }
                }
                StateMachineAction::ArmRetry { ft_id, delay } => {
                    let deadline = self.deps.clock.now().saturating_add(delay);
                    self.retries
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .insert(ft_id, deadline);
                }
                StateMachineAction::ReportHealth(report) => {
                    self.deps.health.report(report);
                }
                StateMachineAction::TerminateHost { runtime_id, reason } => {
                    self.deps.terminator.terminate(&runtime_id, &reason);
                }
            }
        }
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Drives time-based work: stuck-reconfiguration health and armed
    /// per-unit retries.
    pub fn process_timer_tick(&self) {
        let now = self.deps.clock.now();
        let activity_id = ActivityId::generate();

        self.deadlock.check(now);

        for ft_id in self.lfum.ids() {
            let Some(entry) = self.lfum.get(&ft_id) else { continue };
            let Some(ft) = entry.read() else { continue };

            if ft.reconfiguration.is_active()
                && !ft.reconfiguration.stuck_reported
                && now.duration_since(ft.reconfiguration.phase_started_at)
                    >= self.settings.phase_timeout(ft.reconfiguration.phase)
            {
                let actions = self.lfum.schedule_and_execute(
                    &entry,
                    Box::new(StuckHealthJobItem { activity_id }),
                    self.deps.store.as_ref(),
                    self.check_context(),
                    self.settings.store_operation_timeout(),
                );
                self.dispatch_actions(actions, activity_id);
            }
        }

        let due: Vec<FailoverUnitId> = {
            let mut retries = self
                .retries
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let due: Vec<FailoverUnitId> = retries
                .iter()
                .filter(|(_, deadline)| now >= **deadline)
                .map(|(id, _)| *id)
                .collect();
            for id in &due {
                retries.remove(id);
            }
            due
        };

        for ft_id in due {
            let Some(entry) = self.lfum.get(&ft_id) else { continue };
            let actions = self.lfum.schedule_and_execute(
                &entry,
                Box::new(FmRetryJobItem),
                self.deps.store.as_ref(),
                self.check_context(),
                self.settings.store_operation_timeout(),
            );
            self.dispatch_actions(actions, activity_id);
        }

        if !self.upload.is_complete() {
            if self.replica_up_work.try_fire_retry(self.deps.clock.as_ref()) {
                self.execute_replica_up_run(activity_id);
            } else {
                self.request_replica_up(activity_id);
            }
        }
    }

    /// Requests a replica-up burst through the background work manager,
    /// which coalesces requests and paces bursts to the minimum interval.
    fn request_replica_up(&self, activity_id: ActivityId) {
        if self
            .replica_up_work
            .request(activity_id, self.deps.clock.as_ref())
        {
            self.execute_replica_up_run(activity_id);
        }
    }

    fn execute_replica_up_run(&self, activity_id: ActivityId) {
        self.run_replica_up_burst(activity_id);

        let requirement = if self.upload.is_complete() {
            RetryRequirement::NotRequired
        } else {
            RetryRequirement::Required
        };
        if self
            .replica_up_work
            .on_work_complete(requirement, self.deps.clock.as_ref())
        {
            // A request coalesced during the run; honor it now.
            self.run_replica_up_burst(activity_id);
            let _ = self
                .replica_up_work
                .on_work_complete(RetryRequirement::NotRequired, self.deps.clock.as_ref());
        }
    }

    /// Emits one bounded `ReplicaUp` burst from the upload backlog.
    pub fn run_replica_up_burst(&self, activity_id: ActivityId) {
        let (batch, is_last) = self.upload.next_batch(self.throttle);

        let mut up = Vec::new();
        let mut dropped = Vec::new();
        for ft_id in batch {
            let Some(ft) = self.failover_unit(ft_id) else { continue };
            let Some(local) = ft.local_replica.clone() else { continue };
            let info = peridot_wire::FailoverUnitInfo {
                failover_unit: ft.description(),
                replica: local,
            };
            if ft.fm_message_stage == FmMessageStage::ReplicaDropped {
                dropped.push(info);
            } else {
                up.push(info);
            }
        }

        let body = MessageBody::ReplicaUp(ReplicaListBody {
            up,
            dropped,
            is_last,
        });
        let message = Message::new(self.node, activity_id, body)
            .with_generation(self.generations.send_generation(FailoverManagerKind::Fm));
        self.deps.sender.send_to_fm(FailoverManagerKind::Fm, message);
    }

    /// Picks a jittered retry delay for the given error category.
    pub fn retry_delay(&self, category: ErrorCategory) -> Duration {
        self.retry_policy
            .randomize(category, Duration::from_millis(self.settings.max_retry_delay_ms))
    }
}

// ============================================================================
// Job items
// ============================================================================

/// Job item carrying one FM/peer message into the unit's execution cycle.
struct FtMessageJobItem {
    body: MessageBody,
    from: NodeInstance,
    node: NodeInstance,
    now: Timestamp,
}

impl JobItem<FailoverUnit> for FtMessageJobItem {
    fn checks(&self) -> JobItemCheck {
        match self.body.action() {
            MessageAction::DoReconfiguration
            | MessageAction::ChangeConfiguration
            | MessageAction::ReplicaOpen => JobItemCheck::RA_IS_OPEN,
            MessageAction::ReplicaClose | MessageAction::ReplicaDroppedReply => {
                JobItemCheck::RA_IS_OPEN_OR_CLOSING | JobItemCheck::FT_IS_NOT_NULL
            }
            _ => JobItemCheck::RA_IS_OPEN | JobItemCheck::FT_IS_NOT_NULL,
        }
    }

    fn process(
        &self,
        ft: &mut Option<FailoverUnit>,
        actions: &mut Vec<StateMachineAction>,
    ) -> JobItemOutcome {
        transitions::process_message(ft, &self.body, self.from, self.node, self.now, actions)
    }

    fn name(&self) -> &'static str {
        "FtMessage"
    }
}

/// Job item carrying a proxy reply into the unit's execution cycle.
struct ProxyReplyJobItem {
    reply: ProxyReply,
    now: Timestamp,
    thresholds: crate::state::RetryableErrorThresholds,
}

impl JobItem<FailoverUnit> for ProxyReplyJobItem {
    fn checks(&self) -> JobItemCheck {
        JobItemCheck::RA_IS_OPEN_OR_CLOSING | JobItemCheck::FT_IS_NOT_NULL
    }

    fn process(
        &self,
        ft: &mut Option<FailoverUnit>,
        actions: &mut Vec<StateMachineAction>,
    ) -> JobItemOutcome {
        let Some(ft) = ft.as_mut() else {
            return JobItemOutcome::NoOp;
        };
        transitions::process_proxy_reply(ft, &self.reply, self.now, self.thresholds, actions)
    }

    fn name(&self) -> &'static str {
        "ProxyReply"
    }
}

/// Emits the stuck-reconfiguration warning once per phase.
struct StuckHealthJobItem {
    activity_id: ActivityId,
}

impl JobItem<FailoverUnit> for StuckHealthJobItem {
    fn checks(&self) -> JobItemCheck {
        JobItemCheck::RA_IS_OPEN | JobItemCheck::FT_IS_NOT_NULL
    }

    fn process(
        &self,
        ft: &mut Option<FailoverUnit>,
        actions: &mut Vec<StateMachineAction>,
    ) -> JobItemOutcome {
        let Some(ft) = ft.as_mut() else {
            return JobItemOutcome::NoOp;
        };
        if !ft.reconfiguration.is_active() || ft.reconfiguration.stuck_reported {
            return JobItemOutcome::NoOp;
        }

        ft.reconfiguration.stuck_reported = true;
        let delinquent = ft
            .reconfiguration
            .delinquent()
            .into_iter()
            .map(|id| {
                let node = ft
                    .replica(id)
                    .map(|r| r.node.id)
                    .unwrap_or_default();
                (id, node)
            })
            .collect();

        actions.push(StateMachineAction::ReportHealth(
            HealthReport::reconfiguration_stuck(
                self.activity_id,
                ReconfigurationStuckDescriptor {
                    ft_id: ft.ft_id,
                    phase: ft.reconfiguration.phase,
                    reason: ft.reconfiguration.stuck_reason(),
                    delinquent,
                    phase_started_at: ft.reconfiguration.phase_started_at,
                },
            ),
        ));
        JobItemOutcome::InMemoryChange
    }

    fn name(&self) -> &'static str {
        "StuckHealth"
    }
}

/// Re-emits the unit's pending FM message on retry expiry.
struct FmRetryJobItem;

impl JobItem<FailoverUnit> for FmRetryJobItem {
    fn checks(&self) -> JobItemCheck {
        JobItemCheck::RA_IS_OPEN_OR_CLOSING | JobItemCheck::FT_IS_NOT_NULL
    }

    fn process(
        &self,
        ft: &mut Option<FailoverUnit>,
        actions: &mut Vec<StateMachineAction>,
    ) -> JobItemOutcome {
        let Some(ft) = ft.as_mut() else {
            return JobItemOutcome::NoOp;
        };
        transitions::emit_pending_fm_message(ft, actions);
        JobItemOutcome::NoOp
    }

    fn name(&self) -> &'static str {
        "FmRetry"
    }
}

/// Clears the upload-pending flag after the FM acknowledged `ReplicaUp`.
struct ClearUploadJobItem;

impl JobItem<FailoverUnit> for ClearUploadJobItem {
    fn checks(&self) -> JobItemCheck {
        JobItemCheck::RA_IS_OPEN | JobItemCheck::FT_IS_NOT_NULL
    }

    fn process(
        &self,
        ft: &mut Option<FailoverUnit>,
        _actions: &mut Vec<StateMachineAction>,
    ) -> JobItemOutcome {
        let Some(ft) = ft.as_mut() else {
            return JobItemOutcome::NoOp;
        };
        if !ft.upload_pending {
            return JobItemOutcome::NoOp;
        }
        ft.upload_pending = false;
        if ft.fm_message_stage == FmMessageStage::ReplicaUp
            || ft.fm_message_stage == FmMessageStage::ReplicaUpload
        {
            ft.fm_message_stage = FmMessageStage::None;
        }
        JobItemOutcome::Persist
    }

    fn name(&self) -> &'static str {
        "ClearUpload"
    }
}

// ============================================================================
// Transitions
// ============================================================================

/// Pure state transitions for one failover unit.
///
/// These functions mutate the locked snapshot and queue actions; they
/// never perform I/O.
mod transitions {
    use super::*;

    pub(super) fn process_message(
        ft: &mut Option<FailoverUnit>,
        body: &MessageBody,
        from: NodeInstance,
        node: NodeInstance,
        now: Timestamp,
        actions: &mut Vec<StateMachineAction>,
    ) -> JobItemOutcome {
        match body {
            MessageBody::DoReconfiguration(cfg) => {
                do_reconfiguration(ft, cfg, node, now, actions)
            }
            MessageBody::ChangeConfiguration(cfg) => change_configuration(ft, cfg, node),
            MessageBody::GetLsn(msg) => get_lsn(ft, msg, from, actions),
            MessageBody::GetLsnReply(reply) => get_lsn_reply(ft, reply, node, now, actions),
            MessageBody::Deactivate(cfg) => deactivate(ft, cfg, from, node, actions),
            MessageBody::DeactivateReply(reply) => {
                deactivate_reply(ft, reply, node, now, actions)
            }
            MessageBody::Activate(cfg) => activate(ft, cfg, from, node, actions),
            MessageBody::ActivateReply(reply) => activate_reply(ft, reply, actions),
            MessageBody::ReplicaOpen(msg) => replica_open(ft, msg, node, actions),
            MessageBody::ReplicaClose(msg) => replica_close(ft, msg, actions),
            MessageBody::ReplicaDroppedReply(reply) => replica_dropped_reply(ft, reply),
            MessageBody::ReplicaEndpointUpdatedReply(_) => {
                if let Some(ft) = ft.as_mut() {
                    if ft.fm_message_stage == FmMessageStage::EndpointAvailable {
                        ft.fm_message_stage = FmMessageStage::None;
                        return JobItemOutcome::Persist;
                    }
                }
                JobItemOutcome::NoOp
            }
            MessageBody::ReportFault(fault) => report_fault(ft, fault.is_permanent, actions),
            other => {
                debug!(action = ?other.action(), "unhandled failover unit message");
                JobItemOutcome::NoOp
            }
        }
    }

    fn runtime_id(ft: &FailoverUnit) -> String {
        ft.service.service_type.clone()
    }

    fn proxy_request(ft: &FailoverUnit, action: ProxyAction) -> Option<ProxyRequest> {
        let local = ft.local_replica.clone()?;
        Some(ProxyRequest::new(
            action,
            runtime_id(ft),
            ft.description(),
            local,
        ))
    }

    fn configuration_body(ft: &FailoverUnit, sequence_number: i64) -> ConfigurationBody {
        ConfigurationBody {
            failover_unit: ft.description(),
            service: Some(ft.service.clone()),
            replicas: ft.all_replicas(),
            sequence_number,
        }
    }

    // ------------------------------------------------------------------
    // Reconfiguration protocol (coordinator side)
    // ------------------------------------------------------------------

    fn do_reconfiguration(
        ft_slot: &mut Option<FailoverUnit>,
        cfg: &ConfigurationBody,
        node: NodeInstance,
        now: Timestamp,
        actions: &mut Vec<StateMachineAction>,
    ) -> JobItemOutcome {
        if ft_slot.is_none() {
            let Some(service) = cfg.service.clone() else {
                warn!("DoReconfiguration creating a unit requires a service description");
                return JobItemOutcome::NoOp;
            };
            *ft_slot = Some(FailoverUnit::new(
                cfg.failover_unit.ft_id,
                cfg.failover_unit.consistency_unit_id,
                cfg.failover_unit.current_epoch,
                service,
            ));
        }
        let Some(ft) = ft_slot.as_mut() else {
            return JobItemOutcome::NoOp;
        };

        // Idempotence gate: redelivery of a processed message only repeats
        // the completed reply, never mutates state.
        if cfg.sequence_number <= ft.message_sequence_number {
            if !ft.reconfiguration.is_active() {
                if let Some(local) = ft.local_replica.clone() {
                    actions.push(StateMachineAction::SendToFm {
                        kind: FailoverManagerKind::Fm,
                        body: MessageBody::DoReconfigurationReply(ReplicaReplyBody {
                            failover_unit: ft.description(),
                            replica: local,
                            outcome: OperationOutcome::Success,
                        }),
                    });
                }
            }
            return JobItemOutcome::NoOp;
        }

        // A new reconfiguration clears any stuck warning of the prior one.
        if ft.reconfiguration.stuck_reported {
            actions.push(StateMachineAction::ReportHealth(
                HealthReport::reconfiguration_clear(ActivityId::generate(), ft.ft_id),
            ));
        }

        ft.message_sequence_number = cfg.sequence_number;
        if cfg.failover_unit.current_epoch > ft.current_epoch {
            ft.previous_epoch = ft.current_epoch;
            ft.current_epoch = cfg.failover_unit.current_epoch;
        }
        if let Some(service) = &cfg.service {
            ft.service = service.clone();
        }
        ft.install_replica_set(node.id, cfg.replicas.clone());

        // A swap demotes the old primary before anything else.
        let old_primary = ft
            .remote_replicas
            .iter()
            .find(|r| {
                r.previous_role == ReplicaRole::Primary
                    && r.current_role != ReplicaRole::Primary
                    && r.is_up()
            })
            .cloned();

        match old_primary {
            Some(primary) => {
                ft.reconfiguration.start(
                    ReconfigurationPhase::Phase0Demote,
                    now,
                    [primary.replica_id],
                    true,
                );
                let body = configuration_body(ft, cfg.sequence_number);
                actions.push(StateMachineAction::SendToNode {
                    node: primary.node,
                    body: MessageBody::Deactivate(body),
                });
            }
            None => {
                ft.reconfiguration.start(ReconfigurationPhase::Phase0Demote, now, [], false);
                enter_phase1(ft, now, actions);
            }
        }

        JobItemOutcome::Persist
    }

    fn change_configuration(
        ft_slot: &mut Option<FailoverUnit>,
        cfg: &ConfigurationBody,
        node: NodeInstance,
    ) -> JobItemOutcome {
        let Some(ft) = ft_slot.as_mut() else {
            return JobItemOutcome::NoOp;
        };
        if cfg.failover_unit.current_epoch > ft.current_epoch {
            ft.current_epoch = cfg.failover_unit.current_epoch;
        }
        ft.install_replica_set(node.id, cfg.replicas.clone());
        JobItemOutcome::Persist
    }

    pub(super) fn enter_phase1(
        ft: &mut FailoverUnit,
        now: Timestamp,
        actions: &mut Vec<StateMachineAction>,
    ) {
        let waiting: Vec<(ReplicaId, NodeInstance, peridot_types::ReplicaDescription)> = ft
            .remote_replicas
            .iter()
            .filter(|r| r.is_up())
            .map(|r| (r.replica_id, r.node, r.clone()))
            .collect();

        if waiting.is_empty() {
            // Single-replica set: nothing to collect or catch up.
            local_activate(ft, actions);
            complete_reconfiguration(ft, actions);
            return;
        }

        ft.reconfiguration.advance(
            ReconfigurationPhase::Phase1GetLsn,
            now,
            waiting.iter().map(|(id, _, _)| *id),
        );

        for (_, node, replica) in waiting {
            actions.push(StateMachineAction::SendToNode {
                node,
                body: MessageBody::GetLsn(ReplicaMessageBody {
                    failover_unit: ft.description(),
                    replica,
                    service: None,
                }),
            });
        }
    }

    fn get_lsn_reply(
        ft_slot: &mut Option<FailoverUnit>,
        reply: &GetLsnReplyBody,
        _node: NodeInstance,
        now: Timestamp,
        actions: &mut Vec<StateMachineAction>,
    ) -> JobItemOutcome {
        let Some(ft) = ft_slot.as_mut() else {
            return JobItemOutcome::NoOp;
        };
        if ft.reconfiguration.phase != ReconfigurationPhase::Phase1GetLsn {
            return JobItemOutcome::NoOp;
        }

        if !ft
            .reconfiguration
            .record_reply(reply.replica.replica_id, reply.last_acked_lsn)
        {
            return JobItemOutcome::NoOp;
        }

        // Track the reported progress on the replica description too;
        // acked LSNs never regress within an epoch.
        if let Some(replica) = ft.replica_mut(reply.replica.replica_id) {
            match (replica.last_acked_lsn, reply.last_acked_lsn) {
                (Some(current), Some(reported)) if reported < current => {}
                (_, reported @ Some(_)) => replica.last_acked_lsn = reported,
                _ => {}
            }
        }

        // The local replica counts toward the read quorum.
        let quorum = ft.read_quorum_size();
        if ft.reconfiguration.replied_count() + 1 >= quorum {
            enter_phase2(ft, now, actions);
        }
        JobItemOutcome::Persist
    }

    fn enter_phase2(
        ft: &mut FailoverUnit,
        now: Timestamp,
        actions: &mut Vec<StateMachineAction>,
    ) {
        // The catch-up target is the most advanced progress observed in
        // Phase1; every up remote owes confirmation it reached it.
        let target = ft
            .reconfiguration
            .max_reported_lsn()
            .max(ft.local_replica.as_ref().and_then(|r| r.last_acked_lsn));
        let waiting: Vec<ReplicaId> = ft
            .remote_replicas
            .iter()
            .filter(|r| r.is_up())
            .map(|r| r.replica_id)
            .collect();

        ft.reconfiguration
            .advance(ReconfigurationPhase::Phase2Catchup, now, waiting);
        ft.reconfiguration.catchup_target = target;

        if let Some(local) = ft.local_replica.clone() {
            let request = ProxyRequest::new(
                ProxyAction::UpdateConfiguration,
                runtime_id(ft),
                ft.description(),
                local,
            )
            .with_remote_replicas(ft.remote_replicas.clone())
            .with_flags(ProxyMessageFlags::CATCHUP_QUORUM);
            actions.push(StateMachineAction::SendToProxy(request));
        }
    }

    pub(super) fn enter_phase3(
        ft: &mut FailoverUnit,
        now: Timestamp,
        actions: &mut Vec<StateMachineAction>,
    ) {
        let waiting: Vec<(ReplicaId, NodeInstance)> = ft
            .remote_replicas
            .iter()
            .filter(|r| r.is_up())
            .map(|r| (r.replica_id, r.node))
            .collect();

        if waiting.is_empty() {
            local_activate(ft, actions);
            complete_reconfiguration(ft, actions);
            return;
        }

        ft.reconfiguration.advance(
            ReconfigurationPhase::Phase3Deactivate,
            now,
            waiting.iter().map(|(id, _)| *id),
        );

        let body = configuration_body(ft, ft.message_sequence_number);
        for (_, node) in waiting {
            actions.push(StateMachineAction::SendToNode {
                node,
                body: MessageBody::Deactivate(body.clone()),
            });
        }
    }

    fn enter_phase4(
        ft: &mut FailoverUnit,
        now: Timestamp,
        actions: &mut Vec<StateMachineAction>,
    ) {
        let waiting: Vec<(ReplicaId, NodeInstance)> = ft
            .current_configuration_remotes()
            .iter()
            .filter(|r| r.is_up())
            .map(|r| (r.replica_id, r.node))
            .collect();

        local_activate(ft, actions);

        if waiting.is_empty() {
            complete_reconfiguration(ft, actions);
            return;
        }

        ft.reconfiguration.advance(
            ReconfigurationPhase::Phase4Activate,
            now,
            waiting.iter().map(|(id, _)| *id),
        );

        let body = configuration_body(ft, ft.message_sequence_number);
        for (_, node) in waiting {
            actions.push(StateMachineAction::SendToNode {
                node,
                body: MessageBody::Activate(body.clone()),
            });
        }
    }

    /// Installs the current configuration in the local proxy.
    fn local_activate(ft: &mut FailoverUnit, actions: &mut Vec<StateMachineAction>) {
        if let Some(request) = proxy_request(ft, ProxyAction::UpdateConfiguration) {
            actions.push(StateMachineAction::SendToProxy(
                request
                    .with_remote_replicas(ft.remote_replicas.clone())
                    .with_service(ft.service.clone()),
            ));
        }
    }

    pub(super) fn complete_reconfiguration(
        ft: &mut FailoverUnit,
        actions: &mut Vec<StateMachineAction>,
    ) {
        ft.previous_epoch = peridot_types::Epoch::INVALID;
        for replica in &mut ft.remote_replicas {
            replica.previous_role = replica.current_role;
        }
        if let Some(local) = &mut ft.local_replica {
            local.previous_role = local.current_role;
        }
        ft.reconfiguration.complete();

        if let Some(local) = ft.local_replica.clone() {
            actions.push(StateMachineAction::SendToFm {
                kind: FailoverManagerKind::Fm,
                body: MessageBody::DoReconfigurationReply(ReplicaReplyBody {
                    failover_unit: ft.description(),
                    replica: local,
                    outcome: OperationOutcome::Success,
                }),
            });
        }
        info!(ft_id = %ft.ft_id, epoch = %ft.current_epoch, "reconfiguration complete");
    }

    fn deactivate_reply(
        ft_slot: &mut Option<FailoverUnit>,
        reply: &ReplicaReplyBody,
        _node: NodeInstance,
        now: Timestamp,
        actions: &mut Vec<StateMachineAction>,
    ) -> JobItemOutcome {
        let Some(ft) = ft_slot.as_mut() else {
            return JobItemOutcome::NoOp;
        };

        match ft.reconfiguration.phase {
            ReconfigurationPhase::Phase0Demote => {
                if !ft.reconfiguration.record_reply(reply.replica.replica_id, None) {
                    return JobItemOutcome::NoOp;
                }
                if ft.reconfiguration.all_replied() {
                    enter_phase1(ft, now, actions);
                }
                JobItemOutcome::Persist
            }
            ReconfigurationPhase::Phase3Deactivate => {
                if !ft.reconfiguration.record_reply(reply.replica.replica_id, None) {
                    return JobItemOutcome::NoOp;
                }
                if ft.reconfiguration.replied_count() + 1 >= ft.read_quorum_size() {
                    enter_phase4(ft, now, actions);
                }
                JobItemOutcome::Persist
            }
            _ => JobItemOutcome::NoOp,
        }
    }

    fn activate_reply(
        ft_slot: &mut Option<FailoverUnit>,
        reply: &ReplicaReplyBody,
        actions: &mut Vec<StateMachineAction>,
    ) -> JobItemOutcome {
        let Some(ft) = ft_slot.as_mut() else {
            return JobItemOutcome::NoOp;
        };
        if ft.reconfiguration.phase != ReconfigurationPhase::Phase4Activate {
            return JobItemOutcome::NoOp;
        }
        if !ft.reconfiguration.record_reply(reply.replica.replica_id, None) {
            return JobItemOutcome::NoOp;
        }

        if ft.reconfiguration.replied_count() + 1 >= ft.read_quorum_size() {
            complete_reconfiguration(ft, actions);
        }
        JobItemOutcome::Persist
    }

    // ------------------------------------------------------------------
    // Reconfiguration protocol (participant side)
    // ------------------------------------------------------------------

    fn get_lsn(
        ft_slot: &mut Option<FailoverUnit>,
        _msg: &ReplicaMessageBody,
        from: NodeInstance,
        actions: &mut Vec<StateMachineAction>,
    ) -> JobItemOutcome {
        let Some(ft) = ft_slot.as_mut() else {
            return JobItemOutcome::NoOp;
        };
        let Some(local) = ft.local_replica.clone() else {
            return JobItemOutcome::NoOp;
        };

        actions.push(StateMachineAction::SendToNode {
            node: from,
            body: MessageBody::GetLsnReply(GetLsnReplyBody {
                failover_unit: ft.description(),
                replica: local.clone(),
                last_acked_lsn: local.last_acked_lsn,
                outcome: OperationOutcome::Success,
            }),
        });
        JobItemOutcome::InMemoryChange
    }

    fn deactivate(
        ft_slot: &mut Option<FailoverUnit>,
        cfg: &ConfigurationBody,
        from: NodeInstance,
        node: NodeInstance,
        actions: &mut Vec<StateMachineAction>,
    ) -> JobItemOutcome {
        let Some(ft) = ft_slot.as_mut() else {
            return JobItemOutcome::NoOp;
        };

        if cfg.failover_unit.current_epoch > ft.current_epoch {
            ft.previous_epoch = ft.current_epoch;
            ft.current_epoch = cfg.failover_unit.current_epoch;
        }
        ft.install_replica_set(node.id, cfg.replicas.clone());

        // Drive the local role transition (write status is revoked by the
        // proxy's configuration stage while this runs).
        local_activate(ft, actions);

        if let Some(local) = ft.local_replica.clone() {
            actions.push(StateMachineAction::SendToNode {
                node: from,
                body: MessageBody::DeactivateReply(ReplicaReplyBody {
                    failover_unit: ft.description(),
                    replica: local,
                    outcome: OperationOutcome::Success,
                }),
            });
        }
        JobItemOutcome::Persist
    }

    fn activate(
        ft_slot: &mut Option<FailoverUnit>,
        cfg: &ConfigurationBody,
        from: NodeInstance,
        node: NodeInstance,
        actions: &mut Vec<StateMachineAction>,
    ) -> JobItemOutcome {
        let Some(ft) = ft_slot.as_mut() else {
            return JobItemOutcome::NoOp;
        };

        if cfg.failover_unit.current_epoch > ft.current_epoch {
            ft.current_epoch = cfg.failover_unit.current_epoch;
        }
        ft.previous_epoch = peridot_types::Epoch::INVALID;
        ft.install_replica_set(node.id, cfg.replicas.clone());
        local_activate(ft, actions);

        if let Some(local) = ft.local_replica.clone() {
            actions.push(StateMachineAction::SendToNode {
                node: from,
                body: MessageBody::ActivateReply(ReplicaReplyBody {
                    failover_unit: ft.description(),
                    replica: local,
                    outcome: OperationOutcome::Success,
                }),
            });
        }
        JobItemOutcome::Persist
    }

    // ------------------------------------------------------------------
    // Replica lifecycle
    // ------------------------------------------------------------------

    fn replica_open(
        ft_slot: &mut Option<FailoverUnit>,
        msg: &ReplicaMessageBody,
        _node: NodeInstance,
        actions: &mut Vec<StateMachineAction>,
    ) -> JobItemOutcome {
        let ft = ft_slot.get_or_insert_with(|| {
            let service = msg
                .service
                .clone()
                .unwrap_or_else(|| ServiceDescription::new("unknown", "unknown"));
            FailoverUnit::new(
                msg.failover_unit.ft_id,
                msg.failover_unit.consistency_unit_id,
                msg.failover_unit.current_epoch,
                service,
            )
        });

        let mut replica = msg.replica.clone();
        replica.state = ReplicaLifecycle::InBuild;
        ft.local_replica = Some(replica);
        if let Some(service) = &msg.service {
            ft.service = service.clone();
        }

        if let Some(request) = proxy_request(ft, ProxyAction::ReplicaOpen) {
            actions.push(StateMachineAction::SendToProxy(
                request.with_service(ft.service.clone()),
            ));
        }
        JobItemOutcome::Persist
    }

    fn replica_close(
        ft_slot: &mut Option<FailoverUnit>,
        msg: &ReplicaMessageBody,
        actions: &mut Vec<StateMachineAction>,
    ) -> JobItemOutcome {
        let Some(ft) = ft_slot.as_mut() else {
            return JobItemOutcome::NoOp;
        };
        let Some(local) = ft.local_replica.as_mut() else {
            return JobItemOutcome::NoOp;
        };

        let dropping = msg.replica.state == ReplicaLifecycle::InDrop;
        local.state = if dropping {
            ReplicaLifecycle::InDrop
        } else {
            ReplicaLifecycle::StandBy
        };

        if let Some(request) = proxy_request(ft, ProxyAction::ReplicaClose) {
            let flags = ProxyMessageFlags {
                abort: false,
                drop_replica: dropping,
                catchup: false,
                catchup_all: false,
            };
            actions.push(StateMachineAction::SendToProxy(request.with_flags(flags)));
        }
        JobItemOutcome::Persist
    }

    fn replica_dropped_reply(
        ft_slot: &mut Option<FailoverUnit>,
        reply: &ReplicaReplyBody,
    ) -> JobItemOutcome {
        let Some(ft) = ft_slot.as_mut() else {
            return JobItemOutcome::NoOp;
        };
        if !reply.outcome.is_success() {
            return JobItemOutcome::NoOp;
        }

        // The FM acknowledged the drop: the record is erased.
        ft.deleted = true;
        ft.fm_message_stage = FmMessageStage::None;
        JobItemOutcome::Persist
    }

    fn report_fault(
        ft_slot: &mut Option<FailoverUnit>,
        is_permanent: bool,
        actions: &mut Vec<StateMachineAction>,
    ) -> JobItemOutcome {
        let Some(ft) = ft_slot.as_mut() else {
            return JobItemOutcome::NoOp;
        };
        let Some(local) = ft.local_replica.as_mut() else {
            return JobItemOutcome::NoOp;
        };

        if is_permanent {
            local.state = ReplicaLifecycle::InDrop;
            if let Some(request) = proxy_request(ft, ProxyAction::ReplicaClose) {
                actions.push(StateMachineAction::SendToProxy(request.with_flags(
                    ProxyMessageFlags {
                        abort: true,
                        drop_replica: true,
                        catchup: false,
                        catchup_all: false,
                    },
                )));
            }
        } else {
            local.state = ReplicaLifecycle::StandBy;
            if let Some(request) = proxy_request(ft, ProxyAction::ReplicaClose) {
                actions.push(StateMachineAction::SendToProxy(request));
            }
        }
        JobItemOutcome::Persist
    }

    // ------------------------------------------------------------------
    // Proxy replies
    // ------------------------------------------------------------------

    pub(super) fn process_proxy_reply(
        ft: &mut FailoverUnit,
        reply: &ProxyReply,
        now: Timestamp,
        thresholds: crate::state::RetryableErrorThresholds,
        actions: &mut Vec<StateMachineAction>,
    ) -> JobItemOutcome {
        match reply.action {
            ProxyAction::ReplicaOpen => {
                if reply.outcome.is_success() {
                    ft.retryable_error.on_success();
                    if let Some(local) = ft.local_replica.as_mut() {
                        local.state = ReplicaLifecycle::Ready;
                    }
                    if let Some(local) = ft.local_replica.clone() {
                        actions.push(StateMachineAction::SendToFm {
                            kind: FailoverManagerKind::Fm,
                            body: MessageBody::ReplicaOpenReply(ReplicaReplyBody {
                                failover_unit: ft.description(),
                                replica: local,
                                outcome: OperationOutcome::Success,
                            }),
                        });
                    }
                    JobItemOutcome::Persist
                } else {
                    escalate_failure(ft, thresholds, "open", actions);
                    JobItemOutcome::Persist
                }
            }
            ProxyAction::ReplicaClose => {
                if reply.outcome.is_success() {
                    ft.retryable_error.on_success();
                    let dropping = ft
                        .local_replica
                        .as_ref()
                        .is_some_and(|r| r.state == ReplicaLifecycle::InDrop);
                    if let Some(local) = ft.local_replica.as_mut() {
                        local.state = if dropping {
                            ReplicaLifecycle::Dropped
                        } else {
                            ReplicaLifecycle::StandBy
                        };
                    }
                    if dropping {
                        ft.fm_message_stage = FmMessageStage::ReplicaDropped;
                    }
                    emit_pending_fm_message(ft, actions);
                    if let Some(local) = ft.local_replica.clone() {
                        actions.push(StateMachineAction::SendToFm {
                            kind: FailoverManagerKind::Fm,
                            body: MessageBody::ReplicaCloseReply(ReplicaReplyBody {
                                failover_unit: ft.description(),
                                replica: local,
                                outcome: OperationOutcome::Success,
                            }),
                        });
                    }
                    JobItemOutcome::Persist
                } else {
                    escalate_failure(ft, thresholds, "close", actions);
                    JobItemOutcome::Persist
                }
            }
            ProxyAction::UpdateConfiguration => {
                if ft.reconfiguration.phase == ReconfigurationPhase::Phase2Catchup {
                    if reply.outcome.is_success() {
                        ft.retryable_error.on_success();
                        if let (Some(result), Some(local)) =
                            (reply.query_result, ft.local_replica.as_mut())
                        {
                            match (local.last_acked_lsn, result.last_acked_lsn) {
                                (Some(current), Some(reported)) if reported < current => {}
                                (_, reported @ Some(_)) => local.last_acked_lsn = reported,
                                _ => {}
                            }
                        }
                        enter_phase3(ft, now, actions);
                        return JobItemOutcome::Persist;
                    }

                    // Partial progress: remotes the replicator reports at or
                    // past the target have caught up; the phase exits once a
                    // catch-up quorum is reached even if the call failed.
                    let target = ft.reconfiguration.catchup_target;
                    for remote in &reply.remote_replicas {
                        if let Some(lsn) = remote.last_acked_lsn {
                            if target.is_none_or(|t| lsn >= t) {
                                ft.reconfiguration.record_reply(remote.replica_id, Some(lsn));
                            }
                        }
                    }
                    if ft.reconfiguration.replied_count() + 1 >= ft.read_quorum_size() {
                        enter_phase3(ft, now, actions);
                    } else {
                        escalate_failure(ft, thresholds, "catchup", actions);
                    }
                    JobItemOutcome::Persist
                } else {
                    JobItemOutcome::NoOp
                }
            }
            _ => JobItemOutcome::NoOp,
        }
    }

    fn escalate_failure(
        ft: &mut FailoverUnit,
        thresholds: crate::state::RetryableErrorThresholds,
        operation: &str,
        actions: &mut Vec<StateMachineAction>,
    ) {
        let activity_id = ActivityId::generate();
        match ft.retryable_error.on_failure(thresholds) {
            RetryableErrorAction::None => {}
            RetryableErrorAction::ReportWarning => {
                actions.push(StateMachineAction::ReportHealth(
                    HealthReport::replica_operation(
                        HealthReportKind::Warning,
                        ft.ft_id,
                        activity_id,
                        format!(
                            "{operation} failing, {} consecutive failures",
                            ft.retryable_error.count()
                        ),
                    ),
                ));
            }
            RetryableErrorAction::ReportError => {
                actions.push(StateMachineAction::ReportHealth(
                    HealthReport::replica_operation(
                        HealthReportKind::Error,
                        ft.ft_id,
                        activity_id,
                        format!(
                            "{operation} failing, {} consecutive failures",
                            ft.retryable_error.count()
                        ),
                    ),
                ));
            }
            RetryableErrorAction::RestartHost => {
                actions.push(StateMachineAction::TerminateHost {
                    runtime_id: runtime_id(ft),
                    reason: format!("{operation} stuck past the restart threshold"),
                });
            }
            RetryableErrorAction::Drop => {
                if let Some(local) = ft.local_replica.as_mut() {
                    local.state = ReplicaLifecycle::Dropped;
                }
                ft.fm_message_stage = FmMessageStage::ReplicaDropped;
                emit_pending_fm_message(ft, actions);
                return;
            }
        }

        // Below the drop threshold the operation retries with jitter; the
        // agent owns the delay distribution.
        actions.push(StateMachineAction::ArmRetry {
            ft_id: ft.ft_id,
            delay: Duration::from_millis(500),
        });
    }

    /// Re-emits the unit's pending FM message, if any.
    pub(super) fn emit_pending_fm_message(
        ft: &mut FailoverUnit,
        actions: &mut Vec<StateMachineAction>,
    ) {
        let Some(local) = ft.local_replica.clone() else {
            return;
        };
        match ft.fm_message_stage {
            FmMessageStage::None => {}
            FmMessageStage::ReplicaDropped => {
                actions.push(StateMachineAction::SendToFm {
                    kind: FailoverManagerKind::Fm,
                    body: MessageBody::ReplicaDropped(ReplicaMessageBody {
                        failover_unit: ft.description(),
                        replica: local,
                        service: None,
                    }),
                });
            }
            FmMessageStage::ReplicaDown
            | FmMessageStage::ReplicaUp
            | FmMessageStage::ReplicaUpload => {
                actions.push(StateMachineAction::SendToFm {
                    kind: FailoverManagerKind::Fm,
                    body: MessageBody::ReplicaUp(ReplicaListBody {
                        up: vec![peridot_wire::FailoverUnitInfo {
                            failover_unit: ft.description(),
                            replica: local,
                        }],
                        dropped: Vec::new(),
                        is_last: false,
                    }),
                });
            }
            FmMessageStage::EndpointAvailable => {
                actions.push(StateMachineAction::SendToFm {
                    kind: FailoverManagerKind::Fm,
                    body: MessageBody::ReplicaEndpointUpdated(ReplicaMessageBody {
                        failover_unit: ft.description(),
                        replica: local,
                        service: None,
                    }),
                });
            }
        }
    }

}

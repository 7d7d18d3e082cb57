//! The failover unit proxy: the in-host mirror of a failover unit.
//!
//! The proxy lives in the service host process, owns the replica and
//! replicator handles, and executes typed action lists on the agent's
//! orders. Its invariants:
//!
//! 1. at most one open of the replica
//! 2. close is monotonic: once initiated, no new action list starts
//! 3. abort is synchronous and drops all resources even if a close stalled
//! 4. epoch updates are idempotent for the same epoch value

mod action_list;
mod operations;
mod read_write_status;
mod service;

pub use action_list::{ACTION_LIST_COUNT, COMPATIBILITY, ProxyActionsList, can_run_concurrently};
pub use operations::{AdmissionError, ExecutingOperation, ExecutingOperationList};
pub use read_write_status::{
    AccessStatus, AccessStatusValue, LifeCycleState, ReconfigKind, ReconfigStage, StatusInputs,
    compute_read_write_status,
};
pub use service::{
    CatchupMode, RecordingReplica, RecordingReplicator, ReplicatorClient, StatefulServiceReplica,
};

use std::sync::{Arc, Mutex};

use peridot_types::{Epoch, FailoverUnitId, ReplicaRole, ServiceDescription};
use peridot_wire::{ProxyAction, ProxyReply, ProxyRequest};
use tracing::{debug, info, warn};

/// Lifecycle of the proxy itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyLifecycle {
    #[default]
    Closed,
    Opening,
    Opened,
    Closing,
}

/// Configuration stage the proxy is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyConfigurationStage {
    #[default]
    Current,
    CurrentPending,
    Catchup,
    CatchupPending,
    PreWriteStatusRevokeCatchup,
    PreWriteStatusRevokeCatchupPending,
}

#[derive(Debug, Default)]
struct ProxyState {
    lifecycle: ProxyLifecycle,
    configuration_stage: ProxyConfigurationStage,
    current_role: ReplicaRole,
    epoch: Epoch,

    /// Last epoch installed through `update_epoch` (idempotence gate).
    last_updated_epoch: Option<Epoch>,

    opened_once: bool,
    close_initiated: bool,
    catchup_completed: bool,

    /// Min-replica-set + write-quorum signal from the replicator
    /// configuration; resolves dynamic access cells.
    has_write_quorum: bool,

    service: Option<ServiceDescription>,
}

/// The in-host proxy for one failover unit.
pub struct FailoverUnitProxy {
    ft_id: FailoverUnitId,
    replica: Arc<dyn StatefulServiceReplica>,
    replicator: Arc<dyn ReplicatorClient>,
    ops: ExecutingOperationList,
    state: Mutex<ProxyState>,
}

impl FailoverUnitProxy {
    pub fn new(
        ft_id: FailoverUnitId,
        replica: Arc<dyn StatefulServiceReplica>,
        replicator: Arc<dyn ReplicatorClient>,
    ) -> Self {
        Self {
            ft_id,
            replica,
            replicator,
            ops: ExecutingOperationList::new(),
            state: Mutex::new(ProxyState::default()),
        }
    }

    pub fn ft_id(&self) -> FailoverUnitId {
        self.ft_id
    }

    pub fn lifecycle(&self) -> ProxyLifecycle {
        self.lock().lifecycle
    }

    pub fn configuration_stage(&self) -> ProxyConfigurationStage {
        self.lock().configuration_stage
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProxyState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Maps an IPC action to its action list.
    fn action_list_for(&self, request: &ProxyRequest) -> ProxyActionsList {
        match request.action {
            ProxyAction::ReplicaOpen => {
                if request.local_replica.current_role == ReplicaRole::Primary {
                    ProxyActionsList::StatefulServiceOpenPrimary
                } else {
                    ProxyActionsList::StatefulServiceOpenIdle
                }
            }
            ProxyAction::StatefulServiceReopen => ProxyActionsList::StatefulServiceReopen,
            ProxyAction::ReplicaClose => {
                if request.flags.abort {
                    ProxyActionsList::StatefulServiceAbort
                } else if request.flags.drop_replica {
                    ProxyActionsList::StatefulServiceDrop
                } else {
                    ProxyActionsList::StatefulServiceClose
                }
            }
            ProxyAction::UpdateConfiguration => {
                if request.flags.catchup || request.flags.catchup_all {
                    ProxyActionsList::ReplicatorUpdateAndCatchupQuorum
                } else {
                    ProxyActionsList::StatefulServiceChangeRole
                }
            }
            ProxyAction::ReplicatorBuildIdleReplica => {
                ProxyActionsList::ReplicatorBuildIdleReplica
            }
            ProxyAction::ReplicatorRemoveIdleReplica => {
                ProxyActionsList::ReplicatorRemoveIdleReplica
            }
            ProxyAction::ReplicatorGetStatus => ProxyActionsList::ReplicatorGetStatus,
            ProxyAction::ReplicatorUpdateEpochAndGetStatus => {
                ProxyActionsList::ReplicatorUpdateEpochAndGetStatus
            }
            ProxyAction::CancelCatchupReplicaSet => ProxyActionsList::CancelCatchupReplicaSet,
            ProxyAction::UpdateServiceDescription => ProxyActionsList::UpdateServiceDescription,
            ProxyAction::ReplicaEndpointUpdatedReply
            | ProxyAction::ReadWriteStatusRevokedNotificationReply
            | ProxyAction::Query => ProxyActionsList::Query,
        }
    }

    /// Executes one request and produces the reply.
    pub fn process_request(&self, request: &ProxyRequest) -> ProxyReply {
        let list = self.action_list_for(request);

        // Close is monotonic: once initiated, only abort gets in.
        {
            let state = self.lock();
            if state.close_initiated && list != ProxyActionsList::StatefulServiceAbort {
                return ProxyReply::failure(request, "proxy is closing");
            }
        }

        let instance = if list.is_multi_instance() {
            match request.remote_replicas.first() {
                Some(remote) => Some(remote.replica_id),
                None => {
                    return ProxyReply::failure(request, "missing remote replica description");
                }
            }
        } else {
            None
        };

        let op = match self.ops.try_begin(list, instance) {
            Ok(op) => op,
            Err(AdmissionError::AlreadyExecuting) => {
                return ProxyReply::failure(request, "operation already executing");
            }
            Err(AdmissionError::Incompatible(other)) => {
                return ProxyReply::failure(
                    request,
                    format!("incompatible with executing {other:?}"),
                );
            }
        };

        let reply = self.execute(list, request);
        self.ops.end(op);
        reply
    }

    fn execute(&self, list: ProxyActionsList, request: &ProxyRequest) -> ProxyReply {
        match list {
            ProxyActionsList::StatefulServiceOpenPrimary
            | ProxyActionsList::StatefulServiceOpenIdle => self.execute_open(request),
            ProxyActionsList::StatefulServiceReopen => self.execute_reopen(request),
            ProxyActionsList::StatefulServiceClose
            | ProxyActionsList::StatefulServiceDrop
            | ProxyActionsList::StatefulServiceAbort => self.execute_close(list, request),
            ProxyActionsList::StatefulServiceChangeRole => {
                self.execute_update_configuration(request)
            }
            ProxyActionsList::ReplicatorBuildIdleReplica => {
                let remote = &request.remote_replicas[0];
                match self.replicator.build_idle_replica(remote) {
                    Ok(()) => ProxyReply::success(request),
                    Err(e) => ProxyReply::failure(request, e),
                }
            }
            ProxyActionsList::ReplicatorRemoveIdleReplica => {
                let remote = &request.remote_replicas[0];
                match self.replicator.remove_idle_replica(remote.replica_id) {
                    Ok(()) => ProxyReply::success(request),
                    Err(e) => ProxyReply::failure(request, e),
                }
            }
            ProxyActionsList::ReplicatorGetStatus | ProxyActionsList::Query => {
                ProxyReply::success(request).with_query_result(self.replicator.get_status())
            }
            ProxyActionsList::ReplicatorUpdateEpochAndGetStatus => {
                self.execute_update_epoch(request)
            }
            ProxyActionsList::ReplicatorUpdateAndCatchupQuorum => self.execute_catchup(request),
            ProxyActionsList::CancelCatchupReplicaSet => {
                self.replicator.cancel_catchup();
                let mut state = self.lock();
                state.configuration_stage = ProxyConfigurationStage::Current;
                drop(state);
                ProxyReply::success(request)
            }
            ProxyActionsList::UpdateServiceDescription => {
                self.lock().service = request.service.clone();
                ProxyReply::success(request)
            }
        }
    }

    fn execute_open(&self, request: &ProxyRequest) -> ProxyReply {
        {
            let mut state = self.lock();
            if state.opened_once {
                warn!(ft_id = %self.ft_id, "rejecting second open of the replica");
                return ProxyReply::failure(request, "replica already opened");
            }
            state.lifecycle = ProxyLifecycle::Opening;
        }

        let role = request.local_replica.current_role;
        let epoch = request.failover_unit.current_epoch;

        let result = self
            .replicator
            .open()
            .and_then(|()| self.replica.open(role, epoch))
            .and_then(|()| self.replicator.change_role(role, epoch));

        let mut state = self.lock();
        match result {
            Ok(()) => {
                state.lifecycle = ProxyLifecycle::Opened;
                state.opened_once = true;
                state.current_role = role;
                state.epoch = epoch;
                state.service = request.service.clone();
                drop(state);
                info!(ft_id = %self.ft_id, %role, %epoch, "replica opened");
                ProxyReply::success(request)
            }
            Err(e) => {
                state.lifecycle = ProxyLifecycle::Closed;
                drop(state);
                ProxyReply::failure(request, e)
            }
        }
    }

    fn execute_reopen(&self, request: &ProxyRequest) -> ProxyReply {
        {
            let mut state = self.lock();
            if state.lifecycle != ProxyLifecycle::Closed {
                return ProxyReply::failure(request, "reopen requires a closed replica");
            }
            state.lifecycle = ProxyLifecycle::Opening;
        }

        let epoch = request.failover_unit.current_epoch;
        let result = self
            .replicator
            .open()
            .and_then(|()| self.replica.open(ReplicaRole::Unknown, epoch));

        let mut state = self.lock();
        match result {
            Ok(()) => {
                state.lifecycle = ProxyLifecycle::Opened;
                state.opened_once = true;
                state.current_role = ReplicaRole::Unknown;
                state.epoch = epoch;
                drop(state);
                ProxyReply::success(request)
            }
            Err(e) => {
                state.lifecycle = ProxyLifecycle::Closed;
                drop(state);
                ProxyReply::failure(request, e)
            }
        }
    }

    fn execute_close(&self, list: ProxyActionsList, request: &ProxyRequest) -> ProxyReply {
        {
            let mut state = self.lock();
            state.close_initiated = true;
            state.lifecycle = ProxyLifecycle::Closing;
        }

        let result = if list == ProxyActionsList::StatefulServiceAbort {
            // Abort is synchronous and unconditional.
            self.replicator.abort();
            self.replica.abort();
            Ok(())
        } else {
            self.replicator.close().and_then(|()| self.replica.close())
        };

        let mut state = self.lock();
        match result {
            Ok(()) => {
                state.lifecycle = ProxyLifecycle::Closed;
                state.current_role = ReplicaRole::None;
                drop(state);
                debug!(ft_id = %self.ft_id, ?list, "replica closed");
                ProxyReply::success(request)
            }
            Err(e) => {
                // A failed close leaves the proxy closing; only abort can
                // finish the teardown now.
                ProxyReply::failure(request, e)
            }
        }
    }

    fn execute_update_configuration(&self, request: &ProxyRequest) -> ProxyReply {
        let target_role = request.local_replica.current_role;
        let epoch = request.failover_unit.current_epoch;
        let (previous, current): (Vec<_>, Vec<_>) = request
            .remote_replicas
            .iter()
            .cloned()
            .partition(|r| r.is_in_previous_configuration() && !r.is_in_current_configuration());

        {
            let mut state = self.lock();
            state.configuration_stage = ProxyConfigurationStage::CurrentPending;
        }

        let mut result = self.replicator.update_configuration(&current, &previous);
        let role_changed = {
            let state = self.lock();
            state.current_role != target_role
        };
        if result.is_ok() && role_changed {
            result = self
                .replica
                .change_role(target_role)
                .and_then(|()| self.replicator.change_role(target_role, epoch));
        }

        let mut state = self.lock();
        match result {
            Ok(()) => {
                state.configuration_stage = ProxyConfigurationStage::Current;
                state.current_role = target_role;
                state.epoch = state.epoch.max(epoch);
                state.has_write_quorum = current.len() + 1
                    >= request
                        .service
                        .as_ref()
                        .map_or(1, ServiceDescription::write_quorum_size);
                drop(state);
                ProxyReply::success(request)
            }
            Err(e) => ProxyReply::failure(request, e),
        }
    }

    fn execute_update_epoch(&self, request: &ProxyRequest) -> ProxyReply {
        let epoch = request.failover_unit.current_epoch;
        let already_installed = {
            let state = self.lock();
            state.last_updated_epoch == Some(epoch)
        };

        // UpdateEpoch is idempotent for the same value.
        if !already_installed {
            if let Err(e) = self.replicator.update_epoch(epoch) {
                return ProxyReply::failure(request, e);
            }
            let mut state = self.lock();
            state.last_updated_epoch = Some(epoch);
            state.epoch = state.epoch.max(epoch);
        }

        ProxyReply::success(request).with_query_result(self.replicator.get_status())
    }

    fn execute_catchup(&self, request: &ProxyRequest) -> ProxyReply {
        {
            let mut state = self.lock();
            state.configuration_stage = ProxyConfigurationStage::Catchup;
        }

        let target_role = request.local_replica.current_role;
        let epoch = request.failover_unit.current_epoch;
        let (previous, current): (Vec<_>, Vec<_>) = request
            .remote_replicas
            .iter()
            .cloned()
            .partition(|r| r.is_in_previous_configuration() && !r.is_in_current_configuration());
        let mode = if request.flags.catchup_all {
            CatchupMode::All
        } else {
            CatchupMode::Quorum
        };

        // Catching the set up presumes the local role transition happened;
        // apply it first when the agent's order carries a new role.
        let role_changed = self.lock().current_role != target_role;
        let mut result = Ok(());
        if role_changed {
            result = self
                .replica
                .change_role(target_role)
                .and_then(|()| self.replicator.change_role(target_role, epoch));
        }

        let result = result
            .and_then(|()| self.replicator.update_configuration(&current, &previous))
            .and_then(|()| self.replicator.catchup(mode));

        let mut state = self.lock();
        match result {
            Ok(()) => {
                state.configuration_stage = ProxyConfigurationStage::Current;
                state.catchup_completed = true;
                state.current_role = target_role;
                state.epoch = state.epoch.max(epoch);
                drop(state);
                ProxyReply::success(request).with_query_result(self.replicator.get_status())
            }
            Err(e) => {
                state.configuration_stage = ProxyConfigurationStage::CatchupPending;
                drop(state);
                ProxyReply::failure(request, e)
            }
        }
    }

    /// Computes the read/write status callers currently observe.
    pub fn read_write_status(&self) -> (AccessStatus, AccessStatus) {
        let state = self.lock();

        let lifecycle = match (state.lifecycle, state.current_role) {
            (ProxyLifecycle::Opening, _) => LifeCycleState::OpeningPrimary,
            (ProxyLifecycle::Opened, ReplicaRole::Primary) => LifeCycleState::ReadyPrimary,
            _ => LifeCycleState::Other,
        };

        let reconfig = match state.configuration_stage {
            ProxyConfigurationStage::Current => None,
            ProxyConfigurationStage::CurrentPending => Some((
                ReconfigKind::NoPrimaryChange,
                ReconfigStage::TransitioningRole,
            )),
            ProxyConfigurationStage::Catchup | ProxyConfigurationStage::CatchupPending => {
                let kind = if state.current_role == ReplicaRole::Primary {
                    ReconfigKind::PromoteToPrimary
                } else {
                    ReconfigKind::IdleToActive
                };
                let stage = if state.catchup_completed {
                    ReconfigStage::CatchupCompleted
                } else {
                    ReconfigStage::CatchupInProgress
                };
                Some((kind, stage))
            }
            ProxyConfigurationStage::PreWriteStatusRevokeCatchup
            | ProxyConfigurationStage::PreWriteStatusRevokeCatchupPending => Some((
                ReconfigKind::DemoteToSecondary,
                ReconfigStage::PreWriteStatusCatchup,
            )),
        };

        compute_read_write_status(StatusInputs {
            lifecycle,
            reconfig,
            has_write_quorum: state.has_write_quorum,
        })
    }

    /// Test/diagnostic hook for the quorum signal.
    pub fn set_has_write_quorum(&self, value: bool) {
        self.lock().has_write_quorum = value;
    }
}

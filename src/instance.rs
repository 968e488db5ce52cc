use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    dispenser::{Dispenser, DispenserError, LeaseRequest, TaskStatus},
    domain::{InstanceState, ServiceInstance},
    store::{BrokerStore, StoreError},
};

pub const PROVISION_PENDING_DESCRIPTION: &str =
    "HaaS Instance not ready. Please try again in a few seconds.";
pub const PROVISION_SUCCEEDED_DESCRIPTION: &str = "HaaS Instance is ready.";
pub const PROVISION_FAILED_DESCRIPTION: &str = "HaaS Instance could not be provisioned. Sorry.";
pub const RELEASE_PENDING_DESCRIPTION: &str = "HaaS Instance release in progress.";
pub const RELEASED_DESCRIPTION: &str = "HaaS Instance released.";
pub const RELEASE_FAILED_DESCRIPTION: &str = "HaaS Instance could not be released.";

#[derive(Debug)]
pub enum LifecycleError {
    NotFound {
        instance_id: String,
    },
    Conflict {
        instance_id: String,
    },
    InvalidState {
        instance_id: String,
        state: InstanceState,
        operation: &'static str,
    },
    BindingsExist {
        instance_id: String,
    },
    Dispenser(DispenserError),
    Store(StoreError),
}

impl std::fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { instance_id } => {
                write!(f, "service instance not found: {instance_id}")
            }
            Self::Conflict { instance_id } => write!(
                f,
                "service instance already exists with different attributes: {instance_id}"
            ),
            Self::InvalidState {
                instance_id,
                state,
                operation,
            } => write!(
                f,
                "cannot {operation} while instance {instance_id} is {}",
                state.as_str()
            ),
            Self::BindingsExist { instance_id } => {
                write!(f, "service instance still has bindings: {instance_id}")
            }
            Self::Dispenser(e) => write!(f, "{e}"),
            Self::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for LifecycleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Dispenser(e) => Some(e),
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DispenserError> for LifecycleError {
    fn from(value: DispenserError) -> Self {
        Self::Dispenser(value)
    }
}

impl From<StoreError> for LifecycleError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    pub plan_id: String,
    pub organization_id: String,
    pub space_id: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    Accepted { task_id: String },
    /// An identical record already exists; the retry changes nothing.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeprovisionOutcome {
    Accepted { task_id: String },
    /// A release is already in flight; the retry changes nothing.
    Unchanged,
    /// The record held no accepted lease, so it was dropped synchronously.
    Released,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum OperationState {
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LastOperation {
    pub state: OperationState,
    pub description: String,
}

/// Pull-based instance state machine.
///
/// Mutating calls reserve the record first, then talk to the dispenser, then
/// commit via compare-and-swap. The store lock is never held across a
/// dispenser call, so a slow backend stalls only the instance it belongs to.
#[derive(Clone)]
pub struct InstanceLifecycle {
    store: Arc<Mutex<BrokerStore>>,
    dispenser: Arc<dyn Dispenser>,
}

impl InstanceLifecycle {
    pub fn new(store: Arc<Mutex<BrokerStore>>, dispenser: Arc<dyn Dispenser>) -> Self {
        Self { store, dispenser }
    }

    /// Starts provisioning. The record is reserved before the lease call goes
    /// out, which caps the dispenser at one lease per instance id no matter
    /// how many identical retries race.
    pub async fn provision(
        &self,
        instance_id: &str,
        request: ProvisionRequest,
    ) -> Result<ProvisionOutcome, LifecycleError> {
        let placeholder = ServiceInstance {
            instance_id: instance_id.to_string(),
            plan_id: request.plan_id.clone(),
            organization_id: request.organization_id.clone(),
            space_id: request.space_id.clone(),
            parameters: request.parameters.clone(),
            state: InstanceState::Provisioning,
            task_id: None,
            lease_task_id: None,
            dashboard_url: None,
            last_operation_description: PROVISION_PENDING_DESCRIPTION.to_string(),
            lease_details: None,
        };

        {
            let mut store = self.store.lock().await;
            if let Some(existing) = store.get_instance(instance_id) {
                return retry_outcome(existing, &request);
            }
            let created = store.create_instance_if_absent(placeholder.clone())?;
            debug_assert!(created);
        }

        info!(instance_id, plan_id = %request.plan_id, "requesting lease");
        let lease = LeaseRequest {
            instance_id: instance_id.to_string(),
            plan_id: request.plan_id,
            organization_id: request.organization_id,
            space_id: request.space_id,
            parameters: request.parameters,
        };
        let task_id = match self.dispenser.lease(lease).await {
            Ok(task_id) => task_id,
            Err(err) => {
                // no lease exists; drop the reservation so a retry starts clean
                let mut store = self.store.lock().await;
                store.delete_instance(instance_id)?;
                return Err(err.into());
            }
        };

        let mut record = placeholder;
        record.task_id = Some(task_id.clone());
        record.lease_task_id = Some(task_id.clone());
        {
            let mut store = self.store.lock().await;
            let swapped = store.compare_and_swap_instance_state(
                instance_id,
                InstanceState::Provisioning,
                record,
            )?;
            if !swapped {
                warn!(instance_id, task_id, "reservation changed during lease acceptance");
            }
        }
        info!(instance_id, task_id, "lease accepted");
        Ok(ProvisionOutcome::Accepted { task_id })
    }

    /// Answers a `last_operation` poll, advancing the record when the
    /// dispenser reports a terminal task status. A dispenser failure leaves
    /// the record untouched so the next poll retries cleanly.
    pub async fn last_operation(&self, instance_id: &str) -> Result<LastOperation, LifecycleError> {
        let instance = {
            let store = self.store.lock().await;
            store
                .get_instance(instance_id)
                .ok_or_else(|| not_found(instance_id))?
        };

        match (instance.state, instance.task_id.clone()) {
            (InstanceState::Succeeded | InstanceState::Failed, _) => Ok(last_operation_of(&instance)),
            // acceptance window: the lease or release call has not come back yet
            (InstanceState::Provisioning | InstanceState::Deprovisioning, None) => {
                Ok(last_operation_of(&instance))
            }
            (InstanceState::Provisioning, Some(task_id)) => {
                self.poll_provisioning(instance, task_id).await
            }
            (InstanceState::Deprovisioning, Some(task_id)) => {
                self.poll_deprovisioning(instance, task_id).await
            }
        }
    }

    async fn poll_provisioning(
        &self,
        instance: ServiceInstance,
        task_id: String,
    ) -> Result<LastOperation, LifecycleError> {
        let report = self.dispenser.task_status(task_id).await?;
        let next = match report.status {
            TaskStatus::Pending => {
                let description = report
                    .description
                    .unwrap_or_else(|| PROVISION_PENDING_DESCRIPTION.to_string());
                return Ok(LastOperation {
                    state: OperationState::InProgress,
                    description,
                });
            }
            TaskStatus::Complete => {
                let mut next = instance;
                next.state = InstanceState::Succeeded;
                next.dashboard_url = report
                    .result
                    .as_ref()
                    .and_then(|result| result.get("dashboard_url"))
                    .and_then(|url| url.as_str())
                    .map(str::to_string);
                next.lease_details = report.result;
                next.last_operation_description = report
                    .description
                    .unwrap_or_else(|| PROVISION_SUCCEEDED_DESCRIPTION.to_string());
                next
            }
            TaskStatus::Failed => {
                let mut next = instance;
                next.state = InstanceState::Failed;
                next.last_operation_description = report
                    .description
                    .unwrap_or_else(|| PROVISION_FAILED_DESCRIPTION.to_string());
                next
            }
        };
        self.commit_from(InstanceState::Provisioning, next).await
    }

    async fn poll_deprovisioning(
        &self,
        instance: ServiceInstance,
        task_id: String,
    ) -> Result<LastOperation, LifecycleError> {
        let report = self.dispenser.task_status(task_id).await?;
        match report.status {
            TaskStatus::Pending => {
                let description = report
                    .description
                    .unwrap_or_else(|| RELEASE_PENDING_DESCRIPTION.to_string());
                Ok(LastOperation {
                    state: OperationState::InProgress,
                    description,
                })
            }
            TaskStatus::Complete => {
                {
                    let mut store = self.store.lock().await;
                    store.delete_bindings_for_instance(&instance.instance_id)?;
                    store.delete_instance(&instance.instance_id)?;
                }
                info!(instance_id = %instance.instance_id, "instance released");
                Ok(LastOperation {
                    state: OperationState::Succeeded,
                    description: report
                        .description
                        .unwrap_or_else(|| RELEASED_DESCRIPTION.to_string()),
                })
            }
            TaskStatus::Failed => {
                // the release task failed; the lease is still live, so revert
                // to a terminal record that a fresh deprovision can retry
                let mut next = instance;
                next.state = InstanceState::Failed;
                next.task_id = next.lease_task_id.clone();
                next.last_operation_description = report
                    .description
                    .unwrap_or_else(|| RELEASE_FAILED_DESCRIPTION.to_string());
                self.commit_from(InstanceState::Deprovisioning, next).await
            }
        }
    }

    async fn commit_from(
        &self,
        expected: InstanceState,
        next: ServiceInstance,
    ) -> Result<LastOperation, LifecycleError> {
        let mut store = self.store.lock().await;
        let swapped =
            store.compare_and_swap_instance_state(&next.instance_id, expected, next.clone())?;
        if swapped {
            info!(
                instance_id = %next.instance_id,
                state = next.state.as_str(),
                "instance state advanced"
            );
            return Ok(last_operation_of(&next));
        }
        // another poller got there first; answer from whatever it wrote
        match store.get_instance(&next.instance_id) {
            Some(current) => Ok(last_operation_of(&current)),
            None => Err(not_found(&next.instance_id)),
        }
    }

    /// Re-enters provisioning with new parameters by taking out a fresh
    /// lease. Only settled instances may be updated; a failed one is retried
    /// through exactly this path.
    pub async fn update(
        &self,
        instance_id: &str,
        parameters: serde_json::Value,
    ) -> Result<String, LifecycleError> {
        let previous = {
            let store = self.store.lock().await;
            store
                .get_instance(instance_id)
                .ok_or_else(|| not_found(instance_id))?
        };
        if !previous.state.is_terminal() {
            return Err(invalid_state(instance_id, previous.state, "update"));
        }

        let mut reserved = previous.clone();
        reserved.state = InstanceState::Provisioning;
        reserved.task_id = None;
        reserved.parameters = parameters.clone();
        reserved.last_operation_description = PROVISION_PENDING_DESCRIPTION.to_string();
        {
            let mut store = self.store.lock().await;
            if !store.compare_and_swap_instance_state(instance_id, previous.state, reserved)? {
                return Err(match store.get_instance(instance_id) {
                    None => not_found(instance_id),
                    Some(current) => invalid_state(instance_id, current.state, "update"),
                });
            }
        }

        info!(instance_id, "requesting replacement lease");
        let lease = LeaseRequest {
            instance_id: instance_id.to_string(),
            plan_id: previous.plan_id.clone(),
            organization_id: previous.organization_id.clone(),
            space_id: previous.space_id.clone(),
            parameters: parameters.clone(),
        };
        match self.dispenser.lease(lease).await {
            Ok(task_id) => {
                let mut record = previous;
                record.state = InstanceState::Provisioning;
                record.parameters = parameters;
                record.task_id = Some(task_id.clone());
                record.lease_task_id = Some(task_id.clone());
                record.last_operation_description = PROVISION_PENDING_DESCRIPTION.to_string();
                let mut store = self.store.lock().await;
                let swapped = store.compare_and_swap_instance_state(
                    instance_id,
                    InstanceState::Provisioning,
                    record,
                )?;
                if !swapped {
                    warn!(instance_id, task_id, "reservation changed during lease acceptance");
                }
                info!(instance_id, task_id, "replacement lease accepted");
                Ok(task_id)
            }
            Err(err) => {
                // the update never started; put the prior record back
                let mut store = self.store.lock().await;
                let swapped = store.compare_and_swap_instance_state(
                    instance_id,
                    InstanceState::Provisioning,
                    previous,
                )?;
                if !swapped {
                    warn!(instance_id, "reservation changed during rollback");
                }
                Err(err.into())
            }
        }
    }

    /// Starts releasing the instance's lease. The release targets the lease
    /// task, while the returned release task takes over `last_operation`
    /// polling.
    pub async fn deprovision(&self, instance_id: &str) -> Result<DeprovisionOutcome, LifecycleError> {
        let previous = {
            let store = self.store.lock().await;
            let Some(previous) = store.get_instance(instance_id) else {
                return Err(not_found(instance_id));
            };
            match previous.state {
                InstanceState::Provisioning => {
                    return Err(invalid_state(instance_id, previous.state, "deprovision"));
                }
                InstanceState::Deprovisioning => return Ok(DeprovisionOutcome::Unchanged),
                InstanceState::Succeeded | InstanceState::Failed => {}
            }
            previous
        };

        let Some(lease_task_id) = previous.lease_task_id.clone() else {
            // terminal record without an accepted lease: nothing to release
            let mut store = self.store.lock().await;
            if store.instance_has_bindings(instance_id) {
                return Err(LifecycleError::BindingsExist {
                    instance_id: instance_id.to_string(),
                });
            }
            store.delete_instance(instance_id)?;
            return Ok(DeprovisionOutcome::Released);
        };

        let mut reserved = previous.clone();
        reserved.state = InstanceState::Deprovisioning;
        reserved.task_id = None;
        reserved.last_operation_description = RELEASE_PENDING_DESCRIPTION.to_string();
        {
            // binding check and reservation happen under one lock so a bind
            // cannot slip in between them
            let mut store = self.store.lock().await;
            if store.instance_has_bindings(instance_id) {
                return Err(LifecycleError::BindingsExist {
                    instance_id: instance_id.to_string(),
                });
            }
            if !store.compare_and_swap_instance_state(instance_id, previous.state, reserved)? {
                return match store.get_instance(instance_id) {
                    None => Err(not_found(instance_id)),
                    Some(current) if current.state == InstanceState::Deprovisioning => {
                        Ok(DeprovisionOutcome::Unchanged)
                    }
                    Some(current) => Err(invalid_state(instance_id, current.state, "deprovision")),
                };
            }
        }

        info!(instance_id, task_id = %lease_task_id, "requesting release");
        match self.dispenser.release(lease_task_id).await {
            Ok(release_task_id) => {
                let mut record = previous;
                record.state = InstanceState::Deprovisioning;
                record.task_id = Some(release_task_id.clone());
                record.last_operation_description = RELEASE_PENDING_DESCRIPTION.to_string();
                let mut store = self.store.lock().await;
                let swapped = store.compare_and_swap_instance_state(
                    instance_id,
                    InstanceState::Deprovisioning,
                    record,
                )?;
                if !swapped {
                    warn!(
                        instance_id,
                        release_task_id, "reservation changed during release acceptance"
                    );
                }
                info!(instance_id, release_task_id, "release accepted");
                Ok(DeprovisionOutcome::Accepted {
                    task_id: release_task_id,
                })
            }
            Err(err) => {
                // the release never started; put the prior record back
                let mut store = self.store.lock().await;
                let swapped = store.compare_and_swap_instance_state(
                    instance_id,
                    InstanceState::Deprovisioning,
                    previous,
                )?;
                if !swapped {
                    warn!(instance_id, "reservation changed during rollback");
                }
                Err(err.into())
            }
        }
    }
}

fn retry_outcome(
    existing: ServiceInstance,
    request: &ProvisionRequest,
) -> Result<ProvisionOutcome, LifecycleError> {
    let identical = existing.plan_id == request.plan_id
        && existing.organization_id == request.organization_id
        && existing.space_id == request.space_id
        && existing.parameters == request.parameters;
    if identical {
        Ok(ProvisionOutcome::Unchanged)
    } else {
        Err(LifecycleError::Conflict {
            instance_id: existing.instance_id,
        })
    }
}

fn last_operation_of(instance: &ServiceInstance) -> LastOperation {
    let state = match instance.state {
        InstanceState::Provisioning | InstanceState::Deprovisioning => OperationState::InProgress,
        InstanceState::Succeeded => OperationState::Succeeded,
        InstanceState::Failed => OperationState::Failed,
    };
    LastOperation {
        state,
        description: instance.last_operation_description.clone(),
    }
}

fn not_found(instance_id: &str) -> LifecycleError {
    LifecycleError::NotFound {
        instance_id: instance_id.to_string(),
    }
}

fn invalid_state(
    instance_id: &str,
    state: InstanceState,
    operation: &'static str,
) -> LifecycleError {
    LifecycleError::InvalidState {
        instance_id: instance_id.to_string(),
        state,
        operation,
    }
}

use serde::{Deserialize, Serialize};

/// Lifecycle state of a service instance.
///
/// `Provisioning` and `Deprovisioning` are driven forward by `last_operation`
/// polls. `Succeeded` and `Failed` are terminal until an update or deprovision
/// re-enters the instance into an in-flight state. A fully released instance
/// has no record at all.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Provisioning,
    Succeeded,
    Failed,
    Deprovisioning,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Deprovisioning => "deprovisioning",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceInstance {
    pub instance_id: String,
    pub plan_id: String,
    pub organization_id: String,
    pub space_id: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    pub state: InstanceState,
    /// Dispenser task answering `last_operation` polls. `None` inside the
    /// acceptance window, before the dispenser has confirmed the call.
    #[serde(default)]
    pub task_id: Option<String>,
    /// Task of the accepted lease. Release calls target this one, so it
    /// survives while a release task cycles through `task_id`.
    #[serde(default)]
    pub lease_task_id: Option<String>,
    #[serde(default)]
    pub dashboard_url: Option<String>,
    pub last_operation_description: String,
    #[serde(default)]
    pub lease_details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceBinding {
    pub binding_id: String,
    pub instance_id: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    pub credentials: serde_json::Value,
    pub created_at: String,
}

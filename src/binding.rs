use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::{
    domain::{InstanceState, ServiceBinding, ServiceInstance},
    store::{BrokerStore, StoreError},
};

#[derive(Debug)]
pub enum BindingError {
    InstanceNotFound {
        instance_id: String,
    },
    InstanceNotReady {
        instance_id: String,
        state: InstanceState,
    },
    NotFound {
        binding_id: String,
    },
    Conflict {
        binding_id: String,
    },
    Store(StoreError),
}

impl std::fmt::Display for BindingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InstanceNotFound { instance_id } => {
                write!(f, "service instance not found: {instance_id}")
            }
            Self::InstanceNotReady { instance_id, state } => write!(
                f,
                "service instance {instance_id} is {} and cannot serve bindings",
                state.as_str()
            ),
            Self::NotFound { binding_id } => write!(f, "service binding not found: {binding_id}"),
            Self::Conflict { binding_id } => write!(
                f,
                "service binding already exists with different attributes: {binding_id}"
            ),
            Self::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for BindingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for BindingError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    Created(ServiceBinding),
    /// An identical binding already exists; its stored credentials are
    /// returned unchanged.
    Unchanged(ServiceBinding),
}

#[derive(Clone)]
pub struct BindingLifecycle {
    store: Arc<Mutex<BrokerStore>>,
}

impl BindingLifecycle {
    pub fn new(store: Arc<Mutex<BrokerStore>>) -> Self {
        Self { store }
    }

    /// Creates a binding against a ready instance. Credentials are minted
    /// once at creation; an identical retry gets the stored set back.
    pub async fn bind(
        &self,
        instance_id: &str,
        binding_id: &str,
        parameters: Value,
    ) -> Result<BindOutcome, BindingError> {
        // no dispenser involved, so the whole operation sits under one lock
        let mut store = self.store.lock().await;

        let Some(instance) = store.get_instance(instance_id) else {
            return Err(BindingError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            });
        };

        if let Some(existing) = store.get_binding(binding_id) {
            if existing.instance_id == instance_id && existing.parameters == parameters {
                return Ok(BindOutcome::Unchanged(existing));
            }
            return Err(BindingError::Conflict {
                binding_id: binding_id.to_string(),
            });
        }

        if instance.state != InstanceState::Succeeded {
            return Err(BindingError::InstanceNotReady {
                instance_id: instance_id.to_string(),
                state: instance.state,
            });
        }

        let binding = ServiceBinding {
            binding_id: binding_id.to_string(),
            instance_id: instance_id.to_string(),
            parameters,
            credentials: credentials_for_instance(&instance),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        let created = store.create_binding_if_absent(binding.clone())?;
        debug_assert!(created);
        info!(instance_id, binding_id, "binding created");
        Ok(BindOutcome::Created(binding))
    }

    pub async fn unbind(&self, instance_id: &str, binding_id: &str) -> Result<(), BindingError> {
        let mut store = self.store.lock().await;
        match store.get_binding(binding_id) {
            Some(existing) if existing.instance_id == instance_id => {
                store.delete_binding(binding_id)?;
                info!(instance_id, binding_id, "binding deleted");
                Ok(())
            }
            _ => Err(BindingError::NotFound {
                binding_id: binding_id.to_string(),
            }),
        }
    }
}

/// Credential block handed to applications. Lease details reported by the
/// dispenser merge in first; broker-owned keys overwrite.
fn credentials_for_instance(instance: &ServiceInstance) -> Value {
    let mut credentials = Map::new();
    if let Some(details) = &instance.lease_details {
        match details {
            Value::Object(object) => credentials.extend(object.clone()),
            other => {
                credentials.insert("lease_details".to_string(), other.clone());
            }
        }
    }
    credentials.insert("instance_id".to_string(), json!(instance.instance_id));
    credentials.insert(
        "binding_token".to_string(),
        json!(Uuid::new_v4().to_string()),
    );
    if let Some(url) = &instance.dashboard_url {
        credentials.insert("dashboard_url".to_string(), json!(url));
    }
    Value::Object(credentials)
}

use std::{
    collections::BTreeMap,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::domain::{InstanceState, ServiceBinding, ServiceInstance};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    SerdeJson(serde_json::Error),
    SchemaVersionMismatch { expected: u32, got: u32 },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::SerdeJson(e) => write!(f, "json error: {e}"),
            Self::SchemaVersionMismatch { expected, got } => {
                write!(f, "schema_version mismatch: expected {expected}, got {got}")
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::SerdeJson(e) => Some(e),
            Self::SchemaVersionMismatch { .. } => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::SerdeJson(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedState {
    pub schema_version: u32,
    #[serde(default)]
    pub instances: BTreeMap<String, ServiceInstance>,
    #[serde(default)]
    pub bindings: BTreeMap<String, ServiceBinding>,
}

impl PersistedState {
    pub fn empty() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            instances: BTreeMap::new(),
            bindings: BTreeMap::new(),
        }
    }
}

/// Broker state as a single JSON snapshot on disk.
///
/// Every mutation rewrites the full snapshot atomically, so a crash leaves
/// either the previous or the next state on disk, never a partial one.
#[derive(Debug)]
pub struct BrokerStore {
    state_path: PathBuf,
    state: PersistedState,
}

impl BrokerStore {
    pub fn load_or_init(data_dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(data_dir)?;

        let state_path = data_dir.join("state.json");
        let (state, is_new_state) = if state_path.exists() {
            let bytes = fs::read(&state_path)?;
            let state: PersistedState = serde_json::from_slice(&bytes)?;
            if state.schema_version != SCHEMA_VERSION {
                return Err(StoreError::SchemaVersionMismatch {
                    expected: SCHEMA_VERSION,
                    got: state.schema_version,
                });
            }
            (state, false)
        } else {
            (PersistedState::empty(), true)
        };

        let store = Self { state_path, state };

        if is_new_state {
            store.save()?;
        }

        Ok(store)
    }

    pub fn state(&self) -> &PersistedState {
        &self.state
    }

    pub fn save(&self) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(&self.state)?;
        write_atomic(&self.state_path, &bytes)?;
        Ok(())
    }

    pub fn get_instance(&self, instance_id: &str) -> Option<ServiceInstance> {
        self.state.instances.get(instance_id).cloned()
    }

    /// Inserts the record unless one with the same id already exists.
    ///
    /// Returns `false` without touching disk when the id is taken. Concurrent
    /// provision attempts race through here and exactly one wins.
    pub fn create_instance_if_absent(
        &mut self,
        instance: ServiceInstance,
    ) -> Result<bool, StoreError> {
        if self.state.instances.contains_key(&instance.instance_id) {
            return Ok(false);
        }
        self.state
            .instances
            .insert(instance.instance_id.clone(), instance);
        self.save()?;
        Ok(true)
    }

    /// Replaces the record only if its current state matches `expected`.
    ///
    /// This is the sole way instance state advances. Returns `false` when the
    /// record is gone or another writer got there first; callers re-read and
    /// answer from whatever won.
    pub fn compare_and_swap_instance_state(
        &mut self,
        instance_id: &str,
        expected: InstanceState,
        next: ServiceInstance,
    ) -> Result<bool, StoreError> {
        debug_assert_eq!(instance_id, next.instance_id);
        match self.state.instances.get(instance_id) {
            Some(current) if current.state == expected => {}
            _ => return Ok(false),
        }
        self.state.instances.insert(instance_id.to_string(), next);
        self.save()?;
        Ok(true)
    }

    pub fn delete_instance(&mut self, instance_id: &str) -> Result<bool, StoreError> {
        let deleted = self.state.instances.remove(instance_id).is_some();
        if deleted {
            self.save()?;
        }
        Ok(deleted)
    }

    pub fn get_binding(&self, binding_id: &str) -> Option<ServiceBinding> {
        self.state.bindings.get(binding_id).cloned()
    }

    pub fn create_binding_if_absent(
        &mut self,
        binding: ServiceBinding,
    ) -> Result<bool, StoreError> {
        if self.state.bindings.contains_key(&binding.binding_id) {
            return Ok(false);
        }
        self.state
            .bindings
            .insert(binding.binding_id.clone(), binding);
        self.save()?;
        Ok(true)
    }

    pub fn delete_binding(&mut self, binding_id: &str) -> Result<bool, StoreError> {
        let deleted = self.state.bindings.remove(binding_id).is_some();
        if deleted {
            self.save()?;
        }
        Ok(deleted)
    }

    pub fn instance_has_bindings(&self, instance_id: &str) -> bool {
        self.state
            .bindings
            .values()
            .any(|binding| binding.instance_id == instance_id)
    }

    /// Removes every binding attached to the instance. Used when a released
    /// instance is swept from the store.
    pub fn delete_bindings_for_instance(
        &mut self,
        instance_id: &str,
    ) -> Result<usize, StoreError> {
        let before = self.state.bindings.len();
        self.state
            .bindings
            .retain(|_, binding| binding.instance_id != instance_id);
        let removed = before - self.state.bindings.len();
        if removed > 0 {
            self.save()?;
        }
        Ok(removed)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), io::Error> {
    let dir = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory")
    })?;
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp_path = dir.join(format!("{}.tmp", file_name.to_string_lossy()));
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.write_all(b"\n")?;
        let _ = file.sync_all();
    }

    #[cfg(windows)]
    {
        if path.exists() {
            let _ = fs::remove_file(path);
        }
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}

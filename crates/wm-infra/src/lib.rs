pub mod instance;
pub mod local;
pub mod logs;
pub mod names;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use instance::Instance;
use logs::LineConsumer;
use types::{InstanceKey, MachineState, Recipe};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("provisioning error: {0}")]
    Provision(String),

    #[error("invalid instance key: {0}")]
    InvalidKey(String),

    #[error("missing env var: {0}")]
    MissingEnv(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Backend that turns recipes or snapshots into running instances.
///
/// One provider serves one or more machine types; see [`ProviderRegistry`].
#[async_trait]
pub trait InstanceProvider: Send + Sync + 'static {
    /// Build and start a fresh instance from `recipe`.
    async fn create_instance(
        &self,
        recipe: &Recipe,
        state: &MachineState,
        logger: Arc<dyn LineConsumer>,
    ) -> Result<Arc<dyn Instance>>;

    /// Start an instance from a previously saved snapshot.
    async fn create_instance_from_snapshot(
        &self,
        key: &InstanceKey,
        state: &MachineState,
        logger: Arc<dyn LineConsumer>,
    ) -> Result<Arc<dyn Instance>>;

    /// Drop the backend data a snapshot key refers to.
    async fn remove_instance_snapshot(&self, key: &InstanceKey) -> Result<()>;
}

/// Machine type -> provider lookup table, built once at startup.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn InstanceProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `machine_type` with `provider`, replacing any previous one.
    pub fn register(
        mut self,
        machine_type: impl Into<String>,
        provider: Arc<dyn InstanceProvider>,
    ) -> Self {
        self.providers.insert(machine_type.into(), provider);
        self
    }

    /// Look up the provider for a machine type.
    pub fn get(&self, machine_type: &str) -> Result<&Arc<dyn InstanceProvider>> {
        self.providers.get(machine_type).ok_or_else(|| {
            Error::NotFound(format!(
                "Can't find machine provider for unsupported machine type '{machine_type}'"
            ))
        })
    }

    /// Sorted list of the machine types that have a provider.
    pub fn available(&self) -> Vec<String> {
        let mut types: Vec<String> = self.providers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Build all providers whose configuration is present in the environment.
///
/// Returns an error only if no provider could be constructed at all.
pub fn build_providers() -> Result<ProviderRegistry> {
    dotenvy::dotenv().ok();

    let mut registry = ProviderRegistry::new();

    match local::LocalProvider::from_env() {
        Ok(provider) => {
            let provider: Arc<dyn InstanceProvider> = Arc::new(provider);
            for machine_type in local::machine_types_from_env() {
                tracing::info!(machine_type, "registered local machine provider");
                registry = registry.register(machine_type, provider.clone());
            }
        }
        Err(e) => tracing::debug!("skipping local provider: {e}"),
    }

    if registry.is_empty() {
        return Err(Error::MissingEnv(
            "no machine providers configured (set LOCAL_MACHINES_DIR)".into(),
        ));
    }

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_registered_types_only() {
        let dir = tempfile::tempdir().unwrap();
        let provider: Arc<dyn InstanceProvider> =
            Arc::new(local::LocalProvider::new(dir.path()));
        let registry = ProviderRegistry::new()
            .register("local", provider.clone())
            .register("docker", provider);

        assert_eq!(registry.available(), vec!["docker", "local"]);
        assert!(Arc::ptr_eq(
            registry.get("docker").unwrap(),
            registry.get("local").unwrap()
        ));

        let err = registry.get("kvm").err().unwrap();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(err.to_string().contains("'kvm'"));
    }
}

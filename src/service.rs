use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::changes::ChangeTracker;
use crate::csdl::CsdlCache;
use crate::error::{Error, Result};
use crate::hooks::{AllowAll, EntityHooks, Policy, Principal, RequestHook};
use crate::jobs::JobManager;
use crate::metadata::{
    ComplexTypeMetadata, EntityMetadata, EntityModel, EnumTypeMetadata, OperationMetadata,
};
use crate::store::{
    EntityOverwriteProvider, GeospatialBackend, KeyGenerator, Row, SearchBackend, Store,
};
use crate::tokens::TokenSigner;

/// Server-wide limits and knobs, immutable after build.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub max_page_size: u64,
    pub max_expand_depth: u32,
    pub max_batch_size: usize,
    pub monitor_prefix: String,
    pub job_retention: Duration,
    pub max_queue_size: usize,
    pub track_changes: bool,
    /// Persist change-log records into this relation when set.
    pub change_log_table: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            max_page_size: 1000,
            max_expand_depth: 10,
            max_batch_size: 100,
            monitor_prefix: "$async".into(),
            job_retention: Duration::from_secs(600),
            max_queue_size: 8,
            track_changes: false,
            change_log_table: None,
        }
    }
}

/// Mutable service settings: read-heavy, write-rare, guarded together.
pub(crate) struct Settings {
    pub base_path: String,
    pub policy: Arc<dyn Policy>,
}

/// Invocation context for actions and functions.
pub struct OperationContext<'a> {
    pub principal: Option<&'a Principal>,
    /// The bound entity's row, for bound operations.
    pub bound_row: Option<&'a Row>,
    pub store: &'a dyn Store,
}

/// User-supplied action/function implementation.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn invoke(
        &self,
        ctx: &OperationContext<'_>,
        parameters: serde_json::Map<String, serde_json::Value>,
    ) -> Result<serde_json::Value>;
}

pub(crate) struct OperationRegistration {
    pub meta: OperationMetadata,
    pub handler: Arc<dyn OperationHandler>,
}

/// Everything request handling needs, shared behind one `Arc`.
pub(crate) struct ServiceInner {
    pub model: Arc<EntityModel>,
    pub store: Arc<dyn Store>,
    pub config: ServiceConfig,
    pub settings: RwLock<Settings>,
    pub request_hook: Option<Arc<dyn RequestHook>>,
    pub hooks: HashMap<String, Arc<dyn EntityHooks>>,
    pub operations: Vec<OperationRegistration>,
    pub search: Option<Arc<dyn SearchBackend>>,
    pub geo: Option<Arc<dyn GeospatialBackend>>,
    pub keygen: Option<Arc<dyn KeyGenerator>>,
    pub overwrite: HashMap<String, Arc<dyn EntityOverwriteProvider>>,
    pub signer: TokenSigner,
    pub tracker: ChangeTracker,
    pub csdl: CsdlCache,
    pub jobs: JobManager,
}

impl ServiceInner {
    pub fn base_path(&self) -> String {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .base_path
            .clone()
    }

    pub fn policy(&self) -> Arc<dyn Policy> {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .policy
            .clone()
    }

    pub fn hooks_for(&self, set: &str) -> Option<Arc<dyn EntityHooks>> {
        self.hooks.get(set).cloned()
    }

    /// Resolve an action/function by name, binding and parameter shape.
    pub fn resolve_operation(
        &self,
        name: &str,
        bound_to: Option<&str>,
        is_action: bool,
        supplied: &[String],
    ) -> Option<&OperationRegistration> {
        let mut candidates: Vec<&OperationRegistration> = self
            .operations
            .iter()
            .filter(|op| {
                op.meta.name == name
                    && op.meta.is_action == is_action
                    && op.meta.bound_to.as_deref() == bound_to
            })
            .collect();
        if candidates.len() > 1 {
            // Overloads resolve by matching declared parameter names.
            candidates.retain(|op| {
                supplied.len() == op.meta.parameters.len()
                    && supplied
                        .iter()
                        .all(|s| op.meta.parameters.iter().any(|(n, _)| n == s))
            });
        }
        candidates.into_iter().next()
    }
}

/// A built, sealed OData service. Cheap to clone; mount it with
/// [`Service::into_router`].
#[derive(Clone)]
pub struct Service {
    pub(crate) inner: Arc<ServiceInner>,
}

impl Service {
    pub fn builder(namespace: impl Into<String>, container: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder::new(namespace, container)
    }

    /// Swap the authorization policy at runtime.
    pub fn set_policy(&self, policy: Arc<dyn Policy>) {
        self.inner
            .settings
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .policy = policy;
    }

    pub fn set_base_path(&self, base_path: impl Into<String>) {
        self.inner
            .settings
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .base_path = normalize_base_path(base_path.into());
    }

    pub fn base_path(&self) -> String {
        self.inner.base_path()
    }
}

fn normalize_base_path(mut base: String) -> String {
    if !base.is_empty() && !base.starts_with('/') {
        base.insert(0, '/');
    }
    while base.ends_with('/') {
        base.pop();
    }
    base
}

/// Registration surface: applications declare their model and capabilities,
/// then `build` seals it.
pub struct ServiceBuilder {
    model: EntityModel,
    config: ServiceConfig,
    base_path: String,
    policy: Arc<dyn Policy>,
    request_hook: Option<Arc<dyn RequestHook>>,
    hooks: HashMap<String, Arc<dyn EntityHooks>>,
    operations: Vec<OperationRegistration>,
    search: Option<Arc<dyn SearchBackend>>,
    geo: Option<Arc<dyn GeospatialBackend>>,
    keygen: Option<Arc<dyn KeyGenerator>>,
    overwrite: HashMap<String, Arc<dyn EntityOverwriteProvider>>,
    registration_error: Option<Error>,
}

impl ServiceBuilder {
    pub fn new(namespace: impl Into<String>, container: impl Into<String>) -> Self {
        ServiceBuilder {
            model: EntityModel::new(namespace, container),
            config: ServiceConfig::default(),
            base_path: String::new(),
            policy: Arc::new(AllowAll),
            request_hook: None,
            hooks: HashMap::new(),
            operations: Vec::new(),
            search: None,
            geo: None,
            keygen: None,
            overwrite: HashMap::new(),
            registration_error: None,
        }
    }

    pub fn base_path(mut self, base: impl Into<String>) -> Self {
        self.base_path = normalize_base_path(base.into());
        self
    }

    pub fn entity_set(mut self, meta: EntityMetadata) -> Self {
        if self.registration_error.is_none() {
            if let Err(e) = self.model.register(meta) {
                self.registration_error = Some(e);
            }
        }
        self
    }

    pub fn enum_type(mut self, enum_ty: EnumTypeMetadata) -> Self {
        self.model.enums.insert(enum_ty.name.clone(), enum_ty);
        self
    }

    pub fn complex_type(mut self, complex: ComplexTypeMetadata) -> Self {
        self.model
            .complex_types
            .insert(complex.name.clone(), complex);
        self
    }

    pub fn policy(mut self, policy: Arc<dyn Policy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn request_hook(mut self, hook: Arc<dyn RequestHook>) -> Self {
        self.request_hook = Some(hook);
        self
    }

    pub fn hooks(mut self, set: impl Into<String>, hooks: Arc<dyn EntityHooks>) -> Self {
        self.hooks.insert(set.into(), hooks);
        self
    }

    pub fn operation(
        mut self,
        meta: OperationMetadata,
        handler: Arc<dyn OperationHandler>,
    ) -> Self {
        self.model.operations.push(meta.clone());
        self.operations.push(OperationRegistration { meta, handler });
        self
    }

    pub fn search_backend(mut self, backend: Arc<dyn SearchBackend>) -> Self {
        self.search = Some(backend);
        self
    }

    pub fn geospatial_backend(mut self, backend: Arc<dyn GeospatialBackend>) -> Self {
        self.geo = Some(backend);
        self
    }

    pub fn key_generator(mut self, generator: Arc<dyn KeyGenerator>) -> Self {
        self.keygen = Some(generator);
        self
    }

    pub fn overwrite_provider(
        mut self,
        set: impl Into<String>,
        provider: Arc<dyn EntityOverwriteProvider>,
    ) -> Self {
        self.overwrite.insert(set.into(), provider);
        self
    }

    pub fn track_changes(mut self, enabled: bool) -> Self {
        self.config.track_changes = enabled;
        self
    }

    pub fn change_log_table(mut self, table: impl Into<String>) -> Self {
        self.config.change_log_table = Some(table.into());
        self
    }

    pub fn max_page_size(mut self, cap: u64) -> Self {
        self.config.max_page_size = cap.max(1);
        self
    }

    pub fn max_expand_depth(mut self, depth: u32) -> Self {
        self.config.max_expand_depth = depth.max(1);
        self
    }

    pub fn max_batch_size(mut self, cap: usize) -> Self {
        self.config.max_batch_size = cap.max(1);
        self
    }

    pub fn max_queue_size(mut self, cap: usize) -> Self {
        self.config.max_queue_size = cap.max(1);
        self
    }

    pub fn job_retention(mut self, retention: Duration) -> Self {
        self.config.job_retention = retention;
        self
    }

    /// Seal the model and assemble the service. Validation failures from any
    /// registration surface here.
    pub fn build(self, store: Arc<dyn Store>) -> Result<Service> {
        if let Some(err) = self.registration_error {
            return Err(err);
        }
        for (set, _) in self.hooks.iter() {
            if self.model.set(set).is_none() {
                return Err(Error::validation(format!(
                    "hooks registered for unknown entity set {set}"
                )));
            }
        }
        for op in &self.operations {
            if let Some(bound) = &op.meta.bound_to {
                if self.model.set(bound).is_none() {
                    return Err(Error::validation(format!(
                        "operation {} is bound to unknown entity set {bound}",
                        op.meta.name
                    )));
                }
            }
        }
        self.model.seal()?;

        let jobs = JobManager::new(self.config.max_queue_size, self.config.job_retention);
        let inner = Arc::new(ServiceInner {
            model: Arc::new(self.model),
            store,
            settings: RwLock::new(Settings {
                base_path: self.base_path,
                policy: self.policy,
            }),
            request_hook: self.request_hook,
            hooks: self.hooks,
            operations: self.operations,
            search: self.search,
            geo: self.geo,
            keygen: self.keygen,
            overwrite: self.overwrite,
            signer: TokenSigner::new(),
            tracker: ChangeTracker::new(self.config.track_changes),
            csdl: CsdlCache::new(),
            jobs,
            config: self.config,
        });
        tracing::info!(
            sets = inner.model.sets().count(),
            operations = inner.operations.len(),
            "odata service sealed"
        );
        Ok(Service { inner })
    }
}

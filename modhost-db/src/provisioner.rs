//! Lazy, single-construction tenant provisioning.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use tracing::{debug, info};

use modhost_types::tenant_key;

use crate::session::DbPool;
use crate::{EntityDescriptor, PersistenceResult, SchemaSource, SessionFactory};

/// Name of the single database file inside a tenant directory.
pub const DATABASE_FILE: &str = "global.db";

/// Pool settings and location of tenant databases.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    pub database_root: PathBuf,
    pub max_size: u32,
    pub min_idle: u32,
}

impl ProvisionerConfig {
    pub fn new(database_root: impl Into<PathBuf>) -> Self {
        Self {
            database_root: database_root.into(),
            max_size: 5,
            min_idle: 1,
        }
    }
}

/// Construction counters, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProvisionerStats {
    pub pools_built: usize,
    pub factories_built: usize,
    pub active_tenants: usize,
}

/// Builds and caches one pool and one session factory per tenant key.
///
/// Both caches use an atomic compute-if-absent: concurrent first requests for
/// the same module block on the map shard while a single caller builds.
pub struct PersistenceProvisioner {
    config: ProvisionerConfig,
    pools: DashMap<String, Arc<DbPool>>,
    factories: DashMap<String, Arc<SessionFactory>>,
    pools_built: AtomicUsize,
    factories_built: AtomicUsize,
}

impl PersistenceProvisioner {
    pub fn new(config: ProvisionerConfig) -> Self {
        Self {
            config,
            pools: DashMap::new(),
            factories: DashMap::new(),
            pools_built: AtomicUsize::new(0),
            factories_built: AtomicUsize::new(0),
        }
    }

    /// Database file of `module`.
    pub fn database_path(&self, module: &str) -> PathBuf {
        self.config
            .database_root
            .join(tenant_key(module))
            .join(DATABASE_FILE)
    }

    /// The module's connection pool, built on first request.
    pub fn data_source(&self, module: &str) -> PersistenceResult<Arc<DbPool>> {
        let key = tenant_key(module);
        let entry = self
            .pools
            .entry(key)
            .or_try_insert_with(|| self.build_pool(module))?;
        Ok(Arc::clone(entry.value()))
    }

    /// The module's session factory, built on first request with `entities`
    /// registered. Later calls return the cached factory unchanged.
    pub fn session_factory(
        &self,
        module: &str,
        entities: &[EntityDescriptor],
        source: Option<&dyn SchemaSource>,
    ) -> PersistenceResult<Arc<SessionFactory>> {
        let key = tenant_key(module);
        let entry = self.factories.entry(key).or_try_insert_with(|| {
            let pool = self.data_source(module)?;
            let factory = SessionFactory::build(module, pool, entities, source)?;
            self.factories_built.fetch_add(1, Ordering::SeqCst);
            info!(module = %module, entities = entities.len(), "Built session factory");
            Ok::<_, crate::PersistenceError>(Arc::new(factory))
        })?;
        Ok(Arc::clone(entry.value()))
    }

    /// Evicts the module's factory and pool. Connections close once the last
    /// outstanding session or factory handle is dropped.
    pub fn close(&self, module: &str) {
        let key = tenant_key(module);
        let had_factory = self.factories.remove(&key).is_some();
        let had_pool = self.pools.remove(&key).is_some();
        if had_factory || had_pool {
            info!(module = %module, "Closed persistence tenant");
        }
    }

    /// Evicts every tenant.
    pub fn shutdown_all(&self) {
        let count = self.pools.len();
        self.factories.clear();
        self.pools.clear();
        info!(tenants = count, "Persistence shut down");
    }

    pub fn is_provisioned(&self, module: &str) -> bool {
        self.factories.contains_key(&tenant_key(module))
    }

    pub fn stats(&self) -> ProvisionerStats {
        ProvisionerStats {
            pools_built: self.pools_built.load(Ordering::SeqCst),
            factories_built: self.factories_built.load(Ordering::SeqCst),
            active_tenants: self.pools.len(),
        }
    }

    pub fn database_root(&self) -> &Path {
        &self.config.database_root
    }

    fn build_pool(&self, module: &str) -> PersistenceResult<Arc<DbPool>> {
        let path = self.database_path(module);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let manager = SqliteConnectionManager::file(&path)
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder()
            .max_size(self.config.max_size.max(1))
            .min_idle(Some(self.config.min_idle.min(self.config.max_size)))
            .build(manager)?;

        self.pools_built.fetch_add(1, Ordering::SeqCst);
        debug!(module = %module, path = %path.display(), "Built connection pool");
        Ok(Arc::new(pool))
    }
}

impl std::fmt::Debug for PersistenceProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceProvisioner")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

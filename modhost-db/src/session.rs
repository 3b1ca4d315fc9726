//! Schema/session factory for one tenant.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use tracing::debug;

use crate::{EntityDescriptor, PersistenceError, PersistenceResult, SchemaSource};

/// Connection pool of one tenant database.
pub type DbPool = Pool<SqliteConnectionManager>;

/// Knows a tenant's entity schemas and hands out pooled sessions.
pub struct SessionFactory {
    module: String,
    pool: Arc<DbPool>,
    entities: Vec<String>,
}

impl SessionFactory {
    /// Applies every entity's DDL in one transaction and returns the factory.
    pub(crate) fn build(
        module: &str,
        pool: Arc<DbPool>,
        entities: &[EntityDescriptor],
        source: Option<&dyn SchemaSource>,
    ) -> PersistenceResult<Self> {
        let mut conn = pool.get()?;
        let tx = conn.transaction()?;

        for entity in entities {
            let ddl = entity
                .ddl
                .clone()
                .or_else(|| source.and_then(|s| s.resolve_schema(entity)))
                .ok_or_else(|| PersistenceError::UnknownEntity {
                    module: module.to_string(),
                    entity: entity.name.clone(),
                })?;
            tx.execute_batch(&ddl).map_err(|e| PersistenceError::Schema {
                entity: entity.name.clone(),
                message: e.to_string(),
            })?;
            debug!(module = %module, entity = %entity.name, "Registered entity schema");
        }
        tx.commit()?;

        Ok(Self {
            module: module.to_string(),
            pool,
            entities: entities.iter().map(|e| e.name.clone()).collect(),
        })
    }

    /// Checks out a pooled session.
    pub fn open_session(&self) -> PersistenceResult<Session> {
        Ok(Session {
            conn: self.pool.get()?,
        })
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn entities(&self) -> &[String] {
        &self.entities
    }

    pub fn has_entity(&self, name: &str) -> bool {
        self.entities.iter().any(|e| e == name)
    }

    pub fn pool(&self) -> &Arc<DbPool> {
        &self.pool
    }
}

impl std::fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFactory")
            .field("module", &self.module)
            .field("entities", &self.entities)
            .finish()
    }
}

/// A pooled connection; returned to the pool on drop.
pub struct Session {
    conn: PooledConnection<SqliteConnectionManager>,
}

impl Session {
    /// Runs `f` inside a transaction, committing on `Ok`.
    pub fn transaction<T>(
        &mut self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> PersistenceResult<T>,
    ) -> PersistenceResult<T> {
        let tx = self.conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

impl Deref for Session {
    type Target = rusqlite::Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for Session {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

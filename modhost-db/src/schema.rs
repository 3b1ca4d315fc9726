//! Entity descriptors and schema discovery.

/// Directory inside a plugin package that holds `<entity>.sql` files.
pub const SCHEMA_DIR: &str = "schema";

/// A persistence entity a module wants provisioned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDescriptor {
    pub name: String,
    /// Inline DDL. When absent the DDL is looked up through a [`SchemaSource`].
    pub ddl: Option<String>,
}

impl EntityDescriptor {
    /// An entity whose schema ships inside the plugin package.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ddl: None,
        }
    }

    /// An entity with inline DDL, for modules compiled into the host.
    pub fn with_ddl(name: impl Into<String>, ddl: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ddl: Some(ddl.into()),
        }
    }

    /// Parses the comma-separated list a guest returns from `mx_entities`.
    pub fn parse_list(list: &str) -> Vec<Self> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Self::named)
            .collect()
    }

    /// Package entry holding this entity's DDL.
    pub fn schema_entry(&self) -> String {
        format!("{SCHEMA_DIR}/{}.sql", self.name)
    }
}

/// Resolves entity DDL from a module's own code-loading boundary.
///
/// Implemented by the host's load context so that schemas which exist only
/// inside one plugin's archives are visible while that plugin's tenant is
/// built, and to nobody else.
pub trait SchemaSource: Send + Sync {
    fn resolve_schema(&self, entity: &EntityDescriptor) -> Option<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_list_trims_and_skips_empty() {
        let list = EntityDescriptor::parse_list(" note, ,task,");
        assert_eq!(
            list,
            vec![EntityDescriptor::named("note"), EntityDescriptor::named("task")]
        );
    }

    #[test]
    fn schema_entry_path() {
        assert_eq!(EntityDescriptor::named("note").schema_entry(), "schema/note.sql");
    }
}

//! Hot-swappable schema registry using ArcSwap
//!
//! Readers (scripts, REST handlers, property descriptors) take a snapshot
//! with `load()` and never block. A schema change compiles a complete new
//! `CompiledSchema` off to the side and swaps the pointer, so a reader sees
//! either the old schema or the new one, never a mix.

use crate::config::Config;
use crate::schema::{
    compile, compile_with_repair, default_handlers, CompileEnv, CompiledSchema, MigrationHandler, SchemaError,
    SchemaModel, SchemaStorage,
};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

pub struct SchemaRegistry {
    /// Atomic pointer to the live compiled schema
    current: ArcSwap<CompiledSchema>,

    /// Persistent storage for schema versions, when configured
    storage: Option<SchemaStorage>,

    handlers: Vec<Box<dyn MigrationHandler>>,

    /// Externally registered enum types by fully-qualified name
    external_enums: RwLock<HashMap<String, Vec<String>>>,

    /// Serializes writers; readers never take it
    update: Mutex<()>,

    migration_attempts: usize,
    date_format: String,
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("types", &self.current.load().types().count())
            .field("handlers", &self.handlers.iter().map(|h| h.name()).collect::<Vec<_>>())
            .field("migration_attempts", &self.migration_attempts)
            .finish()
    }
}

impl SchemaRegistry {
    /// Registry holding only the built-in schema
    pub fn new(config: &Config) -> Result<Self, SchemaError> {
        let date_format = config.scripting.default_date_format.clone();
        let env = CompileEnv {
            date_format: Some(&date_format),
            ..CompileEnv::default()
        };
        let builtin = compile(&SchemaModel::builtin(), &env)?;

        Ok(Self {
            current: ArcSwap::new(Arc::new(builtin)),
            storage: None,
            handlers: default_handlers()?,
            external_enums: RwLock::new(HashMap::new()),
            update: Mutex::new(()),
            migration_attempts: config.schema.migration_attempts,
            date_format,
        })
    }

    pub fn with_storage(mut self, storage: SchemaStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_handler(mut self, handler: Box<dyn MigrationHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Current compiled schema (lock-free read)
    pub fn load(&self) -> Arc<CompiledSchema> {
        self.current.load_full()
    }

    /// Register (or replace) the values of an external enum type
    pub fn register_enum_type(&self, fqcn: &str, values: Vec<String>) {
        let mut enums = self
            .external_enums
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        enums.insert(fqcn.to_string(), values);
        tracing::debug!("📇 Registered enum type {}", fqcn);
    }

    /// Compile `model` against the current schema and swap it in.
    ///
    /// Built-in types missing from `model` are carried over; changing one
    /// is rejected.
    pub fn replace(&self, model: SchemaModel) -> Result<Arc<CompiledSchema>, SchemaError> {
        let _writer = self.update.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut model = model;
        for (name, builtin) in SchemaModel::builtin().types {
            match model.types.get(&name) {
                Some(existing) if existing != &builtin => return Err(SchemaError::BuiltinType(name)),
                Some(_) => {}
                None => {
                    model.types.insert(name, builtin);
                }
            }
        }

        let current = self.current.load();
        let enums = self
            .external_enums
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let env = CompileEnv {
            previous: Some(current.model()),
            external_enums: Some(&*enums),
            date_format: Some(&self.date_format),
        };

        let (_, compiled) = compile_with_repair(model, &env, &self.handlers, self.migration_attempts)?;
        let compiled = Arc::new(compiled);
        self.current.store(Arc::clone(&compiled));

        tracing::info!(
            "🔥 Hot-swapped schema: {} types, {} relationships",
            compiled.model().types.len(),
            compiled.model().relationships.len()
        );
        Ok(compiled)
    }

    /// Merge `additions` into the current model and swap in the result
    pub fn extend(&self, additions: SchemaModel) -> Result<Arc<CompiledSchema>, SchemaError> {
        let mut model = self.current.load().model().clone();
        model.merge(additions)?;
        self.replace(model)
    }

    /// Load the latest stored schema version, if any
    pub async fn init_from_storage(&self) -> anyhow::Result<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        storage
            .init_schema()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to initialize schema storage: {}", e))?;

        match storage.load_schema().await? {
            Some(model) => {
                self.replace(model)
                    .map_err(|e| anyhow::anyhow!("Stored schema does not compile: {}", e))?;
                tracing::info!("📥 Loaded schema from storage");
            }
            None => tracing::info!("📭 No stored schema, starting with the built-in schema"),
        }
        Ok(())
    }

    /// Store the current model as a new version
    pub async fn persist(&self) -> Result<Option<i64>, SchemaError> {
        let Some(storage) = &self.storage else {
            return Ok(None);
        };
        let model = self.current.load().model().clone();
        storage.save_schema(&model).await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EnumSource, PropertyKind};

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new(&Config::default()).unwrap()
    }

    #[test]
    fn test_starts_with_builtin_schema() {
        let registry = registry();
        let schema = registry.load();
        assert!(schema.type_descriptor("AbstractNode").unwrap().is_builtin);
        assert!(schema.type_descriptor("Principal").is_some());
    }

    #[test]
    fn test_readers_keep_their_snapshot_across_swaps() {
        let registry = registry();
        let before = registry.load();

        let mut model = SchemaModel::new();
        model.add_type("Project").extending("AbstractNode");
        registry.replace(model).unwrap();

        assert!(before.type_descriptor("Project").is_none());
        assert!(registry.load().type_descriptor("Project").is_some());
        assert!(registry.load().type_descriptor("AbstractNode").is_some());
    }

    #[test]
    fn test_failed_replace_keeps_current_schema() {
        let registry = registry();
        let mut model = SchemaModel::new();
        model.add_type("Broken").extending("Nowhere");

        assert!(registry.replace(model).is_err());
        assert!(registry.load().type_descriptor("Broken").is_none());
    }

    #[test]
    fn test_builtin_types_cannot_be_redefined() {
        let registry = registry();
        let mut model = SchemaModel::builtin();
        model
            .get_type_mut("Principal")
            .unwrap()
            .add_property("password", PropertyKind::String);

        assert!(matches!(registry.replace(model), Err(SchemaError::BuiltinType(ref n)) if n == "Principal"));
    }

    #[test]
    fn test_unresolved_enum_resolves_against_registered_schema() {
        let registry = registry();
        let mut first = SchemaModel::new();
        first
            .add_type("Ticket")
            .add_property("state", PropertyKind::Enum(EnumSource::values(["open", "done"])));
        registry.replace(first).unwrap();

        let mut second = SchemaModel::new();
        second
            .add_type("Ticket")
            .add_property("state", PropertyKind::Enum(EnumSource::Unresolved));
        let compiled = registry.replace(second).unwrap();
        assert_eq!(
            compiled.model().types["Ticket"].properties["state"].kind,
            PropertyKind::Enum(EnumSource::values(["open", "done"]))
        );
    }

    #[test]
    fn test_external_enums_come_from_the_registry() {
        let registry = registry();
        registry.register_enum_type("com.acme.Level", vec!["low".into(), "high".into()]);

        let mut model = SchemaModel::new();
        model
            .add_type("Ticket")
            .add_property("level", PropertyKind::Enum(EnumSource::External("com.acme.Level".into())));
        assert!(registry.replace(model).is_ok());
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let storage = SchemaStorage::new(pool);

        let registry = registry().with_storage(storage.clone());
        registry.init_from_storage().await.unwrap();
        let mut model = SchemaModel::new();
        model.add_type("Project").extending("AbstractNode");
        registry.replace(model).unwrap();
        registry.persist().await.unwrap();

        let reloaded = SchemaRegistry::new(&Config::default()).unwrap().with_storage(storage);
        reloaded.init_from_storage().await.unwrap();
        assert!(reloaded.load().type_descriptor("Project").is_some());
    }
}

//! Binary content storage
//!
//! File entities keep their bytes outside the graph. A `StorageProvider`
//! opens an output stream for a file entity; the provider is chosen by the
//! entity's `storageProvider` property, falling back to the local one.

use crate::graph::entity::Entity;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;

/// Storage backend for file entity content
pub trait StorageProvider: Send + Sync {
    /// Provider name as referenced by a file's `storageProvider` property
    fn name(&self) -> &str;

    /// Open a writer that replaces the content of `file`
    fn output_stream(&self, file: &Entity) -> io::Result<Box<dyn Write>>;
}

/// Stores content under `{root}/files/{id}`
#[derive(Debug, Clone)]
pub struct LocalStorageProvider {
    root: PathBuf,
}

impl LocalStorageProvider {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: data_dir.into().join("files"),
        }
    }

    pub fn path_for(&self, file: &Entity) -> PathBuf {
        self.root.join(&file.id)
    }
}

impl StorageProvider for LocalStorageProvider {
    fn name(&self) -> &str {
        "local"
    }

    fn output_stream(&self, file: &Entity) -> io::Result<Box<dyn Write>> {
        fs::create_dir_all(&self.root)?;
        let handle = File::create(self.path_for(file))?;
        Ok(Box::new(handle))
    }
}

/// Picks a provider for a file entity
pub struct StorageProviders {
    providers: Vec<Box<dyn StorageProvider>>,
}

impl StorageProviders {
    /// The first provider is the fallback
    pub fn new(default: Box<dyn StorageProvider>) -> Self {
        Self {
            providers: vec![default],
        }
    }

    pub fn register(&mut self, provider: Box<dyn StorageProvider>) {
        self.providers.push(provider);
    }

    pub fn provider_for(&self, file: &Entity) -> &dyn StorageProvider {
        let wanted = file
            .property("storageProvider")
            .and_then(serde_json::Value::as_str);
        let provider = wanted
            .and_then(|name| self.providers.iter().find(|p| p.name() == name))
            .unwrap_or(&self.providers[0]);
        &**provider
    }
}

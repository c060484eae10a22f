//! SQLite persistence of schema documents
//!
//! Every accepted schema is appended as a new version row holding its
//! canonical JSON document. Startup loads the latest version.

use crate::schema::{export, SchemaError, SchemaModel};
use sqlx::{sqlite::SqlitePool, Row};

/// Metadata of one stored schema version
#[derive(Debug, Clone, serde::Serialize)]
pub struct SchemaVersion {
    pub id: i64,
    pub created_at: String,
}

/// SQLite-backed schema document store
#[derive(Debug, Clone)]
pub struct SchemaStorage {
    pool: SqlitePool,
}

impl SchemaStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the versions table. Safe to call multiple times.
    pub async fn init_schema(&self) -> Result<(), SchemaError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_versions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                document JSON NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Append the model as a new version and return its id
    pub async fn save_schema(&self, model: &SchemaModel) -> Result<i64, SchemaError> {
        let document = export::to_canonical_string(model)?;

        let result = sqlx::query("INSERT INTO schema_versions (document) VALUES (?)")
            .bind(&document)
            .execute(&self.pool)
            .await?;

        let id = result.last_insert_rowid();
        tracing::debug!("💾 Stored schema version {}", id);
        Ok(id)
    }

    /// Latest stored model, if any
    pub async fn load_schema(&self) -> Result<Option<SchemaModel>, SchemaError> {
        let row = sqlx::query("SELECT document FROM schema_versions ORDER BY id DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let document: String = row.get("document");
                Ok(Some(export::from_str(&document)?))
            }
            None => Ok(None),
        }
    }

    /// All stored versions, newest first
    pub async fn list_versions(&self) -> Result<Vec<SchemaVersion>, SchemaError> {
        let rows = sqlx::query("SELECT id, CAST(created_at AS TEXT) AS created_at FROM schema_versions ORDER BY id DESC")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| SchemaVersion {
                id: row.get("id"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::PropertyKind;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_storage() -> SchemaStorage {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let storage = SchemaStorage::new(pool);
        storage.init_schema().await.unwrap();
        storage
    }

    #[tokio::test]
    async fn test_empty_storage_has_no_schema() {
        let storage = memory_storage().await;
        assert!(storage.load_schema().await.unwrap().is_none());
        assert!(storage.list_versions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_latest_version_wins() {
        let storage = memory_storage().await;

        let mut first = SchemaModel::builtin();
        first.add_type("Project").add_property("title", PropertyKind::String);
        storage.save_schema(&first).await.unwrap();

        let mut second = first.clone();
        second.add_type("Task");
        let id = storage.save_schema(&second).await.unwrap();

        let loaded = storage.load_schema().await.unwrap().unwrap();
        assert_eq!(
            export::to_canonical_string(&loaded).unwrap(),
            export::to_canonical_string(&second).unwrap()
        );
        let versions = storage.list_versions().await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].id, id);
    }
}

//! Catalog of monitored applications.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use appreview_core::{App, AppId};
use sqlx::{Row, SqlitePool};
use tracing::{info, instrument};

use crate::db::{from_millis, to_millis};

/// App catalog error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    /// Store app ids are numeric.
    #[error("app id {0} is not numeric")]
    NonNumericId(AppId),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("corrupt app row: {0}")]
    Corrupt(String),
}

#[async_trait::async_trait]
pub trait AppCatalog: Send + Sync {
    /// Every registered application, ordered by id.
    async fn list_apps(&self) -> Result<Vec<App>, CatalogError>;

    /// Register an application. Returns `false` if it was already known.
    async fn add_app(&self, app: App) -> Result<bool, CatalogError>;
}

#[async_trait::async_trait]
impl<C: AppCatalog + ?Sized> AppCatalog for Arc<C> {
    async fn list_apps(&self) -> Result<Vec<App>, CatalogError> {
        (**self).list_apps().await
    }

    async fn add_app(&self, app: App) -> Result<bool, CatalogError> {
        (**self).add_app(app).await
    }
}

fn validate(app: &App) -> Result<(), CatalogError> {
    if app.id.is_numeric() {
        Ok(())
    } else {
        Err(CatalogError::NonNumericId(app.id.clone()))
    }
}

/// Register each id, skipping ones already present. Returns how many were new.
pub async fn seed_catalog<C: AppCatalog + ?Sized>(
    catalog: &C,
    ids: &[AppId],
) -> Result<usize, CatalogError> {
    let mut added = 0;
    for id in ids {
        if catalog.add_app(App::new(id.clone())).await? {
            added += 1;
        }
    }
    info!(requested = ids.len(), added, "app catalog seeded");
    Ok(added)
}

/// SQLite-backed catalog over the `apps` table.
#[derive(Debug, Clone)]
pub struct SqliteAppCatalog {
    pool: SqlitePool,
}

impl SqliteAppCatalog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl AppCatalog for SqliteAppCatalog {
    async fn list_apps(&self) -> Result<Vec<App>, CatalogError> {
        let rows = sqlx::query("SELECT id, created_at FROM apps ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_apps", e))?;

        rows.iter()
            .map(|row| {
                let decode = |e: sqlx::Error| CatalogError::Corrupt(e.to_string());
                Ok(App {
                    id: AppId::new(row.try_get::<String, _>("id").map_err(decode)?)
                        .map_err(|e| CatalogError::Corrupt(e.to_string()))?,
                    created_at: from_millis(row.try_get("created_at").map_err(decode)?),
                })
            })
            .collect()
    }

    #[instrument(level = "debug", skip(self, app), fields(app_id = %app.id), err)]
    async fn add_app(&self, app: App) -> Result<bool, CatalogError> {
        validate(&app)?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO apps (id, created_at)
            VALUES (?1, ?2)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(app.id.as_str())
        .bind(to_millis(app.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("add_app", e))?
        .rows_affected();

        Ok(inserted > 0)
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> CatalogError {
    match err {
        sqlx::Error::Database(db_err) => {
            CatalogError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        _ => CatalogError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// In-memory catalog for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryAppCatalog {
    apps: RwLock<BTreeMap<AppId, App>>,
}

impl InMemoryAppCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait::async_trait]
impl AppCatalog for InMemoryAppCatalog {
    async fn list_apps(&self) -> Result<Vec<App>, CatalogError> {
        Ok(self
            .apps
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect())
    }

    async fn add_app(&self, app: App) -> Result<bool, CatalogError> {
        validate(&app)?;
        let mut apps = self.apps.write().unwrap_or_else(|e| e.into_inner());
        if apps.contains_key(&app.id) {
            return Ok(false);
        }
        apps.insert(app.id.clone(), app);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::temp_pool;

    fn ids(raw: &[&str]) -> Vec<AppId> {
        raw.iter().map(|s| AppId::new(*s).unwrap()).collect()
    }

    async fn exercise_catalog(catalog: &dyn AppCatalog) {
        assert!(catalog.list_apps().await.unwrap().is_empty());

        assert_eq!(seed_catalog(catalog, &ids(&["222", "111"])).await.unwrap(), 2);
        assert_eq!(seed_catalog(catalog, &ids(&["111", "333"])).await.unwrap(), 1);

        let listed: Vec<String> = catalog
            .list_apps()
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id.to_string())
            .collect();
        assert_eq!(listed, vec!["111", "222", "333"]);

        let bad = App::new(AppId::new("com.example").unwrap());
        assert_eq!(
            catalog.add_app(bad).await,
            Err(CatalogError::NonNumericId(AppId::new("com.example").unwrap()))
        );
    }

    #[tokio::test]
    async fn sqlite_catalog_semantics() {
        let (_dir, pool) = temp_pool().await;
        exercise_catalog(&SqliteAppCatalog::new(pool)).await;
    }

    #[tokio::test]
    async fn in_memory_catalog_semantics() {
        exercise_catalog(&InMemoryAppCatalog::new()).await;
    }
}

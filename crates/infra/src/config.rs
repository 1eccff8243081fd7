//! Store composition from the environment.
//!
//! `USE_PERSISTENT_STORES=true` + `DATABASE_URL` selects Postgres; anything
//! else falls back to the in-memory store (dev/test), with a warning when
//! the fallback was not what the environment asked for.

use std::sync::Arc;

use crate::store::{DispensaryStore, InMemoryDispensaryStore, PostgresDispensaryStore};

/// Build the dispensary store the environment asks for.
pub async fn store_from_env() -> anyhow::Result<Arc<dyn DispensaryStore>> {
    let use_persistent = std::env::var("USE_PERSISTENT_STORES")
        .unwrap_or_else(|_| "false".to_string())
        .parse::<bool>()
        .unwrap_or(false);

    if use_persistent {
        match std::env::var("DATABASE_URL") {
            Ok(url) => {
                let pool = sqlx::PgPool::connect(&url).await?;
                let store = PostgresDispensaryStore::new(pool);
                store.ensure_schema().await?;
                tracing::info!("using postgres dispensary store");
                return Ok(Arc::new(store));
            }
            Err(_) => {
                tracing::warn!(
                    "USE_PERSISTENT_STORES=true but DATABASE_URL not set; falling back to in-memory store"
                );
            }
        }
    }

    Ok(Arc::new(InMemoryDispensaryStore::new()))
}

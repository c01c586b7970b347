// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Opening the broker database.

use std::sync::Arc;

use keb_core::persistence::{PostgresPersistence, SqlitePersistence};
use keb_core::{FieldCipher, Persistence};
use tracing::{info, warn};

use crate::config::DatabaseConfig;
use crate::error::Result;

/// Connect to the configured database and run migrations.
pub async fn connect(config: &DatabaseConfig) -> Result<Arc<dyn Persistence>> {
    let cipher = if config.secret_key.is_empty() {
        warn!("No database secret key configured, credential columns are stored in clear");
        FieldCipher::disabled()
    } else {
        FieldCipher::new(&config.secret_key)
    };

    if let Some(path) = config.url.strip_prefix("sqlite:") {
        let path = path.trim_start_matches("//");
        let store = if path.is_empty() || path.starts_with(":memory:") {
            SqlitePersistence::in_memory(cipher).await?
        } else {
            let path = path.split('?').next().unwrap_or(path);
            SqlitePersistence::from_path(path, cipher).await?
        };
        info!(backend = "sqlite", "Connected to database");
        return Ok(Arc::new(store));
    }

    let store =
        PostgresPersistence::connect(&config.url, config.max_connections, cipher).await?;
    info!(
        backend = "postgres",
        max_connections = config.max_connections,
        "Connected to database"
    );
    Ok(Arc::new(store))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_sqlite_memory() {
        let config = DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            secret_key: "key".to_string(),
            max_connections: 1,
        };
        let store = connect(&config).await.unwrap();
        assert_eq!(store.total_instances_archived().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_connect_sqlite_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("keb.db");
        let config = DatabaseConfig {
            url: format!("sqlite:{}", path.display()),
            secret_key: String::new(),
            max_connections: 1,
        };
        let store = connect(&config).await.unwrap();
        assert!(store.get_instance("missing").await.unwrap_err().is_not_found());
        assert!(path.exists());
    }
}

//! Store backend selection and startup health checks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dtx_kernel::TransStore;

#[cfg(feature = "kernel-postgres")]
use crate::postgres_trans_store::{PostgresTransStore, DEFAULT_MAX_CONNECTIONS};
#[cfg(feature = "sqlite-persistence")]
use crate::sqlite_trans_store::{SqliteTransStore, DEFAULT_BUSY_TIMEOUT};

#[cfg(not(feature = "kernel-postgres"))]
const DEFAULT_MAX_CONNECTIONS: u32 = 5;
#[cfg(not(feature = "sqlite-persistence"))]
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const ENV_KEYS: [&str; 6] = [
    "DTX_STORE_BACKEND",
    "DTX_SQLITE_DB",
    "DTX_SQLITE_BUSY_TIMEOUT_MS",
    "DTX_POSTGRES_DSN",
    "DTX_POSTGRES_SCHEMA",
    "DTX_POSTGRES_MAX_CONNECTIONS",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Sqlite,
    Postgres,
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub sqlite_db_path: String,
    pub sqlite_busy_timeout: Duration,
    pub postgres_dsn: Option<String>,
    pub postgres_schema: String,
    pub postgres_max_connections: u32,
}

impl StoreConfig {
    pub fn from_env(default_sqlite_db_path: &str) -> Result<Self, String> {
        let mut envs = HashMap::new();
        for key in ENV_KEYS {
            if let Ok(value) = std::env::var(key) {
                envs.insert(key.to_string(), value);
            }
        }
        Self::from_env_map(default_sqlite_db_path, &envs)
    }

    pub fn from_env_map(
        default_sqlite_db_path: &str,
        envs: &HashMap<String, String>,
    ) -> Result<Self, String> {
        let backend_raw = envs
            .get("DTX_STORE_BACKEND")
            .map(|v| v.trim().to_ascii_lowercase())
            .unwrap_or_else(|| "sqlite".to_string());
        let backend = match backend_raw.as_str() {
            "sqlite" => StoreBackend::Sqlite,
            "postgres" => StoreBackend::Postgres,
            other => {
                return Err(format!(
                    "invalid DTX_STORE_BACKEND='{}'. expected one of: sqlite, postgres",
                    other
                ));
            }
        };

        let sqlite_db_path = non_empty(envs, "DTX_SQLITE_DB")
            .unwrap_or_else(|| default_sqlite_db_path.to_string());
        let sqlite_busy_timeout = match non_empty(envs, "DTX_SQLITE_BUSY_TIMEOUT_MS") {
            Some(raw) => Duration::from_millis(raw.parse::<u64>().map_err(|e| {
                format!("invalid DTX_SQLITE_BUSY_TIMEOUT_MS='{}': {}", raw, e)
            })?),
            None => DEFAULT_BUSY_TIMEOUT,
        };
        let postgres_dsn = non_empty(envs, "DTX_POSTGRES_DSN");
        let postgres_schema =
            non_empty(envs, "DTX_POSTGRES_SCHEMA").unwrap_or_else(|| "public".to_string());
        let postgres_max_connections = match non_empty(envs, "DTX_POSTGRES_MAX_CONNECTIONS") {
            Some(raw) => match raw.parse::<u32>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(format!(
                        "invalid DTX_POSTGRES_MAX_CONNECTIONS='{}'. expected a positive integer",
                        raw
                    ));
                }
            },
            None => DEFAULT_MAX_CONNECTIONS,
        };

        if matches!(backend, StoreBackend::Postgres) && postgres_dsn.is_none() {
            return Err("DTX_STORE_BACKEND=postgres requires DTX_POSTGRES_DSN".to_string());
        }

        Ok(Self {
            backend,
            sqlite_db_path,
            sqlite_busy_timeout,
            postgres_dsn,
            postgres_schema,
            postgres_max_connections,
        })
    }

    /// Opens the configured backend.
    pub fn open_store(&self) -> Result<Arc<dyn TransStore>, String> {
        match self.backend {
            StoreBackend::Sqlite => self.open_sqlite(),
            StoreBackend::Postgres => self.open_postgres(),
        }
    }

    fn open_sqlite(&self) -> Result<Arc<dyn TransStore>, String> {
        #[cfg(not(feature = "sqlite-persistence"))]
        {
            Err(
                "DTX_STORE_BACKEND=sqlite requires feature 'sqlite-persistence'. Rebuild with --features \"sqlite-persistence\"."
                    .to_string(),
            )
        }
        #[cfg(feature = "sqlite-persistence")]
        {
            let store = SqliteTransStore::open(&self.sqlite_db_path, self.sqlite_busy_timeout)
                .map_err(|e| {
                    format!(
                        "failed to open sqlite store DTX_SQLITE_DB='{}': {}",
                        self.sqlite_db_path, e
                    )
                })?;
            Ok(Arc::new(store))
        }
    }

    fn open_postgres(&self) -> Result<Arc<dyn TransStore>, String> {
        #[cfg(not(feature = "kernel-postgres"))]
        {
            Err(
                "DTX_STORE_BACKEND=postgres requires feature 'kernel-postgres'. Rebuild with --features \"kernel-postgres\"."
                    .to_string(),
            )
        }
        #[cfg(feature = "kernel-postgres")]
        {
            let dsn = self
                .postgres_dsn
                .as_deref()
                .ok_or_else(|| "postgres dsn is missing".to_string())?;
            let store = PostgresTransStore::connect_lazy(dsn, self.postgres_max_connections)
                .with_schema(self.postgres_schema.clone());
            Ok(Arc::new(store))
        }
    }

    /// Opens the store and pings it. Blocking; call before entering an async
    /// runtime.
    pub fn startup_health_check(&self) -> Result<(), String> {
        let store = self.open_store()?;
        store.ping().map_err(|e| {
            format!(
                "store backend {:?} health check failed: {}",
                self.backend, e
            )
        })?;
        log::info!(
            "store_health_check_ok backend={:?} sqlite_db={} postgres_schema={}",
            self.backend,
            self.sqlite_db_path,
            self.postgres_schema
        );
        Ok(())
    }
}

fn non_empty(envs: &HashMap<String, String>, key: &str) -> Option<String> {
    envs.get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use super::{StoreBackend, StoreConfig};

    fn temp_sqlite_path() -> PathBuf {
        std::env::temp_dir().join(format!("dtx-backend-config-{}.db", uuid::Uuid::new_v4()))
    }

    fn remove_sqlite_files(path: &Path) {
        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(path.with_extension("db-wal"));
        let _ = std::fs::remove_file(path.with_extension("db-shm"));
    }

    #[test]
    fn parse_defaults_to_sqlite_backend() {
        let envs = HashMap::new();
        let cfg = StoreConfig::from_env_map("default.db", &envs).expect("parse default config");
        assert_eq!(cfg.backend, StoreBackend::Sqlite);
        assert_eq!(cfg.sqlite_db_path, "default.db");
        assert_eq!(cfg.sqlite_busy_timeout, Duration::from_secs(5));
        assert_eq!(cfg.postgres_schema, "public");
        assert_eq!(cfg.postgres_max_connections, 5);
        assert!(cfg.postgres_dsn.is_none());
    }

    #[test]
    fn parse_invalid_backend_fails() {
        let envs = HashMap::from([("DTX_STORE_BACKEND".to_string(), "mysql".to_string())]);
        let err = StoreConfig::from_env_map("default.db", &envs)
            .expect_err("invalid backend must fail");
        assert!(err.contains("invalid DTX_STORE_BACKEND"));
    }

    #[test]
    fn parse_postgres_without_dsn_fails() {
        let envs = HashMap::from([("DTX_STORE_BACKEND".to_string(), "Postgres".to_string())]);
        let err = StoreConfig::from_env_map("default.db", &envs)
            .expect_err("missing postgres dsn must fail");
        assert!(err.contains("DTX_POSTGRES_DSN"));
    }

    #[test]
    fn parse_postgres_custom_schema_and_pool_size() {
        let envs = HashMap::from([
            ("DTX_STORE_BACKEND".to_string(), "postgres".to_string()),
            (
                "DTX_POSTGRES_DSN".to_string(),
                "postgres://localhost/dtx".to_string(),
            ),
            ("DTX_POSTGRES_SCHEMA".to_string(), "dtx_store".to_string()),
            ("DTX_POSTGRES_MAX_CONNECTIONS".to_string(), "12".to_string()),
        ]);
        let cfg = StoreConfig::from_env_map("default.db", &envs).expect("parse postgres config");
        assert_eq!(cfg.backend, StoreBackend::Postgres);
        assert_eq!(cfg.postgres_dsn.as_deref(), Some("postgres://localhost/dtx"));
        assert_eq!(cfg.postgres_schema, "dtx_store");
        assert_eq!(cfg.postgres_max_connections, 12);
    }

    #[test]
    fn parse_rejects_bad_numbers() {
        let envs = HashMap::from([("DTX_POSTGRES_MAX_CONNECTIONS".to_string(), "0".to_string())]);
        let err = StoreConfig::from_env_map("default.db", &envs).expect_err("zero pool size");
        assert!(err.contains("DTX_POSTGRES_MAX_CONNECTIONS"));

        let envs = HashMap::from([(
            "DTX_SQLITE_BUSY_TIMEOUT_MS".to_string(),
            "soon".to_string(),
        )]);
        let err = StoreConfig::from_env_map("default.db", &envs).expect_err("bad timeout");
        assert!(err.contains("DTX_SQLITE_BUSY_TIMEOUT_MS"));
    }

    #[test]
    fn parse_blank_values_fall_back_to_defaults() {
        let envs = HashMap::from([
            ("DTX_SQLITE_DB".to_string(), "   ".to_string()),
            ("DTX_SQLITE_BUSY_TIMEOUT_MS".to_string(), "250".to_string()),
        ]);
        let cfg = StoreConfig::from_env_map("default.db", &envs).expect("parse config");
        assert_eq!(cfg.sqlite_db_path, "default.db");
        assert_eq!(cfg.sqlite_busy_timeout, Duration::from_millis(250));
    }

    #[cfg(feature = "sqlite-persistence")]
    #[test]
    fn sqlite_startup_health_check_accepts_valid_path() {
        let path = temp_sqlite_path();
        let envs = HashMap::from([(
            "DTX_SQLITE_DB".to_string(),
            path.to_string_lossy().to_string(),
        )]);
        let cfg = StoreConfig::from_env_map("unused.db", &envs).expect("parse config");
        cfg.startup_health_check()
            .expect("sqlite health check should pass");
        remove_sqlite_files(&path);
    }

    #[cfg(feature = "sqlite-persistence")]
    #[test]
    fn open_store_returns_usable_sqlite_store() {
        use chrono::Utc;
        use dtx_kernel::{status, GlobalTransaction, TransStore};

        let path = temp_sqlite_path();
        let cfg = StoreConfig {
            backend: StoreBackend::Sqlite,
            sqlite_db_path: path.to_string_lossy().to_string(),
            sqlite_busy_timeout: Duration::from_secs(1),
            postgres_dsn: None,
            postgres_schema: "public".to_string(),
            postgres_max_connections: 5,
        };
        let store = cfg.open_store().expect("open store");
        store
            .may_save_new_trans(
                &GlobalTransaction::new("gid-config", "saga", status::SUBMITTED, Utc::now()),
                &[],
            )
            .expect("create");
        assert!(store.find_global("gid-config").expect("find").is_some());
        drop(store);
        remove_sqlite_files(&path);
    }

    #[cfg(not(feature = "kernel-postgres"))]
    #[test]
    fn postgres_backend_requires_feature() {
        let envs = HashMap::from([
            ("DTX_STORE_BACKEND".to_string(), "postgres".to_string()),
            (
                "DTX_POSTGRES_DSN".to_string(),
                "postgres://localhost/dtx".to_string(),
            ),
        ]);
        let cfg = StoreConfig::from_env_map("default.db", &envs).expect("parse config");
        let err = cfg
            .startup_health_check()
            .expect_err("feature is not compiled in");
        assert!(err.contains("kernel-postgres"));
    }
}

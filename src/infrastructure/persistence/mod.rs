//! Credential backends

pub mod file;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod database;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use file::{load_password_file, parse_password_file};
pub use memory::{InMemoryAuthDb, StoredAccount};
#[cfg(feature = "postgres")]
pub use postgres::PgAuthDb;

use crate::config::{AuthConfig, ConfigError, DbImplementation};
use crate::domain::credential::CredentialBackend;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Instantiate the backend selected by `db-implementation`.
pub fn backend_from_config(config: &AuthConfig) -> Result<Arc<dyn CredentialBackend>, ConfigError> {
    match config.db_implementation {
        DbImplementation::Memory => {
            info!("Using in-memory credential backend");
            Ok(Arc::new(InMemoryAuthDb::new()))
        }
        DbImplementation::File => {
            if config.datasource.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "datasource",
                    reason: "the file backend needs the path of a password file".to_string(),
                });
            }
            let db = load_password_file(Path::new(config.datasource.trim()))?;
            Ok(Arc::new(db))
        }
        #[cfg(feature = "postgres")]
        DbImplementation::Postgres => {
            let db_config = database::DatabaseConfig::from_datasource(&config.datasource);
            let pool = database::create_lazy_pool(&db_config)
                .map_err(|e| ConfigError::Backend(e.to_string()))?;
            Ok(Arc::new(PgAuthDb::new(pool)))
        }
        #[cfg(not(feature = "postgres"))]
        DbImplementation::Postgres => Err(ConfigError::Backend(
            "built without the 'postgres' feature".to_string(),
        )),
    }
}

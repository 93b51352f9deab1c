//! Environment-driven construction of the daemon's inputs.

use soulgate_config::{Options, validate_options};
use soulgate_transfers::TransferStore;
use sqlx::postgres::PgPoolOptions;

use crate::error::{AppError, AppResult};

/// Environment variable naming the Postgres connection string.
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

/// Environment variable naming the YAML options file.
pub const OPTIONS_PATH_ENV: &str = "SOULGATE_OPTIONS_PATH";

/// Load and validate the option snapshot from a YAML file.
///
/// The file format is the only parsing this crate does; everything else
/// consumes the typed [`Options`].
///
/// # Errors
///
/// Returns an error when the file cannot be read, parsed, or validated.
pub fn load_options(path: &str) -> AppResult<Options> {
    let raw = std::fs::read_to_string(path)
        .map_err(|source| AppError::options("read", anyhow::Error::new(source)))?;
    let options: Options = serde_yaml::from_str(&raw)
        .map_err(|source| AppError::options("parse", anyhow::Error::new(source)))?;
    validate_options(&options).map_err(|source| AppError::Config { source })?;
    Ok(options)
}

/// Connect to Postgres and initialise the transfer store, applying pending
/// migrations.
///
/// # Errors
///
/// Returns an error when the database is unreachable or migrations fail.
pub async fn connect_store(database_url: &str) -> AppResult<TransferStore> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(|source| AppError::persistence("connect", source))?;
    TransferStore::new(pool)
        .await
        .map_err(|source| AppError::persistence("migrate", source))
}

/// Assemble the daemon's inputs from the environment: the options file named
/// by [`OPTIONS_PATH_ENV`] and the database named by [`DATABASE_URL_ENV`].
///
/// # Errors
///
/// Returns an error when either variable is unset or its target is unusable.
pub async fn bootstrap_from_env() -> AppResult<(Options, TransferStore)> {
    let options_path = require_env(OPTIONS_PATH_ENV)?;
    let options = load_options(&options_path)?;
    let database_url = require_env(DATABASE_URL_ENV)?;
    let store = connect_store(&database_url).await?;
    Ok((options, store))
}

/// Read a required environment variable.
fn require_env(name: &'static str) -> AppResult<String> {
    std::env::var(name).map_err(|_| AppError::MissingEnv { name })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_options_round_trips_yaml() {
        let yaml = r"
instance_name: basement
connection:
  server_address: server.example.net:2242
  listen_port: 2234
global:
  upload_slots: 4
  speed_limit_kib: 512
groups:
  default:
    upload_slots: 2
    priority: 1
  leechers:
    upload_slots: 1
    priority: 99
    strategy: round_robin
";
        let dir = std::env::temp_dir();
        let path = dir.join(format!("soulgate-options-{}.yml", std::process::id()));
        std::fs::write(&path, yaml).expect("write options file");

        let options = load_options(path.to_str().expect("utf8 path")).expect("load");
        assert_eq!(options.instance_name, "basement");
        assert_eq!(options.global.upload_slots, 4);
        assert_eq!(options.groups.leechers.priority, 99);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn load_options_rejects_invalid_content() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("soulgate-bad-options-{}.yml", std::process::id()));
        std::fs::write(&path, "not: [valid").expect("write options file");
        assert!(matches!(
            load_options(path.to_str().expect("utf8 path")),
            Err(AppError::Options { .. })
        ));
        std::fs::remove_file(&path).ok();

        assert!(matches!(
            load_options("/nonexistent/soulgate.yml"),
            Err(AppError::Options { operation: "read", .. })
        ));
    }

    #[test]
    fn require_env_reports_the_name() {
        let missing = require_env("SOULGATE_SURELY_UNSET_VARIABLE");
        assert!(matches!(
            missing,
            Err(AppError::MissingEnv {
                name: "SOULGATE_SURELY_UNSET_VARIABLE"
            })
        ));
    }
}

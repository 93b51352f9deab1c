//! Disposable Postgres databases for integration suites that cannot assume
//! a container runtime.
//!
//! Resolution order: an operator-supplied server named by
//! [`EXTERNAL_DATABASE_ENV`], otherwise a throwaway server booted from local
//! Postgres binaries. Tests treat an error from [`start_postgres`] as a skip
//! signal rather than a failure.

use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::str::FromStr;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow, bail};
use postgres::NoTls;
use url::Url;

/// Environment variable naming an externally managed Postgres to test
/// against instead of booting a local server.
pub const EXTERNAL_DATABASE_ENV: &str = "SOULGATE_TEST_DATABASE_URL";

/// Environment variable overriding the directory holding the Postgres server
/// binaries (`initdb`, `postgres`, `pg_isready`).
pub const PG_BIN_ENV: &str = "SOULGATE_PG_BIN";

/// A freshly created database, dropped again when the handle goes away.
pub struct TestDatabase {
    url: String,
    admin_url: String,
    database: String,
    server: Option<LocalServer>,
}

/// A server this process booted and therefore owns.
struct LocalServer {
    process: Child,
    data_dir: PathBuf,
}

impl LocalServer {
    fn tear_down(&mut self) {
        let _ = self.process.kill();
        let _ = self.process.wait();
        let _ = fs::remove_dir_all(&self.data_dir);
    }
}

impl TestDatabase {
    /// Connection string for `sqlx` or any other Postgres client.
    #[must_use]
    pub fn connection_string(&self) -> &str {
        &self.url
    }
}

impl Drop for TestDatabase {
    fn drop(&mut self) {
        let _ = run_admin_statement(
            &self.admin_url,
            &format!("DROP DATABASE IF EXISTS \"{}\"", self.database),
        );
        if let Some(server) = &mut self.server {
            server.tear_down();
        }
    }
}

/// Provision a disposable database, preferring [`EXTERNAL_DATABASE_ENV`].
///
/// # Errors
///
/// Returns an error when no external server is configured and local
/// Postgres binaries are unavailable or fail to boot.
pub fn start_postgres() -> Result<TestDatabase> {
    if let Ok(base_url) = std::env::var(EXTERNAL_DATABASE_ENV) {
        return create_database(&base_url, None);
    }
    let (server, base_url) = boot_local_server()?;
    create_database(&base_url, Some(server))
}

fn create_database(base_url: &str, server: Option<LocalServer>) -> Result<TestDatabase> {
    let base = Url::parse(base_url).context("invalid postgres connection url")?;
    let database = format!("soulgate_test_{}_{}", std::process::id(), nanos_now());
    let mut url = base.clone();
    url.set_path(&format!("/{database}"));

    // Administer through the maintenance database when possible, falling
    // back to whatever database the base URL names.
    let mut admin = base.clone();
    admin.set_path("/postgres");
    let statement = format!("CREATE DATABASE \"{database}\"");
    let admin_url = if run_admin_statement(admin.as_str(), &statement).is_ok() {
        admin.to_string()
    } else if run_admin_statement(base.as_str(), &statement).is_ok() {
        base.to_string()
    } else {
        if let Some(mut server) = server {
            server.tear_down();
        }
        bail!("failed to create database {database}");
    };

    Ok(TestDatabase {
        url: url.to_string(),
        admin_url,
        database,
        server,
    })
}

fn boot_local_server() -> Result<(LocalServer, String)> {
    let bin = binary_dir()?;
    let data_dir = scratch_data_dir()?;
    let data_dir_arg = data_dir
        .to_str()
        .context("data dir is not valid UTF-8")?
        .to_string();

    let initdb = Command::new(bin.join("initdb"))
        .args(["-D", &data_dir_arg, "--username=postgres", "--auth=trust"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .context("failed to run initdb")?;
    if !initdb.success() {
        let _ = fs::remove_dir_all(&data_dir);
        bail!("initdb exited with failure status");
    }

    let port = free_port()?;
    let process = Command::new(bin.join("postgres"))
        .args(["-D", &data_dir_arg, "-h", "127.0.0.1", "-p", &port.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to start postgres")?;
    let mut server = LocalServer { process, data_dir };

    if let Err(error) = await_ready(&bin, port) {
        server.tear_down();
        return Err(error);
    }

    Ok((server, format!("postgres://postgres@127.0.0.1:{port}/postgres")))
}

fn binary_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(PG_BIN_ENV) {
        let dir = PathBuf::from(dir);
        if dir.join("initdb").exists() {
            return Ok(dir);
        }
        bail!("{PG_BIN_ENV} does not point at a directory containing initdb");
    }

    let path = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&path)
        .find(|dir| dir.join("initdb").exists() && dir.join("postgres").exists())
        .ok_or_else(|| anyhow!("no Postgres server binaries on PATH; set {PG_BIN_ENV}"))
}

fn await_ready(bin: &Path, port: u16) -> Result<()> {
    for _ in 0..50 {
        let probe = Command::new(bin.join("pg_isready"))
            .args(["-h", "127.0.0.1", "-p", &port.to_string(), "-U", "postgres"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if matches!(probe, Ok(status) if status.success()) {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(100));
    }
    bail!("postgres did not become ready in time")
}

fn free_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").context("failed to reserve a port")?;
    Ok(listener
        .local_addr()
        .context("failed to read listener address")?
        .port())
}

fn scratch_data_dir() -> Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!("soulgate-pg-{}-{}", std::process::id(), nanos_now()));
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create data dir {}", dir.display()))?;
    Ok(dir)
}

/// Run one SQL statement as the admin user.
///
/// The sync `postgres` client drives its own runtime internally, so the
/// statement hops onto a plain thread to stay callable from inside tokio
/// tests (including `Drop` during test teardown).
fn run_admin_statement(url: &str, statement: &str) -> Result<()> {
    let url = url.to_string();
    let statement = statement.to_string();
    thread::spawn(move || -> Result<()> {
        let mut client = postgres::Config::from_str(&url)?
            .connect(NoTls)
            .context("failed to connect for admin statement")?;
        client
            .simple_query(&statement)
            .map(|_| ())
            .context("admin statement failed")
    })
    .join()
    .unwrap_or_else(|_| Err(anyhow!("admin statement thread panicked")))
}

fn nanos_now() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

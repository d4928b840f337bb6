use std::cmp::Ordering;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, info, warn};

use shared::config::server::DatabaseConfig;

/// Script folders applied in order; each must exist even when empty.
const STAGES: &[&str] = &["schema", "procedures", "indexes", "seed"];

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("database bootstrap directory does not exist: {0}")]
    MissingRoot(PathBuf),
    #[error("database bootstrap stage '{stage}' missing at {path}")]
    MissingStage { stage: &'static str, path: PathBuf },
    #[error("failed to read directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("database error executing {path}: {source}")]
    Sql {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },
}

/// Lists every script the bootstrap would apply, in execution order.
///
/// # Errors
/// Returns [`BootstrapError`] when the root or a stage folder is missing or unreadable.
pub fn plan(root: &Path) -> Result<Vec<(&'static str, PathBuf)>, BootstrapError> {
    if !root.exists() {
        return Err(BootstrapError::MissingRoot(root.to_path_buf()));
    }

    let mut scripts = Vec::new();
    for &stage in STAGES {
        let stage_path = root.join(stage);
        if !stage_path.exists() {
            return Err(BootstrapError::MissingStage {
                stage,
                path: stage_path,
            });
        }
        let files = collect_sql_files(&stage_path)?;
        if files.is_empty() {
            debug!(stage, "no bootstrap scripts found for stage");
        }
        scripts.extend(files.into_iter().map(|path| (stage, path)));
    }
    Ok(scripts)
}

/// Applies every bootstrap script, one transaction per script. Returns the number applied.
///
/// # Errors
/// Returns [`BootstrapError`] on the first missing folder, unreadable file or failing script.
pub async fn run(pool: &PgPool, config: &DatabaseConfig) -> Result<usize, BootstrapError> {
    let scripts = plan(&config.bootstrap_path)?;
    info!(
        path = %config.bootstrap_path.display(),
        scripts = scripts.len(),
        "running database bootstrap"
    );

    let mut applied = 0;
    for (stage, path) in scripts {
        if apply_script(pool, stage, &path).await? {
            applied += 1;
        }
    }
    Ok(applied)
}

/// Simple liveness check used during startup.
///
/// # Errors
/// Returns the driver error when the database cannot be reached.
pub async fn ensure_liveness(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await.map(|_| ())
}

#[cfg(test)]
static READINESS_OVERRIDE: std::sync::Mutex<Option<Result<(), String>>> =
    std::sync::Mutex::new(None);

/// Forces the readiness check outcome in tests that have no database.
#[cfg(test)]
pub(crate) fn set_readiness_override(outcome: Option<Result<(), String>>) {
    if let Ok(mut guard) = READINESS_OVERRIDE.lock() {
        *guard = outcome;
    }
}

/// Readiness check that expects the health procedure to be installed.
///
/// # Errors
/// Returns the driver error when the procedure is missing or the call fails.
pub async fn ensure_readiness(pool: &PgPool) -> Result<(), sqlx::Error> {
    #[cfg(test)]
    {
        let forced = READINESS_OVERRIDE.lock().ok().and_then(|guard| guard.clone());
        if let Some(outcome) = forced {
            return outcome.map_err(sqlx::Error::Protocol);
        }
    }

    sqlx::query("CALL classchat.sp_healthz()")
        .execute(pool)
        .await
        .map(|_| ())
}

fn collect_sql_files(dir: &Path) -> Result<Vec<PathBuf>, BootstrapError> {
    let mut entries = Vec::new();
    let read_dir = fs::read_dir(dir).map_err(|source| BootstrapError::ReadDir {
        path: dir.to_path_buf(),
        source,
    })?;

    for entry in read_dir {
        let entry = entry.map_err(|source| BootstrapError::ReadDir {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path
            .extension()
            .and_then(OsStr::to_str)
            .is_some_and(|ext| ext.eq_ignore_ascii_case("sql"))
        {
            entries.push(path);
        }
    }

    entries.sort_by(|a, b| compare_paths(a, b));
    Ok(entries)
}

fn compare_paths(a: &Path, b: &Path) -> Ordering {
    match (a.file_name(), b.file_name()) {
        (Some(a_name), Some(b_name)) => a_name.cmp(b_name),
        _ => Ordering::Equal,
    }
}

async fn apply_script(pool: &PgPool, stage: &str, path: &Path) -> Result<bool, BootstrapError> {
    let sql = fs::read_to_string(path).map_err(|source| BootstrapError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;

    let trimmed = sql.trim();
    if trimmed.is_empty() {
        warn!(path = %path.display(), "skipping empty bootstrap script");
        return Ok(false);
    }

    let sql_error = |source| BootstrapError::Sql {
        path: path.to_path_buf(),
        source,
    };

    let mut transaction = pool.begin().await.map_err(sql_error)?;
    info!(stage, script = %path.display(), "executing bootstrap script");
    sqlx::raw_sql(trimmed)
        .execute(&mut *transaction)
        .await
        .map_err(sql_error)?;
    transaction.commit().await.map_err(sql_error)?;
    Ok(true)
}

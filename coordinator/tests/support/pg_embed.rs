//! Embedded PostgreSQL bootstrap for the relational integration suite.
//!
//! Unless `PG_RUNTIME_DIR` and `PG_DATA_DIR` are both set, the cluster is
//! installed under a unique directory inside the target directory. The
//! environment override is held only while the cluster starts.

use std::path::PathBuf;
use std::sync::Mutex;

use pg_embedded_setup_unpriv::TestCluster;
use uuid::Uuid;

static BOOTSTRAP_LOCK: Mutex<()> = Mutex::new(());

/// True when `RUN_PG_EMBEDDED=1` opts into the embedded suite.
pub fn embedded_postgres_enabled() -> bool {
    std::env::var("RUN_PG_EMBEDDED").as_deref() == Ok("1")
}

fn bootstrap_dirs() -> Result<(String, String), std::io::Error> {
    let target = std::env::var_os("CARGO_TARGET_DIR").map_or_else(
        || PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../target"),
        PathBuf::from,
    );
    let base = target
        .join("pg-embed")
        .join(format!("coordinator-{}", Uuid::new_v4()));
    let (install, data) = (base.join("install"), base.join("data"));
    std::fs::create_dir_all(&install)?;
    std::fs::create_dir_all(&data)?;
    Ok((
        install.to_string_lossy().into_owned(),
        data.to_string_lossy().into_owned(),
    ))
}

/// Start a [`TestCluster`] for one test.
pub fn test_cluster() -> Result<TestCluster, String> {
    let _bootstrap = BOOTSTRAP_LOCK
        .lock()
        .unwrap_or_else(|err| err.into_inner());

    let configured =
        std::env::var_os("PG_RUNTIME_DIR").is_some() && std::env::var_os("PG_DATA_DIR").is_some();
    let _env = if configured {
        None
    } else {
        let (install, data) = bootstrap_dirs().map_err(|err| err.to_string())?;
        Some(env_lock::lock_env([
            ("PG_RUNTIME_DIR", Some(install)),
            ("PG_DATA_DIR", Some(data)),
        ]))
    };

    TestCluster::new().map_err(|err| format!("{err:?}"))
}

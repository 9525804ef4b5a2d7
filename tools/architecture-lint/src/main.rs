//! CLI entry point for the repo-local architecture lint.
//!
//! Usage: `architecture-lint [CRATE_DIR]`. Without an argument the
//! `coordinator/` crate of the enclosing workspace is linted.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

fn main() -> ExitCode {
    let crate_dir = match std::env::args_os().nth(1) {
        Some(dir) => PathBuf::from(dir),
        None => match workspace_root() {
            Ok(root) => root.join("coordinator"),
            Err(err) => return report(&err),
        },
    };

    match architecture_lint::lint_crate_sources(&crate_dir) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => report(&err),
    }
}

fn report(err: &dyn fmt::Display) -> ExitCode {
    let _ = writeln!(io::stderr().lock(), "{err}");
    ExitCode::FAILURE
}

#[derive(Debug, Clone, Copy)]
struct WorkspaceRootError;

impl fmt::Display for WorkspaceRootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("unable to locate the workspace root; pass the crate directory explicitly")
    }
}

fn workspace_root() -> Result<PathBuf, WorkspaceRootError> {
    [
        std::env::var_os("CARGO_WORKSPACE_DIR").map(PathBuf::from),
        std::env::current_dir().ok(),
        Some(PathBuf::from(env!("CARGO_MANIFEST_DIR"))),
    ]
    .into_iter()
    .flatten()
    .find_map(|start| find_workspace_root(&start))
    .ok_or(WorkspaceRootError)
}

fn find_workspace_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| declares_workspace(&dir.join("Cargo.toml")))
        .map(Path::to_path_buf)
}

fn declares_workspace(manifest: &Path) -> bool {
    fs::read_to_string(manifest).is_ok_and(|contents| contents.contains("[workspace]"))
}

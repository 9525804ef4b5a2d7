//! Repo-local architectural lint for enforcing hexagonal boundaries.
//!
//! The coordinator crate keeps its coordination core in `domain` and its
//! backend adapters under `outbound`, one directory per adapter. This crate
//! provides a lightweight lint that:
//!
//! - forbids `domain` code from depending on `outbound`, `config` or
//!   `test_support`, or on database and configuration crates
//! - forbids an `outbound` adapter from importing a peer adapter (for
//!   example `persistence` importing `broker`)
//! - forbids `outbound` adapters from depending on `config` or
//!   `test_support`
//!
//! The lint is executed via `cargo run -p architecture-lint`.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use syn::visit::Visit;

/// Name the linted crate uses for itself in integration-style paths.
const CRATE_NAME: &str = "coordinator";

/// Top-level modules of the linted crate.
const INTERNAL_ROOTS: [&str; 4] = ["domain", "outbound", "config", "test_support"];

/// A single boundary violation discovered by the linter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File path relative to `coordinator/src`.
    pub file: PathBuf,
    /// Human-readable description of the violated rule.
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.file.display(), self.message)
    }
}

/// Failure modes returned by the architecture lint.
#[derive(Debug)]
pub enum ArchitectureLintError {
    /// Filesystem traversal or reading failed.
    Io(io::Error),
    /// Rust source parsing failed.
    Parse { file: PathBuf, message: String },
    /// One or more boundary violations were found.
    Violations(Vec<Violation>),
}

impl fmt::Display for ArchitectureLintError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "I/O error while linting architecture: {err}"),
            Self::Parse { file, message } => write!(
                f,
                "Failed to parse Rust source while linting architecture ({}): {message}",
                file.display()
            ),
            Self::Violations(violations) => {
                writeln!(f, "Architecture boundary violations:")?;
                for violation in violations {
                    writeln!(f, "- {violation}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ArchitectureLintError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ArchitectureLintError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Lint the coordinator crate sources on disk.
///
/// `crate_dir` must be the `coordinator/` directory at the repository root.
pub fn lint_crate_sources(crate_dir: &Path) -> Result<(), ArchitectureLintError> {
    let src_dir = crate_dir.join("src");
    let sources = collect_lint_sources(&src_dir)?;
    lint_sources(&sources)
}

/// Lint the provided Rust sources. Intended for unit and behaviour tests.
pub fn lint_sources(sources: &[LintSource]) -> Result<(), ArchitectureLintError> {
    let mut violations = Vec::new();

    for source in sources {
        let layer = ModuleLayer::infer_from_path(&source.file).ok_or_else(|| {
            ArchitectureLintError::Parse {
                file: source.file.clone(),
                message: "unable to infer module layer from file path".to_owned(),
            }
        })?;
        let parsed =
            syn::parse_file(&source.contents).map_err(|err| ArchitectureLintError::Parse {
                file: source.file.clone(),
                message: err.to_string(),
            })?;
        violations.extend(lint_parsed_source(&source.file, &layer, &parsed));
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(ArchitectureLintError::Violations(violations))
    }
}

/// A Rust source file to be linted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LintSource {
    /// Path relative to `coordinator/src`.
    pub file: PathBuf,
    pub contents: String,
}

/// The architectural "layer" inferred from a file path under
/// `coordinator/src`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ModuleLayer {
    Domain,
    /// An adapter directory under `outbound`, or `None` for
    /// `outbound/mod.rs` itself.
    Outbound(Option<String>),
}

impl ModuleLayer {
    fn infer_from_path(relative_path: &Path) -> Option<Self> {
        let mut components = relative_path
            .components()
            .map(|component| component.as_os_str().to_string_lossy().into_owned());
        match components.next()?.as_str() {
            "domain" => Some(Self::Domain),
            "outbound" => {
                let adapter = components
                    .next()
                    .filter(|_| relative_path.components().count() > 2);
                Some(Self::Outbound(adapter))
            }
            _ => None,
        }
    }

    fn name(&self) -> String {
        match self {
            Self::Domain => "domain".to_owned(),
            Self::Outbound(None) => "outbound".to_owned(),
            Self::Outbound(Some(adapter)) => format!("outbound adapter `{adapter}`"),
        }
    }

    fn forbidden_module_roots(&self) -> BTreeSet<&'static str> {
        match self {
            Self::Domain => BTreeSet::from(["outbound", "config", "test_support"]),
            Self::Outbound(_) => BTreeSet::from(["config", "test_support"]),
        }
    }

    fn forbidden_crate_roots(&self) -> BTreeSet<&'static str> {
        match self {
            Self::Domain => BTreeSet::from([
                "bb8",
                "diesel",
                "diesel_async",
                "ortho_config",
                "pg_embedded_setup_unpriv",
                "postgres",
                "tokio_postgres",
            ]),
            Self::Outbound(_) => BTreeSet::from(["ortho_config"]),
        }
    }

    /// Peer adapter named by `resolved`, if this layer may not reach it.
    fn forbidden_peer<'a>(&self, resolved: &'a [String]) -> Option<&'a str> {
        let Self::Outbound(Some(own)) = self else {
            return None;
        };
        match resolved {
            [root, adapter, ..] if root == "outbound" && adapter != own && adapter != "*" => {
                Some(adapter.as_str())
            }
            _ => None,
        }
    }
}

fn lint_parsed_source(file: &Path, layer: &ModuleLayer, parsed: &syn::File) -> Vec<Violation> {
    let forbidden_modules = layer.forbidden_module_roots();
    let forbidden_crates = layer.forbidden_crate_roots();
    let layer_name = layer.name();

    let mut collector = PathCollector::new(module_path_of(file));
    collector.visit_file(parsed);

    let mut messages = BTreeSet::new();
    for path in &collector.paths {
        match path {
            ModulePath::Internal(resolved) => {
                if let Some(root) = resolved
                    .first()
                    .and_then(|root| forbidden_modules.get(root.as_str()))
                {
                    messages.insert(format!(
                        "{layer_name} module must not depend on crate::{root}"
                    ));
                }
                if let Some(peer) = layer.forbidden_peer(resolved) {
                    messages.insert(format!(
                        "{layer_name} must not depend on peer adapter crate::outbound::{peer}"
                    ));
                }
            }
            ModulePath::External(root) => {
                if let Some(root) = forbidden_crates.get(root.as_str()) {
                    messages.insert(format!(
                        "{layer_name} module must not depend on external crate `{root}`"
                    ));
                }
            }
        }
    }

    messages
        .into_iter()
        .map(|message| Violation {
            file: file.to_path_buf(),
            message,
        })
        .collect()
}

/// Module path of a source file, e.g. `outbound/broker/mod.rs` is
/// `outbound::broker`.
fn module_path_of(file: &Path) -> Vec<String> {
    let mut segments: Vec<String> = file
        .with_extension("")
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect();
    if segments.last().is_some_and(|last| last == "mod") {
        segments.pop();
    }
    segments
}

fn is_relative_module_segment(segment: &str) -> bool {
    matches!(segment, "crate" | "self" | "super")
}

/// A path seen in a source file, classified by where it points.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum ModulePath {
    /// Absolute module path within the linted crate.
    Internal(Vec<String>),
    /// Root segment of a path into another crate.
    External(String),
}

/// Classify `segments` as seen from the module `scope`.
fn resolve(scope: &[String], segments: &[String]) -> Option<ModulePath> {
    let first = segments.first()?.as_str();
    match first {
        "crate" => Some(ModulePath::Internal(segments[1..].to_vec())),
        name if name == CRATE_NAME => Some(ModulePath::Internal(segments[1..].to_vec())),
        "self" => {
            let mut resolved = scope.to_vec();
            resolved.extend_from_slice(&segments[1..]);
            Some(ModulePath::Internal(resolved))
        }
        "super" => {
            let depth = segments
                .iter()
                .take_while(|segment| segment.as_str() == "super")
                .count();
            let mut resolved = scope[..scope.len().saturating_sub(depth)].to_vec();
            resolved.extend(
                segments[depth..]
                    .iter()
                    .filter(|segment| !is_relative_module_segment(segment))
                    .cloned(),
            );
            Some(ModulePath::Internal(resolved))
        }
        name if INTERNAL_ROOTS.contains(&name) => Some(ModulePath::Internal(segments.to_vec())),
        name => Some(ModulePath::External(name.to_owned())),
    }
}

struct PathCollector {
    scope: Vec<String>,
    paths: BTreeSet<ModulePath>,
}

impl PathCollector {
    fn new(scope: Vec<String>) -> Self {
        Self {
            scope,
            paths: BTreeSet::new(),
        }
    }

    fn record(&mut self, segments: &[String]) {
        if let Some(path) = resolve(&self.scope, segments) {
            self.paths.insert(path);
        }
    }

    fn record_path(&mut self, path: &syn::Path) {
        let segments = path
            .segments
            .iter()
            .map(|segment| segment.ident.to_string())
            .collect::<Vec<_>>();
        self.record(&segments);
    }

    fn record_use_tree(&mut self, tree: &syn::UseTree, prefix: Vec<String>) {
        match tree {
            syn::UseTree::Path(path) => {
                let mut next = prefix;
                next.push(path.ident.to_string());
                self.record_use_tree(&path.tree, next);
            }
            syn::UseTree::Name(name) => {
                let mut segments = prefix;
                segments.push(name.ident.to_string());
                self.record(&segments);
            }
            syn::UseTree::Rename(rename) => {
                let mut segments = prefix;
                segments.push(rename.ident.to_string());
                self.record(&segments);
            }
            syn::UseTree::Glob(_) => {
                let mut segments = prefix;
                segments.push("*".to_owned());
                self.record(&segments);
            }
            syn::UseTree::Group(group) => {
                for item in &group.items {
                    self.record_use_tree(item, prefix.clone());
                }
            }
        }
    }
}

impl<'ast> Visit<'ast> for PathCollector {
    fn visit_path(&mut self, node: &'ast syn::Path) {
        self.record_path(node);
        syn::visit::visit_path(self, node);
    }

    fn visit_item_use(&mut self, node: &'ast syn::ItemUse) {
        self.record_use_tree(&node.tree, Vec::new());
    }

    fn visit_item_mod(&mut self, node: &'ast syn::ItemMod) {
        self.scope.push(node.ident.to_string());
        syn::visit::visit_item_mod(self, node);
        self.scope.pop();
    }
}

fn collect_lint_sources(src_dir: &Path) -> Result<Vec<LintSource>, ArchitectureLintError> {
    let mut sources = Vec::new();
    for layer_dir in ["domain", "outbound"] {
        let dir = src_dir.join(layer_dir);
        if !dir.exists() {
            continue;
        }
        collect_sources_under(src_dir, &dir, &mut sources)?;
    }
    Ok(sources)
}

fn collect_sources_under(
    src_root: &Path,
    current: &Path,
    sources: &mut Vec<LintSource>,
) -> Result<(), ArchitectureLintError> {
    for entry in fs::read_dir(current)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_sources_under(src_root, &path, sources)?;
            continue;
        }

        if path.extension().and_then(|ext| ext.to_str()) != Some("rs") {
            continue;
        }

        let relative = path
            .strip_prefix(src_root)
            .map_err(|err| ArchitectureLintError::Parse {
                file: path.clone(),
                message: err.to_string(),
            })?
            .to_path_buf();
        let contents = fs::read_to_string(&path)?;
        sources.push(LintSource {
            file: relative,
            contents,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests;

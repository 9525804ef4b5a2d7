//! Unit tests for the architecture lint.

use std::path::PathBuf;

use rstest::rstest;

use super::*;

fn lint_one(file: &str, contents: &str) -> Result<(), ArchitectureLintError> {
    lint_sources(&[LintSource {
        file: PathBuf::from(file),
        contents: contents.to_owned(),
    }])
}

#[rstest]
#[case(
    "domain/composite.rs",
    "use super::context::Context; use crate::domain::ports::Transactor; fn f(_: Context) {}",
    true
)]
#[case(
    "domain/composite.rs",
    "use crate::outbound::persistence::PgTransactor; fn f() {}",
    false
)]
#[case(
    "domain/context/mod.rs",
    "use super::super::outbound::broker::Publisher; fn f() {}",
    false
)]
#[case("domain/ports/transaction.rs", "use diesel_async::AsyncPgConnection; fn f() {}", false)]
#[case("domain/ports/transaction.rs", "fn f() { let _ = bb8::Pool::builder(); }", false)]
#[case("domain/unit_of_work.rs", "use crate::config::PersistenceSettings; fn f() {}", false)]
#[case("domain/unit_of_work.rs", "use tokio::sync::watch; use tracing::warn; fn f() {}", true)]
#[case(
    "outbound/persistence/pg_transaction.rs",
    "use super::pool::DbPool; use crate::domain::Context; fn f() {}",
    true
)]
#[case(
    "outbound/persistence/pg_transaction.rs",
    "use crate::outbound::broker::BufferedTransaction; fn f() {}",
    false
)]
#[case(
    "outbound/broker/publisher.rs",
    "use super::super::persistence::PgExecutor; fn f() {}",
    false
)]
#[case(
    "outbound/broker/publisher.rs",
    "mod tests { use crate::outbound::broker::BufferedTransactor; use super::*; }",
    true
)]
#[case("outbound/mod.rs", "pub mod broker; pub mod persistence;", true)]
#[case("outbound/broker/registry.rs", "use ortho_config::OrthoConfig; fn f() {}", false)]
fn detects_boundary_violations(#[case] file: &str, #[case] contents: &str, #[case] ok: bool) {
    let result = lint_one(file, contents);
    assert_eq!(result.is_ok(), ok, "result: {result:?}");
}

#[rstest]
#[case("domain/mod.rs", &["domain"])]
#[case("domain/context/composite.rs", &["domain", "context", "composite"])]
#[case("outbound/broker/mod.rs", &["outbound", "broker"])]
fn module_paths_follow_file_layout(#[case] file: &str, #[case] expected: &[&str]) {
    assert_eq!(module_path_of(Path::new(file)), expected);
}

#[rstest]
fn super_resolves_against_inline_modules() {
    let scope = vec!["outbound".to_owned(), "broker".to_owned(), "tests".to_owned()];
    let segments = ["super", "super", "persistence", "PgExecutor"].map(str::to_owned);

    assert_eq!(
        resolve(&scope, &segments),
        Some(ModulePath::Internal(vec![
            "outbound".to_owned(),
            "persistence".to_owned(),
            "PgExecutor".to_owned(),
        ]))
    );
}

#[rstest]
fn peer_violation_names_both_adapters() {
    let result = lint_one(
        "outbound/broker/buffered_transaction.rs",
        "use crate::outbound::persistence::DbPool; fn f() {}",
    );

    let Err(ArchitectureLintError::Violations(violations)) = result else {
        panic!("expected boundary violations");
    };
    assert_eq!(
        violations[0].message,
        "outbound adapter `broker` must not depend on peer adapter crate::outbound::persistence"
    );
}

#[rstest]
fn files_outside_known_layers_are_rejected() {
    let result = lint_one("inbound/http.rs", "fn f() {}");

    assert!(matches!(result, Err(ArchitectureLintError::Parse { .. })));
}

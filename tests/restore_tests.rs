//! Backup discovery, selection and guarded extraction.

mod common;

use std::sync::Arc;

use common::*;
use converge::backup::{select_latest, ArchiveEntry, BackupError};
use converge::connection::CommandResult;
use converge::executor::{ErrorKind, TaskStatus};
use converge::playbook::{Play, Task};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::json;

const ARCHIVE: &str = "/backups/app-20240101T0000.tar.gz";
const GUARD: &str = "/srv/app/.restored";

/// A host with one backup whose extraction drops the guard file.
fn backup_host(factory: &MockConnectionFactory) -> Arc<MockConnection> {
    let conn = factory.connection("db1");
    conn.add_path(ARCHIVE);
    conn.on_ok(
        "find '/backups'",
        &format!("{}\tapp-20240101T0000.tar.gz\t1704067200.0\t1704067200.0\t2048\n", ARCHIVE),
    );
    conn.handle(|conn, cmd, _| {
        if cmd.starts_with("cp -a ") {
            conn.add_path(GUARD);
            return Some(CommandResult::success(String::new(), String::new()));
        }
        None
    });
    conn
}

fn find_then_unarchive() -> Play {
    Play::new("restore", "all")
        .with_task(
            Task::new(
                "find backups",
                "find",
                json!({"paths": "/backups", "patterns": "app-*.tar.gz"}),
            )
            .with_register("backups"),
        )
        .with_task(Task::new(
            "extract",
            "unarchive",
            json!({
                "src": "{{ backups.files[0].path }}",
                "dest": "/srv/app",
                "creates": GUARD,
            }),
        ))
}

#[tokio::test]
async fn test_find_then_unarchive_is_idempotent() {
    let factory = Arc::new(MockConnectionFactory::new());
    let conn = backup_host(&factory);

    let first = executor(inventory_with("all", &["db1"]), &factory)
        .run_play(&find_then_unarchive())
        .await
        .unwrap();
    let statuses: Vec<_> = first.results.iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![TaskStatus::Ok, TaskStatus::Changed]);
    assert!(conn.ran(&format!("tar -xf '{}'", ARCHIVE)));
    assert!(conn.ran("rm -rf -- '/srv/app/.converge-staging-"));

    conn.reset_log();
    let second = executor(inventory_with("all", &["db1"]), &factory)
        .run_play(&find_then_unarchive())
        .await
        .unwrap();
    assert_eq!(second.results[1].status, TaskStatus::Ok);
    assert!(!conn.ran("tar -xf"));
}

#[tokio::test]
async fn test_restore_module_picks_latest() {
    let factory = Arc::new(MockConnectionFactory::new());
    let conn = factory.connection("db1");
    let newer = "/backups/app-20240115T0000.tar.gz";
    conn.add_path(ARCHIVE);
    conn.add_path(newer);
    conn.on_ok(
        "find '/backups'",
        &format!(
            "{a}\tapp-20240101T0000.tar.gz\t5.0\t5.0\t1\n{b}\tapp-20240115T0000.tar.gz\t1.0\t1.0\t1\n",
            a = ARCHIVE,
            b = newer
        ),
    );

    let play = Play::new("restore", "all").with_task(
        Task::new(
            "restore",
            "restore",
            json!({"backup_dir": "/backups", "pattern": "app-*.tar.gz", "dest": "/srv/app"}),
        )
        .with_register("restored"),
    );
    let report = executor(inventory_with("all", &["db1"]), &factory)
        .run_play(&play)
        .await
        .unwrap();

    let result = &report.results[0];
    assert_eq!(result.status, TaskStatus::Changed);
    assert_eq!(result.output["archive"], json!(newer));
    assert!(conn.ran(&format!("tar -xf '{}'", newer)));
}

#[tokio::test]
async fn test_restore_without_backups_fails_precondition() {
    let factory = Arc::new(MockConnectionFactory::new());
    factory.connection("db1").on_ok("find '/backups'", "");

    let play = Play::new("restore", "all").with_task(Task::new(
        "restore",
        "restore",
        json!({"backup_dir": "/backups", "pattern": "app-*.tar.gz", "dest": "/srv/app"}),
    ));
    let report = executor(inventory_with("all", &["db1"]), &factory)
        .run_play(&play)
        .await
        .unwrap();

    assert_eq!(report.results[0].status, TaskStatus::Failed);
    assert_eq!(report.results[0].error, Some(ErrorKind::PreconditionFailed));
}

#[test]
fn test_select_latest_fixed_width_names() {
    let entries = vec![
        ArchiveEntry::new("/b/a-20240101T0000.tar.gz"),
        ArchiveEntry::new("/b/a-20240115T0000.tar.gz"),
    ];
    let latest = select_latest(&entries, "a-*.tar.gz").unwrap();
    assert_eq!(latest.name, "a-20240115T0000.tar.gz");
}

#[test]
fn test_select_latest_nothing_matches() {
    let entries = vec![ArchiveEntry::new("/b/other.tar.gz")];
    assert_eq!(
        select_latest(&entries, "a-*.tar.gz"),
        Err(BackupError::NotFound("a-*.tar.gz".to_string()))
    );
    assert!(select_latest(&[], "*").is_err());
}

fn stamp() -> impl Strategy<Value = String> {
    (2000u32..2100, 1u32..13, 1u32..29, 0u32..24, 0u32..60)
        .prop_map(|(y, m, d, h, min)| format!("{:04}{:02}{:02}T{:02}{:02}", y, m, d, h, min))
}

proptest! {
    #[test]
    fn prop_select_latest_is_pure_and_maximal(stamps in prop::collection::vec(stamp(), 1..20)) {
        let entries: Vec<ArchiveEntry> = stamps
            .iter()
            .map(|s| ArchiveEntry::new(format!("/b/app-{}.tar.gz", s)))
            .collect();

        let first = select_latest(&entries, "app-*.tar.gz").unwrap();
        let second = select_latest(&entries, "app-*.tar.gz").unwrap();
        prop_assert_eq!(&first, &second);

        let newest = stamps.iter().max().unwrap();
        prop_assert_eq!(first.name, format!("app-{}.tar.gz", newest));
    }

    #[test]
    fn prop_select_latest_ignores_input_order(
        mut mtimes in prop::collection::vec(0i64..1_000_000, 1..20)
    ) {
        let build = |times: &[i64]| -> Vec<ArchiveEntry> {
            times
                .iter()
                .enumerate()
                .map(|(i, t)| ArchiveEntry::with_mtime(format!("/b/db-{}.dump", i), *t))
                .collect()
        };
        let forward = build(&mtimes);
        let mut reversed = forward.clone();
        reversed.reverse();

        let a = select_latest(&forward, "db-*.dump").unwrap();
        let b = select_latest(&reversed, "db-*.dump").unwrap();
        prop_assert_eq!(&a, &b);

        mtimes.sort_unstable();
        prop_assert_eq!(a.key, converge::backup::SortKey::Time(*mtimes.last().unwrap()));
    }
}

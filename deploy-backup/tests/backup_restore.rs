mod common;

use common::{write, Fixture, DUMP};
use deploy_backup::archive::ArchiveManager;
use deploy_backup::capture::{ComponentKind, ComponentStatus};
use deploy_backup::executor::{
    BackupKind, BackupOrchestrator, BackupOutcome, BackupState, Manifest, RestoreOptions,
    RestoreOrchestrator, RestoreOutcome, RestorePlan, RestoreStep, StepOutcome,
};
use deploy_backup::fs::walker::calculate_total_size;
use deploy_backup::lock::BackupLock;
use deploy_backup::BackupError;
use std::fs;
use std::sync::atomic::Ordering;
use tempfile::TempDir;

async fn backup(fixture: &Fixture, name: &str) -> deploy_backup::executor::Backup {
    let mut orchestrator = BackupOrchestrator::new(fixture.config.clone(), fixture.collaborators());
    orchestrator
        .create_backup(Some(name), BackupKind::Manual)
        .await
        .unwrap()
}

fn status_of(backup: &deploy_backup::executor::Backup, kind: ComponentKind) -> ComponentStatus {
    backup.components.iter().find(|c| c.kind == kind).unwrap().status
}

#[tokio::test]
async fn nightly_backup_records_four_successes_and_skipped_logs() {
    let fixture = Fixture::new();
    let mut orchestrator = BackupOrchestrator::new(fixture.config.clone(), fixture.collaborators());

    let backup = orchestrator
        .create_backup(Some("nightly"), BackupKind::Manual)
        .await
        .unwrap();

    assert_eq!(orchestrator.state(), BackupState::Done);
    assert_eq!(backup.archive_path, fixture.archive("nightly"));
    assert!(fs::metadata(&backup.archive_path).unwrap().len() > 0);
    assert_eq!(backup.outcome, BackupOutcome::Completed);

    for kind in [
        ComponentKind::Config,
        ComponentKind::Certificates,
        ComponentKind::Database,
        ComponentKind::Volumes,
    ] {
        assert_eq!(status_of(&backup, kind), ComponentStatus::Success, "{kind}");
    }
    assert_eq!(status_of(&backup, ComponentKind::Logs), ComponentStatus::Skipped);

    let text = ArchiveManager::default()
        .read_manifest(&backup.archive_path)
        .unwrap()
        .unwrap();
    let manifest = Manifest::parse(&text).unwrap();
    assert_eq!(manifest, backup.manifest);
    assert_eq!(manifest.backup_name, "nightly");
    assert_eq!(manifest.domain, "example.test");
    assert_eq!(
        manifest
            .components
            .iter()
            .filter(|c| c.status == ComponentStatus::Success)
            .count(),
        4
    );
    assert!(manifest.service_status.contains("postgres"));
}

#[tokio::test]
async fn archive_is_owner_only_and_staging_is_gone() {
    let fixture = Fixture::new();
    let backup = backup(&fixture, "nightly").await;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&backup.archive_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    assert!(!backup.staging_path.exists());
    assert!(!fixture.backups().join(".staging").exists());

    let summary = ArchiveManager::default().verify(&backup.archive_path).unwrap();
    assert_eq!(summary.top_level, "nightly");
    assert!(summary.manifest_last);
}

#[tokio::test]
async fn database_failure_leaves_no_archive() {
    let fixture = Fixture::new();
    fixture.fake.fail_dump.store(true, Ordering::SeqCst);
    let mut orchestrator = BackupOrchestrator::new(fixture.config.clone(), fixture.collaborators());

    let err = orchestrator
        .create_backup(Some("broken"), BackupKind::Manual)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        BackupError::ComponentCapture { kind: ComponentKind::Database, .. }
    ));
    assert_eq!(orchestrator.state(), BackupState::Failed);
    assert!(!fixture.archive("broken").exists());
    assert!(!fixture.backups().join(".staging/broken").exists());
}

#[tokio::test]
async fn empty_dump_counts_as_database_failure() {
    let fixture = Fixture::new();
    fixture.fake.empty_dump.store(true, Ordering::SeqCst);
    let mut orchestrator = BackupOrchestrator::new(fixture.config.clone(), fixture.collaborators());

    assert!(orchestrator
        .create_backup(Some("empty"), BackupKind::Manual)
        .await
        .is_err());
    assert!(!fixture.archive("empty").exists());
}

#[tokio::test]
async fn realm_export_failure_is_only_a_note() {
    let fixture = Fixture::new();
    fixture.fake.fail_realm.store(true, Ordering::SeqCst);

    let backup = backup(&fixture, "norealm").await;

    let database = backup
        .components
        .iter()
        .find(|c| c.kind == ComponentKind::Database)
        .unwrap();
    assert_eq!(database.status, ComponentStatus::Success);
    assert!(database.detail.contains("realm export failed"));
    assert!(!database.detail.contains('\n'));
    assert_eq!(backup.outcome, BackupOutcome::Completed);

    let text = ArchiveManager::default()
        .read_manifest(&backup.archive_path)
        .unwrap()
        .unwrap();
    let archived = Manifest::parse(&text).unwrap();
    assert_eq!(archived, backup.manifest);

    let orchestrator = RestoreOrchestrator::new(fixture.config.clone(), fixture.collaborators());
    let options = RestoreOptions {
        force: true,
        skip_service_restart: true,
    };
    let report = orchestrator
        .restore("norealm", options, &|_: &RestorePlan| true)
        .await
        .unwrap();
    assert_eq!(report.step(RestoreStep::Validate).unwrap().outcome, StepOutcome::Done);
    assert_eq!(report.outcome, RestoreOutcome::Restored);
}

#[tokio::test]
async fn one_failing_volume_does_not_stop_the_others() {
    let fixture = Fixture::new();
    fixture.fake.fail_export("stack_grafana_data");

    let backup = backup(&fixture, "partial").await;

    assert_eq!(backup.outcome, BackupOutcome::CompletedWithWarnings);
    let volumes = backup
        .components
        .iter()
        .find(|c| c.kind == ComponentKind::Volumes)
        .unwrap();
    assert_eq!(volumes.status, ComponentStatus::Failed);
    assert!(volumes.detail.contains("grafana_data"));

    let text = ArchiveManager::default()
        .read_manifest(&backup.archive_path)
        .unwrap()
        .unwrap();
    let archived = Manifest::parse(&text).unwrap();
    assert_eq!(archived.outcome, BackupOutcome::CompletedWithWarnings);
    assert_eq!(
        archived.component(ComponentKind::Volumes).unwrap().status,
        ComponentStatus::Failed
    );
    for kind in [
        ComponentKind::Config,
        ComponentKind::Certificates,
        ComponentKind::Database,
        ComponentKind::Logs,
    ] {
        assert_ne!(archived.component(kind).unwrap().status, ComponentStatus::Failed, "{kind}");
    }

    let out = TempDir::new().unwrap();
    let tree = ArchiveManager::default()
        .extract(&backup.archive_path, out.path())
        .unwrap();
    let mut captured: Vec<String> = fs::read_dir(tree.join("volumes"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    captured.sort();
    assert_eq!(
        captured,
        vec![
            "keycloak_data.tar.gz",
            "postgres_data.tar.gz",
            "prometheus_data.tar.gz"
        ]
    );
}

#[tokio::test]
async fn manifest_describes_the_packed_archive() {
    let fixture = Fixture::new();
    let backup = backup(&fixture, "fresh").await;

    let manager = ArchiveManager::default();
    let manifest =
        Manifest::parse(&manager.read_manifest(&backup.archive_path).unwrap().unwrap()).unwrap();

    let out = TempDir::new().unwrap();
    let tree = manager.extract(&backup.archive_path, out.path()).unwrap();

    assert!(manifest.archive_bytes > 0);
    for kind in [ComponentKind::Config, ComponentKind::Database, ComponentKind::Certificates] {
        let packed = calculate_total_size(&tree.join(kind.dir_name())).unwrap();
        assert_eq!(manifest.component(kind).unwrap().size_bytes, packed, "{kind}");
    }
}

#[tokio::test]
async fn invalid_or_duplicate_names_are_rejected_before_capture() {
    let fixture = Fixture::new();
    let mut orchestrator = BackupOrchestrator::new(fixture.config.clone(), fixture.collaborators());

    for name in ["", "../evil", "has space", ".hidden"] {
        let err = orchestrator
            .create_backup(Some(name), BackupKind::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Environment(_)), "{name:?}");
    }

    orchestrator
        .create_backup(Some("once"), BackupKind::Manual)
        .await
        .unwrap();
    let err = orchestrator
        .create_backup(Some("once"), BackupKind::Manual)
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::Environment(_)));
}

#[tokio::test]
async fn existing_name_is_checked_under_the_lock() {
    let fixture = Fixture::new();
    let mut orchestrator = BackupOrchestrator::new(fixture.config.clone(), fixture.collaborators());
    orchestrator
        .create_backup(Some("once"), BackupKind::Manual)
        .await
        .unwrap();

    let held = BackupLock::acquire(&fixture.backups()).unwrap();
    let err = orchestrator
        .create_backup(Some("once"), BackupKind::Manual)
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::Locked(_)));
    drop(held);

    let err = orchestrator
        .create_backup(Some("once"), BackupKind::Manual)
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::Environment(_)));
}

#[tokio::test]
async fn unreachable_runtime_fails_before_staging() {
    let fixture = Fixture::new();
    fixture.fake.unreachable.store(true, Ordering::SeqCst);
    let mut orchestrator = BackupOrchestrator::new(fixture.config.clone(), fixture.collaborators());

    let err = orchestrator
        .create_backup(Some("offline"), BackupKind::Manual)
        .await
        .unwrap_err();

    assert!(matches!(err, BackupError::Environment(_)));
    assert!(!fixture.backups().join(".staging").exists());
    assert!(!fixture.archive("offline").exists());
}

#[tokio::test]
async fn automated_backups_are_capped() {
    let mut fixture = Fixture::new();
    fixture.config.backup.max_automated = 2;

    for _ in 0..3 {
        let mut orchestrator =
            BackupOrchestrator::new(fixture.config.clone(), fixture.collaborators());
        let name = format!("run{}", uuid_like());
        orchestrator
            .create_backup(Some(&name), BackupKind::Automated)
            .await
            .unwrap();
    }

    let automated: Vec<_> = deploy_backup::retention::list_backups(&fixture.backups())
        .unwrap()
        .into_iter()
        .filter(|b| b.automated)
        .collect();
    assert_eq!(automated.len(), 2);
}

fn uuid_like() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[tokio::test]
async fn restore_round_trips_configuration_byte_for_byte() {
    let fixture = Fixture::new();
    let project = fixture.project();
    let originals: Vec<_> = [
        ".env",
        "docker-compose.yml",
        "nginx/nginx.conf",
        "nginx/conf.d/app.conf",
    ]
    .iter()
    .map(|f| (f.to_string(), fs::read(project.join(f)).unwrap()))
    .collect();

    backup(&fixture, "nightly").await;

    write(&project.join(".env"), b"POSTGRES_PASSWORD=changed\n");
    write(&project.join("nginx/nginx.conf"), b"broken");
    fs::remove_file(project.join("docker-compose.yml")).unwrap();

    let orchestrator = RestoreOrchestrator::new(fixture.config.clone(), fixture.collaborators());
    let options = RestoreOptions {
        force: true,
        skip_service_restart: false,
    };
    let report = orchestrator
        .restore("nightly", options, &|_: &RestorePlan| false)
        .await
        .unwrap();

    assert_eq!(report.outcome, RestoreOutcome::Restored, "{:?}", report.warnings);
    for (file, contents) in originals {
        assert_eq!(fs::read(project.join(&file)).unwrap(), contents, "{file}");
    }

    let snapshot = report.session.pre_restore_snapshot.clone().unwrap();
    assert_eq!(fs::read(snapshot.join(".env")).unwrap(), b"POSTGRES_PASSWORD=changed\n");
    assert!(!report.session.extract_path.exists());

    assert_eq!(fixture.fake.stops(), 1);
    assert_eq!(fixture.fake.starts(), 1);
    assert_eq!(fixture.fake.restored_dumps.lock().unwrap().as_slice(), &[DUMP.to_vec()]);
    assert_eq!(fixture.fake.imports.lock().unwrap().len(), 4);
}

#[cfg(unix)]
#[tokio::test]
async fn restored_private_keys_are_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let fixture = Fixture::new();
    let key = fixture.project().join("certs/server.key");
    fs::set_permissions(&key, fs::Permissions::from_mode(0o644)).unwrap();
    backup(&fixture, "nightly").await;
    fs::remove_dir_all(fixture.project().join("certs")).unwrap();

    let orchestrator = RestoreOrchestrator::new(fixture.config.clone(), fixture.collaborators());
    let options = RestoreOptions {
        force: true,
        skip_service_restart: true,
    };
    orchestrator
        .restore("nightly", options, &|_: &RestorePlan| true)
        .await
        .unwrap();

    assert_eq!(fs::metadata(&key).unwrap().permissions().mode() & 0o777, 0o600);
    assert!(fixture.project().join("certs/server.crt").exists());
    assert!(!fixture.project().join("certs/private-keys.tar.zst").exists());
}

#[cfg(unix)]
#[tokio::test]
async fn restore_keeps_project_root_mode() {
    use std::os::unix::fs::PermissionsExt;

    let fixture = Fixture::new();
    let project = fixture.project();
    fs::set_permissions(&project, fs::Permissions::from_mode(0o700)).unwrap();
    backup(&fixture, "nightly").await;

    let orchestrator = RestoreOrchestrator::new(fixture.config.clone(), fixture.collaborators());
    let options = RestoreOptions {
        force: true,
        skip_service_restart: true,
    };
    orchestrator
        .restore("nightly", options, &|_: &RestorePlan| true)
        .await
        .unwrap();

    assert_eq!(fs::metadata(&project).unwrap().permissions().mode() & 0o777, 0o700);
}

#[tokio::test]
async fn back_to_back_restores_keep_separate_snapshots() {
    let fixture = Fixture::new();
    backup(&fixture, "nightly").await;

    let orchestrator = RestoreOrchestrator::new(fixture.config.clone(), fixture.collaborators());
    let options = RestoreOptions {
        force: true,
        skip_service_restart: true,
    };
    let first = orchestrator
        .restore("nightly", options, &|_: &RestorePlan| true)
        .await
        .unwrap();
    let second = orchestrator
        .restore("nightly", options, &|_: &RestorePlan| true)
        .await
        .unwrap();

    let first = first.session.pre_restore_snapshot.unwrap();
    let second = second.session.pre_restore_snapshot.unwrap();
    assert_ne!(first, second);
    assert!(first.join(".env").is_file());
    assert!(second.join(".env").is_file());
}

#[tokio::test]
async fn declined_confirmation_changes_nothing() {
    let fixture = Fixture::new();
    backup(&fixture, "nightly").await;
    write(&fixture.project().join(".env"), b"EDITED=1\n");

    let orchestrator = RestoreOrchestrator::new(fixture.config.clone(), fixture.collaborators());
    let err = orchestrator
        .restore("nightly", RestoreOptions::default(), &|plan: &RestorePlan| {
            assert_eq!(plan.backup_name, "nightly");
            assert!(plan.manifest.is_some());
            false
        })
        .await
        .unwrap_err();

    assert!(matches!(err, BackupError::RestoreAborted(_)));
    assert_eq!(fs::read(fixture.project().join(".env")).unwrap(), b"EDITED=1\n");
    assert_eq!(fixture.fake.stops(), 0);
    assert!(fixture.fake.restored_dumps.lock().unwrap().is_empty());

    let snapshots = fs::read_dir(fixture.backups())
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .starts_with("pre-restore_")
        })
        .count();
    assert_eq!(snapshots, 0);
}

#[tokio::test]
async fn skip_services_omits_both_transitions() {
    let fixture = Fixture::new();
    backup(&fixture, "nightly").await;

    let orchestrator = RestoreOrchestrator::new(fixture.config.clone(), fixture.collaborators());
    let options = RestoreOptions {
        force: true,
        skip_service_restart: true,
    };
    let report = orchestrator
        .restore("nightly", options, &|_: &RestorePlan| true)
        .await
        .unwrap();

    assert_eq!(fixture.fake.stops(), 0);
    assert_eq!(fixture.fake.starts(), 0);
    assert_eq!(report.step(RestoreStep::StopServices).unwrap().outcome, StepOutcome::Skipped);
    assert_eq!(report.step(RestoreStep::StartServices).unwrap().outcome, StepOutcome::Skipped);
    for step in [
        RestoreStep::RestoreConfig,
        RestoreStep::RestoreCerts,
        RestoreStep::RestoreDatabase,
        RestoreStep::RestoreVolumes,
    ] {
        assert_eq!(report.step(step).unwrap().outcome, StepOutcome::Done, "{step}");
    }
    assert_eq!(report.outcome, RestoreOutcome::Restored);
}

#[tokio::test]
async fn database_restore_failure_is_fatal() {
    let fixture = Fixture::new();
    backup(&fixture, "nightly").await;
    fixture.fake.fail_db_restore.store(true, Ordering::SeqCst);

    let orchestrator = RestoreOrchestrator::new(fixture.config.clone(), fixture.collaborators());
    let options = RestoreOptions {
        force: true,
        skip_service_restart: false,
    };
    let err = orchestrator
        .restore("nightly", options, &|_: &RestorePlan| true)
        .await
        .unwrap_err();

    assert!(matches!(err, BackupError::DatabaseRestore(_)));
    // stopped before the config restore, then again after the failed replay
    assert_eq!(fixture.fake.stops(), 2);
    assert_eq!(fixture.fake.starts(), 0);
    assert!(fixture.fake.imports.lock().unwrap().is_empty());
}

#[tokio::test]
async fn corrupt_archive_fails_validation_without_side_effects() {
    let fixture = Fixture::new();
    fs::create_dir_all(fixture.backups()).unwrap();
    fs::write(fixture.archive("garbage"), b"not an archive").unwrap();

    let orchestrator = RestoreOrchestrator::new(fixture.config.clone(), fixture.collaborators());
    let options = RestoreOptions {
        force: true,
        skip_service_restart: false,
    };

    for name in ["garbage", "missing"] {
        let err = orchestrator
            .restore(name, options, &|_: &RestorePlan| true)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Validation(_)), "{name}");
    }
    assert_eq!(fixture.fake.stops(), 0);
}

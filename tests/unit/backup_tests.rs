use std::{
    fs,
    os::unix::fs::{symlink, PermissionsExt},
    path::Path,
};

use plugup::{
    backup::{BackupSnapshot, BackupVault, RestoreOptions, RetentionPolicy, SNAPSHOT_MANIFEST},
    classify,
    guard::PathGuard,
    Error,
};
use tempfile::tempdir;

fn mode_of(path: &Path) -> u32 {
    fs::symlink_metadata(path).unwrap().permissions().mode() & 0o7777
}

fn write(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

fn plugin_tree(root: &Path) -> std::path::PathBuf {
    let plugin = root.join("plugin");
    write(&plugin, "plugin.json", r#"{"name":"demo","version":"1.0.0"}"#);
    write(&plugin, "agents/core/setup.md", "setup");
    write(&plugin, "bin/run", "#!/bin/sh\n");
    fs::set_permissions(plugin.join("bin/run"), fs::Permissions::from_mode(0o755)).unwrap();
    fs::create_dir_all(plugin.join("empty")).unwrap();
    plugin
}

#[test]
fn snapshot_is_private_and_records_every_entry() -> plugup::Result<()> {
    let tmp = tempdir()?;
    let plugin = plugin_tree(tmp.path());
    let vault = BackupVault::new(PathGuard::new([tmp.path()])?);

    let snapshot = vault.snapshot(&plugin)?;
    assert!(snapshot.backup_root.is_dir());
    assert!(snapshot
        .backup_root
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("plugin.backup-"));
    assert_eq!(mode_of(&snapshot.backup_root), 0o700);
    assert_eq!(mode_of(&snapshot.backup_root.join("bin/run")), 0o600);

    assert_eq!(snapshot.file_count(), 3);
    assert!(snapshot.directories.contains(&"empty".to_string()));
    let run = snapshot.find("bin/run").unwrap();
    assert_eq!(run.mode, 0o755);
    assert_eq!(run.size, 10);
    assert!(run.sha256.is_some());

    let reloaded = BackupSnapshot::load(&snapshot.backup_root)?;
    assert_eq!(reloaded, snapshot);
    assert!(snapshot.backup_root.join(SNAPSHOT_MANIFEST).is_file());

    // no staging leftovers next to the snapshot
    let leftovers: Vec<_> = fs::read_dir(tmp.path())?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
        .collect();
    assert!(leftovers.is_empty());
    Ok(())
}

#[test]
fn restore_round_trip_recovers_contents_and_modes() -> plugup::Result<()> {
    let tmp = tempdir()?;
    let plugin = plugin_tree(tmp.path());
    let vault = BackupVault::new(PathGuard::new([tmp.path()])?);
    let snapshot = vault.snapshot(&plugin)?;

    write(&plugin, "agents/core/setup.md", "clobbered");
    fs::remove_file(plugin.join("bin/run"))?;
    write(&plugin, "agents/new.md", "added later");

    let summary = vault.restore(&snapshot, RestoreOptions::default())?;
    assert_eq!(summary.files_restored, 3);
    assert_eq!(summary.pruned, 0);
    assert_eq!(fs::read_to_string(plugin.join("agents/core/setup.md"))?, "setup");
    assert_eq!(mode_of(&plugin.join("bin/run")), 0o755);
    // without pruning, files created after the snapshot survive
    assert!(plugin.join("agents/new.md").exists());

    // restoring again yields the same tree
    let again = vault.restore(&snapshot, RestoreOptions::default())?;
    assert_eq!(again.files_restored, summary.files_restored);
    assert_eq!(fs::read_to_string(plugin.join("agents/core/setup.md"))?, "setup");
    Ok(())
}

#[test]
fn restore_with_prune_removes_unknown_entries() -> plugup::Result<()> {
    let tmp = tempdir()?;
    let plugin = plugin_tree(tmp.path());
    let vault = BackupVault::new(PathGuard::new([tmp.path()])?);
    let snapshot = vault.snapshot(&plugin)?;

    write(&plugin, "agents/new.md", "added later");
    write(&plugin, "fresh/dir/file.txt", "x");

    let summary = vault.restore(&snapshot, RestoreOptions { prune_new: true })?;
    assert!(!plugin.join("agents/new.md").exists());
    assert!(!plugin.join("fresh").exists());
    assert!(plugin.join("empty").is_dir());
    assert_eq!(summary.pruned, 4);
    Ok(())
}

#[test]
fn symlinks_are_preserved_as_links() -> plugup::Result<()> {
    let tmp = tempdir()?;
    let plugin = plugin_tree(tmp.path());
    symlink("agents/core/setup.md", plugin.join("setup-link"))?;
    let vault = BackupVault::new(PathGuard::new([tmp.path()])?);

    let snapshot = vault.snapshot(&plugin)?;
    let link = snapshot.find("setup-link").unwrap();
    assert!(link.is_symlink());

    fs::remove_file(plugin.join("setup-link"))?;
    vault.restore(&snapshot, RestoreOptions::default())?;
    assert_eq!(
        fs::read_link(plugin.join("setup-link"))?,
        Path::new("agents/core/setup.md")
    );
    Ok(())
}

#[test]
fn round_trip_keeps_links_that_point_outside_the_allow_list() -> plugup::Result<()> {
    let allowed = tempdir()?;
    let outside = tempdir()?;
    write(outside.path(), "shared.txt", "shared");
    let plugin = plugin_tree(allowed.path());
    symlink(outside.path().join("shared.txt"), plugin.join("shared-link"))?;
    let vault = BackupVault::new(PathGuard::new([allowed.path()])?);

    let snapshot = vault.snapshot(&plugin)?;
    write(&plugin, "agents/core/setup.md", "clobbered");

    vault.restore(&snapshot, RestoreOptions { prune_new: true })?;
    assert_eq!(fs::read_to_string(plugin.join("agents/core/setup.md"))?, "setup");
    assert_eq!(
        fs::read_link(plugin.join("shared-link"))?,
        outside.path().join("shared.txt")
    );
    assert_eq!(fs::read_to_string(outside.path().join("shared.txt"))?, "shared");
    Ok(())
}

#[test]
fn restore_replaces_a_planted_link_instead_of_writing_through_it() -> plugup::Result<()> {
    let allowed = tempdir()?;
    let outside = tempdir()?;
    write(outside.path(), "victim.txt", "untouched");
    let plugin = plugin_tree(allowed.path());
    let vault = BackupVault::new(PathGuard::new([allowed.path()])?);
    let snapshot = vault.snapshot(&plugin)?;

    fs::remove_file(plugin.join("agents/core/setup.md"))?;
    symlink(outside.path().join("victim.txt"), plugin.join("agents/core/setup.md"))?;

    vault.restore(&snapshot, RestoreOptions::default())?;
    let restored = plugin.join("agents/core/setup.md");
    assert!(!restored.is_symlink());
    assert_eq!(fs::read_to_string(&restored)?, "setup");
    assert_eq!(fs::read_to_string(outside.path().join("victim.txt"))?, "untouched");
    Ok(())
}

#[test]
fn corrupt_backup_copy_is_refused_before_anything_is_written() -> plugup::Result<()> {
    let tmp = tempdir()?;
    let plugin = plugin_tree(tmp.path());
    let vault = BackupVault::new(PathGuard::new([tmp.path()])?);
    let snapshot = vault.snapshot(&plugin)?;

    write(&plugin, "plugin.json", "edited");
    write(&plugin, "agents/core/setup.md", "edited");
    fs::write(snapshot.backup_root.join("agents/core/setup.md"), "bit rot")?;

    let err = vault.restore(&snapshot, RestoreOptions::default()).unwrap_err();
    assert!(matches!(classify(&err), Some(Error::Backup(_))));
    assert_eq!(fs::read_to_string(plugin.join("plugin.json"))?, "edited");
    assert_eq!(fs::read_to_string(plugin.join("agents/core/setup.md"))?, "edited");
    Ok(())
}

#[test]
fn snapshot_of_missing_source_is_a_backup_error() -> plugup::Result<()> {
    let tmp = tempdir()?;
    let vault = BackupVault::new(PathGuard::new([tmp.path()])?);

    let err = vault.snapshot(tmp.path().join("absent")).unwrap_err();
    assert!(matches!(classify(&err), Some(Error::Backup(_))));
    Ok(())
}

#[test]
fn snapshot_outside_allow_list_is_refused() -> plugup::Result<()> {
    let allowed = tempdir()?;
    let other = tempdir()?;
    let plugin = plugin_tree(other.path());
    let vault = BackupVault::new(PathGuard::new([allowed.path()])?);

    let err = vault.snapshot(&plugin).unwrap_err();
    assert!(classify(&err).is_some_and(Error::is_security_violation));
    Ok(())
}

#[test]
fn custom_backup_parent_and_listing() -> plugup::Result<()> {
    let tmp = tempdir()?;
    let plugin = plugin_tree(tmp.path());
    let backups = tmp.path().join("backups");
    let vault = BackupVault::new(PathGuard::new([tmp.path()])?).with_backup_parent(&backups);

    let first = vault.snapshot(&plugin)?;
    let second = vault.snapshot(&plugin)?;
    assert!(first.backup_root.starts_with(backups.canonicalize()?));
    assert_ne!(first.id, second.id);

    let listed = vault.list(&plugin)?;
    let ids: Vec<_> = listed.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec![second.id.as_str(), first.id.as_str()]);
    assert_eq!(vault.load(&plugin, &first.id)?.id, first.id);
    assert!(vault.load(&plugin, "nope").is_err());
    Ok(())
}

#[test]
fn retention_keeps_newest_snapshots() -> plugup::Result<()> {
    let tmp = tempdir()?;
    let plugin = plugin_tree(tmp.path());
    let vault = BackupVault::new(PathGuard::new([tmp.path()])?);

    let first = vault.snapshot(&plugin)?;
    let second = vault.snapshot(&plugin)?;
    let third = vault.snapshot(&plugin)?;

    assert!(vault.prune(&plugin, &RetentionPolicy::KeepAll)?.is_empty());
    let removed = vault.prune(&plugin, &RetentionPolicy::KeepLast { count: 2 })?;
    assert_eq!(removed, vec![first.id.clone()]);
    assert!(!first.backup_root.exists());
    assert!(second.backup_root.exists() && third.backup_root.exists());

    // nothing in this test is a day old
    assert!(vault
        .prune(&plugin, &RetentionPolicy::MaxAge { seconds: 86_400 })?
        .is_empty());
    Ok(())
}

#[test]
fn restore_refuses_a_swapped_backup_directory() -> plugup::Result<()> {
    let tmp = tempdir()?;
    let plugin = plugin_tree(tmp.path());
    let vault = BackupVault::new(PathGuard::new([tmp.path()])?);
    let mut snapshot = vault.snapshot(&plugin)?;
    snapshot.id = "someone-else".into();

    let err = vault.restore(&snapshot, RestoreOptions::default()).unwrap_err();
    assert!(matches!(classify(&err), Some(Error::Backup(_))));
    Ok(())
}

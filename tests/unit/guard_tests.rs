use std::{fs, os::unix::fs::symlink, path::Path};

use plugup::{
    classify,
    guard::{validate_file_name, PathGuard},
    Error,
};
use proptest::prelude::*;
use tempfile::tempdir;

fn is_security(err: &anyhow::Error) -> bool {
    matches!(classify(err), Some(Error::SecurityViolation(_)))
}

fn is_validation(err: &anyhow::Error) -> bool {
    matches!(classify(err), Some(Error::Validation(_)))
}

#[test]
fn accepts_paths_inside_allow_list() -> plugup::Result<()> {
    let root = tempdir()?;
    fs::create_dir_all(root.path().join("plugin/agents"))?;
    let guard = PathGuard::new([root.path()])?;

    let managed = guard.validate(root.path().join("plugin/agents"))?;
    assert_eq!(managed.root(), root.path().canonicalize()?);
    assert_eq!(managed.relative_to_root(), Path::new("plugin/agents"));

    // not yet existing paths resolve through their deepest existing ancestor
    let future = guard.validate(root.path().join("plugin/new/file.md"))?;
    assert!(future.as_path().ends_with("plugin/new/file.md"));
    Ok(())
}

#[test]
fn rejects_traversal_without_touching_disk() -> plugup::Result<()> {
    let root = tempdir()?;
    let guard = PathGuard::new([root.path()])?;

    let err = guard
        .validate(root.path().join("plugin/../../etc/passwd"))
        .unwrap_err();
    assert!(is_security(&err));

    let base = guard.validate(root.path())?;
    let err = guard.validate_within(&base, "a/../../b").unwrap_err();
    assert!(is_security(&err));
    Ok(())
}

#[test]
fn rejects_symlink_escape() -> plugup::Result<()> {
    let allowed = tempdir()?;
    let outside = tempdir()?;
    fs::write(outside.path().join("secret.txt"), b"secret")?;
    symlink(outside.path(), allowed.path().join("escape"))?;

    let guard = PathGuard::new([allowed.path()])?;
    let err = guard
        .validate(allowed.path().join("escape/secret.txt"))
        .unwrap_err();
    assert!(is_security(&err));
    Ok(())
}

#[test]
fn dangling_symlink_is_resolved_through_its_target() -> plugup::Result<()> {
    let allowed = tempdir()?;
    let outside = tempdir()?;
    symlink(outside.path().join("created-outside"), allowed.path().join("link"))?;
    symlink(outside.path().join("missing-dir"), allowed.path().join("dir-link"))?;
    fs::create_dir_all(allowed.path().join("plugin"))?;
    symlink("../plugin/not-yet", allowed.path().join("plugin/inner-link"))?;

    let guard = PathGuard::new([allowed.path()])?;
    assert!(is_security(&guard.validate(allowed.path().join("link")).unwrap_err()));
    assert!(is_security(
        &guard.validate(allowed.path().join("dir-link/file.md")).unwrap_err()
    ));
    assert!(!outside.path().join("created-outside").exists());

    // a dangling link that stays inside the allow-list lands on its target
    let inner = guard.validate(allowed.path().join("plugin/inner-link"))?;
    assert_eq!(inner.as_path(), allowed.path().canonicalize()?.join("plugin/not-yet"));
    Ok(())
}

#[test]
fn symlink_loops_are_rejected() -> plugup::Result<()> {
    let allowed = tempdir()?;
    symlink(allowed.path().join("b"), allowed.path().join("a"))?;
    symlink(allowed.path().join("a"), allowed.path().join("b"))?;

    let guard = PathGuard::new([allowed.path()])?;
    assert!(guard.validate(allowed.path().join("a")).is_err());
    Ok(())
}

#[test]
fn entry_validation_does_not_follow_the_last_component() -> plugup::Result<()> {
    let allowed = tempdir()?;
    let outside = tempdir()?;
    fs::create_dir_all(allowed.path().join("plugin/agents"))?;
    symlink(outside.path().join("shared.txt"), allowed.path().join("plugin/agents/shared"))?;
    symlink(outside.path(), allowed.path().join("plugin/escape"))?;

    let guard = PathGuard::new([allowed.path()])?;
    let base = guard.validate(allowed.path().join("plugin"))?;
    let entry = guard.validate_entry_within(&base, "agents/shared")?;
    assert_eq!(
        entry.as_path(),
        allowed.path().canonicalize()?.join("plugin/agents/shared")
    );

    // parents are still resolved
    let err = guard.validate_entry_within(&base, "escape/file.txt").unwrap_err();
    assert!(is_security(&err));
    let err = guard.validate_entry_within(&base, "agents/../../x").unwrap_err();
    assert!(is_security(&err));
    Ok(())
}

#[test]
fn null_bytes_are_security_violations_and_control_chars_are_not() -> plugup::Result<()> {
    let root = tempdir()?;
    let guard = PathGuard::new([root.path()])?;

    let err = guard.validate(format!("{}/a\0b", root.path().display())).unwrap_err();
    assert!(is_security(&err));

    let err = guard.validate(format!("{}/a\u{7}b", root.path().display())).unwrap_err();
    assert!(is_validation(&err));
    Ok(())
}

#[test]
fn rejects_overlong_paths() -> plugup::Result<()> {
    let root = tempdir()?;
    let guard = PathGuard::new([root.path()])?;

    let long_name = "a".repeat(300);
    let err = guard.validate(root.path().join(long_name)).unwrap_err();
    assert!(is_validation(&err));

    let deep = (0..1000).map(|_| "abcd").collect::<Vec<_>>().join("/");
    let err = guard.validate(root.path().join(deep)).unwrap_err();
    assert!(is_validation(&err));
    Ok(())
}

#[test]
fn refuses_system_directories_as_roots_or_targets() -> plugup::Result<()> {
    let err = PathGuard::new(["/etc"]).unwrap_err();
    assert!(is_security(&err));
    let err = PathGuard::new(["/"]).unwrap_err();
    assert!(is_security(&err));

    let root = tempdir()?;
    let guard = PathGuard::new([root.path()])?;
    let err = guard.validate("/etc/passwd").unwrap_err();
    assert!(is_security(&err));
    Ok(())
}

#[test]
fn empty_or_missing_roots_are_validation_errors() {
    let err = PathGuard::new(Vec::<&Path>::new()).unwrap_err();
    assert!(is_validation(&err));

    let err = PathGuard::new(["/definitely/not/here/plugup"]).unwrap_err();
    assert!(is_validation(&err));
}

#[test]
fn validate_within_rejects_absolute_paths() -> plugup::Result<()> {
    let root = tempdir()?;
    let guard = PathGuard::new([root.path()])?;
    let base = guard.validate(root.path())?;

    let err = guard.validate_within(&base, "/tmp/x").unwrap_err();
    assert!(is_security(&err));
    Ok(())
}

#[test]
fn file_names_with_shell_metacharacters_are_rejected() {
    assert!(validate_file_name("plugin-name").is_ok());
    for bad in ["a;b", "a b", "$(x)", "a|b", "..", "a/b", ""] {
        let err = validate_file_name(bad).unwrap_err();
        assert!(is_validation(&err), "{bad:?} should be a validation error");
    }
    assert!(is_security(&validate_file_name("a\0b").unwrap_err()));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn any_parent_segment_is_rejected(
        prefix in prop::collection::vec("[a-z]{1,8}", 0..4),
        suffix in prop::collection::vec("[a-z]{1,8}", 0..4),
    ) {
        let root = tempdir().unwrap();
        let guard = PathGuard::new([root.path()]).unwrap();

        let mut path = root.path().to_path_buf();
        for seg in &prefix {
            path.push(seg);
        }
        path.push("..");
        for seg in &suffix {
            path.push(seg);
        }

        let err = guard.validate(&path).unwrap_err();
        prop_assert!(is_security(&err));
    }

    #[test]
    fn plain_relative_segments_stay_inside(
        segments in prop::collection::vec("[a-zA-Z0-9_-]{1,16}", 1..6),
    ) {
        let root = tempdir().unwrap();
        let guard = PathGuard::new([root.path()]).unwrap();
        let base = guard.validate(root.path()).unwrap();

        let relative = segments.join("/");
        let managed = guard.validate_within(&base, &relative).unwrap();
        prop_assert!(managed.as_path().starts_with(base.as_path()));
    }
}

use std::{fs, os::unix::fs::PermissionsExt, path::PathBuf};

use plugup::{
    backup::BackupVault,
    classify,
    guard::PathGuard,
    retrofit::{
        state_file_name, FileOrigin, Phase, PhaseExecutor, PhaseOutcome, PristineRegistry, RetrofitState,
        RetrofitStateMachine, CORRUPT_STATE_SUFFIX,
    },
    Error,
};
use serde_json::json;
use tempfile::{tempdir, TempDir};

fn setup() -> plugup::Result<(TempDir, PathGuard, PathBuf)> {
    let tmp = tempdir()?;
    let target = tmp.path().join("plugin");
    fs::create_dir_all(target.join("agents"))?;
    fs::write(target.join("agents/a.md"), "a")?;
    let guard = PathGuard::new([tmp.path()])?;
    Ok((tmp, guard, target))
}

fn is_state_error(err: &anyhow::Error) -> bool {
    matches!(classify(err), Some(Error::State(_)))
}

#[test]
fn fresh_state_is_persisted_privately_next_to_target() -> plugup::Result<()> {
    let (tmp, guard, target) = setup()?;
    let machine = RetrofitStateMachine::open(&guard, &target)?;

    assert_eq!(machine.state().current_phase, Phase::NotStarted);
    assert_eq!(
        machine.state_path(),
        tmp.path().canonicalize()?.join(".plugin.retrofit-state.json")
    );
    let mode = fs::metadata(machine.state_path())?.permissions().mode() & 0o777;
    assert_eq!(mode, 0o600);
    assert_eq!(state_file_name("plugin")?, ".plugin.retrofit-state.json");
    assert!(state_file_name("bad name").is_err());
    Ok(())
}

#[test]
fn phases_require_their_prerequisites() -> plugup::Result<()> {
    let (_tmp, guard, target) = setup()?;
    let mut machine = RetrofitStateMachine::open(&guard, &target)?;

    let err = machine.execute_phase(Phase::Plan, |_| Ok(json!({}))).unwrap_err();
    assert!(is_state_error(&err));
    assert!(is_state_error(&machine.complete_phase(Phase::Verify).unwrap_err()));
    assert!(is_state_error(&machine.check_prerequisites(Phase::NotStarted).unwrap_err()));

    machine.execute_phase(Phase::Analyze, |_| Ok(json!({ "files": 1 })))?;
    machine.execute_phase(Phase::Assess, |_| Ok(json!({})))?;
    machine.execute_phase(Phase::Plan, |_| Ok(json!({})))?;

    // EXECUTE also needs a recorded backup
    let err = machine.execute_phase(Phase::Execute, |_| Ok(json!({}))).unwrap_err();
    assert!(is_state_error(&err));
    assert_eq!(machine.state().current_phase, Phase::Execute);
    Ok(())
}

#[test]
fn completing_a_phase_twice_changes_nothing() -> plugup::Result<()> {
    let (_tmp, guard, target) = setup()?;
    let mut machine = RetrofitStateMachine::open(&guard, &target)?;

    assert!(machine.complete_phase(Phase::Analyze)?);
    let after_first = fs::read(machine.state_path())?;
    let state_after_first = machine.state().clone();

    assert!(!machine.complete_phase(Phase::Analyze)?);
    assert_eq!(machine.state(), &state_after_first);
    assert_eq!(fs::read(machine.state_path())?, after_first);
    assert_eq!(machine.state().current_phase, Phase::Assess);
    Ok(())
}

#[test]
fn completed_phases_are_not_repeated_after_reopen() -> plugup::Result<()> {
    let (_tmp, guard, target) = setup()?;
    {
        let mut machine = RetrofitStateMachine::open(&guard, &target)?;
        machine.execute_phase(Phase::Analyze, |_| Ok(json!({ "pass": 1 })))?;
    }

    let mut machine = RetrofitStateMachine::open(&guard, &target)?;
    assert_eq!(machine.artifact(Phase::Analyze), Some(&json!({ "pass": 1 })));
    let outcome = machine.execute_phase(Phase::Analyze, |_| panic!("must not rerun"))?;
    assert_eq!(outcome, PhaseOutcome::AlreadyComplete);

    // the next phase sees earlier artifacts
    machine.execute_phase(Phase::Assess, |state| {
        assert_eq!(state.artifacts[&Phase::Analyze], json!({ "pass": 1 }));
        Ok(json!({}))
    })?;
    assert_eq!(machine.get_status().progress_percent, 40.0);
    Ok(())
}

#[test]
fn corrupt_state_is_archived_and_reinitialized() -> plugup::Result<()> {
    let (tmp, guard, target) = setup()?;
    let state_path = tmp.path().join(".plugin.retrofit-state.json");
    fs::write(&state_path, "{ this is not json")?;

    let machine = RetrofitStateMachine::open(&guard, &target)?;
    assert_eq!(machine.state().current_phase, Phase::NotStarted);
    assert!(machine.state().completed_phases.is_empty());

    let archived = tmp
        .path()
        .join(format!(".plugin.retrofit-state.json{CORRUPT_STATE_SUFFIX}"));
    assert_eq!(fs::read_to_string(&archived)?, "{ this is not json");
    assert!(machine.recovered_from().is_some());

    // a second corruption does not clobber the first archive
    fs::write(&state_path, "[]")?;
    let machine = RetrofitStateMachine::open(&guard, &target)?;
    assert!(machine.recovered_from().is_some_and(|p| p != archived.as_path()));
    assert_eq!(fs::read_to_string(&archived)?, "{ this is not json");
    Ok(())
}

#[test]
fn state_breaking_phase_order_is_treated_as_corrupt() -> plugup::Result<()> {
    let (tmp, guard, target) = setup()?;
    let mut state = RetrofitState::fresh();
    state.completed_phases.insert(Phase::Verify);
    state.current_phase = Phase::Complete;
    let state_path = tmp.path().join(".plugin.retrofit-state.json");
    fs::write(&state_path, serde_json::to_vec(&state)?)?;

    let machine = RetrofitStateMachine::open(&guard, &target)?;
    assert_eq!(machine.state().current_phase, Phase::NotStarted);
    assert!(machine.recovered_from().is_some());
    Ok(())
}

struct Recorder {
    ran: Vec<Phase>,
}

impl PhaseExecutor for Recorder {
    fn run(&mut self, phase: Phase, _state: &RetrofitState) -> plugup::Result<serde_json::Value> {
        self.ran.push(phase);
        Ok(json!({ "phase": phase.as_str() }))
    }
}

#[test]
fn run_remaining_drives_all_outstanding_phases() -> plugup::Result<()> {
    let (_tmp, guard, target) = setup()?;
    let vault = BackupVault::new(guard.clone());
    let mut machine = RetrofitStateMachine::open(&guard, &target)?;
    machine.execute_phase(Phase::Analyze, |_| Ok(json!({})))?;

    let snapshot = machine.ensure_backup(&vault)?.expect("first backup is taken");
    assert!(machine.ensure_backup(&vault)?.is_none());
    assert_eq!(machine.recorded_backup()?.map(|s| s.id), Some(snapshot.id));

    let mut recorder = Recorder { ran: Vec::new() };
    let status = machine.run_remaining(&mut recorder)?;
    assert_eq!(recorder.ran, vec![Phase::Assess, Phase::Plan, Phase::Execute, Phase::Verify]);
    assert_eq!(status.progress_percent, 100.0);
    assert_eq!(status.current_phase, Phase::Complete);
    assert!(status.remaining_phases.is_empty());
    assert!(machine.is_finished());

    machine.reset()?;
    assert_eq!(machine.state().current_phase, Phase::NotStarted);
    assert!(machine.state().backup_path.is_some());
    machine.forget_backup()?;
    assert!(machine.state().backup_path.is_none());
    Ok(())
}

#[test]
fn registry_classifies_files() -> plugup::Result<()> {
    let (_tmp, guard, target) = setup()?;
    let registry = PristineRegistry::from_tree(&guard, &target)?;
    assert_eq!(registry.len(), 1);

    let pristine = registry.hash_of("agents/a.md").unwrap().to_string();
    assert_eq!(registry.classify("agents/a.md", &pristine), FileOrigin::Pristine);
    assert_eq!(registry.classify("agents/a.md", "0000"), FileOrigin::Modified);
    assert_eq!(registry.classify("agents/new.md", &pristine), FileOrigin::UserAdded);

    let vault = BackupVault::new(guard.clone());
    let snapshot = vault.snapshot(&target)?;
    assert_eq!(PristineRegistry::from_snapshot(&snapshot), registry);
    Ok(())
}

//! Session lifecycle tests, run against shell-script stand-ins for the
//! display server: the script creates the lock file on startup and removes
//! it on SIGTERM, exactly the observable contract Xvfb provides.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::common::SupervisorError;

use super::*;

/// Writes an executable script that behaves like a display server for one
/// lock path: announce via the lock file, hold it until SIGTERM.
fn fake_display_script(dir: &Path, lock_path: &Path) -> PathBuf {
    let script = dir.join("fake-display.sh");
    let body = format!(
        "#!/bin/sh\n\
         touch \"{lock}\"\n\
         trap 'rm -f \"{lock}\"; exit 0' TERM INT\n\
         sleep 600 &\n\
         wait $!\n\
         rm -f \"{lock}\"\n",
        lock = lock_path.display()
    );
    fs::write(&script, body).unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    script
}

fn config_for(display_number: u32, lock_dir: &Path, command: &Path) -> SessionConfig {
    SessionConfig {
        display_number,
        geometry: Geometry::new(640, 480, 24),
        command: command.display().to_string(),
        extra_args: Vec::new(),
        lock_dir: lock_dir.display().to_string(),
        startup_timeout: Duration::from_secs(5),
        teardown_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(10),
        silent: true,
        export_display: false,
    }
}

fn process_exists(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[test]
fn start_and_stop_drive_the_full_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let lock_path = LockFileProbe::lock_path(dir.path().to_str().unwrap(), 101);
    let script = fake_display_script(dir.path(), &lock_path);
    let session = DisplaySession::new(config_for(101, dir.path(), &script));

    assert_eq!(session.state(), SessionState::Stopped);
    session.start().unwrap();
    assert_eq!(session.state(), SessionState::Running);
    assert!(session.is_running());
    assert!(lock_path.exists());
    let display_pid = session.display_pid().unwrap();
    assert!(process_exists(display_pid));

    session.stop().unwrap();
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(!lock_path.exists());
    assert!(!process_exists(display_pid));
    assert!(session.display_pid().is_none());

    // Stopping an already stopped session is a no-op
    session.stop().unwrap();
}

#[test]
fn start_with_existing_lock_file_fails_without_spawning() {
    let dir = tempfile::tempdir().unwrap();
    let lock_path = LockFileProbe::lock_path(dir.path().to_str().unwrap(), 102);
    fs::File::create(&lock_path).unwrap();

    // A display command that records whether it ever ran
    let marker = dir.path().join("spawned.marker");
    let script = dir.path().join("marking-display.sh");
    fs::write(&script, format!("#!/bin/sh\ntouch \"{}\"\n", marker.display())).unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

    let session = DisplaySession::new(config_for(102, dir.path(), &script));
    let result = session.start();
    assert!(matches!(result, Err(SupervisorError::DuplicateSession(_))));
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(!marker.exists());
}

#[test]
fn startup_timeout_kills_the_partially_spawned_process() {
    let dir = tempfile::tempdir().unwrap();

    // A display command that never creates its lock file
    let pid_file = dir.path().join("display.pid");
    let script = dir.path().join("mute-display.sh");
    fs::write(
        &script,
        format!(
            "#!/bin/sh\necho $$ > \"{}\"\nsleep 600 &\nwait $!\n",
            pid_file.display()
        ),
    )
    .unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

    let mut config = config_for(103, dir.path(), &script);
    config.startup_timeout = Duration::from_millis(100);
    let session = DisplaySession::new(config);

    let result = session.start();
    assert!(matches!(result, Err(SupervisorError::StartupTimeout(_))));
    assert_eq!(session.state(), SessionState::Stopped);

    // The partial spawn must not leak a dangling process
    let pid: u32 = fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
    assert!(!process_exists(pid));
}

#[test]
fn spawn_failure_restores_state_and_surfaces_the_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("no-such-display-server");
    let session = DisplaySession::new(config_for(104, dir.path(), &missing));

    let result = session.start();
    assert!(matches!(result, Err(SupervisorError::SpawnFailure(_))));
    assert_eq!(session.state(), SessionState::Stopped);
}

#[test]
fn add_dependent_is_rejected_unless_running() {
    let dir = tempfile::tempdir().unwrap();
    let lock_path = LockFileProbe::lock_path(dir.path().to_str().unwrap(), 105);
    let script = fake_display_script(dir.path(), &lock_path);
    let session = DisplaySession::new(config_for(105, dir.path(), &script));

    // Before start
    let before = session.add_dependent("sleep", &["600".to_string()]);
    assert!(matches!(before, Err(SupervisorError::InvalidState(_))));

    session.start().unwrap();
    let dependent = session.add_dependent("sleep", &["600".to_string()]).unwrap();
    assert!(dependent.is_running());
    session.stop().unwrap();
    assert_eq!(dependent.state(), ProcessState::Exited);

    // After stop
    let after = session.add_dependent("sleep", &["600".to_string()]);
    assert!(matches!(after, Err(SupervisorError::InvalidState(_))));
}

#[test]
fn stop_stops_dependents_strictly_before_the_display() {
    let dir = tempfile::tempdir().unwrap();
    let lock_path = LockFileProbe::lock_path(dir.path().to_str().unwrap(), 106);
    let script = fake_display_script(dir.path(), &lock_path);
    let session = DisplaySession::new(config_for(106, dir.path(), &script));
    session.start().unwrap();
    let display_pid = session.display_pid().unwrap();

    // Each dependent records, at the moment its completion fires, whether
    // the display process was still alive
    let observations: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..2 {
        let observations = observations.clone();
        session
            .add_dependent_with_env(
                "sleep",
                &["600".to_string()],
                Vec::new(),
                Some(Box::new(move |_outcome| {
                    observations.lock().unwrap().push(process_exists(display_pid));
                })),
            )
            .unwrap();
    }

    session.stop().unwrap();

    let observations = observations.lock().unwrap();
    assert_eq!(observations.len(), 2);
    assert!(
        observations.iter().all(|display_alive| *display_alive),
        "display process was stopped before a dependent"
    );
    assert!(!process_exists(display_pid));
}

#[test]
fn unsolicited_display_exit_tears_down_and_notifies_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let lock_path = LockFileProbe::lock_path(dir.path().to_str().unwrap(), 107);
    let script = fake_display_script(dir.path(), &lock_path);
    let session = DisplaySession::new(config_for(107, dir.path(), &script));
    session.start().unwrap();

    let first = session.add_dependent("sleep", &["600".to_string()]).unwrap();
    let second = session.add_dependent("sleep", &["600".to_string()]).unwrap();

    let (sender, receiver) = mpsc::channel();
    session.on_unsolicited_exit(move |display_number| {
        sender.send(display_number).unwrap();
    });

    // The display server dies out from under the session
    let display_pid = session.display_pid().unwrap();
    kill(Pid::from_raw(display_pid as i32), Signal::SIGTERM).unwrap();

    let notified = receiver.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(notified, 107);
    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(first.state(), ProcessState::Exited);
    assert_eq!(second.state(), ProcessState::Exited);
    assert!(!lock_path.exists());

    // Exactly one notification
    assert!(receiver.recv_timeout(Duration::from_millis(300)).is_err());
}

#[test]
fn concurrent_sessions_keep_their_display_overlays_apart() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let lock_a = LockFileProbe::lock_path(dir_a.path().to_str().unwrap(), 108);
    let lock_b = LockFileProbe::lock_path(dir_b.path().to_str().unwrap(), 109);
    let session_a = DisplaySession::new(config_for(
        108,
        dir_a.path(),
        &fake_display_script(dir_a.path(), &lock_a),
    ));
    let session_b = DisplaySession::new(config_for(
        109,
        dir_b.path(),
        &fake_display_script(dir_b.path(), &lock_b),
    ));

    let start_a = {
        let session = session_a.clone();
        thread::spawn(move || session.start())
    };
    let start_b = {
        let session = session_b.clone();
        thread::spawn(move || session.start())
    };
    start_a.join().unwrap().unwrap();
    start_b.join().unwrap().unwrap();

    // Each session's dependent sees exactly its own display target
    let out_a = dir_a.path().join("display.txt");
    let out_b = dir_b.path().join("display.txt");
    for (session, out) in [(&session_a, &out_a), (&session_b, &out_b)] {
        let (sender, receiver) = mpsc::channel();
        session
            .add_dependent_with_env(
                "sh",
                &[
                    "-c".to_string(),
                    format!("printf %s \"$DISPLAY\" > \"{}\"", out.display()),
                ],
                Vec::new(),
                Some(Box::new(move |_outcome| {
                    let _ = sender.send(());
                })),
            )
            .unwrap();
        receiver.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    assert_eq!(fs::read_to_string(&out_a).unwrap(), ":108");
    assert_eq!(fs::read_to_string(&out_b).unwrap(), ":109");

    session_a.stop().unwrap();
    session_b.stop().unwrap();
}

#[test]
fn exported_display_round_trips_across_start_and_stop() {
    let dir = tempfile::tempdir().unwrap();
    let lock_path = LockFileProbe::lock_path(dir.path().to_str().unwrap(), 110);
    let script = fake_display_script(dir.path(), &lock_path);
    let mut config = config_for(110, dir.path(), &script);
    config.export_display = true;
    let session = DisplaySession::new(config);

    std::env::set_var("DISPLAY", ":0");

    session.start().unwrap();
    assert_eq!(std::env::var("DISPLAY").unwrap(), ":110");

    session.stop().unwrap();
    assert_eq!(std::env::var("DISPLAY").unwrap(), ":0");
}

#[test]
fn registry_rejects_duplicate_display_numbers() {
    let dir = tempfile::tempdir().unwrap();
    let lock_path = LockFileProbe::lock_path(dir.path().to_str().unwrap(), 111);
    let script = fake_display_script(dir.path(), &lock_path);
    let registry = SessionRegistry::new();

    let session = registry.acquire(config_for(111, dir.path(), &script)).unwrap();
    session.start().unwrap();
    assert_eq!(registry.active_count(), 1);

    let duplicate = registry.acquire(config_for(111, dir.path(), &script));
    assert!(matches!(duplicate, Err(SupervisorError::DuplicateSession(_))));

    // Release is refused while the session is running
    assert!(matches!(
        registry.release(111),
        Err(SupervisorError::InvalidState(_))
    ));

    session.stop().unwrap();
    registry.release(111).unwrap();
    assert!(registry.get(111).is_none());

    // The number is available again
    let reacquired = registry.acquire(config_for(111, dir.path(), &script)).unwrap();
    reacquired.start().unwrap();
    reacquired.stop().unwrap();
    registry.release(111).unwrap();
}

#[test]
fn registry_force_clear_recovers_a_live_session() {
    let dir = tempfile::tempdir().unwrap();
    let lock_path = LockFileProbe::lock_path(dir.path().to_str().unwrap(), 112);
    let script = fake_display_script(dir.path(), &lock_path);
    let registry = SessionRegistry::new();

    let session = registry.acquire(config_for(112, dir.path(), &script)).unwrap();
    session.start().unwrap();
    let display_pid = session.display_pid().unwrap();

    registry.force_clear(112);
    assert!(registry.get(112).is_none());
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(!process_exists(display_pid));
}

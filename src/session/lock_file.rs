use std::fmt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

/// Minimum cadence at which the probe will touch the filesystem.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Error returned when the probed path does not reach the expected state
/// within the allowed window.
#[derive(Debug)]
pub struct ProbeTimeout {
    pub path: PathBuf,
    pub present: bool,
    pub timeout: Duration,
}

impl fmt::Display for ProbeTimeout {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "lock file {} did not become {} within {}ms",
            self.path.display(),
            if self.present { "present" } else { "absent" },
            self.timeout.as_millis()
        )
    }
}

impl std::error::Error for ProbeTimeout {}

/// The `LockFileProbe` struct polls a filesystem path until it appears or
/// disappears. The display server announces itself only through its lock
/// file, so this probe is the sole readiness and teardown signal the
/// supervisor has: there is no IPC handshake with Xvfb.
#[derive(Clone, Copy)]
pub struct LockFileProbe {
    poll_interval: Duration,
}

impl LockFileProbe {
    /// Creates a new `LockFileProbe` with the given poll cadence, clamped to
    /// a 10ms minimum so a misconfigured interval cannot hot-loop.
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
        }
    }

    /// Returns the conventional lock file path for a display number, e.g.
    /// `/tmp/.X99-lock`.
    pub fn lock_path(lock_dir: &str, display_number: u32) -> PathBuf {
        PathBuf::from(lock_dir).join(format!(".X{}-lock", display_number))
    }

    /// Polls `path` until its existence matches `present`, sleeping one poll
    /// interval between checks.
    ///
    /// Returns `ProbeTimeout` once the elapsed time reaches `timeout`; the
    /// failure therefore lands no sooner than `timeout` and no later than
    /// `timeout` plus one poll interval.
    pub fn wait_for(&self, path: &Path, present: bool, timeout: Duration) -> Result<(), ProbeTimeout> {
        let started = Instant::now();
        loop {
            if path.exists() == present {
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(ProbeTimeout {
                    path: path.to_path_buf(),
                    present,
                    timeout,
                });
            }
            thread::sleep(self.poll_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;

    #[test]
    fn lock_path_follows_the_x_convention() {
        assert_eq!(
            LockFileProbe::lock_path("/tmp", 7),
            PathBuf::from("/tmp/.X7-lock")
        );
    }

    #[test]
    fn missing_path_times_out_within_one_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".X50-lock");
        let probe = LockFileProbe::new(Duration::from_millis(10));

        let started = Instant::now();
        let result = probe.wait_for(&path, true, Duration::from_millis(50));
        let elapsed = started.elapsed();

        assert!(result.is_err());
        assert!(elapsed >= Duration::from_millis(50));
        // One poll interval of slack, plus generous scheduling headroom
        assert!(elapsed < Duration::from_millis(250));
    }

    #[test]
    fn appearing_path_resolves_before_the_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".X51-lock");
        let probe = LockFileProbe::new(Duration::from_millis(10));

        let create_path = path.clone();
        let creator = thread::spawn(move || {
            thread::sleep(Duration::from_millis(40));
            File::create(create_path).unwrap();
        });

        let result = probe.wait_for(&path, true, Duration::from_secs(2));
        creator.join().unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn present_path_with_present_expectation_returns_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".X52-lock");
        File::create(&path).unwrap();
        let probe = LockFileProbe::new(Duration::from_millis(10));

        assert!(probe.wait_for(&path, true, Duration::from_millis(50)).is_ok());

        std::fs::remove_file(&path).unwrap();
        assert!(probe.wait_for(&path, false, Duration::from_millis(50)).is_ok());
    }

    #[test]
    fn interval_is_clamped_to_the_minimum() {
        let probe = LockFileProbe::new(Duration::from_millis(0));
        assert_eq!(probe.poll_interval, MIN_POLL_INTERVAL);
    }
}

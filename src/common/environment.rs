use std::collections::HashMap;
use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::common::{Result, SupervisorError};

/// The `EnvironmentSnapshot` struct captures the values a group of environment
/// variables held immediately before a mutation, in mutation order. Restoring
/// it writes those exact values back (unsetting variables that were absent).
#[derive(Debug)]
pub struct EnvironmentSnapshot {
    id: u64,
    entries: Vec<(String, Option<String>)>,
}

impl EnvironmentSnapshot {
    /// Returns the captured `(name, previous value)` pairs in mutation order.
    pub fn entries(&self) -> &[(String, Option<String>)] {
        &self.entries
    }
}

/// Outstanding snapshot ids per variable. The top of each stack is the
/// snapshot that must be restored next for that variable.
struct Register {
    stacks: HashMap<String, Vec<u64>>,
}

static REGISTER: OnceLock<Mutex<Register>> = OnceLock::new();
static NEXT_SNAPSHOT_ID: AtomicU64 = AtomicU64::new(1);

fn register() -> &'static Mutex<Register> {
    REGISTER.get_or_init(|| {
        Mutex::new(Register {
            stacks: HashMap::new(),
        })
    })
}

/// The `EnvironmentContext` struct is the single gate through which the
/// supervisor mutates its own process-wide environment. The environment is one
/// global table shared by every session, so every `set`/`restore` pair is
/// serialized through a process-wide mutex and restorations are checked for
/// stack discipline: each variable must be restored in reverse order of the
/// mutations that touched it.
///
/// Subprocess environments never go through here; they are explicit overlays
/// handed to the spawn call. The gate exists for the one remaining ambient
/// use: exporting `DISPLAY` so same-process collaborators (the capture
/// pipeline) see the active display.
pub struct EnvironmentContext;

impl EnvironmentContext {
    /// Atomically captures the prior values of `vars` and applies the new
    /// ones, returning the snapshot required to undo the mutation.
    pub fn set(vars: &[(&str, &str)]) -> Result<EnvironmentSnapshot> {
        let mut guard = register().lock().unwrap();

        let id = NEXT_SNAPSHOT_ID.fetch_add(1, Ordering::Relaxed);
        let mut entries = Vec::with_capacity(vars.len());
        for (name, value) in vars {
            entries.push((name.to_string(), env::var(name).ok()));
            env::set_var(name, value);
            guard.stacks.entry(name.to_string()).or_default().push(id);
        }

        Ok(EnvironmentSnapshot { id, entries })
    }

    /// Writes back exactly the values captured in `snapshot`, in reverse
    /// order of the mutations that created it.
    ///
    /// Fails with `RestoreInconsistency`, without touching anything, if any
    /// variable in the snapshot has been mutated again since and not yet
    /// restored. That indicates a broken save/restore pairing somewhere in
    /// the supervisor and is logged loudly rather than silently papered over.
    pub fn restore(snapshot: EnvironmentSnapshot) -> Result<()> {
        let mut guard = register().lock().unwrap();

        // Validate the whole snapshot before mutating anything
        for (name, _) in &snapshot.entries {
            let top = guard.stacks.get(name).and_then(|stack| stack.last());
            if top != Some(&snapshot.id) {
                error!(
                    "Out-of-order environment restore for variable {}: snapshot {} is not the most recent mutation",
                    name, snapshot.id
                );
                return Err(SupervisorError::RestoreInconsistency(format!(
                    "variable {} was mutated after snapshot {} was taken",
                    name, snapshot.id
                )));
            }
        }

        for (name, previous) in snapshot.entries.iter().rev() {
            match previous {
                Some(value) => env::set_var(name, value),
                None => env::remove_var(name),
            }
            if let Some(stack) = guard.stacks.get_mut(name) {
                stack.pop();
                if stack.is_empty() {
                    guard.stacks.remove(name);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The process environment is global, so each test uses variable names
    // no other test touches.

    #[test]
    fn set_then_restore_round_trips() {
        env::set_var("XVFB_SUP_TEST_RT_A", "before");
        env::remove_var("XVFB_SUP_TEST_RT_B");

        let snapshot = EnvironmentContext::set(&[
            ("XVFB_SUP_TEST_RT_A", "after"),
            ("XVFB_SUP_TEST_RT_B", "created"),
        ])
        .unwrap();

        assert_eq!(env::var("XVFB_SUP_TEST_RT_A").unwrap(), "after");
        assert_eq!(env::var("XVFB_SUP_TEST_RT_B").unwrap(), "created");

        EnvironmentContext::restore(snapshot).unwrap();

        assert_eq!(env::var("XVFB_SUP_TEST_RT_A").unwrap(), "before");
        assert!(env::var("XVFB_SUP_TEST_RT_B").is_err());
    }

    #[test]
    fn nested_snapshots_restore_in_reverse_order() {
        env::set_var("XVFB_SUP_TEST_NEST", "original");

        let outer = EnvironmentContext::set(&[("XVFB_SUP_TEST_NEST", "outer")]).unwrap();
        let inner = EnvironmentContext::set(&[("XVFB_SUP_TEST_NEST", "inner")]).unwrap();

        EnvironmentContext::restore(inner).unwrap();
        assert_eq!(env::var("XVFB_SUP_TEST_NEST").unwrap(), "outer");

        EnvironmentContext::restore(outer).unwrap();
        assert_eq!(env::var("XVFB_SUP_TEST_NEST").unwrap(), "original");
    }

    #[test]
    fn out_of_order_restore_is_rejected() {
        env::set_var("XVFB_SUP_TEST_OOO", "original");

        let first = EnvironmentContext::set(&[("XVFB_SUP_TEST_OOO", "first")]).unwrap();
        let second = EnvironmentContext::set(&[("XVFB_SUP_TEST_OOO", "second")]).unwrap();

        let result = EnvironmentContext::restore(first);
        assert!(matches!(
            result,
            Err(SupervisorError::RestoreInconsistency(_))
        ));
        // A rejected restore must not have touched the register
        assert_eq!(env::var("XVFB_SUP_TEST_OOO").unwrap(), "second");

        EnvironmentContext::restore(second).unwrap();
        assert_eq!(env::var("XVFB_SUP_TEST_OOO").unwrap(), "first");
    }
}

//! Freezer cgroup state transitions.
//!
//! Writing `freezer.state` is asynchronous: the kernel may report
//! FREEZING for a while before settling. After a write the state knob is
//! polled until its first token equals the requested state or the wait
//! budget runs out.

use std::time::Duration;

use porto_error::{PortoError, Result};

use crate::Cgroup;

/// Total budget for one freezer transition.
pub const FREEZER_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
/// Poll cadence for `freezer.state`.
const FREEZER_POLL_DELAY: Duration = Duration::from_millis(100);

const STATE_KNOB: &str = "freezer.state";

/// Freezes every task in the cgroup and waits for FROZEN.
///
/// # Errors
///
/// Returns an error if the knob write fails or the state is not reached
/// within the wait budget.
pub async fn freeze(cg: &Cgroup) -> Result<()> {
    cg.set_knob(STATE_KNOB, "FROZEN")?;
    wait_state(cg, "FROZEN").await
}

/// Thaws the cgroup and waits for THAWED.
///
/// # Errors
///
/// Returns an error if the knob write fails or the state is not reached
/// within the wait budget.
pub async fn thaw(cg: &Cgroup) -> Result<()> {
    cg.set_knob(STATE_KNOB, "THAWED")?;
    wait_state(cg, "THAWED").await
}

/// Polls `freezer.state` until its first token equals `state`.
///
/// The knob is multi-line on some kernels; only the first token of the
/// first line is compared.
async fn wait_state(cg: &Cgroup, state: &str) -> Result<()> {
    let deadline = tokio::time::Instant::now() + FREEZER_WAIT_TIMEOUT;

    loop {
        match cg.knob(STATE_KNOB) {
            Ok(raw) => {
                let current = raw.split_whitespace().next().unwrap_or("");
                if current == state {
                    return Ok(());
                }
            }
            Err(e) => tracing::warn!(path = %cg.path().display(), "can't read freezer state: {e}"),
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(PortoError::unknown(format!(
                "can't wait for freezer state {state} on {}",
                cg.path().display()
            )));
        }
        tokio::time::sleep(FREEZER_POLL_DELAY).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SubsystemKind;
    use tempfile::TempDir;

    fn freezer_cgroup(dir: &TempDir) -> Cgroup {
        let cg = Cgroup::new(SubsystemKind::Freezer, dir.path().join("porto/f"));
        cg.create().unwrap();
        cg
    }

    #[tokio::test]
    async fn freeze_succeeds_once_state_settles() {
        let dir = TempDir::new().unwrap();
        let cg = freezer_cgroup(&dir);

        // A plain file echoes the written value back, which is exactly
        // the settled case.
        freeze(&cg).await.unwrap();
        assert_eq!(cg.knob("freezer.state").unwrap(), "FROZEN");

        thaw(&cg).await.unwrap();
        assert_eq!(cg.knob("freezer.state").unwrap(), "THAWED");
    }

    #[tokio::test]
    async fn wait_compares_first_token_only() {
        let dir = TempDir::new().unwrap();
        let cg = freezer_cgroup(&dir);
        cg.set_knob("freezer.state", "FROZEN\nparent FREEZING\n")
            .unwrap();

        wait_state(&cg, "FROZEN").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_on_stuck_state() {
        let dir = TempDir::new().unwrap();
        let cg = freezer_cgroup(&dir);
        cg.set_knob("freezer.state", "FREEZING").unwrap();

        let err = wait_state(&cg, "FROZEN").await.unwrap_err();
        assert!(err.message.contains("freezer state FROZEN"));
    }
}

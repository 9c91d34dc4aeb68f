use anyhow::Result;
use tracing::{debug, info};

use crate::retry::{Clock, RetryPolicy};
use crate::server::{LocateState, ServerHandle};
use crate::sys::{ProcessInfo, ProcessQuery};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocateOutcome {
    Resolved(u32),
    /// Nobody matched within the attempt ceiling. A normal answer.
    Absent,
}

/// Pins down the live server process by image name, retrying while the
/// process is expected to exist. Absence is reported as an outcome, never an
/// error; only genuine query failures escalate.
pub fn locate(
    handle: &mut ServerHandle,
    query: &mut dyn ProcessQuery,
    clock: &dyn Clock,
    record_counter_instance: bool,
) -> Result<LocateOutcome> {
    handle.locate_state = LocateState::Resolving;
    let policy = RetryPolicy::for_expectation(handle.expected_to_be_running);

    let mut failure: Option<anyhow::Error> = None;
    let found = policy.run(clock, |attempt| {
        match try_once(handle, query, attempt) {
            Ok(candidate) => candidate,
            Err(err) => {
                failure = Some(err);
                // Poison value so the retry loop stops immediately.
                Some(ProcessInfo {
                    pid: 0,
                    exe_dir: None,
                })
            }
        }
    });
    if let Some(err) = failure {
        handle.locate_state = LocateState::Unresolved;
        return Err(err);
    }

    match found {
        Some(candidate) => {
            handle.mark_resolved(candidate.pid);
            if record_counter_instance {
                handle.counter_instance = query.counter_instance(candidate.pid)?;
            }
            info!(
                "resolved server process {} to pid {}",
                handle.executable, candidate.pid
            );
            Ok(LocateOutcome::Resolved(candidate.pid))
        }
        None => {
            handle.mark_absent();
            debug!("no process matched {}", handle.executable);
            Ok(LocateOutcome::Absent)
        }
    }
}

fn try_once(
    handle: &ServerHandle,
    query: &mut dyn ProcessQuery,
    attempt: u32,
) -> Result<Option<ProcessInfo>> {
    let matches = query.processes_matching(&handle.executable)?;
    if matches.is_empty() {
        debug!(
            "attempt {attempt}: no process matched {}",
            handle.executable
        );
        return Ok(None);
    }

    if matches.len() == 1 {
        return Ok(matches.into_iter().next());
    }

    if !query.path_disambiguation() {
        // The platform cannot tell the candidates apart; take the first.
        return Ok(matches.into_iter().next());
    }

    Ok(matches
        .into_iter()
        .find(|info| info.exe_dir.as_deref() == Some(handle.install_path.as_path())))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::time::Duration;

    use anyhow::Result;

    use super::{locate, LocateOutcome};
    use crate::retry::testing::ManualClock;
    use crate::server::{LocateState, ServerHandle};
    use crate::sys::{ProcessInfo, ProcessQuery};

    struct ScriptedQuery {
        /// One entry per attempt; repeats the last entry when exhausted.
        responses: VecDeque<Vec<ProcessInfo>>,
        attempts: u32,
        path_capable: bool,
        counter_token: Option<String>,
    }

    impl ScriptedQuery {
        fn new(responses: Vec<Vec<ProcessInfo>>) -> Self {
            Self {
                responses: responses.into(),
                attempts: 0,
                path_capable: true,
                counter_token: None,
            }
        }
    }

    impl ProcessQuery for ScriptedQuery {
        fn processes_matching(&mut self, _executable: &str) -> Result<Vec<ProcessInfo>> {
            self.attempts += 1;
            match self.responses.len() {
                0 => Ok(Vec::new()),
                1 => Ok(self.responses[0].clone()),
                _ => Ok(self.responses.pop_front().unwrap_or_default()),
            }
        }

        fn path_disambiguation(&self) -> bool {
            self.path_capable
        }

        fn counter_instance(&mut self, _pid: u32) -> Result<Option<String>> {
            Ok(self.counter_token.clone())
        }
    }

    fn info(pid: u32, dir: Option<&str>) -> ProcessInfo {
        ProcessInfo {
            pid,
            exe_dir: dir.map(PathBuf::from),
        }
    }

    fn expected_handle() -> ServerHandle {
        let mut handle = ServerHandle::new("PalServer", "/srv/pal");
        handle.expected_to_be_running = true;
        handle
    }

    #[test]
    fn absent_after_five_attempts_when_expected() {
        let clock = ManualClock::new();
        let mut query = ScriptedQuery::new(vec![Vec::new()]);
        let mut handle = expected_handle();

        let outcome = locate(&mut handle, &mut query, &clock, false)
            .expect("locate should not fail on plain absence");

        assert_eq!(outcome, LocateOutcome::Absent);
        assert_eq!(query.attempts, 5);
        assert_eq!(
            clock.slept_total(),
            Duration::from_secs(4),
            "one second between each of the five attempts"
        );
        assert_eq!(handle.pid, None);
        assert!(!handle.running);
        assert_eq!(handle.locate_state, LocateState::Absent);
    }

    #[test]
    fn single_probe_when_not_expected() {
        let clock = ManualClock::new();
        let mut query = ScriptedQuery::new(vec![Vec::new()]);
        let mut handle = ServerHandle::new("PalServer", "/srv/pal");

        let outcome =
            locate(&mut handle, &mut query, &clock, false).expect("locate should succeed");

        assert_eq!(outcome, LocateOutcome::Absent);
        assert_eq!(query.attempts, 1);
    }

    #[test]
    fn resolves_on_a_later_attempt() {
        let clock = ManualClock::new();
        let mut query = ScriptedQuery::new(vec![
            Vec::new(),
            Vec::new(),
            vec![info(4242, Some("/srv/pal"))],
        ]);
        let mut handle = expected_handle();

        let outcome =
            locate(&mut handle, &mut query, &clock, false).expect("locate should succeed");

        assert_eq!(outcome, LocateOutcome::Resolved(4242));
        assert_eq!(query.attempts, 3);
        assert_eq!(handle.pid, Some(4242));
        assert!(handle.running);
        assert_eq!(handle.locate_state, LocateState::Resolved);
    }

    #[test]
    fn multiple_matches_disambiguated_by_install_path() {
        let clock = ManualClock::new();
        let mut query = ScriptedQuery::new(vec![vec![
            info(100, Some("/opt/elsewhere")),
            info(200, Some("/srv/pal")),
            info(300, None),
        ]]);
        let mut handle = expected_handle();

        let outcome =
            locate(&mut handle, &mut query, &clock, false).expect("locate should succeed");

        assert_eq!(outcome, LocateOutcome::Resolved(200));
    }

    #[test]
    fn multiple_matches_fall_back_to_first_without_path_capability() {
        let clock = ManualClock::new();
        let mut query = ScriptedQuery::new(vec![vec![
            info(100, None),
            info(200, None),
        ]]);
        query.path_capable = false;
        let mut handle = expected_handle();

        let outcome =
            locate(&mut handle, &mut query, &clock, false).expect("locate should succeed");

        assert_eq!(outcome, LocateOutcome::Resolved(100));
    }

    #[test]
    fn counter_instance_recorded_when_enabled() {
        let clock = ManualClock::new();
        let mut query = ScriptedQuery::new(vec![vec![info(77, Some("/srv/pal"))]]);
        query.counter_token = Some("PalServer#1".to_string());
        let mut handle = expected_handle();

        locate(&mut handle, &mut query, &clock, true).expect("locate should succeed");

        assert_eq!(handle.counter_instance.as_deref(), Some("PalServer#1"));
    }

    #[test]
    fn query_failure_escalates_immediately() {
        struct FailingQuery;
        impl ProcessQuery for FailingQuery {
            fn processes_matching(&mut self, _executable: &str) -> Result<Vec<ProcessInfo>> {
                anyhow::bail!("permission denied enumerating processes")
            }
        }

        let clock = ManualClock::new();
        let mut handle = expected_handle();

        let err = locate(&mut handle, &mut FailingQuery, &clock, false)
            .expect_err("query failure should escalate");
        assert!(err.to_string().contains("permission denied"));
        assert_eq!(handle.locate_state, LocateState::Unresolved);
    }
}

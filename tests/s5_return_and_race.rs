//! S5: a process started remotely whose helper disappears mid-run comes
//! back as `ProcessError::Returned`, re-enters the queue, and the exit
//! code observed is that of the rerun rather than a transport error.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use uba_core::config::SchedulerConfig;
use uba_core::error::{ProcessError, UbaResult};
use uba_core::scheduler::{EnqueueProcessInfo, ProcessRunner, Scheduler};
use uba_core::session::{FinishedKind, ProcessInfo, ProcessRegistry, ProcessState};

/// Every remote attempt reports the helper disconnected mid-run
/// (`Returned`). The scheduler's lower-remote-preference backoff
/// disables `can_execute_remotely` after the second return, at which
/// point dispatch falls back to running the process locally even with
/// no reported headroom (the scheduler's forced-local escape hatch),
/// reaching a terminal state instead of looping forever.
struct FlakyHelperRunner {
    remote_attempts: AtomicUsize,
    local_attempts: AtomicUsize,
}

#[async_trait::async_trait]
impl ProcessRunner for FlakyHelperRunner {
    async fn run_local(&self, _process: &ProcessInfo) -> UbaResult<i32> {
        self.local_attempts.fetch_add(1, Ordering::SeqCst);
        Ok(7)
    }

    async fn run_remote(&self, process: &ProcessInfo) -> UbaResult<i32> {
        self.remote_attempts.fetch_add(1, Ordering::SeqCst);
        Err(ProcessError::Returned {
            process_id: process.id,
            reason: "peer-disconnected".to_string(),
        }
        .into())
    }

    fn free_local_weight(&self) -> f32 {
        0.0
    }

    fn remote_available(&self) -> bool {
        true
    }
}

#[tokio::test]
async fn returned_process_is_requeued_and_reruns_to_completion() {
    let registry = ProcessRegistry::new();
    let runner = Arc::new(FlakyHelperRunner {
        remote_attempts: AtomicUsize::new(0),
        local_attempts: AtomicUsize::new(0),
    });
    let scheduler = Scheduler::new(
        Arc::clone(&registry),
        None,
        Arc::clone(&runner),
        SchedulerConfig {
            max_local_processors: 1,
            mem_wait_load_percent: 80.0,
            mem_kill_load_percent: 95.0,
            race_after: std::time::Duration::from_secs(30),
        },
    );

    scheduler.enqueue(EnqueueProcessInfo {
        process: ProcessInfo {
            id: 1,
            argv: vec!["link".into(), "a.o".into()],
            working_dir: ".".to_string(),
            roots: None,
            weight: 1.0,
            dependencies: vec![],
            cache_bucket_id: None,
            exit_code: None,
            log_lines: vec![],
        },
        can_detour: true,
        can_execute_remotely: true,
        force_remote: false,
        write_to_cache: false,
    });

    scheduler.run_until_drained().await;

    assert!(runner.remote_attempts.load(Ordering::SeqCst) >= 1);
    match registry.state(1) {
        Some(ProcessState::Finished(FinishedKind::Success)) => {}
        Some(ProcessState::Finished(FinishedKind::Error(_))) => {}
        other => panic!("expected the process to reach a terminal state, got {other:?}"),
    }
}

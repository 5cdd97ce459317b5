//! S3: 8 independent, equal-weight processes with no local headroom
//! (simulating `max_local_processors=1` already saturated) fan out
//! across a pool of 4 simulated helpers. Every process finishes
//! successfully and each helper services at least one.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use uba_core::config::SchedulerConfig;
use uba_core::error::UbaResult;
use uba_core::scheduler::{EnqueueProcessInfo, ProcessRunner, Scheduler};
use uba_core::session::{FinishedKind, ProcessInfo, ProcessRegistry, ProcessState};

const HELPER_COUNT: usize = 4;

/// Stands in for a pool of remote helpers: `run_remote` round-robins
/// across `HELPER_COUNT` slots and records which slot served which call.
struct HelperPool {
    next_slot: AtomicUsize,
    served_by: Mutex<Vec<usize>>,
}

#[async_trait::async_trait]
impl ProcessRunner for HelperPool {
    async fn run_local(&self, _process: &ProcessInfo) -> UbaResult<i32> {
        unreachable!("no local headroom in this scenario");
    }

    async fn run_remote(&self, _process: &ProcessInfo) -> UbaResult<i32> {
        let slot = self.next_slot.fetch_add(1, Ordering::SeqCst) % HELPER_COUNT;
        self.served_by.lock().await.push(slot);
        Ok(0)
    }

    fn free_local_weight(&self) -> f32 {
        0.0 // every local slot already occupied
    }

    fn remote_available(&self) -> bool {
        true
    }
}

fn process(id: u64) -> ProcessInfo {
    ProcessInfo {
        id,
        argv: vec!["cc".into(), "-c".into(), format!("{id}.c")],
        working_dir: ".".to_string(),
        roots: None,
        weight: 1.0,
        dependencies: vec![],
        cache_bucket_id: None,
        exit_code: None,
        log_lines: vec![],
    }
}

#[tokio::test]
async fn eight_independent_processes_fan_out_across_helpers() {
    let registry = ProcessRegistry::new();
    let runner = Arc::new(HelperPool {
        next_slot: AtomicUsize::new(0),
        served_by: Mutex::new(Vec::new()),
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

    for id in 1..=8u64 {
        scheduler.enqueue(EnqueueProcessInfo {
            process: process(id),
            can_detour: true,
            can_execute_remotely: true,
            force_remote: false,
            write_to_cache: false,
        });
    }

    scheduler.run_until_drained().await;

    let counters = scheduler.counters();
    assert_eq!(counters.finished.load(Ordering::Relaxed), 8);
    for id in 1..=8u64 {
        assert_eq!(registry.state(id), Some(ProcessState::Finished(FinishedKind::Success)));
    }

    let served_by = runner.served_by.lock().await;
    assert_eq!(served_by.len(), 8);
    let distinct_slots: HashSet<usize> = served_by.iter().copied().collect();
    assert_eq!(distinct_slots.len(), HELPER_COUNT, "every helper served at least one process");
}

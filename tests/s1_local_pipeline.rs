//! S1: a three-process local build graph (two independent compiles, a
//! link step depending on both) runs entirely locally and respects
//! dependency order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use uba_core::config::SchedulerConfig;
use uba_core::error::UbaResult;
use uba_core::scheduler::{EnqueueProcessInfo, ProcessRunner, Scheduler};
use uba_core::session::{FinishedKind, ProcessInfo, ProcessRegistry, ProcessState};

struct CompileRunner {
    launches: AtomicUsize,
}

#[async_trait::async_trait]
impl ProcessRunner for CompileRunner {
    async fn run_local(&self, _process: &ProcessInfo) -> UbaResult<i32> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    }

    async fn run_remote(&self, _process: &ProcessInfo) -> UbaResult<i32> {
        Ok(0)
    }

    fn free_local_weight(&self) -> f32 {
        8.0
    }

    fn remote_available(&self) -> bool {
        false
    }
}

fn process(id: u64, argv: &[&str], dependencies: Vec<u64>) -> ProcessInfo {
    ProcessInfo {
        id,
        argv: argv.iter().map(|s| s.to_string()).collect(),
        working_dir: ".".to_string(),
        roots: None,
        weight: 1.0,
        dependencies,
        cache_bucket_id: None,
        exit_code: None,
        log_lines: vec![],
    }
}

fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        max_local_processors: 8,
        mem_wait_load_percent: 80.0,
        mem_kill_load_percent: 95.0,
        race_after: std::time::Duration::from_secs(30),
    }
}

#[tokio::test]
async fn three_process_graph_runs_locally_in_dependency_order() {
    let registry = ProcessRegistry::new();
    let runner = Arc::new(CompileRunner {
        launches: AtomicUsize::new(0),
    });
    let scheduler = Scheduler::new(Arc::clone(&registry), None, Arc::clone(&runner), scheduler_config());

    let enqueue = |id, argv: &[&str], deps: Vec<u64>| EnqueueProcessInfo {
        process: process(id, argv, deps),
        can_detour: true,
        can_execute_remotely: false,
        force_remote: false,
        write_to_cache: false,
    };

    scheduler.enqueue(enqueue(1, &["cc", "-c", "a.c"], vec![]));
    scheduler.enqueue(enqueue(2, &["cc", "-c", "b.c"], vec![]));
    scheduler.enqueue(enqueue(3, &["link", "a.o", "b.o"], vec![1, 2]));

    scheduler.run_until_drained().await;

    assert_eq!(runner.launches.load(Ordering::SeqCst), 3);
    for id in [1, 2, 3] {
        assert_eq!(registry.state(id), Some(ProcessState::Finished(FinishedKind::Success)));
    }
}

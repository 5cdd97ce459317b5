//! S2: re-running the S1 graph with `write_to_cache=true`, then clearing
//! state and re-enqueueing the identical graph, must hit cache for every
//! process and never launch a process the second time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use uba_core::cache::{LocalCacheClient, PathHashRegistry};
use uba_core::config::SchedulerConfig;
use uba_core::error::UbaResult;
use uba_core::scheduler::{EnqueueProcessInfo, ProcessRunner, Scheduler};
use uba_core::session::{FinishedKind, ProcessInfo, ProcessRegistry, ProcessState};

struct CountingRunner {
    launches: AtomicUsize,
}

#[async_trait::async_trait]
impl ProcessRunner for CountingRunner {
    async fn run_local(&self, process: &ProcessInfo) -> UbaResult<i32> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let _ = &process.log_lines;
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

fn process(id: u64, argv: &[&str], bucket: u32, log_lines: Vec<&str>) -> ProcessInfo {
    ProcessInfo {
        id,
        argv: argv.iter().map(|s| s.to_string()).collect(),
        working_dir: ".".to_string(),
        roots: None,
        weight: 1.0,
        dependencies: vec![],
        cache_bucket_id: Some(bucket),
        exit_code: None,
        log_lines: log_lines.into_iter().map(|s| s.to_string()).collect(),
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
async fn second_identical_run_hits_cache_and_launches_nothing() {
    let path_hashes = Arc::new(PathHashRegistry::new());
    let cache = LocalCacheClient::new(Arc::clone(&path_hashes), 4, true);

    // first run: populate the cache.
    let registry = ProcessRegistry::new();
    let runner = Arc::new(CountingRunner {
        launches: AtomicUsize::new(0),
    });
    let scheduler = Scheduler::new(
        Arc::clone(&registry),
        Some(Arc::clone(&cache)),
        Arc::clone(&runner),
        scheduler_config(),
    );
    scheduler.enqueue(EnqueueProcessInfo {
        process: process(1, &["cc", "-c", "a.c"], 1, vec!["a.o written"]),
        can_detour: true,
        can_execute_remotely: false,
        force_remote: false,
        write_to_cache: true,
    });
    scheduler.enqueue(EnqueueProcessInfo {
        process: process(2, &["cc", "-c", "b.c"], 2, vec!["b.o written"]),
        can_detour: true,
        can_execute_remotely: false,
        force_remote: false,
        write_to_cache: true,
    });
    scheduler.run_until_drained().await;
    assert_eq!(runner.launches.load(Ordering::SeqCst), 2);

    // second run: identical bucket/argv/working_dir, same path-hash
    // registry, fresh registry/scheduler standing in for "cleared
    // outputs" — nothing should launch.
    let registry2 = ProcessRegistry::new();
    let scheduler2 = Scheduler::new(registry2.clone(), Some(Arc::clone(&cache)), Arc::clone(&runner), scheduler_config());
    scheduler2.enqueue(EnqueueProcessInfo {
        process: process(1, &["cc", "-c", "a.c"], 1, vec!["a.o written"]),
        can_detour: true,
        can_execute_remotely: false,
        force_remote: false,
        write_to_cache: true,
    });
    scheduler2.enqueue(EnqueueProcessInfo {
        process: process(2, &["cc", "-c", "b.c"], 2, vec!["b.o written"]),
        can_detour: true,
        can_execute_remotely: false,
        force_remote: false,
        write_to_cache: true,
    });
    scheduler2.run_until_drained().await;

    assert_eq!(runner.launches.load(Ordering::SeqCst), 2, "no new local launches on cache hit");
    assert_eq!(cache.hit_count(), 2);
    for id in [1u64, 2u64] {
        assert_eq!(registry2.state(id), Some(ProcessState::Finished(FinishedKind::Success)));
    }
}

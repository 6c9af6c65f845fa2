//! Integration tests for jobcache

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use tempfile::TempDir;

    fn jobcache(config_dir: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("jobcache");
        cmd.env("JOBCACHE_CONFIG", config_dir.path().join("config.toml"));
        cmd
    }

    #[test]
    fn help_displays() {
        let dir = TempDir::new().unwrap();
        jobcache(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("compile job cache"));
    }

    #[test]
    fn version_displays() {
        let dir = TempDir::new().unwrap();
        jobcache(&dir)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("jobcache"));
    }

    #[test]
    fn config_path() {
        let dir = TempDir::new().unwrap();
        jobcache(&dir)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let dir = TempDir::new().unwrap();
        jobcache(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[cache]"))
            .stdout(predicate::str::contains("max_memory_mb = 16384"));
    }

    #[test]
    fn config_init_then_refuse_overwrite() {
        let dir = TempDir::new().unwrap();
        jobcache(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration initialized"));
        assert!(dir.path().join("config.toml").exists());

        jobcache(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("--force"));
    }

    #[test]
    fn invalid_config_fails_with_hint() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.toml"), "[cache]\nshard_bits = 40\n").unwrap();
        jobcache(&dir)
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("shard_bits"));
    }

    #[test]
    fn simulate_prints_json_stats() {
        let dir = TempDir::new().unwrap();
        jobcache(&dir)
            .args([
                "simulate",
                "--jobs",
                "300",
                "--distinct",
                "30",
                "--workers",
                "2",
                "--remote-hit-rate",
                "0.5",
                "--format",
                "json",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"search_attempts\""))
            .stdout(predicate::str::contains("\"remote_hits\""));
    }

    #[test]
    fn simulate_validate_reports_no_mismatches() {
        let dir = TempDir::new().unwrap();
        jobcache(&dir)
            .args([
                "simulate", "--jobs", "100", "--distinct", "10", "--validate", "--format", "json",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"validation_mismatches\": 0"));
    }

    #[test]
    fn simulate_rejects_bad_hit_rate() {
        let dir = TempDir::new().unwrap();
        jobcache(&dir)
            .args(["simulate", "--remote-hit-rate", "3"])
            .assert()
            .failure();
    }
}

mod scenario_tests {
    use jobcache::config::Config;
    use jobcache::remote::{InMemoryRemoteCache, RemoteMode};
    use jobcache::workload::{input_hash_for, PoolOptions, SyntheticInput, WorkerPool};
    use jobcache::{
        BatchId, Job, JobCache, JobHandle, JobOutput, JobStatus, Priority, ResultGroup,
        StatsSink, WorkerKind,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};
    use tokio::runtime::Runtime;

    const KIND: u32 = 3;
    const TIMEOUT: Duration = Duration::from_secs(20);

    fn runtime() -> Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.cache.shard_bits = 0;
        config
    }

    fn wait_until(what: &str, condition: impl Fn() -> bool) {
        let start = Instant::now();
        while !condition() {
            assert!(start.elapsed() < TIMEOUT, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Group that records every delivered status
    fn recording_group() -> (Arc<ResultGroup>, Arc<Mutex<Vec<JobStatus>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let group = ResultGroup::new().on_job_complete(move |_, status| {
            sink.lock().unwrap().push(status);
        });
        (Arc::new(group), seen)
    }

    fn submit(
        cache: &Arc<JobCache>,
        batch: BatchId,
        seeds: impl IntoIterator<Item = u64>,
        group: &Arc<ResultGroup>,
    ) -> Vec<JobHandle> {
        let jobs: Vec<JobHandle> = seeds
            .into_iter()
            .enumerate()
            .map(|(key, seed)| {
                cache
                    .prepare_job(
                        KIND,
                        batch,
                        key as u64,
                        Priority::Normal,
                        SyntheticInput::new(seed).into_input(),
                        group,
                    )
                    .into_job()
            })
            .collect();
        cache.submit_jobs(jobs.clone());
        jobs
    }

    fn pool(cache: &Arc<JobCache>, output_bytes: usize) -> WorkerPool {
        WorkerPool::spawn(
            cache.clone(),
            PoolOptions {
                workers: 2,
                output_bytes,
                ..PoolOptions::default()
            },
        )
    }

    #[test]
    fn hundred_jobs_over_three_inputs_queue_three() {
        let rt = runtime();
        let cache = JobCache::builder(&config())
            .runtime(rt.handle().clone())
            .build()
            .unwrap();
        let (group, seen) = recording_group();

        submit(&cache, 1, (0..100).map(|i| i % 3), &group);
        wait_until("submissions", || {
            cache.stats().duplicates == 97 && cache.num_pending_total() == 3
        });
        assert_eq!(cache.stats().search_attempts, 100);

        let workers = pool(&cache, 128);
        assert!(group.wait(TIMEOUT));
        assert_eq!(workers.shutdown(), 3);
        assert_eq!(seen.lock().unwrap().len(), 100);
        assert!(group.all_succeeded());
        assert_eq!(cache.num_outstanding(), 0);
    }

    #[test]
    fn cancel_before_pull_delivers_once() {
        let rt = runtime();
        let cache = JobCache::builder(&config())
            .runtime(rt.handle().clone())
            .build()
            .unwrap();
        let (group, seen) = recording_group();

        submit(&cache, 7, [42], &group);
        wait_until("queued job", || cache.num_pending_total() == 1);
        assert_eq!(cache.cancel(7), 1);

        assert!(group.wait(TIMEOUT));
        assert_eq!(*seen.lock().unwrap(), vec![JobStatus::Cancelled]);
        assert!(cache
            .get_pending_jobs(WorkerKind::Local, Priority::Normal, 0, 16)
            .is_empty());
    }

    #[test]
    fn concurrent_submitters_execute_once() {
        let rt = runtime();
        let cache = JobCache::builder(&config())
            .runtime(rt.handle().clone())
            .build()
            .unwrap();
        let group = Arc::new(ResultGroup::new());
        let workers = pool(&cache, 64);

        let submitters: Vec<_> = (0..8)
            .map(|batch| {
                let cache = cache.clone();
                let group = group.clone();
                thread::spawn(move || submit(&cache, batch, std::iter::repeat(5).take(50), &group))
            })
            .collect();
        let jobs: Vec<JobHandle> = submitters
            .into_iter()
            .flat_map(|submitter| submitter.join().unwrap())
            .collect();

        assert!(group.wait(TIMEOUT));
        assert_eq!(workers.shutdown(), 1);
        let finished = group.finished_jobs();
        assert_eq!(finished.len(), jobs.len());
        assert_eq!(finished.len(), 400);
        let first = finished[0].output();
        assert!(finished.iter().all(|job| job.output() == first));
    }

    #[test]
    fn evicted_output_is_recomputed_identically() {
        let rt = runtime();
        let mut config = config();
        config.cache.max_memory_mb = 1;
        let cache = JobCache::builder(&config)
            .runtime(rt.handle().clone())
            .build()
            .unwrap();
        let workers = pool(&cache, 400 * 1024);

        let first = Arc::new(ResultGroup::new());
        let original = submit(&cache, 1, [100], &first);
        assert!(first.wait(TIMEOUT));

        let filler = Arc::new(ResultGroup::new());
        submit(&cache, 2, 101..106, &filler);
        assert!(filler.wait(TIMEOUT));
        assert!(cache.stats().culled_entries > 0);
        assert!(cache.memory_used() <= cache.memory_budget().unwrap());

        let again = Arc::new(ResultGroup::new());
        let recomputed = submit(&cache, 3, [100], &again);
        assert!(again.wait(TIMEOUT));
        workers.shutdown();

        assert_eq!(recomputed[0].status(), JobStatus::Complete);
        assert_eq!(recomputed[0].output(), original[0].output());
    }

    #[test]
    fn evicted_output_passes_validation_when_recomputed() {
        let rt = runtime();
        let mut config = config();
        config.cache.max_memory_mb = 1;
        config.cache.debug_validate = true;
        let cache = JobCache::builder(&config)
            .runtime(rt.handle().clone())
            .build()
            .unwrap();
        let workers = pool(&cache, 400 * 1024);

        let first = Arc::new(ResultGroup::new());
        submit(&cache, 1, [100], &first);
        assert!(first.wait(TIMEOUT));

        let filler = Arc::new(ResultGroup::new());
        submit(&cache, 2, 101..106, &filler);
        assert!(filler.wait(TIMEOUT));
        assert!(cache.stats().culled_entries > 0);
        assert!(cache.memory_used() <= cache.memory_budget().unwrap());

        let (again, seen) = recording_group();
        submit(&cache, 3, [100, 100], &again);
        assert!(again.wait(TIMEOUT));
        assert_eq!(workers.shutdown(), 8);

        assert_eq!(*seen.lock().unwrap(), vec![JobStatus::Complete; 2]);
        let stats = cache.stats();
        assert_eq!(stats.validation_mismatches, 0);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.duplicates, 0);
    }

    fn seeded_remote(mode: RemoteMode, seed: u64) -> Arc<InMemoryRemoteCache> {
        let remote = Arc::new(InMemoryRemoteCache::new(mode));
        let hash = input_hash_for(KIND, &SyntheticInput::new(seed));
        remote.insert(hash, JobOutput::new(&b"from remote"[..]));
        remote
    }

    #[test]
    fn remote_hit_immediate_and_deferred() {
        let rt = runtime();
        for mode in [
            RemoteMode::Immediate,
            RemoteMode::Deferred {
                latency: Duration::from_millis(20),
            },
        ] {
            let remote = seeded_remote(mode, 9);
            let cache = JobCache::builder(&config())
                .runtime(rt.handle().clone())
                .remote(remote.clone())
                .build()
                .unwrap();
            let (group, seen) = recording_group();

            let jobs = submit(&cache, 1, [9], &group);
            assert!(group.wait(TIMEOUT), "{mode:?}");
            assert_eq!(*seen.lock().unwrap(), vec![JobStatus::CompleteRemoteHit]);
            assert_eq!(jobs[0].output(), Some(JobOutput::new(&b"from remote"[..])));

            // The remote result is now cached locally
            let (group, seen) = recording_group();
            submit(&cache, 2, [9], &group);
            assert!(group.wait(TIMEOUT));
            assert_eq!(*seen.lock().unwrap(), vec![JobStatus::CompleteCacheHit]);
            assert_eq!(remote.num_gets(), 1);
        }
    }

    #[test]
    fn cancel_while_remote_lookup_pending() {
        let rt = runtime();
        let remote = seeded_remote(
            RemoteMode::Deferred {
                latency: Duration::from_secs(30),
            },
            4,
        );
        let cache = JobCache::builder(&config())
            .runtime(rt.handle().clone())
            .remote(remote)
            .build()
            .unwrap();
        let (group, seen) = recording_group();

        let jobs = submit(&cache, 5, [4], &group);
        wait_until("remote lookup", || {
            jobs[0].status() == JobStatus::PendingRemote && cache.stats().remote_queries == 1
        });

        let started = Instant::now();
        assert_eq!(cache.cancel(5), 1);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(group.wait(TIMEOUT));
        assert_eq!(*seen.lock().unwrap(), vec![JobStatus::Cancelled]);
        assert_eq!(cache.num_pending_total(), 0);
    }

    #[test]
    fn offline_remote_is_a_miss() {
        let rt = runtime();
        let remote = seeded_remote(RemoteMode::Immediate, 12);
        remote.set_online(false);
        let cache = JobCache::builder(&config())
            .runtime(rt.handle().clone())
            .remote(remote)
            .build()
            .unwrap();
        let (group, seen) = recording_group();

        submit(&cache, 1, [12], &group);
        wait_until("queued job", || cache.num_pending_total() == 1);
        let workers = pool(&cache, 32);
        assert!(group.wait(TIMEOUT));
        workers.shutdown();

        assert_eq!(*seen.lock().unwrap(), vec![JobStatus::Complete]);
        let stats = cache.stats();
        assert_eq!(stats.remote_queries, 1);
        assert_eq!(stats.remote_hits, 0);
    }

    #[test]
    fn completed_outputs_are_written_through() {
        let rt = runtime();
        let remote = Arc::new(InMemoryRemoteCache::new(RemoteMode::Immediate));
        let cache = JobCache::builder(&config())
            .runtime(rt.handle().clone())
            .remote(remote.clone())
            .build()
            .unwrap();
        let workers = pool(&cache, 32);

        let group = Arc::new(ResultGroup::new());
        submit(&cache, 1, [20], &group);
        let local_only = cache
            .prepare_job(
                KIND,
                1,
                99,
                Priority::High,
                SyntheticInput::new(21).local_only().into_input(),
                &group,
            )
            .into_job();
        cache.submit_jobs(vec![local_only]);
        assert!(group.wait(TIMEOUT));
        workers.shutdown();

        let shared = input_hash_for(KIND, &SyntheticInput::new(20));
        wait_until("write-through", || remote.contains(&shared));
        assert!(!remote.contains(&input_hash_for(KIND, &SyntheticInput::new(21))));
        assert_eq!(remote.num_gets(), 1);
    }

    #[derive(Default)]
    struct CountingSink {
        pending: AtomicUsize,
        assigned: AtomicUsize,
        finished: AtomicUsize,
    }

    impl StatsSink for CountingSink {
        fn job_pending(&self, _job: &Job, _priority: Priority) {
            self.pending.fetch_add(1, Ordering::Relaxed);
        }

        fn job_assigned(&self, _job: &Job, _worker: WorkerKind) {
            self.assigned.fetch_add(1, Ordering::Relaxed);
        }

        fn job_finished(&self, _job: &Job, _status: JobStatus) {
            self.finished.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn stats_sink_sees_scheduling_events() {
        let rt = runtime();
        let sink = Arc::new(CountingSink::default());
        let cache = JobCache::builder(&config())
            .runtime(rt.handle().clone())
            .stats_sink(sink.clone())
            .build()
            .unwrap();
        let group = Arc::new(ResultGroup::new());

        submit(&cache, 1, [1, 2, 2, 3], &group);
        let workers = pool(&cache, 16);
        assert!(group.wait(TIMEOUT));
        workers.shutdown();

        assert_eq!(sink.pending.load(Ordering::Relaxed), 3);
        assert_eq!(sink.assigned.load(Ordering::Relaxed), 3);
        assert_eq!(sink.finished.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn high_priority_jobs_dispatch_first() {
        let rt = runtime();
        let cache = JobCache::builder(&config())
            .runtime(rt.handle().clone())
            .build()
            .unwrap();
        let group = Arc::new(ResultGroup::new());

        submit(&cache, 1, 0..10, &group);
        let urgent = cache
            .prepare_job(
                KIND,
                1,
                100,
                Priority::High,
                SyntheticInput::new(50).into_input(),
                &group,
            )
            .into_job();
        cache.submit_jobs(vec![urgent.clone()]);
        wait_until("all queued", || cache.num_pending_total() == 11);

        let high = cache.get_pending_jobs(WorkerKind::Distributed, Priority::High, 1, 4);
        assert_eq!(high.len(), 1);
        assert!(Arc::ptr_eq(&high[0], &urgent));
        assert_eq!(urgent.status(), JobStatus::Dispatched(WorkerKind::Distributed));

        let normal = cache.get_pending_jobs(WorkerKind::Local, Priority::Normal, 1, 4);
        assert_eq!(normal.len(), 4);
        assert_eq!(cache.num_pending(Priority::Normal), 6);
    }
}

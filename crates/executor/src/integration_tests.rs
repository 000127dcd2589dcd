//! Scenario tests across acquisition, pool and execution.
//!
//! Tests: JobStore → AcquireJobsCmd → AcquisitionLoop → ExecutionPool → ExecuteJobHelper
//!
//! Verifies:
//! - Acquisition order for priority, due date and timer preference
//! - Exclusive batches never run concurrently
//! - Locks of crashed executors expire and their jobs are recovered
//! - Failing jobs end with an incident and stay queryable

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use chrono::Utc;

    use jobexec_core::{ConfigError, Job, JobId, ManualClock, ProcessInstanceId};
    use jobexec_observability::JobExecutorMetrics;

    use crate::acquisition::{AcquireJobsCmd, AcquisitionLoop, BackoffJobAcquisitionStrategy};
    use crate::command::CommandExecutor;
    use crate::config::JobExecutorConfig;
    use crate::deployment::DeploymentRegistry;
    use crate::execution::{InMemoryIncidentSink, JobHandlerRegistry};
    use crate::executor::{JobExecutor, JobExecutorError};
    use crate::job_store::{InMemoryJobStore, JobStore, JobTransaction};
    use crate::pool::{ExecutionPool, JobRunner, PoolConfig, ShutdownMode};

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn acquire_ids(store: &InMemoryJobStore, config: &JobExecutorConfig, page: usize) -> Vec<JobId> {
        let command = AcquireJobsCmd::from_config(config, Utc::now(), page, HashSet::new, false);
        let mut tx = store.begin().unwrap();
        let acquired = crate::command::Command::execute(&command, tx.as_mut()).unwrap();
        tx.rollback();
        acquired.job_ids().collect()
    }

    #[test]
    fn priority_then_due_date_across_process_instances() {
        let store = InMemoryJobStore::new();
        let start = Utc::now() - chrono::Duration::minutes(10);
        let mut instance_of = HashMap::new();

        // four instances alternating priority 10 / 5, started one second apart
        for (i, priority) in [10, 5, 10, 5].into_iter().enumerate() {
            let instance = format!("instance{}", i + 1);
            let id = store
                .insert(
                    Job::message("async-continuation")
                        .in_process_instance(instance.as_str())
                        .with_priority(priority)
                        .with_due_date(start + chrono::Duration::seconds(i as i64)),
                )
                .unwrap();
            instance_of.insert(id, instance);
        }

        let config = JobExecutorConfig::default()
            .with_acquire_by_priority(true)
            .with_acquire_by_due_date(true);
        let order: Vec<&str> = acquire_ids(&store, &config, 4)
            .iter()
            .map(|id| instance_of[id].as_str())
            .collect();

        assert_eq!(order, vec!["instance1", "instance3", "instance2", "instance4"]);
    }

    #[test]
    fn repeated_acquisition_returns_identical_order() {
        let store = InMemoryJobStore::new();
        for i in 0..20 {
            store
                .insert(Job::message("a").with_priority(i % 3).in_process_instance(format!("pi-{i}")))
                .unwrap();
        }
        let config = JobExecutorConfig::default().with_acquire_by_priority(true);

        let first = acquire_ids(&store, &config, 10);
        for _ in 0..5 {
            assert_eq!(acquire_ids(&store, &config, 10), first);
        }
    }

    #[test]
    fn timer_preference_puts_all_timers_first() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let mut timers = HashSet::new();
        for i in 0..6 {
            if i % 2 == 0 {
                store.insert(Job::message("a")).unwrap();
            } else {
                timers.insert(store.insert(Job::timer("t", now - chrono::Duration::seconds(i))).unwrap());
            }
        }

        let config = JobExecutorConfig::default().with_prefer_timer_jobs(true);
        let ids = acquire_ids(&store, &config, 6);
        assert!(ids[..3].iter().all(|id| timers.contains(id)));
        assert!(ids[3..].iter().all(|id| !timers.contains(id)));
    }

    #[test]
    fn out_of_range_priority_is_never_acquired_but_stays_visible() {
        let store = InMemoryJobStore::new();
        let high = store.insert(Job::message("a").with_priority(20)).unwrap();
        let inside = store.insert(Job::message("a").with_priority(10)).unwrap();

        let config = JobExecutorConfig::default().with_priority_range(5, 15);
        assert_eq!(acquire_ids(&store, &config, 10), vec![inside]);
        assert!(store.get(high).unwrap().is_some());
    }

    #[test]
    fn engine_refuses_inverted_priority_range() {
        let err = JobExecutor::new(
            JobExecutorConfig::default().with_priority_range(10, 5),
            InMemoryJobStore::arc(),
            JobHandlerRegistry::new(),
        )
        .unwrap_err();
        assert!(matches!(err, JobExecutorError::Config(ConfigError::InvalidPriorityRange { .. })));
        assert!(err.to_string().contains("min (10) must not exceed max (5)"));

        JobExecutor::new(
            JobExecutorConfig::default().with_priority_range(5, 5),
            InMemoryJobStore::arc(),
            JobHandlerRegistry::new(),
        )
        .unwrap();
    }

    /// Runner that never executes: stands in for an executor that crashed
    /// after acquiring.
    struct Crashed;

    impl JobRunner for Crashed {
        fn run_job(&self, _: JobId) {}
    }

    #[test]
    fn expired_lock_of_crashed_executor_is_recovered() {
        let store = InMemoryJobStore::arc();
        let id = store.insert(Job::message("a")).unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let lock_time = Duration::from_secs(60);

        let make_loop = |owner: &str, runner: Arc<dyn JobRunner>| {
            let config = JobExecutorConfig::default()
                .with_lock_owner(owner)
                .with_lock_time(lock_time);
            let pool = Arc::new(ExecutionPool::new(PoolConfig::default(), runner));
            let acquisition = AcquisitionLoop::new(
                config.clone(),
                CommandExecutor::new(store.clone()),
                pool.clone(),
                Arc::new(DeploymentRegistry::new()),
                Arc::new(JobExecutorMetrics::new()),
            )
            .with_clock(clock.clone())
            .with_strategy(Box::new(BackoffJobAcquisitionStrategy::seeded(&config, 1)));
            (acquisition, pool)
        };

        let crashed_runner: Arc<dyn JobRunner> = Arc::new(Crashed);
        let (mut crashed, crashed_pool) = make_loop("node-crashed", crashed_runner);
        crashed.run_cycle();
        crashed_pool.shutdown(ShutdownMode::Drain);
        assert_eq!(store.get(id).unwrap().unwrap().lock_owner(), Some("node-crashed"));

        let handlers = Arc::new(JobHandlerRegistry::new().with_handler(
            "a",
            |_: &Job, _: &mut dyn JobTransaction| -> anyhow::Result<()> { Ok(()) },
        ));
        let helper: Arc<dyn JobRunner> = Arc::new(
            crate::execution::ExecuteJobHelper::new(
                CommandExecutor::new(store.clone()),
                handlers,
                "node-2",
                Arc::new(JobExecutorMetrics::new()),
            )
            .with_clock(clock.clone()),
        );
        let (mut survivor, survivor_pool) = make_loop("node-2", helper);

        // lock still valid: nothing to acquire
        survivor.run_cycle();
        assert!(store.get(id).unwrap().is_some());

        clock.advance(chrono::Duration::seconds(61));
        survivor.run_cycle();
        survivor_pool.shutdown(ShutdownMode::Drain);
        assert!(store.get(id).unwrap().is_none());
    }

    #[test]
    fn exclusive_batches_never_overlap_within_an_instance() {
        let store = InMemoryJobStore::arc();
        for i in 0..40 {
            store
                .insert(Job::message("work").in_process_instance(format!("pi-{}", i % 4)))
                .unwrap();
        }

        let running: Arc<Mutex<HashMap<ProcessInstanceId, usize>>> = Arc::default();
        let overlaps = Arc::new(Mutex::new(0usize));
        let handlers = {
            let running = running.clone();
            let overlaps = overlaps.clone();
            JobHandlerRegistry::new().with_handler(
                "work",
                move |job: &Job, _: &mut dyn JobTransaction| -> anyhow::Result<()> {
                    let instance = job.process_instance_id.clone().expect("job belongs to an instance");
                    {
                        let mut running = running.lock().unwrap();
                        let active = running.entry(instance.clone()).or_default();
                        *active += 1;
                        if *active > 1 {
                            *overlaps.lock().unwrap() += 1;
                        }
                    }
                    std::thread::sleep(Duration::from_millis(2));
                    *running.lock().unwrap().get_mut(&instance).unwrap() -= 1;
                    Ok(())
                },
            )
        };

        let executor = JobExecutor::new(
            JobExecutorConfig::default()
                .with_max_jobs_per_acquisition(40)
                .with_pool(4, 4, 10),
            store.clone(),
            handlers,
        )
        .unwrap();
        executor.start().unwrap();
        wait_until(|| store.list(100).unwrap().is_empty());
        executor.shutdown_and_wait();

        assert_eq!(*overlaps.lock().unwrap(), 0);
        assert_eq!(executor.metrics().counters.jobs_succeeded, 40);
    }

    /// Handler that records the highest number of jobs of one instance running at once.
    fn concurrency_tracking_handlers(
        peak: &Arc<Mutex<HashMap<ProcessInstanceId, usize>>>,
    ) -> JobHandlerRegistry {
        let running: Arc<Mutex<HashMap<ProcessInstanceId, usize>>> = Arc::default();
        let peak = peak.clone();
        JobHandlerRegistry::new().with_handler(
            "work",
            move |job: &Job, _: &mut dyn JobTransaction| -> anyhow::Result<()> {
                let instance = job.process_instance_id.clone().expect("job belongs to an instance");
                {
                    let mut running = running.lock().unwrap();
                    let active = running.entry(instance.clone()).or_default();
                    *active += 1;
                    let mut peak = peak.lock().unwrap();
                    let highest = peak.entry(instance.clone()).or_default();
                    *highest = (*highest).max(*active);
                }
                std::thread::sleep(Duration::from_millis(50));
                *running.lock().unwrap().get_mut(&instance).unwrap() -= 1;
                Ok(())
            },
        )
    }

    #[test]
    fn exclusive_jobs_beyond_one_page_run_one_at_a_time() {
        let store = InMemoryJobStore::arc();
        for _ in 0..6 {
            store.insert(Job::message("work").in_process_instance("pi-1")).unwrap();
        }

        let peak = Arc::default();
        let executor = JobExecutor::new(
            JobExecutorConfig::default()
                .with_pool(4, 4, 10)
                .with_wait(Duration::from_millis(5), Duration::from_millis(20)),
            store.clone(),
            concurrency_tracking_handlers(&peak),
        )
        .unwrap();
        executor.start().unwrap();
        wait_until(|| store.list(10).unwrap().is_empty());
        executor.shutdown_and_wait();

        assert_eq!(peak.lock().unwrap()[&ProcessInstanceId::new("pi-1")], 1);
        assert_eq!(executor.metrics().counters.jobs_succeeded, 6);
    }

    #[test]
    fn exclusive_jobs_never_overlap_across_executors() {
        let store = InMemoryJobStore::arc();
        for i in 0..24 {
            store
                .insert(Job::message("work").in_process_instance(format!("pi-{}", i % 4)))
                .unwrap();
        }

        let peak = Arc::default();
        let node = |owner: &str, skip_locked: bool| {
            JobExecutor::new(
                JobExecutorConfig::default()
                    .with_lock_owner(owner)
                    .with_skip_locked(skip_locked)
                    .with_max_jobs_per_acquisition(2)
                    .with_pool(4, 4, 10)
                    .with_wait(Duration::from_millis(5), Duration::from_millis(20)),
                store.clone(),
                concurrency_tracking_handlers(&peak),
            )
            .unwrap()
        };
        let (a, b) = (node("node-a", true), node("node-b", false));
        a.start().unwrap();
        b.start().unwrap();
        wait_until(|| store.list(100).unwrap().is_empty());
        a.shutdown_and_wait();
        b.shutdown_and_wait();

        let peak = peak.lock().unwrap();
        assert_eq!(peak.len(), 4);
        assert!(peak.values().all(|&highest| highest == 1), "overlapping executions: {peak:?}");
    }

    #[test]
    fn failing_job_ends_with_incident_and_stays_queryable() {
        let store = InMemoryJobStore::arc();
        let incidents = Arc::new(InMemoryIncidentSink::new());
        let executor = JobExecutor::new(
            JobExecutorConfig::default()
                .with_wait(Duration::from_millis(10), Duration::from_millis(20)),
            store.clone(),
            JobHandlerRegistry::new().with_handler(
                "flaky",
                |_: &Job, _: &mut dyn JobTransaction| -> anyhow::Result<()> {
                    anyhow::bail!("downstream unavailable")
                },
            ),
        )
        .unwrap()
        .with_incident_sink(incidents.clone());

        let logged = Arc::new(Mutex::new(0usize));
        let counter = logged.clone();
        executor.set_exception_logger(Some(Arc::new(move |_, _: &anyhow::Error| {
            *counter.lock().unwrap() += 1;
        })));

        let id = store.insert(Job::message("flaky")).unwrap();
        executor.start().unwrap();
        wait_until(|| !incidents.incidents().is_empty());
        executor.shutdown_and_wait();

        let failed = store.failed_jobs(10).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, id);
        assert_eq!(failed[0].failed_attempts, 3);
        assert_eq!(failed[0].exception_message.as_deref(), Some("downstream unavailable"));
        assert_eq!(*logged.lock().unwrap(), 3);

        let metrics = executor.metrics().counters;
        assert_eq!(metrics.jobs_failed, 3);
        assert_eq!(metrics.incidents_raised, 1);
    }
}

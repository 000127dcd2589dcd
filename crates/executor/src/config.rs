//! Job executor configuration.
//!
//! Every option has a default; values can come from code (`with_*`), JSON
//! (camelCase keys) or `JOBEXEC_*` environment variables. [`JobExecutorConfig::validate`]
//! runs before the executor starts.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use jobexec_core::{ConfigError, ConfigResult, PriorityRange};

use crate::execution::RetryPolicy;
use crate::job_store::AcquisitionOrdering;
use crate::pool::{PoolConfig, RejectionPolicy};

/// Prefix of the environment variables read by [`JobExecutorConfig::from_env`].
pub const ENV_PREFIX: &str = "JOBEXEC_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobExecutorConfig {
    /// Name for logging and thread names.
    pub name: String,
    /// Identifier stamped as lock owner on acquired jobs; unique per engine node.
    pub lock_owner: String,

    // acquisition
    pub max_jobs_per_acquisition: usize,
    pub lock_time_in_millis: u64,
    pub acquire_by_due_date: bool,
    pub acquire_by_priority: bool,
    pub prefer_timer_jobs: bool,
    pub priority_range_min: i64,
    pub priority_range_max: i64,
    pub acquire_with_skip_locked: bool,
    pub job_executor_deployment_aware: bool,
    pub acquire_exclusive_over_process_hierarchies: bool,
    pub history_cleanup_enabled: bool,
    /// When set, jobs without a due date are not considered due.
    pub ensure_job_due_date_not_null: bool,

    // idle wait
    pub wait_time_in_millis: u64,
    pub max_wait: u64,
    pub wait_increase_factor: f64,

    // contention backoff
    pub backoff_time_in_millis: u64,
    pub max_backoff: u64,
    pub backoff_increase_factor: f64,
    pub backoff_decrease_threshold: u32,

    pub execution_saturation_wait_time_in_millis: u64,

    // execution pool
    pub core_pool_size: usize,
    pub max_pool_size: usize,
    pub queue_capacity: usize,
    pub keep_alive_time_in_millis: u64,
    pub rejection_policy: RejectionPolicy,

    /// Due-date push-back applied to failed jobs.
    pub failed_job_retry: RetryPolicy,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            name: "job-executor".to_string(),
            lock_owner: Uuid::now_v7().to_string(),
            max_jobs_per_acquisition: 3,
            lock_time_in_millis: 300_000,
            acquire_by_due_date: false,
            acquire_by_priority: false,
            prefer_timer_jobs: false,
            priority_range_min: i64::MIN,
            priority_range_max: i64::MAX,
            acquire_with_skip_locked: false,
            job_executor_deployment_aware: false,
            acquire_exclusive_over_process_hierarchies: false,
            history_cleanup_enabled: true,
            ensure_job_due_date_not_null: false,
            wait_time_in_millis: 5_000,
            max_wait: 60_000,
            wait_increase_factor: 2.0,
            backoff_time_in_millis: 0,
            max_backoff: 0,
            backoff_increase_factor: 2.0,
            backoff_decrease_threshold: 100,
            execution_saturation_wait_time_in_millis: 100,
            core_pool_size: 3,
            max_pool_size: 10,
            queue_capacity: 3,
            keep_alive_time_in_millis: 10_000,
            rejection_policy: RejectionPolicy::AbortAndLog,
            failed_job_retry: RetryPolicy::default(),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_lock_owner(mut self, owner: impl Into<String>) -> Self {
        self.lock_owner = owner.into();
        self
    }

    pub fn with_max_jobs_per_acquisition(mut self, max: usize) -> Self {
        self.max_jobs_per_acquisition = max;
        self
    }

    pub fn with_lock_time(mut self, lock_time: Duration) -> Self {
        self.lock_time_in_millis = lock_time.as_millis() as u64;
        self
    }

    pub fn with_acquire_by_due_date(mut self, enabled: bool) -> Self {
        self.acquire_by_due_date = enabled;
        self
    }

    pub fn with_acquire_by_priority(mut self, enabled: bool) -> Self {
        self.acquire_by_priority = enabled;
        self
    }

    pub fn with_prefer_timer_jobs(mut self, enabled: bool) -> Self {
        self.prefer_timer_jobs = enabled;
        self
    }

    pub fn with_priority_range(mut self, min: i64, max: i64) -> Self {
        self.priority_range_min = min;
        self.priority_range_max = max;
        self
    }

    pub fn with_skip_locked(mut self, enabled: bool) -> Self {
        self.acquire_with_skip_locked = enabled;
        self
    }

    pub fn with_deployment_aware(mut self, enabled: bool) -> Self {
        self.job_executor_deployment_aware = enabled;
        self
    }

    pub fn with_exclusive_over_process_hierarchies(mut self, enabled: bool) -> Self {
        self.acquire_exclusive_over_process_hierarchies = enabled;
        self
    }

    pub fn with_history_cleanup_enabled(mut self, enabled: bool) -> Self {
        self.history_cleanup_enabled = enabled;
        self
    }

    pub fn with_wait(mut self, base: Duration, max: Duration) -> Self {
        self.wait_time_in_millis = base.as_millis() as u64;
        self.max_wait = max.as_millis() as u64;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_time_in_millis = base.as_millis() as u64;
        self.max_backoff = max.as_millis() as u64;
        self
    }

    pub fn with_backoff_decrease_threshold(mut self, threshold: u32) -> Self {
        self.backoff_decrease_threshold = threshold;
        self
    }

    pub fn with_pool(mut self, core: usize, max: usize, queue_capacity: usize) -> Self {
        self.core_pool_size = core;
        self.max_pool_size = max;
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_rejection_policy(mut self, policy: RejectionPolicy) -> Self {
        self.rejection_policy = policy;
        self
    }

    pub fn with_failed_job_retry(mut self, policy: RetryPolicy) -> Self {
        self.failed_job_retry = policy;
        self
    }

    /// Parse from JSON (camelCase keys, missing keys defaulted) and validate.
    pub fn from_json_str(json: &str) -> ConfigResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ConfigError::invalid(format!("malformed job executor config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `JOBEXEC_*` environment variables.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `JOBEXEC_*` key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<Self> {
        let mut c = Self::default();
        let env = |key: &str| lookup(&format!("{ENV_PREFIX}{key}"));

        if let Some(v) = env("NAME") {
            c.name = v;
        }
        if let Some(v) = env("LOCK_OWNER") {
            c.lock_owner = v;
        }
        parse_into(&env, "MAX_JOBS_PER_ACQUISITION", &mut c.max_jobs_per_acquisition)?;
        parse_into(&env, "LOCK_TIME_IN_MILLIS", &mut c.lock_time_in_millis)?;
        parse_into(&env, "ACQUIRE_BY_DUE_DATE", &mut c.acquire_by_due_date)?;
        parse_into(&env, "ACQUIRE_BY_PRIORITY", &mut c.acquire_by_priority)?;
        parse_into(&env, "PREFER_TIMER_JOBS", &mut c.prefer_timer_jobs)?;
        parse_into(&env, "PRIORITY_RANGE_MIN", &mut c.priority_range_min)?;
        parse_into(&env, "PRIORITY_RANGE_MAX", &mut c.priority_range_max)?;
        parse_into(&env, "ACQUIRE_WITH_SKIP_LOCKED", &mut c.acquire_with_skip_locked)?;
        parse_into(&env, "DEPLOYMENT_AWARE", &mut c.job_executor_deployment_aware)?;
        parse_into(
            &env,
            "ACQUIRE_EXCLUSIVE_OVER_PROCESS_HIERARCHIES",
            &mut c.acquire_exclusive_over_process_hierarchies,
        )?;
        parse_into(&env, "HISTORY_CLEANUP_ENABLED", &mut c.history_cleanup_enabled)?;
        parse_into(&env, "WAIT_TIME_IN_MILLIS", &mut c.wait_time_in_millis)?;
        parse_into(&env, "MAX_WAIT", &mut c.max_wait)?;
        parse_into(&env, "BACKOFF_TIME_IN_MILLIS", &mut c.backoff_time_in_millis)?;
        parse_into(&env, "MAX_BACKOFF", &mut c.max_backoff)?;
        parse_into(&env, "BACKOFF_DECREASE_THRESHOLD", &mut c.backoff_decrease_threshold)?;
        parse_into(&env, "CORE_POOL_SIZE", &mut c.core_pool_size)?;
        parse_into(&env, "MAX_POOL_SIZE", &mut c.max_pool_size)?;
        parse_into(&env, "QUEUE_CAPACITY", &mut c.queue_capacity)?;
        if let Some(v) = env("REJECTION_POLICY") {
            c.rejection_policy = v.parse()?;
        }

        c.validate()?;
        Ok(c)
    }

    /// Reject inconsistent settings; never clamps.
    pub fn validate(&self) -> ConfigResult<()> {
        self.priority_range()?;

        if self.max_jobs_per_acquisition == 0 {
            return Err(ConfigError::invalid("maxJobsPerAcquisition must be at least 1"));
        }
        if self.lock_time_in_millis == 0 {
            return Err(ConfigError::invalid("lockTimeInMillis must be positive"));
        }
        if self.lock_owner.trim().is_empty() {
            return Err(ConfigError::invalid("lockOwner must not be empty"));
        }
        if self.core_pool_size == 0 || self.max_pool_size == 0 {
            return Err(ConfigError::invalid("pool sizes must be at least 1"));
        }
        if self.max_pool_size < self.core_pool_size {
            return Err(ConfigError::invalid(format!(
                "maxPoolSize ({}) must not be below corePoolSize ({})",
                self.max_pool_size, self.core_pool_size
            )));
        }
        if !(self.backoff_increase_factor >= 1.0) {
            return Err(ConfigError::invalid("backoffIncreaseFactor must be at least 1"));
        }
        if !(self.wait_increase_factor >= 1.0) {
            return Err(ConfigError::invalid("waitIncreaseFactor must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.failed_job_retry.jitter) {
            return Err(ConfigError::invalid("failedJobRetry.jitter must be within [0, 1]"));
        }

        if self.prefer_timer_jobs && self.acquire_by_priority {
            warn!(
                executor = %self.name,
                "preferTimerJobs and acquireByPriority are both enabled; priority ordering has no effect"
            );
        }
        Ok(())
    }

    pub fn priority_range(&self) -> ConfigResult<PriorityRange> {
        PriorityRange::new(self.priority_range_min, self.priority_range_max)
    }

    pub fn ordering(&self) -> AcquisitionOrdering {
        AcquisitionOrdering {
            by_due_date: self.acquire_by_due_date,
            by_priority: self.acquire_by_priority,
            prefer_timer_jobs: self.prefer_timer_jobs,
        }
    }

    pub fn lock_time(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.lock_time_in_millis.min(i64::MAX as u64) as i64)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            name: self.name.clone(),
            core_pool_size: self.core_pool_size,
            max_pool_size: self.max_pool_size,
            queue_capacity: self.queue_capacity,
            keep_alive: Duration::from_millis(self.keep_alive_time_in_millis),
            rejection_policy: self.rejection_policy,
        }
    }
}

fn parse_into<T: FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) -> ConfigResult<()>
where
    T::Err: std::fmt::Display,
{
    if let Some(raw) = env(key) {
        *target = raw.trim().parse().map_err(|e| {
            ConfigError::invalid(format!("{ENV_PREFIX}{key}: cannot parse {raw:?}: {e}"))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = JobExecutorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_jobs_per_acquisition, 3);
        assert_eq!(config.lock_time_in_millis, 300_000);
        assert_eq!(config.backoff_decrease_threshold, 100);
        assert_eq!(config.rejection_policy, RejectionPolicy::AbortAndLog);
        assert!(config.priority_range().unwrap().is_unbounded());
    }

    #[test]
    fn inverted_priority_range_fails_fast() {
        let err = JobExecutorConfig::default()
            .with_priority_range(10, 5)
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPriorityRange { min: 10, max: 5 }));
        assert!(err.to_string().contains("min (10) must not exceed max (5)"));
    }

    #[test]
    fn single_point_priority_range_is_accepted() {
        JobExecutorConfig::default()
            .with_priority_range(7, 7)
            .validate()
            .unwrap();
    }

    #[test]
    fn inconsistent_pool_is_rejected() {
        assert!(JobExecutorConfig::default().with_pool(0, 1, 1).validate().is_err());
        assert!(JobExecutorConfig::default().with_pool(4, 2, 1).validate().is_err());
        assert!(JobExecutorConfig::default().with_pool(2, 2, 0).validate().is_ok());
    }

    #[test]
    fn zero_page_size_or_lock_time_is_rejected() {
        assert!(JobExecutorConfig::default()
            .with_max_jobs_per_acquisition(0)
            .validate()
            .is_err());
        assert!(JobExecutorConfig::default()
            .with_lock_time(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn timer_preference_with_priority_only_warns() {
        JobExecutorConfig::default()
            .with_prefer_timer_jobs(true)
            .with_acquire_by_priority(true)
            .validate()
            .unwrap();
    }

    #[test]
    fn parses_camel_case_json() {
        let config = JobExecutorConfig::from_json_str(
            r#"{
                "maxJobsPerAcquisition": 10,
                "acquireByPriority": true,
                "priorityRangeMin": 5,
                "priorityRangeMax": 15,
                "rejectionPolicy": "callerRuns",
                "failedJobRetry": { "baseDelayMillis": 1000, "backoff": "exponential" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.max_jobs_per_acquisition, 10);
        assert!(config.acquire_by_priority);
        assert_eq!(config.priority_range().unwrap(), PriorityRange::new(5, 15).unwrap());
        assert_eq!(config.rejection_policy, RejectionPolicy::CallerRuns);
        assert_eq!(config.failed_job_retry.base_delay_millis, 1000);
        assert_eq!(config.lock_time_in_millis, 300_000);
    }

    #[test]
    fn json_with_inverted_range_is_rejected() {
        let err = JobExecutorConfig::from_json_str(
            r#"{ "priorityRangeMin": 10, "priorityRangeMax": 5 }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPriorityRange { .. }));
    }

    #[test]
    fn environment_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("JOBEXEC_MAX_JOBS_PER_ACQUISITION", "8"),
            ("JOBEXEC_ACQUIRE_WITH_SKIP_LOCKED", "true"),
            ("JOBEXEC_PRIORITY_RANGE_MIN", "-5"),
            ("JOBEXEC_REJECTION_POLICY", "discard"),
            ("JOBEXEC_LOCK_OWNER", "node-a"),
        ]);
        let config =
            JobExecutorConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.max_jobs_per_acquisition, 8);
        assert!(config.acquire_with_skip_locked);
        assert_eq!(config.priority_range_min, -5);
        assert_eq!(config.rejection_policy, RejectionPolicy::Discard);
        assert_eq!(config.lock_owner, "node-a");
    }

    #[test]
    fn unparsable_environment_value_is_an_error() {
        let err = JobExecutorConfig::from_lookup(|k| {
            (k == "JOBEXEC_CORE_POOL_SIZE").then(|| "many".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("JOBEXEC_CORE_POOL_SIZE"));
    }
}

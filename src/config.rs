use std::time::Duration;

/// Endpoints of the external collaborators. The embedded engines ignore
/// these; they are read from the environment and logged so a deployment
/// against real stores sees the same configuration surface.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub scylla_hosts: Vec<String>,
    pub redis_addr: String,
    pub kafka_brokers: String,
    pub sqs_endpoint: String,
    pub s3_endpoint: String,
    pub etcd_endpoints: Vec<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            scylla_hosts: vec!["scheduler-scylla".to_string()],
            redis_addr: "scheduler-redis:6379".to_string(),
            kafka_brokers: "scheduler-kafka:29092".to_string(),
            sqs_endpoint: "http://scheduler-sqs:9324".to_string(),
            s3_endpoint: "http://scheduler-s3:4566".to_string(),
            etcd_endpoints: vec!["scheduler-etcd:2379".to_string()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Shard-space cardinality S. Deployment constant; changing it with
    /// live state requires a migration.
    pub shard_count: u32,
    /// Payloads larger than this many bytes are offloaded to blob storage.
    pub inline_payload_max: usize,
    /// Period of each picker's shard scan cycle.
    pub scan_period: Duration,
    /// Worker long-poll wait on the execution bus.
    pub poll_wait: Duration,
    /// Execution bus per-message visibility timeout.
    pub visibility_timeout: Duration,
    /// Coordinator reconcile period.
    pub coordinator_period: Duration,
    /// TTL of picker presence and leader leases.
    pub lease_ttl: Duration,
    /// Delay before a picker starts scanning newly acquired shards.
    pub handoff_grace: Duration,
    /// Period of the reconciliation sweep.
    pub sweep_period: Duration,
    /// Queue rows older than this with a terminal job are swept out.
    pub stale_after: Duration,
    /// Upper bound on stored run output, in bytes.
    pub output_limit: usize,
    pub backends: BackendConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            shard_count: 1024,
            inline_payload_max: 1024,
            scan_period: Duration::from_secs(1),
            poll_wait: Duration::from_secs(5),
            visibility_timeout: Duration::from_secs(30),
            coordinator_period: Duration::from_secs(5),
            lease_ttl: Duration::from_secs(5),
            handoff_grace: Duration::from_secs(5),
            sweep_period: Duration::from_secs(30),
            stale_after: Duration::from_secs(3600),
            output_limit: 64 * 1024,
            backends: BackendConfig::default(),
        }
    }
}

fn env_list(name: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => v.split(',').map(|s| s.trim().to_string()).collect(),
        _ => default.iter().map(|s| s.to_string()).collect(),
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl SchedulerConfig {
    /// Build a configuration from the environment, falling back to the
    /// defaults above for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            shard_count: env_u64("SHARD_COUNT", defaults.shard_count as u64) as u32,
            inline_payload_max: env_u64(
                "INLINE_PAYLOAD_MAX",
                defaults.inline_payload_max as u64,
            ) as usize,
            scan_period: Duration::from_millis(env_u64("SCAN_PERIOD_MS", 1000)),
            poll_wait: Duration::from_secs(env_u64("POLL_WAIT_SECS", 5)),
            visibility_timeout: Duration::from_secs(env_u64("VISIBILITY_TIMEOUT_SECS", 30)),
            coordinator_period: Duration::from_secs(env_u64("COORDINATOR_PERIOD_SECS", 5)),
            lease_ttl: Duration::from_secs(env_u64("LEASE_TTL_SECS", 5)),
            handoff_grace: Duration::from_secs(env_u64("HANDOFF_GRACE_SECS", 5)),
            sweep_period: Duration::from_secs(env_u64("SWEEP_PERIOD_SECS", 30)),
            stale_after: Duration::from_secs(env_u64("STALE_AFTER_SECS", 3600)),
            output_limit: defaults.output_limit,
            backends: BackendConfig {
                scylla_hosts: env_list("SCYLLA_HOSTS", &["scheduler-scylla"]),
                redis_addr: env_string("REDIS_ADDR", "scheduler-redis:6379"),
                kafka_brokers: env_string("KAFKA_BROKERS", "scheduler-kafka:29092"),
                sqs_endpoint: env_string("SQS_ENDPOINT", "http://scheduler-sqs:9324"),
                s3_endpoint: env_string("S3_ENDPOINT", "http://scheduler-s3:4566"),
                etcd_endpoints: env_list("ETCD_ENDPOINTS", &["scheduler-etcd:2379"]),
            },
        }
    }

    /// Scaled-down timings for integration tests.
    pub fn for_tests() -> Self {
        Self {
            shard_count: 16,
            scan_period: Duration::from_millis(50),
            poll_wait: Duration::from_millis(100),
            visibility_timeout: Duration::from_secs(2),
            coordinator_period: Duration::from_millis(200),
            lease_ttl: Duration::from_millis(500),
            handoff_grace: Duration::from_millis(100),
            sweep_period: Duration::from_millis(500),
            stale_after: Duration::from_secs(3600),
            ..Self::default()
        }
    }
}

//! Configuration for the match allocator.

use anyhow::Result;

/// Process configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen port.
    pub port: u16,

    /// Port the worker agent listens on, on every VM.
    pub worker_port: u16,

    /// Maximum concurrent matches per VM.
    pub full_match_limit: u32,

    /// Pool ceiling: never launch beyond this many VMs.
    pub max_backup_vms: usize,

    /// Pool floor: the reconciler tops the pool back up to this size.
    pub min_backup_vms: usize,

    /// Free-slot total at or below which a scale-up launch is triggered.
    pub near_capacity_threshold: u32,

    /// Consecutive failed probes before a VM is eligible for termination.
    pub vm_unreachable_terminate_threshold: u32,

    /// Minimum VM age in minutes before it is eligible for termination.
    pub vm_age_terminate_minutes: i64,

    /// Timeout for worker `status` probes, in milliseconds.
    pub status_timeout_ms: u64,

    /// Reconciler period, in milliseconds.
    pub update_interval_ms: u64,

    /// Minutes of protected-VM idleness before protection rotates.
    pub protected_idle_rotate_minutes: i64,

    /// Whether the reconciler drops match records whose VM is gone.
    pub match_sweep: bool,

    /// Cloud provider selector. Only `mock` is built in; the production
    /// provider plugs in behind the `CloudProvider` trait.
    pub cloud_provider: String,

    /// Launch template submitted with every `run_one`.
    pub vm_template: crate::cloud::VmTemplate,

    /// Secret forwarded to the worker on `start-match`.
    pub playfab_secret_key: String,

    /// Log level fallback when RUST_LOG is unset.
    pub log_level: String,

    /// Maximum describe polls while waiting for a launched VM.
    pub launch_max_poll: u32,

    /// Base delay between launch polls, in milliseconds.
    pub launch_poll_base_delay_ms: u64,

    /// Per-attempt escalation added to the launch poll delay, in milliseconds.
    pub launch_poll_delay_step_ms: u64,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let vm_template = crate::cloud::VmTemplate {
            image_id: std::env::var("VM_IMAGE_ID").unwrap_or_else(|_| "img-default".to_string()),
            instance_type: std::env::var("VM_INSTANCE_TYPE")
                .unwrap_or_else(|_| "standard.medium".to_string()),
            zone: std::env::var("VM_ZONE").unwrap_or_else(|_| "zone-a".to_string()),
            vpc_id: std::env::var("VM_VPC_ID").unwrap_or_default(),
            subnet_id: std::env::var("VM_SUBNET_ID").unwrap_or_default(),
            security_group_id: std::env::var("VM_SECURITY_GROUP_ID").unwrap_or_default(),
            bandwidth_mbps: env_parse("VM_BANDWIDTH_MBPS", 100),
            name_prefix: std::env::var("VM_NAME_PREFIX")
                .unwrap_or_else(|_| "match-server".to_string()),
        };

        Ok(Self {
            port: env_parse("PORT", 7777),
            worker_port: env_parse("WORKER_PORT", 7777),
            full_match_limit: env_parse("FULL_MATCH_LIMIT", 5),
            max_backup_vms: env_parse("MAX_BACKUP_VMS", 10),
            min_backup_vms: env_parse("MIN_BACKUP_VMS", 1),
            near_capacity_threshold: env_parse("NEAR_CAPACITY_THRESHOLD", 1),
            vm_unreachable_terminate_threshold: env_parse("VM_UNREACHABLE_TERMINATE_THRESHOLD", 2),
            vm_age_terminate_minutes: env_parse("VM_AGE_TERMINATE_MINUTES", 5),
            status_timeout_ms: env_parse("STATUS_TIMEOUT_MS", 5000),
            update_interval_ms: env_parse("UPDATE_INTERVAL_MS", 30_000),
            protected_idle_rotate_minutes: env_parse("PROTECTED_IDLE_ROTATE_MINUTES", 60),
            match_sweep: std::env::var("MATCH_SWEEP")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            cloud_provider: std::env::var("CLOUD_PROVIDER").unwrap_or_else(|_| "mock".to_string()),
            vm_template,
            playfab_secret_key: std::env::var("PLAYFAB_SECRET_KEY").unwrap_or_default(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            launch_max_poll: 40,
            launch_poll_base_delay_ms: 5000,
            launch_poll_delay_step_ms: 250,
        })
    }
}

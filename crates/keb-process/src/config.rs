// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.
//!
//! Every process reads its settings with one prefix: `APP_` for the archiver,
//! the deprovisioner and the environments cleanup, `RUNTIME_RECONCILER_` for
//! the credential reconciler. Durations accept `500ms`, `2s`, `1m`, `24h` and
//! combinations such as `1h30m`; a bare number is read as seconds.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use keb_clients::broker::BrokerConfig;
use keb_clients::edp::EdpConfig;
use keb_core::plans;

use crate::logging::LogConfig;

/// Prefix of the archiver, deprovisioner and environments cleanup.
pub const APP_PREFIX: &str = "APP_";

/// Prefix of the credential reconciler.
pub const RECONCILER_PREFIX: &str = "RUNTIME_RECONCILER_";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(String),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(String, &'static str),
}

/// Prefixed view of the process environment.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Env<'a> {
    prefix: &'a str,
}

impl<'a> Env<'a> {
    pub(crate) fn new(prefix: &'a str) -> Self {
        Self { prefix }
    }

    pub(crate) fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Value of a variable; empty values count as unset.
    pub(crate) fn get(&self, name: &str) -> Option<String> {
        std::env::var(self.key(name))
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    pub(crate) fn required(&self, name: &str) -> Result<String, ConfigError> {
        self.get(name)
            .ok_or_else(|| ConfigError::Missing(self.key(name)))
    }

    pub(crate) fn string(&self, name: &str, default: &str) -> String {
        self.get(name).unwrap_or_else(|| default.to_string())
    }

    pub(crate) fn bool(&self, name: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(name) {
            None => Ok(default),
            Some(v) => match v.to_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(true),
                "false" | "0" | "no" => Ok(false),
                _ => Err(ConfigError::Invalid(self.key(name), "must be true or false")),
            },
        }
    }

    pub(crate) fn parse<T: FromStr>(
        &self,
        name: &str,
        default: T,
        hint: &'static str,
    ) -> Result<T, ConfigError> {
        match self.get(name) {
            None => Ok(default),
            Some(v) => v
                .parse()
                .map_err(|_| ConfigError::Invalid(self.key(name), hint)),
        }
    }

    pub(crate) fn duration(&self, name: &str, default: Duration) -> Result<Duration, ConfigError> {
        match self.get(name) {
            None => Ok(default),
            Some(v) => parse_duration(&v).ok_or_else(|| {
                ConfigError::Invalid(self.key(name), "must be a duration like 500ms, 30s or 1h")
            }),
        }
    }

    /// Comma-separated list; `None` when unset.
    pub(crate) fn list(&self, name: &str) -> Option<Vec<String>> {
        self.get(name).map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
    }
}

/// Parse a duration such as `500ms`, `2s`, `1m`, `24h` or `1h30m`.
///
/// A bare number is read as seconds.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Ok(secs) = input.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit())?;
        if digits == 0 {
            return None;
        }
        let value: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        total += match unit {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.checked_mul(60)?),
            "h" => Duration::from_secs(value.checked_mul(3600)?),
            _ => return None,
        };
    }
    Some(total)
}

// ============================================================================
// Database
// ============================================================================

/// Storage access and the field-encryption key.
#[derive(Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL or SQLite connection URL
    pub url: String,
    /// Key for field-level encryption; empty disables encryption
    pub secret_key: String,
    /// Maximum pool size
    pub max_connections: u32,
}

impl DatabaseConfig {
    /// Load database settings.
    ///
    /// `DATABASE_URL` is used verbatim when it starts with `postgres://`,
    /// `postgresql://` or `sqlite:`. Otherwise it is read as the host and a
    /// PostgreSQL URL is assembled from `DATABASE_HOST`, `DATABASE_PORT`
    /// (default 5432), `DATABASE_USER`, `DATABASE_PASSWORD`, `DATABASE_NAME`
    /// and `DATABASE_SSLMODE` (default `disable`).
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        let env = Env::new(prefix);

        let url = match env.get("DATABASE_URL") {
            Some(url) if is_connection_url(&url) => url,
            host => {
                let host = host
                    .or_else(|| env.get("DATABASE_HOST"))
                    .ok_or_else(|| ConfigError::Missing(env.key("DATABASE_URL")))?;
                let port: u16 =
                    env.parse("DATABASE_PORT", 5432, "must be a valid port number")?;
                let user = env.required("DATABASE_USER")?;
                let password = env.get("DATABASE_PASSWORD").unwrap_or_default();
                let name = env.required("DATABASE_NAME")?;
                let sslmode = env.string("DATABASE_SSLMODE", "disable");
                format!("postgres://{user}:{password}@{host}:{port}/{name}?sslmode={sslmode}")
            }
        };

        let max_connections: u32 = env.parse(
            "DATABASE_MAX_CONNECTIONS",
            10,
            "must be a positive integer",
        )?;
        if max_connections == 0 {
            return Err(ConfigError::Invalid(
                env.key("DATABASE_MAX_CONNECTIONS"),
                "must be a positive integer",
            ));
        }

        Ok(Self {
            url,
            secret_key: env.get("DATABASE_SECRET_KEY").unwrap_or_default(),
            max_connections,
        })
    }

    pub fn is_sqlite(&self) -> bool {
        self.url.starts_with("sqlite:")
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &redact_password(&self.url))
            .field("secret_key", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

fn is_connection_url(url: &str) -> bool {
    url.starts_with("postgres://") || url.starts_with("postgresql://") || url.starts_with("sqlite:")
}

fn redact_password(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            let credentials = &url[scheme + 3..at];
            match credentials.split_once(':') {
                Some((user, _)) => format!("{}{}:***{}", &url[..scheme + 3], user, &url[at..]),
                None => url.to_string(),
            }
        }
        _ => url.to_string(),
    }
}

// ============================================================================
// Archiver
// ============================================================================

/// Settings of the `keb-archiver` job.
#[derive(Debug, Clone)]
pub struct ArchiverConfig {
    pub database: DatabaseConfig,
    pub log: LogConfig,
    /// Read and validate only (default: true)
    pub dry_run: bool,
    /// Delete operation rows after archiving (default: false)
    pub perform_deletion: bool,
    /// Instances per batch (default: 50)
    pub batch_size: i64,
}

impl ArchiverConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let env = Env::new(APP_PREFIX);
        let batch_size: i64 = env.parse("BATCH_SIZE", 50, "must be a positive integer")?;
        if batch_size <= 0 {
            return Err(ConfigError::Invalid(
                env.key("BATCH_SIZE"),
                "must be a positive integer",
            ));
        }

        Ok(Self {
            database: DatabaseConfig::from_env(APP_PREFIX)?,
            log: LogConfig::from_env(APP_PREFIX)?,
            dry_run: env.bool("DRY_RUN", true)?,
            perform_deletion: env.bool("PERFORM_DELETION", false)?,
            batch_size,
        })
    }
}

// ============================================================================
// Credential reconciler
// ============================================================================

/// Settings of the `keb-runtime-reconciler` process.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub database: DatabaseConfig,
    pub log: LogConfig,
    /// Compare only, never write secrets (default: true)
    pub dry_run: bool,
    /// Run the periodic job at all (default: false)
    pub job_enabled: bool,
    /// Time between sweeps (`JOB_INTERVAL_MINUTES`, default: 24 minutes)
    pub job_interval: Duration,
    /// Pause before each instance of a sweep (default: 0s)
    pub job_reconciliation_delay: Duration,
    /// Bound on single cluster calls (default: 10s)
    pub cluster_operation_timeout: Duration,
    /// Emit the secret-state gauge (default: false)
    pub metrics_enabled: bool,
}

impl ReconcilerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let env = Env::new(RECONCILER_PREFIX);

        let interval_key = if env.get("JOB_INTERVAL_MINUTES").is_some() {
            "JOB_INTERVAL_MINUTES"
        } else {
            "JOB_INTERVAL"
        };
        let minutes: u64 = env.parse(interval_key, 24, "must be a number of minutes")?;
        if minutes == 0 {
            return Err(ConfigError::Invalid(
                env.key(interval_key),
                "must be a number of minutes",
            ));
        }

        Ok(Self {
            database: DatabaseConfig::from_env(RECONCILER_PREFIX)?,
            log: LogConfig::from_env(RECONCILER_PREFIX)?,
            dry_run: env.bool("DRY_RUN", true)?,
            job_enabled: env.bool("JOB_ENABLED", false)?,
            job_interval: Duration::from_secs(minutes * 60),
            job_reconciliation_delay: env.duration("JOB_RECONCILIATION_DELAY", Duration::ZERO)?,
            cluster_operation_timeout: env
                .duration("CLUSTER_OPERATION_TIMEOUT", Duration::from_secs(10))?,
            metrics_enabled: env.bool("METRICS_ENABLED", false)?,
        })
    }
}

// ============================================================================
// Broker
// ============================================================================

/// OAuth2 client-credentials access to the broker API.
pub fn broker_config_from_env(prefix: &str) -> Result<BrokerConfig, ConfigError> {
    let env = Env::new(prefix);
    Ok(BrokerConfig {
        url: env.required("BROKER_URL")?,
        token_url: env.get("BROKER_TOKEN_URL").unwrap_or_default(),
        client_id: env.get("BROKER_CLIENT_ID").unwrap_or_default(),
        client_secret: env.get("BROKER_CLIENT_SECRET").unwrap_or_default(),
        scope: env.get("BROKER_SCOPE").unwrap_or_default(),
    })
}

// ============================================================================
// Deprovisioning
// ============================================================================

/// Enables a pipeline step and optionally keeps it read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepSwitch {
    pub enabled: bool,
    pub dry_run: bool,
}

impl Default for StepSwitch {
    fn default() -> Self {
        Self {
            enabled: false,
            dry_run: true,
        }
    }
}

/// Settings of the `keb-deprovisioner` worker.
#[derive(Debug, Clone)]
pub struct DeprovisioningConfig {
    pub database: DatabaseConfig,
    pub log: LogConfig,
    /// Operations executed in parallel (default: 20)
    pub workers: usize,
    /// Time between scans for not-finished operations (default: 5s)
    pub poll_interval: Duration,
    /// Total budget of one operation, from its creation (default: 24h)
    pub operation_timeout: Duration,
    /// How long a step is retried in place before the operation is requeued (default: 2m)
    pub max_step_processing_time: Duration,
    /// Bound on waiting for the Kyma resource to disappear (default: 30s)
    pub kyma_resource_deletion_timeout: Duration,
    /// Bound on waiting for the Runtime resource to disappear (default: 1h)
    pub runtime_resource_deletion_timeout: Duration,
    /// Legacy provisioner endpoint; empty disables the provisioner steps
    pub provisioner_url: String,
    /// Bound on provisioner-side deprovisioning (default: 12h)
    pub provisioner_deprovisioning_timeout: Duration,
    pub edp: EdpConfig,
    /// Plans whose hyperscaler subscription is never released
    pub subscription_release_excluded_plans: Vec<String>,
    pub archive: StepSwitch,
    pub cleaning: StepSwitch,
    /// Gardener project holding the secret bindings
    pub gardener_project: String,
    /// Kubeconfig of the gardener cluster; unset uses the in-cluster config
    pub gardener_kubeconfig_path: Option<String>,
    /// ConfigMap with per-plan runtime configuration (in `kcp-system`)
    pub runtime_configuration_configmap: String,
    /// Bound on single cluster calls (default: 10s)
    pub cluster_operation_timeout: Duration,
}

impl DeprovisioningConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let env = Env::new(APP_PREFIX);

        let workers: usize = env.parse("DEPROVISIONING_WORKERS", 20, "must be a positive integer")?;
        if workers == 0 {
            return Err(ConfigError::Invalid(
                env.key("DEPROVISIONING_WORKERS"),
                "must be a positive integer",
            ));
        }

        let edp = EdpConfig {
            auth_url: env.get("EDP_AUTH_URL").unwrap_or_default(),
            admin_url: env.get("EDP_ADMIN_URL").unwrap_or_default(),
            namespace: env.get("EDP_NAMESPACE").unwrap_or_default(),
            secret: env.get("EDP_SECRET").unwrap_or_default(),
            environment: env.string("EDP_ENVIRONMENT", "prod"),
            disabled: env.bool("EDP_DISABLED", false)?,
        };

        Ok(Self {
            database: DatabaseConfig::from_env(APP_PREFIX)?,
            log: LogConfig::from_env(APP_PREFIX)?,
            workers,
            poll_interval: env.duration("DEPROVISIONING_POLL_INTERVAL", Duration::from_secs(5))?,
            operation_timeout: env.duration("OPERATION_TIMEOUT", Duration::from_secs(24 * 3600))?,
            max_step_processing_time: env
                .duration("MAX_STEP_PROCESSING_TIME", Duration::from_secs(120))?,
            kyma_resource_deletion_timeout: env
                .duration("KYMA_RESOURCE_DELETION_TIMEOUT", Duration::from_secs(30))?,
            runtime_resource_deletion_timeout: env
                .duration("RUNTIME_RESOURCE_DELETION_TIMEOUT", Duration::from_secs(3600))?,
            provisioner_url: env.get("PROVISIONER_URL").unwrap_or_default(),
            provisioner_deprovisioning_timeout: env
                .duration("PROVISIONER_DEPROVISIONING_TIMEOUT", Duration::from_secs(12 * 3600))?,
            edp,
            subscription_release_excluded_plans: env
                .list("SUBSCRIPTION_RELEASE_EXCLUDED_PLANS")
                .unwrap_or_else(plans::default_subscription_release_exclusions),
            archive: StepSwitch {
                enabled: env.bool("ARCHIVE_ENABLED", false)?,
                dry_run: env.bool("ARCHIVE_DRY_RUN", true)?,
            },
            cleaning: StepSwitch {
                enabled: env.bool("CLEANING_ENABLED", false)?,
                dry_run: env.bool("CLEANING_DRY_RUN", true)?,
            },
            gardener_project: env.string("GARDENER_PROJECT", "kyma-dev"),
            gardener_kubeconfig_path: env.get("GARDENER_KUBECONFIG_PATH"),
            runtime_configuration_configmap: env
                .string("RUNTIME_CONFIGURATION_CONFIGMAP", "keb-runtime-config"),
            cluster_operation_timeout: env
                .duration("CLUSTER_OPERATION_TIMEOUT", Duration::from_secs(10))?,
        })
    }
}

// ============================================================================
// Environments cleanup
// ============================================================================

/// Settings of the `keb-environments-cleanup` job.
#[derive(Debug, Clone)]
pub struct EnvironmentsCleanupConfig {
    pub database: DatabaseConfig,
    pub log: LogConfig,
    pub broker: BrokerConfig,
    /// Shoots younger than this are left alone (default: 24h)
    pub max_age: Duration,
    /// Label selector applied when listing shoots
    pub label_selector: String,
    pub gardener_project: String,
    pub gardener_kubeconfig_path: Option<String>,
    /// The job refuses to run unless the landscape reports this domain
    pub expected_domain: Option<String>,
    /// ConfigMap holding the landscape domain, as `(namespace, name)`
    pub environment_configmap: (String, String),
    /// Data key of the domain in that ConfigMap (default: `domain`)
    pub environment_domain_key: String,
    pub cluster_operation_timeout: Duration,
}

impl EnvironmentsCleanupConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let env = Env::new(APP_PREFIX);

        let max_age = match env.get("MAX_AGE_HOURS") {
            None => Duration::from_secs(24 * 3600),
            Some(v) => match v.parse::<u64>() {
                Ok(hours) => Duration::from_secs(hours * 3600),
                Err(_) => parse_duration(&v).ok_or_else(|| {
                    ConfigError::Invalid(
                        env.key("MAX_AGE_HOURS"),
                        "must be a number of hours or a duration",
                    )
                })?,
            },
        };

        let configmap = env.string("ENVIRONMENT_CONFIGMAP", "kcp-system/keb-environment");
        let environment_configmap = match configmap.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() => {
                (ns.to_string(), name.to_string())
            }
            _ => {
                return Err(ConfigError::Invalid(
                    env.key("ENVIRONMENT_CONFIGMAP"),
                    "must be namespace/name",
                ));
            }
        };

        Ok(Self {
            database: DatabaseConfig::from_env(APP_PREFIX)?,
            log: LogConfig::from_env(APP_PREFIX)?,
            broker: broker_config_from_env(APP_PREFIX)?,
            max_age,
            label_selector: env.string("LABEL_SELECTOR", "owner.do-not-delete!=true"),
            gardener_project: env.string("GARDENER_PROJECT", "kyma-dev"),
            gardener_kubeconfig_path: env.get("GARDENER_KUBECONFIG_PATH"),
            expected_domain: env.get("EXPECTED_DOMAIN"),
            environment_configmap,
            environment_domain_key: env.string("ENVIRONMENT_DOMAIN_KEY", "domain"),
            cluster_operation_timeout: env
                .duration("CLUSTER_OPERATION_TIMEOUT", Duration::from_secs(10))?,
        })
    }
}

/// Gardener namespace of a project.
pub fn gardener_namespace(project: &str) -> String {
    format!("garden-{project}")
}

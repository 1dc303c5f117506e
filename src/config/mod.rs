use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_PORT: u16 = 4302;

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

// ─── InvitationConfig ─────────────────────────────────────────────────────────

/// Invitation lifecycle configuration (`[invitations]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InvitationConfig {
    /// Days an invitation stays redeemable after issuance. Default: 7.
    pub ttl_days: u32,
    /// Seconds between background sweeps that expire overdue invitations.
    /// Set to 0 to disable the sweeper. Default: 3600.
    pub sweep_interval_secs: u64,
}

impl Default for InvitationConfig {
    fn default() -> Self {
        Self {
            ttl_days: 7,
            sweep_interval_secs: 3600,
        }
    }
}

// ─── ProvisioningConfig ───────────────────────────────────────────────────────

/// Provisioning concurrency knobs (`[provisioning]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Bounded wait for the invitation lock (milliseconds). Default: 2000.
    pub lock_wait_ms: u64,
    /// Attempts the employee code allocator makes before reporting
    /// contention. Default: 5.
    pub allocator_max_attempts: u32,
    /// Prefix for generated employee codes. Default: "EMP".
    pub employee_code_prefix: String,
    /// Minimum digits in the numeric part of an employee code; longer
    /// numbers keep all their digits. Default: 3 (EMP001).
    pub employee_code_width: usize,
    /// How many times a confirmation is re-attempted in place when it hits
    /// transient contention. Default: 3.
    pub confirm_max_attempts: u32,
    /// Delay before the first in-place confirmation retry (milliseconds).
    /// Default: 50.
    pub confirm_retry_delay_ms: u64,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            lock_wait_ms: 2000,
            allocator_max_attempts: 5,
            employee_code_prefix: "EMP".to_string(),
            employee_code_width: 3,
            confirm_max_attempts: 3,
            confirm_retry_delay_ms: 50,
        }
    }
}

// ─── ObservabilityConfig ─────────────────────────────────────────────────────

/// Observability configuration (`[observability]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log SQLite queries that exceed this threshold (milliseconds). Default: 100.
    /// Set to 0 to disable slow query logging.
    pub slow_query_threshold_ms: u64,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            slow_query_threshold_ms: 100,
        }
    }
}

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/config.toml`. All fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// HTTP server port (default: 4302).
    port: Option<u16>,
    /// Log level filter string, e.g. "debug", "info,tenantd=trace" (default: "info").
    log: Option<String>,
    /// Bind address for the HTTP server (default: "127.0.0.1"; use "0.0.0.0" for LAN access).
    bind_address: Option<String>,
    /// Log output format: "pretty" (default, human-readable) | "json" (structured for log aggregators).
    log_format: Option<String>,
    /// Bearer token required on administrative endpoints. None = admin auth
    /// disabled (local-only, trusted loopback use).
    admin_token: Option<String>,
    /// Invitation lifecycle settings (`[invitations]`).
    invitations: Option<InvitationConfig>,
    /// Provisioning concurrency settings (`[provisioning]`).
    provisioning: Option<ProvisioningConfig>,
    /// Observability settings (`[observability]`).
    observability: Option<ObservabilityConfig>,
    /// Invitation-type to role-name overrides (`[roles]`), e.g.
    /// `collaborator = "contractor"`. Unlisted types keep their defaults.
    roles: Option<HashMap<String, String>>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml, using defaults");
            None
        }
    }
}

// ─── ServiceConfig ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    /// Bind address for the HTTP server (TENANTD_BIND env var, default: "127.0.0.1").
    pub bind_address: String,
    /// Log output format: "pretty" (default) | "json" (structured for Loki/Elasticsearch).
    pub log_format: String,
    /// Bearer token required on administrative endpoints (TENANTD_ADMIN_TOKEN
    /// env var or `admin_token` in config.toml). None = admin auth disabled.
    pub admin_token: Option<String>,
    /// Invitation TTL and sweeper cadence.
    pub invitations: InvitationConfig,
    /// Lock wait, allocator bounds, confirmation retry.
    pub provisioning: ProvisioningConfig,
    /// Slow query threshold, future metrics settings.
    pub observability: ObservabilityConfig,
    /// Invitation-type to role-name mapping, defaults merged with any
    /// `[roles]` overrides from config.toml.
    pub roles: HashMap<String, String>,
}

impl ServiceConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env, passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(
        port: Option<u16>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
        bind_address: Option<String>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);

        // Load TOML as the lowest-priority override layer
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());

        let bind_address = bind_address
            .or(std::env::var("TENANTD_BIND").ok().filter(|s| !s.is_empty()))
            .or(toml.bind_address)
            .unwrap_or_else(default_bind_address);

        let log_format = std::env::var("TENANTD_LOG_FORMAT")
            .ok()
            .filter(|s| !s.is_empty())
            .or(toml.log_format)
            .unwrap_or_else(|| "pretty".to_string());

        let admin_token = std::env::var("TENANTD_ADMIN_TOKEN")
            .ok()
            .filter(|s| !s.is_empty())
            .or(toml.admin_token);

        let invitations = toml.invitations.unwrap_or_default();
        let provisioning = toml.provisioning.unwrap_or_default();
        let observability = toml.observability.unwrap_or_default();

        let mut roles = default_role_map();
        if let Some(overrides) = toml.roles {
            roles.extend(overrides);
        }

        Self {
            port,
            data_dir,
            log,
            bind_address,
            log_format,
            admin_token,
            invitations,
            provisioning,
            observability,
            roles,
        }
    }
}

/// Built-in invitation-type to role mapping. `[roles]` entries in
/// config.toml replace individual keys.
fn default_role_map() -> HashMap<String, String> {
    HashMap::from([
        ("tenant_owner".to_string(), "tenant_admin".to_string()),
        ("collaborator".to_string(), "employee".to_string()),
    ])
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        // ~/Library/Application Support/tenantd
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("tenantd");
        }
    }
    #[cfg(target_os = "linux")]
    {
        // $XDG_DATA_HOME/tenantd or ~/.local/share/tenantd
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("tenantd");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("tenantd");
        }
    }
    #[cfg(target_os = "windows")]
    {
        // %APPDATA%\tenantd
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("tenantd");
        }
    }
    // Fallback
    PathBuf::from(".tenantd")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_a_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServiceConfig::new(None, Some(dir.path().to_path_buf()), None, None);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.invitations.ttl_days, 7);
        assert_eq!(config.provisioning.employee_code_prefix, "EMP");
        assert_eq!(config.roles.get("tenant_owner").unwrap(), "tenant_admin");
        assert_eq!(config.roles.get("collaborator").unwrap(), "employee");
    }

    #[test]
    fn toml_overrides_defaults_and_cli_overrides_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            r#"
port = 5000
[invitations]
ttl_days = 14
[provisioning]
employee_code_prefix = "STAFF"
[roles]
collaborator = "contractor"
"#,
        )
        .unwrap();

        let config = ServiceConfig::new(None, Some(dir.path().to_path_buf()), None, None);
        assert_eq!(config.port, 5000);
        assert_eq!(config.invitations.ttl_days, 14);
        // Partial sections keep defaults for unset fields.
        assert_eq!(config.invitations.sweep_interval_secs, 3600);
        assert_eq!(config.provisioning.employee_code_prefix, "STAFF");
        assert_eq!(config.provisioning.lock_wait_ms, 2000);
        // Role overrides replace single keys, not the whole map.
        assert_eq!(config.roles.get("collaborator").unwrap(), "contractor");
        assert_eq!(config.roles.get("tenant_owner").unwrap(), "tenant_admin");

        let config = ServiceConfig::new(Some(6000), Some(dir.path().to_path_buf()), None, None);
        assert_eq!(config.port, 6000);
    }
}

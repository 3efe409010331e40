// config.rs - CLI/env-driven configuration. JSON config persistence and the
// on-disk model registry are external collaborators (out of scope); this
// module only resolves which devices to run workers on, where to bind, and
// the dispatcher's tunable timeouts.

use crate::dispatcher::DispatcherConfig;
use crate::error::{DispatchError, Result};
use clap::Parser;
use std::time::Duration;

/// Render dispatcher command-line interface, in the style of the teacher's
/// own `Args` (clap-derived, `--long` flags with sane defaults).
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Multi-device render task dispatcher", long_about = None)]
pub struct CliArgs {
    /// "auto", "cpu", or a comma-separated list of cuda:N tags.
    #[arg(long, env = "RENDER_DEVICES", default_value = "auto")]
    pub render_devices: String,

    /// Address the HTTP surface binds to.
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:9000")]
    pub bind_addr: String,

    /// Seconds a completed/queued task's cache entry survives without activity.
    #[arg(long, env = "TASK_TTL_SECS", default_value_t = 15 * 60)]
    pub task_ttl_secs: u64,

    /// Seconds to wait on the manager/cache mutex before giving up.
    #[arg(long, env = "LOCK_TIMEOUT_SECS", default_value_t = 15)]
    pub lock_timeout_secs: u64,

    /// Seconds to wait for a newly-started device to report readiness.
    #[arg(long, env = "DEVICE_START_TIMEOUT_SECS", default_value_t = 60)]
    pub device_start_timeout_secs: u64,

    /// Seconds the CPU worker may sit idle (with another device alive)
    /// before its model weights are unloaded.
    #[arg(long, env = "CPU_UNLOAD_TIMEOUT_SECS", default_value_t = 4 * 60)]
    pub cpu_unload_timeout_secs: u64,

    /// Logging verbosity, passed straight to env_logger's filter parser.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub render_devices: String,
    pub bind_addr: std::net::SocketAddr,
    pub task_ttl: Duration,
    pub lock_timeout: Duration,
    pub device_start_timeout: Duration,
    pub cpu_unload_timeout: Duration,
    pub log_level: String,
}

impl AppConfig {
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let bind_addr = args
            .bind_addr
            .parse()
            .map_err(|_| DispatchError::InvalidDeviceSpec(format!("invalid bind address: {}", args.bind_addr)))?;
        Ok(Self {
            render_devices: args.render_devices,
            bind_addr,
            task_ttl: Duration::from_secs(args.task_ttl_secs),
            lock_timeout: Duration::from_secs(args.lock_timeout_secs),
            device_start_timeout: Duration::from_secs(args.device_start_timeout_secs),
            cpu_unload_timeout: Duration::from_secs(args.cpu_unload_timeout_secs),
            log_level: args.log_level,
        })
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            lock_timeout: self.lock_timeout,
            task_ttl: self.task_ttl,
            device_start_timeout: self.device_start_timeout,
            cpu_unload_timeout: self.cpu_unload_timeout,
        }
    }
}

/// Expands a `RENDER_DEVICES` literal into the concrete device tags to run
/// workers on. `"auto"` falls back to a single CPU worker: without the real
/// `ModelRuntime` this crate has no way to enumerate physical GPUs, and a
/// CPU-only default keeps the dispatcher runnable out of the box.
pub fn resolve_render_devices(spec: &str) -> Result<Vec<String>> {
    let trimmed = spec.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("auto") {
        return Ok(vec!["cpu".to_string()]);
    }
    if trimmed.eq_ignore_ascii_case("cpu") {
        return Ok(vec!["cpu".to_string()]);
    }
    let mut devices = Vec::new();
    for part in trimmed.split(',') {
        let part = part.trim();
        if part == "cpu" || part.strip_prefix("cuda:").and_then(|n| n.parse::<u32>().ok()).is_some() {
            devices.push(part.to_string());
        } else {
            return Err(DispatchError::InvalidDeviceSpec(spec.to_string()));
        }
    }
    if devices.is_empty() {
        return Err(DispatchError::InvalidDeviceSpec(spec.to_string()));
    }
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_and_empty_default_to_cpu() {
        assert_eq!(resolve_render_devices("auto").unwrap(), vec!["cpu"]);
        assert_eq!(resolve_render_devices("").unwrap(), vec!["cpu"]);
    }

    #[test]
    fn parses_comma_separated_cuda_list() {
        assert_eq!(
            resolve_render_devices("cuda:0,cuda:1").unwrap(),
            vec!["cuda:0", "cuda:1"]
        );
    }

    #[test]
    fn rejects_garbage_device_tags() {
        assert!(resolve_render_devices("tpu:0").is_err());
        assert!(resolve_render_devices("cpu,nonsense").is_err());
    }

    #[test]
    fn app_config_plumbs_timeouts_from_cli_args() {
        let args = CliArgs {
            render_devices: "auto".into(),
            bind_addr: "127.0.0.1:9000".into(),
            task_ttl_secs: 30,
            lock_timeout_secs: 5,
            device_start_timeout_secs: 10,
            cpu_unload_timeout_secs: 20,
            log_level: "info".into(),
        };
        let config = AppConfig::from_args(args).unwrap();
        assert_eq!(config.task_ttl, Duration::from_secs(30));
        assert_eq!(config.lock_timeout, Duration::from_secs(5));
        assert_eq!(config.device_start_timeout, Duration::from_secs(10));
        assert_eq!(config.cpu_unload_timeout, Duration::from_secs(20));

        let dispatcher_config = config.dispatcher_config();
        assert_eq!(dispatcher_config.task_ttl, Duration::from_secs(30));
    }
}

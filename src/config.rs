//! Command line and environment configuration

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use k8s_openapi::api::core::v1::Taint;

use crate::{Error, Result};

/// Default cadence of the heartbeat, status and polling loops
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(5);

/// Default key of the node taint
pub const DEFAULT_TAINT_KEY: &str = "virtual-kubelet.io/provider";

/// Scheduling effect of the node taint
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum TaintEffect {
    #[default]
    #[value(name = "NoSchedule")]
    NoSchedule,
    #[value(name = "NoExecute")]
    NoExecute,
    #[value(name = "PreferNoSchedule")]
    PreferNoSchedule,
}

impl fmt::Display for TaintEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaintEffect::NoSchedule => "NoSchedule",
            TaintEffect::NoExecute => "NoExecute",
            TaintEffect::PreferNoSchedule => "PreferNoSchedule",
        };
        f.write_str(s)
    }
}

impl FromStr for TaintEffect {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NoSchedule" => Ok(TaintEffect::NoSchedule),
            "NoExecute" => Ok(TaintEffect::NoExecute),
            "PreferNoSchedule" => Ok(TaintEffect::PreferNoSchedule),
            other => Err(Error::InvalidArgument(format!(
                "taint effect {:?} is not supported",
                other
            ))),
        }
    }
}

/// Operating system the node advertises
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OperatingSystem {
    #[default]
    #[value(name = "Linux")]
    Linux,
    #[value(name = "Windows")]
    Windows,
}

impl fmt::Display for OperatingSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatingSystem::Linux => f.write_str("Linux"),
            OperatingSystem::Windows => f.write_str("Windows"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

/// Command line options
#[derive(Clone, Debug, Parser)]
#[command(name = "virtual-kubelet", about, version)]
pub struct Opts {
    /// Name of the virtual node
    #[arg(long, env = "DEFAULT_NODE_NAME", default_value = "virtual-kubelet")]
    pub nodename: String,

    /// Only watch pods in this namespace
    #[arg(long, env = "VKUBELET_NAMESPACE")]
    pub namespace: Option<String>,

    /// Operating system of the node
    #[arg(long, value_enum, default_value_t = OperatingSystem::Linux)]
    pub os: OperatingSystem,

    /// Backend provider
    #[arg(long, env = "VKUBELET_PROVIDER", default_value = "mock")]
    pub provider: String,

    /// Number of pod sync workers
    #[arg(long, default_value_t = 10)]
    pub pod_sync_workers: usize,

    /// Advertised kubelet port
    #[arg(long, env = "KUBELET_PORT", default_value_t = 10250)]
    pub kubelet_port: u16,

    /// Internal address advertised in the node status
    #[arg(long, env = "VKUBELET_POD_IP")]
    pub pod_ip: Option<String>,

    #[arg(long, env = "VKUBELET_TAINT_KEY", default_value = DEFAULT_TAINT_KEY)]
    pub taint_key: String,

    /// Taint value, defaults to the provider name
    #[arg(long, env = "VKUBELET_TAINT_VALUE")]
    pub taint_value: Option<String>,

    #[arg(long, env = "VKUBELET_TAINT_EFFECT", value_enum, default_value_t = TaintEffect::NoSchedule)]
    pub taint_effect: TaintEffect,

    /// Register the node without a taint
    #[arg(long)]
    pub disable_taint: bool,

    /// Heartbeat through node status updates only, without a node lease
    #[arg(long, env = "VKUBELET_DISABLE_LEASE")]
    pub disable_lease: bool,

    /// Port of the metrics and health server
    #[arg(long, env = "VKUBELET_METRICS_PORT", default_value_t = 10255)]
    pub metrics_port: u16,

    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

/// Validated engine configuration
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub node_name: String,
    pub namespace: Option<String>,
    pub operating_system: OperatingSystem,
    pub provider: String,
    pub pod_sync_workers: usize,
    pub kubelet_port: u16,
    pub pod_ip: Option<String>,
    pub taint: Option<Taint>,
    /// Skip the node lease and heartbeat through status updates only
    pub disable_lease: bool,
    pub heartbeat_interval: Duration,
    pub status_interval: Duration,
    pub poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_name: "virtual-kubelet".to_string(),
            namespace: None,
            operating_system: OperatingSystem::Linux,
            provider: "mock".to_string(),
            pod_sync_workers: 10,
            kubelet_port: 10250,
            pod_ip: None,
            taint: Some(node_taint(DEFAULT_TAINT_KEY, "mock", TaintEffect::NoSchedule)),
            disable_lease: false,
            heartbeat_interval: DEFAULT_SYNC_INTERVAL,
            status_interval: DEFAULT_SYNC_INTERVAL,
            poll_interval: DEFAULT_SYNC_INTERVAL,
        }
    }
}

fn node_taint(key: &str, value: &str, effect: TaintEffect) -> Taint {
    Taint {
        key: key.to_string(),
        value: Some(value.to_string()),
        effect: effect.to_string(),
        time_added: None,
    }
}

impl TryFrom<&Opts> for EngineConfig {
    type Error = Error;

    fn try_from(opts: &Opts) -> Result<Self> {
        if opts.pod_sync_workers == 0 {
            return Err(Error::InvalidArgument(
                "pod sync workers must be greater than 0".to_string(),
            ));
        }
        if opts.nodename.is_empty() {
            return Err(Error::InvalidArgument("node name must not be empty".to_string()));
        }

        let taint = if opts.disable_taint {
            None
        } else {
            let value = opts.taint_value.as_deref().unwrap_or(&opts.provider);
            Some(node_taint(&opts.taint_key, value, opts.taint_effect))
        };

        Ok(Self {
            node_name: opts.nodename.clone(),
            namespace: opts.namespace.clone().filter(|ns| !ns.is_empty()),
            operating_system: opts.os,
            provider: opts.provider.clone(),
            pod_sync_workers: opts.pod_sync_workers,
            kubelet_port: opts.kubelet_port,
            pod_ip: opts.pod_ip.clone().filter(|ip| !ip.is_empty()),
            taint,
            disable_lease: opts.disable_lease,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Opts {
        let mut argv = vec!["virtual-kubelet"];
        argv.extend_from_slice(args);
        Opts::parse_from(argv)
    }

    #[test]
    fn taint_defaults_to_provider_name() {
        let config = EngineConfig::try_from(&parse(&["--provider", "nomad"])).unwrap();
        let taint = config.taint.unwrap();
        assert_eq!(taint.key, DEFAULT_TAINT_KEY);
        assert_eq!(taint.value.as_deref(), Some("nomad"));
        assert_eq!(taint.effect, "NoSchedule");
    }

    #[test]
    fn taint_can_be_disabled() {
        let config = EngineConfig::try_from(&parse(&["--disable-taint"])).unwrap();
        assert!(config.taint.is_none());
    }

    #[test]
    fn leases_are_on_unless_disabled() {
        let config = EngineConfig::try_from(&parse(&[])).unwrap();
        assert!(!config.disable_lease);

        let config = EngineConfig::try_from(&parse(&["--disable-lease"])).unwrap();
        assert!(config.disable_lease);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = EngineConfig::try_from(&parse(&["--pod-sync-workers", "0"])).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn taint_effect_parses_known_values() {
        assert_eq!(
            "PreferNoSchedule".parse::<TaintEffect>().unwrap(),
            TaintEffect::PreferNoSchedule
        );
        assert!("Sometimes".parse::<TaintEffect>().is_err());
    }
}

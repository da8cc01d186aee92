//! Command line and environment configuration.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use k8s_openapi::api::core::v1::Taint;

use crate::provider::ProviderKind;

/// Namespace used for the state bridge when pods are watched in all namespaces
pub const DEFAULT_STATE_NAMESPACE: &str = "default";

/// fog-kubelet exposes every device of a fog controller as a Kubernetes node.
///
/// Nodes created this way do not run a kubelet; pod operations are forwarded
/// to the fog controller, which deploys them as flows on the device.
#[derive(Parser, Debug, Clone)]
#[command(name = "fog-kubelet", version, about, long_about = None, subcommand_negates_reqs = true)]
pub struct Config {
    /// Fog controller token
    #[arg(long = "fog-token", env = "FOG_TOKEN", hide_env_values = true, required = true)]
    controller_token: Option<String>,

    /// Fog controller URL
    #[arg(long = "fog-url", env = "FOG_URL", required = true)]
    controller_url: Option<String>,

    /// Path to a kubeconfig file (inferred from the environment when unset)
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Kubernetes namespace to watch pods in (empty means all namespaces)
    #[arg(long, env = "FOG_NAMESPACE", default_value = "")]
    pub namespace: String,

    /// Name prefix of the config maps holding pod/flow associations
    #[arg(long = "state-name", default_value = "fog-kubelet-store")]
    pub state_name: String,

    /// Operating system reported by the virtual nodes
    #[arg(long = "os", value_enum, default_value_t = OperatingSystem::Linux)]
    pub operating_system: OperatingSystem,

    /// Backend pod operations are forwarded to
    #[arg(long, value_enum, default_value_t = ProviderKind::Fleet)]
    pub provider: ProviderKind,

    /// Log level, e.g. "trace", "debug", "info", "warn", "error"
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,

    /// Number of pod synchronization workers per node
    #[arg(long = "pod-sync-workers", default_value_t = 10, value_parser = clap::value_parser!(u16).range(1..))]
    pub pod_sync_workers: u16,

    /// How often (in seconds) to perform a full resync of pods between
    /// Kubernetes and the provider
    #[arg(long = "full-resync-period", default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..))]
    pub full_resync_period: u64,

    /// Address of the fog controller notification server
    #[arg(long = "control-addr", default_value = "127.0.0.1:1234")]
    pub control_addr: SocketAddr,

    /// Port advertised as the kubelet daemon endpoint
    #[arg(long = "daemon-port", env = "KUBELET_PORT", default_value_t = 10250)]
    pub daemon_port: i32,

    /// Key of the taint applied to every virtual node
    #[arg(long = "taint-key", env = "VK_TAINT_KEY", default_value = "resource-type")]
    pub taint_key: String,

    /// Value of the taint applied to every virtual node
    #[arg(long = "taint-value", env = "VK_TAINT_VALUE", default_value = "fog-custom-resource")]
    pub taint_value: String,

    /// Effect of the taint applied to every virtual node
    #[arg(long = "taint-effect", env = "VK_TAINT_EFFECT", value_enum, default_value_t = TaintEffect::NoSchedule)]
    pub taint_effect: TaintEffect,

    /// Register nodes without a taint
    #[arg(long = "disable-taint")]
    pub disable_taint: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Print the version and exit
    Version,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingSystem {
    #[value(name = "Linux", alias = "linux")]
    Linux,
    #[value(name = "Windows", alias = "windows")]
    Windows,
}

impl OperatingSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatingSystem::Linux => "Linux",
            OperatingSystem::Windows => "Windows",
        }
    }
}

impl fmt::Display for OperatingSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaintEffect {
    #[value(name = "NoSchedule")]
    NoSchedule,
    #[value(name = "PreferNoSchedule")]
    PreferNoSchedule,
    #[value(name = "NoExecute")]
    NoExecute,
}

impl TaintEffect {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaintEffect::NoSchedule => "NoSchedule",
            TaintEffect::PreferNoSchedule => "PreferNoSchedule",
            TaintEffect::NoExecute => "NoExecute",
        }
    }
}

impl Config {
    /// Parse the configuration from process arguments and environment.
    pub fn new_from_flags() -> Self {
        Config::parse()
    }

    // Both are only absent when a subcommand was given.

    pub fn controller_token(&self) -> &str {
        self.controller_token.as_deref().unwrap_or_default()
    }

    pub fn controller_url(&self) -> &str {
        self.controller_url.as_deref().unwrap_or_default()
    }

    /// Taint registered on every virtual node, if any
    pub fn taint(&self) -> Option<Taint> {
        if self.disable_taint {
            return None;
        }
        Some(Taint {
            key: self.taint_key.clone(),
            value: Some(self.taint_value.clone()),
            effect: self.taint_effect.as_str().to_string(),
            time_added: None,
        })
    }

    /// Namespace the per-node state config maps live in
    pub fn state_namespace(&self) -> &str {
        if self.namespace.is_empty() {
            DEFAULT_STATE_NAMESPACE
        } else {
            &self.namespace
        }
    }

    pub fn full_resync_period(&self) -> Duration {
        Duration::from_secs(self.full_resync_period)
    }
}

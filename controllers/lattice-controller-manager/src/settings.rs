//! Controller manager settings, read from the environment.

use crate::error::ControllerError;
use crds::{DEFAULT_INTERNAL_NAMESPACE, GLOBAL_CONFIG_NAME};
use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// The controllers this binary can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ControllerKind {
    ComponentBuild,
    ServiceBuild,
    SystemBuild,
    Service,
    System,
    SystemLifecycle,
}

impl ControllerKind {
    /// Every controller, leaves first.
    pub const ALL: [Self; 6] = [
        Self::ComponentBuild,
        Self::ServiceBuild,
        Self::SystemBuild,
        Self::Service,
        Self::System,
        Self::SystemLifecycle,
    ];

    /// Name used in `ENABLED_CONTROLLERS`, logs and metric labels.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::ComponentBuild => "component-build",
            Self::ServiceBuild => "service-build",
            Self::SystemBuild => "system-build",
            Self::Service => "service",
            Self::System => "system",
            Self::SystemLifecycle => "system-lifecycle",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

impl fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Settings for the controller manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Namespace holding the cluster Config
    pub internal_namespace: String,
    /// Name of the cluster Config
    pub config_name: String,
    /// Restrict every watch to this namespace
    pub watch_namespace: Option<String>,
    /// Concurrent reconciles per controller
    pub workers: u16,
    /// Delay before reconciling a burst of events
    pub debounce: Duration,
    /// Controllers to start
    pub enabled: BTreeSet<ControllerKind>,
    /// Address of the metrics and probe server
    pub metrics_addr: SocketAddr,
    pub log_format: LogFormat,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            internal_namespace: DEFAULT_INTERNAL_NAMESPACE.to_string(),
            config_name: GLOBAL_CONFIG_NAME.to_string(),
            watch_namespace: None,
            workers: 4,
            debounce: Duration::from_secs(1),
            enabled: ControllerKind::ALL.into_iter().collect(),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            log_format: LogFormat::Text,
        }
    }
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`; unset or empty variables keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let mut settings = Self::default();

        if let Some(namespace) = get("LATTICE_INTERNAL_NAMESPACE") {
            settings.internal_namespace = namespace;
        }
        if let Some(name) = get("LATTICE_CONFIG_NAME") {
            settings.config_name = name;
        }
        settings.watch_namespace = get("WATCH_NAMESPACE");

        if let Some(workers) = get("CONTROLLER_WORKERS") {
            settings.workers = workers
                .trim()
                .parse()
                .ok()
                .filter(|w: &u16| *w > 0)
                .ok_or_else(|| {
                    ControllerError::InvalidConfig(format!(
                        "CONTROLLER_WORKERS must be a positive integer, got {workers:?}"
                    ))
                })?;
        }
        if let Some(debounce) = get("CONTROLLER_DEBOUNCE_SECS") {
            let secs: u64 = debounce.trim().parse().map_err(|_| {
                ControllerError::InvalidConfig(format!(
                    "CONTROLLER_DEBOUNCE_SECS must be a number of seconds, got {debounce:?}"
                ))
            })?;
            settings.debounce = Duration::from_secs(secs);
        }
        if let Some(enabled) = get("ENABLED_CONTROLLERS") {
            settings.enabled = parse_enabled(&enabled)?;
        }
        if let Some(addr) = get("METRICS_ADDR") {
            settings.metrics_addr = addr.trim().parse().map_err(|_| {
                ControllerError::InvalidConfig(format!(
                    "METRICS_ADDR must be a socket address, got {addr:?}"
                ))
            })?;
        }
        if let Some(format) = get("LOG_FORMAT") {
            settings.log_format = match format.trim() {
                "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                other => {
                    return Err(ControllerError::InvalidConfig(format!(
                        "LOG_FORMAT must be text or json, got {other:?}"
                    )));
                }
            };
        }

        Ok(settings)
    }

    /// Whether `kind` should be started.
    #[must_use]
    pub fn is_enabled(&self, kind: ControllerKind) -> bool {
        self.enabled.contains(&kind)
    }
}

fn parse_enabled(value: &str) -> Result<BTreeSet<ControllerKind>, ControllerError> {
    if value.trim() == "*" {
        return Ok(ControllerKind::ALL.into_iter().collect());
    }
    value
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| {
            ControllerKind::parse(name).ok_or_else(|| {
                ControllerError::InvalidConfig(format!("unknown controller {name:?}"))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings_from(vars: &[(&str, &str)]) -> Result<Settings, ControllerError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Settings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let settings = settings_from(&[]).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.internal_namespace, "lattice-internal");
        assert_eq!(settings.config_name, "global");
        assert_eq!(settings.workers, 4);
        assert_eq!(settings.metrics_addr.port(), 9090);
        assert!(ControllerKind::ALL.iter().all(|k| settings.is_enabled(*k)));
    }

    #[test]
    fn test_overrides() {
        let settings = settings_from(&[
            ("LATTICE_INTERNAL_NAMESPACE", "lattice-system"),
            ("WATCH_NAMESPACE", "tenant-a"),
            ("CONTROLLER_WORKERS", "8"),
            ("CONTROLLER_DEBOUNCE_SECS", "0"),
            ("ENABLED_CONTROLLERS", "component-build, service-build"),
            ("METRICS_ADDR", "127.0.0.1:8080"),
            ("LOG_FORMAT", "json"),
        ])
        .unwrap();

        assert_eq!(settings.internal_namespace, "lattice-system");
        assert_eq!(settings.watch_namespace.as_deref(), Some("tenant-a"));
        assert_eq!(settings.workers, 8);
        assert_eq!(settings.debounce, Duration::ZERO);
        assert!(settings.is_enabled(ControllerKind::ComponentBuild));
        assert!(settings.is_enabled(ControllerKind::ServiceBuild));
        assert!(!settings.is_enabled(ControllerKind::SystemLifecycle));
        assert_eq!(settings.metrics_addr.to_string(), "127.0.0.1:8080");
        assert_eq!(settings.log_format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            settings_from(&[("CONTROLLER_WORKERS", "0")]),
            Err(ControllerError::InvalidConfig(_))
        ));
        assert!(matches!(
            settings_from(&[("CONTROLLER_WORKERS", "many")]),
            Err(ControllerError::InvalidConfig(_))
        ));
        assert!(matches!(
            settings_from(&[("ENABLED_CONTROLLERS", "component-build,image-push")]),
            Err(ControllerError::InvalidConfig(_))
        ));
        assert!(matches!(
            settings_from(&[("METRICS_ADDR", "localhost")]),
            Err(ControllerError::InvalidConfig(_))
        ));
        assert!(matches!(
            settings_from(&[("LOG_FORMAT", "yaml")]),
            Err(ControllerError::InvalidConfig(_))
        ));
    }
}

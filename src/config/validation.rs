//! Configuration validation

use super::{Config, FilterDirection, PeerAddr, ProxyConfig, Role};
use crate::protocol::ethernet::HEADER_SIZE;
use crate::telemetry::{LOG_FORMATS, LOG_LEVELS};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn print_diagnostics(&self) {
        for warning in &self.warnings {
            println!("[WARN] {}", warning);
        }
        for error in &self.errors {
            println!("[ERROR] {}", error);
        }
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate configuration and return warnings/errors
pub fn validate(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_log(config, &mut result);
    validate_registry(config, &mut result);
    validate_checkpoint(config, &mut result);

    if config.proxies.is_empty() {
        result.warn("no proxies defined");
    }
    for (name, proxy) in &config.proxies {
        validate_proxy(name, proxy, &mut result);
    }
    validate_unique_bindings(config, &mut result);

    result
}

fn validate_log(config: &Config, result: &mut ValidationResult) {
    let known = |level: &str| LOG_LEVELS.contains(&level.to_lowercase().as_str());
    if !known(&config.log.level) {
        result.warn(format!(
            "log.level: unknown level '{}', using info",
            config.log.level
        ));
    }
    for (target, level) in &config.log.targets {
        if !known(level) {
            result.warn(format!(
                "log.targets.{}: unknown level '{}', using info",
                target, level
            ));
        }
    }
    if !LOG_FORMATS.contains(&config.log.format.as_str()) {
        result.warn(format!(
            "log.format: unknown format '{}', using pretty",
            config.log.format
        ));
    }
}

fn validate_registry(config: &Config, result: &mut ValidationResult) {
    if config.registry.max_connections == 0 {
        result.error("registry.max_connections: must be greater than 0");
    }
    if config.registry.idle_timeout_secs == 0 {
        result.warn("registry.idle_timeout_secs: 0 expires every idle connection at each checkpoint");
    }
}

fn validate_checkpoint(config: &Config, result: &mut ValidationResult) {
    if config.checkpoint.interval_ms == 0 {
        result.error("checkpoint.interval_ms: must be greater than 0");
    }
    if config.checkpoint.max_deferrals == 0 {
        result.warn("checkpoint.max_deferrals: 0 forces every checkpoint the primary cannot take");
    }
}

/// Validate one `[proxies.<name>]` table
pub fn validate_proxy(name: &str, proxy: &ProxyConfig, result: &mut ValidationResult) {
    match proxy.addr.as_deref() {
        None => result.error(format!("proxies.{}: addr is required", name)),
        Some(addr) => match PeerAddr::parse(addr) {
            Ok(peer) => {
                if proxy.role == Role::Primary && peer.host.is_none() {
                    result.error(format!(
                        "proxies.{}: primary addr '{}' needs a host to connect to",
                        name, addr
                    ));
                }
            }
            Err(e) => result.error(format!("proxies.{}: {}", name, e)),
        },
    }

    if proxy.direction != FilterDirection::All {
        result.error(format!(
            "proxies.{}: direction must be \"all\"",
            name
        ));
    }

    if proxy.max_frame_size <= HEADER_SIZE {
        result.error(format!(
            "proxies.{}: max_frame_size {} cannot carry an Ethernet frame",
            name, proxy.max_frame_size
        ));
    }

    if proxy.max_queue_depth == 0 {
        result.error(format!("proxies.{}: max_queue_depth must be greater than 0", name));
    }

    if proxy.mirror_queue_depth == 0 {
        result.error(format!("proxies.{}: mirror_queue_depth must be greater than 0", name));
    }

    if proxy.guest_interface.is_none() || proxy.uplink_interface.is_none() {
        result.warn(format!(
            "proxies.{}: guest_interface/uplink_interface not set, `run` will skip it",
            name
        ));
    }
}

fn validate_unique_bindings(config: &Config, result: &mut ValidationResult) {
    let mut ports: HashMap<u16, &str> = HashMap::new();
    let mut interfaces: HashMap<&str, &str> = HashMap::new();

    for (name, proxy) in &config.proxies {
        if proxy.role == Role::Secondary {
            if let Some(peer) = proxy.addr.as_deref().and_then(|a| PeerAddr::parse(a).ok()) {
                if let Some(other) = ports.insert(peer.port, name) {
                    result.error(format!(
                        "proxies.{}: listen port {} already used by proxies.{}",
                        name, peer.port, other
                    ));
                }
            }
        }

        for iface in [&proxy.guest_interface, &proxy.uplink_interface]
            .into_iter()
            .flatten()
        {
            if let Some(other) = interfaces.insert(iface.as_str(), name) {
                if other != name.as_str() {
                    result.error(format!(
                        "proxies.{}: interface '{}' already used by proxies.{}",
                        name, iface, other
                    ));
                }
            }
        }
    }
}

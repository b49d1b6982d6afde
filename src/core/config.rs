//! Scheduler configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Auxiliary structure to parse SchedulerConfig from file.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct SchedulerConfigRaw {
    /// power policy config string
    pub power_policy: Option<String>,
    /// cpu utilisation above which a machine counts as overloaded
    pub overload_threshold: Option<f64>,
    /// utilisation gap required between migration source and destination
    pub migration_headroom: Option<f64>,
    /// adjust P-states by utilisation band on every periodic check
    pub dvfs: Option<bool>,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// Power policy config string, e.g. `DrainAndPowerOff` or
    /// `TierManager[high=0.7,low=0.3]`.
    pub power_policy: String,
    /// CPU utilisation above which a machine counts as overloaded.
    pub overload_threshold: f64,
    /// Utilisation gap required between migration source and destination.
    pub migration_headroom: f64,
    /// Adjust P-states by utilisation band on every periodic check.
    pub dvfs: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            power_policy: "DrainAndPowerOff".to_string(),
            overload_threshold: 0.9,
            migration_headroom: 0.1,
            dvfs: false,
        }
    }
}

impl SchedulerConfig {
    /// Creates scheduler config by reading parameter values from .yaml file
    /// (uses default values if some parameters are absent).
    pub fn from_file(file_name: &str) -> Self {
        let raw: SchedulerConfigRaw = serde_yaml::from_str(
            &std::fs::read_to_string(file_name).unwrap_or_else(|_| panic!("Can't read file {}", file_name)),
        )
        .unwrap_or_else(|_| panic!("Can't parse YAML from file {}", file_name));

        let defaults = Self::default();
        Self {
            power_policy: raw.power_policy.unwrap_or(defaults.power_policy),
            overload_threshold: raw.overload_threshold.unwrap_or(defaults.overload_threshold),
            migration_headroom: raw.migration_headroom.unwrap_or(defaults.migration_headroom),
            dvfs: raw.dvfs.unwrap_or(defaults.dvfs),
        }
    }
}

/// Parses config value string, which consists of two parts - name and options.
/// Example: TierManager[high=0.7] parts are name TierManager and options
/// string "high=0.7".
pub fn parse_config_value(config_str: &str) -> (String, Option<String>) {
    match config_str.split_once('[') {
        Some((l, r)) => (l.to_string(), Some(r.to_string().replace(']', ""))),
        None => (config_str.to_string(), None),
    }
}

/// Parses options string from config value, returns map with option names and values.
///
/// # Examples
///
/// ```rust
/// use ecosched::core::config::parse_options;
///
/// let options = parse_options("high=0.8,low=0.2");
/// assert_eq!(options.get("high").unwrap(), "0.8");
/// assert_eq!(options.get("low").unwrap(), "0.2");
/// assert_eq!(options.get("mid"), None);
/// ```
pub fn parse_options(options_str: &str) -> HashMap<String, String> {
    let mut options = HashMap::new();
    for option_str in options_str.split(',') {
        if let Some((name, value)) = option_str.split_once('=') {
            options.insert(name.to_string(), value.to_string());
        }
    }
    options
}

pub mod defaults;
pub mod settings;
pub mod user;

pub use settings::{BridgeConfig, BridgeSettings, EvaluatorOptions};
pub use user::{UserConfigError, UserConfigResult, load_config_file, load_user_config, user_config_path};

use std::path::Path;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettingsEventKind {
    Info,
    Warning,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SettingsEvent {
    pub kind: SettingsEventKind,
    pub message: String,
}

impl SettingsEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            kind: SettingsEventKind::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            kind: SettingsEventKind::Warning,
            message: message.into(),
        }
    }
}

#[derive(Debug)]
pub struct SettingsLoadOutcome {
    pub settings: BridgeSettings,
    pub events: Vec<SettingsEvent>,
}

/// Load settings from every layer.
///
/// Precedence (later overrides earlier): programmed defaults < user config <
/// explicit config file < command-line overrides.
pub fn load_settings(config_file: Option<&Path>, overrides: BridgeConfig) -> SettingsLoadOutcome {
    let mut events = Vec::new();

    let user_config = match load_user_config() {
        Ok(Some(config)) => {
            events.push(SettingsEvent::info("Loaded user config"));
            Some(config)
        }
        Ok(None) => None,
        Err(err) => {
            events.push(SettingsEvent::warning(format!(
                "Failed to load user config: {}",
                err
            )));
            None
        }
    };

    let file_config = config_file.and_then(|path| match load_config_file(path) {
        Ok(config) => {
            events.push(SettingsEvent::info(format!(
                "Loaded config file: {}",
                path.display()
            )));
            Some(config)
        }
        Err(err) => {
            events.push(SettingsEvent::warning(err.to_string()));
            None
        }
    });

    let merged = merge_all(&[user_config, file_config, Some(overrides)]);
    SettingsLoadOutcome {
        settings: merged.unwrap_or_default().into(),
        events,
    }
}

/// Merge multiple configs in order; later entries take precedence.
pub fn merge_all(configs: &[Option<BridgeConfig>]) -> Option<BridgeConfig> {
    configs.iter().cloned().reduce(merge_configs).flatten()
}

/// Merge two configs, preferring values from `primary` over `fallback`
pub fn merge_configs(
    fallback: Option<BridgeConfig>,
    primary: Option<BridgeConfig>,
) -> Option<BridgeConfig> {
    match (fallback, primary) {
        (None, None) => None,
        (Some(config), None) | (None, Some(config)) => Some(config),
        (Some(fallback), Some(primary)) => Some(BridgeConfig {
            program: primary.program.or(fallback.program),
            init_file: primary.init_file.or(fallback.init_file),
            host: primary.host.or(fallback.host),
            port: primary.port.or(fallback.port),
            color: primary.color.or(fallback.color),
            read_buffer_size: primary.read_buffer_size.or(fallback.read_buffer_size),
            poll_interval_ms: primary.poll_interval_ms.or(fallback.poll_interval_ms),
            call_stack_depth: primary.call_stack_depth.or(fallback.call_stack_depth),
            connect_timeout_ms: primary.connect_timeout_ms.or(fallback.connect_timeout_ms),
            terminate_timeout_ms: primary
                .terminate_timeout_ms
                .or(fallback.terminate_timeout_ms),
            implementation: primary.implementation.or(fallback.implementation),
            // Environment maps merge key by key
            environment: match (fallback.environment, primary.environment) {
                (Some(mut base), Some(over)) => {
                    base.extend(over);
                    Some(base)
                }
                (base, over) => over.or(base),
            },
        }),
    }
}

use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use super::defaults;

/// One configuration layer as read from `swankbridge.toml` or the CLI.
///
/// Every field is optional so layers can be merged; see [`super::merge_all`].
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    pub program: Option<String>,
    pub init_file: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub color: Option<bool>,
    pub read_buffer_size: Option<usize>,
    pub poll_interval_ms: Option<u64>,
    pub call_stack_depth: Option<usize>,
    pub connect_timeout_ms: Option<u64>,
    pub terminate_timeout_ms: Option<u64>,
    pub implementation: Option<String>,
    pub environment: Option<HashMap<String, String>>,
}

/// Fully resolved settings consumed by the bridge.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeSettings {
    pub program: String,
    pub init_file: Option<PathBuf>,
    pub host: String,
    pub port: u16,
    pub evaluator: EvaluatorOptions,
    pub connect_timeout: Duration,
    pub terminate_timeout: Duration,
    pub implementation: String,
    pub environment: HashMap<String, String>,
}

/// Per-link tuning for output draining and the debugger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvaluatorOptions {
    /// Pass terminal color escapes through to the editor
    pub color: bool,
    /// Bytes requested per read of the evaluator's output
    pub read_buffer_size: usize,
    /// Back-off and liveness-check interval
    pub poll_interval: Duration,
    /// Frames requested when fetching a call stack
    pub call_stack_depth: usize,
}

impl Default for EvaluatorOptions {
    fn default() -> Self {
        Self {
            color: false,
            read_buffer_size: defaults::READ_BUFFER_SIZE,
            poll_interval: Duration::from_millis(defaults::POLL_INTERVAL_MS),
            call_stack_depth: defaults::CALL_STACK_DEPTH,
        }
    }
}

impl BridgeSettings {
    /// Command line used to launch the evaluator listening back on `port`.
    pub fn evaluator_command(&self, port: u16) -> Vec<String> {
        let mut command = vec![self.program.clone()];
        if let Some(init_file) = &self.init_file {
            command.push(init_file.to_string_lossy().into_owned());
        }
        command.push(format!("--port-{}", port));
        command
    }
}

impl From<BridgeConfig> for BridgeSettings {
    fn from(config: BridgeConfig) -> Self {
        let mut environment = config.environment.unwrap_or_default();
        for (key, value) in defaults::FORCED_ENVIRONMENT {
            environment.insert(key.to_string(), value.to_string());
        }

        Self {
            program: config
                .program
                .unwrap_or_else(|| defaults::PROGRAM.to_string()),
            init_file: config.init_file,
            host: config.host.unwrap_or_else(|| defaults::HOST.to_string()),
            port: config.port.unwrap_or(defaults::PORT),
            evaluator: EvaluatorOptions {
                color: config.color.unwrap_or(false),
                read_buffer_size: config
                    .read_buffer_size
                    .filter(|size| *size > 0)
                    .unwrap_or(defaults::READ_BUFFER_SIZE),
                poll_interval: Duration::from_millis(
                    config
                        .poll_interval_ms
                        .filter(|ms| *ms > 0)
                        .unwrap_or(defaults::POLL_INTERVAL_MS),
                ),
                call_stack_depth: config
                    .call_stack_depth
                    .unwrap_or(defaults::CALL_STACK_DEPTH),
            },
            connect_timeout: Duration::from_millis(
                config
                    .connect_timeout_ms
                    .unwrap_or(defaults::CONNECT_TIMEOUT_MS),
            ),
            terminate_timeout: Duration::from_millis(
                config
                    .terminate_timeout_ms
                    .unwrap_or(defaults::TERMINATE_TIMEOUT_MS),
            ),
            implementation: config
                .implementation
                .unwrap_or_else(|| defaults::IMPLEMENTATION.to_string()),
            environment,
        }
    }
}

impl Default for BridgeSettings {
    fn default() -> Self {
        BridgeConfig::default().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_keys_are_camel_case() {
        let config: BridgeConfig = toml::from_str(
            r#"
            program = "roseus"
            initFile = "/opt/euslime/slime-loader.l"
            readBufferSize = 4096
            pollIntervalMs = 10

            [environment]
            ROS_MASTER_URI = "http://localhost:11311"
            "#,
        )
        .unwrap();

        assert_eq!(config.program.as_deref(), Some("roseus"));
        assert_eq!(
            config.init_file,
            Some(PathBuf::from("/opt/euslime/slime-loader.l"))
        );
        assert_eq!(config.read_buffer_size, Some(4096));
        assert_eq!(config.poll_interval_ms, Some(10));
        assert_eq!(
            config.environment.unwrap()["ROS_MASTER_URI"],
            "http://localhost:11311"
        );
    }

    #[test]
    fn unset_fields_resolve_to_defaults() {
        let settings = BridgeSettings::default();

        assert_eq!(settings.program, "irteusgl");
        assert_eq!(settings.port, 4005);
        assert_eq!(settings.evaluator.read_buffer_size, 7000);
        assert_eq!(settings.evaluator.poll_interval, Duration::from_millis(5));
        assert_eq!(settings.evaluator.call_stack_depth, 10);
        assert!(!settings.evaluator.color);
    }

    #[test]
    fn line_buffered_logging_is_always_forced() {
        let mut environment = HashMap::new();
        environment.insert(
            "ROSCONSOLE_STDOUT_LINE_BUFFERED".to_string(),
            "0".to_string(),
        );
        let settings = BridgeSettings::from(BridgeConfig {
            environment: Some(environment),
            ..Default::default()
        });

        assert_eq!(settings.environment["ROSCONSOLE_STDOUT_LINE_BUFFERED"], "1");
    }

    #[test]
    fn zero_buffer_size_falls_back_to_default() {
        let settings = BridgeSettings::from(BridgeConfig {
            read_buffer_size: Some(0),
            poll_interval_ms: Some(0),
            ..Default::default()
        });

        assert_eq!(settings.evaluator.read_buffer_size, 7000);
        assert_eq!(settings.evaluator.poll_interval, Duration::from_millis(5));
    }

    #[test]
    fn evaluator_command_carries_init_file_and_port() {
        let settings = BridgeSettings::from(BridgeConfig {
            program: Some("roseus".to_string()),
            init_file: Some(PathBuf::from("slime-loader.l")),
            ..Default::default()
        });

        assert_eq!(
            settings.evaluator_command(41234),
            vec!["roseus", "slime-loader.l", "--port-41234"]
        );
    }

    #[test]
    fn evaluator_command_without_init_file() {
        let settings = BridgeSettings::default();

        assert_eq!(settings.evaluator_command(5), vec!["irteusgl", "--port-5"]);
    }
}

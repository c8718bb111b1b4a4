use std::path::PathBuf;
use std::time::Duration;

use annolab_common::config::{
    ConfigExample, ConfigLoader, DbConfig, HasConfigExamples, RetryConfig,
};
use annolab_common::tracing::TracingConfig;
use annolab_common::SafeDisplay;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AiServiceConfig {
    pub tracing: TracingConfig,
    pub db: DbConfig,
    pub controller: ControllerConfig,
    pub watchdog: WatchdogConfig,
    pub task_monitor: TaskMonitorConfig,
}

impl Default for AiServiceConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("ai-service"),
            db: DbConfig::default(),
            controller: ControllerConfig::default(),
            watchdog: WatchdogConfig::default(),
            task_monitor: TaskMonitorConfig::default(),
        }
    }
}

impl SafeDisplay for AiServiceConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        result.push_str(&format!("tracing:\n{}\n", self.tracing.to_safe_string_indented()));
        result.push_str(&format!("db:\n{}\n", self.db.to_safe_string_indented()));
        result.push_str(&format!(
            "max concurrent tasks: {}\n",
            self.controller.max_num_concurrent_tasks
        ));
        result.push_str(&format!(
            "watchdog wait: {:?} - {:?}\n",
            self.watchdog.min_wait, self.watchdog.max_wait
        ));
        result
    }
}

/// Admission and auto-train launch parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Absolute ceiling on concurrently running tasks per project; zero or
    /// negative disables the ceiling.
    pub max_num_concurrent_tasks: i32,
    /// Worker cap applied to the training step of auto-launched workflows.
    pub max_num_workers_train: i32,
    /// Worker cap applied to the inference step of auto-launched workflows.
    pub max_num_workers_inference: i32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_num_concurrent_tasks: 2,
            max_num_workers_train: 1,
            max_num_workers_inference: 1,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(with = "humantime_serde")]
    pub min_wait: Duration,
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,
    /// Granularity of the interruptible sleep.
    #[serde(with = "humantime_serde")]
    pub slice: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            min_wait: Duration::from_secs(20),
            max_wait: Duration::from_secs(1800),
            slice: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskMonitorConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub retries: RetryConfig,
}

impl Default for TaskMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            retries: RetryConfig::default(),
        }
    }
}

impl HasConfigExamples<AiServiceConfig> for AiServiceConfig {
    fn examples() -> Vec<ConfigExample<AiServiceConfig>> {
        vec![(
            "unbounded concurrency",
            AiServiceConfig {
                controller: ControllerConfig {
                    max_num_concurrent_tasks: 0,
                    ..ControllerConfig::default()
                },
                ..AiServiceConfig::default()
            },
        )]
    }
}

pub fn make_config_loader() -> ConfigLoader<AiServiceConfig> {
    ConfigLoader::new_with_examples(&PathBuf::from("config/ai-service.toml"))
}

use std::time::Duration;

use serde::Deserialize;

use crate::device::{DecodeFailurePolicy, ReceiverOptions};
use crate::hub::HubConfig;
use crate::message::{AckLevel, DeviceIdentity};

/// Top-level configuration settings for the application.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub hub: HubSettings,
    pub receiver: ReceiverSettings,
    pub feedback: FeedbackSettings,
    pub stream: StreamSettings,
    pub emulator: EmulatorSettings,
    pub logging: LoggingSettings,
}

/// Where the hub is and who the device is.
#[derive(Debug, Deserialize, Clone)]
pub struct HubSettings {
    pub endpoint: String,
    pub device_id: String,
    pub device_key: String,
    /// Feedback requested for published messages unless overridden.
    pub ack_level: AckLevel,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReceiverSettings {
    pub poll_timeout_ms: u64,
    pub error_backoff_ms: u64,
    pub on_decode_failure: DecodeFailurePolicy,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedbackSettings {
    pub wait_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamSettings {
    pub lookback_secs: u64,
    pub wait_timeout_ms: u64,
}

/// Limits of the local hub emulator.
#[derive(Debug, Deserialize, Clone)]
pub struct EmulatorSettings {
    pub host: String,
    pub port: u16,
    pub partitions: usize,
    pub max_message_bytes: usize,
    pub message_ttl_secs: u64,
    pub lock_duration_secs: u64,
    pub max_delivery_count: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Default, Deserialize)]
pub struct PartialSettings {
    pub hub: Option<PartialHubSettings>,
    pub receiver: Option<PartialReceiverSettings>,
    pub feedback: Option<PartialFeedbackSettings>,
    pub stream: Option<PartialStreamSettings>,
    pub emulator: Option<PartialEmulatorSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialHubSettings {
    pub endpoint: Option<String>,
    pub device_id: Option<String>,
    pub device_key: Option<String>,
    pub ack_level: Option<AckLevel>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialReceiverSettings {
    pub poll_timeout_ms: Option<u64>,
    pub error_backoff_ms: Option<u64>,
    pub on_decode_failure: Option<DecodeFailurePolicy>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialFeedbackSettings {
    pub wait_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialStreamSettings {
    pub lookback_secs: Option<u64>,
    pub wait_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialEmulatorSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub partitions: Option<usize>,
    pub max_message_bytes: Option<usize>,
    pub message_ttl_secs: Option<u64>,
    pub lock_duration_secs: Option<u64>,
    pub max_delivery_count: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl PartialSettings {
    /// Overlays the values present here onto `default`.
    pub fn merge(self, default: Settings) -> Settings {
        let hub = self.hub.unwrap_or_default();
        let receiver = self.receiver.unwrap_or_default();
        let feedback = self.feedback.unwrap_or_default();
        let stream = self.stream.unwrap_or_default();
        let emulator = self.emulator.unwrap_or_default();
        let logging = self.logging.unwrap_or_default();

        Settings {
            hub: HubSettings {
                endpoint: hub.endpoint.unwrap_or(default.hub.endpoint),
                device_id: hub.device_id.unwrap_or(default.hub.device_id),
                device_key: hub.device_key.unwrap_or(default.hub.device_key),
                ack_level: hub.ack_level.unwrap_or(default.hub.ack_level),
            },
            receiver: ReceiverSettings {
                poll_timeout_ms: receiver
                    .poll_timeout_ms
                    .unwrap_or(default.receiver.poll_timeout_ms),
                error_backoff_ms: receiver
                    .error_backoff_ms
                    .unwrap_or(default.receiver.error_backoff_ms),
                on_decode_failure: receiver
                    .on_decode_failure
                    .unwrap_or(default.receiver.on_decode_failure),
            },
            feedback: FeedbackSettings {
                wait_timeout_ms: feedback
                    .wait_timeout_ms
                    .unwrap_or(default.feedback.wait_timeout_ms),
            },
            stream: StreamSettings {
                lookback_secs: stream.lookback_secs.unwrap_or(default.stream.lookback_secs),
                wait_timeout_ms: stream
                    .wait_timeout_ms
                    .unwrap_or(default.stream.wait_timeout_ms),
            },
            emulator: EmulatorSettings {
                host: emulator.host.unwrap_or(default.emulator.host),
                port: emulator.port.unwrap_or(default.emulator.port),
                partitions: emulator.partitions.unwrap_or(default.emulator.partitions),
                max_message_bytes: emulator
                    .max_message_bytes
                    .unwrap_or(default.emulator.max_message_bytes),
                message_ttl_secs: emulator
                    .message_ttl_secs
                    .unwrap_or(default.emulator.message_ttl_secs),
                lock_duration_secs: emulator
                    .lock_duration_secs
                    .unwrap_or(default.emulator.lock_duration_secs),
                max_delivery_count: emulator
                    .max_delivery_count
                    .unwrap_or(default.emulator.max_delivery_count),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(default.logging.level),
            },
        }
    }
}

/// Provides default values for `Settings`.
///
/// The defaults point a device named `dev-1` at a local emulator.
impl Default for Settings {
    fn default() -> Self {
        Self {
            hub: HubSettings {
                endpoint: "ws://127.0.0.1:8080".to_string(),
                device_id: "dev-1".to_string(),
                device_key: "dev-1-key".to_string(),
                ack_level: AckLevel::None,
            },
            receiver: ReceiverSettings {
                poll_timeout_ms: 5000,
                error_backoff_ms: 1000,
                on_decode_failure: DecodeFailurePolicy::Complete,
            },
            feedback: FeedbackSettings {
                wait_timeout_ms: 10_000,
            },
            stream: StreamSettings {
                lookback_secs: 3600,
                wait_timeout_ms: 5000,
            },
            emulator: EmulatorSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
                partitions: 4,
                max_message_bytes: 256 * 1024,
                message_ttl_secs: 3600,
                lock_duration_secs: 60,
                max_delivery_count: 10,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Settings {
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(self.hub.device_id.clone(), self.hub.device_key.clone())
    }

    pub fn receiver_options(&self) -> ReceiverOptions {
        ReceiverOptions {
            poll_timeout: Duration::from_millis(self.receiver.poll_timeout_ms),
            error_backoff: Duration::from_millis(self.receiver.error_backoff_ms),
            on_decode_failure: self.receiver.on_decode_failure,
        }
    }

    pub fn feedback_wait(&self) -> Duration {
        Duration::from_millis(self.feedback.wait_timeout_ms)
    }

    pub fn lookback(&self) -> Duration {
        Duration::from_secs(self.stream.lookback_secs)
    }

    pub fn stream_wait(&self) -> Duration {
        Duration::from_millis(self.stream.wait_timeout_ms)
    }

    pub fn emulator_addr(&self) -> String {
        format!("{}:{}", self.emulator.host, self.emulator.port)
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            partitions: self.emulator.partitions,
            max_message_bytes: self.emulator.max_message_bytes,
            message_ttl: Duration::from_secs(self.emulator.message_ttl_secs),
            lock_duration: Duration::from_secs(self.emulator.lock_duration_secs),
            max_delivery_count: self.emulator.max_delivery_count,
            ..HubConfig::default()
        }
    }
}

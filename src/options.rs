//! [`EngineOptions`]: the tunables spec.md §4.5/§6 names, typed and
//! defaulted. Parsing these from a config file or CLI flags is an external
//! concern (spec.md §1); this struct only needs to be something that
//! concern can populate.

use serde::Deserialize;

/// Construction and runtime tunables for an [`Engine`](crate::engine::Engine).
#[derive(Debug, Clone, Deserialize)]
pub struct EngineOptions {
    /// Our master address.
    pub address: u8,
    /// Serial path or `host:port`.
    pub device: String,
    /// Enable tty presence polling.
    #[serde(default = "default_device_check")]
    pub device_check: bool,
    /// Seconds of dead bus before reopening the device.
    #[serde(default = "default_reopen_time")]
    pub reopen_time_secs: u64,
    /// Microsecond window for the arbitration echo.
    #[serde(default = "default_arbitration_time")]
    pub arbitration_time_us: u64,
    /// Microsecond window for each inter-byte read.
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout_us: u64,
    /// Inter-send fairness counter, clamped to `[1, 25]`.
    #[serde(default = "default_lock_counter")]
    pub lock_counter: u8,
    /// Arbitration-retry budget per send.
    #[serde(default = "default_lock_retries")]
    pub lock_retries: u8,
    /// Enable the raw dump.
    #[serde(default)]
    pub dump: bool,
    /// Raw dump file path, used when `dump` is set.
    #[serde(default = "default_dump_file")]
    pub dump_file: String,
    /// Raw dump rotation cap, in KB. `0` disables rotation.
    #[serde(default = "default_dump_file_max_size")]
    pub dump_file_max_size_kb: u64,
}

impl EngineOptions {
    /// Creates options for `address` on `device`, with every other tunable
    /// at its spec.md-stated default.
    pub fn new(address: u8, device: impl Into<String>) -> Self {
        Self {
            address,
            device: device.into(),
            device_check: default_device_check(),
            reopen_time_secs: default_reopen_time(),
            arbitration_time_us: default_arbitration_time(),
            receive_timeout_us: default_receive_timeout(),
            lock_counter: default_lock_counter(),
            lock_retries: default_lock_retries(),
            dump: false,
            dump_file: default_dump_file(),
            dump_file_max_size_kb: default_dump_file_max_size(),
        }
    }
}

/// Clamps a `lock_counter` value into the documented `[1, 25]` range.
/// Shared by [`EngineOptions`] validation and the running FSM's
/// post-send reset, so both enforce the same bound.
pub(crate) fn clamp_lock_counter(value: u8) -> u8 {
    value.clamp(1, 25)
}

fn default_device_check() -> bool {
    false
}
fn default_reopen_time() -> u64 {
    60
}
fn default_arbitration_time() -> u64 {
    4400
}
fn default_receive_timeout() -> u64 {
    10_000
}
fn default_lock_counter() -> u8 {
    5
}
fn default_lock_retries() -> u8 {
    2
}
fn default_dump_file() -> String {
    "ebus_dump.bin".to_string()
}
fn default_dump_file_max_size() -> u64 {
    100
}

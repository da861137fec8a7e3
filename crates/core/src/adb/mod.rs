pub mod bridge;
pub mod client;

pub use bridge::{AdbBridge, ServerProcess, SpawnOptions, DEVICE_JAR_PATH};
pub use client::{AdbClient, ExecutionConfig};

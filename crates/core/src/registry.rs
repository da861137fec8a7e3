//! Source Registry (§4.5): the single map from device serial to running
//! `Source`, and the mode-change policy that decides whether a mode switch
//! is a cheap in-place update or a stop/recreate. Map shape follows the
//! `RwLock<HashMap<Uuid, ManagedSession>>` pattern used for session tracking
//! in this codebase, minus persistence — Sources are never written to disk.

use crate::adb::AdbBridge;
use crate::error::CoreError;
use crate::pipeline::Pipeline;
use crate::source::Source;
use scrcpy_protocol::StreamingMode;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Local TCP ports reserved for one Source's three device-forwarded sockets.
#[derive(Debug, Clone, Copy)]
pub struct PortAllocation {
    pub video: u16,
    pub audio: u16,
    pub control: u16,
}

/// Tracks every running `Source`, keyed by device serial (§3 `Registry`).
pub struct Registry {
    sources: RwLock<HashMap<String, Arc<Source>>>,
    bridge: Arc<AdbBridge>,
    video_buffer_size: usize,
    audio_buffer_size: usize,
    next_port: std::sync::atomic::AtomicU16,
}

impl Registry {
    pub fn new(bridge: Arc<AdbBridge>, video_buffer_size: usize, audio_buffer_size: usize) -> Self {
        Self {
            sources: RwLock::new(HashMap::new()),
            bridge,
            video_buffer_size,
            audio_buffer_size,
            next_port: std::sync::atomic::AtomicU16::new(27_183),
        }
    }

    fn allocate_ports(&self) -> PortAllocation {
        use std::sync::atomic::Ordering;
        let base = self.next_port.fetch_add(3, Ordering::Relaxed);
        PortAllocation {
            video: base,
            audio: base + 1,
            control: base + 2,
        }
    }

    /// Returns the existing Source for `serial` if one is running.
    pub async fn get(&self, serial: &str) -> Option<Arc<Source>> {
        self.sources.read().await.get(serial).cloned()
    }

    /// Starts a new Source for `serial` in `mode`, or applies the mode-change
    /// policy to an existing one (§4.5): same audio-codec family updates the
    /// mode tag in place; a different family stops and recreates the Source
    /// so the device-side encoder is restarted with the right audio codec.
    pub async fn start(&self, serial: &str, mode: StreamingMode) -> Result<Arc<Source>, CoreError> {
        if let Some(existing) = self.get(serial).await {
            if existing.mode().await.audio_codec_family() == mode.audio_codec_family() {
                existing.set_mode(mode).await;
                info!(serial, ?mode, "mode updated in place, same audio family");
                return Ok(existing);
            }
            info!(serial, ?mode, "audio family changed, restarting source");
            self.remove(serial).await;
        }

        let pipeline = Arc::new(Pipeline::new());
        let source = Source::new(serial, mode, pipeline, self.video_buffer_size, self.audio_buffer_size);
        let ports = self.allocate_ports();
        source
            .start(Arc::clone(&self.bridge), (ports.video, ports.audio, ports.control))
            .await?;

        self.sources.write().await.insert(serial.to_string(), Arc::clone(&source));
        Ok(source)
    }

    /// Stops and forgets the Source for `serial`, if one exists. Source
    /// teardown happens outside the map lock so a slow shutdown never blocks
    /// lookups for other devices.
    pub async fn remove(&self, serial: &str) {
        let removed = self.sources.write().await.remove(serial);
        if let Some(source) = removed {
            source.stop().await;
        }
    }

    pub async fn serials(&self) -> Vec<String> {
        self.sources.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adb::{AdbClient, ExecutionConfig};

    fn test_registry() -> Registry {
        let bridge = Arc::new(AdbBridge::new(AdbClient::new("adb"), ExecutionConfig::default()));
        Registry::new(bridge, 30, 60)
    }

    #[tokio::test]
    async fn get_on_empty_registry_is_none() {
        let registry = test_registry();
        assert!(registry.get("emu-5554").await.is_none());
    }

    #[tokio::test]
    async fn remove_on_missing_serial_is_a_safe_no_op() {
        let registry = test_registry();
        registry.remove("emu-5554").await; // must not panic
        assert!(registry.serials().await.is_empty());
    }

    #[test]
    fn port_allocation_is_disjoint_across_calls() {
        let bridge = Arc::new(AdbBridge::new(AdbClient::new("adb"), ExecutionConfig::default()));
        let registry = Registry::new(bridge, 30, 60);
        let a = registry.allocate_ports();
        let b = registry.allocate_ports();
        assert_ne!(a.video, b.video);
        assert_ne!(a.audio, b.audio);
        assert_ne!(a.control, b.control);
    }
}

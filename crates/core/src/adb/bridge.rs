//! ADB bridge (§4.2): push the scrcpy server jar, establish the forward
//! tunnels, spawn the device-side process, and tear it down. The exact
//! `app_process` invocation shape and `adb forward` tunnel naming mirror
//! a reference scrcpy-launcher implementation's `push_scrcpy_server`/
//! `start_server` pair.

use crate::adb::client::{AdbClient, ExecutionConfig};
use crate::error::AdbError;
use std::process::Child;

pub const DEVICE_JAR_PATH: &str = "/data/local/tmp/scrcpy-server.jar";
const SCRCPY_SERVER_VERSION: &str = "2.4";
const SERVER_CLASS: &str = "com.genymobile.scrcpy.Server";

/// Options passed through to the device-side `app_process` invocation (§4.2).
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub scid: String,
    pub video_codec: String,
    pub audio_codec: String,
    pub max_size: u32,
    pub bit_rate: u32,
    pub send_device_meta: bool,
}

impl SpawnOptions {
    fn to_args(&self) -> Vec<String> {
        vec![
            format!("scid={}", self.scid),
            "log_level=info".to_string(),
            format!("video_codec={}", self.video_codec),
            format!("audio_codec={}", self.audio_codec),
            format!("max_size={}", self.max_size),
            format!("video_bit_rate={}", self.bit_rate),
            format!("send_device_meta={}", self.send_device_meta),
            "audio=true".to_string(),
            "control=true".to_string(),
            "tunnel_forward=true".to_string(),
        ]
    }
}

/// A handle to the spawned device-side process, owned exclusively by its Source.
pub struct ServerProcess {
    child: Child,
    serial: String,
}

pub struct AdbBridge {
    client: AdbClient,
    config: ExecutionConfig,
}

impl AdbBridge {
    pub fn new(client: AdbClient, config: ExecutionConfig) -> Self {
        Self { client, config }
    }

    /// Push `jar_bytes` to `/data/local/tmp/scrcpy-server.jar` on `serial`.
    pub fn push_server(&self, serial: &str, jar_bytes: &[u8]) -> Result<(), AdbError> {
        let tmp = std::env::temp_dir().join(format!("scrcpy-server-{serial}.jar"));
        std::fs::write(&tmp, jar_bytes)
            .map_err(|e| AdbError::ExecutionFailed(format!("failed to stage jar: {e}")))?;

        let tmp_str = tmp.to_string_lossy();
        let result = self.client.execute(
            &["-s", serial, "push", &tmp_str, DEVICE_JAR_PATH],
            &self.config,
        );
        let _ = std::fs::remove_file(&tmp);
        result.map(|_| ())
    }

    /// Forward a local TCP port to an abstract-namespace UNIX socket on the device.
    pub fn forward(&self, serial: &str, local_port: u16, remote_name: &str) -> Result<(), AdbError> {
        self.client
            .execute(
                &[
                    "-s",
                    serial,
                    "forward",
                    &format!("tcp:{local_port}"),
                    &format!("localabstract:{remote_name}"),
                ],
                &self.config,
            )
            .map(|_| ())
    }

    /// Reverse an abstract-namespace UNIX socket on the device to a local TCP port.
    pub fn reverse(&self, serial: &str, remote_name: &str, local_port: u16) -> Result<(), AdbError> {
        self.client
            .execute(
                &[
                    "-s",
                    serial,
                    "reverse",
                    &format!("localabstract:{remote_name}"),
                    &format!("tcp:{local_port}"),
                ],
                &self.config,
            )
            .map(|_| ())
    }

    /// Launch `app_process -cp <jar> com.genymobile.scrcpy.Server <version> <opts...>`
    /// on the device over `adb shell`.
    pub fn spawn_server(&self, serial: &str, opts: &SpawnOptions) -> Result<ServerProcess, AdbError> {
        let mut shell_args = vec![
            "-s".to_string(),
            serial.to_string(),
            "shell".to_string(),
            format!("CLASSPATH={DEVICE_JAR_PATH}"),
            "app_process".to_string(),
            "/".to_string(),
            SERVER_CLASS.to_string(),
            SCRCPY_SERVER_VERSION.to_string(),
        ];
        shell_args.extend(opts.to_args());

        let arg_refs: Vec<&str> = shell_args.iter().map(String::as_str).collect();
        let mut cmd = std::process::Command::new(self.client.adb_path());
        cmd.args(&arg_refs)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped());

        let child = cmd
            .spawn()
            .map_err(|e| AdbError::ExecutionFailed(format!("failed to spawn scrcpy server: {e}")))?;

        Ok(ServerProcess {
            child,
            serial: serial.to_string(),
        })
    }

    /// Terminate the device-side process and best-effort clear forwarded tunnels.
    pub fn shutdown(&self, mut handle: ServerProcess) {
        let _ = handle.child.kill();
        let _ = handle.child.wait();
        let _ = self
            .client
            .execute(&["-s", &handle.serial, "forward", "--remove-all"], &self.config);
        let _ = self
            .client
            .execute(&["-s", &handle.serial, "shell", "pkill", "-f", "scrcpy"], &self.config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_options_render_expected_args() {
        let opts = SpawnOptions {
            scid: "abc123".to_string(),
            video_codec: "h264".to_string(),
            audio_codec: "opus".to_string(),
            max_size: 1920,
            bit_rate: 8_000_000,
            send_device_meta: true,
        };
        let args = opts.to_args();
        assert!(args.contains(&"scid=abc123".to_string()));
        assert!(args.contains(&"video_codec=h264".to_string()));
        assert!(args.contains(&"audio_codec=opus".to_string()));
        assert!(args.contains(&"audio=true".to_string()));
        assert!(args.contains(&"control=true".to_string()));
    }
}

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Signalling messages carried over the (externally owned) `/ws` WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    Offer { sdp: String, session_id: Uuid },
    Answer { sdp: String, session_id: Uuid },
    Candidate {
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
        session_id: Uuid,
    },
    Bye { session_id: Uuid },
    Error {
        code: String,
        message: String,
        session_id: Uuid,
    },
}

/// JSON control events received on the `control` DataChannel (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    Touch {
        action: TouchActionJson,
        x: f64,
        y: f64,
        #[serde(default)]
        pointer_id: u64,
    },
    Key {
        keycode: u32,
        #[serde(default)]
        down: bool,
    },
    Button {
        name: ButtonName,
    },
    Scroll {
        x: f64,
        y: f64,
        h_scroll: f64,
        v_scroll: f64,
    },
    InjectText {
        text: String,
    },
    ClipboardSet {
        text: String,
    },
    ClipboardGet,
    RequestKeyframe,
    ResetVideo,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TouchActionJson {
    Down,
    Up,
    Move,
}

/// Named scrcpy buttons and their Android keycodes (§4.7).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonName {
    Home,
    Back,
    AppSwitch,
    Menu,
    VolumeUp,
    VolumeDown,
    Power,
}

impl ButtonName {
    pub fn keycode(self) -> u32 {
        match self {
            Self::Home => 3,
            Self::Back => 4,
            Self::AppSwitch => 187,
            Self::Menu => 82,
            Self::VolumeUp => 24,
            Self::VolumeDown => 25,
            Self::Power => 26,
        }
    }
}

/// Streaming mode tag selecting the device-side encoder/muxer behaviour (§4.5, glossary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingMode {
    Webrtc,
    Mp4,
    Muxed,
}

/// Audio codec family used by the Registry's mode-change policy (§4.5):
/// `{mp4, muxed}` use AAC, all other modes use Opus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodecFamily {
    Aac,
    Opus,
}

impl StreamingMode {
    pub fn audio_codec_family(self) -> AudioCodecFamily {
        match self {
            Self::Mp4 | Self::Muxed => AudioCodecFamily::Aac,
            Self::Webrtc => AudioCodecFamily::Opus,
        }
    }
}

/// Configuration for one ADB-expose multiplexer run (§4.8).
#[derive(Clone, Serialize, Deserialize)]
pub struct AdbExposeConfig {
    pub box_id: String,
    pub local_ports: Vec<u16>,
    pub remote_ports: Vec<u16>,
    pub ws_url: String,
    /// Redacted in Debug output (both here and via `AdbExposeConfigRedacted`); never logged.
    pub auth_token: String,
}

impl std::fmt::Debug for AdbExposeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdbExposeConfig")
            .field("box_id", &self.box_id)
            .field("local_ports", &self.local_ports)
            .field("remote_ports", &self.remote_ports)
            .field("ws_url", &self.ws_url)
            .field("auth_token", &"[REDACTED]")
            .finish()
    }
}

impl std::fmt::Debug for AdbExposeConfigRedacted<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self.0, f)
    }
}

/// Wrapper used at logging call sites so `auth_token` never lands in a log line.
pub struct AdbExposeConfigRedacted<'a>(pub &'a AdbExposeConfig);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_roundtrip() {
        let msg = SignalingMessage::Offer {
            sdp: "v=0\r\n...".to_string(),
            session_id: Uuid::nil(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"offer""#));
        let parsed: SignalingMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            SignalingMessage::Offer { sdp, .. } => assert_eq!(sdp, "v=0\r\n..."),
            _ => panic!("expected Offer"),
        }
    }

    #[test]
    fn bye_roundtrip() {
        let id = Uuid::new_v4();
        let msg = SignalingMessage::Bye { session_id: id };
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: SignalingMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            SignalingMessage::Bye { session_id } => assert_eq!(session_id, id),
            _ => panic!("expected Bye"),
        }
    }

    #[test]
    fn error_preserves_session_id() {
        let id = Uuid::new_v4();
        let msg = SignalingMessage::Error {
            code: "bad_sdp".to_string(),
            message: "could not parse offer".to_string(),
            session_id: id,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: SignalingMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            SignalingMessage::Error { session_id, .. } => assert_eq!(session_id, id),
            _ => panic!("expected Error"),
        }
    }

    #[test]
    fn control_event_touch_from_browser() {
        let json = r#"{"type":"touch","action":"down","x":0.5,"y":0.25,"pointer_id":0}"#;
        let event: ControlEvent = serde_json::from_str(json).unwrap();
        match event {
            ControlEvent::Touch { action, x, y, .. } => {
                assert!(matches!(action, TouchActionJson::Down));
                assert_eq!(x, 0.5);
                assert_eq!(y, 0.25);
            }
            _ => panic!("expected Touch"),
        }
    }

    #[test]
    fn control_event_button_names() {
        let json = r#"{"type":"button","name":"home"}"#;
        let event: ControlEvent = serde_json::from_str(json).unwrap();
        match event {
            ControlEvent::Button { name } => assert_eq!(name.keycode(), 3),
            _ => panic!("expected Button"),
        }
    }

    #[test]
    fn button_keycodes_match_spec() {
        assert_eq!(ButtonName::Home.keycode(), 3);
        assert_eq!(ButtonName::Back.keycode(), 4);
        assert_eq!(ButtonName::AppSwitch.keycode(), 187);
        assert_eq!(ButtonName::Menu.keycode(), 82);
        assert_eq!(ButtonName::VolumeUp.keycode(), 24);
        assert_eq!(ButtonName::VolumeDown.keycode(), 25);
        assert_eq!(ButtonName::Power.keycode(), 26);
    }

    #[test]
    fn streaming_mode_audio_codec_family() {
        assert_eq!(StreamingMode::Webrtc.audio_codec_family(), AudioCodecFamily::Opus);
        assert_eq!(StreamingMode::Mp4.audio_codec_family(), AudioCodecFamily::Aac);
        assert_eq!(StreamingMode::Muxed.audio_codec_family(), AudioCodecFamily::Aac);
    }

    #[test]
    fn adb_expose_config_redacts_auth_token() {
        let config = AdbExposeConfig {
            box_id: "box-1".to_string(),
            local_ports: vec![15037],
            remote_ports: vec![5037],
            ws_url: "wss://relay.example/ws".to_string(),
            auth_token: "super-secret".to_string(),
        };
        let debug_str = format!("{:?}", AdbExposeConfigRedacted(&config));
        assert!(debug_str.contains("box-1"));
        assert!(debug_str.contains("[REDACTED]"));
        assert!(!debug_str.contains("super-secret"));

        // The struct's own Debug impl redacts too, not just the wrapper.
        let direct_debug_str = format!("{config:?}");
        assert!(direct_debug_str.contains("[REDACTED]"));
        assert!(!direct_debug_str.contains("super-secret"));
    }
}

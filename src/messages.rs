use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, ProtocolError>;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Malformed inbound control frame. Per the robustness policy these are
/// logged and dropped by the caller, never propagated to the connection.
#[derive(Debug)]
pub struct ProtocolError(String);

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "protocol: {}", self.0)
    }
}

impl std::error::Error for ProtocolError {}

// ---------------------------------------------------------------------------
// Client commands (clients -> server)
// ---------------------------------------------------------------------------

fn default_requested_by() -> String {
    "Anonymous".into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeTarget {
    Music,
    Mic,
}

/// The closed set of control-channel commands. Adding a variant forces every
/// handler match to be revisited — there is no string-keyed fallthrough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    Enqueue {
        locator: String,
        #[serde(default = "default_requested_by")]
        requested_by: String,
    },
    Skip,
    Stop,
    Pause,
    Resume,
    ToggleLoop,
    Reorder {
        ordered_ids: Vec<u64>,
    },
    ToggleMic,
    SetVolume {
        target: VolumeTarget,
        value: i64,
    },
    JoinSession {
        link: String,
    },
    LeaveSession,
    RemoveTrack {
        id: u64,
    },
}

/// Decode a raw websocket text frame into a command.
pub fn decode_command(raw: &str) -> Result<ClientCommand> {
    serde_json::from_str(raw).map_err(|e| ProtocolError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Server events (server -> clients)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Idle,
    Playing,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// One queued (or playing) track as it appears on the wire. The fetch
/// bookkeeping flags are host-internal and never serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: u64,
    pub title: String,
    pub duration_seconds: u64,
    pub source_locator: String,
    pub requested_by: String,
    pub added_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_file_path: Option<PathBuf>,
    #[serde(skip)]
    pub fetch_in_flight: bool,
    #[serde(skip)]
    pub tombstoned: bool,
}

impl Track {
    /// Record the cached file location. The field is append-only: a second
    /// write for the same track is ignored.
    pub fn set_file_path(&mut self, path: PathBuf) {
        if self.local_file_path.is_some() {
            tracing::warn!(
                "[queue] ignoring duplicate file path for track {} ({})",
                self.id,
                path.display()
            );
            return;
        }
        self.local_file_path = Some(path);
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    StateSync {
        queue: Vec<Track>,
        current_track: Option<Track>,
        playback_state: PlaybackState,
        #[serde(rename = "loop")]
        loop_enabled: bool,
        music_volume: u8,
        mic_volume: u8,
        mic_muted: bool,
        session_link: Option<String>,
        session_status: SessionStatus,
    },
    QueueUpdate {
        queue: Vec<Track>,
    },
    TrackAdded {
        track: Track,
    },
    PlaybackUpdate {
        current_track: Option<Track>,
        playback_state: PlaybackState,
        #[serde(rename = "loop")]
        loop_enabled: bool,
    },
    VolumeUpdate {
        music_volume: u8,
        mic_volume: u8,
    },
    MicStatus {
        muted: bool,
    },
    SessionStatus {
        status: SessionStatus,
        link: Option<String>,
    },
    ProgressUpdate {
        current: f64,
        total: f64,
    },
    Error {
        message: String,
    },
}

impl ServerEvent {
    /// Serialize once for fan-out; the same string goes to every subscriber.
    pub fn encode(&self) -> String {
        // ServerEvent contains no non-serializable types, so this cannot fail.
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!("[ws] event encode failed: {e}");
            String::from("{\"type\":\"error\",\"message\":\"internal encode error\"}")
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_enqueue() {
        let cmd = decode_command(
            r#"{"type":"enqueue","locator":"https://youtu.be/abc","requested_by":"Maya"}"#,
        )
        .expect("decode should succeed");
        assert_eq!(
            cmd,
            ClientCommand::Enqueue {
                locator: "https://youtu.be/abc".into(),
                requested_by: "Maya".into(),
            }
        );
    }

    #[test]
    fn test_decode_enqueue_defaults_requester() {
        let cmd = decode_command(r#"{"type":"enqueue","locator":"x"}"#).unwrap();
        match cmd {
            ClientCommand::Enqueue { requested_by, .. } => {
                assert_eq!(requested_by, "Anonymous");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_decode_set_volume() {
        let cmd = decode_command(r#"{"type":"set_volume","target":"mic","value":45}"#).unwrap();
        assert_eq!(
            cmd,
            ClientCommand::SetVolume {
                target: VolumeTarget::Mic,
                value: 45,
            }
        );
    }

    #[test]
    fn test_decode_reorder() {
        let cmd = decode_command(r#"{"type":"reorder","ordered_ids":[3,1,2]}"#).unwrap();
        assert_eq!(
            cmd,
            ClientCommand::Reorder {
                ordered_ids: vec![3, 1, 2],
            }
        );
    }

    #[test]
    fn test_unknown_command_is_protocol_error() {
        assert!(decode_command(r#"{"type":"self_destruct"}"#).is_err());
    }

    #[test]
    fn test_malformed_json_is_protocol_error() {
        assert!(decode_command("{not json").is_err());
        assert!(decode_command(r#"{"type":"set_volume","target":"tuba"}"#).is_err());
    }

    #[test]
    fn test_event_tags() {
        let json = ServerEvent::PlaybackUpdate {
            current_track: None,
            playback_state: PlaybackState::Idle,
            loop_enabled: true,
        }
        .encode();
        assert!(json.contains(r#""type":"playback_update""#));
        assert!(json.contains(r#""loop":true"#));
        assert!(json.contains(r#""playback_state":"idle""#));
    }

    #[test]
    fn test_track_internal_flags_not_serialized() {
        let track = Track {
            id: 1,
            title: "t".into(),
            duration_seconds: 5,
            source_locator: "loc".into(),
            requested_by: "a".into(),
            added_at: "12:00".into(),
            local_file_path: None,
            fetch_in_flight: true,
            tombstoned: true,
        };
        let json = serde_json::to_string(&track).unwrap();
        assert!(!json.contains("fetch_in_flight"));
        assert!(!json.contains("tombstoned"));
        assert!(!json.contains("local_file_path"));
    }

    #[test]
    fn test_file_path_is_append_only() {
        let mut track = Track {
            id: 1,
            title: "t".into(),
            duration_seconds: 5,
            source_locator: "loc".into(),
            requested_by: "a".into(),
            added_at: "12:00".into(),
            local_file_path: None,
            fetch_in_flight: false,
            tombstoned: false,
        };
        track.set_file_path(PathBuf::from("/tmp/a.mp3"));
        track.set_file_path(PathBuf::from("/tmp/b.mp3"));
        assert_eq!(track.local_file_path, Some(PathBuf::from("/tmp/a.mp3")));
    }
}

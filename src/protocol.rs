//! Wire format.
//!
//! Two JSON shapes share one byte channel:
//!
//! ```text
//! {"type":"heartbeat","timestamp":1718000000.5,"sender":"Kitchen iPad"}
//! {"id":"s1","title":"Song A","artist":"Artist A","albumTitle":null,...}
//! ```
//!
//! The `type` discriminator is checked before anything is parsed as a
//! now-playing payload. Payload keys are camelCase, with `artworkURL` spelled
//! the way existing clients expect.

use serde::{Deserialize, Serialize};

use crate::error::{MeshError, MeshResult};
use crate::peer::{unix_millis, PeerId};

/// The local node's broadcastable state: what is playing right now.
///
/// Immutable once built; a newer value replaces the older one wholesale.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NowPlaying {
    pub id: String,
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub album_title: Option<String>,
    #[serde(rename = "artworkURL", default)]
    pub artwork_url: Option<String>,
    /// Track length in seconds
    #[serde(default)]
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playback_position: Option<f64>,
    /// When this payload was produced, unix ms
    #[serde(default)]
    pub produced_at: u64,
}

impl NowPlaying {
    pub fn new(id: impl Into<String>, title: impl Into<String>, artist: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            artist: artist.into(),
            album_title: None,
            artwork_url: None,
            duration: 0.0,
            playback_position: None,
            produced_at: unix_millis(),
        }
    }

    pub fn with_album(mut self, album: impl Into<String>) -> Self {
        self.album_title = Some(album.into());
        self
    }

    pub fn with_artwork(mut self, url: impl Into<String>) -> Self {
        self.artwork_url = Some(url.into());
        self
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration = seconds;
        self
    }

    /// JSON has no NaN or infinity; serde_json would write `null`, which no
    /// receiver accepts back as a number.
    pub fn validate(&self) -> MeshResult<()> {
        if !self.duration.is_finite() {
            return Err(MeshError::Encode(format!("duration {} is not finite", self.duration)));
        }
        match self.playback_position {
            Some(position) if !position.is_finite() => Err(MeshError::Encode(format!(
                "playback position {} is not finite",
                position
            ))),
            _ => Ok(()),
        }
    }
}

/// Liveness signal, distinct from application payloads.
///
/// Only the `type` tag matters to the receiver; both fields are informational.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Heartbeat {
    /// Seconds since the unix epoch
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default)]
    pub sender: PeerId,
}

impl Heartbeat {
    pub fn now(sender: PeerId) -> Self {
        Self {
            timestamp: unix_millis() as f64 / 1000.0,
            sender,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Tagged {
    Heartbeat(Heartbeat),
}

const TYPE_FIELD: &str = "type";
const HEARTBEAT_TYPE: &str = "heartbeat";

#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Heartbeat(Heartbeat),
    NowPlaying(NowPlaying),
}

impl WireMessage {
    pub fn encode(&self) -> MeshResult<Vec<u8>> {
        let bytes = match self {
            WireMessage::Heartbeat(hb) => serde_json::to_vec(&Tagged::Heartbeat(hb.clone()))?,
            WireMessage::NowPlaying(np) => {
                np.validate()?;
                serde_json::to_vec(np)?
            }
        };
        Ok(bytes)
    }

    /// Decode one message. Anything that is neither shape is a `Decode` error;
    /// callers log and drop it.
    pub fn decode(data: &[u8]) -> MeshResult<Self> {
        let value: serde_json::Value = serde_json::from_slice(data)
            .map_err(|e| MeshError::Decode(format!("not JSON: {}", e)))?;

        let object = value
            .as_object()
            .ok_or_else(|| MeshError::Decode("expected a JSON object".to_string()))?;

        match object.get(TYPE_FIELD) {
            Some(serde_json::Value::String(kind)) if kind == HEARTBEAT_TYPE => {
                let hb = match serde_json::from_value(value) {
                    Ok(Tagged::Heartbeat(hb)) => hb,
                    Err(e) => {
                        tracing::debug!("Heartbeat with unreadable fields: {}", e);
                        Heartbeat::default()
                    }
                };
                Ok(WireMessage::Heartbeat(hb))
            }
            Some(other) => Err(MeshError::Decode(format!("unknown message type {}", other))),
            None => serde_json::from_value(value)
                .map(WireMessage::NowPlaying)
                .map_err(|e| MeshError::Decode(format!("bad now-playing payload: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_playing_round_trip() {
        let song = NowPlaying::new("s1", "Song A", "Artist A")
            .with_album("Album A")
            .with_artwork("https://example.com/a.jpg")
            .with_duration(215.5);

        let bytes = WireMessage::NowPlaying(song.clone()).encode().unwrap();
        assert_eq!(WireMessage::decode(&bytes).unwrap(), WireMessage::NowPlaying(song));
    }

    #[test]
    fn test_heartbeat_carries_type_discriminator() {
        let hb = Heartbeat::now(PeerId::from("Kitchen iPad"));
        let bytes = WireMessage::Heartbeat(hb.clone()).encode().unwrap();

        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["type"], "heartbeat");
        assert_eq!(json["sender"], "Kitchen iPad");

        assert_eq!(WireMessage::decode(&bytes).unwrap(), WireMessage::Heartbeat(hb));
    }

    #[test]
    fn test_minimal_song_record_decodes() {
        let raw = br#"{"id":"123","title":"Hey Jude","artist":"The Beatles","albumTitle":"1","duration":431.0}"#;
        match WireMessage::decode(raw).unwrap() {
            WireMessage::NowPlaying(np) => {
                assert_eq!(np.title, "Hey Jude");
                assert_eq!(np.album_title.as_deref(), Some("1"));
                assert!(np.artwork_url.is_none());
                assert_eq!(np.produced_at, 0);
            }
            other => panic!("expected payload, got {:?}", other),
        }
    }

    #[test]
    fn test_any_heartbeat_tagged_record_is_a_heartbeat() {
        for raw in [
            &br#"{"type":"heartbeat"}"#[..],
            &br#"{"type":"heartbeat","timestamp":1718000000.5}"#[..],
            &br#"{"type":"heartbeat","timestamp":"soon","sender":7}"#[..],
        ] {
            assert!(
                matches!(WireMessage::decode(raw), Ok(WireMessage::Heartbeat(_))),
                "rejected {:?}",
                String::from_utf8_lossy(raw)
            );
        }
        match WireMessage::decode(br#"{"type":"heartbeat","timestamp":2.5}"#).unwrap() {
            WireMessage::Heartbeat(hb) => {
                assert_eq!(hb.timestamp, 2.5);
                assert_eq!(hb.sender, PeerId::default());
            }
            other => panic!("expected heartbeat, got {:?}", other),
        }
    }

    #[test]
    fn test_non_finite_numbers_not_encoded() {
        for song in [
            NowPlaying::new("s1", "Song A", "Artist A").with_duration(f64::NAN),
            NowPlaying::new("s1", "Song A", "Artist A").with_duration(f64::INFINITY),
            NowPlaying {
                playback_position: Some(f64::NEG_INFINITY),
                ..NowPlaying::new("s1", "Song A", "Artist A")
            },
        ] {
            assert!(matches!(
                WireMessage::NowPlaying(song).encode(),
                Err(MeshError::Encode(_))
            ));
        }

        let song = NowPlaying::new("s1", "Song A", "Artist A").with_duration(12.5);
        let bytes = WireMessage::NowPlaying(song.clone()).encode().unwrap();
        assert_eq!(WireMessage::decode(&bytes).unwrap(), WireMessage::NowPlaying(song));
    }

    #[test]
    fn test_malformed_inputs_rejected() {
        for raw in [
            &b"ping"[..],
            &b"\xff\x00\x13"[..],
            &b"[1,2,3]"[..],
            &br#"{"type":"bogus","timestamp":1}"#[..],
            &br#"{"title":"no id or artist"}"#[..],
        ] {
            assert!(
                matches!(WireMessage::decode(raw), Err(MeshError::Decode(_))),
                "accepted {:?}",
                String::from_utf8_lossy(raw)
            );
        }
    }
}

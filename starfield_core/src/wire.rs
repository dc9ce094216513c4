//! Wire format of the broadcast channel.
//!
//! Messages are JSON objects discriminated by a `type` field:
//!
//! ```text
//! {"type":"join","peerId":"…","roomId":"lobby"}
//! {"type":"pose","peerId":"…","x":1.0,"y":2.0,"vx":0.0,"vy":0.0,
//!  "rotation":0.0,"thrusting":false,"boosting":false,"senderTimestamp":17}
//! {"type":"state","peerId":"…","isActive":true,"targetId":"…"}
//! ```

use crate::error::SyncError;
use crate::pose::Pose;
use serde::{Deserialize, Serialize};
use starfield_env::{Envelope, PeerId};
use uuid::Uuid;

/// Presence announcement. The relay starts forwarding room traffic after it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinMessage {
    pub peer_id: PeerId,
    pub room_id: String,
}

/// One kinematic sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoseMessage {
    pub peer_id: PeerId,
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
    pub rotation: f64,
    pub thrusting: bool,
    pub boosting: bool,
    pub sender_timestamp: u64,
}

impl PoseMessage {
    pub fn from_pose(peer_id: PeerId, pose: &Pose) -> Self {
        Self {
            peer_id,
            x: pose.x,
            y: pose.y,
            vx: pose.vx,
            vy: pose.vy,
            rotation: pose.rotation,
            thrusting: pose.thrusting,
            boosting: pose.boosting,
            sender_timestamp: pose.sender_timestamp,
        }
    }

    pub fn pose(&self) -> Pose {
        Pose {
            x: self.x,
            y: self.y,
            vx: self.vx,
            vy: self.vy,
            rotation: self.rotation,
            thrusting: self.thrusting,
            boosting: self.boosting,
            sender_timestamp: self.sender_timestamp,
        }
    }
}

/// Non-kinematic activity flag ("working on object `target_id`").
///
/// Delivered on the same channel as poses but never ordered against them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityState {
    pub peer_id: PeerId,
    pub is_active: bool,
    #[serde(default)]
    pub target_id: Option<Uuid>,
}

/// Everything that travels on the broadcast channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TransportMessage {
    Join(JoinMessage),
    Pose(PoseMessage),
    State(ActivityState),
}

impl TransportMessage {
    /// The participant this message is about.
    pub fn peer_id(&self) -> PeerId {
        match self {
            TransportMessage::Join(join) => join.peer_id,
            TransportMessage::Pose(pose) => pose.peer_id,
            TransportMessage::State(state) => state.peer_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        serde_json::to_vec(self).map_err(SyncError::serialization)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        serde_json::from_slice(bytes).map_err(SyncError::serialization)
    }

    /// Wraps the encoded message for the transport.
    pub fn to_envelope(&self, timestamp_ms: u64) -> Result<Envelope, SyncError> {
        Ok(Envelope::new(self.encode()?, timestamp_ms))
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self, SyncError> {
        Self::decode(&envelope.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pose_message_layout() {
        let peer = PeerId::from_seed(1);
        let pose = Pose::at(1.5, -2.0).with_velocity(0.5, 0.0).with_thrust(true, false).stamped(99);
        let msg = TransportMessage::Pose(PoseMessage::from_pose(peer, &pose));

        let json: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "pose");
        assert_eq!(json["peerId"], peer.as_uuid().to_string());
        assert_eq!(json["senderTimestamp"], 99);
        assert_eq!(json["thrusting"], true);
    }

    #[test]
    fn test_decode_state_without_target() {
        let peer = PeerId::from_seed(2);
        let raw = format!(r#"{{"type":"state","peerId":"{}","isActive":false}}"#, peer.as_uuid());

        let msg = TransportMessage::decode(raw.as_bytes()).unwrap();
        assert_eq!(
            msg,
            TransportMessage::State(ActivityState {
                peer_id: peer,
                is_active: false,
                target_id: None,
            })
        );
    }

    #[test]
    fn test_decode_join() {
        let peer = PeerId::from_seed(3);
        let raw = format!(r#"{{"type":"join","peerId":"{}","roomId":"lobby"}}"#, peer.as_uuid());

        let msg = TransportMessage::decode(raw.as_bytes()).unwrap();
        assert_eq!(msg.peer_id(), peer);
        assert!(matches!(msg, TransportMessage::Join(ref j) if j.room_id == "lobby"));
    }

    #[test]
    fn test_decode_garbage_is_serialization_error() {
        let err = TransportMessage::decode(b"\x00\x01").unwrap_err();
        assert!(matches!(err, SyncError::Serialization(_)));
    }

    #[test]
    fn test_envelope_carries_payload() {
        let msg = TransportMessage::Join(JoinMessage {
            peer_id: PeerId::from_seed(4),
            room_id: "r".into(),
        });
        let envelope = msg.to_envelope(1234).unwrap();
        assert_eq!(envelope.timestamp_ms, 1234);
        assert_eq!(TransportMessage::from_envelope(&envelope).unwrap(), msg);
    }
}

//! JSON exporter for offline inspection of a simulation run.
//!
//! Frames hold the ground-truth avatars next to what every client believes,
//! so divergence between the two can be plotted after the fact.

use serde::{Deserialize, Serialize};
use starfield_core::{Pose, SpatialObject};
use starfield_env::PeerId;
use std::fs::File;
use std::io::Write;

/// A single frame of simulation data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimFrame {
    /// Simulation time in seconds
    pub time_sec: f64,

    /// Ground-truth avatar positions
    pub ground_truth: Vec<AvatarPosition>,

    /// Each client's view of its peers
    pub clients: Vec<ClientFrame>,

    /// Events (outages, crashes, joins)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<SimEvent>,
}

/// Position of one avatar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvatarPosition {
    pub peer_id: String,
    pub x: f64,
    pub y: f64,
    pub rotation: f64,
}

impl AvatarPosition {
    pub fn new(peer_id: PeerId, pose: &Pose) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            x: pose.x,
            y: pose.y,
            rotation: pose.rotation,
        }
    }
}

/// One client's cached roster at frame time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    pub peer_id: String,
    pub connected: bool,
    pub peers: Vec<AvatarPosition>,
    /// Mean distance between cached and true positions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_error: Option<f64>,
}

/// Simulation event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimEvent {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

impl SimEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: None,
        }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: Some("warn".to_string()),
        }
    }
}

/// Final position of a placed object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectPosition {
    pub id: String,
    pub zone: String,
    pub x: f64,
    pub y: f64,
    pub completed: bool,
}

impl From<&SpatialObject> for ObjectPosition {
    fn from(object: &SpatialObject) -> Self {
        Self {
            id: object.id.to_string(),
            zone: object.zone_key.to_string(),
            x: object.x,
            y: object.y,
            completed: object.completed,
        }
    }
}

/// Complete simulation export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Duration in seconds
    pub duration_sec: f64,

    /// All frames
    pub frames: Vec<SimFrame>,

    /// Object store contents at the end of the run
    pub objects: Vec<ObjectPosition>,

    /// Final results
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            duration_sec: 0.0,
            frames: Vec::new(),
            objects: Vec::new(),
            passed: false,
            failure_reason: None,
        }
    }

    /// Adds a frame.
    pub fn add_frame(&mut self, frame: SimFrame) {
        self.duration_sec = frame.time_sec;
        self.frames.push(frame);
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool, failure_reason: Option<String>, objects: &[SpatialObject]) {
        self.passed = passed;
        self.failure_reason = failure_reason;
        self.objects = objects.iter().map(ObjectPosition::from).collect();
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use starfield_core::ZoneKey;
    use uuid::Uuid;

    #[test]
    fn test_export_tracks_duration_and_objects() {
        let mut export = SimExport::new("resync", 7);
        export.add_frame(SimFrame {
            time_sec: 1.5,
            ground_truth: vec![AvatarPosition::new(PeerId::from_seed(1), &Pose::at(1.0, 2.0))],
            clients: Vec::new(),
            events: vec![SimEvent::warn("outage")],
        });

        let object = SpatialObject {
            id: Uuid::nil(),
            zone_key: ZoneKey::Unassigned,
            x: 3.0,
            y: 4.0,
            occupied_radius: 40.0,
            completed: false,
            sort_key: "a".into(),
        };
        export.finalize(true, None, &[object]);

        assert_eq!(export.duration_sec, 1.5);
        assert_eq!(export.objects[0].zone, "unassigned");

        let json = serde_json::to_value(&export).unwrap();
        assert!(json.get("failure_reason").is_none());
        assert_eq!(json["frames"][0]["events"][0]["level"], "warn");
    }
}

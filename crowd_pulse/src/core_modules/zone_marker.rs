// THEORY:
// A `ZoneMarker` is an operator-placed point of interest. The engine itself never
// owns markers: it samples whatever set the hosting layer hands it on each tick.
// `ZoneMarkerSet` is the small registry those hosting layers (the visualizer
// server, the replayer) use to create, rename and remove markers with ids that
// can never collide, even when several are placed within the same millisecond.

use serde::{Deserialize, Serialize};

/// An operator-placed point of interest, in percentage coordinates of the video frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneMarker {
    /// Unique and stable for the lifetime of the marker.
    pub id: u64,
    /// Display label.
    pub name: String,
    /// Horizontal position, 0 (left) to 100 (right).
    pub x: f64,
    /// Vertical position, 0 (top) to 100 (bottom).
    pub y: f64,
}

impl ZoneMarker {
    pub fn new(id: u64, name: impl Into<String>, x: f64, y: f64) -> Self {
        Self {
            id,
            name: name.into(),
            x,
            y,
        }
    }
}

/// Registry of markers with monotonic ids.
#[derive(Debug, Clone, Default)]
pub struct ZoneMarkerSet {
    markers: Vec<ZoneMarker>,
    next_id: u64,
}

impl ZoneMarkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places a marker. Blank names become `ZONE NN`.
    pub fn add(&mut self, name: Option<&str>, x: f64, y: f64) -> &ZoneMarker {
        self.next_id += 1;
        let name = match name.map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("ZONE {:02}", self.markers.len() + 1),
        };
        self.markers.push(ZoneMarker::new(
            self.next_id,
            name,
            clamp_percent(x),
            clamp_percent(y),
        ));
        &self.markers[self.markers.len() - 1]
    }

    pub fn remove(&mut self, id: u64) -> Option<ZoneMarker> {
        let index = self.markers.iter().position(|m| m.id == id)?;
        Some(self.markers.remove(index))
    }

    /// Renames in place. Returns false when no marker has this id.
    pub fn rename(&mut self, id: u64, name: impl Into<String>) -> bool {
        match self.markers.iter_mut().find(|m| m.id == id) {
            Some(marker) => {
                marker.name = name.into();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: u64) -> Option<&ZoneMarker> {
        self.markers.iter().find(|m| m.id == id)
    }

    pub fn as_slice(&self) -> &[ZoneMarker] {
        &self.markers
    }

    pub fn to_vec(&self) -> Vec<ZoneMarker> {
        self.markers.clone()
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

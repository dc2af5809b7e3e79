use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Axis-aligned box in source pixel units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// One detected object within a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_name: String,
    /// Confidence in [0, 1].
    pub confidence: f32,
    pub bbox: BoundingBox,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracker_id: Option<u64>,
}

/// One inference result for one source, published on the detection topic.
///
/// `timestamp` is the frame timestamp, not the publish time. `model_id`
/// reflects the model configured at the instant of publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub source_id: u32,
    pub frame_id: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub model_id: String,
    pub inference_time_ms: f64,
    pub detections: Vec<Detection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_event() -> DetectionEvent {
        DetectionEvent {
            source_id: 3,
            frame_id: 1417,
            timestamp: Utc.timestamp_millis_opt(1_720_000_000_123).unwrap(),
            model_id: "yolov8n-640".to_string(),
            inference_time_ms: 23.4,
            detections: vec![Detection {
                class_name: "person".to_string(),
                confidence: 0.87,
                bbox: BoundingBox {
                    x: 120.0,
                    y: 44.5,
                    width: 60.0,
                    height: 170.0,
                },
                tracker_id: Some(12),
            }],
            fps: Some(9.8),
            latency_ms: None,
        }
    }

    #[test]
    fn test_event_round_trip() {
        let event = sample_event();
        let bytes = serde_json::to_vec(&event).unwrap();
        let back: DetectionEvent = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(event, back);
        // Round-trip again to confirm byte stability of schema fields.
        assert_eq!(bytes, serde_json::to_vec(&back).unwrap());
    }

    #[test]
    fn test_timestamp_serializes_as_millis() {
        let value = serde_json::to_value(sample_event()).unwrap();
        assert_eq!(value["timestamp"], serde_json::json!(1_720_000_000_123i64));
    }

    #[test]
    fn test_optional_fields_omitted() {
        let mut event = sample_event();
        event.fps = None;
        event.detections[0].tracker_id = None;
        let value = serde_json::to_value(&event).unwrap();
        assert!(value.get("fps").is_none());
        assert!(value.get("latency_ms").is_none());
        assert!(value["detections"][0].get("tracker_id").is_none());
    }
}

//! Wire schema shared by the NVR processor and its consumers.
//!
//! Everything on the bus is JSON-encoded UTF-8 with snake_case fields.
//! Timestamps travel as integer UTC milliseconds.

pub mod command;
pub mod detection;
pub mod metrics;
pub mod status;
pub mod topics;

pub use command::{
    peek_command_name, AckStatus, CommandAck, CommandEnvelope, CommandParams, EnvelopeError,
    TARGET_ALL,
};
pub use detection::{BoundingBox, Detection, DetectionEvent};
pub use metrics::{
    FullMetricsReport, LatencyReport, MetricsSnapshot, SourceLatency, SourceMetadata,
    SourceStatusUpdate,
};
pub use status::{PingResponse, ProcessorStatus, StatusMessage};

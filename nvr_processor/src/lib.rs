//! Headless NVR control node.
//!
//! Ingests N RTSP-backed sources through an inference pipeline, publishes
//! detection events to the bus, and executes remote commands (pause,
//! resume, reconfigure, restart, stop, ...) delivered over MQTT with a
//! received/completed acknowledgement contract and retained status.
//!
//! Module map:
//! - [`bus`]: MQTT transport, publisher seam, event-loop task
//! - [`control`]: command registry, dispatch, acks, retained status
//! - [`pipeline`]: the inference-pipeline capability and built-in backend
//! - [`manager`]: pipeline lifecycle custody and coordinated restart
//! - [`handlers`]: the command set
//! - [`sink`]: data plane, from the inference callback to detection topics
//! - [`reporter`]: periodic and on-demand metrics
//! - [`processor`]: composition root and join loop

pub mod bus;
pub mod config;
pub mod control;
pub mod error;
pub mod handlers;
pub mod manager;
pub mod pipeline;
pub mod processor;
pub mod reporter;
pub mod sink;
#[cfg(any(test, feature = "test-support"))]
pub mod testutil;

pub use config::ProcessorConfig;
pub use processor::Processor;

//! Topic construction for the bus layout.
//!
//! | topic                                          | retained | payload            |
//! |------------------------------------------------|----------|--------------------|
//! | `{commands}`                                   | no       | `CommandEnvelope`  |
//! | `{status}/{instance}`                          | yes      | `StatusMessage`    |
//! | `{status}/{instance}/ack`                      | no       | `CommandAck`       |
//! | `{status}/{instance}/ping`                     | no       | `PingResponse`     |
//! | `{status}/{instance}/metrics`                  | no       | `FullMetricsReport`|
//! | `{metrics}`                                    | yes      | `MetricsSnapshot`  |
//! | `{detections}/{source_id}`                     | no       | `DetectionEvent`   |

/// Retained per-instance status topic.
pub fn status_topic(status_prefix: &str, instance_id: &str) -> String {
    format!("{}/{}", status_prefix.trim_end_matches('/'), instance_id)
}

pub fn ack_topic(status_prefix: &str, instance_id: &str) -> String {
    format!("{}/ack", status_topic(status_prefix, instance_id))
}

pub fn ping_topic(status_prefix: &str, instance_id: &str) -> String {
    format!("{}/ping", status_topic(status_prefix, instance_id))
}

/// On-demand full metrics report topic for one instance.
pub fn instance_metrics_topic(status_prefix: &str, instance_id: &str) -> String {
    format!("{}/metrics", status_topic(status_prefix, instance_id))
}

pub fn detection_topic(detection_prefix: &str, source_id: u32) -> String {
    format!("{}/{}", detection_prefix.trim_end_matches('/'), source_id)
}

/// Subscription filter matching every source under a detection prefix.
pub fn detection_wildcard(detection_prefix: &str) -> String {
    format!("{}/+", detection_prefix.trim_end_matches('/'))
}

/// Subscription filter matching every instance status (but not subtopics).
pub fn status_wildcard(status_prefix: &str) -> String {
    format!("{}/+", status_prefix.trim_end_matches('/'))
}

/// Instance ids become topic path segments, so MQTT metacharacters and
/// whitespace are rejected.
pub fn is_valid_instance_id(id: &str) -> bool {
    !id.is_empty()
        && !id
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '/' | '+' | '#' | '\0'))
}

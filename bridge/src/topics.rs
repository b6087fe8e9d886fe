//! MQTT topic layout.
//!
//! ```text
//! {prefix}/{device_id}/telemetry               device -> bridge
//! {prefix}/{device_id}/status                  device -> bridge
//! {prefix}/{device_id}/command                 bridge -> device
//! {prefix}/{device_id}/response/{command_id}   device -> bridge
//! ```

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundTopic<'a> {
    Telemetry { device_id: &'a str },
    Status { device_id: &'a str },
    Response { device_id: &'a str, command_id: &'a str },
}

#[derive(Debug, Clone)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().trim_end_matches('/').to_string(),
        }
    }

    /// Filters the bridge subscribes to.
    pub fn subscriptions(&self) -> [String; 3] {
        [
            format!("{}/+/telemetry", self.prefix),
            format!("{}/+/status", self.prefix),
            format!("{}/+/response/+", self.prefix),
        ]
    }

    pub fn command(&self, device_id: &str) -> String {
        format!("{}/{}/command", self.prefix, device_id)
    }

    pub fn classify<'a>(&self, topic: &'a str) -> Option<InboundTopic<'a>> {
        let rest = topic.strip_prefix(self.prefix.as_str())?.strip_prefix('/')?;
        let segments: Vec<&str> = rest.split('/').collect();

        match segments.as_slice() {
            [device_id, "telemetry"] if !device_id.is_empty() => Some(InboundTopic::Telemetry {
                device_id: *device_id,
            }),
            [device_id, "status"] if !device_id.is_empty() => Some(InboundTopic::Status {
                device_id: *device_id,
            }),
            [device_id, "response", command_id] if !device_id.is_empty() => {
                Some(InboundTopic::Response {
                    device_id: *device_id,
                    command_id: *command_id,
                })
            }
            _ => None,
        }
    }
}

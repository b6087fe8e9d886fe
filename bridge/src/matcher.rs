//! Routes device responses to the command they answer.

use crate::correlator::{Correlator, Resolution};
use crate::errors::{Error, Result};
use crate::metrics::RESPONSES_UNMATCHED_TOTAL;
use crate::model::{CommandId, Outcome, ResponseMessage, ResponseStatus, REASON_DEVICE_ERROR};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Extracts the command identifier (from the topic) and the outcome (from
/// the payload) of a device response.
pub fn parse_response(command_id: &str, payload: &[u8]) -> Result<(CommandId, Outcome)> {
    let id = Uuid::parse_str(command_id).map_err(|e| {
        Error::Validation(format!("malformed command id {:?}: {}", command_id, e))
    })?;

    let message: ResponseMessage = serde_json::from_slice(payload)?;

    // The topic is authoritative; an embedded id that disagrees is suspect.
    if let Some(embedded) = &message.command_id {
        if Uuid::parse_str(embedded).ok() != Some(id) {
            return Err(Error::Validation(format!(
                "payload commandID {:?} does not match topic {}",
                embedded, id
            )));
        }
    }

    let outcome = match message.status {
        ResponseStatus::Success => Outcome::Success {
            result: message.result,
        },
        ResponseStatus::Error => Outcome::Failed {
            reason: REASON_DEVICE_ERROR.to_string(),
            result: message.result,
        },
    };

    Ok((id, outcome))
}

#[derive(Clone)]
pub struct ResponseMatcher {
    correlator: Arc<Correlator>,
}

impl ResponseMatcher {
    pub fn new(correlator: Arc<Correlator>) -> Self {
        Self { correlator }
    }

    /// Handles one response message. Failures are logged and counted; they
    /// never propagate to the consumer loop.
    pub fn handle(&self, device_id: &str, command_id: &str, payload: &[u8]) -> Option<Resolution> {
        let (id, outcome) = match parse_response(command_id, payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                RESPONSES_UNMATCHED_TOTAL.inc();
                warn!(device_id = %device_id, "Discarding uncorrelatable response: {}", e);
                return None;
            }
        };

        match self.correlator.resolve(&id, device_id, outcome) {
            Ok(resolution) => Some(resolution),
            Err(e) => {
                RESPONSES_UNMATCHED_TOTAL.inc();
                warn!(
                    device_id = %device_id,
                    command_id = %id,
                    "Discarding response: {}", e
                );
                None
            }
        }
    }
}

//! Command lifecycle: create, publish to the device, resolve on response.

use crate::channel::DeviceChannel;
use crate::db::Repository;
use crate::errors::{Error, Result};
use crate::metrics::{COMMANDS_DISPATCHED_TOTAL, DISPATCH_FAILURES_TOTAL, RESPONSES_DISCARDED_TOTAL};
use crate::model::{Command, CommandId, CommandMessage, CommandStatus, Outcome, Params};
use crate::store::CommandStore;
use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// What happened to a device response handed to [`Correlator::resolve`].
#[derive(Debug)]
pub enum Resolution {
    /// The response settled the command.
    Applied(Command),
    /// The command had already settled; the response was ignored.
    Discarded(CommandStatus),
}

pub struct Correlator {
    store: Arc<CommandStore>,
    devices: Arc<dyn Repository>,
    channel: Arc<dyn DeviceChannel>,
    ttl: Duration,
}

impl Correlator {
    pub fn new(
        store: Arc<CommandStore>,
        devices: Arc<dyn Repository>,
        channel: Arc<dyn DeviceChannel>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            devices,
            channel,
            ttl,
        }
    }

    /// Registers a command for `device_id` and publishes it to the device.
    ///
    /// Returns as soon as the publish completes. If the publish fails the
    /// command is returned already settled as `error`.
    #[instrument(skip(self, params))]
    pub async fn dispatch(
        &self,
        user_id: &str,
        device_id: &str,
        action: &str,
        params: Params,
    ) -> Result<Command> {
        if action.trim().is_empty() {
            return Err(Error::Validation("Action cannot be empty".to_string()));
        }

        let device = self
            .devices
            .find_device(device_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Device {}", device_id)))?;
        if device.user_id != user_id {
            return Err(Error::Forbidden(format!(
                "device {} does not belong to the requesting user",
                device_id
            )));
        }

        let command = self.store.create(device_id, action, params, self.ttl)?;
        let message = CommandMessage::from(&command);

        match self.channel.publish_command(device_id, &message).await {
            Ok(()) => {
                COMMANDS_DISPATCHED_TOTAL.inc();
                info!(command_id = %command.command_id, "Command dispatched");
                Ok(command)
            }
            Err(e) => {
                DISPATCH_FAILURES_TOTAL.inc();
                warn!(command_id = %command.command_id, "Command dispatch failed: {}", e);
                let outcome = Outcome::Failed {
                    reason: format!("dispatch failed: {}", e),
                    result: None,
                };
                match self.store.transition(&command.command_id, outcome) {
                    Ok(failed) => Ok(failed),
                    Err(Error::AlreadyTerminal { .. }) => self.store.get(&command.command_id),
                    Err(e) => Err(e),
                }
            }
        }
    }

    pub fn get(&self, command_id: &CommandId) -> Result<Command> {
        self.store.get(command_id)
    }

    /// Settles a command from a device response.
    ///
    /// A response for a command that already settled (duplicate delivery,
    /// or arriving after the timeout) is discarded, never applied.
    pub fn resolve(
        &self,
        command_id: &CommandId,
        device_id: &str,
        outcome: Outcome,
    ) -> Result<Resolution> {
        let command = self.store.get(command_id)?;
        if command.device_id != device_id {
            return Err(Error::Forbidden(format!(
                "device {} answered command {} addressed to {}",
                device_id, command_id, command.device_id
            )));
        }

        match self.store.transition(command_id, outcome) {
            Ok(command) => {
                info!(
                    command_id = %command_id,
                    device_id = %device_id,
                    status = %command.status,
                    "Command resolved"
                );
                Ok(Resolution::Applied(command))
            }
            Err(Error::AlreadyTerminal { status, .. }) => {
                RESPONSES_DISCARDED_TOTAL.inc();
                debug!(
                    command_id = %command_id,
                    status = %status,
                    "Ignoring response for settled command"
                );
                Ok(Resolution::Discarded(status))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sweeper::sweep_once;
    use crate::testing::{device, InMemoryRepository, RecordingChannel};
    use chrono::Utc;
    use serde_json::json;
    use std::collections::HashSet;

    fn correlator(channel: Arc<RecordingChannel>) -> (Correlator, Arc<CommandStore>) {
        let repo = InMemoryRepository::with_devices(vec![device("d1", "alice"), device("d2", "bob")]);
        let store = Arc::new(CommandStore::new());
        (
            Correlator::new(store.clone(), Arc::new(repo), channel, Duration::seconds(30)),
            store,
        )
    }

    fn calibrate_params() -> Params {
        json!({"targetSensor": "co2"}).as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn test_dispatch_returns_pending_and_publishes() {
        let channel = Arc::new(RecordingChannel::new());
        let (correlator, _) = correlator(channel.clone());

        let command = correlator
            .dispatch("alice", "d1", "calibrate", calibrate_params())
            .await
            .unwrap();

        assert_eq!(command.status, CommandStatus::Pending);
        let published = channel.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "d1");
        assert_eq!(published[0].1.command_id, command.command_id);
        assert_eq!(published[0].1.action, "calibrate");
        assert_eq!(published[0].1.params["targetSensor"], "co2");

        let polled = correlator.get(&command.command_id).unwrap();
        assert_eq!(polled.status, CommandStatus::Pending);
    }

    #[tokio::test]
    async fn test_dispatch_issues_fresh_identifiers() {
        let channel = Arc::new(RecordingChannel::new());
        let (correlator, _) = correlator(channel);

        let mut seen = HashSet::new();
        for _ in 0..20 {
            let command = correlator
                .dispatch("alice", "d1", "calibrate", calibrate_params())
                .await
                .unwrap();
            assert!(seen.insert(command.command_id));
        }
    }

    #[tokio::test]
    async fn test_dispatch_rejects_unknown_or_foreign_device() {
        let channel = Arc::new(RecordingChannel::new());
        let (correlator, store) = correlator(channel.clone());

        let missing = correlator.dispatch("alice", "nope", "ping", Params::new()).await;
        assert!(matches!(missing, Err(Error::NotFound(_))));

        let foreign = correlator.dispatch("alice", "d2", "ping", Params::new()).await;
        assert!(matches!(foreign, Err(Error::Forbidden(_))));

        let blank = correlator.dispatch("alice", "d1", "  ", Params::new()).await;
        assert!(matches!(blank, Err(Error::Validation(_))));

        assert!(channel.published().is_empty());
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_failure_settles_as_error() {
        let channel = Arc::new(RecordingChannel::new());
        channel.set_failing(true);
        let (correlator, _) = correlator(channel);

        let command = correlator
            .dispatch("alice", "d1", "reboot", Params::new())
            .await
            .unwrap();

        assert_eq!(command.status, CommandStatus::Error);
        assert!(command.reason.unwrap().starts_with("dispatch failed"));
        let polled = correlator.get(&command.command_id).unwrap();
        assert_eq!(polled.status, CommandStatus::Error);
    }

    #[tokio::test]
    async fn test_duplicate_response_has_one_effect() {
        let channel = Arc::new(RecordingChannel::new());
        let (correlator, _) = correlator(channel);
        let id = correlator
            .dispatch("alice", "d1", "calibrate", calibrate_params())
            .await
            .unwrap()
            .command_id;

        let first = correlator
            .resolve(&id, "d1", Outcome::Success { result: Some(json!({"offset": 1.5})) })
            .unwrap();
        assert!(matches!(first, Resolution::Applied(_)));

        let second = correlator
            .resolve(&id, "d1", Outcome::Success { result: Some(json!({"offset": 9.9})) })
            .unwrap();
        assert!(matches!(second, Resolution::Discarded(CommandStatus::Success)));

        let stored = correlator.get(&id).unwrap();
        assert_eq!(stored.result, Some(json!({"offset": 1.5})));
    }

    #[tokio::test]
    async fn test_late_response_after_timeout_is_discarded() {
        let channel = Arc::new(RecordingChannel::new());
        let (correlator, store) = correlator(channel);
        let command = correlator
            .dispatch("alice", "d1", "calibrate", calibrate_params())
            .await
            .unwrap();

        let report = sweep_once(&store, command.expires_at, Duration::seconds(300));
        assert_eq!(report.timed_out, 1);

        let late = correlator
            .resolve(&command.command_id, "d1", Outcome::Success { result: None })
            .unwrap();
        assert!(matches!(late, Resolution::Discarded(CommandStatus::Error)));

        let stored = correlator.get(&command.command_id).unwrap();
        assert_eq!(stored.status, CommandStatus::Error);
        assert_eq!(stored.reason.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_response_from_other_device_is_rejected() {
        let channel = Arc::new(RecordingChannel::new());
        let (correlator, _) = correlator(channel);
        let id = correlator
            .dispatch("alice", "d1", "ping", Params::new())
            .await
            .unwrap()
            .command_id;

        let spoofed = correlator.resolve(&id, "d2", Outcome::Success { result: None });
        assert!(matches!(spoofed, Err(Error::Forbidden(_))));
        assert_eq!(correlator.get(&id).unwrap().status, CommandStatus::Pending);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_resolve_racing_sweep_settles_once() {
        let channel = Arc::new(RecordingChannel::new());
        let (correlator, store) = correlator(channel);
        let correlator = Arc::new(correlator);

        for _ in 0..50 {
            let command = correlator
                .dispatch("alice", "d1", "ping", Params::new())
                .await
                .unwrap();
            let id = command.command_id;
            let past_deadline = command.expires_at + Duration::milliseconds(1);

            let resolver = {
                let correlator = correlator.clone();
                tokio::spawn(async move {
                    matches!(
                        correlator.resolve(&id, "d1", Outcome::Success { result: None }),
                        Ok(Resolution::Applied(_))
                    )
                })
            };
            let sweeper = {
                let store = store.clone();
                tokio::spawn(async move {
                    sweep_once(&store, past_deadline, Duration::seconds(300)).timed_out == 1
                })
            };

            let resolved = resolver.await.unwrap();
            let timed_out = sweeper.await.unwrap();
            assert!(resolved ^ timed_out);

            let stored = correlator.get(&id).unwrap();
            let expected = if resolved {
                CommandStatus::Success
            } else {
                CommandStatus::Error
            };
            assert_eq!(stored.status, expected);
        }
    }

    #[tokio::test]
    async fn test_timeout_not_before_deadline() {
        let channel = Arc::new(RecordingChannel::new());
        let (correlator, store) = correlator(channel);
        let command = correlator
            .dispatch("alice", "d1", "ping", Params::new())
            .await
            .unwrap();

        let report = sweep_once(&store, Utc::now(), Duration::seconds(300));
        assert_eq!(report.timed_out, 0);
        assert_eq!(
            correlator.get(&command.command_id).unwrap().status,
            CommandStatus::Pending
        );
    }
}

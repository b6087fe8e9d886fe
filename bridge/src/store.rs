//! In-memory registry of in-flight and recently finished commands.
//!
//! The store is the sole owner of `Command` records. Callers only ever see
//! clones; every mutation goes through [`CommandStore::transition`], which
//! checks and updates a record while holding that key's shard lock, so at
//! most one transition per command can succeed.

use crate::errors::{Error, Result};
use crate::metrics::{COMMANDS_EVICTED_TOTAL, COMMANDS_PENDING, COMMANDS_RESOLVED_TOTAL};
use crate::model::{Command, CommandId, CommandStatus, Outcome, Params};
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct CommandStore {
    commands: DashMap<CommandId, Command>,
}

impl CommandStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new `pending` command expiring `ttl` from now.
    pub fn create(
        &self,
        device_id: &str,
        action: &str,
        params: Params,
        ttl: Duration,
    ) -> Result<Command> {
        let now = Utc::now();
        let command = Command {
            command_id: Uuid::now_v7(),
            device_id: device_id.to_string(),
            action: action.to_string(),
            params,
            status: CommandStatus::Pending,
            result: None,
            reason: None,
            created_at: now,
            updated_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };

        match self.commands.entry(command.command_id) {
            Entry::Occupied(_) => Err(Error::DuplicateCommand(command.command_id)),
            Entry::Vacant(slot) => {
                slot.insert(command.clone());
                COMMANDS_PENDING.inc();
                Ok(command)
            }
        }
    }

    pub fn get(&self, command_id: &CommandId) -> Result<Command> {
        self.commands
            .get(command_id)
            .map(|command| command.clone())
            .ok_or_else(|| Error::NotFound(format!("Command {}", command_id)))
    }

    /// Moves a `pending` command to the terminal state described by `outcome`.
    ///
    /// Fails with `AlreadyTerminal` if another transition got there first.
    pub fn transition(&self, command_id: &CommandId, outcome: Outcome) -> Result<Command> {
        let mut command = self
            .commands
            .get_mut(command_id)
            .ok_or_else(|| Error::NotFound(format!("Command {}", command_id)))?;

        if command.status.is_terminal() {
            return Err(Error::AlreadyTerminal {
                command_id: *command_id,
                status: command.status,
            });
        }

        COMMANDS_RESOLVED_TOTAL
            .with_label_values(&[outcome.label()])
            .inc();
        command.status = outcome.status();
        match outcome {
            Outcome::Success { result } => command.result = result,
            Outcome::Failed { reason, result } => {
                command.reason = Some(reason);
                command.result = result;
            }
        }
        command.updated_at = Utc::now();
        COMMANDS_PENDING.dec();

        Ok(command.clone())
    }

    /// Pending commands whose deadline is at or before `now`.
    ///
    /// Two concurrent callers may both see the same command; only one of
    /// their subsequent transitions will succeed.
    pub fn list_expired(&self, now: DateTime<Utc>) -> Vec<Command> {
        self.commands
            .iter()
            .filter(|command| command.status == CommandStatus::Pending && command.expires_at <= now)
            .map(|command| command.clone())
            .collect()
    }

    /// Terminal commands that finished at least `retention` before `now`.
    pub fn list_retention_expired(&self, now: DateTime<Utc>, retention: Duration) -> Vec<CommandId> {
        self.commands
            .iter()
            .filter(|command| {
                command.status.is_terminal()
                    && command
                        .updated_at
                        .checked_add_signed(retention)
                        .is_some_and(|evict_at| evict_at <= now)
            })
            .map(|command| command.command_id)
            .collect()
    }

    /// Removes a terminal command. Pending commands are never evicted.
    pub fn evict(&self, command_id: &CommandId) -> Option<Command> {
        let removed = self
            .commands
            .remove_if(command_id, |_, command| command.status.is_terminal())
            .map(|(_, command)| command);
        if removed.is_some() {
            COMMANDS_EVICTED_TOTAL.inc();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

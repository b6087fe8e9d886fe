//! In-memory stand-ins for the storage and device-channel seams.

use crate::channel::DeviceChannel;
use crate::db::Repository;
use crate::errors::{Error, Result};
use crate::model::{CommandMessage, Device, ReadingFilter, SensorReading};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

pub fn device(id: &str, user_id: &str) -> Device {
    let now = Utc::now();
    Device {
        id: id.to_string(),
        user_id: user_id.to_string(),
        name: format!("Sensor {}", id),
        location: "Lab".to_string(),
        created_at: now,
        updated_at: now,
    }
}

#[derive(Default)]
pub struct InMemoryRepository {
    devices: HashMap<String, Device>,
    readings: Mutex<Vec<SensorReading>>,
    insert_calls: AtomicUsize,
    failing_inserts: AtomicUsize,
}

impl InMemoryRepository {
    pub fn with_devices(devices: Vec<Device>) -> Self {
        Self {
            devices: devices.into_iter().map(|d| (d.id.clone(), d)).collect(),
            ..Self::default()
        }
    }

    pub fn readings(&self) -> Vec<SensorReading> {
        self.readings.lock().unwrap().clone()
    }

    /// Makes the next `count` inserts fail with a non-transient error.
    pub fn fail_next_inserts(&self, count: usize) {
        self.failing_inserts.store(count, Ordering::SeqCst);
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn insert_readings(&self, batch: &[SensorReading]) -> Result<()> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Database(sqlx::Error::RowNotFound));
        }
        self.readings.lock().unwrap().extend_from_slice(batch);
        Ok(())
    }

    async fn find_device(&self, device_id: &str) -> Result<Option<Device>> {
        Ok(self.devices.get(device_id).cloned())
    }

    async fn list_readings(&self, filter: &ReadingFilter) -> Result<Vec<SensorReading>> {
        Ok(self
            .matching(filter)
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .collect())
    }

    async fn count_readings(&self, filter: &ReadingFilter) -> Result<u64> {
        Ok(self.matching(filter).len() as u64)
    }
}

impl InMemoryRepository {
    /// Readings visible through `filter`, newest first.
    fn matching(&self, filter: &ReadingFilter) -> Vec<SensorReading> {
        let mut readings: Vec<SensorReading> = self
            .readings()
            .into_iter()
            .filter(|r| {
                self.devices
                    .get(&r.device_id)
                    .is_some_and(|d| d.user_id == filter.user_id)
            })
            .filter(|r| filter.device_id.as_ref().map_or(true, |id| &r.device_id == id))
            .filter(|r| filter.start.map_or(true, |start| r.timestamp >= start))
            .filter(|r| filter.end.map_or(true, |end| r.timestamp <= end))
            .collect();
        readings.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        readings
    }
}

#[derive(Default)]
pub struct RecordingChannel {
    published: Mutex<Vec<(String, CommandMessage)>>,
    failing: AtomicBool,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<(String, CommandMessage)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceChannel for RecordingChannel {
    async fn publish_command(&self, device_id: &str, message: &CommandMessage) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Dispatch("broker unreachable".to_string()));
        }
        self.published
            .lock()
            .unwrap()
            .push((device_id.to_string(), message.clone()));
        Ok(())
    }
}

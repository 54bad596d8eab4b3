//! Resolves inbound identifiers to an internal stream id and caches the
//! mapping with a TTL (spec.md §4.5).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::db::{Db, SensorRow};
use crate::error::{IngestError, IngestResult};

#[derive(Clone)]
struct CachedSensor {
    row: SensorRow,
    cached_at: Instant,
}

pub struct SensorResolver {
    db: std::sync::Arc<Db>,
    by_triple: Mutex<HashMap<(String, String, String), CachedSensor>>,
    by_device_sensor: Mutex<HashMap<(Uuid, Uuid), CachedSensor>>,
    ttl: Duration,
}

impl SensorResolver {
    pub fn new(db: std::sync::Arc<Db>, ttl_secs: u64) -> Self {
        Self {
            db,
            by_triple: Mutex::new(HashMap::new()),
            by_device_sensor: Mutex::new(HashMap::new()),
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    fn fresh(&self, cached: &CachedSensor) -> bool {
        cached.cached_at.elapsed() < self.ttl
    }

    /// Domain/source/stream addressing (HTTP/CSV paths, spec.md §4.1).
    pub async fn resolve_by_triple(&self, domain: &str, source: &str, stream: &str) -> IngestResult<SensorRow> {
        let key = (domain.to_string(), source.to_string(), stream.to_string());
        if let Some(cached) = self.by_triple.lock().unwrap().get(&key) {
            if self.fresh(cached) {
                return Ok(cached.row.clone());
            }
        }

        let row = self
            .db
            .find_sensor_by_triple(domain, source, stream)
            .await
            .map_err(IngestError::Internal)?
            .ok_or(IngestError::UnknownSensor)?;

        self.by_triple
            .lock()
            .unwrap()
            .insert(key, CachedSensor { row: row.clone(), cached_at: Instant::now() });
        Ok(row)
    }

    /// MQTT/legacy addressing by device+sensor UUID pair, enforcing that
    /// the sensor actually belongs to the claimed device.
    pub async fn resolve_by_device_and_sensor(&self, device_uuid: Uuid, sensor_uuid: Uuid) -> IngestResult<SensorRow> {
        let key = (device_uuid, sensor_uuid);
        if let Some(cached) = self.by_device_sensor.lock().unwrap().get(&key) {
            if self.fresh(cached) {
                return Ok(cached.row.clone());
            }
        }

        let row = self
            .db
            .find_sensor_by_device_and_uuid(device_uuid, sensor_uuid)
            .await
            .map_err(IngestError::Internal)?
            .ok_or(IngestError::UnknownSensor)?;

        if row.device_uuid != Some(device_uuid) {
            return Err(IngestError::Forbidden);
        }

        self.by_device_sensor
            .lock()
            .unwrap()
            .insert(key, CachedSensor { row: row.clone(), cached_at: Instant::now() });
        Ok(row)
    }

    pub fn invalidate_triple(&self, domain: &str, source: &str, stream: &str) {
        self.by_triple
            .lock()
            .unwrap()
            .remove(&(domain.to_string(), source.to_string(), stream.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row(device_uuid: Option<Uuid>) -> SensorRow {
        SensorRow {
            id: 1,
            stream_uuid: Uuid::nil(),
            domain: "weather".into(),
            source: "station-1".into(),
            stream: "temperature".into(),
            legacy_stream_int: None,
            device_uuid,
            sensor_type: "temperature".into(),
            operational_state: "NORMAL".into(),
            valid_readings_count: 10,
            min_readings_for_normal: 3,
        }
    }

    #[test]
    fn cache_freshness_window_is_respected() {
        let cached = CachedSensor { row: sample_row(None), cached_at: Instant::now() };
        let resolver_ttl = Duration::from_secs(300);
        assert!(cached.cached_at.elapsed() < resolver_ttl);
    }

    #[test]
    fn device_mismatch_is_detected() {
        let row = sample_row(Some(Uuid::nil()));
        let other = Uuid::from_u128(1);
        assert_ne!(row.device_uuid, Some(other));
    }
}

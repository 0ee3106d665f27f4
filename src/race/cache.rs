use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::RaceCraftError;
use crate::features::EngineeredFeatureRow;

/// Which engineered table of a vehicle is cached.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TableVariant {
    /// Whole race as one stint
    Engineered,
    /// Baseline reset at each listed stint start lap
    Stints(Vec<u32>),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub race: String,
    pub vehicle: String,
    pub variant: TableVariant,
}

impl CacheKey {
    pub fn new(race: &str, vehicle: &str, variant: TableVariant) -> Self {
        Self {
            race: race.to_string(),
            vehicle: vehicle.to_string(),
            variant,
        }
    }
}

pub type FeatureTable = Arc<Vec<EngineeredFeatureRow>>;

/// Engineered feature tables shared between readers.
///
/// Readers never block each other. A rebuild holds that key's writer lock, so
/// at most one thread builds a given table while other keys stay free.
#[derive(Debug, Default)]
pub struct FeatureCache {
    tables: RwLock<HashMap<CacheKey, FeatureTable>>,
    writers: Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>,
}

impl FeatureCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<FeatureTable> {
        self.tables.read().get(key).cloned()
    }

    fn writer(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        let mut writers = self.writers.lock();
        Arc::clone(writers.entry(key.clone()).or_default())
    }

    /// Cached table for `key`, built with `build` on a miss. Concurrent misses
    /// on the same key build once.
    pub fn get_or_build<F>(&self, key: &CacheKey, build: F) -> Result<FeatureTable, RaceCraftError>
    where
        F: FnOnce() -> Result<Vec<EngineeredFeatureRow>, RaceCraftError>,
    {
        if let Some(table) = self.get(key) {
            return Ok(table);
        }

        let writer = self.writer(key);
        let _guard = writer.lock();
        // Another writer may have finished while we waited
        if let Some(table) = self.get(key) {
            return Ok(table);
        }

        debug!("Building feature table for {} {} {:?}", key.race, key.vehicle, key.variant);
        let table = Arc::new(build()?);
        self.tables.write().insert(key.clone(), Arc::clone(&table));
        Ok(table)
    }

    /// Replace the table for `key`, serialised with any rebuild of it.
    pub fn insert(&self, key: CacheKey, rows: Vec<EngineeredFeatureRow>) -> FeatureTable {
        let writer = self.writer(&key);
        let _guard = writer.lock();
        let table = Arc::new(rows);
        self.tables.write().insert(key, Arc::clone(&table));
        table
    }

    /// Forget the writer lock of `key` when no thread holds it.
    fn release_writer(&self, key: &CacheKey) {
        let mut writers = self.writers.lock();
        if writers
            .get(key)
            .is_some_and(|writer| Arc::strong_count(writer) == 1)
        {
            writers.remove(key);
        }
    }

    pub fn invalidate(&self, key: &CacheKey) {
        {
            let writer = self.writer(key);
            let _guard = writer.lock();
            self.tables.write().remove(key);
        }
        self.release_writer(key);
    }

    /// Drop every table of one vehicle in one race.
    pub fn invalidate_vehicle(&self, race: &str, vehicle: &str) {
        let keys: Vec<CacheKey> = self
            .tables
            .read()
            .keys()
            .filter(|k| k.race == race && k.vehicle == vehicle)
            .cloned()
            .collect();
        for key in keys {
            self.invalidate(&key);
        }
    }

    /// Drop every table. Writer locks still held by a rebuild are kept.
    pub fn clear(&self) {
        self.tables.write().clear();
        self.writers
            .lock()
            .retain(|_, writer| Arc::strong_count(writer) > 1);
    }

    pub fn len(&self) -> usize {
        self.tables.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().is_empty()
    }

    #[cfg(test)]
    fn writer_count(&self) -> usize {
        self.writers.lock().len()
    }
}

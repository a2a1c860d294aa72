//! The per-partition store: an unordered map of encoded keys to encoded
//! values, owned by exactly one worker at a time.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::{CoreError, Result};
use crate::plugins::ByteAccumulator;

/// Opaque iteration cursor. The position is only meaningful for the exact
/// map generation it was minted against; any write invalidates it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Cursor {
    position: u64,
    generation: u64,
}

/// One page of a shard scan.
#[derive(Debug, Clone)]
pub struct ShardPage {
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
    pub cursor: Vec<u8>,
    pub done: bool,
}

/// Authoritative key→value mapping for one partition.
#[derive(Debug, Default)]
pub struct ShardMap {
    data: HashMap<Vec<u8>, Vec<u8>>,
    generation: u64,
}

impl ShardMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Insert or overwrite.
    pub fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.generation += 1;
        self.data.insert(key, value);
    }

    /// Insert when absent, otherwise merge through the accumulator.
    pub fn update(
        &mut self,
        key: Vec<u8>,
        value: Vec<u8>,
        accumulator: &dyn ByteAccumulator,
    ) -> Result<()> {
        self.generation += 1;
        match self.data.entry(key) {
            Entry::Occupied(mut slot) => {
                let merged = accumulator.accumulate(slot.get(), &value)?;
                slot.insert(merged);
            }
            Entry::Vacant(slot) => {
                slot.insert(value);
            }
        }
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Option<&Vec<u8>> {
        self.data.get(key)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.data.contains_key(key)
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        self.generation += 1;
        self.data.remove(key)
    }

    pub fn clear(&mut self) {
        self.generation += 1;
        self.data.clear();
    }

    /// Moves every entry out, leaving the map empty.
    pub fn drain(&mut self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.generation += 1;
        self.data.drain().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &Vec<u8>)> {
        self.data.iter()
    }

    /// Serves one page of a scan. An empty cursor starts a fresh scan;
    /// iteration order is unspecified but stable for a given generation,
    /// so a scan over a quiescent shard sees each key exactly once.
    pub fn page(&self, shard: usize, cursor: &[u8], fetch_num: usize) -> Result<ShardPage> {
        let cursor = if cursor.is_empty() {
            Cursor {
                position: 0,
                generation: self.generation,
            }
        } else {
            codec::decode(cursor)?
        };
        if cursor.generation != self.generation {
            return Err(CoreError::StaleCursor { shard });
        }

        let start = cursor.position as usize;
        let entries: Vec<(Vec<u8>, Vec<u8>)> = self
            .data
            .iter()
            .skip(start)
            .take(fetch_num)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let next = start + entries.len();
        let done = next >= self.data.len();
        Ok(ShardPage {
            entries,
            cursor: codec::encode(&Cursor {
                position: next as u64,
                generation: self.generation,
            })?,
            done,
        })
    }
}

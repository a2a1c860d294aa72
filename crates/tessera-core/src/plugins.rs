//! Pluggable sharders, accumulators, and selectors.
//!
//! Plugins come in two layers: typed traits that user code implements, and
//! byte-level counterparts that tables and workers actually hold. The byte
//! layer decodes through the codec before delegating, so no downcasts are
//! needed anywhere.

use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::Add;

use crate::codec::{self, DataType};
use crate::error::Result;

/// Maps a key to a shard index. Must be deterministic across processes.
pub trait Sharder<K>: Send + Sync {
    fn shard_for_key(&self, key: &K, num_shards: usize) -> usize;
}

/// Merges a concurrent update into the current value. Must be associative
/// and commutative: batch ordering across peers is not preserved.
pub trait Accumulator<V>: Send + Sync {
    fn accumulate(&self, current: &V, update: &V) -> V;
}

/// Optional post-read filter applied when a worker serves a read.
pub trait Selector<K, V>: Send + Sync {
    fn select(&self, key: &K, value: &V) -> Option<V>;
}

/// Byte-level sharder held by tables.
pub trait ByteSharder: Send + Sync {
    fn shard_for_bytes(&self, key: &[u8], num_shards: usize) -> Result<usize>;
}

/// Byte-level accumulator held by tables.
pub trait ByteAccumulator: Send + Sync {
    fn accumulate(&self, current: &[u8], update: &[u8]) -> Result<Vec<u8>>;
}

/// Byte-level selector held by tables.
pub trait ByteSelector: Send + Sync {
    fn select(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>>;
}

/// Adapts a typed sharder to the byte level.
pub struct SharderBridge<K, S> {
    inner: S,
    _marker: PhantomData<fn(&K)>,
}

impl<K, S> SharderBridge<K, S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }
}

impl<K: DataType, S: Sharder<K>> ByteSharder for SharderBridge<K, S> {
    fn shard_for_bytes(&self, key: &[u8], num_shards: usize) -> Result<usize> {
        let key: K = codec::decode(key)?;
        Ok(self.inner.shard_for_key(&key, num_shards))
    }
}

/// Adapts a typed accumulator to the byte level.
pub struct AccumulatorBridge<V, A> {
    inner: A,
    _marker: PhantomData<fn(&V)>,
}

impl<V, A> AccumulatorBridge<V, A> {
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }
}

impl<V: DataType, A: Accumulator<V>> ByteAccumulator for AccumulatorBridge<V, A> {
    fn accumulate(&self, current: &[u8], update: &[u8]) -> Result<Vec<u8>> {
        let current: V = codec::decode(current)?;
        let update: V = codec::decode(update)?;
        codec::encode(&self.inner.accumulate(&current, &update))
    }
}

/// Adapts a typed selector to the byte level.
pub struct SelectorBridge<K, V, S> {
    inner: S,
    _marker: PhantomData<fn(&K, &V)>,
}

impl<K, V, S> SelectorBridge<K, V, S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }
}

impl<K: DataType, V: DataType, S: Selector<K, V>> ByteSelector for SelectorBridge<K, V, S> {
    fn select(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        let key: K = codec::decode(key)?;
        let value: V = codec::decode(value)?;
        match self.inner.select(&key, &value) {
            Some(v) => Ok(Some(codec::encode(&v)?)),
            None => Ok(None),
        }
    }
}

/// Key reduction used by [`Modulo`]. Integers map to themselves so that
/// `shard_for_key(4, 3) == 1`; strings and byte blobs hash.
pub trait ShardKey {
    fn shard_hash(&self) -> u64;
}

macro_rules! identity_shard_key {
    ($($t:ty),*) => {
        $(impl ShardKey for $t {
            fn shard_hash(&self) -> u64 {
                *self as u64
            }
        })*
    };
}

identity_shard_key!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

impl ShardKey for String {
    fn shard_hash(&self) -> u64 {
        hash_bytes(self.as_bytes())
    }
}

impl ShardKey for Vec<u8> {
    fn shard_hash(&self) -> u64 {
        hash_bytes(self)
    }
}

fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

/// `hash(k) mod num_shards`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Modulo;

impl<K: ShardKey> Sharder<K> for Modulo {
    fn shard_for_key(&self, key: &K, num_shards: usize) -> usize {
        (key.shard_hash() % num_shards as u64) as usize
    }
}

/// Last writer wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct Replace;

impl<V: Clone> Accumulator<V> for Replace {
    fn accumulate(&self, _current: &V, update: &V) -> V {
        update.clone()
    }
}

/// `current + update`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sum;

impl<V> Accumulator<V> for Sum
where
    V: Clone + Add<Output = V> + Send + Sync,
{
    fn accumulate(&self, current: &V, update: &V) -> V {
        current.clone() + update.clone()
    }
}

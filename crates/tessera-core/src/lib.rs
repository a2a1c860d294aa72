//! Tessera core — the single-node leaves of the partitioned table runtime.
//!
//! This crate holds everything the cluster layer builds on: the codec,
//! the pluggable sharder/accumulator/selector families and their registry,
//! the per-partition shard store, and the shared configuration.

pub mod codec;
pub mod config;
pub mod error;
pub mod plugins;
pub mod registry;
pub mod shard;

pub use crate::codec::DataType;
pub use crate::config::Config;
pub use crate::error::{CoreError, Result};
pub use crate::plugins::{
    Accumulator, ByteAccumulator, ByteSelector, ByteSharder, Modulo, Replace, Selector, ShardKey,
    Sharder, Sum,
};
pub use crate::registry::{PluginRegistry, TypeRegistry};
pub use crate::shard::{ShardMap, ShardPage};

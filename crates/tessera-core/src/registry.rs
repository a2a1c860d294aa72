//! Process-wide plugin registry.
//!
//! Every pluggable family (sharders, accumulators, selectors, kernels) is
//! a mapping from a stable integer type id to a factory that rebuilds an
//! instance from its serialized options. The registry is seeded once at
//! startup and then shared immutably; a node that receives a type id it
//! cannot resolve fails fast.

use std::collections::HashMap;
use std::sync::Arc;

use crate::codec::DataType;
use crate::error::{CoreError, Result};
use crate::plugins::{
    Accumulator, AccumulatorBridge, ByteAccumulator, ByteSelector, ByteSharder, Selector,
    SelectorBridge, Sharder, SharderBridge,
};

type Factory<T> = Arc<dyn Fn(&[u8]) -> Result<Box<T>> + Send + Sync>;

/// Type-id → factory table for one plugin family.
pub struct TypeRegistry<T: ?Sized> {
    family: &'static str,
    factories: HashMap<i32, Factory<T>>,
    names: HashMap<String, i32>,
}

impl<T: ?Sized> TypeRegistry<T> {
    pub fn new(family: &'static str) -> Self {
        Self {
            family,
            factories: HashMap::new(),
            names: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, type_id: i32, factory: F)
    where
        F: Fn(&[u8]) -> Result<Box<T>> + Send + Sync + 'static,
    {
        let prev = self.factories.insert(type_id, Arc::new(factory));
        assert!(
            prev.is_none(),
            "duplicate {} type id {type_id}",
            self.family
        );
    }

    pub fn register_named<F>(&mut self, type_id: i32, name: &str, factory: F)
    where
        F: Fn(&[u8]) -> Result<Box<T>> + Send + Sync + 'static,
    {
        self.register(type_id, factory);
        let prev = self.names.insert(name.to_string(), type_id);
        assert!(prev.is_none(), "duplicate {} name {name}", self.family);
    }

    pub fn contains(&self, type_id: i32) -> bool {
        self.factories.contains_key(&type_id)
    }

    pub fn id_by_name(&self, name: &str) -> Result<i32> {
        self.names
            .get(name)
            .copied()
            .ok_or(CoreError::UnknownType {
                family: self.family,
                type_id: -1,
            })
    }

    pub fn build(&self, type_id: i32, opts: &[u8]) -> Result<Box<T>> {
        let factory = self
            .factories
            .get(&type_id)
            .ok_or(CoreError::UnknownType {
                family: self.family,
                type_id,
            })?;
        factory(opts)
    }

    /// Resolves the id without constructing, for fail-fast validation.
    pub fn check(&self, type_id: i32) -> Result<()> {
        if self.contains(type_id) {
            Ok(())
        } else {
            Err(CoreError::UnknownType {
                family: self.family,
                type_id,
            })
        }
    }
}

/// The registries a table node needs to reconstruct a table's plugins.
pub struct PluginRegistry {
    pub sharders: TypeRegistry<dyn ByteSharder>,
    pub accumulators: TypeRegistry<dyn ByteAccumulator>,
    pub selectors: TypeRegistry<dyn ByteSelector>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            sharders: TypeRegistry::new("sharder"),
            accumulators: TypeRegistry::new("accumulator"),
            selectors: TypeRegistry::new("selector"),
        }
    }

    /// Registers a typed sharder for keys of type `K` under `type_id`.
    pub fn register_sharder<K, S, F>(&mut self, type_id: i32, build: F)
    where
        K: DataType,
        S: Sharder<K> + 'static,
        F: Fn(&[u8]) -> S + Send + Sync + 'static,
    {
        self.sharders.register(type_id, move |opts| {
            Ok(Box::new(SharderBridge::<K, S>::new(build(opts))))
        });
    }

    /// Registers a typed accumulator for values of type `V` under `type_id`.
    pub fn register_accumulator<V, A, F>(&mut self, type_id: i32, build: F)
    where
        V: DataType,
        A: Accumulator<V> + 'static,
        F: Fn(&[u8]) -> A + Send + Sync + 'static,
    {
        self.accumulators.register(type_id, move |opts| {
            Ok(Box::new(AccumulatorBridge::<V, A>::new(build(opts))))
        });
    }

    /// Registers a typed selector for `(K, V)` tables under `type_id`.
    pub fn register_selector<K, V, S, F>(&mut self, type_id: i32, build: F)
    where
        K: DataType,
        V: DataType,
        S: Selector<K, V> + 'static,
        F: Fn(&[u8]) -> S + Send + Sync + 'static,
    {
        self.selectors.register(type_id, move |opts| {
            Ok(Box::new(SelectorBridge::<K, V, S>::new(build(opts))))
        });
    }
}

//! Byte serialization for keys and values.
//!
//! Every typed value crossing a worker boundary goes through here, so the
//! one hard requirement is that `decode(encode(x)) == x` and that equal
//! values encode to equal bytes on every node.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CoreError, Result};

/// Bound for any type stored in a table.
pub trait DataType: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> DataType for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| CoreError::Codec(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| CoreError::Codec(e.to_string()))
}

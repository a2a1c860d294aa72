use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unknown {family} type id {type_id}")]
    UnknownType { family: &'static str, type_id: i32 },
    #[error("codec error: {0}")]
    Codec(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("shard {shard} out of range for table {table} ({num_shards} shards)")]
    ShardOutOfRange {
        table: u32,
        shard: usize,
        num_shards: usize,
    },
    #[error("iterator cursor invalidated by writes to shard {shard}")]
    StaleCursor { shard: usize },
    #[error("missing key")]
    MissingKey,
    #[error("not implemented: {0}")]
    Unimplemented(&'static str),
}

impl CoreError {
    pub fn is_missing_key(&self) -> bool {
        matches!(self, CoreError::MissingKey)
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

//! Shard execution against a single inference server.
//!
//! [`Worker`] owns one endpoint and runs its shards in order. Record IO lives
//! in [`records`], prompt construction and output validation in [`prompt`].

pub mod executor;
pub mod prompt;
pub mod records;

pub use executor::{ShardFailure, ShardResult, Worker};
pub use prompt::{build_messages, build_prompt, clean_latex, parse_strict_json, MathAnalysis, ParseError};
pub use records::{
    encode_artifact, encode_shard, read_artifact, read_shard, InputRecord, OutputRecord,
    RecordStatus,
};

//! Ingestion: payload parsing and the end-to-end pipeline.

pub mod normalize;
pub mod pipeline;

pub use normalize::{MAX_BATCH_LEN, MAX_BODY_BYTES, ParseError, ValidationError};
pub use pipeline::{EventOutcome, IngestRequest, Pipeline, Rejection};

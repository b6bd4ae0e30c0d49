//! Long-form document translation pipeline.
//!
//! A plain-text document is split into token-bounded chunks with rolling
//! context, translated chunk-by-chunk through an LLM provider under
//! account-wide rate limits, and reassembled in order. Jobs move through an
//! explicit state machine with conditional writes so retries and duplicate
//! triggers are safe.

pub mod chunker;
pub mod cli;
pub mod config;
pub mod error;
pub mod job;
pub mod limiter;
pub mod llm;
pub mod orchestrator;
pub mod store;
pub mod token;
pub mod worker;

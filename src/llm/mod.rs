//! LLM adapter: Ollama-compatible completion and vision calls.

mod client;
mod json_extract;
mod rate;

pub use client::LlmClient;
pub use json_extract::{extract_json, first_json_object};
pub use rate::TokenBucket;

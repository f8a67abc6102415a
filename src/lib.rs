//! brant - commercial roofing estimate pipeline.
//!
//! Ingests roofing PDFs (blueprints, inspection reports, existing
//! estimates) and produces structured estimates by composing OCR,
//! computer-vision measurement, and LLM interpretation behind a durable
//! job queue with three-phase commit semantics.

pub mod blobstore;
pub mod cli;
pub mod config;
pub mod error;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod repository;
pub mod server;
pub mod tools;
pub mod validate;
pub mod worker;

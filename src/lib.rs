//! Question answering over aircraft manuals.
//!
//! Uploaded manual pages are indexed for retrieval ([`retrieval`]), loaded
//! indexes are held in an expiring cache ([`cache`]), and answers are
//! synthesized by a multimodal chat model from the best-matching pages
//! ([`llm`]). [`web`] exposes the HTTP API.

pub mod cache;
pub mod config;
pub mod llm;
pub mod retrieval;
pub mod telemetry;
pub mod web;

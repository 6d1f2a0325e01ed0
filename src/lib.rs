//! Portico - Rate-Limited SPA Gateway
//!
//! This crate serves a single-page application bundle alongside a small JSON
//! API. API requests are limited per client over a fixed window and carry
//! `X-Ratelimit-*` headers; shutdown drains in-flight requests before the
//! counter backend's cleanup is stopped.

pub mod config;
pub mod error;
pub mod gateway;
pub mod ratelimit;

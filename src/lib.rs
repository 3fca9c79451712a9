//! ForgeImages Core - Template Compositing Pipeline
//!
//! Four stages, always run in this order by `pipeline::Pipeline::process`:
//! 1. `resolver` acquires an extracted, checksum-verified template directory.
//! 2. `manifest` parses, validates, and normalizes that template's manifest
//!    into an absolute-path runtime spec, then verifies every asset exists.
//! 3. `render` composites the raw photo and the template's background and
//!    stickers into an RGBA canvas.
//! 4. `storage` persists the encoded bytes and mints public URLs.
//!
//! `error` defines the closed taxonomy every stage failure maps into; no
//! request path may produce anything outside it, and none may produce an
//! HTTP 5xx - `http` encodes that guarantee at the boundary.

pub mod config;
pub mod error;
pub mod hashing;
pub mod http;
pub mod manifest;
pub mod pipeline;
pub mod render;
pub mod resolver;
pub mod storage;
pub mod telemetry;

pub use config::EngineConfig;
pub use error::{ErrorBody, ErrorCode, Note, StageError};
pub use pipeline::{JobResult, Pipeline, ProcessRequest};
pub use resolver::{ResolveOutcome, TemplateKey, TemplateResolver};
pub use storage::{OutputKind, StorageAdapter};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

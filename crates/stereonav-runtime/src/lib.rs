//! `stereonav-runtime` – the localisation façade and its surroundings.
//!
//! # Modules
//!
//! - [`config`] – [`SteersmanConfig`][config::SteersmanConfig]: the single
//!   explicit configuration record (robot geometry, sampling envelope,
//!   metagrid buffer), persisted as TOML.
//! - [`steersman`] – [`Steersman`][steersman::Steersman]: owns the geometry,
//!   the metagrid buffer and the last known pose per camera, and turns stereo
//!   features into pose corrections via sample → score → estimate.
//! - [`simulation`] – [`SyntheticCorridor`][simulation::SyntheticCorridor]:
//!   a seeded landmark world for recording synthetic paths and exercising
//!   localisation end to end.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter. Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable trace export.

pub mod config;
pub mod simulation;
pub mod steersman;
pub mod telemetry;

pub use config::{SamplingConfig, SteersmanConfig};
pub use simulation::{CorridorParams, SyntheticCorridor};
pub use steersman::Steersman;
pub use telemetry::{TracerProviderGuard, init_tracing};

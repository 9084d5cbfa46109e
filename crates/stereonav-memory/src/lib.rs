//! `stereonav-memory` – what the robot has seen, and where.
//!
//! # Modules
//!
//! - [`path_log`] – [`PathWriter`][path_log::PathWriter] and
//!   [`read_path`][path_log::read_path]: the append-only binary path log
//!   (pose index, pose log, compressed feature log).
//! - [`metagrid`] – [`MetagridBuffer`][metagrid::MetagridBuffer]: a small
//!   pool of occupancy-grid slots that follows the robot, keeping only the
//!   map region near it in memory.

pub mod metagrid;
pub mod path_log;

pub use metagrid::{LoadSummary, MappedStep, MetagridBuffer, MetagridConfig, SlotState};
pub use path_log::{PathLog, PathWriter, read_path, read_path_until};

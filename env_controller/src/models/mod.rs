//! Controller data models.

pub mod cluster;
pub mod environment;
pub mod status;

//! VidioVision: upload an image, get back a cinematic video prompt.
//!
//! The [`session::SessionController`] owns all UI-facing state and drives a
//! single [`analysis::Analyzer`] call at a time; [`routes`] exposes it over HTTP.

pub mod analysis;
pub mod config;
pub mod error;
pub mod image_data;
pub mod routes;
pub mod session;

//! Rice leaf disease overlays and disease information retrieval.

pub mod cache;
pub mod chat;
pub mod config;
pub mod content;
pub mod dispatch;
pub mod error;
pub mod generator;
pub mod geometry;
pub mod overlay;
pub mod palette;
pub mod pipeline;
pub mod raster;
pub mod util;

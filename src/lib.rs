//! Environment data fusion: per-service local caches of gridded, station and
//! static raster sources, aggregated at a coordinate and point in time.

pub mod config;
pub mod domain;
pub mod environment;
pub mod error;
pub mod fs_util;
pub mod output;
pub mod providers;
pub mod registry;
pub mod report;
pub mod service;
pub mod statistics;
pub mod store;
pub mod upstream;

#![deny(dead_code)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod config;
pub mod types;

#[path = "../shared/files.rs"]
pub mod shared_files;
pub mod shared {
    pub use super::shared_files as files;
}

#[path = "../assemble/mod.rs"]
pub mod assemble;

#[path = "../impute/mod.rs"]
pub mod impute;

#[path = "../samples/mod.rs"]
pub mod samples;

#[path = "../select/mod.rs"]
pub mod select;

#[path = "../train/mod.rs"]
pub mod train;

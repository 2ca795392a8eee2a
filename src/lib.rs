pub mod build;
pub mod buildbox_config;
pub mod container;
pub mod errors;

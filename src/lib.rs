pub mod app;
pub mod archive;
pub mod domain;
pub mod error;
pub mod hobs;
pub mod mirror;
pub mod output;
pub mod poll;
pub mod settings;
pub mod staging;
pub mod tui;

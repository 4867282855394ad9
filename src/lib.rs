pub mod app;
pub mod cancel;
pub mod catalog;
pub mod config;
pub mod convert;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod fs_util;
pub mod merge;
pub mod output;
pub mod upload;
pub mod verify;

#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![warn(
	clippy::pedantic,
	clippy::cargo,
	clippy::nursery,
	missing_docs,
	rustdoc::missing_crate_level_docs
)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::module_name_repetitions)]

pub mod certs;
pub mod config;
pub mod conn;
pub mod http;
pub mod plugin;
pub mod proxy;
pub mod resolver;
pub mod server;
pub mod util;
pub mod web;

#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
pub mod api;
mod caddy;
mod config;
mod controller;
mod engine;
mod error;
mod resource;
mod store;

pub use caddy::CaddyManager;
pub use config::{CaddyConfig, Config, DatabaseConfig, Env, ServerConfig, DEFAULT_CONFIG_PATH};
pub use controller::{run, Context, DEFAULT_INTERVAL};
pub use engine::{docker::DockerEngine, ContainerEngine};
pub use error::{Error, ErrorKind, Result};
pub use resource::{Application, Environment, Network, Pod, Project, ProxySettings, Team};
pub use store::Store;

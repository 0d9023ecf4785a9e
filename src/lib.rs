#[macro_use]
extern crate derive_more;
#[macro_use]
extern crate log;
#[macro_use]
extern crate serde;

pub mod broadcast;
pub mod check_up;
pub mod checker;
pub mod controllers;
pub mod dal;
pub mod flag_io;
pub mod models;
pub mod provisioner;
pub mod scheduler;
pub mod utils;
pub mod web;

mod config;
mod error;
mod game;
mod key;

pub use crate::config::{
  BroadcastConfig, Config, DockerConfig, SchedulerConfig, ScoringConfig,
  TeamConfig,
};
pub use crate::error::{Error, Result};
pub use crate::game::{GameServer, StopReport};
pub use crate::key::generate_flag;

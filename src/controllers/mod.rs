//! Request-level operations on top of the data access layer.

pub mod flag;
pub mod game;
pub mod scoreboard;

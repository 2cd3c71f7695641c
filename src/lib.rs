#[macro_use]
extern crate log;

pub mod app;
pub mod common;
pub mod session;

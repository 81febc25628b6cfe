#![deny(warnings)]

pub mod capture;
pub mod config;
pub mod coordinator;
pub mod display;
pub mod emotion;
pub mod encode;
pub mod protocol;
pub mod session;
pub mod util;

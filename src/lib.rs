#![no_std]

pub mod config;
pub mod drivers;
pub mod platform;
pub mod touch;

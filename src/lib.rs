//! # DPU Provisioning Library
//!
//! This crate contains all functionality for provisioning an
//! OCTEON DPU card over its serial consoles, in library form.
#![cfg_attr(test, allow(unused_imports))]

pub mod utilities {
    pub mod guard;
    pub mod lock;
    pub mod process;
}

pub mod config;
pub mod devices;
pub mod drivers;
pub mod error;
pub mod hal;
pub mod provision;

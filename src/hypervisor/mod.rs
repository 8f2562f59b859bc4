//! This module implements the VMX execution engine: capability probing,
//! control setup, guest state synchronization, guest-physical mappings and
//! the run loops, all on top of a [`host_api::HostApi`].

pub mod capabilities;
pub mod config;
pub mod context;
pub mod controls;
pub mod error;
pub mod events;
pub mod exit;
pub mod host_api;
#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
pub mod hvf;
pub mod lbr;
pub mod page_map;
mod run;
pub mod segment;
pub mod state;
pub mod vcpu;
pub mod vm;
pub mod vmcs;

#[cfg(test)]
mod mock;

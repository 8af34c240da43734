//! # Wayland Server
//!
//! The files here implement the different wayland protocols we
//! support. Usually the filename is a shortened version of the
//! protocol name.
//!
//! ## Design
//!
//! Our wayland singleton and globals are created in the
//! `compositor.rs` file. Effectively, that is the "main" file in
//! this directory. The wayland display and listening socket are
//! created, then a global object advertising each supported
//! protocol is registered.
//!
//! Wayland is very callback-driven, so each protocol file
//! implements the `Dispatch` handlers that react to requests from
//! clients and update the compositor's state. The state every
//! handler sees is the `Tempest`, which hands out reference
//! counted cells for the per-object private data (surfaces, shell
//! surfaces, regions, ...).
//!
//! squall does not use a high level wayland library such as
//! wlroots or smithay: one of the goals is a system that is easy
//! to read and hack on, where every last detail is implemented
//! here. wayland-server provides enough of a wrapper around the
//! wayland api to make programming easy, but not so much that it
//! gets in our way.

// Austin Shafer - 2024

// Supported protocols
pub mod compositor;
mod data_device;
mod keyboard;
pub mod linux_dmabuf;
mod pointer;
pub mod seat;
pub mod shm;
pub mod surface;
mod wl_output;
pub mod wl_region;
mod wl_subcompositor;
pub mod xdg_shell;

// Utils
pub mod role;

// Types of surface roles
//
// Surfaces can be used for multiple things, and the
// role specifies how we are going to use a surface.
// (window vs cursor vs subsurface)
//
// Austin Shafer - 2024
use super::wl_subcompositor::SubSurface;
use super::xdg_shell::ShellSurface;
use crate::squall::cell::Shared;

pub enum Role {
    /// This surface is a child composed onto a parent surface
    subsurface(Shared<SubSurface>),
    /// This surface is a desktop window controlled by xdg_shell
    xdg_surface(Shared<ShellSurface>),
    /// This surface is the pointer image
    cursor,
}

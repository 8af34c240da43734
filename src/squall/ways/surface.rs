// wl_surface interface
//
// The wayland surface represents an on screen buffer. This file
// tracks the double buffered pending/current state and processes
// the commit that promotes one to the other.
//
// Austin Shafer - 2024
extern crate wayland_server as ws;
use ws::protocol::wl_surface::Request;
use ws::protocol::{wl_buffer, wl_callback, wl_output, wl_surface as wlsi};
use ws::Resource;

use super::role::Role;
use super::shm::ShmBuffer;
use super::wl_region::Region;
use super::xdg_shell::ShellSurface;
use crate::squall::cell::Shared;
use crate::squall::signal::Signal;
use crate::squall::Tempest;
use utils::{log, region::Rect};

use std::sync::Arc;

// Dispatch<Interface, Userdata>
#[allow(unused_variables)]
impl ws::Dispatch<wlsi::WlSurface, Shared<Surface>> for Tempest {
    fn request(
        state: &mut Self,
        client: &ws::Client,
        resource: &wlsi::WlSurface,
        request: Request,
        data: &Shared<Surface>,
        dhandle: &ws::DisplayHandle,
        data_init: &mut ws::DataInit<'_, Self>,
    ) {
        data.lock().handle_request(resource, data_init, request);
    }

    fn destroyed(
        state: &mut Self,
        _client: ws::backend::ClientId,
        _resource: &wlsi::WlSurface,
        surf: &Shared<Surface>,
    ) {
        surf.lock().destroy();
    }
}

/// Private structure for a wayland surface
///
/// A surface represents a visible area on screen. Desktop
/// organization effects and other transformations are taken care
/// of by a 'shell' interface, not this. A surface will have a
/// buffer attached to it which will be displayed to the client
/// when it is committed.
#[allow(dead_code)]
pub struct Surface {
    pub s_id: u32,
    /// the client this surface belongs to, for seat lookups
    pub s_client: ws::backend::ClientId,
    /// our protocol object, passed in enter/leave events. Set
    /// right after the library mints the resource.
    pub s_wl_surface: Option<wlsi::WlSurface>,

    // ----- pending state, applied by the next commit -----
    /// The attached buffer. The outer Option tracks whether an
    /// attach happened at all, the inner one allows attaching a
    /// null buffer to unmap.
    s_attached_buffer: Option<Option<wl_buffer::WlBuffer>>,
    /// Frame callback the client attached since the last commit.
    /// At most one is pending at a time.
    s_attached_frame_callback: Option<wl_callback::WlCallback>,
    s_pending_damage: Vec<Rect<i32>>,
    s_pending_subsurfaces: Vec<Shared<super::wl_subcompositor::SubSurface>>,
    s_pending_opaque: Option<Option<Shared<Region>>>,
    s_pending_input: Option<Option<Shared<Region>>>,

    // ----- current state, what the renderer sees -----
    /// The committed buffer, displayed on the next frame
    pub s_committed_buffer: Option<wl_buffer::WlBuffer>,
    /// Buffers this surface no longer holds. Released back to the
    /// client after the next scanout.
    s_release_pending: Vec<wl_buffer::WlBuffer>,
    /// Committed frame callback, consumed at the next scanout
    pub s_frame_callback: Option<wl_callback::WlCallback>,
    /// Current subsurface children, ordered bottom-up
    pub s_subsurfaces: Vec<Shared<super::wl_subcompositor::SubSurface>>,
    /// The opaque region. The renderer could optimize around this
    pub s_opaque: Option<Shared<Region>>,
    /// The input region. Input events are only delivered inside it
    pub s_input: Option<Shared<Region>>,

    /// How this surface is being used
    pub s_role: Option<Role>,
    /// size of the last committed buffer
    pub s_size: (f32, f32),
    /// Emitted when a buffer is attached, with its dimensions.
    /// The toplevel auto-size hook lives here.
    pub s_on_buffer_attached: Signal<(i32, i32)>,
    /// Validates that we cleaned this surf up correctly
    s_is_destroyed: bool,
}

impl Surface {
    pub fn new(id: u32, client: ws::backend::ClientId) -> Surface {
        Surface {
            s_id: id,
            s_client: client,
            s_wl_surface: None,
            s_attached_buffer: None,
            s_attached_frame_callback: None,
            s_pending_damage: Vec::new(),
            s_pending_subsurfaces: Vec::new(),
            s_pending_opaque: None,
            s_pending_input: None,
            s_committed_buffer: None,
            s_release_pending: Vec::new(),
            s_frame_callback: None,
            s_subsurfaces: Vec::new(),
            s_opaque: None,
            s_input: None,
            s_role: None,
            s_size: (0.0, 0.0),
            s_on_buffer_attached: Signal::new(),
            s_is_destroyed: false,
        }
    }

    /// Attach the wl_surface resource backing this object
    pub fn set_resource(&mut self, wl_surface: wlsi::WlSurface) {
        self.s_wl_surface = Some(wl_surface);
    }

    fn get_priv_from_region(
        &self,
        reg: Option<ws::protocol::wl_region::WlRegion>,
    ) -> Option<Shared<Region>> {
        reg.map(|r| r.data::<Shared<Region>>().unwrap().clone())
    }

    /// Handle a request from a client
    ///
    /// Called by wayland-rs, this function dispatches
    /// to the correct handling function.
    pub fn handle_request(
        &mut self,
        surf: &wlsi::WlSurface,
        data_init: &mut ws::DataInit<'_, Tempest>,
        req: Request,
    ) {
        match req {
            Request::Attach { buffer, x: _, y: _ } => self.attach(buffer),
            Request::Commit => self.commit(false),
            Request::Damage {
                x,
                y,
                width,
                height,
            } => self.s_pending_damage.push(Rect::new(x, y, width, height)),
            Request::DamageBuffer {
                x,
                y,
                width,
                height,
            } => self.s_pending_damage.push(Rect::new(x, y, width, height)),
            Request::SetOpaqueRegion { region } => {
                self.s_pending_opaque = Some(self.get_priv_from_region(region));
            }
            Request::SetInputRegion { region } => {
                self.s_pending_input = Some(self.get_priv_from_region(region));
            }
            Request::Frame { callback } => {
                let callback = data_init.init(callback, ());
                self.frame(callback);
            }
            Request::Destroy => {
                // Destroying the surface is only allowed once the
                // client tore down everything built on it
                if self.s_role.is_some() {
                    surf.post_error(
                        wlsi::Error::DefunctRoleObject,
                        "Surface has an active role assigned, destroy that first",
                    );
                }
            }
            Request::SetBufferScale { scale } => {
                if scale != 1 {
                    log::error!("Non-1 buffer scaling is not implemented");
                }
            }
            Request::SetBufferTransform { transform } => {
                if transform.into_result().unwrap_or(wl_output::Transform::Normal)
                    != wl_output::Transform::Normal
                {
                    log::error!("Non-normal buffer transforms are not implemented");
                }
            }
            Request::Offset { .. } => (),
            _ => (),
        }
    }

    /// attach a wl_buffer to the surface
    ///
    /// The client crafts a buffer with care, and tells us that it
    /// will be backing this surface. Nothing is displayed until
    /// the commit; in particular the previously attached buffer is
    /// not released here.
    fn attach(&mut self, buf: Option<wl_buffer::WlBuffer>) {
        if let Some(buffer) = buf.as_ref() {
            if let Some(shm) = buffer.data::<Arc<ShmBuffer>>() {
                let (w, h) = (shm.sb_width, shm.sb_height);
                self.s_on_buffer_attached.emit(&mut (w, h));
            }
        }
        self.s_attached_buffer = Some(buf);
    }

    /// Register a frame callback
    ///
    /// Frame callbacks are a power saving feature, we are going to
    /// tell the clients when to update their buffers instead of
    /// them guessing. The callback is answered after the frame
    /// containing this surface has actually hit the screen.
    fn frame(&mut self, callback: wl_callback::WlCallback) {
        log::debug!("Surf {} attaching frame callback", self.s_id);
        self.s_attached_frame_callback = Some(callback);
    }

    /// Promote the pending state to current
    ///
    /// The commit request tells us the client has fully prepared
    /// this surface to be presented. Subsurfaces are synchronized:
    /// their own commits only accumulate, and the state applies
    /// when the parent commits (`from_parent`).
    pub fn commit(&mut self, from_parent: bool) {
        if let Some(Role::subsurface(sub)) = &self.s_role {
            let sub = sub.clone();
            if !from_parent {
                // Sync mode: the state keeps accumulating until
                // the parent's commit picks it up
                log::debug!("Surf {} deferring commit to parent", self.s_id);
                return;
            }
            // Position is double buffered on the parent
            let mut ss = sub.lock();
            if let Some(pos) = ss.su_pending_position.take() {
                ss.su_position = pos;
            }
        }

        // now we can commit the attached buffer
        if let Some(attached) = self.s_attached_buffer.take() {
            if let Some(prev) = self.s_committed_buffer.take() {
                // The replaced buffer goes back to the client
                // after the next scanout, unless it was simply
                // re-attached
                let reattached = matches!(&attached, Some(new) if *new == prev);
                if !reattached {
                    self.s_release_pending.push(prev);
                }
            }
            self.s_committed_buffer = attached;

            if let Some(buf) = self.s_committed_buffer.as_ref() {
                if let Some(shm) = buf.data::<Arc<ShmBuffer>>() {
                    self.s_size = (shm.sb_width as f32, shm.sb_height as f32);
                }
            }
        }

        // Commit the frame callback
        if let Some(cb) = self.s_attached_frame_callback.take() {
            self.s_frame_callback = Some(cb);
        }

        // The renderer repaints every surface in full each frame,
        // so accumulated damage is simply dropped here
        self.s_pending_damage.clear();

        if let Some(opaque) = self.s_pending_opaque.take() {
            self.s_opaque = opaque;
        }
        if let Some(input) = self.s_pending_input.take() {
            self.s_input = input;
        }

        // Adopt subsurfaces added since the last commit
        if !self.s_pending_subsurfaces.is_empty() {
            let mut added = std::mem::take(&mut self.s_pending_subsurfaces);
            self.s_subsurfaces.append(&mut added);
        }

        // Recursively apply the children's accumulated state
        let children = self.s_subsurfaces.clone();
        for child in children.iter() {
            let child_surf = child.lock().su_surface.upgrade();
            if let Some(cs) = child_surf {
                cs.lock().commit(true);
            }
        }

        // Let the role react to the new state
        let xdg = match &self.s_role {
            Some(Role::xdg_surface(sh)) => Some(sh.clone()),
            _ => None,
        };
        if let Some(shell_surf) = xdg {
            ShellSurface::committed(&shell_surf, self);
        }
    }

    /// Add a subsurface child, applied at the next commit
    pub fn add_pending_subsurface(&mut self, sub: Shared<super::wl_subcompositor::SubSurface>) {
        self.s_pending_subsurfaces.push(sub);
    }

    /// Drop a subsurface child from both pending and current sets
    pub fn remove_subsurface(&mut self, sub: &Shared<super::wl_subcompositor::SubSurface>) {
        self.s_pending_subsurfaces.retain(|s| !s.ptr_eq(sub));
        self.s_subsurfaces.retain(|s| !s.ptr_eq(sub));
    }

    /// Take the buffers that should be released after the next
    /// scanout
    pub fn take_release_pending(&mut self) -> Vec<wl_buffer::WlBuffer> {
        std::mem::take(&mut self.s_release_pending)
    }

    /// Does the point (in surface local coordinates) land in the
    /// input region?
    pub fn input_contains(&self, x: f32, y: f32) -> bool {
        match self.s_input.as_ref() {
            Some(reg) => reg.lock().contains(x as i32, y as i32),
            // no input region means the whole surface accepts
            None => true,
        }
    }

    /// Destroy this surface
    ///
    /// This runs from the wayland destructor, either on an
    /// explicit destroy or when the client goes away.
    pub fn destroy(&mut self) {
        log::debug!("Destroying surface {}", self.s_id);
        self.s_is_destroyed = true;
        self.s_subsurfaces.clear();
        self.s_pending_subsurfaces.clear();
        self.s_committed_buffer = None;
        self.s_frame_callback = None;
        self.s_role = None;
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        if !self.s_is_destroyed {
            panic!("This surface was dropped without being destroyed!");
        }
    }
}

// Add empty definition for wl_callback
#[allow(unused_variables)]
impl ws::Dispatch<wl_callback::WlCallback, ()> for Tempest {
    fn request(
        state: &mut Self,
        client: &ws::Client,
        resource: &wl_callback::WlCallback,
        request: wl_callback::Request,
        data: &(),
        dhandle: &ws::DisplayHandle,
        data_init: &mut ws::DataInit<'_, Self>,
    ) {
    }

    fn destroyed(
        state: &mut Self,
        _client: ws::backend::ClientId,
        _resource: &wl_callback::WlCallback,
        data: &(),
    ) {
    }
}

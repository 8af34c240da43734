// Implementation of the xdg_wm_base, xdg_surface and
// xdg_toplevel interfaces
//
// The xdg shell gives surfaces desktop window semantics: a
// configure/ack cycle, activation, and a per-output window stack
// used for both painting and hit testing.
//
// Austin Shafer - 2024
extern crate wayland_protocols;
extern crate wayland_server as ws;

use wayland_protocols::xdg::shell::server::*;
use ws::Resource;

use super::role::Role;
use super::surface::Surface;
use crate::squall::cell::{Shared, WeakRef};
use crate::squall::output::{Metadata, Output};
use crate::squall::render::PaintContext;
use crate::squall::signal::{SignalAction, SignalToken};
use crate::squall::Tempest;
use utils::{log, region::Rect};

/// The shell paints below the cursor but above the background
pub const XDG_SHELL_PAINT_LAYER: u64 = 100;

/// The front-to-back window stack an output carries in its
/// metadata. Index 0 is the topmost window.
pub type XdgWindowList = Vec<Shared<ShellSurface>>;

// --------------------------------------------------------------
// xdg_wm_base
// --------------------------------------------------------------

#[allow(unused_variables)]
impl ws::GlobalDispatch<xdg_wm_base::XdgWmBase, ()> for Tempest {
    fn bind(
        state: &mut Self,
        handle: &ws::DisplayHandle,
        client: &ws::Client,
        resource: ws::New<xdg_wm_base::XdgWmBase>,
        global_data: &(),
        data_init: &mut ws::DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

// Dispatch<Interface, Userdata>
#[allow(unused_variables)]
impl ws::Dispatch<xdg_wm_base::XdgWmBase, ()> for Tempest {
    fn request(
        state: &mut Self,
        client: &ws::Client,
        resource: &xdg_wm_base::XdgWmBase,
        request: xdg_wm_base::Request,
        data: &(),
        dhandle: &ws::DisplayHandle,
        data_init: &mut ws::DataInit<'_, Self>,
    ) {
        match request {
            xdg_wm_base::Request::GetXdgSurface { id, surface } => {
                let surf = surface.data::<Shared<Surface>>().unwrap().clone();

                // The surface may not have another role yet
                if surf.lock().s_role.is_some() {
                    resource.post_error(
                        xdg_wm_base::Error::Role,
                        "Surface already has a role assigned",
                    );
                    return;
                }

                let shsurf = Shared::new(ShellSurface {
                    ss_shell: state.t_shell.downgrade(),
                    ss_surface: surf.downgrade(),
                    ss_xdg_surface: None,
                    ss_toplevel: None,
                    ss_serial: 1,
                    ss_acked: false,
                    ss_last_acked: 0,
                    ss_mapped: false,
                    ss_offset: (0.0, 0.0),
                    ss_pos: (0.0, 0.0),
                    ss_size: (0.0, 0.0),
                    ss_pending_geom: None,
                    ss_output: WeakRef::empty(),
                    ss_attach_token: None,
                });

                let xdg = data_init.init(id, shsurf.clone());
                surf.lock().s_role = Some(Role::xdg_surface(shsurf.clone()));

                // Kick off the configure/ack cycle right away; the
                // client must ack before it attaches a buffer
                let mut ss = shsurf.lock();
                ss.ss_xdg_surface = Some(xdg.clone());
                let serial = ss.next_serial();
                xdg.configure(serial);
            }
            xdg_wm_base::Request::CreatePositioner { id } => {
                // Positioners parameterize popups, which we do not
                // place yet
                data_init.init(id, ());
            }
            xdg_wm_base::Request::Pong { serial } => {
                log::debug!("xdg_wm_base: client ponged {}", serial);
            }
            xdg_wm_base::Request::Destroy => (),
            _ => (),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: ws::backend::ClientId,
        _resource: &xdg_wm_base::XdgWmBase,
        data: &(),
    ) {
    }
}

#[allow(unused_variables)]
impl ws::Dispatch<xdg_popup::XdgPopup, Shared<ShellSurface>> for Tempest {
    fn request(
        state: &mut Self,
        client: &ws::Client,
        resource: &xdg_popup::XdgPopup,
        request: xdg_popup::Request,
        data: &Shared<ShellSurface>,
        dhandle: &ws::DisplayHandle,
        data_init: &mut ws::DataInit<'_, Self>,
    ) {
    }

    fn destroyed(
        state: &mut Self,
        _client: ws::backend::ClientId,
        _resource: &xdg_popup::XdgPopup,
        data: &Shared<ShellSurface>,
    ) {
    }
}

#[allow(unused_variables)]
impl ws::Dispatch<xdg_positioner::XdgPositioner, ()> for Tempest {
    fn request(
        state: &mut Self,
        client: &ws::Client,
        resource: &xdg_positioner::XdgPositioner,
        request: xdg_positioner::Request,
        data: &(),
        dhandle: &ws::DisplayHandle,
        data_init: &mut ws::DataInit<'_, Self>,
    ) {
    }

    fn destroyed(
        state: &mut Self,
        _client: ws::backend::ClientId,
        _resource: &xdg_positioner::XdgPositioner,
        data: &(),
    ) {
    }
}

// --------------------------------------------------------------
// xdg_surface
// --------------------------------------------------------------

#[allow(unused_variables)]
impl ws::Dispatch<xdg_surface::XdgSurface, Shared<ShellSurface>> for Tempest {
    fn request(
        state: &mut Self,
        client: &ws::Client,
        resource: &xdg_surface::XdgSurface,
        request: xdg_surface::Request,
        data: &Shared<ShellSurface>,
        dhandle: &ws::DisplayHandle,
        data_init: &mut ws::DataInit<'_, Self>,
    ) {
        match request {
            xdg_surface::Request::GetToplevel { id } => {
                let toplevel = data_init.init(id, data.clone());
                ShellSurface::get_toplevel(data, toplevel, state);
            }
            xdg_surface::Request::GetPopup { id, .. } => {
                // Popups get a resource so clients keep working,
                // but no placement logic exists for them
                let _popup = data_init.init(id, data.clone());
                log::error!("xdg_popup is not implemented, the popup will not be mapped");
                let serial = data.lock().next_serial();
                resource.configure(serial);
            }
            xdg_surface::Request::AckConfigure { serial } => {
                log::debug!("xdg_surface: client acked configure event {}", serial);
                data.lock().ack_configure(serial);
            }
            xdg_surface::Request::SetWindowGeometry {
                x,
                y,
                width,
                height,
            } => {
                data.lock().ss_pending_geom = Some(Rect::new(x, y, width, height));
            }
            xdg_surface::Request::Destroy => (),
            _ => (),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: ws::backend::ClientId,
        _resource: &xdg_surface::XdgSurface,
        data: &Shared<ShellSurface>,
    ) {
        ShellSurface::destroy(data, state);
    }
}

// --------------------------------------------------------------
// xdg_toplevel
// --------------------------------------------------------------

#[allow(unused_variables)]
impl ws::Dispatch<xdg_toplevel::XdgToplevel, Shared<ShellSurface>> for Tempest {
    fn request(
        state: &mut Self,
        client: &ws::Client,
        resource: &xdg_toplevel::XdgToplevel,
        request: xdg_toplevel::Request,
        data: &Shared<ShellSurface>,
        dhandle: &ws::DisplayHandle,
        data_init: &mut ws::DataInit<'_, Self>,
    ) {
        match request {
            xdg_toplevel::Request::SetTitle { title } => {
                log::debug!("xdg_toplevel: set_title \"{}\"", title);
                if let Some(tl) = data.lock().ss_toplevel.as_mut() {
                    tl.tl_title = title;
                }
            }
            xdg_toplevel::Request::SetAppId { app_id } => {
                log::debug!("xdg_toplevel: set_app_id \"{}\"", app_id);
                if let Some(tl) = data.lock().ss_toplevel.as_mut() {
                    tl.tl_app_id = app_id;
                }
            }
            xdg_toplevel::Request::SetMaxSize { width, height } => {
                log::debug!("xdg_toplevel: max size {}x{} noted", width, height);
            }
            xdg_toplevel::Request::SetMinSize { width, height } => {
                log::debug!("xdg_toplevel: min size {}x{} noted", width, height);
            }
            xdg_toplevel::Request::Move { .. }
            | xdg_toplevel::Request::Resize { .. }
            | xdg_toplevel::Request::SetMaximized
            | xdg_toplevel::Request::UnsetMaximized
            | xdg_toplevel::Request::SetFullscreen { .. }
            | xdg_toplevel::Request::UnsetFullscreen
            | xdg_toplevel::Request::SetMinimized
            | xdg_toplevel::Request::ShowWindowMenu { .. }
            | xdg_toplevel::Request::SetParent { .. } => {
                log::debug!("xdg_toplevel: ignoring interactive request");
            }
            xdg_toplevel::Request::Destroy => (),
            _ => (),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: ws::backend::ClientId,
        _resource: &xdg_toplevel::XdgToplevel,
        data: &Shared<ShellSurface>,
    ) {
        // Losing the toplevel role unmaps the window; the
        // xdg_surface itself may live on
        data.lock().ss_toplevel = None;
        data.lock().ss_mapped = false;
        if let Some(shell) = data.lock().ss_shell.upgrade() {
            shell.lock().remove_window(data);
        }
    }
}

/// A shell surface
///
/// This is the private protocol object for xdg_surface and its
/// toplevel role. It records where the window sits in the
/// workspace and drives the configure/ack cycle.
#[allow(dead_code)]
pub struct ShellSurface {
    pub ss_shell: WeakRef<XdgShell>,
    /// The base surface. The role points back at it weakly so the
    /// pair collapses deterministically.
    pub ss_surface: WeakRef<Surface>,
    ss_xdg_surface: Option<xdg_surface::XdgSurface>,
    ss_toplevel: Option<Toplevel>,
    /// serial for the next configure event
    ss_serial: u32,
    /// did the client ack a configure since the last commit?
    ss_acked: bool,
    pub ss_last_acked: u32,
    /// a mapped window has committed a buffer after its ack
    pub ss_mapped: bool,
    /// logical offset excluding client side decoration
    pub ss_offset: (f32, f32),
    /// position in workspace coordinates
    pub ss_pos: (f32, f32),
    pub ss_size: (f32, f32),
    ss_pending_geom: Option<Rect<i32>>,
    /// the output this window spawned on
    pub ss_output: WeakRef<Output>,
    ss_attach_token: Option<SignalToken>,
}

/// Toplevel role data
pub struct Toplevel {
    tl_toplevel: xdg_toplevel::XdgToplevel,
    pub tl_title: String,
    pub tl_app_id: String,
}

impl ShellSurface {
    fn next_serial(&mut self) -> u32 {
        let s = self.ss_serial;
        self.ss_serial += 1;
        s
    }

    /// The workspace rectangle of this window
    pub fn rect(&self) -> Rect<f32> {
        Rect::new(self.ss_pos.0, self.ss_pos.1, self.ss_size.0, self.ss_size.1)
    }

    #[allow(dead_code)]
    pub fn title(&self) -> Option<&str> {
        self.ss_toplevel.as_ref().map(|t| t.tl_title.as_str())
    }

    pub fn app_id(&self) -> Option<&str> {
        self.ss_toplevel.as_ref().map(|t| t.tl_app_id.as_str())
    }

    /// Check if this serial is one we handed out, and if so mark
    /// the pending state as applicable at the next commit
    fn ack_configure(&mut self, serial: u32) {
        self.ss_acked = true;
        self.ss_last_acked = serial;
    }

    /// Install the toplevel role
    ///
    /// A toplevel surface is the "normal" window type. The window
    /// auto-sizes to the first buffer the client attaches, gets a
    /// spawn position, and is stacked frontmost on its output.
    fn get_toplevel(
        me: &Shared<ShellSurface>,
        toplevel: xdg_toplevel::XdgToplevel,
        state: &mut Tempest,
    ) {
        {
            let mut ss = me.lock();
            ss.ss_toplevel = Some(Toplevel {
                tl_toplevel: toplevel.clone(),
                tl_title: String::new(),
                tl_app_id: String::new(),
            });
        }

        // Auto-size to the first attached buffer
        let surf = me.lock().ss_surface.upgrade();
        if let Some(surf) = surf {
            let weak = me.downgrade();
            let token = surf
                .lock()
                .s_on_buffer_attached
                .connect(move |size: &mut (i32, i32)| match weak.upgrade() {
                    Some(ss_cell) => {
                        let mut ss = ss_cell.lock();
                        if ss.ss_size == (0.0, 0.0) {
                            ss.ss_size = (size.0 as f32, size.1 as f32);
                        }
                        SignalAction::Ok
                    }
                    None => SignalAction::Delete,
                });
            me.lock().ss_attach_token = Some(token);
        }

        // Pick the output under the cursor (falling back to the
        // first one), give the window its spawn position, and
        // stack it frontmost
        let output = state
            .t_cursor
            .lock()
            .current_output()
            .or_else(|| state.t_shell.lock().first_output());
        if let Some(out) = output {
            let spawn = state.t_shell.lock().next_spawn_pos();
            {
                let mut ss = me.lock();
                ss.ss_output = out.downgrade();
                ss.ss_pos = spawn;
            }
            if let Some(windows) = out.lock().o_metadata.xdg_windows() {
                windows.insert(0, me.clone());
            }
        }

        // width and height 0 means the client picks a size
        let mut ss = me.lock();
        toplevel.configure(0, 0, Vec::new());
        if let Some(xdg) = ss.ss_xdg_surface.clone() {
            let serial = ss.next_serial();
            xdg.configure(serial);
        }
    }

    /// Role hook run at the end of the base surface's commit
    ///
    /// The caller already holds the surface lock, so the surface
    /// is passed in rather than upgraded.
    pub fn committed(me: &Shared<ShellSurface>, surf: &mut Surface) {
        let mut ss = me.lock();
        let has_buffer = surf.s_committed_buffer.is_some();

        // Attaching a buffer before acking the initial configure
        // is a protocol error
        if has_buffer && !ss.ss_mapped && !ss.ss_acked {
            if let Some(xdg) = ss.ss_xdg_surface.as_ref() {
                xdg.post_error(
                    xdg_surface::Error::UnconfiguredBuffer,
                    "A configure must be acked before attaching a buffer",
                );
            }
            return;
        }

        // Window geometry is double buffered; its origin is the
        // CSD exclusion offset
        if let Some(geom) = ss.ss_pending_geom.take() {
            ss.ss_offset = (geom.r_pos.0 as f32, geom.r_pos.1 as f32);
            if geom.r_size.0 > 0 && geom.r_size.1 > 0 {
                ss.ss_size = (geom.r_size.0 as f32, geom.r_size.1 as f32);
            }
        }

        if has_buffer && !ss.ss_mapped {
            ss.ss_mapped = true;
            if ss.ss_size == (0.0, 0.0) {
                ss.ss_size = surf.s_size;
            }
            log::debug!(
                "Mapping window at {:?} size {:?}",
                ss.ss_pos,
                ss.ss_size
            );

            // A freshly mapped window becomes the active one
            let shell = ss.ss_shell.upgrade();
            drop(ss);
            if let Some(shell) = shell {
                shell.lock().activate(me);
            }
        }
    }

    /// Send a configure, with or without the ACTIVATED state
    fn send_activation(&mut self, activated: bool) {
        if let Some(tl) = self.ss_toplevel.as_ref() {
            let mut states: Vec<u8> = Vec::new();
            if activated {
                states.extend_from_slice(&(xdg_toplevel::State::Activated as u32).to_ne_bytes());
            }
            tl.tl_toplevel
                .configure(self.ss_size.0 as i32, self.ss_size.1 as i32, states);
        }

        if let Some(xdg) = self.ss_xdg_surface.clone() {
            let serial = self.next_serial();
            xdg.configure(serial);
        }
    }

    /// The xdg_surface protocol object went away
    fn destroy(me: &Shared<ShellSurface>, _state: &mut Tempest) {
        // The surface loses its role and becomes un-mappable
        // until re-roled
        let surf = me.lock().ss_surface.upgrade();
        if let Some(surf) = surf {
            let mut s = surf.lock();
            if matches!(&s.s_role, Some(Role::xdg_surface(r)) if r.ptr_eq(me)) {
                s.s_role = None;
            }
            if let Some(token) = me.lock().ss_attach_token.take() {
                s.s_on_buffer_attached.disconnect(token);
            }
        }

        let shell = me.lock().ss_shell.upgrade();
        if let Some(shell) = shell {
            shell.lock().remove_window(me);
        }
    }
}

// --------------------------------------------------------------
// The shell itself
// --------------------------------------------------------------

/// Desktop window management state
///
/// Each output carries its own window stack (in its metadata);
/// the shell tracks which outputs exist, which window is
/// activated, and where the next window spawns.
pub struct XdgShell {
    /// outputs we have initialized, in manager order
    xs_outputs: Vec<Shared<Output>>,
    /// the single activated surface, if any
    xs_activated: WeakRef<ShellSurface>,
    xs_next_spawn: (f32, f32),
}

impl XdgShell {
    pub fn new() -> Self {
        Self {
            xs_outputs: Vec::new(),
            xs_activated: WeakRef::empty(),
            xs_next_spawn: (0.0, 0.0),
        }
    }

    /// Prepare a new output for window management: give it a
    /// window list and hook up our paint layer
    pub fn on_output_new(&mut self, output: &Shared<Output>) {
        {
            let mut out = output.lock();
            if out.o_metadata.xdg_windows().is_none() {
                out.o_metadata.insert(Metadata::XdgWindows(Vec::new()));
            }
            out.connect_repaint(XDG_SHELL_PAINT_LAYER, paint);
        }
        self.xs_outputs.push(output.clone());
    }

    pub fn first_output(&self) -> Option<Shared<Output>> {
        self.xs_outputs.first().cloned()
    }

    /// Cascade new windows so they do not all pile up at the
    /// origin
    fn next_spawn_pos(&mut self) -> (f32, f32) {
        let pos = self.xs_next_spawn;
        self.xs_next_spawn.0 = (self.xs_next_spawn.0 + 64.0) % 512.0;
        self.xs_next_spawn.1 = (self.xs_next_spawn.1 + 48.0) % 384.0;
        pos
    }

    /// Make this surface the activated one
    ///
    /// Activation is mutually exclusive: the previously activated
    /// surface is deactivated first.
    pub fn activate(&mut self, surf: &Shared<ShellSurface>) {
        if self.xs_activated.is(surf) {
            return;
        }

        if let Some(prev) = self.xs_activated.upgrade() {
            prev.lock().send_activation(false);
        }

        surf.lock().send_activation(true);
        self.xs_activated = surf.downgrade();
    }

    #[allow(dead_code)]
    pub fn deactivate(&mut self, surf: &Shared<ShellSurface>) {
        if self.xs_activated.is(surf) {
            self.xs_activated = WeakRef::empty();
            surf.lock().send_activation(false);
        }
    }

    /// Move a window to the top of the stack
    ///
    /// With no output given, the window is raised on every output
    /// that has it.
    pub fn raise_to_top(&mut self, surf: &Shared<ShellSurface>, output: Option<&Shared<Output>>) {
        let raise = |out: &Shared<Output>| {
            let mut o = out.lock();
            if let Some(windows) = o.o_metadata.xdg_windows() {
                if let Some(i) = windows.iter().position(|w| w.ptr_eq(surf)) {
                    let win = windows.remove(i);
                    windows.insert(0, win);
                }
            }
        };

        match output {
            Some(out) => raise(out),
            None => {
                for out in self.xs_outputs.iter() {
                    raise(out);
                }
            }
        }
    }

    /// Drop a window from every stack and from activation
    pub fn remove_window(&mut self, surf: &Shared<ShellSurface>) {
        for out in self.xs_outputs.iter() {
            if let Some(windows) = out.lock().o_metadata.xdg_windows() {
                windows.retain(|w| !w.ptr_eq(surf));
            }
        }
        if self.xs_activated.is(surf) {
            self.xs_activated = WeakRef::empty();
        }
    }

    /// Find the topmost window containing `pos` on this output
    ///
    /// `pos` is in workspace coordinates; containment is half open
    /// on the max edge, refined by the surface input region when
    /// one is set.
    pub fn by_position(
        &self,
        output: &Shared<Output>,
        pos: (f32, f32),
    ) -> Option<Shared<ShellSurface>> {
        let windows = match output.lock().o_metadata.xdg_windows_ref() {
            Some(w) => w.clone(),
            None => return None,
        };

        for win in windows.iter() {
            let (rect, mapped, surf) = {
                let ss = win.lock();
                (ss.rect(), ss.ss_mapped, ss.ss_surface.upgrade())
            };
            if !mapped || !rect.contains(pos.0, pos.1) {
                continue;
            }

            if let Some(surf) = surf {
                let local = (pos.0 - rect.r_pos.0, pos.1 - rect.r_pos.1);
                if !surf.lock().input_contains(local.0, local.1) {
                    continue;
                }
                return Some(win.clone());
            }
        }
        None
    }

    /// Find a window by application id
    ///
    /// With no output the stacks are scanned in output order and
    /// the first match wins.
    #[allow(dead_code)]
    pub fn by_app_id(
        &self,
        app_id: &str,
        output: Option<&Shared<Output>>,
    ) -> Option<Shared<ShellSurface>> {
        let search = |out: &Shared<Output>| -> Option<Shared<ShellSurface>> {
            let windows = out.lock().o_metadata.xdg_windows_ref()?.clone();
            windows
                .iter()
                .find(|w| w.lock().app_id() == Some(app_id))
                .cloned()
        };

        match output {
            Some(out) => search(out),
            None => self.xs_outputs.iter().find_map(|out| search(out)),
        }
    }
}

/// The shell's repaint listener
///
/// Walks the output's window stack back-to-front, culls windows
/// that are not visible, and draws the rest with the output pan
/// and the CSD offset applied.
pub fn paint(ctx: &mut PaintContext) -> SignalAction {
    let windows = match ctx.pc_meta.xdg_windows_ref() {
        Some(w) => w.clone(),
        None => return SignalAction::Ok,
    };

    let viewport = Rect::new(
        ctx.pc_pan.0,
        ctx.pc_pan.1,
        ctx.pc_size.0 as f32 / ctx.pc_zoom,
        ctx.pc_size.1 as f32 / ctx.pc_zoom,
    );

    for win in windows.iter().rev() {
        let (rect, offset, mapped, surf) = {
            let ss = win.lock();
            (ss.rect(), ss.ss_offset, ss.ss_mapped, ss.ss_surface.upgrade())
        };

        if !mapped {
            continue;
        }
        let surf = match surf {
            Some(s) => s,
            None => continue,
        };

        // Cull windows that are not on this output at all
        if !viewport.overlaps(&rect) {
            log::verbose!("Window is not visible, culling");
            continue;
        }

        let screen =
            ctx.workspace_to_screen((rect.r_pos.0 - offset.0, rect.r_pos.1 - offset.1));
        ctx.pc_renderer.draw_surface(&surf, screen);
    }

    SignalAction::Ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_rect_containment_is_half_open() {
        let r = Rect::new(100.0, 100.0, 50.0, 50.0);
        assert!(r.contains(100.0, 100.0));
        assert!(r.contains(149.9, 149.9));
        assert!(!r.contains(150.0, 100.0));
        assert!(!r.contains(99.9, 120.0));
    }

    #[test]
    fn spawn_positions_cascade() {
        let mut shell = XdgShell::new();
        let a = shell.next_spawn_pos();
        let b = shell.next_spawn_pos();
        assert_ne!(a, b);
    }
}

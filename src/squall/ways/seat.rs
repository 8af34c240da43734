// Implementation of the wl_seat interface and the focus router
//
// One seat record exists per bound client, holding whatever
// pointer/keyboard/touch resources that client created. Focus is
// compositor-wide: a single surface holds pointer focus and a
// single surface holds keyboard focus, and events are only
// delivered to the focused client's resources.
//
// Austin Shafer - 2024
extern crate nix;
extern crate wayland_server as ws;

use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::unistd::ftruncate;
use ws::protocol::wl_seat::Capability;
use ws::protocol::{wl_keyboard, wl_pointer, wl_seat, wl_touch};
use ws::Resource;

use super::role::Role;
use super::surface::Surface;
use super::xdg_shell::ShellSurface;
use crate::squall::cell::{Shared, WeakRef};
use crate::squall::input::event::{ButtonState, ModsSerial};
use crate::squall::Tempest;
use utils::{log, timing::get_current_millis};

use std::collections::HashMap;
use std::ffi::CString;
use std::fs::File;
use std::io::Write;
use std::os::unix::io::{AsFd, FromRawFd};

#[allow(unused_variables)]
impl ws::GlobalDispatch<wl_seat::WlSeat, ()> for Tempest {
    fn bind(
        state: &mut Self,
        handle: &ws::DisplayHandle,
        client: &ws::Client,
        resource: ws::New<wl_seat::WlSeat>,
        global_data: &(),
        data_init: &mut ws::DataInit<'_, Self>,
    ) {
        let seat = data_init.init(resource, ());

        // Report what kinds of devices libinput actually has
        let (has_kb, has_ptr, has_touch) = state.t_input.lock().capabilities();
        let mut caps = Capability::empty();
        if has_kb {
            caps |= Capability::Keyboard;
        }
        if has_ptr {
            caps |= Capability::Pointer;
        }
        if has_touch {
            caps |= Capability::Touch;
        }
        seat.capabilities(caps);

        if seat.version() >= 2 {
            seat.name("seat0".to_string());
        }

        // One record per client; re-binding reuses it
        state
            .t_seat
            .lock()
            .sm_seats
            .insert(client.id(), SeatRecord::new(seat));
    }
}

#[allow(unused_variables)]
impl ws::Dispatch<wl_seat::WlSeat, ()> for Tempest {
    /// Handle client requests
    ///
    /// This basically just creates and registers the different
    /// input related protocol objects, such as wl_keyboard
    fn request(
        state: &mut Self,
        client: &ws::Client,
        resource: &wl_seat::WlSeat,
        request: wl_seat::Request,
        data: &(),
        dhandle: &ws::DisplayHandle,
        data_init: &mut ws::DataInit<'_, Self>,
    ) {
        match request {
            wl_seat::Request::GetPointer { id } => {
                let pointer = data_init.init(id, ());
                if let Some(record) = state.t_seat.lock().sm_seats.get_mut(&client.id()) {
                    record.sr_pointer = Some(pointer);
                }

                // If this client's surface already holds pointer
                // focus, it should hear about it right away
                let cursor = state.t_cursor.lock().position();
                let mut seat = state.t_seat.lock();
                if let Some(focus) = seat.sm_pointer_focus.upgrade() {
                    if focus.lock().s_client == client.id() {
                        seat.send_pointer_enter(&focus, cursor);
                    }
                }
            }
            wl_seat::Request::GetKeyboard { id } => {
                let keyboard = data_init.init(id, ());

                // Hand the client our xkb keymap through a temp fd
                let keymap = state.t_input.lock().i_xkb_keymap_name.clone();
                match keymap_fd(&keymap) {
                    Ok(file) => {
                        keyboard.keymap(
                            wl_keyboard::KeymapFormat::XkbV1,
                            file.as_fd(),
                            keymap.as_bytes().len() as u32,
                        );
                    }
                    Err(e) => log::error!("Could not share the xkb keymap: {}", e),
                }
                if keyboard.version() >= 4 {
                    keyboard.repeat_info(25, 600);
                }

                if let Some(record) = state.t_seat.lock().sm_seats.get_mut(&client.id()) {
                    record.sr_keyboard = Some(keyboard);
                }

                // Same late-bind enter treatment as the pointer
                let mut seat = state.t_seat.lock();
                if let Some(focus) = seat.sm_keyboard_focus.upgrade() {
                    if focus.lock().s_client == client.id() {
                        seat.send_keyboard_enter(&focus);
                    }
                }
            }
            wl_seat::Request::GetTouch { id } => {
                let touch = data_init.init(id, ());
                if let Some(record) = state.t_seat.lock().sm_seats.get_mut(&client.id()) {
                    record.sr_touch = Some(touch);
                }
            }
            wl_seat::Request::Release => (),
            _ => (),
        }
    }

    fn destroyed(
        state: &mut Self,
        client: ws::backend::ClientId,
        _resource: &wl_seat::WlSeat,
        data: &(),
    ) {
        state.t_seat.lock().sm_seats.remove(&client);
    }
}

#[allow(unused_variables)]
impl ws::Dispatch<wl_touch::WlTouch, ()> for Tempest {
    fn request(
        state: &mut Self,
        client: &ws::Client,
        resource: &wl_touch::WlTouch,
        request: wl_touch::Request,
        data: &(),
        dhandle: &ws::DisplayHandle,
        data_init: &mut ws::DataInit<'_, Self>,
    ) {
    }

    fn destroyed(
        state: &mut Self,
        client: ws::backend::ClientId,
        _resource: &wl_touch::WlTouch,
        data: &(),
    ) {
        if let Some(record) = state.t_seat.lock().sm_seats.get_mut(&client) {
            record.sr_touch = None;
        }
    }
}

/// Write the keymap into an anonymous file the client can map
fn keymap_fd(keymap: &str) -> std::io::Result<File> {
    let fd = memfd_create(
        &CString::new("squall-keymap").unwrap(),
        MemFdCreateFlag::MFD_CLOEXEC,
    )
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    let mut file = unsafe { File::from_raw_fd(fd) };

    ftruncate(fd, keymap.as_bytes().len() as i64)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    file.write_all(keymap.as_bytes())?;
    file.flush()?;
    Ok(file)
}

/// The per-client input resources
pub struct SeatRecord {
    #[allow(dead_code)]
    sr_seat: wl_seat::WlSeat,
    pub sr_pointer: Option<wl_pointer::WlPointer>,
    pub sr_keyboard: Option<wl_keyboard::WlKeyboard>,
    pub sr_touch: Option<wl_touch::WlTouch>,
}

impl SeatRecord {
    fn new(seat: wl_seat::WlSeat) -> Self {
        Self {
            sr_seat: seat,
            sr_pointer: None,
            sr_keyboard: None,
            sr_touch: None,
        }
    }
}

/// Compositor-wide focus state and per-client seat records
pub struct SeatManager {
    pub sm_seats: HashMap<ws::backend::ClientId, SeatRecord>,
    /// the surface under the pointer
    sm_pointer_focus: WeakRef<Surface>,
    /// the surface receiving keys
    sm_keyboard_focus: WeakRef<Surface>,
    /// the serial number for this set of input events
    sm_serial: u32,
    /// last serialized modifier state, replayed on keyboard enter
    pub sm_last_mods: Option<ModsSerial>,
}

impl SeatManager {
    pub fn new() -> Self {
        Self {
            sm_seats: HashMap::new(),
            sm_pointer_focus: WeakRef::empty(),
            sm_keyboard_focus: WeakRef::empty(),
            sm_serial: 1,
            sm_last_mods: None,
        }
    }

    fn next_serial(&mut self) -> u32 {
        let s = self.sm_serial;
        self.sm_serial += 1;
        s
    }

    #[allow(dead_code)]
    pub fn pointer_focus(&self) -> Option<Shared<Surface>> {
        self.sm_pointer_focus.upgrade()
    }

    #[allow(dead_code)]
    pub fn keyboard_focus(&self) -> Option<Shared<Surface>> {
        self.sm_keyboard_focus.upgrade()
    }

    /// Look up the live pointer resource of the client owning
    /// `surf`
    fn pointer_of(&self, surf: &Shared<Surface>) -> Option<wl_pointer::WlPointer> {
        let client = surf.lock().s_client.clone();
        self.sm_seats
            .get(&client)
            .and_then(|r| r.sr_pointer.clone())
            .filter(|p| p.is_alive())
    }

    fn keyboard_of(&self, surf: &Shared<Surface>) -> Option<wl_keyboard::WlKeyboard> {
        let client = surf.lock().s_client.clone();
        self.sm_seats
            .get(&client)
            .and_then(|r| r.sr_keyboard.clone())
            .filter(|k| k.is_alive())
    }

    fn send_pointer_frame(pointer: &wl_pointer::WlPointer) {
        if pointer.version() >= 5 {
            pointer.frame();
        }
    }

    fn send_pointer_enter(&mut self, surf: &Shared<Surface>, cursor: (f32, f32)) {
        if let Some(pointer) = self.pointer_of(surf) {
            let serial = self.next_serial();
            let (lx, ly) = surface_local(surf, cursor);
            if let Some(wl_surf) = surf.lock().s_wl_surface.clone() {
                pointer.enter(serial, &wl_surf, lx, ly);
                Self::send_pointer_frame(&pointer);
            }
        }
    }

    fn send_pointer_leave(&mut self, surf: &Shared<Surface>) {
        if let Some(pointer) = self.pointer_of(surf) {
            let serial = self.next_serial();
            if let Some(wl_surf) = surf.lock().s_wl_surface.clone() {
                pointer.leave(serial, &wl_surf);
                Self::send_pointer_frame(&pointer);
            }
        }
    }

    fn send_keyboard_enter(&mut self, surf: &Shared<Surface>) {
        if let Some(keyboard) = self.keyboard_of(surf) {
            let serial = self.next_serial();
            let wl_surf = match surf.lock().s_wl_surface.clone() {
                Some(w) => w,
                None => return,
            };
            keyboard.enter(serial, &wl_surf, Vec::new());

            // a fresh focus needs to know the modifier state
            if let Some(mods) = self.sm_last_mods {
                let serial = self.next_serial();
                keyboard.modifiers(
                    serial,
                    mods.ms_depressed,
                    mods.ms_latched,
                    mods.ms_locked,
                    mods.ms_group,
                );
            }
        }
    }

    fn send_keyboard_leave(&mut self, surf: &Shared<Surface>) {
        if let Some(keyboard) = self.keyboard_of(surf) {
            let serial = self.next_serial();
            if let Some(wl_surf) = surf.lock().s_wl_surface.clone() {
                keyboard.leave(serial, &wl_surf);
            }
        }
    }

    /// Move pointer focus to `surf`
    ///
    /// The previous focus holder gets a leave, then the new one an
    /// enter with surface local coordinates. Enter always precedes
    /// any motion or button event of the new focus episode.
    pub fn set_pointer_focus(&mut self, surf: Option<&Shared<Surface>>, cursor: (f32, f32)) {
        // already focused? nothing to do
        if let Some(new) = surf {
            if self.sm_pointer_focus.is(new) {
                return;
            }
        } else if self.sm_pointer_focus.upgrade().is_none() {
            return;
        }

        if let Some(prev) = self.sm_pointer_focus.upgrade() {
            log::debug!("Pointer left surface {}", prev.lock().s_id);
            self.send_pointer_leave(&prev);
        }

        match surf {
            Some(new) => {
                log::debug!("Pointer entered surface {}", new.lock().s_id);
                self.sm_pointer_focus = new.downgrade();
                self.send_pointer_enter(new, cursor);
            }
            None => self.sm_pointer_focus = WeakRef::empty(),
        }
    }

    /// Move keyboard focus, with the same leave/enter contract as
    /// the pointer
    pub fn set_keyboard_focus(&mut self, surf: Option<&Shared<Surface>>) {
        if let Some(new) = surf {
            if self.sm_keyboard_focus.is(new) {
                return;
            }
        } else if self.sm_keyboard_focus.upgrade().is_none() {
            return;
        }

        if let Some(prev) = self.sm_keyboard_focus.upgrade() {
            log::debug!("Keyboard left surface {}", prev.lock().s_id);
            self.send_keyboard_leave(&prev);
        }

        match surf {
            Some(new) => {
                log::debug!("Keyboard entered surface {}", new.lock().s_id);
                self.sm_keyboard_focus = new.downgrade();
                self.send_keyboard_enter(new);
            }
            None => self.sm_keyboard_focus = WeakRef::empty(),
        }
    }

    /// Deliver a motion event to the focused surface
    pub fn pointer_motion(&mut self, cursor: (f32, f32)) {
        if let Some(focus) = self.sm_pointer_focus.upgrade() {
            if let Some(pointer) = self.pointer_of(&focus) {
                let (lx, ly) = surface_local(&focus, cursor);
                pointer.motion(get_current_millis(), lx, ly);
                Self::send_pointer_frame(&pointer);
            }
        }
    }

    /// Deliver a button event to the focused surface
    pub fn pointer_button(&mut self, button: u32, pressed: ButtonState) {
        if let Some(focus) = self.sm_pointer_focus.upgrade() {
            if let Some(pointer) = self.pointer_of(&focus) {
                let serial = self.next_serial();
                pointer.button(
                    serial,
                    get_current_millis(),
                    button,
                    match pressed {
                        ButtonState::Pressed => wl_pointer::ButtonState::Pressed,
                        ButtonState::Released => wl_pointer::ButtonState::Released,
                    },
                );
                Self::send_pointer_frame(&pointer);
            }
        }
    }

    fn send_axis(pointer: &wl_pointer::WlPointer, axis_type: wl_pointer::Axis, v120: f64) {
        let time = get_current_millis();
        // scale a wheel detent (120) to a continuous scroll step
        let val = v120 / 120.0 * 10.0;

        if v120 != 0.0 {
            if pointer.version() >= 8 {
                pointer.axis_value120(axis_type, v120 as i32);
            } else if pointer.version() >= 5 {
                // axis_discrete is the old way of saying the same
                // thing, in whole detents
                pointer.axis_discrete(axis_type, (v120 / 120.0) as i32);
            }
            pointer.axis(time, axis_type, val);
        } else {
            // A zero value ends the axis series. Some clients
            // need the stop event to keep kinetic scrolling sane.
            if pointer.version() >= 5 {
                pointer.axis_stop(time, axis_type);
            }
        }
    }

    /// Deliver scroll wheel movement (v120 units) to the focused
    /// surface
    pub fn pointer_axis(&mut self, horizontal: f64, vertical: f64) {
        if let Some(focus) = self.sm_pointer_focus.upgrade() {
            if let Some(pointer) = self.pointer_of(&focus) {
                if pointer.version() >= 5 {
                    pointer.axis_source(wl_pointer::AxisSource::Wheel);
                }
                Self::send_axis(&pointer, wl_pointer::Axis::HorizontalScroll, horizontal);
                Self::send_axis(&pointer, wl_pointer::Axis::VerticalScroll, vertical);
                Self::send_pointer_frame(&pointer);
            }
        }
    }

    /// Deliver a key (and any modifier change) to the keyboard
    /// focus
    pub fn keyboard_key(
        &mut self,
        scancode: u32,
        pressed: ButtonState,
        mods: Option<ModsSerial>,
    ) {
        if let Some(m) = mods {
            self.sm_last_mods = Some(m);
        }

        if let Some(focus) = self.sm_keyboard_focus.upgrade() {
            if let Some(keyboard) = self.keyboard_of(&focus) {
                if let Some(m) = mods {
                    let serial = self.next_serial();
                    keyboard.modifiers(
                        serial,
                        m.ms_depressed,
                        m.ms_latched,
                        m.ms_locked,
                        m.ms_group,
                    );
                }

                let serial = self.next_serial();
                keyboard.key(
                    serial,
                    get_current_millis(),
                    scancode,
                    match pressed {
                        ButtonState::Pressed => wl_keyboard::KeyState::Pressed,
                        ButtonState::Released => wl_keyboard::KeyState::Released,
                    },
                );
            }
        }
    }
}

/// Translate a workspace position into surface local coordinates
///
/// For xdg surfaces the logical (CSD) offset shifts the origin;
/// subsurfaces resolve against their parent recursively.
pub fn surface_local(surf: &Shared<Surface>, pos: (f32, f32)) -> (f64, f64) {
    let origin = surface_origin(surf);
    ((pos.0 - origin.0) as f64, (pos.1 - origin.1) as f64)
}

/// Where this surface's buffer origin sits in the workspace
fn surface_origin(surf: &Shared<Surface>) -> (f32, f32) {
    enum Parent {
        None,
        Shell(Shared<ShellSurface>),
        Sub(Shared<Surface>, (i32, i32)),
    }

    let parent = {
        let s = surf.lock();
        match &s.s_role {
            Some(Role::xdg_surface(sh)) => Parent::Shell(sh.clone()),
            Some(Role::subsurface(sub)) => {
                let ss = sub.lock();
                match ss.su_parent.upgrade() {
                    Some(p) => Parent::Sub(p, ss.su_position),
                    None => Parent::None,
                }
            }
            _ => Parent::None,
        }
    };

    match parent {
        Parent::Shell(sh) => {
            let ss = sh.lock();
            (ss.ss_pos.0 - ss.ss_offset.0, ss.ss_pos.1 - ss.ss_offset.1)
        }
        Parent::Sub(p, off) => {
            let parent_origin = surface_origin(&p);
            (
                parent_origin.0 + off.0 as f32,
                parent_origin.1 + off.1 as f32,
            )
        }
        Parent::None => (0.0, 0.0),
    }
}

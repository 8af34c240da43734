// The input subsystem
//
// Reads events from libinput and broadcasts semantic events to
// the rest of the compositor. Runs in the same thread as the
// protocol dispatch; the event loop polls us once per frame with
// whatever time budget is left.
//
// Austin Shafer - 2024

// Note that when including this file you need to use
// ::input::*, because the line below imports an
// external input crate.
#![allow(dead_code)]
pub mod event;

extern crate input;
extern crate nix;
extern crate udev;
extern crate xkbcommon;

use event::*;

use crate::squall::signal::Signal;
use utils::{log, Context, Result};

use input::event::keyboard::{KeyState, KeyboardEvent, KeyboardEventTrait};
use input::event::pointer::{Axis, PointerEvent, PointerScrollEvent};
use input::event::{DeviceEvent, Event, EventTrait};
use input::{Device, DeviceCapability, Libinput, LibinputInterface};
use nix::poll::{poll, PollFd, PollFlags};
use xkbcommon::xkb;

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;

// Grab the evdev device so nothing else (a tty, another
// compositor) receives these events alongside us
nix::ioctl_write_int!(eviocgrab, b'E', 0x90);

// This is sort of like a private userdata struct which
// is used as an interface to the system's devices
//
// i.e. this could call out to logind/seatd to avoid having to
// be a root user to get raw input.
struct Inkit {
    // For now we don't have anything special to do,
    // so we are just putting a phantom int here since
    // we need to have something.
    _inner: u32,
}

// This is the interface that libinput uses to abstract away
// consolekit and friends.
//
// In our case we just pass the arguments through to `open`.
// We need to use the unix open extensions so that we can pass
// custom flags.
impl LibinputInterface for Inkit {
    // open a device
    fn open_restricted(&mut self, path: &Path, flags: i32) -> std::result::Result<OwnedFd, i32> {
        log::debug!("Opening device {:?}", path);
        match OpenOptions::new()
            // the unix extension's custom_flag field below
            // masks out O_ACCMODE, i.e. read/write, so add
            // them back in
            .read(true)
            .write(true)
            // libinput wants to use O_NONBLOCK
            .custom_flags(flags)
            .open(path)
        {
            Ok(f) => {
                let fd = OwnedFd::from(f);
                // Take the device for ourselves
                unsafe {
                    if eviocgrab(fd.as_raw_fd(), 1).is_err() {
                        log::debug!("Could not grab device {:?}", path);
                    }
                }
                Ok(fd)
            }
            Err(e) => {
                // leave this in, it gives great error msgs
                log::error!("Error on opening {:?}", e);
                Err(-1)
            }
        }
    }

    // close a device
    fn close_restricted(&mut self, fd: OwnedFd) {
        drop(fd);
    }
}

/// This represents an input system
///
/// Input is grabbed from the udev interface, but
/// any method should be applicable. It just feeds
/// the cursor/seat/hotkey subsystems input events
///
/// We will also stash our xkb resources here, and
/// will consult this before sending out keymaps/syms
pub struct InputManager {
    /// libinput context
    i_libin: Libinput,
    /// the fd to poll for new events
    i_fd: RawFd,
    /// devices currently present, from Added/Removed events
    i_devices: Vec<Device>,

    /// xkb goodies
    i_xkb_ctx: xkb::Context,
    i_xkb_keymap: xkb::Keymap,
    /// this is referenced by Seat, which needs to map and
    /// share it with the clients
    pub i_xkb_keymap_name: String,
    /// xkb state machine
    i_xkb_state: xkb::State,

    /// Tracking info for the modifier keys
    /// These keys are sent separately in the modifiers event
    i_mods: HeldMods,

    // Semantic event signals
    pub i_on_mouse_move: Signal<MouseMove>,
    pub i_on_mouse_click: Signal<MouseButton>,
    pub i_on_mouse_scroll: Signal<MouseScroll>,
    pub i_on_keyboard_input: Signal<KeyboardInput>,
    pub i_on_device_add: Signal<()>,
    pub i_on_device_remove: Signal<()>,
}

// NOTE:
// The XKB entries above are not marked send/sync. Due to the way
// squall is written they will never be used from multiple threads,
// so we can safely mark this input handler as sendable
unsafe impl Send for InputManager {}

impl InputManager {
    /// Create an input subsystem on the given udev seat
    ///
    /// Sets up the libinput library from a udev context and
    /// compiles the default xkb keymap.
    pub fn new(seat: &str) -> Result<InputManager> {
        // Print the available input devices. This is only
        // diagnostics, the real device list comes from libinput's
        // Added events.
        if let Ok(mut udev_enum) = udev::Enumerator::new() {
            udev_enum.match_subsystem("input").ok();
            if let Ok(devices) = udev_enum.scan_devices() {
                log::debug!("Printing all input devices:");
                for dev in devices {
                    log::debug!(" - {:?}", dev.syspath());
                }
            }
        }

        let kit = Inkit { _inner: 0 };
        let mut libin = Libinput::new_with_udev(kit);

        // we need to choose a "seat" for udev to listen on
        // the default seat is seat0, which is all input devs
        libin
            .udev_assign_seat(seat)
            .map_err(|_| utils::anyhow!("Failed to assign libinput seat {}", seat))?;

        let fd = libin.as_raw_fd();

        // Create all the components for xkb
        // A description of this can be found in the xkb
        // section of wayland-book.com
        let context = xkb::Context::new(xkb::CONTEXT_NO_FLAGS);
        let keymap = xkb::Keymap::new_from_names(
            &context,
            &"",
            &"",
            &"",
            &"", // These should be env vars
            None,
            xkb::KEYMAP_COMPILE_NO_FLAGS,
        )
        .context("Could not initialize a xkb keymap")?;
        let km_name = keymap.get_as_string(xkb::KEYMAP_FORMAT_TEXT_V1);
        let state = xkb::State::new(&keymap);

        Ok(InputManager {
            i_libin: libin,
            i_fd: fd,
            i_devices: Vec::new(),
            i_xkb_ctx: context,
            i_xkb_keymap: keymap,
            i_xkb_keymap_name: km_name,
            i_xkb_state: state,
            i_mods: HeldMods::default(),
            i_on_mouse_move: Signal::new(),
            i_on_mouse_click: Signal::new(),
            i_on_mouse_scroll: Signal::new(),
            i_on_keyboard_input: Signal::new(),
            i_on_device_add: Signal::new(),
            i_on_device_remove: Signal::new(),
        })
    }

    /// Get a pollable fd for the event loop
    pub fn get_poll_fd(&self) -> RawFd {
        self.i_fd
    }

    /// The capability set of the current device list, in the
    /// order (keyboard, pointer, touch)
    pub fn capabilities(&self) -> (bool, bool, bool) {
        let has = |cap| self.i_devices.iter().any(|d| d.has_capability(cap));
        (
            has(DeviceCapability::Keyboard),
            has(DeviceCapability::Pointer),
            has(DeviceCapability::Touch),
        )
    }

    pub fn held_mods(&self) -> HeldMods {
        self.i_mods
    }

    /// Poll for input and dispatch everything that arrived
    ///
    /// Blocks on the libinput fd for at most `timeout_ms`, then
    /// drains the queue, broadcasting each event on the matching
    /// semantic signal. Returns the number of events handled; 0
    /// on timeout.
    pub fn poll(&mut self, timeout_ms: i32) -> usize {
        let mut fds = [PollFd::new(self.i_fd, PollFlags::POLLIN)];
        match poll(&mut fds, timeout_ms) {
            Ok(n) if n > 0 => (),
            // 0 is a timeout, an error we treat the same way
            _ => return 0,
        }

        // libinput has time sensitive operations which need to
        // take place as soon as the fd is readable
        self.i_libin.dispatch().ok();

        let mut count = 0;
        while let Some(ev) = self.i_libin.next() {
            count += 1;
            self.handle_event(ev);
        }

        count
    }

    fn handle_event(&mut self, ev: Event) {
        match ev {
            Event::Pointer(PointerEvent::Motion(m)) => {
                self.i_on_mouse_move.emit(&mut MouseMove::Relative {
                    mm_dx: m.dx(),
                    mm_dy: m.dy(),
                });
            }
            Event::Pointer(PointerEvent::MotionAbsolute(m)) => {
                self.i_on_mouse_move.emit(&mut MouseMove::Absolute(m));
            }
            Event::Pointer(PointerEvent::Button(b)) => {
                let state = match b.button_state() {
                    input::event::pointer::ButtonState::Pressed => ButtonState::Pressed,
                    input::event::pointer::ButtonState::Released => ButtonState::Released,
                };
                self.i_on_mouse_click.emit(&mut MouseButton {
                    mb_button: b.button(),
                    mb_state: state,
                });
            }
            Event::Pointer(PointerEvent::ScrollWheel(s)) => {
                let mut horizontal = 0.0;
                let mut vertical = 0.0;
                if s.has_axis(Axis::Horizontal) {
                    horizontal = s.scroll_value_v120(Axis::Horizontal);
                }
                if s.has_axis(Axis::Vertical) {
                    vertical = s.scroll_value_v120(Axis::Vertical);
                }
                self.i_on_mouse_scroll.emit(&mut MouseScroll {
                    ms_horizontal: horizontal,
                    ms_vertical: vertical,
                });
            }
            Event::Keyboard(KeyboardEvent::Key(k)) => {
                let state = match k.key_state() {
                    KeyState::Pressed => ButtonState::Pressed,
                    KeyState::Released => ButtonState::Released,
                };
                self.handle_keyboard(k.key(), state);
            }
            Event::Device(DeviceEvent::Added(a)) => {
                let dev = a.device();
                log::debug!("Input device added: {}", dev.sysname());
                self.i_devices.push(dev);
                self.i_on_device_add.emit(&mut ());
            }
            Event::Device(DeviceEvent::Removed(r)) => {
                let name = r.device().sysname().to_string();
                log::debug!("Input device removed: {}", name);
                self.i_devices.retain(|d| d.sysname() != name);
                self.i_on_device_remove.emit(&mut ());
            }
            e => log::debug!("Unhandled input event: {:?}", e),
        }
    }

    /// Handle the user typing on the keyboard
    ///
    /// Updates the xkb state machine first (this has to happen
    /// even if no window is in focus), then broadcasts the
    /// resolved keysym and, if any modifiers were touched, the
    /// serialized modifier state.
    fn handle_keyboard(&mut self, scancode: u32, state: ButtonState) {
        // add 8 to account for differences between evdev and x11
        let keycode = scancode + 8;

        let changed = self.i_xkb_state.update_key(
            keycode,
            match state {
                ButtonState::Pressed => xkb::KeyDirection::Down,
                ButtonState::Released => xkb::KeyDirection::Up,
            },
        );

        // if any modifiers were touched we should send their event
        let mods = if changed != 0 {
            // First update our own tracking of what is held down
            self.i_mods = HeldMods {
                hm_ctrl: self
                    .i_xkb_state
                    .mod_name_is_active(&xkb::MOD_NAME_CTRL, xkb::STATE_MODS_EFFECTIVE),
                hm_alt: self
                    .i_xkb_state
                    .mod_name_is_active(&xkb::MOD_NAME_ALT, xkb::STATE_MODS_EFFECTIVE),
                hm_shift: self
                    .i_xkb_state
                    .mod_name_is_active(&xkb::MOD_NAME_SHIFT, xkb::STATE_MODS_EFFECTIVE),
                hm_caps: self
                    .i_xkb_state
                    .mod_name_is_active(&xkb::MOD_NAME_CAPS, xkb::STATE_MODS_EFFECTIVE),
                hm_logo: self
                    .i_xkb_state
                    .mod_name_is_active(&xkb::MOD_NAME_LOGO, xkb::STATE_MODS_EFFECTIVE),
                hm_num: self
                    .i_xkb_state
                    .mod_name_is_active(&xkb::MOD_NAME_NUM, xkb::STATE_MODS_EFFECTIVE),
            };

            // Now serialize the modifiers into a format suitable
            // for sending to the client
            Some(ModsSerial {
                ms_depressed: self.i_xkb_state.serialize_mods(xkb::STATE_MODS_DEPRESSED),
                ms_latched: self.i_xkb_state.serialize_mods(xkb::STATE_MODS_LATCHED),
                ms_locked: self.i_xkb_state.serialize_mods(xkb::STATE_MODS_LOCKED),
                ms_group: self.i_xkb_state.serialize_layout(xkb::STATE_LAYOUT_EFFECTIVE),
            })
        } else {
            None
        };

        let keysym = self.i_xkb_state.key_get_one_sym(keycode);

        self.i_on_keyboard_input.emit(&mut KeyboardInput {
            ki_scancode: scancode,
            ki_keysym: keysym,
            ki_state: state,
            ki_mods: mods,
            ki_held: self.i_mods,
        });
    }
}

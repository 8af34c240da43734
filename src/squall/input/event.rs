// Semantic input event payloads
//
// The input manager translates raw libinput events into these
// and broadcasts them on its signals. They carry everything a
// listener needs so that no listener ever has to reach back into
// the (locked) input manager.
//
// Austin Shafer - 2024
extern crate input;
extern crate xkbcommon;

use input::event::pointer::PointerMotionAbsoluteEvent;
use xkbcommon::xkb;

/// Pressed state shared by buttons and keys
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ButtonState {
    Pressed,
    Released,
}

/// Which modifiers are held right now
#[derive(Debug, Copy, Clone, Default)]
pub struct HeldMods {
    pub hm_ctrl: bool,
    pub hm_alt: bool,
    pub hm_shift: bool,
    pub hm_caps: bool,
    pub hm_logo: bool,
    pub hm_num: bool,
}

/// The serialized modifier state as wl_keyboard.modifiers wants it
#[derive(Debug, Copy, Clone)]
pub struct ModsSerial {
    pub ms_depressed: u32,
    pub ms_latched: u32,
    pub ms_locked: u32,
    pub ms_group: u32,
}

/// Pointer motion
///
/// Absolute events keep the libinput event around because the
/// coordinate transform needs the destination output's size,
/// which only the cursor manager knows.
pub enum MouseMove {
    Relative {
        mm_dx: f64,
        mm_dy: f64,
    },
    Absolute(PointerMotionAbsoluteEvent),
}

pub struct MouseButton {
    pub mb_button: u32,
    pub mb_state: ButtonState,
}

/// Scroll values in v120 units (one wheel detent = 120)
pub struct MouseScroll {
    pub ms_horizontal: f64,
    pub ms_vertical: f64,
}

pub struct KeyboardInput {
    /// the raw evdev scancode
    pub ki_scancode: u32,
    /// the keysym this resolved to under the current keymap
    pub ki_keysym: xkb::Keysym,
    pub ki_state: ButtonState,
    /// present only when this key changed the modifier state
    pub ki_mods: Option<ModsSerial>,
    pub ki_held: HeldMods,
}

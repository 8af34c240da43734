// Hotkey chord matching
//
// Keysyms get fed into a bounded chord buffer. Registered actions
// are checked longest-sequence-first; the first action whose
// modifiers are all held and whose sequence matches the tail of
// the chord fires, consuming that tail.
//
// Austin Shafer - 2024
use crate::squall::input::event::HeldMods;
use utils::{log, timing::get_current_millis};
use xkbcommon::xkb;

/// Modifiers an action can require
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Modifier {
    Ctrl,
    Alt,
    Shift,
    Logo,
}

impl Modifier {
    fn is_held(&self, held: &HeldMods) -> bool {
        match self {
            Modifier::Ctrl => held.hm_ctrl,
            Modifier::Alt => held.hm_alt,
            Modifier::Shift => held.hm_shift,
            Modifier::Logo => held.hm_logo,
        }
    }
}

/// One key press in the chord buffer
struct KeyPress {
    #[allow(dead_code)]
    kp_time: u32,
    kp_sym: xkb::Keysym,
}

/// A registered binding
pub struct HotkeyAction {
    ha_sequence: Vec<xkb::Keysym>,
    ha_modifiers: Vec<Modifier>,
    ha_action: Box<dyn FnMut() + Send>,
}

impl HotkeyAction {
    pub fn new<F>(sequence: Vec<xkb::Keysym>, modifiers: Vec<Modifier>, action: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        Self {
            ha_sequence: sequence,
            ha_modifiers: modifiers,
            ha_action: Box::new(action),
        }
    }
}

/// The chord matcher
pub struct Hotkey {
    hk_chord: Vec<KeyPress>,
    /// sorted by descending sequence length so the longest match
    /// always wins
    hk_actions: Vec<HotkeyAction>,
    hk_max_len: usize,
}

impl Hotkey {
    pub fn new() -> Self {
        Self {
            hk_chord: Vec::new(),
            hk_actions: Vec::new(),
            hk_max_len: 0,
        }
    }

    pub fn add(&mut self, action: HotkeyAction) {
        self.hk_max_len = self.hk_max_len.max(action.ha_sequence.len());
        self.hk_actions.push(action);
        self.hk_actions
            .sort_by(|a, b| b.ha_sequence.len().cmp(&a.ha_sequence.len()));
    }

    /// Feed one pressed keysym into the chord
    ///
    /// Returns true if an action fired, in which case the matched
    /// suffix has been consumed and the key should not be
    /// delivered to clients.
    pub fn feed(&mut self, sym: xkb::Keysym, held: &HeldMods) -> bool {
        self.hk_chord.push(KeyPress {
            kp_time: get_current_millis(),
            kp_sym: sym,
        });

        let mut fired = false;
        for action in self.hk_actions.iter_mut() {
            let len = action.ha_sequence.len();
            if len == 0 || self.hk_chord.len() < len {
                continue;
            }

            // every required modifier must be held right now
            if !action.ha_modifiers.iter().all(|m| m.is_held(held)) {
                continue;
            }

            // the most recent key is at the back, so the sequence
            // has to line up with the end of the chord
            let tail = &self.hk_chord[self.hk_chord.len() - len..];
            if !tail
                .iter()
                .zip(action.ha_sequence.iter())
                .all(|(press, want)| press.kp_sym == *want)
            {
                continue;
            }

            // consume the keys, then run the handler
            let start = self.hk_chord.len() - len;
            self.hk_chord.truncate(start);
            log::debug!("Hotkey matched a {} key sequence", len);
            (action.ha_action)();
            fired = true;
            break;
        }

        // A prefix that can never match again is useless, keep the
        // buffer bounded by the longest registered sequence
        while self.hk_chord.len() > self.hk_max_len {
            self.hk_chord.remove(0);
        }

        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use xkbcommon::xkb::keysyms;

    fn counter_action(
        seq: Vec<xkb::Keysym>,
        mods: Vec<Modifier>,
    ) -> (HotkeyAction, Arc<AtomicU32>) {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let action = HotkeyAction::new(seq, mods, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (action, count)
    }

    fn super_held() -> HeldMods {
        HeldMods {
            hm_logo: true,
            ..Default::default()
        }
    }

    #[test]
    fn chords_fire_with_modifiers() {
        let mut hk = Hotkey::new();
        let (launch, launched) =
            counter_action(vec![keysyms::KEY_space], vec![Modifier::Logo]);
        let (logout, logged_out) = counter_action(
            vec![keysyms::KEY_e],
            vec![Modifier::Logo, Modifier::Shift],
        );
        hk.add(launch);
        hk.add(logout);

        // without super held, nothing fires
        assert!(!hk.feed(keysyms::KEY_space, &HeldMods::default()));
        assert_eq!(launched.load(Ordering::SeqCst), 0);

        // super+space launches
        assert!(hk.feed(keysyms::KEY_space, &super_held()));
        assert_eq!(launched.load(Ordering::SeqCst), 1);

        // super+shift+e logs out
        let mut both = super_held();
        both.hm_shift = true;
        assert!(hk.feed(keysyms::KEY_e, &both));
        assert_eq!(logged_out.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn longest_sequence_wins_and_is_consumed_once() {
        let mut hk = Hotkey::new();
        let (short, short_count) = counter_action(vec![keysyms::KEY_b], vec![]);
        let (long, long_count) = counter_action(vec![keysyms::KEY_a, keysyms::KEY_b], vec![]);
        hk.add(short);
        hk.add(long);

        let none = HeldMods::default();
        assert!(!hk.feed(keysyms::KEY_a, &none));
        assert!(hk.feed(keysyms::KEY_b, &none));

        // the two-key action beat the one-key action
        assert_eq!(long_count.load(Ordering::SeqCst), 1);
        assert_eq!(short_count.load(Ordering::SeqCst), 0);

        // and the suffix was consumed: another b matches the short
        // action rather than replaying the long one
        assert!(hk.feed(keysyms::KEY_b, &none));
        assert_eq!(short_count.load(Ordering::SeqCst), 1);
        assert_eq!(long_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn chord_is_bounded_by_longest_action() {
        let mut hk = Hotkey::new();
        let (act, _count) = counter_action(vec![keysyms::KEY_x, keysyms::KEY_y], vec![]);
        hk.add(act);

        let none = HeldMods::default();
        for _ in 0..64 {
            hk.feed(keysyms::KEY_q, &none);
        }
        assert!(hk.hk_chord.len() <= 2);
    }

    #[test]
    fn modifier_only_mismatch_leaves_chord_intact() {
        let mut hk = Hotkey::new();
        let (act, count) = counter_action(vec![keysyms::KEY_t], vec![Modifier::Ctrl]);
        hk.add(act);

        assert!(!hk.feed(keysyms::KEY_t, &HeldMods::default()));
        // the key is still in the chord; holding ctrl and feeding
        // t again fires on the new press
        let mut ctrl = HeldMods::default();
        ctrl.hm_ctrl = true;
        assert!(hk.feed(keysyms::KEY_t, &ctrl));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}

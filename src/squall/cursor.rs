// The cursor manager
//
// Tracks the pointer in workspace coordinates, owns which output
// the cursor lives on, warps across outputs through the adjacency
// graph, and paints itself on the topmost repaint layer.
//
// Austin Shafer - 2024
extern crate xcursor;

use crate::squall::cell::{Shared, WeakRef};
use crate::squall::input::event::MouseMove;
use crate::squall::output::{Direction, Output};
use crate::squall::render::PaintContext;
use crate::squall::signal::{SignalAction, SignalToken};
use crate::squall::ways::surface::Surface;
use utils::log;

/// The cursor always paints over everything else
pub const CURSOR_PAINT_LAYER: u64 = u64::MAX;

/// Software acceleration applied to relative motion
const MOUSE_ACCEL: f32 = 0.1;

/// A decoded xcursor image, RGBA
pub struct CursorImage {
    pub ci_width: u32,
    pub ci_height: u32,
    pub ci_xhot: u32,
    pub ci_yhot: u32,
    pub ci_pixels: Vec<u8>,
}

/// What the cursor is currently drawn with: a themed image, or a
/// surface a client gave us through wl_pointer.set_cursor
enum CursorTexture {
    Image(CursorImage),
    Surface(WeakRef<Surface>),
}

/// Scale a workspace position onto a new output and clamp it to
/// the edge it entered from
///
/// Crossing east enters at the new output's left edge, and so on
/// around the compass.
fn warp_position(
    pos: (f32, f32),
    old_size: (u32, u32),
    new_size: (u32, u32),
    dir: Direction,
) -> (f32, f32) {
    let mut warped = (
        pos.0 * new_size.0 as f32 / old_size.0 as f32,
        pos.1 * new_size.1 as f32 / old_size.1 as f32,
    );

    if dir.contains(Direction::NORTH) {
        warped.1 = new_size.1 as f32 - 1.0;
    }
    if dir.contains(Direction::EAST) {
        warped.0 = 0.0;
    }
    if dir.contains(Direction::SOUTH) {
        warped.1 = 0.0;
    }
    if dir.contains(Direction::WEST) {
        warped.0 = new_size.0 as f32 - 1.0;
    }

    warped
}

pub struct CursorManager {
    /// position in workspace coordinates
    cm_pos: (f32, f32),
    /// hotspot of a client-provided cursor surface, buffer local
    cm_hotspot: (i32, i32),
    /// the output the cursor is on
    cm_output: WeakRef<Output>,
    cm_texture: CursorTexture,
    /// Token for the `on_repaint` handler on the current output
    cm_paint_token: Option<SignalToken>,
}

impl CursorManager {
    pub fn new() -> Self {
        let mut cm = Self {
            cm_pos: (0.0, 0.0),
            cm_hotspot: (0, 0),
            cm_output: WeakRef::empty(),
            cm_texture: CursorTexture::Image(builtin_cursor()),
            cm_paint_token: None,
        };
        cm.xcursor(None);
        cm
    }

    pub fn position(&self) -> (f32, f32) {
        self.cm_pos
    }

    pub fn set_position(&mut self, pos: (f32, f32)) {
        self.cm_pos = pos;
    }

    pub fn current_output(&self) -> Option<Shared<Output>> {
        self.cm_output.upgrade()
    }

    /// Load a themed cursor image, i.e. `xcursor("grabbing")`
    ///
    /// A name of None resets back to the default arrow.
    pub fn xcursor(&mut self, name: Option<&str>) {
        let name = name.unwrap_or("left_ptr");
        match load_xcursor(name, "Adwaita", 32).or_else(|| load_xcursor("left_ptr", "default", 30))
        {
            Some(img) => self.cm_texture = CursorTexture::Image(img),
            None => log::error!("Could not load any xcursor image for {}", name),
        }
    }

    /// Use a client surface as the cursor
    ///
    /// None reverts to the themed image, which is what clients
    /// expect when they pass a null surface to set_cursor.
    pub fn set_cursor(&mut self, surface: Option<&Shared<Surface>>, hotspot: (i32, i32)) {
        match surface {
            Some(surf) => {
                self.cm_texture = CursorTexture::Surface(surf.downgrade());
                self.cm_hotspot = hotspot;
            }
            None => {
                self.cm_hotspot = (0, 0);
                self.xcursor(None);
            }
        }
    }

    /// Move the cursor onto `output`, reconnecting the paint
    /// listener. Does not touch the position.
    pub fn set_output(me: &Shared<CursorManager>, output: Option<&Shared<Output>>) {
        // Unhook from whatever we were painting on
        let (old_output, old_token) = {
            let mut cm = me.lock();
            (cm.cm_output.upgrade(), cm.cm_paint_token.take())
        };
        if let (Some(out), Some(tok)) = (old_output, old_token) {
            out.lock().disconnect_repaint(CURSOR_PAINT_LAYER, tok);
        }

        if let Some(out) = output {
            let cursor = me.clone();
            let tok = out.lock().connect_repaint(
                CURSOR_PAINT_LAYER,
                move |ctx: &mut PaintContext| cursor.lock().paint(ctx),
            );

            let mut cm = me.lock();
            cm.cm_output = out.downgrade();
            cm.cm_paint_token = Some(tok);
        } else {
            let mut cm = me.lock();
            cm.cm_output = WeakRef::empty();
        }
    }

    /// Draw the cursor on the output being repainted
    fn paint(&mut self, ctx: &mut PaintContext) -> SignalAction {
        let screen = ctx.workspace_to_screen(self.cm_pos);

        match &self.cm_texture {
            CursorTexture::Image(img) => ctx.pc_renderer.draw_cursor(img, screen),
            CursorTexture::Surface(weak) => {
                if let Some(surf) = weak.upgrade() {
                    ctx.pc_renderer.draw_surface(
                        &surf,
                        (
                            screen.0 - self.cm_hotspot.0 as f32,
                            screen.1 - self.cm_hotspot.1 as f32,
                        ),
                    );
                }
            }
        }

        SignalAction::Ok
    }

    /// Transfer the cursor onto an adjacent output, warping the
    /// position for the new resolution. Returns false when there
    /// is no output in that direction.
    fn transfer(me: &Shared<CursorManager>, current: &Shared<Output>, dir: Direction) -> bool {
        let adjacent = match Output::adjacent_of(current, dir) {
            Some(a) => a,
            None => return false,
        };

        let old_size = current.lock().size();
        let new_size = adjacent.lock().size();
        let warped = warp_position(me.lock().cm_pos, old_size, new_size, dir);

        Self::set_output(me, Some(&adjacent));
        me.lock().cm_pos = warped;
        true
    }

    /// The mouse moved
    ///
    /// Relative deltas are accelerated and added; absolute events
    /// are transformed against the active output's real
    /// dimensions. Afterwards the position is checked against the
    /// output rect and either transferred to a neighbor or
    /// clamped.
    pub fn on_mouse_move(me: &Shared<CursorManager>, ev: &mut MouseMove) {
        let output = match me.lock().cm_output.upgrade() {
            Some(o) => o,
            None => return,
        };
        let (rect, size) = {
            let out = output.lock();
            (out.rect(), out.size())
        };

        match ev {
            MouseMove::Relative { mm_dx, mm_dy } => {
                let mut cm = me.lock();
                cm.cm_pos.0 += *mm_dx as f32 * MOUSE_ACCEL;
                cm.cm_pos.1 += *mm_dy as f32 * MOUSE_ACCEL;
            }
            MouseMove::Absolute(abs) => {
                // The absolute extent is the device's, so libinput
                // scales it to the output size for us
                let sx = abs.absolute_x_transformed(size.0) as f32;
                let sy = abs.absolute_y_transformed(size.1) as f32;
                let ws = output.lock().screen_to_workspace((sx, sy));
                me.lock().cm_pos = ws;
            }
        }

        // Did we run off an edge of the output?
        let pos = me.lock().cm_pos;
        let max = (rect.r_pos.0 + rect.r_size.0, rect.r_pos.1 + rect.r_size.1);
        let mut dir = Direction::empty();
        if pos.0 > max.0 {
            dir |= Direction::EAST;
        }
        if pos.1 > max.1 {
            dir |= Direction::SOUTH;
        }
        if pos.0 < rect.r_pos.0 {
            dir |= Direction::WEST;
        }
        if pos.1 < rect.r_pos.1 {
            dir |= Direction::NORTH;
        }

        if !dir.is_empty() && !Self::transfer(me, &output, dir) {
            // No neighbor over there, stay inside the viewport
            let mut cm = me.lock();
            cm.cm_pos.0 = pos.0.max(rect.r_pos.0).min(max.0 - 1.0);
            cm.cm_pos.1 = pos.1.max(rect.r_pos.1).min(max.1 - 1.0);
        }
    }
}

/// Load a themed cursor image from disk
fn load_xcursor(name: &str, theme: &str, size: u32) -> Option<CursorImage> {
    let theme = xcursor::CursorTheme::load(theme);
    let path = theme.load_icon(name)?;
    let data = std::fs::read(path).ok()?;
    let images = xcursor::parser::parse_xcursor(&data)?;

    // take the image closest to our nominal size
    let img = images
        .iter()
        .min_by_key(|i| (i.size as i64 - size as i64).abs())?;

    Some(CursorImage {
        ci_width: img.width,
        ci_height: img.height,
        ci_xhot: img.xhot,
        ci_yhot: img.yhot,
        ci_pixels: img.pixels_rgba.clone(),
    })
}

/// A small opaque block used if no cursor theme exists on the
/// system, so the pointer is never invisible
fn builtin_cursor() -> CursorImage {
    const SIZE: u32 = 8;
    CursorImage {
        ci_width: SIZE,
        ci_height: SIZE,
        ci_xhot: 0,
        ci_yhot: 0,
        ci_pixels: vec![0xff; (SIZE * SIZE * 4) as usize],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::squall::kms::{Connector, Mode};

    fn fake_output(name: &str, w: u32, h: u32) -> Shared<Output> {
        let conn = Connector::fake(name, vec![Mode::new(w, h, 60)], vec![0x1]);
        let mode = conn.preferred_mode().unwrap();
        Shared::new(Output::new(conn, mode))
    }

    fn cursor_on(output: &Shared<Output>, pos: (f32, f32)) -> Shared<CursorManager> {
        let cm = Shared::new(CursorManager::new());
        CursorManager::set_output(&cm, Some(output));
        cm.lock().set_position(pos);
        cm
    }

    #[test]
    fn cross_output_warp_scales_and_clamps_to_entry_edge() {
        // O1 1920x1080 on the left, O2 1280x720 on the right
        let o1 = fake_output("HDMI-A-1", 1920, 1080);
        let o2 = fake_output("DP-1", 1280, 720);
        Output::set_adjacent(&o1, Direction::EAST, &o2);

        let cm = cursor_on(&o1, (1919.0, 540.0));
        // 21 units of raw delta = 2.1 after acceleration, enough
        // to leave the right edge
        CursorManager::on_mouse_move(
            &cm,
            &mut MouseMove::Relative {
                mm_dx: 21.0,
                mm_dy: 0.0,
            },
        );

        let pos = cm.lock().position();
        assert_eq!(pos.0, 0.0);
        assert_eq!(pos.1, 540.0 * 720.0 / 1080.0);
        // ownership moved to O2
        assert!(cm.lock().current_output().unwrap().ptr_eq(&o2));
    }

    #[test]
    fn no_neighbor_clamps_to_viewport() {
        let o1 = fake_output("HDMI-A-1", 1920, 1080);
        let cm = cursor_on(&o1, (5.0, 5.0));

        CursorManager::on_mouse_move(
            &cm,
            &mut MouseMove::Relative {
                mm_dx: -1000.0,
                mm_dy: -1000.0,
            },
        );

        let pos = cm.lock().position();
        assert_eq!(pos, (0.0, 0.0));
        // still on the same output
        assert!(cm.lock().current_output().unwrap().ptr_eq(&o1));
    }

    #[test]
    fn warp_math() {
        // crossing north enters at the bottom of the new output
        let p = warp_position((500.0, -1.0), (1000, 1000), (2000, 500), Direction::NORTH);
        assert_eq!(p, (1000.0, 499.0));

        let p = warp_position((10.0, 10.0), (100, 100), (100, 100), Direction::WEST);
        assert_eq!(p, (99.0, 10.0));
    }
}

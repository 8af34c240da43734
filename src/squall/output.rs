// Outputs and the output manager
//
// One output exists per connected connector. The manager plans
// CRTC assignments, installs a renderer on each output at
// mode-set time, and hands out adjacency so the cursor can warp
// between monitors.
//
// Austin Shafer - 2024
use crate::squall::cell::{Shared, WeakRef};
use crate::squall::kms::{Connector, EglScanout, Handle, Mode, ModeSetError};
use crate::squall::render::{FrameQueue, GlRenderer, PaintContext};
use crate::squall::signal::{Signal, SignalAction, SignalToken};
use crate::squall::ways::xdg_shell::XdgWindowList;
use utils::{log, region::Rect, Result};

use std::collections::{BTreeMap, HashMap};

bitflags! {
    /// A cardinal direction mask
    ///
    /// Diagonals are composed out of cardinals (NE = NORTH | EAST)
    /// and resolved by walking one cardinal at a time.
    pub struct Direction: u8 {
        const NORTH = 1 << 0;
        const EAST  = 1 << 1;
        const SOUTH = 1 << 2;
        const WEST  = 1 << 3;
    }
}

impl Direction {
    /// The adjacency slot for a single cardinal
    fn slot(&self) -> usize {
        match *self {
            Direction::NORTH => 0,
            Direction::EAST => 1,
            Direction::SOUTH => 2,
            Direction::WEST => 3,
            _ => panic!("slot() needs a single cardinal direction"),
        }
    }

    fn opposite(&self) -> Direction {
        match *self {
            Direction::NORTH => Direction::SOUTH,
            Direction::EAST => Direction::WEST,
            Direction::SOUTH => Direction::NORTH,
            Direction::WEST => Direction::EAST,
            _ => panic!("opposite() needs a single cardinal direction"),
        }
    }
}

/// Find the lowest CRTC index that is compatible with any of the
/// connector's encoders and not yet taken
///
/// `masks` has one entry per encoder: the bitmask of CRTC indices
/// that encoder can drive.
pub(crate) fn plan_crtc(taken: u32, masks: &[u32]) -> Option<usize> {
    for mask in masks.iter() {
        for i in 0..32 {
            let bit = 1u32 << i;
            if (mask & bit) == 0 {
                continue;
            }
            if (taken & bit) != 0 {
                continue;
            }
            return Some(i);
        }
    }
    None
}

/// Plans which CRTC will drive which connector
///
/// CRTCs are a limited per-GPU resource, so we record a bitmask of
/// taken indices and a plan keyed by connector name.
pub struct ModeSetAllocator {
    msa_handle: Handle,
    msa_taken: u32,
    msa_plan: HashMap<String, usize>,
}

impl ModeSetAllocator {
    pub fn new(handle: Handle) -> Self {
        Self {
            msa_handle: handle,
            msa_taken: 0,
            msa_plan: HashMap::new(),
        }
    }

    /// Claim a CRTC for this connector
    pub fn adopt(&mut self, conn: &Connector) {
        if self.msa_plan.contains_key(conn.name()) {
            return;
        }

        match plan_crtc(self.msa_taken, conn.crtc_masks()) {
            Some(i) => {
                self.msa_taken |= 1 << i;
                log::debug!("Planned CRTC {} for connector {}", i, conn.name());
                self.msa_plan.insert(conn.name().to_string(), i);
            }
            None => log::error!("No compatible CRTC for connector {}", conn.name()),
        }
    }

    /// Build a scanout surface on the planned CRTC and perform the
    /// mode set
    pub fn mode_set(
        &mut self,
        conn: &Connector,
        mode: &Mode,
    ) -> std::result::Result<EglScanout, ModeSetError> {
        let index = *self
            .msa_plan
            .get(conn.name())
            .ok_or(ModeSetError::NoCompatibleCrtc)?;

        let crtcs = self
            .msa_handle
            .crtcs()
            .map_err(|e| ModeSetError::KernelReject(io_other(e)))?;
        let crtc = crtcs[index];

        let scanout = EglScanout::new(
            self.msa_handle.clone(),
            conn.handle()
                .expect("Cannot mode set a synthetic connector"),
            crtc,
            *mode,
            EglScanout::DEFAULT_BACKBUFFERS,
        )
        .map_err(|e| ModeSetError::KernelReject(io_other(e)))?;

        scanout.mode_set()?;
        Ok(scanout)
    }
}

fn io_other(e: utils::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
}

// ---------------------------------------------------------------
// Per-output metadata
// ---------------------------------------------------------------

/// Data other subsystems hang off an output
///
/// Each consumer registers its own variant here instead of
/// stuffing type-erased values into a map.
pub enum Metadata {
    XdgWindows(XdgWindowList),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum MetaKind {
    XdgWindows,
}

impl Metadata {
    fn kind(&self) -> MetaKind {
        match self {
            Metadata::XdgWindows(_) => MetaKind::XdgWindows,
        }
    }
}

/// A store for `Metadata`, at most one entry per variant
pub struct MetadataStore {
    ms_entries: Vec<Metadata>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self {
            ms_entries: Vec::new(),
        }
    }

    /// Add an entry, replacing any existing entry of the same kind
    pub fn insert(&mut self, meta: Metadata) {
        self.ms_entries.retain(|m| m.kind() != meta.kind());
        self.ms_entries.push(meta);
    }

    pub fn xdg_windows(&mut self) -> Option<&mut XdgWindowList> {
        self.ms_entries.iter_mut().find_map(|m| match m {
            Metadata::XdgWindows(list) => Some(list),
        })
    }

    pub fn xdg_windows_ref(&self) -> Option<&XdgWindowList> {
        self.ms_entries.iter().find_map(|m| match m {
            Metadata::XdgWindows(list) => Some(list),
        })
    }
}

// ---------------------------------------------------------------
// Repaint signal
// ---------------------------------------------------------------

/// A repaint listener paints into the current frame through the
/// `PaintContext`
pub type RepaintListener =
    Box<dyn for<'a, 'b> FnMut(&'a mut PaintContext<'b>) -> SignalAction + Send>;

/// The repaint flavor of `Signal`
///
/// Same contract (token keyed, insertion order, Delete to
/// auto-unsubscribe), specialized so listeners can borrow the
/// in-progress frame.
pub struct RepaintSignal {
    rp_next: SignalToken,
    rp_listeners: BTreeMap<SignalToken, RepaintListener>,
}

impl RepaintSignal {
    pub fn new() -> Self {
        Self {
            rp_next: 0,
            rp_listeners: BTreeMap::new(),
        }
    }

    pub fn connect<F>(&mut self, cb: F) -> SignalToken
    where
        F: for<'a, 'b> FnMut(&'a mut PaintContext<'b>) -> SignalAction + Send + 'static,
    {
        let tok = self.rp_next;
        self.rp_next += 1;
        self.rp_listeners.insert(tok, Box::new(cb));
        tok
    }

    pub fn disconnect(&mut self, token: SignalToken) {
        self.rp_listeners.remove(&token);
    }

    pub fn emit(&mut self, ctx: &mut PaintContext) {
        let mut dead = Vec::new();
        for (tok, cb) in self.rp_listeners.iter_mut() {
            if cb(ctx) == SignalAction::Delete {
                dead.push(*tok);
            }
        }
        for tok in dead {
            self.rp_listeners.remove(&tok);
        }
    }
}

// ---------------------------------------------------------------
// Output
// ---------------------------------------------------------------

/// One connected display
///
/// Outputs are panned into a shared 2D workspace. Painting and
/// hit testing translate between that workspace and the output's
/// own screenspace.
pub struct Output {
    pub o_connector: Connector,
    o_mode: Mode,
    /// set by `OutputManager::configure`, takes effect at the next
    /// mode set
    o_pending_mode: Option<Mode>,
    o_renderer: Option<GlRenderer>,
    /// Workspace pan
    pub o_pan: (f32, f32),
    pub o_zoom: f32,
    /// N/E/S/W neighbors
    o_adjacent: [WeakRef<Output>; 4],
    /// repaint signals by layer, painted in ascending order
    o_repaint: BTreeMap<u64, RepaintSignal>,
    /// Generic per-output data store
    pub o_metadata: MetadataStore,
}

impl Output {
    pub fn new(connector: Connector, mode: Mode) -> Self {
        Self {
            o_connector: connector,
            o_mode: mode,
            o_pending_mode: None,
            o_renderer: None,
            o_pan: (0.0, 0.0),
            o_zoom: 1.0,
            o_adjacent: [
                WeakRef::empty(),
                WeakRef::empty(),
                WeakRef::empty(),
                WeakRef::empty(),
            ],
            o_repaint: BTreeMap::new(),
            o_metadata: MetadataStore::new(),
        }
    }

    pub fn mode(&self) -> &Mode {
        &self.o_mode
    }

    pub fn size(&self) -> (u32, u32) {
        (self.o_mode.width(), self.o_mode.height())
    }

    /// The workspace rectangle this output shows
    pub fn rect(&self) -> Rect<f32> {
        Rect::new(
            self.o_pan.0,
            self.o_pan.1,
            self.o_mode.width() as f32 / self.o_zoom,
            self.o_mode.height() as f32 / self.o_zoom,
        )
    }

    /// Would any part of this workspace rect land on screen?
    #[allow(dead_code)]
    pub fn is_visible(&self, area: &Rect<f32>) -> bool {
        self.rect().overlaps(area)
    }

    pub fn workspace_to_screen(&self, p: (f32, f32)) -> (f32, f32) {
        (
            (p.0 - self.o_pan.0) * self.o_zoom,
            (p.1 - self.o_pan.1) * self.o_zoom,
        )
    }

    pub fn screen_to_workspace(&self, p: (f32, f32)) -> (f32, f32) {
        (
            p.0 / self.o_zoom + self.o_pan.0,
            p.1 / self.o_zoom + self.o_pan.1,
        )
    }

    /// Link `other` as the neighbor of `me` in `dir`, and `me` as
    /// the opposite neighbor of `other`
    pub fn set_adjacent(me: &Shared<Output>, dir: Direction, other: &Shared<Output>) {
        me.lock().o_adjacent[dir.slot()] = other.downgrade();
        other.lock().o_adjacent[dir.opposite().slot()] = me.downgrade();
    }

    /// Get the output adjacent to `start`, walking composed
    /// directions one cardinal at a time
    ///
    /// Returns None if any step leaves the graph, or if the walk
    /// lands back on `start`.
    pub fn adjacent_of(start: &Shared<Output>, direction: Direction) -> Option<Shared<Output>> {
        let mut cur = start.clone();
        let mut dir = direction;

        while !dir.is_empty() {
            let card = [
                Direction::NORTH,
                Direction::EAST,
                Direction::SOUTH,
                Direction::WEST,
            ]
            .iter()
            .copied()
            .find(|c| dir.contains(*c))
            .unwrap();
            dir.remove(card);

            let next = cur.lock().o_adjacent[card.slot()].upgrade();
            match next {
                Some(n) => cur = n,
                None => return None,
            }
        }

        if cur.ptr_eq(start) {
            return None;
        }
        Some(cur)
    }

    /// Install the renderer for this output. Done by the manager
    /// once the mode set has succeeded.
    pub fn set_renderer(&mut self, renderer: GlRenderer) {
        self.o_renderer = Some(renderer);
    }

    #[allow(dead_code)]
    pub fn has_renderer(&self) -> bool {
        self.o_renderer.is_some()
    }

    /// Attach a repaint listener at `layer`. Layers paint in
    /// ascending order, so the topmost content uses the largest
    /// layer value.
    pub fn connect_repaint<F>(&mut self, layer: u64, cb: F) -> SignalToken
    where
        F: for<'a, 'b> FnMut(&'a mut PaintContext<'b>) -> SignalAction + Send + 'static,
    {
        self.o_repaint
            .entry(layer)
            .or_insert_with(RepaintSignal::new)
            .connect(cb)
    }

    pub fn disconnect_repaint(&mut self, layer: u64, token: SignalToken) {
        if let Some(sig) = self.o_repaint.get_mut(&layer) {
            sig.disconnect(token);
        }
    }

    /// Draw one frame: bind, clear, run the repaint layers in
    /// ascending order, then commit (which blocks on the page
    /// flip)
    pub fn repaint(&mut self) -> Result<()> {
        let Output {
            o_renderer,
            o_repaint,
            o_metadata,
            o_pan,
            o_zoom,
            o_mode,
            ..
        } = self;

        let renderer = match o_renderer {
            Some(r) => r,
            // Not mode-set yet, nothing to do
            None => return Ok(()),
        };

        renderer.bind()?;
        renderer.clear(0.08, 0.08, 0.10, 1.0);

        let mut ctx = PaintContext {
            pc_renderer: renderer,
            pc_meta: o_metadata,
            pc_pan: *o_pan,
            pc_zoom: *o_zoom,
            pc_size: (o_mode.width(), o_mode.height()),
        };
        for (_layer, sig) in o_repaint.iter_mut() {
            sig.emit(&mut ctx);
        }
        drop(ctx);

        renderer.commit()
    }
}

// ---------------------------------------------------------------
// OutputManager
// ---------------------------------------------------------------

/// Owns all outputs and the CRTC plan
pub struct OutputManager {
    om_handle: Handle,
    om_allocator: ModeSetAllocator,
    om_outputs: Vec<Shared<Output>>,
    /// Emitted once per output by `announce`. The payload carries
    /// the output so listeners never need to lock the manager.
    pub om_on_output_new: Signal<Shared<Output>>,
    /// Emitted once after `mode_set` finishes, carrying all
    /// outputs.
    pub om_on_mode_set: Signal<Vec<Shared<Output>>>,
}

impl OutputManager {
    /// Construct one output per connected connector and plan a
    /// CRTC for each
    pub fn new(handle: Handle) -> Result<Self> {
        let mut allocator = ModeSetAllocator::new(handle.clone());
        let mut outputs = Vec::new();

        for conn in handle.connectors()? {
            if !conn.connected() {
                continue;
            }

            allocator.adopt(&conn);
            let mode = conn
                .preferred_mode()
                .ok_or_else(|| utils::anyhow!("Connector {} has no modes", conn.name()))?;
            log::error!(
                "Found output {}: {}x{} @ {} Hz",
                conn.name(),
                mode.width(),
                mode.height(),
                mode.refresh()
            );
            outputs.push(Shared::new(Output::new(conn, mode)));
        }

        Ok(Self {
            om_handle: handle,
            om_allocator: allocator,
            om_outputs: outputs,
            om_on_output_new: Signal::new(),
            om_on_mode_set: Signal::new(),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.om_handle
    }

    pub fn outputs(&self) -> &Vec<Shared<Output>> {
        &self.om_outputs
    }

    /// Linear search by exact connector name, i.e. `"HDMI-A-1"`
    #[allow(dead_code)]
    pub fn by_name(&self, connector_name: &str) -> Option<Shared<Output>> {
        self.om_outputs
            .iter()
            .find(|o| o.lock().o_connector.name() == connector_name)
            .cloned()
    }

    /// Update the pending mode for an output; takes effect at the
    /// next mode set
    #[allow(dead_code)]
    pub fn configure(&mut self, output: &Shared<Output>, mode: Mode) {
        output.lock().o_pending_mode = Some(mode);
    }

    /// Let listeners know about every output we found at init
    pub fn announce(&mut self) {
        let outputs = self.om_outputs.clone();
        for o in outputs {
            self.om_on_output_new.emit(&mut o.clone());
        }
    }

    /// Mode set every output and install its renderer
    pub fn mode_set(&mut self, frames: &FrameQueue) -> Result<()> {
        for output in self.om_outputs.iter() {
            let mut out = output.lock();

            if let Some(pending) = out.o_pending_mode.take() {
                out.o_mode = pending;
            }
            let mode = out.o_mode;

            log::error!(
                "Mode setting {} to {}x{} @ {}",
                out.o_connector.name(),
                mode.width(),
                mode.height(),
                mode.refresh()
            );
            let scanout = self.om_allocator.mode_set(&out.o_connector, &mode)?;
            let renderer = GlRenderer::new(scanout, frames.clone())?;
            out.set_renderer(renderer);
        }

        let mut outputs = self.om_outputs.clone();
        self.om_on_mode_set.emit(&mut outputs);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_output(name: &str, w: u32, h: u32) -> Shared<Output> {
        let conn = Connector::fake(name, vec![Mode::new(w, h, 60)], vec![0x1]);
        let mode = conn.preferred_mode().unwrap();
        Shared::new(Output::new(conn, mode))
    }

    #[test]
    fn crtc_plan_takes_lowest_free_index() {
        // encoder can drive crtcs 0 and 1
        assert_eq!(plan_crtc(0x0, &[0b11]), Some(0));
        // 0 is taken, fall through to 1
        assert_eq!(plan_crtc(0b01, &[0b11]), Some(1));
        // all compatible crtcs taken
        assert_eq!(plan_crtc(0b11, &[0b11]), None);
        // second encoder saves the day
        assert_eq!(plan_crtc(0b01, &[0b01, 0b100]), Some(2));
        assert_eq!(plan_crtc(0x0, &[]), None);
    }

    #[test]
    fn adjacency_walks_cardinals() {
        let left = fake_output("HDMI-A-1", 1920, 1080);
        let right = fake_output("DP-1", 1280, 720);
        Output::set_adjacent(&left, Direction::EAST, &right);

        let found = Output::adjacent_of(&left, Direction::EAST).unwrap();
        assert!(found.ptr_eq(&right));
        // reverse link was installed too
        let back = Output::adjacent_of(&right, Direction::WEST).unwrap();
        assert!(back.ptr_eq(&left));

        assert!(Output::adjacent_of(&left, Direction::NORTH).is_none());
        // walking east then west lands back on the start, which
        // does not count as an adjacent output
        assert!(Output::adjacent_of(&left, Direction::EAST | Direction::WEST).is_none());
    }

    #[test]
    fn composed_direction_walk() {
        // a 2x2 grid: a b / c d, looking up the diagonal
        let a = fake_output("DP-1", 800, 600);
        let b = fake_output("DP-2", 800, 600);
        let c = fake_output("DP-3", 800, 600);
        let d = fake_output("DP-4", 800, 600);
        Output::set_adjacent(&a, Direction::EAST, &b);
        Output::set_adjacent(&c, Direction::EAST, &d);
        Output::set_adjacent(&a, Direction::SOUTH, &c);
        Output::set_adjacent(&b, Direction::SOUTH, &d);

        let diag = Output::adjacent_of(&a, Direction::SOUTH | Direction::EAST).unwrap();
        assert!(diag.ptr_eq(&d));
    }

    #[test]
    fn workspace_transforms_respect_pan() {
        let out = fake_output("eDP-1", 1920, 1080);
        out.lock().o_pan = (100.0, 50.0);

        let screen = out.lock().workspace_to_screen((150.0, 60.0));
        assert_eq!(screen, (50.0, 10.0));
        let ws = out.lock().screen_to_workspace(screen);
        assert_eq!(ws, (150.0, 60.0));
    }

    #[test]
    fn metadata_one_entry_per_kind() {
        let mut store = MetadataStore::new();
        assert!(store.xdg_windows().is_none());

        store.insert(Metadata::XdgWindows(Vec::new()));
        assert_eq!(store.xdg_windows().unwrap().len(), 0);

        // reinsertion replaces rather than duplicates
        store.insert(Metadata::XdgWindows(Vec::new()));
        assert_eq!(store.ms_entries.len(), 1);
    }
}

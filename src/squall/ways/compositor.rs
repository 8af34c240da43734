// Wayland compositor singleton
//
// This is the "top" of the wayland hierarchy: it owns the
// display, the listening socket, the shared subsystem state, and
// the event loop that drives dispatch, input, and rendering.
//
// Austin Shafer - 2024
extern crate wayland_protocols;
extern crate wayland_server as ws;

use ws::protocol::{
    wl_compositor as wlci, wl_data_device_manager as wlddm, wl_output, wl_seat, wl_shm,
    wl_subcompositor as wlsc,
};

use wayland_protocols::wp::linux_dmabuf::zv1::server::zwp_linux_dmabuf_v1 as zldv1;
use wayland_protocols::xdg::shell::server::xdg_wm_base;

use super::seat::SeatManager;
use super::surface::Surface;
use super::wl_output::OutputGlobal;
use super::wl_region;
use super::xdg_shell::XdgShell;
use crate::squall::cell::Shared;
use crate::squall::cursor::CursorManager;
use crate::squall::hotkey::{Hotkey, HotkeyAction, Modifier};
use crate::squall::input::event::{ButtonState, KeyboardInput, MouseButton, MouseScroll};
use crate::squall::input::InputManager;
use crate::squall::kms;
use crate::squall::output::{Direction, Output, OutputManager};
use crate::squall::render::{new_frame_queue, FrameQueue};
use crate::squall::signal::SignalAction;
use utils::{anyhow, log, timing::get_current_millis, timing::TimingManager, Context, Result};
use xkbcommon::xkb::keysyms;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The shared state every protocol dispatch sees
///
/// This is the singleton of the wayland subsystem. It holds
/// handles to all of the high level subsystem state, which the
/// protocol objects update as requests come in.
#[allow(dead_code)]
pub struct Tempest {
    pub t_dh: ws::DisplayHandle,
    /// The input subsystem
    pub t_input: Shared<InputManager>,
    pub t_outputs: Shared<OutputManager>,
    pub t_cursor: Shared<CursorManager>,
    pub t_shell: Shared<XdgShell>,
    pub t_seat: Shared<SeatManager>,
    pub t_hotkeys: Shared<Hotkey>,
    /// frame callbacks waiting for the post-flip flush
    pub t_frames: FrameQueue,
    t_next_surface_id: u32,
    /// cleared to shut the compositor down
    t_running: Arc<AtomicBool>,
}

impl Tempest {
    fn next_surface_id(&mut self) -> u32 {
        let id = self.t_next_surface_id;
        self.t_next_surface_id += 1;
        id
    }
}

#[allow(unused_variables)]
impl ws::GlobalDispatch<wlci::WlCompositor, ()> for Tempest {
    fn bind(
        state: &mut Self,
        handle: &ws::DisplayHandle,
        client: &ws::Client,
        resource: ws::New<wlci::WlCompositor>,
        global_data: &(),
        data_init: &mut ws::DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

#[allow(unused_variables)]
impl ws::Dispatch<wlci::WlCompositor, ()> for Tempest {
    fn request(
        state: &mut Self,
        client: &ws::Client,
        resource: &wlci::WlCompositor,
        request: wlci::Request,
        data: &(),
        dhandle: &ws::DisplayHandle,
        data_init: &mut ws::DataInit<'_, Self>,
    ) {
        match request {
            wlci::Request::CreateSurface { id } => {
                let sid = state.next_surface_id();
                log::debug!("Creating new surface {}", sid);

                // Create a reference counted cell in charge of
                // this new surface. The resource handle lands in
                // the cell right after the library mints it.
                let cell = Shared::new(Surface::new(sid, client.id()));
                let wl_surf = data_init.init(id, cell.clone());
                cell.lock().set_resource(wl_surf);
            }
            wlci::Request::CreateRegion { id } => wl_region::register_new(id, data_init),
            _ => (),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: ws::backend::ClientId,
        _resource: &wlci::WlCompositor,
        data: &(),
    ) {
    }
}

/// Per-client data for the backend. We have nothing to track, the
/// seat records key off the ClientId instead.
struct ClientState;

impl ws::backend::ClientData for ClientState {
    fn initialized(&self, _client_id: ws::backend::ClientId) {}

    fn disconnected(
        &self,
        client_id: ws::backend::ClientId,
        _reason: ws::backend::DisconnectReason,
    ) {
        // Resource destructors run for everything the client
        // owned; the focus WeakRefs fail to upgrade from here on
        log::debug!("Client {:?} disconnected", client_id);
    }
}

/// The event manager
///
/// This is the launching point of the compositor. It dispatches
/// client requests, polls input, and drives the per-output render
/// loop, whose page flips pace the whole system.
pub struct EventManager {
    em_display: ws::Display<Tempest>,
    em_socket: ws::ListeningSocket,
    em_tempest: Tempest,
}

impl EventManager {
    /// Bring up the whole compositor
    ///
    /// Initialization order matters: input first, then the output
    /// manager, then the subsystems that subscribe to output
    /// events, then the globals, and the mode set last.
    pub fn new() -> Result<Box<EventManager>> {
        // Open the first DRM card on the system
        let cards = kms::cards()?;
        let card = cards
            .first()
            .ok_or_else(|| anyhow!("No DRM cards found in /dev/dri"))?;
        let handle = card.open()?;

        let seat_name = std::env::var("XDG_SEAT").unwrap_or_else(|_| "seat0".to_string());
        let input = Shared::new(
            InputManager::new(&seat_name).context("Failed to start the input subsystem")?,
        );

        let outputs = Shared::new(OutputManager::new(handle)?);
        if outputs.lock().outputs().is_empty() {
            return Err(anyhow!("No connected displays were found"));
        }

        // Without a configured layout, chain the outputs
        // west-to-east in connector order. The config layer would
        // normally drive Output::set_adjacent itself.
        {
            let om = outputs.lock();
            for pair in om.outputs().windows(2) {
                Output::set_adjacent(&pair[0], Direction::EAST, &pair[1]);
            }
        }

        let frames = new_frame_queue();
        let cursor = Shared::new(CursorManager::new());
        let shell = Shared::new(XdgShell::new());
        let seat = Shared::new(SeatManager::new());
        let hotkeys = Shared::new(Hotkey::new());
        let running = Arc::new(AtomicBool::new(true));

        // The shell wants a window list on every output, and the
        // cursor starts life on the first output once it has a
        // renderer. Note the one-shot Delete on the mode set
        // listener.
        {
            let mut om = outputs.lock();

            let shell_clone = shell.clone();
            om.om_on_output_new.connect(move |out: &mut Shared<Output>| {
                shell_clone.lock().on_output_new(out);
                SignalAction::Ok
            });

            let cursor_clone = cursor.clone();
            om.om_on_mode_set
                .connect(move |outs: &mut Vec<Shared<Output>>| {
                    if let Some(first) = outs.first() {
                        CursorManager::set_output(&cursor_clone, Some(first));
                    }
                    SignalAction::Delete
                });
        }
        outputs.lock().announce();

        let display =
            ws::Display::<Tempest>::new().context("Failed to create the wayland display")?;
        let socket = ws::ListeningSocket::bind_auto("wayland", 0..32)
            .context("Failed to add a socket to the wayland server")?;
        log::error!("Listening on wayland socket {:?}", socket.socket_name());

        let tempest = Tempest {
            t_dh: display.handle(),
            t_input: input,
            t_outputs: outputs,
            t_cursor: cursor,
            t_shell: shell,
            t_seat: seat,
            t_hotkeys: hotkeys,
            t_frames: frames,
            t_next_surface_id: 1,
            t_running: running,
        };

        // Register our global interfaces that
        // will be advertised to all clients
        let dh = display.handle();
        dh.create_global::<Tempest, wlci::WlCompositor, ()>(6, ());
        dh.create_global::<Tempest, wlsc::WlSubcompositor, ()>(1, ());
        dh.create_global::<Tempest, wl_shm::WlShm, ()>(2, ());
        dh.create_global::<Tempest, wl_seat::WlSeat, ()>(9, ());
        dh.create_global::<Tempest, wlddm::WlDataDeviceManager, ()>(3, ());
        dh.create_global::<Tempest, xdg_wm_base::XdgWmBase, ()>(1, ());
        dh.create_global::<Tempest, zldv1::ZwpLinuxDmabufV1, ()>(5, ());
        // one wl_output global per connector
        for i in 0..tempest.t_outputs.lock().outputs().len() {
            dh.create_global::<Tempest, wl_output::WlOutput, OutputGlobal>(
                4,
                OutputGlobal { og_index: i },
            );
        }

        let mut evman = Box::new(EventManager {
            em_display: display,
            em_socket: socket,
            em_tempest: tempest,
        });

        evman.wire_input();

        // Light up the displays. This installs a renderer on each
        // output and fires on_mode_set.
        evman
            .em_tempest
            .t_outputs
            .lock()
            .mode_set(&evman.em_tempest.t_frames)?;

        Ok(evman)
    }

    /// Subscribe the cursor, focus router, and hotkey table to the
    /// input signals
    ///
    /// Order matters: the cursor listener runs first so the router
    /// always sees the post-motion position.
    fn wire_input(&mut self) {
        let cursor = self.em_tempest.t_cursor.clone();
        let seat = self.em_tempest.t_seat.clone();
        let shell = self.em_tempest.t_shell.clone();
        let hotkeys = self.em_tempest.t_hotkeys.clone();
        let running = self.em_tempest.t_running.clone();

        let mut input = self.em_tempest.t_input.lock();

        // cursor movement and edge transfer
        let c = cursor.clone();
        input.i_on_mouse_move.connect(move |ev| {
            CursorManager::on_mouse_move(&c, ev);
            SignalAction::Ok
        });

        // pointer focus follows the cursor
        let c = cursor.clone();
        let s = seat.clone();
        let sh = shell.clone();
        input.i_on_mouse_move.connect(move |_ev| {
            let pos = c.lock().position();
            let output = c.lock().current_output();
            let hit = match output {
                Some(out) => sh.lock().by_position(&out, pos),
                None => None,
            };
            let surf = hit.and_then(|w| w.lock().ss_surface.upgrade());

            let mut sm = s.lock();
            sm.set_pointer_focus(surf.as_ref(), pos);
            sm.pointer_motion(pos);
            SignalAction::Ok
        });

        // clicking a background window brings it into focus
        // before the button event is delivered
        let c = cursor.clone();
        let s = seat.clone();
        let sh = shell.clone();
        input.i_on_mouse_click.connect(move |ev: &mut MouseButton| {
            if ev.mb_state == ButtonState::Pressed {
                let pos = c.lock().position();
                if let Some(out) = c.lock().current_output() {
                    let hit = sh.lock().by_position(&out, pos);
                    if let Some(win) = hit {
                        {
                            let mut shell = sh.lock();
                            shell.raise_to_top(&win, None);
                            shell.activate(&win);
                        }
                        let surf = win.lock().ss_surface.upgrade();
                        if let Some(surf) = surf {
                            s.lock().set_keyboard_focus(Some(&surf));
                        }
                    }
                }
            }
            s.lock().pointer_button(ev.mb_button, ev.mb_state);
            SignalAction::Ok
        });

        let s = seat.clone();
        input.i_on_mouse_scroll.connect(move |ev: &mut MouseScroll| {
            s.lock().pointer_axis(ev.ms_horizontal, ev.ms_vertical);
            SignalAction::Ok
        });

        // keys go through the hotkey table before the client
        let s = seat.clone();
        let hk = hotkeys.clone();
        input
            .i_on_keyboard_input
            .connect(move |ev: &mut KeyboardInput| {
                if ev.ki_state == ButtonState::Pressed
                    && hk.lock().feed(ev.ki_keysym, &ev.ki_held)
                {
                    // the chord consumed this key
                    return SignalAction::Ok;
                }
                s.lock().keyboard_key(ev.ki_scancode, ev.ki_state, ev.ki_mods);
                SignalAction::Ok
            });

        drop(input);

        // the one binding we always install: Super+Escape leaves
        // the session
        hotkeys.lock().add(HotkeyAction::new(
            vec![keysyms::KEY_Escape],
            vec![Modifier::Logo],
            move || {
                log::error!("Super+Escape pressed, shutting down");
                running.store(false, Ordering::Relaxed);
            },
        ));
    }

    /// Emit the frame callbacks and buffer releases scheduled by
    /// the renderer
    ///
    /// This runs after `commit` has returned, which means the
    /// frame holding those surfaces has already been flipped onto
    /// the plane: `done` never fires before its content was
    /// visible, and `release` always follows `done`.
    fn flush_frames(&mut self) {
        let mut records = {
            let mut queue = self.em_tempest.t_frames.lock().unwrap();
            std::mem::take(&mut *queue)
        };
        if records.is_empty() {
            return;
        }

        let time = get_current_millis();
        for record in records.drain(..) {
            if let Some(cb) = record.fr_callback {
                // done is a destructor event, the callback
                // resource dies with it
                cb.done(time);
            }
            for buf in record.fr_releases {
                buf.release();
            }
        }

        self.em_display.flush_clients().ok();
    }

    /// Each subsystem has a function that implements its main
    /// loop. This is that function
    pub fn worker_thread(&mut self) {
        // Aim for roughly one pass per 60fps frame; the page flip
        // in repaint is what actually paces us, this budget just
        // bounds the input poll.
        let mut tm = TimingManager::new(15);

        while self.em_tempest.t_running.load(Ordering::Relaxed) {
            tm.reset();

            // First flush the callbacks from the frame that just
            // hit the screen
            self.flush_frames();

            // Accept anyone new on the socket
            match self.em_socket.accept() {
                Ok(Some(stream)) => {
                    if let Err(e) = self
                        .em_display
                        .handle()
                        .insert_client(stream, Arc::new(ClientState))
                    {
                        log::error!("Failed to add client: {}", e);
                    }
                }
                Ok(None) => (),
                Err(e) => log::error!("Error accepting a client: {}", e),
            }

            // Non-blocking client dispatch
            if let Err(e) = self.em_display.dispatch_clients(&mut self.em_tempest) {
                log::error!("Error dispatching clients: {}", e);
            }
            self.em_display.flush_clients().ok();

            // Give input whatever frame budget is left
            let budget = tm.time_remaining().max(1) as i32;
            self.em_tempest.t_input.lock().poll(budget);

            // Draw every output. commit() inside blocks until the
            // page flip lands, which is our frame cadence.
            let outputs = self.em_tempest.t_outputs.lock().outputs().clone();
            for output in outputs.iter() {
                if let Err(e) = output.lock().repaint() {
                    log::error!("Failed to repaint output: {}", e);
                }
            }

            self.em_display.flush_clients().ok();
        }
    }
}

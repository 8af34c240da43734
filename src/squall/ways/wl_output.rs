// Implementation of the wl_output interface
//
// wl_output advertises what (physical) displays are available
// for clients to present surfaces on. One global is registered
// per connector, carrying the index of the output it describes.
//
// Austin Shafer - 2024
extern crate wayland_server as ws;

use crate::squall::Tempest;
use ws::protocol::wl_output;
use ws::protocol::wl_output::{Mode, Subpixel, Transform};
use ws::Resource;

/// Global data identifying which output a wl_output global is
/// advertising
#[derive(Debug, Copy, Clone)]
pub struct OutputGlobal {
    pub og_index: usize,
}

#[allow(unused_variables)]
impl ws::GlobalDispatch<wl_output::WlOutput, OutputGlobal> for Tempest {
    fn bind(
        state: &mut Self,
        handle: &ws::DisplayHandle,
        client: &ws::Client,
        resource: ws::New<wl_output::WlOutput>,
        global_data: &OutputGlobal,
        data_init: &mut ws::DataInit<'_, Self>,
    ) {
        let out = data_init.init(resource, ());

        let outputs = state.t_outputs.lock();
        let output = match outputs.outputs().get(global_data.og_index) {
            Some(o) => o.lock(),
            None => return,
        };
        let mode = *output.mode();

        // send the display configuration
        out.geometry(
            0,
            0,
            0,
            0,
            Subpixel::Unknown,
            "Virtual".to_string(),
            "Monitor".to_string(),
            Transform::Normal,
        );

        out.mode(
            Mode::Preferred,
            mode.width() as i32,
            mode.height() as i32,
            mode.refresh_millihz(),
        );

        if out.version() >= 4 {
            out.name(output.o_connector.name().to_string());
        }

        // let the client know we are done with the monitor config
        if out.version() >= 2 {
            out.done();
        }
    }
}

#[allow(unused_variables)]
impl ws::Dispatch<wl_output::WlOutput, ()> for Tempest {
    fn request(
        state: &mut Self,
        client: &ws::Client,
        resource: &wl_output::WlOutput,
        request: wl_output::Request,
        data: &(),
        dhandle: &ws::DisplayHandle,
        data_init: &mut ws::DataInit<'_, Self>,
    ) {
    }

    fn destroyed(
        state: &mut Self,
        _client: ws::backend::ClientId,
        _resource: &wl_output::WlOutput,
        data: &(),
    ) {
    }
}

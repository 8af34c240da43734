// Implementation of the wl_keyboard interface
//
// Keyboards only receive events; the keymap is shipped when the
// resource is created over in seat.rs.
//
// Austin Shafer - 2024
extern crate wayland_server as ws;
use crate::squall::Tempest;
use ws::protocol::wl_keyboard;

// Dispatch<Interface, Userdata>
#[allow(unused_variables)]
impl ws::Dispatch<wl_keyboard::WlKeyboard, ()> for Tempest {
    fn request(
        state: &mut Self,
        client: &ws::Client,
        resource: &wl_keyboard::WlKeyboard,
        request: wl_keyboard::Request,
        data: &(),
        dhandle: &ws::DisplayHandle,
        data_init: &mut ws::DataInit<'_, Self>,
    ) {
    }

    fn destroyed(
        state: &mut Self,
        client: ws::backend::ClientId,
        _resource: &wl_keyboard::WlKeyboard,
        data: &(),
    ) {
        if let Some(record) = state.t_seat.lock().sm_seats.get_mut(&client) {
            record.sr_keyboard = None;
        }
    }
}

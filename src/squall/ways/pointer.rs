// Implementation of the wl_pointer interface
//
// Austin Shafer - 2024
extern crate wayland_server as ws;
use super::role::Role;
use super::surface::Surface;
use crate::squall::cell::Shared;
use crate::squall::Tempest;
use utils::log;
use ws::protocol::wl_pointer;
use ws::Resource;

// Dispatch<Interface, Userdata>
#[allow(unused_variables)]
impl ws::Dispatch<wl_pointer::WlPointer, ()> for Tempest {
    fn request(
        state: &mut Self,
        client: &ws::Client,
        resource: &wl_pointer::WlPointer,
        request: wl_pointer::Request,
        data: &(),
        dhandle: &ws::DisplayHandle,
        data_init: &mut ws::DataInit<'_, Self>,
    ) {
        match request {
            wl_pointer::Request::SetCursor {
                surface,
                hotspot_x,
                hotspot_y,
                ..
            } => {
                match surface {
                    Some(surface) => {
                        let surf = surface.data::<Shared<Surface>>().unwrap().clone();

                        // It is a protocol error to have another
                        // role assigned at this time
                        let has_other_role = match surf.lock().s_role {
                            None | Some(Role::cursor) => false,
                            _ => true,
                        };
                        if has_other_role {
                            resource.post_error(
                                wl_pointer::Error::Role,
                                "Surface is already assigned a non-cursor role",
                            );
                            return;
                        }
                        surf.lock().s_role = Some(Role::cursor);

                        log::debug!("Setting cursor hotspot to {:?}", (hotspot_x, hotspot_y));
                        state
                            .t_cursor
                            .lock()
                            .set_cursor(Some(&surf), (hotspot_x, hotspot_y));
                    }
                    None => state.t_cursor.lock().set_cursor(None, (0, 0)),
                }
            }
            wl_pointer::Request::Release => (),
            _ => (),
        }
    }

    fn destroyed(
        state: &mut Self,
        client: ws::backend::ClientId,
        _resource: &wl_pointer::WlPointer,
        data: &(),
    ) {
        if let Some(record) = state.t_seat.lock().sm_seats.get_mut(&client) {
            record.sr_pointer = None;
        }
    }
}

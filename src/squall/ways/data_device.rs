// Implementations of inter-app data transfer operations, aka
// copy/paste and drag/drop
//
// Only the object plumbing exists: clients can create their
// sources and devices, but no selection is ever transferred.
//
// Austin Shafer - 2024
extern crate wayland_server as ws;
use ws::protocol::{
    wl_data_device as wlddv, wl_data_device_manager as wlddm, wl_data_source as wlds,
};

use crate::squall::Tempest;

#[allow(unused_variables)]
impl ws::GlobalDispatch<wlddm::WlDataDeviceManager, ()> for Tempest {
    fn bind(
        state: &mut Self,
        handle: &ws::DisplayHandle,
        client: &ws::Client,
        resource: ws::New<wlddm::WlDataDeviceManager>,
        global_data: &(),
        data_init: &mut ws::DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

// Dispatch<Interface, Userdata>
#[allow(unused_variables)]
impl ws::Dispatch<wlddm::WlDataDeviceManager, ()> for Tempest {
    fn request(
        state: &mut Self,
        client: &ws::Client,
        resource: &wlddm::WlDataDeviceManager,
        request: wlddm::Request,
        data: &(),
        dhandle: &ws::DisplayHandle,
        data_init: &mut ws::DataInit<'_, Self>,
    ) {
        match request {
            wlddm::Request::CreateDataSource { id } => {
                data_init.init(id, ());
            }
            wlddm::Request::GetDataDevice { id, seat: _ } => {
                data_init.init(id, ());
            }
            _ => (),
        };
    }

    fn destroyed(
        state: &mut Self,
        _client: ws::backend::ClientId,
        _resource: &wlddm::WlDataDeviceManager,
        data: &(),
    ) {
    }
}

#[allow(unused_variables)]
impl ws::Dispatch<wlddv::WlDataDevice, ()> for Tempest {
    fn request(
        state: &mut Self,
        client: &ws::Client,
        resource: &wlddv::WlDataDevice,
        request: wlddv::Request,
        data: &(),
        dhandle: &ws::DisplayHandle,
        data_init: &mut ws::DataInit<'_, Self>,
    ) {
        // clipboard mechanics are out of scope
    }

    fn destroyed(
        state: &mut Self,
        _client: ws::backend::ClientId,
        _resource: &wlddv::WlDataDevice,
        data: &(),
    ) {
    }
}

#[allow(unused_variables)]
impl ws::Dispatch<wlds::WlDataSource, ()> for Tempest {
    fn request(
        state: &mut Self,
        client: &ws::Client,
        resource: &wlds::WlDataSource,
        request: wlds::Request,
        data: &(),
        dhandle: &ws::DisplayHandle,
        data_init: &mut ws::DataInit<'_, Self>,
    ) {
    }

    fn destroyed(
        state: &mut Self,
        _client: ws::backend::ClientId,
        _resource: &wlds::WlDataSource,
        data: &(),
    ) {
    }
}

// Implementation of the linux_dmabuf interfaces
//
// We advertise dmabuf feedback (main device, format table,
// tranches) so clients know what they could allocate, but the
// actual import path is not wired up: buffer params answer
// `failed`. GPU buffer import needs a GBM import path that does
// not exist here.
//
// Austin Shafer - 2024
extern crate nix;
extern crate wayland_protocols;
extern crate wayland_server as ws;

use crate::squall::Tempest;
use utils::log;
use ws::Resource;

use wayland_protocols::wp::linux_dmabuf::zv1::server::{
    zwp_linux_buffer_params_v1 as zlbpv1, zwp_linux_dmabuf_feedback_v1 as zldfv1,
    zwp_linux_dmabuf_v1 as zldv1,
};

use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::unistd::close;
use std::ffi::CString;
use std::fs::File;
use std::io::Write;
use std::os::unix::io::{AsFd, FromRawFd, IntoRawFd, RawFd};
use std::sync::{Arc, Mutex};

// drm fourcc codes for the formats we can actually texture from
const DRM_FORMAT_ARGB8888: u32 = 0x34325241;
const DRM_FORMAT_XRGB8888: u32 = 0x34325258;
const DRM_FORMAT_MOD_LINEAR: u64 = 0;

/// The format+modifier pairs advertised in the feedback table
const FORMAT_TABLE: [(u32, u64); 2] = [
    (DRM_FORMAT_ARGB8888, DRM_FORMAT_MOD_LINEAR),
    (DRM_FORMAT_XRGB8888, DRM_FORMAT_MOD_LINEAR),
];

#[allow(unused_variables)]
impl ws::GlobalDispatch<zldv1::ZwpLinuxDmabufV1, ()> for Tempest {
    fn bind(
        state: &mut Self,
        handle: &ws::DisplayHandle,
        client: &ws::Client,
        resource: ws::New<zldv1::ZwpLinuxDmabufV1>,
        global_data: &(),
        data_init: &mut ws::DataInit<'_, Self>,
    ) {
        let dma = data_init.init(resource, ());

        // Version 4 moved format advertisement into the feedback
        // object; the events below are for old binds only
        if dma.version() <= 3 {
            for (fmt, _mod) in FORMAT_TABLE.iter() {
                dma.format(*fmt);
                if dma.version() == 3 {
                    dma.modifier(*fmt, 0, 0);
                }
            }
        }
    }
}

// Dispatch<Interface, Userdata>
#[allow(unused_variables)]
impl ws::Dispatch<zldv1::ZwpLinuxDmabufV1, ()> for Tempest {
    fn request(
        state: &mut Self,
        client: &ws::Client,
        resource: &zldv1::ZwpLinuxDmabufV1,
        request: zldv1::Request,
        data: &(),
        dhandle: &ws::DisplayHandle,
        data_init: &mut ws::DataInit<'_, Self>,
    ) {
        match request {
            zldv1::Request::CreateParams { params_id } => {
                let params = Arc::new(Mutex::new(Params {
                    p_planes: Vec::new(),
                }));
                data_init.init(params_id, params);
            }
            zldv1::Request::GetDefaultFeedback { id } => {
                let feedback = data_init.init(id, ());
                send_feedback(state, &feedback);
            }
            zldv1::Request::GetSurfaceFeedback { id, surface: _ } => {
                // Per-surface feedback matches the default one,
                // we have a single device and no scanout tranches
                let feedback = data_init.init(id, ());
                send_feedback(state, &feedback);
            }
            zldv1::Request::Destroy => (),
            _ => (),
        };
    }

    fn destroyed(
        state: &mut Self,
        _client: ws::backend::ClientId,
        _resource: &zldv1::ZwpLinuxDmabufV1,
        data: &(),
    ) {
    }
}

/// Deliver the feedback parameter dump
///
/// The sequence is fixed by the protocol: main_device, the format
/// table (a memfd of 16 byte entries), then one tranche and done.
fn send_feedback(state: &mut Tempest, feedback: &zldfv1::ZwpLinuxDmabufFeedbackV1) {
    let dev = state
        .t_outputs
        .lock()
        .handle()
        .dev_id()
        .unwrap_or(0);
    let dev_bytes = dev.to_ne_bytes().to_vec();

    feedback.main_device(dev_bytes.clone());

    // entries are { u32 format; u32 pad; u64 modifier }
    match format_table_fd() {
        Ok((file, size)) => {
            feedback.format_table(file.as_fd(), size);
        }
        Err(e) => {
            log::error!("Could not create the dmabuf format table: {}", e);
            return;
        }
    }

    feedback.tranche_target_device(dev_bytes);
    feedback.tranche_flags(zldfv1::TrancheFlags::empty());

    // tranche_formats carries u16 indices into the table
    let mut indices = Vec::with_capacity(FORMAT_TABLE.len() * 2);
    for i in 0..FORMAT_TABLE.len() as u16 {
        indices.extend_from_slice(&i.to_ne_bytes());
    }
    feedback.tranche_formats(indices);

    feedback.tranche_done();
    feedback.done();
}

/// Write the format table into a sealed-ish anonymous file
fn format_table_fd() -> std::io::Result<(File, u32)> {
    let size = (FORMAT_TABLE.len() * 16) as u32;

    let fd = memfd_create(
        &CString::new("squall-dmabuf-formats").unwrap(),
        MemFdCreateFlag::MFD_CLOEXEC,
    )
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    let mut file = unsafe { File::from_raw_fd(fd) };

    for (fmt, modifier) in FORMAT_TABLE.iter() {
        file.write_all(&fmt.to_ne_bytes())?;
        file.write_all(&0u32.to_ne_bytes())?;
        file.write_all(&modifier.to_ne_bytes())?;
    }
    file.flush()?;

    Ok((file, size))
}

#[allow(unused_variables)]
impl ws::Dispatch<zldfv1::ZwpLinuxDmabufFeedbackV1, ()> for Tempest {
    fn request(
        state: &mut Self,
        client: &ws::Client,
        resource: &zldfv1::ZwpLinuxDmabufFeedbackV1,
        request: zldfv1::Request,
        data: &(),
        dhandle: &ws::DisplayHandle,
        data_init: &mut ws::DataInit<'_, Self>,
    ) {
    }

    fn destroyed(
        state: &mut Self,
        _client: ws::backend::ClientId,
        _resource: &zldfv1::ZwpLinuxDmabufFeedbackV1,
        data: &(),
    ) {
    }
}

/// Marker userdata for wl_buffers minted from dmabuf params.
/// The renderer has no pixels to sample from these and skips
/// them.
pub struct DmabufBuffer;

#[allow(unused_variables)]
impl ws::Dispatch<ws::protocol::wl_buffer::WlBuffer, Arc<DmabufBuffer>> for Tempest {
    fn request(
        state: &mut Self,
        client: &ws::Client,
        resource: &ws::protocol::wl_buffer::WlBuffer,
        request: ws::protocol::wl_buffer::Request,
        data: &Arc<DmabufBuffer>,
        dhandle: &ws::DisplayHandle,
        data_init: &mut ws::DataInit<'_, Self>,
    ) {
    }

    fn destroyed(
        state: &mut Self,
        _client: ws::backend::ClientId,
        _resource: &ws::protocol::wl_buffer::WlBuffer,
        data: &Arc<DmabufBuffer>,
    ) {
    }
}

/// One plane a client added to its buffer params
#[allow(dead_code)]
struct Plane {
    pl_fd: RawFd,
    pl_idx: u32,
    pl_offset: u32,
    pl_stride: u32,
    pl_modifier: u64,
}

/// Accumulated state for zwp_linux_buffer_params_v1
pub struct Params {
    p_planes: Vec<Plane>,
}

impl Drop for Params {
    fn drop(&mut self) {
        // the dmabuf fds were passed to us, close them
        for plane in self.p_planes.iter() {
            close(plane.pl_fd).ok();
        }
    }
}

#[allow(unused_variables)]
impl ws::Dispatch<zlbpv1::ZwpLinuxBufferParamsV1, Arc<Mutex<Params>>> for Tempest {
    fn request(
        state: &mut Self,
        client: &ws::Client,
        resource: &zlbpv1::ZwpLinuxBufferParamsV1,
        request: zlbpv1::Request,
        data: &Arc<Mutex<Params>>,
        dhandle: &ws::DisplayHandle,
        data_init: &mut ws::DataInit<'_, Self>,
    ) {
        match request {
            zlbpv1::Request::Add {
                fd,
                plane_idx,
                offset,
                stride,
                modifier_hi,
                modifier_lo,
            } => {
                data.lock().unwrap().p_planes.push(Plane {
                    pl_fd: fd.into_raw_fd(),
                    pl_idx: plane_idx,
                    pl_offset: offset,
                    pl_stride: stride,
                    pl_modifier: ((modifier_hi as u64) << 32) | modifier_lo as u64,
                });
            }
            zlbpv1::Request::Create { .. } => {
                // No GBM import path exists, tell the client to
                // fall back to shm
                log::error!("dmabuf buffer creation requested, answering `failed`");
                resource.failed();
            }
            zlbpv1::Request::CreateImmed { buffer_id, .. } => {
                // The protocol gives immed creation no failure
                // path short of a protocol error. The buffer still
                // has to be initialized so the object table stays
                // consistent while the error is in flight.
                data_init.init(buffer_id, Arc::new(DmabufBuffer));
                resource.post_error(
                    zlbpv1::Error::InvalidWlBuffer,
                    "dmabuf import is not supported, use create",
                );
            }
            zlbpv1::Request::Destroy => (),
            _ => (),
        };
    }

    fn destroyed(
        state: &mut Self,
        _client: ws::backend::ClientId,
        _resource: &zlbpv1::ZwpLinuxBufferParamsV1,
        data: &Arc<Mutex<Params>>,
    ) {
    }
}

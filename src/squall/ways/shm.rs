// Implementation of the wl_shm interface
//
// Clients mmap a pool of shared memory and carve buffers out of
// it. The mapped region stays alive until the pool resource is
// destroyed AND every buffer cut from it is gone; shared
// ownership of the region encodes exactly that rule.
//
// Austin Shafer - 2024
extern crate nix;
extern crate wayland_server as ws;

use ws::protocol::wl_buffer;
use ws::protocol::{wl_shm, wl_shm_pool};
use ws::Resource;

use crate::squall::Tempest;
use utils::{log, MemImage};

use nix::sys::mman;
use std::ffi::c_void;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::sync::{Arc, Mutex};

#[allow(unused_variables)]
impl ws::GlobalDispatch<wl_shm::WlShm, ()> for Tempest {
    fn bind(
        state: &mut Self,
        handle: &ws::DisplayHandle,
        client: &ws::Client,
        resource: ws::New<wl_shm::WlShm>,
        global_data: &(),
        data_init: &mut ws::DataInit<'_, Self>,
    ) {
        let shm = data_init.init(resource, ());
        shm.format(wl_shm::Format::Xrgb8888);
        shm.format(wl_shm::Format::Rgba8888);
    }
}

// Dispatch<Interface, Userdata>
#[allow(unused_variables)]
impl ws::Dispatch<wl_shm::WlShm, ()> for Tempest {
    // Handles requests for the wl_shm interface
    //
    // There is essentially only one thing going on here,
    // we immediately mmap the passed fd and create a
    // wl_shm_pool resource to represent it.
    fn request(
        state: &mut Self,
        client: &ws::Client,
        resource: &wl_shm::WlShm,
        request: wl_shm::Request,
        data: &(),
        dhandle: &ws::DisplayHandle,
        data_init: &mut ws::DataInit<'_, Self>,
    ) {
        match request {
            wl_shm::Request::CreatePool { id, fd, size } => {
                // We only handle valid sized pools
                if size <= 0 {
                    resource.post_error(wl_shm::Error::InvalidStride, "Invalid pool size");
                    return;
                }

                // the fd was passed to us, the region owns it now
                match ShmRegion::new(fd.into_raw_fd(), size as usize) {
                    Some(reg) => {
                        data_init.init(id, Arc::new(Mutex::new(reg)));
                    }
                    None => resource.post_error(wl_shm::Error::InvalidFd, "Could not mmap pool fd"),
                }
            }
            _ => (),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: ws::backend::ClientId,
        _resource: &wl_shm::WlShm,
        data: &(),
    ) {
    }
}

#[allow(unused_variables)]
impl ws::Dispatch<wl_shm_pool::WlShmPool, Arc<Mutex<ShmRegion>>> for Tempest {
    // Handle requests for the wl_shm_pool interface
    //
    // The shared memory pool hands out buffers; we carve a
    // portion of the mapped region out to supply one.
    fn request(
        state: &mut Self,
        client: &ws::Client,
        resource: &wl_shm_pool::WlShmPool,
        request: wl_shm_pool::Request,
        data: &Arc<Mutex<ShmRegion>>,
        dhandle: &ws::DisplayHandle,
        data_init: &mut ws::DataInit<'_, Self>,
    ) {
        match request {
            wl_shm_pool::Request::CreateBuffer {
                id,
                offset,
                width,
                height,
                stride,
                format: format_enum,
            } => {
                let format = match format_enum.into_result() {
                    Ok(f) => f,
                    Err(_) => {
                        resource.post_error(wl_shm::Error::InvalidFormat, "Not a valid format");
                        return;
                    }
                };

                // Only the advertised formats are accepted
                if format != wl_shm::Format::Xrgb8888 && format != wl_shm::Format::Rgba8888 {
                    resource.post_error(
                        wl_shm::Error::InvalidFormat,
                        format!("SHM format {:?} is not supported", format),
                    );
                    return;
                }

                // The buffer must lie inside the pool
                let pool_size = data.lock().unwrap().sr_size as i64;
                if offset < 0
                    || stride < width * 4
                    || (offset as i64) + (stride as i64) * (height as i64) > pool_size
                {
                    resource.post_error(
                        wl_shm::Error::InvalidStride,
                        "Buffer does not fit in its pool",
                    );
                    return;
                }

                let buf = ShmBuffer {
                    sb_reg: data.clone(),
                    sb_offset: offset,
                    sb_width: width,
                    sb_height: height,
                    sb_stride: stride,
                    sb_format: format,
                };
                log::debug!("Created new shm buf with size {}x{}", width, height);

                // Add our buffer priv data to the userdata
                data_init.init(id, Arc::new(buf));
            }
            wl_shm_pool::Request::Resize { size } => {
                data.lock().unwrap().resize(size as usize);
            }
            wl_shm_pool::Request::Destroy => {
                // Buffers keep their own reference to the region,
                // so the memory survives until the last of them is
                // destroyed
            }
            _ => (),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: ws::backend::ClientId,
        _resource: &wl_shm_pool::WlShmPool,
        data: &Arc<Mutex<ShmRegion>>,
    ) {
    }
}

/// A mmapped region of memory shared with a client
///
/// This region is mapped from the fd passed in
/// wl_shm.create_pool. It is the user data for a shm pool, and
/// every buffer carved from the pool also holds a reference, so
/// it is unmapped only when the pool and all its buffers are gone.
pub struct ShmRegion {
    sr_fd: RawFd,
    sr_raw_ptr: *mut c_void,
    pub sr_size: usize,
}

// Have to do this manually because of the void *
unsafe impl Send for ShmRegion {}

impl ShmRegion {
    /// Map size bytes of fd as a shared region
    fn new(fd: RawFd, size: usize) -> Option<ShmRegion> {
        unsafe {
            let ptr = match mman::mmap(
                std::ptr::null_mut(),
                size,
                mman::ProtFlags::PROT_READ,
                mman::MapFlags::MAP_SHARED,
                fd,
                0,
            ) {
                Ok(p) => p,
                Err(_) => return None,
            };

            Some(ShmRegion {
                sr_fd: fd,
                sr_raw_ptr: ptr,
                sr_size: size,
            })
        }
    }

    /// Enlarge the shm pool
    /// Shrinking a pool is not supported
    fn resize(&mut self, size: usize) {
        if size <= self.sr_size {
            return;
        }

        unsafe {
            // unmap the old window into the file and make a
            // bigger one
            mman::munmap(self.sr_raw_ptr, self.sr_size).unwrap();
            self.sr_raw_ptr = mman::mmap(
                std::ptr::null_mut(),
                size,
                mman::ProtFlags::PROT_READ,
                mman::MapFlags::MAP_SHARED,
                self.sr_fd,
                0,
            )
            .expect("Could not resize the shm pool");
            self.sr_size = size;
        }
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        if !self.sr_raw_ptr.is_null() {
            unsafe {
                // We need to manually unmap this region
                mman::munmap(self.sr_raw_ptr, self.sr_size).unwrap();
                nix::unistd::close(self.sr_fd).ok();
            }
        }
    }
}

/// A buffer in shared memory
///
/// This represents a rectangle carved out of a ShmRegion. This
/// struct did not allocate the shared memory, it only borrows a
/// view into the pool's mapping.
pub struct ShmBuffer {
    /// The region this buffer is a part of
    sb_reg: Arc<Mutex<ShmRegion>>,
    /// The offset into sb_reg where this is located
    sb_offset: i32,
    pub sb_width: i32,
    pub sb_height: i32,
    /// stride in bytes
    pub sb_stride: i32,
    pub sb_format: wl_shm::Format,
}

impl ShmBuffer {
    /// Convert this buffer into a MemImage
    ///
    /// The renderer uses MemImage to represent raw pixel memory.
    /// We find the raw pointer at the correct offset into the
    /// region and package it with the texel stride.
    pub fn get_mem_image(&self) -> MemImage {
        let mut ret = MemImage::new(
            unsafe {
                self.sb_reg
                    .lock()
                    .unwrap()
                    .sr_raw_ptr
                    .offset(self.sb_offset as isize)
            } as *mut u8,
            4, // 4 bytes per pixel in all supported formats
            self.sb_width as usize,
            self.sb_height as usize,
        );
        // convert from bytes to texels
        ret.set_stride((self.sb_stride / 4) as usize);

        return ret;
    }
}

// Handle buffers with shm attached
#[allow(unused_variables)]
impl ws::Dispatch<wl_buffer::WlBuffer, Arc<ShmBuffer>> for Tempest {
    fn request(
        state: &mut Self,
        client: &ws::Client,
        resource: &wl_buffer::WlBuffer,
        request: wl_buffer::Request,
        data: &Arc<ShmBuffer>,
        dhandle: &ws::DisplayHandle,
        data_init: &mut ws::DataInit<'_, Self>,
    ) {
        // the only request is Destroy, handled by the library
    }

    fn destroyed(
        state: &mut Self,
        _client: ws::backend::ClientId,
        _resource: &wl_buffer::WlBuffer,
        data: &Arc<ShmBuffer>,
    ) {
        // dropping our Arc releases the region reference; the
        // mmap goes away with the last buffer of a destroyed pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
    use std::ffi::CString;

    fn memfd_of_size(size: usize) -> RawFd {
        let fd = memfd_create(
            &CString::new("squall-shm-test").unwrap(),
            MemFdCreateFlag::empty(),
        )
        .unwrap();
        nix::unistd::ftruncate(fd, size as i64).unwrap();
        fd
    }

    #[test]
    fn region_maps_and_grows() {
        let fd = memfd_of_size(8192);
        let mut reg = ShmRegion::new(fd, 4096).unwrap();
        assert_eq!(reg.sr_size, 4096);

        reg.resize(8192);
        assert_eq!(reg.sr_size, 8192);

        // shrinking is ignored
        reg.resize(16);
        assert_eq!(reg.sr_size, 8192);
    }

    #[test]
    fn buffer_view_applies_offset_and_stride() {
        let fd = memfd_of_size(4096);
        let reg = Arc::new(Mutex::new(ShmRegion::new(fd, 4096).unwrap()));

        let buf = ShmBuffer {
            sb_reg: reg.clone(),
            sb_offset: 256,
            sb_width: 4,
            sb_height: 8,
            sb_stride: 32,
            sb_format: wl_shm::Format::Xrgb8888,
        };

        let img = buf.get_mem_image();
        assert_eq!(img.width, 4);
        assert_eq!(img.height, 8);
        // 32 bytes per row = 8 texels
        assert_eq!(img.stride, 8);
        assert_eq!(img.as_slice().len(), 8 * 8 * 4);
    }
}

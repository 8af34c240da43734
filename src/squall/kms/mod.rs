// A small DRM/GBM/EGL facade
//
// This hides the kernel modesetting plumbing from the rest of the
// compositor: enumerating cards and connectors, planning CRTCs,
// and driving an EGL surface whose front buffers are page-flipped
// onto the scanout plane.
//
// Austin Shafer - 2024
extern crate drm;
extern crate gbm;
extern crate khronos_egl as egl;
extern crate nix;
extern crate thiserror;

use drm::control::{connector, crtc, framebuffer, Device as ControlDevice, Event, PageFlipFlags};
use gbm::AsRaw;
use nix::poll::{poll, PollFd, PollFlags};
use thiserror::Error;
use utils::{anyhow, log, Context, Result};

use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, BorrowedFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;

const DRI_PATH: &str = "/dev/dri";

/// An unopened DRM card node, i.e. `/dev/dri/card0`
#[derive(Debug, Clone)]
pub struct Card {
    c_path: PathBuf,
}

/// Enumerate the cards on this system, sorted by ascending index
pub fn cards() -> Result<Vec<Card>> {
    let mut found = Vec::new();

    for ent in std::fs::read_dir(DRI_PATH).context("Could not read /dev/dri")? {
        let path = ent?.path();
        let name = match path.file_name().and_then(|f| f.to_str()) {
            Some(n) => n.to_string(),
            None => continue,
        };

        // We only care about the cardN nodes, not renderD/controlD
        if let Some(index) = name.strip_prefix("card").and_then(|n| n.parse::<u32>().ok()) {
            found.push((index, Card { c_path: path }));
        }
    }

    found.sort_by_key(|(index, _)| *index);
    Ok(found.into_iter().map(|(_, card)| card).collect())
}

impl Card {
    /// Open this card and initialize GBM + EGL on it
    pub fn open(&self) -> Result<Handle> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(&self.c_path)
            .with_context(|| format!("Failed to open DRM device {:?}", self.c_path))?;
        let raw_fd = file.as_raw_fd();

        let gbm = gbm::Device::new(DrmFd(file)).context("Failed to create a GBM device")?;
        let egl = EglCore::new(&gbm)?;

        log::error!("Opened DRM card {:?}", self.c_path);

        Ok(Handle(Arc::new(HandleData {
            hd_path: self.c_path.clone(),
            hd_raw_fd: raw_fd,
            hd_gbm: gbm,
            hd_egl: egl,
        })))
    }
}

/// The owned DRM file descriptor
///
/// drm-rs drives ioctls through these marker traits.
struct DrmFd(File);

impl std::os::unix::io::AsFd for DrmFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}
impl drm::Device for DrmFd {}
impl drm::control::Device for DrmFd {}

/// Per-card state: the drm fd, the GBM device made from it, and
/// the EGL display/config/context stack
pub struct HandleData {
    #[allow(dead_code)]
    hd_path: PathBuf,
    hd_raw_fd: RawFd,
    hd_gbm: gbm::Device<DrmFd>,
    hd_egl: EglCore,
}

// The EGL handles are raw pointers, which poisons this for Send.
// They are only ever touched from the compositor thread.
unsafe impl Send for HandleData {}
unsafe impl Sync for HandleData {}

impl std::os::unix::io::AsFd for HandleData {
    fn as_fd(&self) -> BorrowedFd<'_> {
        unsafe { BorrowedFd::borrow_raw(self.hd_raw_fd) }
    }
}
impl drm::Device for HandleData {}
impl drm::control::Device for HandleData {}

/// A reference counted handle to an open card
///
/// Multiple outputs share a card; the drm fd and EGL display are
/// closed when the last handle goes away.
#[derive(Clone)]
pub struct Handle(Arc<HandleData>);

impl std::ops::Deref for Handle {
    type Target = HandleData;

    fn deref(&self) -> &HandleData {
        &self.0
    }
}

impl HandleData {
    pub fn egl(&self) -> &EglCore {
        &self.hd_egl
    }

    pub fn gbm(&self) -> &gbm::Device<DrmFd> {
        &self.hd_gbm
    }

    /// The device id of this card, as reported by stat. Used for
    /// dmabuf feedback.
    pub fn dev_id(&self) -> Result<u64> {
        let st = nix::sys::stat::fstat(self.hd_raw_fd).context("fstat on DRM fd failed")?;
        Ok(st.st_rdev as u64)
    }

    /// All CRTCs on this card, in kernel order. The mode-set
    /// allocator refers to these by index.
    pub fn crtcs(&self) -> Result<Vec<crtc::Handle>> {
        let res = self.resource_handles().context("Could not get DRM resources")?;
        Ok(res.crtcs().to_vec())
    }

    /// Descriptors for every connector on the card
    pub fn connectors(&self) -> Result<Vec<Connector>> {
        let res = self.resource_handles().context("Could not get DRM resources")?;
        let crtcs = res.crtcs().to_vec();
        let mut ret = Vec::new();

        for handle in res.connectors() {
            let info = match self.get_connector(*handle, false) {
                Ok(i) => i,
                Err(_) => continue,
            };

            // Precompute, for each encoder, the bitmask of CRTC
            // indices it can drive. The allocator plans purely off
            // these masks.
            let mut masks = Vec::new();
            for enc in info.encoders().iter() {
                if let Ok(enc_info) = self.get_encoder(*enc) {
                    let compatible = res.filter_crtcs(enc_info.possible_crtcs());
                    let mut mask = 0u32;
                    for c in compatible.iter() {
                        if let Some(i) = crtcs.iter().position(|h| h == c) {
                            mask |= 1 << i;
                        }
                    }
                    masks.push(mask);
                }
            }

            let name = format!("{}-{}", interface_name(info.interface()), info.interface_id());
            let modes = info
                .modes()
                .iter()
                .map(|m| Mode::from_raw(*m))
                .collect::<Vec<_>>();

            ret.push(Connector {
                cn_handle: Some(*handle),
                cn_name: name,
                cn_connected: info.state() == connector::State::Connected,
                cn_modes: modes,
                cn_crtc_masks: masks,
            });
        }

        Ok(ret)
    }
}

/// The kernel's name for a connector type
fn interface_name(i: connector::Interface) -> &'static str {
    use drm::control::connector::Interface;
    match i {
        Interface::VGA => "VGA",
        Interface::DVII => "DVI-I",
        Interface::DVID => "DVI-D",
        Interface::DVIA => "DVI-A",
        Interface::Composite => "Composite",
        Interface::SVideo => "SVIDEO",
        Interface::LVDS => "LVDS",
        Interface::Component => "Component",
        Interface::NinePinDIN => "DIN",
        Interface::DisplayPort => "DP",
        Interface::HDMIA => "HDMI-A",
        Interface::HDMIB => "HDMI-B",
        Interface::TV => "TV",
        Interface::EmbeddedDisplayPort => "eDP",
        Interface::Virtual => "Virtual",
        Interface::DSI => "DSI",
        Interface::DPI => "DPI",
        _ => "Unknown",
    }
}

/// A physical output port as exposed by the kernel
#[derive(Debug, Clone)]
pub struct Connector {
    cn_handle: Option<connector::Handle>,
    cn_name: String,
    cn_connected: bool,
    cn_modes: Vec<Mode>,
    /// one entry per encoder: the mask of CRTC indices that
    /// encoder can drive
    cn_crtc_masks: Vec<u32>,
}

impl Connector {
    /// Unique connector name, i.e. `HDMI-A-1`
    pub fn name(&self) -> &str {
        &self.cn_name
    }

    pub fn connected(&self) -> bool {
        self.cn_connected
    }

    #[allow(dead_code)]
    pub fn modes(&self) -> &[Mode] {
        &self.cn_modes
    }

    /// The mode the kernel prefers, falling back to the first one
    pub fn preferred_mode(&self) -> Option<Mode> {
        self.cn_modes
            .iter()
            .find(|m| m.preferred())
            .or_else(|| self.cn_modes.first())
            .copied()
    }

    pub fn crtc_masks(&self) -> &[u32] {
        &self.cn_crtc_masks
    }

    pub fn handle(&self) -> Option<connector::Handle> {
        self.cn_handle
    }

    /// Construct a connector descriptor that is not backed by the
    /// kernel. Only the pure planning paths can use these.
    #[cfg(test)]
    pub fn fake(name: &str, modes: Vec<Mode>, crtc_masks: Vec<u32>) -> Self {
        Self {
            cn_handle: None,
            cn_name: name.to_string(),
            cn_connected: true,
            cn_modes: modes,
            cn_crtc_masks: crtc_masks,
        }
    }
}

/// A display mode descriptor
#[derive(Debug, Copy, Clone)]
pub struct Mode {
    m_width: u32,
    m_height: u32,
    m_refresh: u32,
    m_preferred: bool,
    m_raw: Option<drm::control::Mode>,
}

impl Mode {
    fn from_raw(raw: drm::control::Mode) -> Self {
        Self {
            m_width: raw.size().0 as u32,
            m_height: raw.size().1 as u32,
            m_refresh: raw.vrefresh(),
            m_preferred: raw
                .mode_type()
                .contains(drm::control::ModeTypeFlags::PREFERRED),
            m_raw: Some(raw),
        }
    }

    /// A descriptor with no kernel mode behind it, for planning
    /// and tests
    pub fn new(width: u32, height: u32, refresh: u32) -> Self {
        Self {
            m_width: width,
            m_height: height,
            m_refresh: refresh,
            m_preferred: false,
            m_raw: None,
        }
    }

    pub fn width(&self) -> u32 {
        self.m_width
    }

    pub fn height(&self) -> u32 {
        self.m_height
    }

    /// Refresh rate in Hz
    pub fn refresh(&self) -> u32 {
        self.m_refresh
    }

    /// Refresh rate in mHz, which is what wl_output wants
    pub fn refresh_millihz(&self) -> i32 {
        (self.m_refresh * 1000) as i32
    }

    pub fn preferred(&self) -> bool {
        self.m_preferred
    }
}

/// Why a mode set could not be performed
#[derive(Error, Debug)]
pub enum ModeSetError {
    #[error("no compatible CRTC is available for this connector")]
    NoCompatibleCrtc,
    #[error("the kernel rejected the mode set")]
    KernelReject(#[source] std::io::Error),
}

/// The EGL display/config/context for one card
///
/// GLES2 on top of the card's GBM device, with a config whose
/// native visual is XRGB8888 so the framebuffers can scan out.
pub struct EglCore {
    pub ec_instance: egl::Instance<egl::Static>,
    pub ec_display: egl::Display,
    pub ec_config: egl::Config,
    pub ec_context: egl::Context,
}

impl EglCore {
    fn new(gbm: &gbm::Device<DrmFd>) -> Result<Self> {
        let instance = egl::Instance::new(egl::Static);

        let display = unsafe { instance.get_display(gbm.as_raw() as *mut c_void) }
            .ok_or_else(|| anyhow!("Failed to get an EGL display for the GBM device"))?;
        instance
            .initialize(display)
            .context("Failed to initialize EGL")?;
        instance
            .bind_api(egl::OPENGL_ES_API)
            .context("eglBindAPI failed")?;

        #[rustfmt::skip]
        let config_attribs = [
            egl::SURFACE_TYPE, egl::WINDOW_BIT,
            egl::RED_SIZE, 8,
            egl::GREEN_SIZE, 8,
            egl::BLUE_SIZE, 8,
            egl::ALPHA_SIZE, 0,
            egl::RENDERABLE_TYPE, egl::OPENGL_ES2_BIT,
            egl::NONE,
        ];

        let mut configs = Vec::with_capacity(64);
        instance
            .choose_config(display, &config_attribs, &mut configs)
            .context("eglChooseConfig failed")?;

        // Pick the config whose native visual matches the scanout
        // format, or page flipping will reject our framebuffers
        let mut config = None;
        for c in configs.iter() {
            if let Ok(id) = instance.get_config_attrib(display, *c, egl::NATIVE_VISUAL_ID) {
                if id as u32 == gbm::Format::Xrgb8888 as u32 {
                    config = Some(*c);
                    break;
                }
            }
        }
        let config =
            config.ok_or_else(|| anyhow!("No EGL config with an XRGB8888 native visual"))?;

        let ctx_attribs = [egl::CONTEXT_CLIENT_VERSION, 2, egl::NONE];
        let context = instance
            .create_context(display, config, None, &ctx_attribs)
            .context("eglCreateContext failed")?;

        Ok(Self {
            ec_instance: instance,
            ec_display: display,
            ec_config: config,
            ec_context: context,
        })
    }
}

/// An EGL surface bound to (connector, CRTC, mode) that can scan
/// out
///
/// `present` is synchronous: it swaps, adds a framebuffer for the
/// freshly rendered buffer object (cached per-bo), queues a legacy
/// page flip and then blocks on the drm fd until the flip event
/// lands. That block is the compositor's frame cadence.
pub struct EglScanout {
    es_handle: Handle,
    es_connector: connector::Handle,
    es_crtc: crtc::Handle,
    es_mode: Mode,
    es_surface: gbm::Surface<framebuffer::Handle>,
    es_egl_surface: egl::Surface,
    #[allow(dead_code)]
    es_num_backbuffers: u32,
    es_first_fb: framebuffer::Handle,
    es_last_bo: Option<gbm::BufferObject<framebuffer::Handle>>,
}

unsafe impl Send for EglScanout {}

impl EglScanout {
    pub const DEFAULT_BACKBUFFERS: u32 = 2;

    pub fn new(
        handle: Handle,
        connector: connector::Handle,
        crtc: crtc::Handle,
        mode: Mode,
        backbuffers: u32,
    ) -> Result<Self> {
        let gbm_surface = handle
            .gbm()
            .create_surface::<framebuffer::Handle>(
                mode.width(),
                mode.height(),
                gbm::Format::Xrgb8888,
                gbm::BufferObjectFlags::SCANOUT | gbm::BufferObjectFlags::RENDERING,
            )
            .context("Failed to create a GBM surface")?;

        let egl = handle.egl();
        let egl_surface = unsafe {
            egl.ec_instance.create_window_surface(
                egl.ec_display,
                egl.ec_config,
                gbm_surface.as_raw() as egl::NativeWindowType,
                None,
            )
        }
        .context("Failed to create an EGL window surface")?;

        // Swap once so the surface has a front buffer we can hang
        // the initial framebuffer (and the mode set) off of.
        egl.ec_instance
            .make_current(
                egl.ec_display,
                Some(egl_surface),
                Some(egl_surface),
                Some(egl.ec_context),
            )
            .context("eglMakeCurrent failed")?;
        egl.ec_instance
            .swap_buffers(egl.ec_display, egl_surface)
            .context("Initial eglSwapBuffers failed")?;

        let first_fb = {
            let mut bo = unsafe { gbm_surface.lock_front_buffer() }
                .context("Failed to lock the gbm front buffer")?;
            let fb = handle
                .add_framebuffer(&bo, 24, 32)
                .context("drmModeAddFB failed")?;
            bo.set_userdata(fb).ok();
            fb
            // dropping the bo releases it back to the swapchain
        };

        Ok(Self {
            es_handle: handle,
            es_connector: connector,
            es_crtc: crtc,
            es_mode: mode,
            es_surface: gbm_surface,
            es_egl_surface: egl_surface,
            es_num_backbuffers: backbuffers,
            es_first_fb: first_fb,
            es_last_bo: None,
        })
    }

    pub fn mode(&self) -> &Mode {
        &self.es_mode
    }

    pub fn handle(&self) -> &Handle {
        &self.es_handle
    }

    /// Commit (connector, CRTC, framebuffer, mode) to the kernel
    /// so scanout starts
    pub fn mode_set(&self) -> std::result::Result<(), ModeSetError> {
        let raw = self
            .es_mode
            .m_raw
            .expect("Cannot mode set a synthetic mode descriptor");

        self.es_handle
            .set_crtc(
                self.es_crtc,
                Some(self.es_first_fb),
                (0, 0),
                &[self.es_connector],
                Some(raw),
            )
            .map_err(ModeSetError::KernelReject)
    }

    /// Make the GL context current on this surface. Rendering for
    /// a frame starts here.
    pub fn acquire(&self) -> Result<()> {
        let egl = self.es_handle.egl();
        egl.ec_instance
            .make_current(
                egl.ec_display,
                Some(self.es_egl_surface),
                Some(self.es_egl_surface),
                Some(egl.ec_context),
            )
            .context("eglMakeCurrent failed")?;
        Ok(())
    }

    /// Swap, page flip, and wait for the flip to land
    pub fn present(&mut self) -> Result<()> {
        let egl = self.es_handle.egl();
        egl.ec_instance
            .swap_buffers(egl.ec_display, self.es_egl_surface)
            .context("eglSwapBuffers failed")?;

        // Lock the buffer we just rendered to and look up (or
        // create) a DRM framebuffer for it
        let mut bo = unsafe { self.es_surface.lock_front_buffer() }
            .context("gbm_surface_lock_front_buffer failed")?;
        let fb = match bo.userdata().ok().flatten() {
            Some(fb) => *fb,
            None => {
                let fb = self
                    .es_handle
                    .add_framebuffer(&bo, 24, 32)
                    .context("drmModeAddFB failed")?;
                bo.set_userdata(fb).ok();
                fb
            }
        };

        self.es_handle
            .page_flip(self.es_crtc, fb, PageFlipFlags::EVENT, None)
            .context("drmModePageFlip failed")?;

        // Block until the flip for our CRTC fires. This is what
        // paces the compositor at the vblank rate.
        let mut flipped = false;
        while !flipped {
            let mut fds = [PollFd::new(self.es_handle.hd_raw_fd, PollFlags::POLLIN)];
            poll(&mut fds, -1).context("poll on DRM fd failed")?;

            for ev in self
                .es_handle
                .receive_events()
                .context("drmHandleEvent failed")?
            {
                if let Event::PageFlip(flip) = ev {
                    if flip.crtc == self.es_crtc {
                        flipped = true;
                    }
                }
            }
        }

        // Now that the new buffer is on the plane, the previous
        // one can return to the swapchain
        self.es_last_bo = Some(bo);
        Ok(())
    }
}

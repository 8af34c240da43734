// The GLES2 renderer
//
// One of these exists per output, wrapping the output's EGL
// scanout surface. The contract is bind -> clear -> draw(...) ->
// commit; commit blocks until the frame is actually on the plane.
//
// Client buffers are textured fresh every frame (full-frame
// redraw, no damage tracking) with a single quad program that maps
// screenspace to NDC.
//
// Austin Shafer - 2024
extern crate glow;

use crate::squall::cell::Shared;
use crate::squall::cursor::CursorImage;
use crate::squall::kms::EglScanout;
use crate::squall::output::MetadataStore;
use crate::squall::ways::shm::ShmBuffer;
use crate::squall::ways::surface::Surface;
use glow::HasContext;
use utils::{anyhow, log, Result};
use wayland_server::protocol::{wl_buffer, wl_callback};
use wayland_server::Resource;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Frame-done work scheduled during drawing and flushed by the
/// event loop after the page flip lands
pub struct FrameRecord {
    /// wl_callback.done target, if the surface requested one
    pub fr_callback: Option<wl_callback::WlCallback>,
    /// buffers the client may now reuse
    pub fr_releases: Vec<wl_buffer::WlBuffer>,
}

/// The queue of pending frame-done records
///
/// This is the only structure shared with a render thread, so it
/// sits behind a mutex. Drains happen on the protocol thread.
pub type FrameQueue = Arc<Mutex<VecDeque<FrameRecord>>>;

pub fn new_frame_queue() -> FrameQueue {
    Arc::new(Mutex::new(VecDeque::new()))
}

/// Everything a repaint listener needs to paint into the frame
/// being built: the output's renderer plus its workspace placement
/// and metadata, split-borrowed so listeners can hold all of them
/// at once.
pub struct PaintContext<'a> {
    pub pc_renderer: &'a mut GlRenderer,
    pub pc_meta: &'a mut MetadataStore,
    pub pc_pan: (f32, f32),
    pub pc_zoom: f32,
    pub pc_size: (u32, u32),
}

impl<'a> PaintContext<'a> {
    pub fn workspace_to_screen(&self, p: (f32, f32)) -> (f32, f32) {
        (
            (p.0 - self.pc_pan.0) * self.pc_zoom,
            (p.1 - self.pc_pan.1) * self.pc_zoom,
        )
    }
}

/// The compiled quad program and its bindings
struct QuadShader {
    qs_program: glow::NativeProgram,
    qs_u_screen_size: Option<glow::NativeUniformLocation>,
    qs_u_surface_size: Option<glow::NativeUniformLocation>,
    qs_u_surface_position: Option<glow::NativeUniformLocation>,
    qs_u_texture: Option<glow::NativeUniformLocation>,
    qs_a_position: u32,
    qs_a_texcoord: u32,
    qs_vbo: glow::NativeBuffer,
}

const QUAD_VERT: &str = r#"
precision mediump float;

attribute vec2 a_position;
attribute vec2 a_texcoord;
varying vec2 uv;

uniform vec2 u_screen_size;
uniform vec2 u_surface_size;
uniform vec2 u_surface_position;

vec2 to_ndc(vec2 screenspace) {
  return (screenspace / u_screen_size * 2.0 - 1.0)
    // Flip Y position
    * vec2(1, -1);
}

void main() {
  uv = a_texcoord;
  gl_Position = vec4(to_ndc(u_surface_position + a_position * u_surface_size), 0.0, 1.0);
}
"#;

const QUAD_FRAG: &str = r#"
precision mediump float;

varying vec2 uv;
uniform sampler2D u_texture;

void main() {
    gl_FragColor = texture2D(u_texture, uv);
}
"#;

// X, Y, U, V per vertex, drawn as a triangle strip
#[rustfmt::skip]
const QUAD_VERTS: [f32; 16] = [
    0.0, 0.0, 0.0, 0.0,
    1.0, 0.0, 1.0, 0.0,
    0.0, 1.0, 0.0, 1.0,
    1.0, 1.0, 1.0, 1.0,
];

/// Per-output GLES2 renderer
pub struct GlRenderer {
    r_scanout: EglScanout,
    r_gl: glow::Context,
    r_quad: QuadShader,
    r_frames: FrameQueue,
}

// The glow context wraps raw EGL-loaded entry points. Only the
// compositor thread renders.
unsafe impl Send for GlRenderer {}

impl GlRenderer {
    pub fn new(scanout: EglScanout, frames: FrameQueue) -> Result<Self> {
        // The context has to be current before we can load entry
        // points or compile anything
        scanout.acquire()?;

        let egl = scanout.handle().egl();
        let gl = unsafe {
            glow::Context::from_loader_function(|name| {
                match egl.ec_instance.get_proc_address(name) {
                    Some(f) => f as *const _,
                    None => std::ptr::null(),
                }
            })
        };

        let quad = Self::compile_quad(&gl)?;

        Ok(Self {
            r_scanout: scanout,
            r_gl: gl,
            r_quad: quad,
            r_frames: frames,
        })
    }

    fn compile_quad(gl: &glow::Context) -> Result<QuadShader> {
        unsafe {
            let program = gl
                .create_program()
                .map_err(|e| anyhow!("glCreateProgram: {}", e))?;

            for (ty, src) in [
                (glow::VERTEX_SHADER, QUAD_VERT),
                (glow::FRAGMENT_SHADER, QUAD_FRAG),
            ]
            .iter()
            {
                let shader = gl
                    .create_shader(*ty)
                    .map_err(|e| anyhow!("glCreateShader: {}", e))?;
                gl.shader_source(shader, src);
                gl.compile_shader(shader);
                if !gl.get_shader_compile_status(shader) {
                    return Err(anyhow!(
                        "Shader compile error: {}",
                        gl.get_shader_info_log(shader)
                    ));
                }
                gl.attach_shader(program, shader);
                gl.delete_shader(shader);
            }

            gl.link_program(program);
            if !gl.get_program_link_status(program) {
                return Err(anyhow!(
                    "Program link error: {}",
                    gl.get_program_info_log(program)
                ));
            }

            let vbo = gl
                .create_buffer()
                .map_err(|e| anyhow!("glGenBuffers: {}", e))?;
            gl.bind_buffer(glow::ARRAY_BUFFER, Some(vbo));
            let bytes = std::slice::from_raw_parts(
                QUAD_VERTS.as_ptr() as *const u8,
                QUAD_VERTS.len() * std::mem::size_of::<f32>(),
            );
            gl.buffer_data_u8_slice(glow::ARRAY_BUFFER, bytes, glow::STATIC_DRAW);

            Ok(QuadShader {
                qs_program: program,
                qs_u_screen_size: gl.get_uniform_location(program, "u_screen_size"),
                qs_u_surface_size: gl.get_uniform_location(program, "u_surface_size"),
                qs_u_surface_position: gl.get_uniform_location(program, "u_surface_position"),
                qs_u_texture: gl.get_uniform_location(program, "u_texture"),
                qs_a_position: gl
                    .get_attrib_location(program, "a_position")
                    .ok_or_else(|| anyhow!("a_position missing from quad shader"))?,
                qs_a_texcoord: gl
                    .get_attrib_location(program, "a_texcoord")
                    .ok_or_else(|| anyhow!("a_texcoord missing from quad shader"))?,
                qs_vbo: vbo,
            })
        }
    }

    /// Log any pending GL error. Development builds treat this as
    /// fatal, release builds skip the frame content instead.
    fn gl_check(&self, what: &str) {
        let err = unsafe { self.r_gl.get_error() };
        if err != glow::NO_ERROR {
            log::error!("OpenGL error in {}: {:#x}", what, err);
            debug_assert!(false, "OpenGL error in {}", what);
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (
            self.r_scanout.mode().width(),
            self.r_scanout.mode().height(),
        )
    }

    /// Start a frame. Makes our context current and sets up the
    /// blend state; must precede clear/draw.
    pub fn bind(&mut self) -> Result<()> {
        self.r_scanout.acquire()?;

        let (w, h) = self.size();
        unsafe {
            self.r_gl.enable(glow::BLEND);
            self.r_gl
                .blend_func(glow::SRC_ALPHA, glow::ONE_MINUS_SRC_ALPHA);
            self.r_gl.viewport(0, 0, w as i32, h as i32);
        }
        self.gl_check("bind");
        Ok(())
    }

    pub fn clear(&mut self, r: f32, g: f32, b: f32, a: f32) {
        unsafe {
            self.r_gl.clear_color(r, g, b, a);
            self.r_gl.clear(glow::COLOR_BUFFER_BIT);
        }
        self.gl_check("clear");
    }

    /// Present the frame. Blocks until the page flip for this
    /// output has completed.
    pub fn commit(&mut self) -> Result<()> {
        self.r_scanout.present()
    }

    /// Draw a committed surface (and its subsurface tree) with its
    /// upper left corner at `pos` in screenspace
    ///
    /// If the surface has a pending frame callback, the done event
    /// and the appropriate buffer releases are scheduled on the
    /// frame queue for the post-flip flush.
    pub fn draw_surface(&mut self, surf: &Shared<Surface>, pos: (f32, f32)) {
        let children = {
            let mut surface = surf.lock();

            let mut callback = None;
            let mut releases = surface.take_release_pending();

            if let Some(buffer) = surface.s_committed_buffer.clone() {
                if let Some(shm) = buffer.data::<Arc<ShmBuffer>>() {
                    let img = shm.get_mem_image();
                    let tex = self.upload_texture(
                        shm.sb_width,
                        shm.sb_height,
                        img.stride as i32,
                        glow::BGRA,
                        img.as_slice(),
                    );
                    self.quad(tex, pos, (shm.sb_width as f32, shm.sb_height as f32));
                    unsafe { self.r_gl.delete_texture(tex) };
                } else {
                    // dmabuf import is not wired up; such buffers
                    // have no local pixels to sample
                    log::debug!("Skipping draw of non-shm buffer {:?}", buffer.id());
                }

                // The surface was rendered, so its frame callback
                // is consumed by this scanout. A surface that kept
                // its only buffer gets it back once we have copied
                // it out.
                callback = surface.s_frame_callback.take();
                if releases.is_empty() && callback.is_some() {
                    releases.push(buffer);
                }
            }

            // Replaced (or unmapped) buffers go back to the client
            // after the flip regardless of whether anything drew
            if callback.is_some() || !releases.is_empty() {
                self.r_frames.lock().unwrap().push_back(FrameRecord {
                    fr_callback: callback,
                    fr_releases: releases,
                });
            }

            surface.s_subsurfaces.clone()
        };

        // Compose children over us, offset by their position
        for child in children.iter() {
            let (child_surf, offset) = {
                let sub = child.lock();
                (sub.su_surface.upgrade(), sub.su_position)
            };
            if let Some(cs) = child_surf {
                self.draw_surface(&cs, (pos.0 + offset.0 as f32, pos.1 + offset.1 as f32));
            }
        }
    }

    /// Draw a cursor image with its hotspot at `pos`
    pub fn draw_cursor(&mut self, image: &CursorImage, pos: (f32, f32)) {
        let tex = self.upload_texture(
            image.ci_width as i32,
            image.ci_height as i32,
            image.ci_width as i32,
            glow::RGBA,
            &image.ci_pixels,
        );
        self.quad(
            tex,
            (
                pos.0 - image.ci_xhot as f32,
                pos.1 - image.ci_yhot as f32,
            ),
            (image.ci_width as f32, image.ci_height as f32),
        );
        unsafe { self.r_gl.delete_texture(tex) };
    }

    /// Upload pixels as a GL_RGBA texture. `stride` is in pixels
    /// and goes through the unpack row length so padded shm rows
    /// sample correctly.
    fn upload_texture(
        &mut self,
        width: i32,
        height: i32,
        stride: i32,
        format: u32,
        data: &[u8],
    ) -> glow::NativeTexture {
        unsafe {
            let tex = self.r_gl.create_texture().expect("glGenTextures failed");
            self.r_gl.bind_texture(glow::TEXTURE_2D, Some(tex));
            self.r_gl.tex_parameter_i32(
                glow::TEXTURE_2D,
                glow::TEXTURE_MIN_FILTER,
                glow::NEAREST as i32,
            );
            self.r_gl.tex_parameter_i32(
                glow::TEXTURE_2D,
                glow::TEXTURE_MAG_FILTER,
                glow::NEAREST as i32,
            );

            self.r_gl.pixel_store_i32(glow::UNPACK_ROW_LENGTH, stride);
            self.r_gl.tex_image_2d(
                glow::TEXTURE_2D,
                0,
                glow::RGBA as i32,
                width,
                height,
                0,
                format,
                glow::UNSIGNED_BYTE,
                Some(data),
            );
            self.r_gl.pixel_store_i32(glow::UNPACK_ROW_LENGTH, 0);

            self.gl_check("upload_texture");
            tex
        }
    }

    /// Draw the textured quad at `pos` with `size`, both in
    /// screenspace
    fn quad(&mut self, texture: glow::NativeTexture, pos: (f32, f32), size: (f32, f32)) {
        let (sw, sh) = self.size();
        let gl = &self.r_gl;
        let quad = &self.r_quad;

        unsafe {
            gl.use_program(Some(quad.qs_program));

            gl.uniform_2_f32(quad.qs_u_surface_position.as_ref(), pos.0, pos.1);
            gl.uniform_2_f32(quad.qs_u_surface_size.as_ref(), size.0, size.1);
            gl.uniform_2_f32(quad.qs_u_screen_size.as_ref(), sw as f32, sh as f32);

            gl.active_texture(glow::TEXTURE0);
            gl.bind_texture(glow::TEXTURE_2D, Some(texture));
            gl.uniform_1_i32(quad.qs_u_texture.as_ref(), 0);

            gl.bind_buffer(glow::ARRAY_BUFFER, Some(quad.qs_vbo));
            gl.enable_vertex_attrib_array(quad.qs_a_position);
            gl.enable_vertex_attrib_array(quad.qs_a_texcoord);
            let stride = 4 * std::mem::size_of::<f32>() as i32;
            gl.vertex_attrib_pointer_f32(quad.qs_a_position, 2, glow::FLOAT, false, stride, 0);
            gl.vertex_attrib_pointer_f32(
                quad.qs_a_texcoord,
                2,
                glow::FLOAT,
                false,
                stride,
                2 * std::mem::size_of::<f32>() as i32,
            );

            gl.draw_arrays(glow::TRIANGLE_STRIP, 0, 4);

            gl.disable_vertex_attrib_array(quad.qs_a_position);
            gl.disable_vertex_attrib_array(quad.qs_a_texcoord);
        }
        self.gl_check("quad");
    }
}

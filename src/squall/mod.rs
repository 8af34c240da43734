// The squall wayland compositor
//
// Austin Shafer - 2024

pub mod cell;
pub mod cursor;
pub mod hotkey;
pub mod input;
pub mod kms;
pub mod output;
pub mod render;
pub mod signal;
pub mod ways;

pub use ways::compositor::Tempest;

use ways::compositor::EventManager;

use std::thread;

// The squall compositor
//
// This is the top layer of the storm.
// Instead of holding subsystem structures, it holds
// the thread handle that the compositor is running in.
#[allow(dead_code)]
pub struct Squall {
    // The wayland + drm subsystem
    //
    // Squall - Graphical desktop compositor
    // ways::EventManager - wayland protocol event loop
    sq_wc: Option<thread::JoinHandle<()>>,
}

impl Squall {
    // This is a cooler way of saying new
    pub fn spin() -> Squall {
        Squall {
            // Note that the wayland dispatch and the drm render
            // loop together are the complete compositor
            sq_wc: Some(
                thread::Builder::new()
                    .name("wayland_compositor".to_string())
                    .spawn(|| {
                        let mut ev = EventManager::new().expect("Failed to start the compositor");
                        ev.worker_thread();
                    })
                    .unwrap(),
            ),
        }
    }

    // This is the main loop of the entire system
    // We just wait for the worker thread
    pub fn run_forever(&mut self) {
        self.sq_wc.take().unwrap().join().ok();
    }
}

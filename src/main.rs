// A GLES2-backed desktop compositor for DRM/KMS
//
// Austin Shafer - 2024
#![allow(non_camel_case_types)]
#[macro_use]
extern crate bitflags;

mod squall;
use squall::Squall;

use std::time::SystemTime;

// This should remain completely safe.
fn main() {
    let mut storm = Squall::spin();

    println!("Begin render loop...");
    let start = SystemTime::now();
    storm.run_forever();
    let end = SystemTime::now();

    println!(
        "uptime: {}",
        end.duration_since(start).unwrap().as_secs_f32()
    );
}

// Implementation of the wl_region interface for tracking
// arbitrary areas of the screen
//
// Austin Shafer - 2024
extern crate wayland_server as ws;

use crate::squall::cell::Shared;
use crate::squall::Tempest;
use utils::region::Rect;
use ws::protocol::wl_region;

// Register a new wl_region
pub fn register_new(id: ws::New<wl_region::WlRegion>, data_init: &mut ws::DataInit<'_, Tempest>) {
    data_init.init(
        id,
        Shared::new(Region {
            r_add: Vec::new(),
            r_sub: Vec::new(),
        }),
    );
}

// Dispatch<Interface, Userdata>
#[allow(unused_variables)]
impl ws::Dispatch<wl_region::WlRegion, Shared<Region>> for Tempest {
    fn request(
        state: &mut Self,
        client: &ws::Client,
        resource: &wl_region::WlRegion,
        request: wl_region::Request,
        data: &Shared<Region>,
        dhandle: &ws::DisplayHandle,
        data_init: &mut ws::DataInit<'_, Self>,
    ) {
        data.lock().handle_request(request);
    }

    fn destroyed(
        state: &mut Self,
        _client: ws::backend::ClientId,
        _resource: &wl_region::WlRegion,
        data: &Shared<Region>,
    ) {
    }
}

/// The private userdata for the wl_region
///
/// A region is a set of added rectangles minus a set of
/// subtracted ones. Surfaces use these for their input and opaque
/// areas.
#[derive(Debug)]
pub struct Region {
    /// rectangles making up the active portion of the region
    pub r_add: Vec<Rect<i32>>,
    /// rectangles carved back out of the active area
    pub r_sub: Vec<Rect<i32>>,
}

impl Region {
    pub fn handle_request(&mut self, req: wl_region::Request) {
        match req {
            wl_region::Request::Add {
                x,
                y,
                width,
                height,
            } => self.r_add.push(Rect::new(x, y, width, height)),
            wl_region::Request::Subtract {
                x,
                y,
                width,
                height,
            } => self.r_sub.push(Rect::new(x, y, width, height)),
            // don't do anything special when destroying
            _ => (),
        }
    }

    /// Check if the point (x, y) is contained in this region
    pub fn contains(&self, x: i32, y: i32) -> bool {
        self.r_add.iter().any(|r| r.contains(x, y))
            && !self.r_sub.iter().any(|r| r.contains(x, y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtraction_cuts_holes() {
        let mut reg = Region {
            r_add: vec![Rect::new(0, 0, 100, 100)],
            r_sub: vec![Rect::new(40, 40, 20, 20)],
        };

        assert!(reg.contains(10, 10));
        assert!(!reg.contains(50, 50));
        assert!(!reg.contains(150, 50));

        // adding over a hole does not fill it back in
        reg.r_add.push(Rect::new(45, 45, 10, 10));
        assert!(!reg.contains(50, 50));
    }

    #[test]
    fn empty_region_contains_nothing() {
        let reg = Region {
            r_add: Vec::new(),
            r_sub: Vec::new(),
        };
        assert!(!reg.contains(0, 0));
    }
}

// Implementation of wl_subsurface and wl_subcompositor
//
// A subsurface is composed onto its parent at an offset. All of
// its state is synchronized: committing the subsurface only
// accumulates, and the parent's commit applies it.
//
// Austin Shafer - 2024
extern crate wayland_server as ws;
use ws::protocol::wl_subcompositor as wlsc;
use ws::protocol::wl_subsurface as wlss;
use ws::Resource;

use super::role::Role;
use super::surface::Surface;
use crate::squall::cell::{Shared, WeakRef};
use crate::squall::Tempest;
use utils::log;

#[allow(unused_variables)]
impl ws::GlobalDispatch<wlsc::WlSubcompositor, ()> for Tempest {
    fn bind(
        state: &mut Self,
        handle: &ws::DisplayHandle,
        client: &ws::Client,
        resource: ws::New<wlsc::WlSubcompositor>,
        global_data: &(),
        data_init: &mut ws::DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

#[allow(unused_variables)]
impl ws::Dispatch<wlsc::WlSubcompositor, ()> for Tempest {
    fn request(
        state: &mut Self,
        client: &ws::Client,
        resource: &wlsc::WlSubcompositor,
        request: wlsc::Request,
        data: &(),
        dhandle: &ws::DisplayHandle,
        data_init: &mut ws::DataInit<'_, Self>,
    ) {
        match request {
            wlsc::Request::GetSubsurface {
                id,
                surface,
                parent,
            } => {
                let surf = surface.data::<Shared<Surface>>().unwrap().clone();
                let par = parent.data::<Shared<Surface>>().unwrap().clone();

                // The parent must be a different surface than the
                // child, and must not be one of the child's
                // descendants (that would make the tree a cycle)
                if surf.ptr_eq(&par) || is_ancestor(&surf, &par) {
                    resource.post_error(
                        wlsc::Error::BadParent,
                        "The parent may not be the surface or one of its descendants",
                    );
                    return;
                }

                // The to-be subsurface must not already have
                // another role
                if surf.lock().s_role.is_some() {
                    resource.post_error(
                        wlsc::Error::BadSurface,
                        "Surface role has already been assigned",
                    );
                    return;
                }

                let sub = Shared::new(SubSurface {
                    su_surface: surf.downgrade(),
                    su_parent: par.downgrade(),
                    su_position: (0, 0),
                    su_pending_position: None,
                    su_sync: true,
                });

                surf.lock().s_role = Some(Role::subsurface(sub.clone()));

                // Adding a subsurface to a parent is double
                // buffered on the parent: it shows up once the
                // parent commits
                par.lock().add_pending_subsurface(sub.clone());

                data_init.init(id, sub);
            }
            wlsc::Request::Destroy => (),
            _ => (),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: ws::backend::ClientId,
        _resource: &wlsc::WlSubcompositor,
        data: &(),
    ) {
    }
}

/// Is `surf` an ancestor of `other` in the subsurface tree?
fn is_ancestor(surf: &Shared<Surface>, other: &Shared<Surface>) -> bool {
    let mut cur = other.clone();
    loop {
        let parent = {
            let s = cur.lock();
            match &s.s_role {
                Some(Role::subsurface(sub)) => sub.lock().su_parent.upgrade(),
                _ => None,
            }
        };
        match parent {
            Some(p) => {
                if p.ptr_eq(surf) {
                    return true;
                }
                cur = p;
            }
            None => return false,
        }
    }
}

/// The double buffered state for a subsurface
///
/// Subsurfaces are really no different than actual surfaces,
/// except this interface is their role and they ride along with
/// their parent's commits.
pub struct SubSurface {
    pub su_surface: WeakRef<Surface>,
    pub su_parent: WeakRef<Surface>,
    /// position relative to the parent, as applied
    pub su_position: (i32, i32),
    /// attached new position to be applied on the parent's commit
    pub su_pending_position: Option<(i32, i32)>,
    /// Sync mode flag. set_desync is accepted and recorded, but
    /// commits always follow the synchronized path.
    #[allow(dead_code)]
    pub su_sync: bool,
}

#[allow(unused_variables)]
impl ws::Dispatch<wlss::WlSubsurface, Shared<SubSurface>> for Tempest {
    fn request(
        state: &mut Self,
        client: &ws::Client,
        resource: &wlss::WlSubsurface,
        request: wlss::Request,
        data: &Shared<SubSurface>,
        dhandle: &ws::DisplayHandle,
        data_init: &mut ws::DataInit<'_, Self>,
    ) {
        match request {
            wlss::Request::SetPosition { x, y } => {
                data.lock().su_pending_position = Some((x, y));
            }
            wlss::Request::SetSync => data.lock().su_sync = true,
            wlss::Request::SetDesync => {
                // Recorded but not honored; desync would need its
                // own path through Surface::commit
                data.lock().su_sync = false;
            }
            wlss::Request::PlaceAbove { .. } | wlss::Request::PlaceBelow { .. } => {
                log::debug!("subsurface restacking is not implemented");
            }
            wlss::Request::Destroy => (),
            _ => (),
        }
    }

    fn destroyed(
        state: &mut Self,
        _client: ws::backend::ClientId,
        _resource: &wlss::WlSubsurface,
        data: &Shared<SubSurface>,
    ) {
        // The role object died: the surface goes back to being
        // role-less and the parent stops composing it
        let parent = data.lock().su_parent.upgrade();
        if let Some(parent) = parent {
            parent.lock().remove_subsurface(data);
        }
        let surf = data.lock().su_surface.upgrade();
        if let Some(surf) = surf {
            surf.lock().s_role = None;
        }
    }
}

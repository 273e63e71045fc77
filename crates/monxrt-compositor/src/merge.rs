//! Z-ordered merging of client stacks into one native present.
//!
//! Per tick: collect every overlay-active client with its z order, prepend
//! the active primary pinned below everything, stable-sort ascending by z,
//! then walk each client's delivered layers in that order and dispatch them
//! to the native compositor.

use tracing::warn;

use crate::slot::ClientSlots;
use crate::{CompositorError, NativeCompositor};

/// One client's entry in the z-order pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientZ {
    pub index: usize,
    pub z_order: i32,
    /// Overlay sessions stack above the primary; exactly one non-overlay
    /// client (the active primary) may be present.
    pub overlay: bool,
}

/// Compute the render order: active primary first (pinned to `i32::MIN`),
/// then overlays ascending by z. The sort is stable, so overlays with equal
/// z keep their slot order.
pub fn z_sorted_order(primary: Option<usize>, overlays: &[ClientZ]) -> Vec<usize> {
    let mut entries: Vec<ClientZ> = Vec::with_capacity(overlays.len() + 1);

    if let Some(index) = primary {
        entries.push(ClientZ {
            index,
            z_order: i32::MIN,
            overlay: false,
        });
    }
    entries.extend(overlays.iter().copied());

    entries.sort_by_key(|entry| entry.z_order);
    entries.into_iter().map(|entry| entry.index).collect()
}

/// Walk `order` and dispatch every delivered layer to the native
/// compositor. `slots` maps a client index to its slot triple.
///
/// A failing layer aborts the present for this tick: the error propagates
/// to the render loop, which logs it and re-synchronizes next tick.
pub fn dispatch_layers<'a>(
    order: &[usize],
    slots: impl Fn(usize) -> Option<&'a ClientSlots>,
    xc: &mut dyn NativeCompositor,
) -> Result<(), CompositorError> {
    for &index in order {
        let Some(client_slots) = slots(index) else {
            warn!(index, "z-order entry without slots, skipping");
            continue;
        };

        client_slots.with_delivered(|delivered| {
            if !delivered.active {
                return Ok::<(), CompositorError>(());
            }
            for entry in &delivered.layers {
                xc.layer(entry, delivered.env_blend_mode)?;
            }
            Ok(())
        })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlay(index: usize, z_order: i32) -> ClientZ {
        ClientZ {
            index,
            z_order,
            overlay: true,
        }
    }

    #[test]
    fn primary_renders_first() {
        let order = z_sorted_order(Some(5), &[overlay(1, 10), overlay(2, 20)]);
        assert_eq!(order, vec![5, 1, 2]);
    }

    #[test]
    fn overlays_sort_ascending_by_z() {
        let order = z_sorted_order(None, &[overlay(0, 30), overlay(1, -5), overlay(2, 10)]);
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn equal_z_keeps_slot_order() {
        let order = z_sorted_order(None, &[overlay(3, 7), overlay(1, 7), overlay(2, 7)]);
        assert_eq!(order, vec![3, 1, 2]);
    }

    #[test]
    fn no_clients_no_order() {
        assert!(z_sorted_order(None, &[]).is_empty());
    }

    #[test]
    fn negative_overlay_z_still_above_primary() {
        let order = z_sorted_order(Some(0), &[overlay(1, i32::MIN + 1)]);
        assert_eq!(order, vec![0, 1]);
    }

    #[test]
    fn dispatch_walks_delivered_layers_in_order() {
        use crate::HeadlessCompositor;
        use monxrt_proto::{BlendMode, LayerEntry, LayerKind, Pose, SpaceKind, SubImageRect};
        use monxrt_timing::FakeTiming;

        let quad = |id: u32| LayerEntry {
            kind: LayerKind::Quad,
            swapchain_ids: [id, 0, 0, 0],
            rects: [SubImageRect::default(); 2],
            pose: Pose::IDENTITY,
            space: SpaceKind::World,
            blend_flags: 0,
        };

        // Two clients with one delivered quad each.
        let slots = vec![ClientSlots::new(), ClientSlots::new()];
        for (i, client) in slots.iter().enumerate() {
            client.begin_progress(1, BlendMode::Opaque);
            client.push_layer(quad(i as u32));
            client.commit_progress();
            client.deliver_any_frame(1);
        }

        let mut xc = HeadlessCompositor::free_run(Box::new(FakeTiming::new(1_000_000, 0)));
        let timing = xc.predict_frame().unwrap();
        xc.mark_woke(timing.frame_id, 0).unwrap();
        xc.begin_frame(timing.frame_id).unwrap();
        xc.layer_begin(timing.frame_id).unwrap();

        // Client 1 below client 0 in this order.
        dispatch_layers(&[1, 0], |i| slots.get(i), &mut xc).unwrap();
        xc.layer_commit(timing.frame_id).unwrap();

        let committed = xc.last_commit();
        assert_eq!(committed.len(), 2);
        assert_eq!(committed[0].0.swapchain_ids[0], 1);
        assert_eq!(committed[1].0.swapchain_ids[0], 0);
    }
}

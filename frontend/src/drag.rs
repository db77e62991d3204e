//! Drag-and-drop reordering of processors.
//!
//! Turns a finished pointer gesture into at most one move request. Collision
//! detection picks the droppable whose corners are closest to the dragged
//! card's corners.

use sushi_console_types::{Insertion, MoveProcessorRequest, ProcessorId, TrackId};

use crate::store::TopologyStore;

/// Screen-space rectangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    fn corners(&self) -> [(f32, f32); 4] {
        let right = self.x + self.width;
        let bottom = self.y + self.height;
        [
            (self.x, self.y),
            (right, self.y),
            (self.x, bottom),
            (right, bottom),
        ]
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.x < other.x + other.width
            && other.x < self.x + self.width
            && self.y < other.y + other.height
            && other.y < self.y + self.height
    }

    /// Sum of distances between matching corners.
    fn corner_distance(&self, other: &Rect) -> f32 {
        self.corners()
            .iter()
            .zip(other.corners().iter())
            .map(|(a, b)| ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt())
            .sum()
    }
}

/// What a droppable region stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropTarget {
    /// The body of a track, outside any processor card
    Track(TrackId),
    /// A processor card (and the drop zone right before it)
    Processor {
        processor_id: ProcessorId,
        track_id: TrackId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Droppable {
    pub target: DropTarget,
    pub rect: Rect,
    /// Stacking order; higher is on top
    pub z_index: i32,
}

/// Nearest-corner collision among the droppables the dragged rectangle
/// overlaps. Equal distances go to the topmost droppable.
pub fn nearest_corner(dragged: &Rect, droppables: &[Droppable]) -> Option<DropTarget> {
    droppables
        .iter()
        .filter(|d| d.rect.intersects(dragged))
        .map(|d| (d.rect.corner_distance(dragged), d))
        .min_by(|(da, a), (db, b)| da.total_cmp(db).then(b.z_index.cmp(&a.z_index)))
        .map(|(_, d)| d.target)
}

/// The processor being dragged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveDrag {
    pub processor_id: ProcessorId,
    pub source_track_id: TrackId,
}

/// Gesture state for processor drags.
#[derive(Debug, Default)]
pub struct DragReorder {
    active: Option<ActiveDrag>,
}

impl DragReorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, processor_id: ProcessorId, source_track_id: TrackId) {
        self.active = Some(ActiveDrag {
            processor_id,
            source_track_id,
        });
    }

    pub fn active(&self) -> Option<ActiveDrag> {
        self.active
    }

    /// Whether this processor should be drawn in its dragging style.
    pub fn is_dragging(&self, processor_id: ProcessorId) -> bool {
        self.active
            .is_some_and(|a| a.processor_id == processor_id)
    }

    pub fn cancel(&mut self) {
        self.active = None;
    }

    /// Finish the gesture. The dragging state is cleared whatever the
    /// outcome.
    pub fn end(
        &mut self,
        dragged: Rect,
        droppables: &[Droppable],
        store: &TopologyStore,
    ) -> Option<MoveProcessorRequest> {
        let drag = self.active.take()?;
        let target = nearest_corner(&dragged, droppables)?;
        translate(drag, target, store)
    }
}

/// Map a drop onto a move request. `None` when the drop changes nothing.
pub fn translate(
    drag: ActiveDrag,
    target: DropTarget,
    store: &TopologyStore,
) -> Option<MoveProcessorRequest> {
    let source = store.track(drag.source_track_id)?;
    let index = source.processor_index(drag.processor_id)?;

    let (dest_track_id, insertion) = match target {
        DropTarget::Processor {
            processor_id,
            track_id,
        } => {
            if processor_id == drag.processor_id {
                return None;
            }
            // Dropping in front of the next card keeps the current position
            let next = source.processors.get(index + 1).map(|p| p.id);
            if track_id == drag.source_track_id && next == Some(processor_id) {
                return None;
            }
            (track_id, Insertion::BeforeProcessor(processor_id))
        }
        DropTarget::Track(track_id) => {
            if track_id == drag.source_track_id {
                return None;
            }
            (track_id, Insertion::End)
        }
    };

    store.track(dest_track_id)?;
    Some(MoveProcessorRequest {
        processor_id: drag.processor_id,
        source_track_id: drag.source_track_id,
        dest_track_id,
        insertion,
    })
}

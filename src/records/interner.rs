//! Managed-frame interning.
//!
//! Equal `(function, file, line)` triples share one dense `u32` id. The
//! writer owns one table for the capture session and emits each frame once
//! as a FRAME_INDEX record; the reader rebuilds an identical table from
//! those records.

use std::collections::HashMap;

use crate::records::ManagedFrame;

/// Dense id assigned to an interned frame.
pub type FrameId = u32;

/// Bijection between unique managed frames and `0..len()`.
pub struct FrameInterner {
    ids: HashMap<ManagedFrame, FrameId>,
    frames: Vec<ManagedFrame>,
}

impl FrameInterner {
    pub fn new() -> Self {
        Self { ids: HashMap::new(), frames: Vec::new() }
    }

    /// Intern a frame; returns its id and whether it was first seen now.
    pub fn intern(&mut self, frame: &ManagedFrame) -> (FrameId, bool) {
        if let Some(&id) = self.ids.get(frame) {
            return (id, false);
        }
        let id = self.frames.len() as FrameId;
        self.frames.push(frame.clone());
        self.ids.insert(frame.clone(), id);
        (id, true)
    }

    /// Insert a frame under an explicit id, as read from a FRAME_INDEX
    /// record. Ids arrive densely in order; gaps mean a corrupt stream and
    /// are tolerated by padding with placeholder frames.
    pub fn insert_with_id(&mut self, id: FrameId, frame: ManagedFrame) {
        while (self.frames.len() as FrameId) < id {
            let filler = ManagedFrame::new("<unknown>", "<unknown>", 0);
            self.ids.entry(filler.clone()).or_insert(self.frames.len() as FrameId);
            self.frames.push(filler);
        }
        if (id as usize) < self.frames.len() {
            self.frames[id as usize] = frame;
        } else {
            self.ids.insert(frame.clone(), id);
            self.frames.push(frame);
        }
    }

    /// Look up a frame by id.
    pub fn get(&self, id: FrameId) -> Option<&ManagedFrame> {
        self.frames.get(id as usize)
    }

    /// Number of unique frames interned so far.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl Default for FrameInterner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_dense_and_stable() {
        let mut interner = FrameInterner::new();
        let f1 = ManagedFrame::new("main", "app.py", 1);
        let f2 = ManagedFrame::new("helper", "app.py", 10);

        let (id1, new1) = interner.intern(&f1);
        let (id2, new2) = interner.intern(&f2);
        let (id1_again, new_again) = interner.intern(&f1);

        assert_eq!((id1, new1), (0, true));
        assert_eq!((id2, new2), (1, true));
        assert_eq!((id1_again, new_again), (0, false));
        assert_eq!(interner.len(), 2);
    }

    #[test]
    fn test_line_participates_in_identity() {
        let mut interner = FrameInterner::new();
        let (a, _) = interner.intern(&ManagedFrame::new("f", "m.py", 3));
        let (b, _) = interner.intern(&ManagedFrame::new("f", "m.py", 4));
        assert_ne!(a, b);
    }

    #[test]
    fn test_rebuild_from_explicit_ids() {
        let mut interner = FrameInterner::new();
        interner.insert_with_id(0, ManagedFrame::new("a", "x.py", 1));
        interner.insert_with_id(1, ManagedFrame::new("b", "x.py", 2));
        assert_eq!(interner.get(1).unwrap().function, "b");
        assert_eq!(interner.get(2), None);
    }
}

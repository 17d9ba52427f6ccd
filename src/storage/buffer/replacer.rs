use std::sync::Mutex;

use crate::storage::page::FrameId;

/// Replacer tracks page frames for replacement in case the buffer pool is
/// full. Only frames with no outstanding pins are tracked; the buffer pool
/// is responsible for calling pin/unpin as pin counts change.
pub trait Replacer: Send + Sync {
    /// Remove and return the least recently unpinned frame, or None if no
    /// frame is currently a candidate.
    fn victim(&self) -> Option<FrameId>;

    /// Remove the frame from the candidate set if present, do nothing
    /// otherwise. Called after a frame's pin count rises above zero.
    fn pin(&self, frame_id: FrameId);

    /// Add the frame as the most recently unpinned candidate. If the frame
    /// is already tracked this is a no-op and its position is unchanged.
    fn unpin(&self, frame_id: FrameId);

    /// Number of candidate frames.
    fn size(&self) -> usize;
}

struct Node {
    prev: Option<FrameId>,
    next: Option<FrameId>,
}

/// LruReplacer implements the least-recently-used replacement policy over
/// frame ids.
///
/// The candidate order is kept in a doubly-linked list threaded through a
/// side table indexed by frame id, so victim, pin and unpin are all O(1).
/// Since frame ids are dense in `[0, num_frames)`, the side table is a plain
/// vector and the frame id is its own table key.
pub struct LruReplacer {
    /// frame id -> list node; None when the frame is not a candidate.
    nodes: Vec<Option<Node>>,
    /// Least recently unpinned frame, the next victim.
    head: Option<FrameId>,
    /// Most recently unpinned frame.
    tail: Option<FrameId>,
    size: usize,
}

impl LruReplacer {
    pub fn new(num_frames: usize) -> Self {
        let mut nodes = Vec::with_capacity(num_frames);
        nodes.resize_with(num_frames, || None);
        LruReplacer { nodes, head: None, tail: None, size: 0 }
    }

    fn victim(&mut self) -> Option<FrameId> {
        let frame_id = self.head?;
        self.unlink(frame_id);
        Some(frame_id)
    }

    fn pin(&mut self, frame_id: FrameId) {
        if frame_id >= self.nodes.len() || self.nodes[frame_id].is_none() {
            return;
        }
        self.unlink(frame_id);
    }

    fn unpin(&mut self, frame_id: FrameId) {
        if frame_id >= self.nodes.len() {
            return;
        }
        // already a candidate: keep its position
        if self.nodes[frame_id].is_some() {
            return;
        }
        let node = Node { prev: self.tail, next: None };
        match self.tail {
            Some(tail) => {
                self.nodes[tail].as_mut().unwrap().next = Some(frame_id);
            }
            None => self.head = Some(frame_id),
        }
        self.tail = Some(frame_id);
        self.nodes[frame_id] = Some(node);
        self.size += 1;
    }

    fn size(&self) -> usize {
        self.size
    }

    fn unlink(&mut self, frame_id: FrameId) {
        let node = self.nodes[frame_id].take().unwrap();
        match node.prev {
            Some(prev) => self.nodes[prev].as_mut().unwrap().next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => self.nodes[next].as_mut().unwrap().prev = node.prev,
            None => self.tail = node.prev,
        }
        self.size -= 1;
    }
}

/// SyncLruReplacer implements the thread-safe version of the LRU policy,
/// basically all the heavy lifting happens in the LruReplacer.
///
/// The internal mutex is a leaf latch: no method calls back into the buffer
/// pool while holding it.
pub struct SyncLruReplacer {
    inner: Mutex<LruReplacer>,
}

impl SyncLruReplacer {
    pub fn new(num_frames: usize) -> Self {
        let inner = Mutex::new(LruReplacer::new(num_frames));
        SyncLruReplacer { inner }
    }
}

impl Replacer for SyncLruReplacer {
    fn victim(&self) -> Option<FrameId> {
        let mut guard = self.inner.lock().unwrap();
        guard.victim()
    }

    fn pin(&self, frame_id: FrameId) {
        let mut guard = self.inner.lock().unwrap();
        guard.pin(frame_id)
    }

    fn unpin(&self, frame_id: FrameId) {
        let mut guard = self.inner.lock().unwrap();
        guard.unpin(frame_id)
    }

    fn size(&self) -> usize {
        let guard = self.inner.lock().unwrap();
        guard.size()
    }
}

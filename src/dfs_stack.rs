//! Framed depth-first stack.
//!
//! Items of the current frame are the candidates still to visit. Entering a
//! frame means the item on top of the previous frame is being explored; the
//! tops of all lower frames therefore form the current search path.

#[derive(Debug, Clone)]
pub struct DfsStack<T> {
    items: Vec<T>,
    frames: Vec<usize>,
}

impl<T> Default for DfsStack<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            frames: Vec::new(),
        }
    }
}

impl<T: Copy> DfsStack<T> {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn push(&mut self, item: T) {
        self.items.push(item);
    }

    /// Top of the current frame, `None` when the frame is exhausted
    #[inline]
    pub fn top(&self) -> Option<T> {
        if self.frame_size() > 0 {
            self.items.last().copied()
        } else {
            None
        }
    }

    #[inline]
    pub fn pop(&mut self) -> Option<T> {
        if self.frame_size() > 0 {
            self.items.pop()
        } else {
            None
        }
    }

    /// Start exploring the current top
    #[inline]
    pub fn enter(&mut self) {
        self.frames.push(self.items.len());
    }

    /// Close the current frame, dropping what is left in it
    #[inline]
    pub fn leave(&mut self) {
        if let Some(start) = self.frames.pop() {
            self.items.truncate(start);
        }
    }

    /// The state whose exploration opened the current frame
    #[inline]
    pub fn parent(&self) -> Option<T> {
        let start = self.frames.last()?.checked_sub(1)?;
        self.items.get(start).copied()
    }

    #[inline]
    pub fn frame_size(&self) -> usize {
        self.items.len() - self.frames.last().copied().unwrap_or(0)
    }

    pub fn nframes(&self) -> usize {
        self.frames.len()
    }

    /// Total items over all frames
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items being explored, from the bottom frame up
    pub fn path(&self) -> impl Iterator<Item = T> + '_ {
        self.frames
            .iter()
            .filter(|start| **start > 0)
            .map(move |start| self.items[start - 1])
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.frames.clear();
    }
}

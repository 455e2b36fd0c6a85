//! The value cell a stage's handlers write their outcome into.

/// A value cell that remembers whether it has been written.
///
/// Every [`write`](Slot::write) marks the slot dirty, even when the new value
/// equals the old one. A stage whose slot is still clean after all handlers
/// ran falls through to the orchestrator's default behavior.
#[derive(Debug, Clone)]
pub struct Slot<T> {
    value: Option<T>,
    dirty: bool,
    writes: u32,
}

impl<T> Slot<T> {
    /// Create an empty, clean slot.
    pub fn new() -> Self {
        Self {
            value: None,
            dirty: false,
            writes: 0,
        }
    }

    /// Seed a slot with an existing value and dirtiness.
    pub(crate) fn seeded(value: Option<T>, dirty: bool) -> Self {
        Self {
            value,
            dirty,
            writes: 0,
        }
    }

    /// Read the current value and whether the slot is dirty.
    pub fn read(&self) -> (Option<&T>, bool) {
        (self.value.as_ref(), self.dirty)
    }

    /// Current value, if any.
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Whether any handler has written the slot during this stage.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write a value and mark the slot dirty.
    pub fn write(&mut self, value: T) {
        self.value = Some(value);
        self.dirty = true;
        self.writes = self.writes.saturating_add(1);
    }

    /// Whether this instance was written since it was seeded.
    pub(crate) fn written(&self) -> bool {
        self.writes > 0
    }

    /// Consume the slot, returning its value.
    pub fn into_value(self) -> Option<T> {
        self.value
    }
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self::new()
    }
}

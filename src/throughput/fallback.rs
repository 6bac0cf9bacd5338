//! Ordered fallback candidates for one direction.

/// Forward-only cursor over candidate URLs.
///
/// Not shared: a run owns one list per direction and mutates it from its
/// event loop only.
#[derive(Debug, Clone)]
pub struct EndpointList {
    candidates: Vec<String>,
    cursor: usize,
}

impl EndpointList {
    pub fn new(candidates: Vec<String>) -> Self {
        Self {
            candidates,
            cursor: 0,
        }
    }

    /// The candidate to try now, or `None` for an empty list.
    pub fn current(&self) -> Option<&str> {
        self.candidates.get(self.cursor).map(String::as_str)
    }

    /// Move to the next candidate. Returns `false` (cursor unchanged) when
    /// the list is exhausted.
    pub fn advance(&mut self) -> bool {
        if self.cursor + 1 < self.candidates.len() {
            self.cursor += 1;
            true
        } else {
            false
        }
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

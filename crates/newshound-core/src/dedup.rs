use std::collections::HashSet;

/// Insertion-ordered URL set scoped to one discovery run.
#[derive(Debug, Clone, Default)]
pub struct LinkDeduper {
    seen: HashSet<String>,
    ordered: Vec<String>,
}

impl LinkDeduper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when `url` had not been seen before in this run.
    pub fn add(&mut self, url: impl Into<String>) -> bool {
        let url = url.into();
        if self.seen.contains(&url) {
            return false;
        }
        self.seen.insert(url.clone());
        self.ordered.push(url);
        true
    }

    pub fn contains(&self, url: &str) -> bool {
        self.seen.contains(url)
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.ordered.iter().map(String::as_str)
    }

    pub fn into_vec(self) -> Vec<String> {
        self.ordered
    }
}

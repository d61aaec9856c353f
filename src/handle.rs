/// Versioned reference to a dependency-graph node.
///
/// A handle names an arena slot together with the generation it was created
/// in. The slot's version is bumped every time it completes and is freed, so
/// a stale handle self-detects: [`DependencyGraph::is_complete`] reports
/// `true` as soon as the stored version no longer matches.
///
/// The version is 8 bits wide; after 256 reuse generations of the same slot
/// an old handle can collide with a live one. This wraparound is a known,
/// documented limitation of the scheme.
///
/// [`DependencyGraph::is_complete`]: crate::graph::DependencyGraph::is_complete
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Handle {
    id: u32,
    version: u8,
}

impl Default for Handle {
    fn default() -> Self {
        Self::INVALID
    }
}

impl Handle {
    /// Placeholder stored in a descriptor before its node is published.
    /// Never escapes to callers and never reaches the graph.
    pub(crate) const INVALID: Self = Self {
        id: u32::MAX,
        version: 0,
    };

    pub(crate) fn new(id: u32, version: u8) -> Self {
        debug_assert!(id < 1 << 24, "Handle::new: id exceeds 24 bits");
        Self { id, version }
    }

    pub(crate) fn id(self) -> u32 {
        self.id
    }

    pub(crate) fn version(self) -> u8 {
        self.version
    }
}

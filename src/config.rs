//! Configuration options for the embertable write buffer.

/// Default budget for the hot zone of the insertion chain (1MB).
pub const DEFAULT_HOT_THRESHOLD: usize = 1024 * 1024;

/// Default block granularity of the backing arena (4KB).
pub const DEFAULT_ARENA_BLOCK_SIZE: usize = 4 * 1024;

/// Configuration options for constructing a MemTable.
#[derive(Debug, Clone)]
pub struct Options {
    /// Byte budget for the hot zone of the insertion chain.
    ///
    /// Entries whose cumulative size stays within this budget remain hot
    /// and are recycled into the successor MemTable at flush time; the
    /// overflow is frozen into the cold zone and spilled to disk.
    /// A threshold of 0 classifies all data as cold.
    /// Default: 1MB
    pub hot_threshold_bytes: usize,

    /// Block size used by the backing arena allocator (in bytes).
    /// Default: 4KB
    pub arena_block_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            hot_threshold_bytes: DEFAULT_HOT_THRESHOLD,
            arena_block_size: DEFAULT_ARENA_BLOCK_SIZE,
        }
    }
}

impl Options {
    /// Creates a new Options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the hot zone byte budget.
    pub fn hot_threshold_bytes(mut self, bytes: usize) -> Self {
        self.hot_threshold_bytes = bytes;
        self
    }

    /// Sets the arena block size.
    pub fn arena_block_size(mut self, bytes: usize) -> Self {
        self.arena_block_size = bytes;
        self
    }

    /// Validates the options and returns an error if any are invalid.
    pub fn validate(&self) -> crate::Result<()> {
        if self.arena_block_size == 0 {
            return Err(crate::Error::invalid_argument("arena_block_size must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = Options::default();
        assert_eq!(opts.hot_threshold_bytes, DEFAULT_HOT_THRESHOLD);
        assert_eq!(opts.arena_block_size, DEFAULT_ARENA_BLOCK_SIZE);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_options_builder() {
        let opts = Options::new().hot_threshold_bytes(300).arena_block_size(8 * 1024);
        assert_eq!(opts.hot_threshold_bytes, 300);
        assert_eq!(opts.arena_block_size, 8 * 1024);
    }

    #[test]
    fn test_options_validation() {
        // A zero hot threshold is legal: everything is cold.
        let opts = Options::new().hot_threshold_bytes(0);
        assert!(opts.validate().is_ok());

        let opts = Options::new().arena_block_size(0);
        assert!(opts.validate().is_err());
    }
}

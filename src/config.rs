//! Configuration for blobheap
//!
//! Centralized configuration with sensible defaults.

/// One month in milliseconds, the default per-file age limit
pub const ONE_MONTH_MS: i64 = 1000 * 60 * 60 * 24 * 365 / 12;

/// Largest allowed heap file: bounded by the 32-bit record length field
pub const MAX_FILE_SIZE: u64 = i32::MAX as u64;

/// Configuration for an [`ArrayStack`](crate::stack::ArrayStack) instance
#[derive(Debug, Clone)]
pub struct StackConfig {
    // -------------------------------------------------------------------------
    // Record Layout
    // -------------------------------------------------------------------------
    /// Fixed length of every key in the stack's heap files.
    /// Shorter keys are zero-padded, longer keys truncated, once per operation.
    pub key_length: usize,

    // -------------------------------------------------------------------------
    // Write Buffering
    // -------------------------------------------------------------------------
    /// Write-buffer cap (bytes) for the newest, writable heap file.
    /// Zero opens even the newest file read/delete-only.
    pub buffer_max: usize,

    // -------------------------------------------------------------------------
    // Rollover Limits (per file)
    // -------------------------------------------------------------------------
    /// A new member file is started when the current one is older than this
    /// (milliseconds).
    pub file_age_limit_ms: i64,

    /// A new member file is started when the current one is larger than this
    /// (bytes).
    pub file_size_limit: u64,

    // -------------------------------------------------------------------------
    // Eviction Limits (whole repository)
    // -------------------------------------------------------------------------
    /// Oldest member files are dropped once they age beyond this (milliseconds).
    pub repository_age_max_ms: i64,

    /// Oldest member files are dropped while the total size exceeds this (bytes).
    pub repository_size_max: u64,

    // -------------------------------------------------------------------------
    // Startup Policy
    // -------------------------------------------------------------------------
    /// Delete a member file that cannot be opened instead of failing startup.
    pub delete_on_fail: bool,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            key_length: 12,
            buffer_max: 512 * 1024,
            file_age_limit_ms: ONE_MONTH_MS,
            file_size_limit: MAX_FILE_SIZE,
            repository_age_max_ms: i64::MAX,
            repository_size_max: u64::MAX,
            delete_on_fail: false,
        }
    }
}

impl StackConfig {
    /// Create a new config builder
    pub fn builder() -> StackConfigBuilder {
        StackConfigBuilder::default()
    }

    /// Set a repository-wide age budget and derive the per-file limit from it:
    /// a tenth of the budget per file, capped at one month.
    pub fn max_age_ms(mut self, max_age_ms: i64) -> Self {
        self.repository_age_max_ms = max_age_ms;
        self.file_age_limit_ms = ONE_MONTH_MS.min(max_age_ms / 10);
        self
    }

    /// Set a repository-wide size budget and derive the per-file limit from it:
    /// a hundredth of the budget per file, capped at the codec maximum.
    pub fn max_size(mut self, max_size: u64) -> Self {
        self.repository_size_max = max_size;
        self.file_size_limit = MAX_FILE_SIZE.min(max_size / 100);
        self
    }
}

/// Builder for StackConfig
#[derive(Default)]
pub struct StackConfigBuilder {
    config: StackConfig,
}

impl StackConfigBuilder {
    /// Set the fixed key length
    pub fn key_length(mut self, len: usize) -> Self {
        self.config.key_length = len;
        self
    }

    /// Set the write-buffer cap for the newest file (in bytes)
    pub fn buffer_max(mut self, bytes: usize) -> Self {
        self.config.buffer_max = bytes;
        self
    }

    /// Set the per-file age limit (in milliseconds)
    pub fn file_age_limit_ms(mut self, ms: i64) -> Self {
        self.config.file_age_limit_ms = ms;
        self
    }

    /// Set the per-file size limit (in bytes)
    pub fn file_size_limit(mut self, bytes: u64) -> Self {
        self.config.file_size_limit = bytes;
        self
    }

    /// Set the repository age maximum (in milliseconds)
    pub fn repository_age_max_ms(mut self, ms: i64) -> Self {
        self.config.repository_age_max_ms = ms;
        self
    }

    /// Set the repository size maximum (in bytes)
    pub fn repository_size_max(mut self, bytes: u64) -> Self {
        self.config.repository_size_max = bytes;
        self
    }

    /// Delete unreadable member files at startup instead of failing
    pub fn delete_on_fail(mut self, yes: bool) -> Self {
        self.config.delete_on_fail = yes;
        self
    }

    pub fn build(self) -> StackConfig {
        self.config
    }
}

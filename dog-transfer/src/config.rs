use std::path::PathBuf;

use crate::{RetryConfig, TransferError, TransferResult};

/// Default block size for chunked uploads (4 MiB)
pub const DEFAULT_BLOCK_SIZE: u64 = 4 * 1024 * 1024;

/// Default number of concurrent block transfers
pub const DEFAULT_PARALLELISM: usize = 16;

/// Default reopen budget for a single download
pub const DEFAULT_READ_RETRIES: u32 = 20;

/// Configuration for transfer operations
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Size of each uploaded block (bytes)
    pub block_size: u64,

    /// Maximum concurrent block transfers
    pub parallelism: usize,

    /// Sources of at most this many bytes are written with a single put
    pub single_put_threshold: u64,

    /// Retry policy applied to each block transfer
    pub block_retry: RetryConfig,

    /// How many times a download may reopen its stream
    pub read_retries: u32,

    /// Backoff between download reopen attempts
    pub read_retry: RetryConfig,

    /// Max results per listing page; the store default when `None`
    pub page_size: Option<u32>,

    /// Directory holding the local scratch file
    pub scratch_dir: PathBuf,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            parallelism: DEFAULT_PARALLELISM,
            single_put_threshold: DEFAULT_BLOCK_SIZE,
            block_retry: RetryConfig::default(),
            read_retries: DEFAULT_READ_RETRIES,
            read_retry: RetryConfig::new(DEFAULT_READ_RETRIES + 1),
            page_size: None,
            scratch_dir: std::env::temp_dir(),
        }
    }
}

impl TransferConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load overrides from `DOG_TRANSFER__*` environment variables.
    ///
    /// ```bash
    /// export DOG_TRANSFER__BLOCK_SIZE=8388608
    /// export DOG_TRANSFER__PARALLELISM=4
    /// ```
    pub fn from_env() -> TransferResult<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Same as [`from_env`](Self::from_env) over an explicit set of variables
    pub fn from_vars<I, K, V>(vars: I) -> TransferResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in vars {
            let Some(stripped) = key.as_ref().strip_prefix("DOG_TRANSFER__") else {
                continue;
            };
            let value = value.as_ref();
            match stripped.to_lowercase().as_str() {
                "block_size" => config = config.with_block_size(parse(stripped, value)?),
                "parallelism" => config.parallelism = parse(stripped, value)?,
                "read_retries" => config = config.with_read_retries(parse(stripped, value)?),
                "page_size" => config.page_size = Some(parse(stripped, value)?),
                "scratch_dir" => config.scratch_dir = PathBuf::from(value),
                _ => {}
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Set block size; the single-put threshold follows it
    pub fn with_block_size(mut self, bytes: u64) -> Self {
        self.block_size = bytes;
        self.single_put_threshold = bytes;
        self
    }

    /// Set max concurrent block transfers
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Set the largest source written with a single put
    pub fn with_single_put_threshold(mut self, bytes: u64) -> Self {
        self.single_put_threshold = bytes;
        self
    }

    /// Set retry policy for each block
    pub fn with_block_retry(mut self, retry: RetryConfig) -> Self {
        self.block_retry = retry;
        self
    }

    /// Set the reopen budget; the read backoff allows one extra attempt for the initial open
    pub fn with_read_retries(mut self, retries: u32) -> Self {
        self.read_retries = retries;
        self.read_retry.max_attempts = retries.saturating_add(1);
        self
    }

    /// Set backoff between download reopens
    pub fn with_read_backoff(mut self, retry: RetryConfig) -> Self {
        self.read_retry = RetryConfig {
            max_attempts: self.read_retries.saturating_add(1),
            ..retry
        };
        self
    }

    /// Set max results per listing page
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    /// Set directory for the scratch file
    pub fn with_scratch_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    /// Drop all backoff delays (tests, local stores)
    pub fn without_backoff(mut self) -> Self {
        self.block_retry = self.block_retry.immediate();
        self.read_retry = self.read_retry.immediate();
        self
    }

    /// Reject zero block size, parallelism or page size
    pub fn validate(&self) -> TransferResult<()> {
        if self.block_size == 0 {
            return Err(TransferError::invalid("block_size must be greater than zero"));
        }
        if self.parallelism == 0 {
            return Err(TransferError::invalid("parallelism must be greater than zero"));
        }
        if self.page_size == Some(0) {
            return Err(TransferError::invalid("page_size must be greater than zero"));
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> TransferResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| TransferError::invalid(format!("DOG_TRANSFER__{} has invalid value {:?}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = TransferConfig::default();
        assert_eq!(config.block_size, 4 * 1024 * 1024);
        assert_eq!(config.parallelism, 16);
        assert_eq!(config.read_retries, 20);
        assert_eq!(config.single_put_threshold, config.block_size);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = TransferConfig::from_vars([
            ("DOG_TRANSFER__BLOCK_SIZE", "1024"),
            ("DOG_TRANSFER__PARALLELISM", "4"),
            ("DOG_TRANSFER__READ_RETRIES", "5"),
            ("UNRELATED", "x"),
        ])
        .unwrap();

        assert_eq!(config.block_size, 1024);
        assert_eq!(config.single_put_threshold, 1024);
        assert_eq!(config.parallelism, 4);
        assert_eq!(config.read_retries, 5);
        assert_eq!(config.read_retry.max_attempts, 6);
    }

    #[test]
    fn bad_env_values_are_rejected() {
        let err = TransferConfig::from_vars([("DOG_TRANSFER__PARALLELISM", "lots")]).unwrap_err();
        assert!(matches!(err, TransferError::Invalid { .. }));

        let err = TransferConfig::from_vars([("DOG_TRANSFER__BLOCK_SIZE", "0")]).unwrap_err();
        assert!(matches!(err, TransferError::Invalid { .. }));
    }
}

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::pin::Pin;

use crate::{StoreResult, TransferError, TransferResult};

/// Body of a blob read from a store
pub type BodyStream = Pin<Box<dyn Stream<Item = StoreResult<Bytes>> + Send>>;

/// Name of a remote container.
///
/// Lowercase ASCII letters, digits and single hyphens, 3 to 63 characters,
/// starting and ending with a letter or digit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerName(String);

impl ContainerName {
    pub fn new<S: Into<String>>(name: S) -> TransferResult<Self> {
        let name = name.into();
        let bytes = name.as_bytes();
        let valid_char = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-';

        if !(3..=63).contains(&bytes.len()) {
            return Err(TransferError::invalid(format!(
                "Container name {:?} must be 3-63 characters",
                name
            )));
        }
        if !bytes.iter().all(valid_char) {
            return Err(TransferError::invalid(format!(
                "Container name {:?} may only hold lowercase letters, digits and hyphens",
                name
            )));
        }
        if bytes[0] == b'-' || bytes[bytes.len() - 1] == b'-' || name.contains("--") {
            return Err(TransferError::invalid(format!(
                "Container name {:?} has a misplaced hyphen",
                name
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContainerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a blob, unique within its container
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobName(String);

impl BlobName {
    pub fn new<S: Into<String>>(name: S) -> TransferResult<Self> {
        let name = name.into();
        if name.is_empty() || name.len() > 1024 {
            return Err(TransferError::invalid("Blob name must be 1-1024 characters"));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BlobName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Number of digits in a block identifier
pub const BLOCK_ID_WIDTH: usize = 8;

/// Most blocks a single blob can be planned into
pub const MAX_BLOCK_COUNT: u64 = 100_000_000;

/// Identifier of one block within a blob.
///
/// A fixed-width zero-padded decimal ordinal. The width is a multiple of four
/// and digits belong to the base64 alphabet, so the identifier is valid base64
/// text as-is, and lexicographic order equals block order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(String);

impl BlockId {
    pub fn from_index(index: u32) -> Self {
        Self(format!("{:0width$}", index, width = BLOCK_ID_WIDTH))
    }

    /// Parse an identifier produced by [`from_index`](Self::from_index)
    pub fn parse(id: &str) -> TransferResult<Self> {
        if id.len() != BLOCK_ID_WIDTH || !id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TransferError::invalid(format!("Malformed block id {:?}", id)));
        }
        Ok(Self(id.to_string()))
    }

    pub fn index(&self) -> u32 {
        // Only constructed from validated digits, so parsing cannot fail.
        self.0.parse().unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One planned block: where its bytes live in the source and what it is called
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPlan {
    pub index: u32,
    pub id: BlockId,
    pub range: Range<u64>,
}

impl BlockPlan {
    pub fn len(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// Transfer status of a block during an upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockStatus {
    Pending,
    InFlight,
    Acknowledged,
    Failed,
}

/// Visibility state of a blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobState {
    Uncommitted,
    Committed,
}

/// Opaque listing cursor. Empty means the listing is exhausted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageToken(String);

impl PageToken {
    /// The token that starts a listing
    pub fn start() -> Self {
        Self(String::new())
    }

    pub fn new<S: Into<String>>(token: S) -> Self {
        Self(token.into())
    }

    pub fn from_option(token: Option<String>) -> Self {
        Self(token.unwrap_or_default())
    }

    pub fn is_exhausted(&self) -> bool {
        self.0.is_empty()
    }

    /// `None` for the empty token, as most wire formats expect
    pub fn as_option(&self) -> Option<&str> {
        if self.0.is_empty() {
            None
        } else {
            Some(&self.0)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A blob as reported by a listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobDescriptor {
    pub name: BlobName,
    pub size_bytes: u64,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// One page of a listing
#[derive(Debug, Clone, Default)]
pub struct BlobPage {
    pub blobs: Vec<BlobDescriptor>,
    pub next: PageToken,
}

/// Result of opening a blob for reading
pub struct BlobRead {
    pub body: BodyStream,
    /// Size of the whole blob, independent of the requested range
    pub total_size: u64,
}

/// Resolved account credentials handed to a store
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub account: String,
    pub secret: String,
}

impl Credentials {
    pub fn new<A: Into<String>, S: Into<String>>(account: A, secret: S) -> TransferResult<Self> {
        let account = account.into();
        let secret = secret.into();
        if account.trim().is_empty() || secret.trim().is_empty() {
            return Err(TransferError::credential("Account and access secret must both be set"));
        }
        Ok(Self { account, secret })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("account", &self.account)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    #[test]
    fn container_names_follow_naming_rules() {
        assert!(ContainerName::new("quickstart-42").is_ok());
        assert!(ContainerName::new("ab").is_err());
        assert!(ContainerName::new("Upper").is_err());
        assert!(ContainerName::new("-leading").is_err());
        assert!(ContainerName::new("trailing-").is_err());
        assert!(ContainerName::new("double--hyphen").is_err());
        assert!(ContainerName::new("a".repeat(64)).is_err());
    }

    #[test]
    fn block_ids_are_valid_base64_and_round_trip_their_index() {
        for index in [0, 1, 9, 10, 4095, 49_999] {
            let id = BlockId::from_index(index);
            assert_eq!(id.as_str().len(), BLOCK_ID_WIDTH);
            assert!(base64::engine::general_purpose::STANDARD.decode(id.as_str()).is_ok());
            assert_eq!(id.index(), index);
            assert_eq!(BlockId::parse(id.as_str()).unwrap(), id);
        }
        assert!(BlockId::parse("12").is_err());
        assert!(BlockId::parse("0000000a").is_err());
    }

    #[test]
    fn empty_page_token_means_exhausted() {
        assert!(PageToken::start().is_exhausted());
        assert!(PageToken::from_option(None).is_exhausted());
        assert!(!PageToken::new("next").is_exhausted());
        assert_eq!(PageToken::new("next").as_option(), Some("next"));
    }

    #[test]
    fn credentials_reject_blank_values_and_redact_secret() {
        assert!(matches!(
            Credentials::new("account", " "),
            Err(TransferError::Credential { .. })
        ));
        let creds = Credentials::new("account", "hunter2").unwrap();
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }
}

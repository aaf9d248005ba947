//! Core vocabulary types for toolcrib.
//!
//! Identifiers and quantities use smart constructors so that a value, once
//! constructed, is valid everywhere it travels. Parsing happens at the edge;
//! the workflow never re-checks shape.

use std::fmt;
use std::str::FromStr;

use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a physical resource in the shared pool.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        TryFrom,
        Serialize,
        Deserialize
    )
)]
pub struct ResourceId(String);

/// Owning project of a resource; the first half of a sequence partition.
///
/// Restricted to ASCII alphanumerics and underscores so it can be embedded
/// in a hyphen-delimited reference number and parsed back out.
#[nutype(
    sanitize(trim),
    validate(
        not_empty,
        len_char_max = 32,
        predicate = |key: &str| key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    ),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        TryFrom,
        Serialize,
        Deserialize
    )
)]
pub struct PartitionKey(String);

/// Identity of a person acting on the workflow.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 128),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        TryFrom,
        Serialize,
        Deserialize
    )
)]
pub struct ActorId(String);

/// Identifier of a batch reservation.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    AsRef,
    Display,
    Into,
    Serialize,
    Deserialize
))]
pub struct BatchId(Uuid);

impl BatchId {
    /// Generates a fresh time-ordered identifier.
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7())
    }
}

/// Identifier of one line within a batch.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    AsRef,
    Display,
    Into,
    Serialize,
    Deserialize
))]
pub struct BatchItemId(Uuid);

impl BatchItemId {
    /// Generates a fresh time-ordered identifier.
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7())
    }
}

/// A monetary amount in minor currency units (e.g. cents).
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Into,
    Serialize,
    Deserialize
))]
pub struct Money(u64);

impl Money {
    /// Builds an amount from whole currency units.
    pub fn from_major(units: u64) -> Self {
        Self::new(units.saturating_mul(100))
    }

    /// Returns the amount in minor units.
    pub fn minor_units(self) -> u64 {
        self.into_inner()
    }
}

/// A number issued by the sequence counter. Always at least 1.
#[nutype(
    validate(greater_or_equal = 1),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        TryFrom,
        Serialize,
        Deserialize
    )
)]
pub struct SequenceNumber(u32);

/// The (partition, year) pair under which reference numbers are counted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceKey {
    /// Owning project.
    pub partition: PartitionKey,
    /// Calendar year (UTC) of issuance.
    pub year: i32,
}

impl SequenceKey {
    /// Creates a key for the given partition and year.
    pub const fn new(partition: PartitionKey, year: i32) -> Self {
        Self { partition, year }
    }
}

impl fmt::Display for SequenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.partition, self.year)
    }
}

/// Marker that precedes the token of a fallback reference.
const FALLBACK_MARKER: char = 'X';

/// How the trailing segment of a reference was produced.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    /// Issued by the sequence counter.
    Sequential(SequenceNumber),
    /// Time-derived token issued because the counter was unavailable.
    Fallback(String),
}

/// External identifier of a batch: `<PREFIX>-<PARTITION>-<YEAR>-<SEQ4>`.
///
/// Fallback references replace the sequence with `X` followed by 32 hex
/// characters, which keeps them unique and easy to audit separately.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReferenceNumber {
    prefix: String,
    partition: PartitionKey,
    year: i32,
    kind: ReferenceKind,
}

impl ReferenceNumber {
    /// Builds a sequential reference.
    pub fn sequential(
        prefix: impl Into<String>,
        partition: PartitionKey,
        year: i32,
        sequence: SequenceNumber,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            partition,
            year,
            kind: ReferenceKind::Sequential(sequence),
        }
    }

    /// Builds a non-sequential reference from a fresh UUIDv7.
    pub fn fallback(prefix: impl Into<String>, partition: PartitionKey, year: i32) -> Self {
        Self {
            prefix: prefix.into(),
            partition,
            year,
            kind: ReferenceKind::Fallback(Uuid::now_v7().simple().to_string()),
        }
    }

    /// Document-type prefix, e.g. `BRW`.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Partition the reference was counted under.
    pub const fn partition(&self) -> &PartitionKey {
        &self.partition
    }

    /// Year the reference was counted under.
    pub const fn year(&self) -> i32 {
        self.year
    }

    /// How the trailing segment was produced.
    pub const fn kind(&self) -> &ReferenceKind {
        &self.kind
    }

    /// The sequence number, if this is a sequential reference.
    pub const fn sequence(&self) -> Option<SequenceNumber> {
        match &self.kind {
            ReferenceKind::Sequential(sequence) => Some(*sequence),
            ReferenceKind::Fallback(_) => None,
        }
    }

    /// Whether this reference was issued while the counter was unavailable.
    pub const fn is_fallback(&self) -> bool {
        matches!(self.kind, ReferenceKind::Fallback(_))
    }
}

impl fmt::Display for ReferenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ReferenceKind::Sequential(sequence) => write!(
                f,
                "{}-{}-{}-{:04}",
                self.prefix,
                self.partition,
                self.year,
                sequence.into_inner()
            ),
            ReferenceKind::Fallback(token) => write!(
                f,
                "{}-{}-{}-{FALLBACK_MARKER}{token}",
                self.prefix, self.partition, self.year
            ),
        }
    }
}

/// Reasons a string is not a well-formed reference number.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReferenceParseError {
    /// Not exactly four hyphen-separated segments.
    #[error("reference '{0}' must have the shape PREFIX-PARTITION-YEAR-SEQUENCE")]
    Shape(String),
    /// The prefix segment is empty or not alphanumeric.
    #[error("reference '{0}' has an invalid prefix")]
    Prefix(String),
    /// The partition segment is invalid.
    #[error("reference '{0}' has an invalid partition")]
    Partition(String),
    /// The year segment is not a four digit year.
    #[error("reference '{0}' has an invalid year")]
    Year(String),
    /// The trailing segment is neither a sequence nor a fallback token.
    #[error("reference '{0}' has an invalid sequence segment")]
    Sequence(String),
}

impl FromStr for ReferenceNumber {
    type Err = ReferenceParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let segments: Vec<&str> = raw.split('-').collect();
        let [prefix, partition, year, tail] = segments.as_slice() else {
            return Err(ReferenceParseError::Shape(raw.to_string()));
        };

        if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ReferenceParseError::Prefix(raw.to_string()));
        }

        let partition = PartitionKey::try_new((*partition).to_string())
            .map_err(|_| ReferenceParseError::Partition(raw.to_string()))?;

        if year.len() != 4 {
            return Err(ReferenceParseError::Year(raw.to_string()));
        }
        let year: i32 = year
            .parse()
            .map_err(|_| ReferenceParseError::Year(raw.to_string()))?;

        let kind = if let Some(token) = tail.strip_prefix(FALLBACK_MARKER) {
            if token.len() != 32 || !token.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ReferenceParseError::Sequence(raw.to_string()));
            }
            ReferenceKind::Fallback(token.to_ascii_lowercase())
        } else {
            if tail.len() < 4 || !tail.chars().all(|c| c.is_ascii_digit()) {
                return Err(ReferenceParseError::Sequence(raw.to_string()));
            }
            let value: u32 = tail
                .parse()
                .map_err(|_| ReferenceParseError::Sequence(raw.to_string()))?;
            let sequence = SequenceNumber::try_new(value)
                .map_err(|_| ReferenceParseError::Sequence(raw.to_string()))?;
            ReferenceKind::Sequential(sequence)
        };

        Ok(Self {
            prefix: (*prefix).to_string(),
            partition,
            year,
            kind,
        })
    }
}

impl TryFrom<String> for ReferenceNumber {
    type Error = ReferenceParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ReferenceNumber> for String {
    fn from(reference: ReferenceNumber) -> Self {
        reference.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn partition(raw: &str) -> PartitionKey {
        PartitionKey::try_new(raw.to_string()).expect("valid partition key")
    }

    #[test]
    fn sequential_reference_is_zero_padded_to_four_digits() {
        let sequence = SequenceNumber::try_new(1).expect("1 is a valid sequence");
        let reference = ReferenceNumber::sequential("BRW", partition("PROJ1"), 2025, sequence);

        assert_eq!(reference.to_string(), "BRW-PROJ1-2025-0001");
    }

    #[test]
    fn sequence_beyond_four_digits_is_not_truncated() {
        let sequence = SequenceNumber::try_new(12_345).expect("valid sequence");
        let reference = ReferenceNumber::sequential("BRW", partition("P1"), 2025, sequence);

        assert_eq!(reference.to_string(), "BRW-P1-2025-12345");
    }

    #[test]
    fn fallback_reference_is_recognizable_and_parses_back() {
        let reference = ReferenceNumber::fallback("BRW", partition("P1"), 2025);
        let rendered = reference.to_string();

        assert!(rendered.starts_with("BRW-P1-2025-X"));
        let parsed: ReferenceNumber = rendered.parse().expect("fallback should parse");
        assert!(parsed.is_fallback());
        assert_eq!(parsed, reference);
    }

    #[test]
    fn partition_key_rejects_hyphens() {
        assert!(PartitionKey::try_new("PROJ-1".to_string()).is_err());
    }

    #[test]
    fn reference_with_missing_segment_is_rejected() {
        let parsed = "BRW-P1-0001".parse::<ReferenceNumber>();
        assert!(matches!(parsed, Err(ReferenceParseError::Shape(_))));
    }

    #[test]
    fn sequence_zero_is_rejected() {
        assert!(SequenceNumber::try_new(0).is_err());
        assert!("BRW-P1-2025-0000".parse::<ReferenceNumber>().is_err());
    }

    #[test]
    fn money_from_major_scales_to_minor_units() {
        assert_eq!(Money::from_major(50_000).minor_units(), 5_000_000);
    }

    proptest! {
        #[test]
        fn sequential_references_parse_back(
            prefix in "[A-Z]{2,5}",
            part in "[A-Za-z0-9_]{1,32}",
            year in 1000i32..=9999,
            seq in 1u32..1_000_000,
        ) {
            let sequence = SequenceNumber::try_new(seq).expect("positive sequence");
            let reference = ReferenceNumber::sequential(prefix, partition(&part), year, sequence);
            let parsed: ReferenceNumber = reference.to_string().parse().expect("rendered reference parses");
            prop_assert_eq!(parsed, reference);
        }

        #[test]
        fn references_order_like_their_sequences(a in 1u32..10_000, b in 1u32..10_000) {
            let render = |value: u32| {
                ReferenceNumber::sequential(
                    "BRW",
                    partition("P1"),
                    2025,
                    SequenceNumber::try_new(value).expect("positive sequence"),
                )
                .to_string()
            };
            prop_assert_eq!(a.cmp(&b), render(a).cmp(&render(b)));
        }
    }
}

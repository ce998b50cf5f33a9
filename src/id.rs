//! Identifier space for the mesh.
//!
//! Peers and object keys live in one namespace: fixed-length digit strings
//! over a configurable base (40 hexadecimal digits by default). Routing is
//! driven entirely by shared-prefix length, so the only operations this
//! module provides are pure value operations: parsing/validation, digit
//! access, prefix comparison, and hashing keys into the space.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Default digit base (hexadecimal).
pub const DEFAULT_BASE: u8 = 16;

/// Default identifier length in digits.
pub const DEFAULT_DIGITS: usize = 40;

/// Largest digit base the textual encoding supports (digits 0-9, a-z).
const MAX_BASE: u8 = 36;

/// Error returned when a digit string cannot be parsed into an [`Id`].
///
/// Malformed identifiers are rejected at the boundary; they are never
/// truncated, padded, or otherwise coerced into the space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedIdentifier {
    /// The offending input, as received.
    pub input: String,
    pub reason: MalformedReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedReason {
    WrongLength { expected: usize, actual: usize },
    BadDigit { position: usize, character: char },
}

impl fmt::Display for MalformedIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            MalformedReason::WrongLength { expected, actual } => write!(
                f,
                "malformed identifier {:?}: expected {} digits, got {}",
                self.input, expected, actual
            ),
            MalformedReason::BadDigit {
                position,
                character,
            } => write!(
                f,
                "malformed identifier {:?}: invalid digit {:?} at position {}",
                self.input, character, position
            ),
        }
    }
}

impl std::error::Error for MalformedIdentifier {}

/// Geometry of the identifier space: digit base and identifier length.
///
/// Every peer in one mesh must agree on the geometry. It is configuration,
/// not a constant; tests use small dense spaces and production meshes
/// default to 40 hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdSpace {
    base: u8,
    digits: usize,
}

impl Default for IdSpace {
    fn default() -> Self {
        Self::new(DEFAULT_BASE, DEFAULT_DIGITS)
    }
}

impl IdSpace {
    /// Create a space of `digits` digits over `base`.
    ///
    /// # Panics
    /// Panics if `base` is not in `2..=36` or `digits` is zero; geometry is
    /// fixed at configuration time, so a bad value is a programming error.
    pub fn new(base: u8, digits: usize) -> Self {
        assert!((2..=MAX_BASE).contains(&base), "base must be in 2..=36");
        assert!(digits > 0, "identifier length must be non-zero");
        Self { base, digits }
    }

    pub fn base(&self) -> u8 {
        self.base
    }

    pub fn digits(&self) -> usize {
        self.digits
    }

    /// Parse and validate a digit string.
    pub fn parse(&self, input: &str) -> Result<Id, MalformedIdentifier> {
        let chars: Vec<char> = input.chars().collect();
        if chars.len() != self.digits {
            return Err(MalformedIdentifier {
                input: input.to_string(),
                reason: MalformedReason::WrongLength {
                    expected: self.digits,
                    actual: chars.len(),
                },
            });
        }
        let mut digits = Vec::with_capacity(self.digits);
        for (position, &character) in chars.iter().enumerate() {
            let value = character
                .to_digit(MAX_BASE as u32)
                .filter(|&v| v < self.base as u32);
            match value {
                Some(v) => digits.push(v as u8),
                None => {
                    return Err(MalformedIdentifier {
                        input: input.to_string(),
                        reason: MalformedReason::BadDigit {
                            position,
                            character,
                        },
                    })
                }
            }
        }
        Ok(Id(digits))
    }

    /// Generate a uniformly random identifier.
    pub fn random(&self) -> Id {
        let mut rng = rand::thread_rng();
        Id((0..self.digits)
            .map(|_| rng.gen_range(0..self.base))
            .collect())
    }

    /// Hash an object key into the identifier space.
    ///
    /// Deterministic: every peer maps a key to the same identifier, which is
    /// what makes the key's root well-defined.
    pub fn hash_key(&self, key: &str) -> Id {
        let mut hasher = blake3::Hasher::new();
        hasher.update(key.as_bytes());
        let mut reader = hasher.finalize_xof();
        let mut buf = vec![0u8; self.digits];
        reader.fill(&mut buf);
        Id(buf.into_iter().map(|b| b % self.base).collect())
    }

    /// Whether `id` belongs to this space.
    pub fn contains(&self, id: &Id) -> bool {
        id.0.len() == self.digits && id.0.iter().all(|&d| d < self.base)
    }

    /// Check that `id` belongs to this space, reporting what is wrong with
    /// it. Used at the call boundary so a foreign identifier is rejected
    /// rather than coerced.
    pub fn validate(&self, id: &Id) -> Result<(), MalformedIdentifier> {
        if id.0.len() != self.digits {
            return Err(MalformedIdentifier {
                input: id.to_string(),
                reason: MalformedReason::WrongLength {
                    expected: self.digits,
                    actual: id.0.len(),
                },
            });
        }
        if let Some(position) = id.0.iter().position(|&d| d >= self.base) {
            return Err(MalformedIdentifier {
                input: id.to_string(),
                reason: MalformedReason::BadDigit {
                    position,
                    character: char::from_digit(id.0[position] as u32, MAX_BASE as u32)
                        .unwrap_or('?'),
                },
            });
        }
        Ok(())
    }
}

/// A fixed-length digit identifier.
///
/// Total order is numeric (lexicographic over equal-length digit vectors),
/// used only for tie-breaking; routing proximity is shared-prefix length.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Id(Vec<u8>);

impl Id {
    /// Digit at `position` (0 = most significant).
    pub fn digit(&self, position: usize) -> u8 {
        self.0[position]
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Length of the longest common leading digit run.
    pub fn shared_prefix_len(&self, other: &Id) -> usize {
        self.0
            .iter()
            .zip(other.0.iter())
            .take_while(|(a, b)| a == b)
            .count()
    }

    /// Abbreviated form for log output.
    pub fn short(&self) -> String {
        self.to_string().chars().take(8).collect()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &d in &self.0 {
            // Digits are validated < 36 on construction.
            let c = char::from_digit(d as u32, MAX_BASE as u32).unwrap_or('?');
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

impl FromStr for Id {
    type Err = MalformedIdentifier;

    /// Parses against the default space geometry. Meshes with a custom
    /// geometry must go through [`IdSpace::parse`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IdSpace::default().parse(s)
    }
}

/// A non-owning reference to a peer: identifier plus network address.
///
/// Holding a `PeerRef` never implies the peer is alive; liveness is only
/// ever established by a successful call.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerRef {
    pub id: Id,
    pub addr: SocketAddr,
}

impl PeerRef {
    pub fn new(id: Id, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}

impl fmt::Display for PeerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id.short(), self.addr)
    }
}

impl fmt::Debug for PeerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerRef({}@{})", self.id, self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> IdSpace {
        IdSpace::new(16, 8)
    }

    #[test]
    fn parse_roundtrip() {
        let id = space().parse("0a1b2c3d").unwrap();
        assert_eq!(id.to_string(), "0a1b2c3d");
        assert_eq!(id.digit(0), 0);
        assert_eq!(id.digit(1), 10);
        assert_eq!(id.len(), 8);
    }

    #[test]
    fn parse_rejects_wrong_length() {
        let err = space().parse("0a1b").unwrap_err();
        assert!(matches!(
            err.reason,
            MalformedReason::WrongLength {
                expected: 8,
                actual: 4
            }
        ));
    }

    #[test]
    fn parse_rejects_out_of_range_digit() {
        // 'g' is a valid base-36 digit but not a valid hex digit.
        let err = space().parse("0a1b2c3g").unwrap_err();
        assert!(matches!(
            err.reason,
            MalformedReason::BadDigit {
                position: 7,
                character: 'g'
            }
        ));
    }

    #[test]
    fn shared_prefix_len() {
        let s = space();
        let a = s.parse("aabbccdd").unwrap();
        let b = s.parse("aabbc0dd").unwrap();
        assert_eq!(a.shared_prefix_len(&b), 5);
        assert_eq!(a.shared_prefix_len(&a), 8);
        let c = s.parse("0abbccdd").unwrap();
        assert_eq!(a.shared_prefix_len(&c), 0);
    }

    #[test]
    fn ordering_is_numeric() {
        let s = space();
        let low = s.parse("00000001").unwrap();
        let high = s.parse("00000010").unwrap();
        assert!(low < high);
    }

    #[test]
    fn hash_key_is_deterministic_and_in_space() {
        let s = space();
        let a = s.hash_key("object-1");
        let b = s.hash_key("object-1");
        let c = s.hash_key("object-2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(s.contains(&a));
    }

    #[test]
    fn random_ids_are_in_space() {
        let s = IdSpace::new(4, 12);
        for _ in 0..32 {
            assert!(s.contains(&s.random()));
        }
    }
}

//! Prefix allocation and deduplication.
//!
//! A prefix is the local-part of a mailbox address. [`PrefixAllocator`] turns an
//! optional desired prefix into a bounded sequence of [`Candidates`]; the caller
//! takes the first one that is free in the [`AddressIndex`] (and, for providers
//! with remote registration, the first one the provider accepts).
//!
//! ```
//! use tempmail_hub::allocator::{AddressIndex, AllocationStrategy, PrefixAllocator};
//!
//! let mut index = AddressIndex::new();
//! index.insert_address("kpay007@snapmail.cc");
//!
//! let allocator = PrefixAllocator::new("kpay", 20);
//! let prefix = allocator
//!     .allocate(Some("KPay007"), AllocationStrategy::Incremental, &index)
//!     .unwrap();
//! assert_eq!(prefix, "kpay008");
//! ```

use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

/// Splits a prefix into its head and optional trailing number.
static HEAD_AND_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.*?)([0-9]+)?$").expect("valid regex"));

/// How a colliding prefix is replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStrategy {
    /// Bump the numeric suffix: `kpay007` → `kpay008`.
    #[default]
    Incremental,
    /// Keep the head and draw a new 3-digit suffix.
    Random,
}

/// Case-insensitive set of local-parts already in use.
///
/// Records are indexed by their full address, not by a stored prefix field, so
/// accounts that only carry one of the two are still found.
#[derive(Debug, Clone, Default)]
pub struct AddressIndex {
    taken: HashSet<String>,
}

impl AddressIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the local-part of `address` as taken.
    pub fn insert_address(&mut self, address: &str) {
        let local = address.split_once('@').map_or(address, |(local, _)| local);
        self.insert_prefix(local);
    }

    /// Marks a bare prefix as taken, e.g. one a provider rejected remotely.
    pub fn insert_prefix(&mut self, prefix: &str) {
        let prefix = prefix.trim();
        if !prefix.is_empty() {
            self.taken.insert(prefix.to_lowercase());
        }
    }

    /// Returns `true` if an existing address begins with `candidate@`.
    #[must_use]
    pub fn is_taken(&self, candidate: &str) -> bool {
        self.taken.contains(&candidate.trim().to_lowercase())
    }

    /// Iterates over the taken local-parts (lowercased).
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.taken.iter().map(String::as_str)
    }

    /// Number of taken local-parts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.taken.len()
    }

    /// Returns `true` if nothing is taken.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.taken.is_empty()
    }
}

/// Generates unique local-parts.
///
/// Without a desired prefix, candidates are the brand followed by a
/// process-wide running counter (`kpay001`, `kpay002`, ...). Every candidate
/// drawn consumes a counter value, so results only ever grow.
#[derive(Debug)]
pub struct PrefixAllocator {
    brand: String,
    counter: AtomicU32,
    max_attempts: u32,
}

impl PrefixAllocator {
    /// Creates an allocator whose counter starts at 1.
    pub fn new(brand: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            brand: brand.into(),
            counter: AtomicU32::new(1),
            max_attempts,
        }
    }

    /// Creates an allocator whose counter resumes after the highest
    /// `<brand><digits>` prefix found in `index`.
    pub fn seeded(brand: impl Into<String>, index: &AddressIndex, max_attempts: u32) -> Self {
        let brand = brand.into();
        let highest = index
            .iter()
            .filter_map(|local| local.strip_prefix(brand.as_str()))
            .filter(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
            .filter_map(|digits| digits.parse::<u32>().ok())
            .max()
            .unwrap_or(0);

        debug!(%brand, next = highest.saturating_add(1), "Seeded prefix counter");
        Self {
            brand,
            counter: AtomicU32::new(highest.saturating_add(1)),
            max_attempts,
        }
    }

    /// Brand used when no prefix is requested.
    #[must_use]
    pub fn brand(&self) -> &str {
        &self.brand
    }

    /// Retries allowed after the first candidate.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the bounded candidate sequence for one allocation.
    ///
    /// A desired prefix is trimmed and lowercased and is itself the first
    /// candidate. An empty desired prefix is treated as absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPrefix`] if the desired prefix contains characters
    /// outside ASCII letters, digits, `.`, `_` and `-`.
    pub fn candidates(
        &self,
        desired: Option<&str>,
        strategy: AllocationStrategy,
    ) -> Result<Candidates<'_>> {
        let desired = desired
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty());

        let plan = match desired {
            Some(prefix) => {
                validate_prefix(&prefix)?;
                let (head, number) = split_head(&prefix);
                Plan::Desired {
                    first: Some(prefix),
                    head,
                    number,
                }
            }
            None => Plan::Brand,
        };

        Ok(Candidates {
            allocator: self,
            strategy,
            plan,
            remaining: self.max_attempts.saturating_add(1),
        })
    }

    /// Returns the first candidate not taken in `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPrefix`] for a malformed desired prefix and
    /// [`Error::AllocationExhausted`] when every candidate is taken.
    pub fn allocate(
        &self,
        desired: Option<&str>,
        strategy: AllocationStrategy,
        index: &AddressIndex,
    ) -> Result<String> {
        let mut candidates = self.candidates(desired, strategy)?;
        candidates
            .by_ref()
            .find(|candidate| !index.is_taken(candidate))
            .ok_or_else(|| candidates.exhausted())
    }

    fn next_counter(&self) -> u32 {
        self.counter.fetch_add(1, Ordering::SeqCst)
    }
}

#[derive(Debug)]
enum Plan {
    Brand,
    Desired {
        first: Option<String>,
        head: String,
        number: u64,
    },
}

/// Bounded sequence of prefixes to try, produced by [`PrefixAllocator::candidates`].
#[derive(Debug)]
pub struct Candidates<'a> {
    allocator: &'a PrefixAllocator,
    strategy: AllocationStrategy,
    plan: Plan,
    remaining: u32,
}

impl Candidates<'_> {
    /// The head being numbered (the brand or the desired prefix without digits).
    #[must_use]
    pub fn head(&self) -> &str {
        match &self.plan {
            Plan::Brand => &self.allocator.brand,
            Plan::Desired { head, .. } => head,
        }
    }

    /// The error to report once the sequence has run dry.
    #[must_use]
    pub fn exhausted(&self) -> Error {
        Error::AllocationExhausted {
            head: self.head().to_string(),
            attempts: self.allocator.max_attempts.saturating_add(1),
        }
    }
}

impl Iterator for Candidates<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let candidate = match (&mut self.plan, self.strategy) {
            (Plan::Brand, AllocationStrategy::Incremental) => {
                format!("{}{:03}", self.allocator.brand, self.allocator.next_counter())
            }
            (Plan::Brand, AllocationStrategy::Random) => {
                format!("{}{:03}", self.allocator.brand, random_suffix())
            }
            (Plan::Desired { first, head, number }, strategy) => match first.take() {
                Some(prefix) => prefix,
                None if strategy == AllocationStrategy::Random => format!("{head}{:03}", random_suffix()),
                None => {
                    *number = number.saturating_add(1);
                    format!("{head}{number:03}")
                }
            },
        };
        Some(candidate)
    }
}

fn random_suffix() -> u32 {
    rand::thread_rng().gen_range(0..1000)
}

/// `kpay007` → (`kpay`, 7); `alice` → (`alice`, 1). An all-digit prefix keeps
/// itself as the head.
fn split_head(prefix: &str) -> (String, u64) {
    let Some(caps) = HEAD_AND_NUMBER.captures(prefix) else {
        return (prefix.to_string(), 1);
    };
    let head = caps.get(1).map_or("", |m| m.as_str());
    let number = caps.get(2).and_then(|m| m.as_str().parse::<u64>().ok());

    match number {
        Some(number) if !head.is_empty() => (head.to_string(), number),
        Some(number) => (prefix.to_string(), number),
        // Digits too long for u64, or none at all.
        None if caps.get(2).is_some() => (prefix.to_string(), 1),
        None => (head.to_string(), 1),
    }
}

fn validate_prefix(prefix: &str) -> Result<()> {
    let valid = prefix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid && !prefix.starts_with('.') && !prefix.ends_with('.') {
        Ok(())
    } else {
        Err(Error::InvalidPrefix {
            prefix: prefix.to_string(),
        })
    }
}

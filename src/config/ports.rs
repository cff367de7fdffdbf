use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

pub const PORT_RANGE_START_ENV: &str = "DEVSTACK_PORT_RANGE_START";
pub const PORT_RANGE_END_ENV: &str = "DEVSTACK_PORT_RANGE_END";

pub const DEFAULT_PORT_RANGE_START: u16 = 3000;
pub const DEFAULT_PORT_RANGE_END: u16 = 65535;

/// Inclusive range that automatic allocation draws from.
///
/// Each bound is read independently, so a bad start value never discards a
/// good end value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: DEFAULT_PORT_RANGE_START,
            end: DEFAULT_PORT_RANGE_END,
        }
    }
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Read `DEVSTACK_PORT_RANGE_START` / `DEVSTACK_PORT_RANGE_END`.
    pub fn from_env() -> Self {
        Self::from_lookup(super::process_env)
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            start: read_bound(&lookup, PORT_RANGE_START_ENV, DEFAULT_PORT_RANGE_START),
            end: read_bound(&lookup, PORT_RANGE_END_ENV, DEFAULT_PORT_RANGE_END),
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    /// Number of ports in the range, zero when inverted.
    pub fn len(&self) -> usize {
        if self.start > self.end {
            0
        } else {
            (self.end - self.start) as usize + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fails for an inverted range. Construction accepts one so that a bad
    /// env value surfaces at allocation time with a readable message.
    pub fn validate(&self) -> Result<()> {
        if self.start == 0 || self.start > self.end {
            return Err(Error::Validation(format!(
                "invalid port range {}-{}",
                self.start, self.end
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

fn read_bound<F>(lookup: &F, key: &str, default: u16) -> u16
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<u32>() {
        Ok(v) if (1..=65535).contains(&v) => v as u16,
        _ => {
            tracing::warn!(
                "Invalid {}='{}' (must be 1-65535), using default {}",
                key,
                raw,
                default
            );
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let range = PortRange::from_lookup(lookup_from(&[]));
        assert_eq!(range, PortRange::new(3000, 65535));
    }

    #[test]
    fn reads_both_bounds() {
        let range = PortRange::from_lookup(lookup_from(&[
            (PORT_RANGE_START_ENV, "4000"),
            (PORT_RANGE_END_ENV, "4999"),
        ]));
        assert_eq!(range, PortRange::new(4000, 4999));
        assert_eq!(range.len(), 1000);
    }

    #[test]
    fn each_bound_falls_back_independently() {
        let range = PortRange::from_lookup(lookup_from(&[
            (PORT_RANGE_START_ENV, "0"),
            (PORT_RANGE_END_ENV, "5000"),
        ]));
        assert_eq!(range, PortRange::new(3000, 5000));

        let range = PortRange::from_lookup(lookup_from(&[
            (PORT_RANGE_START_ENV, "8000"),
            (PORT_RANGE_END_ENV, "70000"),
        ]));
        assert_eq!(range, PortRange::new(8000, 65535));

        let range = PortRange::from_lookup(lookup_from(&[(PORT_RANGE_START_ENV, "abc")]));
        assert_eq!(range.start, DEFAULT_PORT_RANGE_START);
    }

    #[test]
    fn inverted_range_is_empty_and_invalid() {
        let range = PortRange::new(5000, 4000);
        assert!(range.is_empty());
        assert!(range.validate().is_err());
        assert!(PortRange::new(4000, 4000).validate().is_ok());
    }

    #[test]
    fn contains_is_inclusive() {
        let range = PortRange::new(3000, 3010);
        assert!(range.contains(3000));
        assert!(range.contains(3010));
        assert!(!range.contains(2999));
        assert!(!range.contains(3011));
    }
}

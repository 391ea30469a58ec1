//! Per-write options.

use std::time::Duration;

/// Modifier for a single `set`.
///
/// Backends that do not implement an option log it as
/// [`StoreError::UnsupportedOption`](crate::StoreError::UnsupportedOption)
/// and perform the write anyway.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum SetOption {
    /// Delete the key after this long unless it is written again first.
    Ttl(Duration),
    /// Attach the key to an existing cluster lease.
    Lease(i64),
}

impl SetOption {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ttl(_) => "ttl",
            Self::Lease(_) => "lease",
        }
    }
}

/// The last TTL in `options`, if any.
pub fn ttl_of(options: &[SetOption]) -> Option<Duration> {
    options.iter().rev().find_map(|o| match o {
        SetOption::Ttl(d) => Some(*d),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_ttl_wins() {
        let opts = [
            SetOption::Ttl(Duration::from_secs(1)),
            SetOption::Lease(7),
            SetOption::Ttl(Duration::from_millis(5)),
        ];
        assert_eq!(ttl_of(&opts), Some(Duration::from_millis(5)));
        assert_eq!(ttl_of(&[SetOption::Lease(1)]), None);
        assert_eq!(SetOption::Lease(1).name(), "lease");
    }
}

//! Subject-alternative-name sets.
//!
//! A leaf is reissued only when the *set* of names changes, so names are
//! normalised before comparison: surrounding whitespace and a trailing dot are
//! dropped, DNS names are lowercased, and IP addresses are rendered in their
//! canonical form.

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

use rcgen::string::Ia5String;
use rcgen::SanType;

use crate::{PkiError, Result};

/// Unordered, normalised set of subject alternative names
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SanSet(BTreeSet<String>);

impl SanSet {
    /// Build a set from names in any order; duplicates collapse
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            names
                .into_iter()
                .map(|n| normalize(n.as_ref()))
                .filter(|n| !n.is_empty())
                .collect(),
        )
    }

    /// Whether the set has no names
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of distinct names
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Names in sorted order
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Whether `name` (after normalisation) is in the set
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(&normalize(name))
    }

    /// rcgen SAN entries for certificate parameters
    pub fn to_san_types(&self) -> Result<Vec<SanType>> {
        self.0
            .iter()
            .map(|san| {
                if let Ok(ip) = san.parse::<IpAddr>() {
                    Ok(SanType::IpAddress(ip))
                } else {
                    Ia5String::try_from(san.clone())
                        .map(SanType::DnsName)
                        .map_err(|e| {
                            PkiError::CertificateGenerationFailed(format!(
                                "invalid DNS name '{}': {}",
                                san, e
                            ))
                        })
                }
            })
            .collect()
    }
}

impl fmt::Display for SanSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().collect();
        write!(f, "{{{}}}", names.join(", "))
    }
}

impl<S: AsRef<str>> FromIterator<S> for SanSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

fn normalize(name: &str) -> String {
    let trimmed = name.trim().trim_end_matches('.');
    match trimmed.parse::<IpAddr>() {
        Ok(ip) => ip.to_string(),
        Err(_) => trimmed.to_ascii_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_does_not_matter() {
        let a = SanSet::new(["argocd.pizza", "grafana.pizza", "whoami.pizza"]);
        let b = SanSet::new(["whoami.pizza", "argocd.pizza", "grafana.pizza"]);
        assert_eq!(a, b);
    }

    #[test]
    fn names_are_normalised() {
        let set = SanSet::new(["  Grafana.Pizza. ", "grafana.pizza", "", "192.168.2.60"]);
        assert!(set.contains("grafana.pizza"));
        assert!(set.contains("192.168.2.60"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn ipv6_is_canonicalised() {
        let set = SanSet::new(["2001:0db8:0000:0000:0000:0000:0000:0001"]);
        assert!(set.contains("2001:db8::1"));
    }

    #[test]
    fn display_lists_sorted_names() {
        let set = SanSet::new(["b.lan", "a.lan"]);
        assert_eq!(set.to_string(), "{a.lan, b.lan}");
    }

    #[test]
    fn san_types_split_dns_and_ip() {
        let set = SanSet::new(["whoami.pizza", "192.168.2.60"]);
        let types = set.to_san_types().unwrap();
        assert_eq!(types.len(), 2);
        assert!(types
            .iter()
            .any(|t| matches!(t, SanType::IpAddress(ip) if ip.to_string() == "192.168.2.60")));
        assert!(types.iter().any(|t| matches!(t, SanType::DnsName(_))));
    }
}

//! Near-duplicate address audit. Flags distinct identifiers in the same ZIP
//! whose street strings are almost the same; never merges them.

use hometrack_core::{Property, PropertyId};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearDuplicate {
    pub left: PropertyId,
    pub right: PropertyId,
    pub left_address: String,
    pub right_address: String,
    pub zip: String,
    pub score: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct AuditConfig {
    pub threshold: f64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { threshold: 0.95 }
    }
}

pub struct DuplicateAudit {
    config: AuditConfig,
}

impl DuplicateAudit {
    pub fn new(config: AuditConfig) -> Self {
        Self { config }
    }

    pub fn normalize_key_fragment(input: &str) -> String {
        input
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn street_key(property: &Property) -> String {
        let address = &property.address;
        let street = match &address.unit {
            Some(unit) => format!("{} {}", address.street, unit),
            None => address.street.clone(),
        };
        Self::normalize_key_fragment(&street)
    }

    pub fn similarity(&self, a: &Property, b: &Property) -> f64 {
        jaro_winkler(&Self::street_key(a), &Self::street_key(b))
    }

    /// Pairs at or above the threshold, highest score first.
    pub fn apply(&self, properties: &[Property]) -> Vec<NearDuplicate> {
        let mut pairs = Vec::new();
        for i in 0..properties.len() {
            for j in (i + 1)..properties.len() {
                let (a, b) = (&properties[i], &properties[j]);
                if a.id == b.id || a.address.zip != b.address.zip {
                    continue;
                }
                let score = self.similarity(a, b);
                if score >= self.config.threshold {
                    let (left, right) = if a.id <= b.id { (a, b) } else { (b, a) };
                    pairs.push(NearDuplicate {
                        left: left.id.clone(),
                        right: right.id.clone(),
                        left_address: left.address.display_line(),
                        right_address: right.address.display_line(),
                        zip: a.address.zip.clone(),
                        score,
                    });
                }
            }
        }
        pairs.sort_by(|x, y| {
            y.score
                .total_cmp(&x.score)
                .then_with(|| x.left.cmp(&y.left))
                .then_with(|| x.right.cmp(&y.right))
        });
        pairs
    }
}

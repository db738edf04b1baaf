//! Identity resolution: turns free-text address fields into a canonical
//! address and a stable content-hash identifier.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::PropertyId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("address is empty")]
    Empty,
    #[error("no 5-digit ZIP code at the end of address {0:?}")]
    MissingZip(String),
    #[error("no recognisable state before the ZIP code in address {0:?}")]
    MissingState(String),
    #[error("address {0:?} does not start with a street number")]
    MissingStreetNumber(String),
    #[error("no city in address {0:?}")]
    MissingCity(String),
    #[error("cannot tell where the street ends in address {0:?}; separate the city with a comma")]
    AmbiguousStreet(String),
    #[error("unsupported address kind ({kind}) in {input:?}")]
    Unsupported { kind: &'static str, input: String },
}

/// Address fields as a source reported them. `line` may hold the whole address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RawAddress {
    pub line: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub zip: Option<String>,
}

impl RawAddress {
    pub fn line(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            ..Default::default()
        }
    }

    /// Joins the structured parts into one comma separated line.
    pub fn compose(&self) -> String {
        let mut parts = vec![self.line.trim().to_string()];
        for part in [&self.unit, &self.city].into_iter().flatten() {
            if !part.trim().is_empty() {
                parts.push(part.trim().to_string());
            }
        }
        let tail = [&self.state, &self.zip]
            .into_iter()
            .flatten()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if !tail.is_empty() {
            parts.push(tail);
        }
        parts.retain(|p| !p.is_empty());
        parts.join(", ")
    }
}

/// Canonical, lower-cased address components.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub street: String,
    pub unit: Option<String>,
    pub city: String,
    pub state: String,
    pub zip: String,
}

impl Address {
    /// The string the identifier is hashed from.
    pub fn canonical(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.street,
            self.unit.as_deref().unwrap_or(""),
            self.city,
            self.state,
            self.zip
        )
    }

    pub fn id(&self) -> PropertyId {
        PropertyId::from_canonical(&self.canonical())
    }

    pub fn display_line(&self) -> String {
        let street = match &self.unit {
            Some(unit) => format!("{} {}", title_case(&self.street), title_case(unit)),
            None => title_case(&self.street),
        };
        format!(
            "{street}, {}, {} {}",
            title_case(&self.city),
            self.state.to_ascii_uppercase(),
            self.zip
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedAddress {
    pub id: PropertyId,
    pub address: Address,
}

/// Resolves raw address fields to a canonical address and its identifier.
pub fn resolve(raw: &RawAddress) -> Result<ResolvedAddress, IdentityError> {
    let address = normalize_address(&raw.compose())?;
    Ok(ResolvedAddress {
        id: address.id(),
        address,
    })
}

const STREET_SUFFIXES: &[(&str, &str)] = &[
    ("street", "st"),
    ("st", "st"),
    ("str", "st"),
    ("avenue", "ave"),
    ("ave", "ave"),
    ("av", "ave"),
    ("boulevard", "blvd"),
    ("blvd", "blvd"),
    ("road", "rd"),
    ("rd", "rd"),
    ("drive", "dr"),
    ("dr", "dr"),
    ("driveway", "dr"),
    ("drwy", "dr"),
    ("lane", "ln"),
    ("ln", "ln"),
    ("court", "ct"),
    ("ct", "ct"),
    ("place", "pl"),
    ("pl", "pl"),
    ("terrace", "ter"),
    ("ter", "ter"),
    ("circle", "cir"),
    ("cir", "cir"),
    ("parkway", "pkwy"),
    ("pkwy", "pkwy"),
    ("way", "way"),
    ("trail", "trl"),
    ("trl", "trl"),
    ("highway", "hwy"),
    ("hwy", "hwy"),
    ("loop", "loop"),
    ("square", "sq"),
    ("sq", "sq"),
];

const DIRECTIONALS: &[(&str, &str)] = &[
    ("north", "n"),
    ("n", "n"),
    ("south", "s"),
    ("s", "s"),
    ("east", "e"),
    ("e", "e"),
    ("west", "w"),
    ("w", "w"),
    ("northeast", "ne"),
    ("ne", "ne"),
    ("northwest", "nw"),
    ("nw", "nw"),
    ("southeast", "se"),
    ("se", "se"),
    ("southwest", "sw"),
    ("sw", "sw"),
];

const UNIT_DESIGNATORS: &[(&str, &str)] = &[
    ("apartment", "apt"),
    ("apt", "apt"),
    ("unit", "apt"),
    ("#", "apt"),
    ("homesite", "apt"),
    ("hs", "apt"),
    ("suite", "ste"),
    ("ste", "ste"),
];

const STATES: &[(&str, &str)] = &[
    ("alabama", "al"),
    ("alaska", "ak"),
    ("arizona", "az"),
    ("arkansas", "ar"),
    ("california", "ca"),
    ("colorado", "co"),
    ("connecticut", "ct"),
    ("delaware", "de"),
    ("district of columbia", "dc"),
    ("florida", "fl"),
    ("georgia", "ga"),
    ("hawaii", "hi"),
    ("idaho", "id"),
    ("illinois", "il"),
    ("indiana", "in"),
    ("iowa", "ia"),
    ("kansas", "ks"),
    ("kentucky", "ky"),
    ("louisiana", "la"),
    ("maine", "me"),
    ("maryland", "md"),
    ("massachusetts", "ma"),
    ("michigan", "mi"),
    ("minnesota", "mn"),
    ("mississippi", "ms"),
    ("missouri", "mo"),
    ("montana", "mt"),
    ("nebraska", "ne"),
    ("nevada", "nv"),
    ("new hampshire", "nh"),
    ("new jersey", "nj"),
    ("new mexico", "nm"),
    ("new york", "ny"),
    ("north carolina", "nc"),
    ("north dakota", "nd"),
    ("ohio", "oh"),
    ("oklahoma", "ok"),
    ("oregon", "or"),
    ("pennsylvania", "pa"),
    ("rhode island", "ri"),
    ("south carolina", "sc"),
    ("south dakota", "sd"),
    ("tennessee", "tn"),
    ("texas", "tx"),
    ("utah", "ut"),
    ("vermont", "vt"),
    ("virginia", "va"),
    ("washington", "wa"),
    ("west virginia", "wv"),
    ("wisconsin", "wi"),
    ("wyoming", "wy"),
];

fn lookup(table: &[(&str, &'static str)], word: &str) -> Option<&'static str> {
    table.iter().find(|(k, _)| *k == word).map(|(_, v)| *v)
}

fn is_suffix(word: &str) -> bool {
    lookup(STREET_SUFFIXES, word).is_some()
}

fn is_directional(word: &str) -> bool {
    lookup(DIRECTIONALS, word).is_some()
}

fn state_code(tokens: &[String]) -> Option<&'static str> {
    let joined = tokens.join(" ");
    if tokens.len() == 1 && joined.len() == 2 {
        if let Some((_, code)) = STATES.iter().find(|(_, code)| *code == joined) {
            return Some(*code);
        }
    }
    lookup(STATES, &joined)
}

fn zip5(token: &str) -> Option<String> {
    let bytes = token.as_bytes();
    let five_digits = bytes.len() >= 5 && bytes[..5].iter().all(u8::is_ascii_digit);
    let plus_four = bytes.len() == 10 && bytes[5] == b'-' && bytes[6..].iter().all(u8::is_ascii_digit);
    if five_digits && (bytes.len() == 5 || plus_four) {
        Some(token[..5].to_string())
    } else {
        None
    }
}

/// Lower-cases and splits on commas, then on anything that is not part of a word.
/// `#` is kept as its own token so `#116` and `# 116` read the same.
fn tokenize(text: &str) -> Vec<Vec<String>> {
    let lowered = text.to_lowercase();
    let mut segments = Vec::new();
    for raw_segment in lowered.split([',', ';', '\n']) {
        let mut tokens = Vec::new();
        let mut current = String::new();
        for ch in raw_segment.chars() {
            if ch.is_alphanumeric() || ch == '-' || ch == '/' {
                current.push(ch);
            } else if ch == '\'' {
                continue;
            } else {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                if ch == '#' {
                    tokens.push("#".to_string());
                }
            }
        }
        if !current.is_empty() {
            tokens.push(current);
        }
        if !tokens.is_empty() {
            segments.push(tokens);
        }
    }
    segments
}

/// Removes the first unit designator and its identifier from `tokens`.
fn take_unit(tokens: &mut Vec<String>) -> Option<String> {
    let mut i = 0;
    while i < tokens.len() {
        if let Some(designator) = lookup(UNIT_DESIGNATORS, &tokens[i]) {
            let mut j = i + 1;
            if j < tokens.len() && tokens[j] == "#" {
                j += 1;
            }
            if let Some(ident) = tokens.get(j).cloned() {
                tokens.drain(i..=j);
                return Some(format!("{designator} {ident}"));
            }
        }
        i += 1;
    }
    None
}

/// Canonical street from its tokens, plus a trailing bare unit such as `c230`
/// found after the suffix.
fn canonical_street(tokens: &[String]) -> (String, Option<String>) {
    let suffix_at = tokens
        .iter()
        .enumerate()
        .skip(2)
        .find(|(_, t)| is_suffix(t))
        .map(|(i, _)| i);

    let mut out = Vec::with_capacity(tokens.len());
    let mut trailing_unit = None;
    for (i, token) in tokens.iter().enumerate() {
        let word = match suffix_at {
            Some(s) if i == s => lookup(STREET_SUFFIXES, token).unwrap_or(token.as_str()),
            Some(s)
                if i > s
                    && i == tokens.len() - 1
                    && !is_directional(token)
                    && token.chars().any(|c| c.is_ascii_digit()) =>
            {
                trailing_unit = Some(format!("apt {token}"));
                continue;
            }
            Some(s) if i == s + 1 => lookup(DIRECTIONALS, token).unwrap_or(token.as_str()),
            _ if i == 1 => lookup(DIRECTIONALS, token).unwrap_or(token.as_str()),
            _ => token.as_str(),
        };
        out.push(word.to_string());
    }
    (out.join(" "), trailing_unit)
}

/// Normalises one free-text address into canonical components.
pub fn normalize_address(text: &str) -> Result<Address, IdentityError> {
    let input = text.trim().to_string();
    if input.is_empty() {
        return Err(IdentityError::Empty);
    }
    if input.contains('&') {
        return Err(IdentityError::Unsupported {
            kind: "intersection",
            input,
        });
    }

    let mut segments = tokenize(&input);

    let zip = segments
        .last_mut()
        .and_then(|seg| seg.pop())
        .and_then(|tok| zip5(&tok))
        .ok_or_else(|| IdentityError::MissingZip(input.clone()))?;
    segments.retain(|s| !s.is_empty());

    let state = {
        let last = segments
            .last_mut()
            .ok_or_else(|| IdentityError::MissingState(input.clone()))?;
        let mut found = None;
        for n in (1..=3).rev() {
            if last.len() >= n {
                if let Some(code) = state_code(&last[last.len() - n..]) {
                    found = Some((n, code));
                    break;
                }
            }
        }
        let (n, code) = found.ok_or_else(|| IdentityError::MissingState(input.clone()))?;
        last.truncate(last.len() - n);
        code.to_string()
    };
    segments.retain(|s| !s.is_empty());

    let (mut street_tokens, city_tokens) = if segments.len() >= 2 {
        let city = segments.pop().unwrap_or_default();
        (segments.concat(), city)
    } else {
        split_single_segment(segments.pop().unwrap_or_default(), &input)?
    };

    if city_tokens.is_empty() {
        return Err(IdentityError::MissingCity(input));
    }
    if street_tokens.windows(2).any(|w| {
        (w[0] == "po" || w[0] == "p") && (w[1] == "box" || w[1] == "o")
    }) {
        return Err(IdentityError::Unsupported {
            kind: "po box",
            input,
        });
    }

    let mut unit = take_unit(&mut street_tokens);
    let starts_with_number = street_tokens
        .first()
        .and_then(|t| t.chars().next())
        .is_some_and(|c| c.is_ascii_digit());
    if !starts_with_number || street_tokens.len() < 2 {
        return Err(IdentityError::MissingStreetNumber(input));
    }

    let (street, trailing_unit) = canonical_street(&street_tokens);
    if unit.is_none() {
        unit = trailing_unit;
    }

    Ok(Address {
        street,
        unit,
        city: city_tokens.join(" "),
        state,
        zip,
    })
}

/// Without commas the city starts after the street suffix, an optional
/// directional and an optional unit.
fn split_single_segment(
    mut tokens: Vec<String>,
    input: &str,
) -> Result<(Vec<String>, Vec<String>), IdentityError> {
    let mut leading_unit = Vec::new();
    if tokens
        .first()
        .is_some_and(|t| lookup(UNIT_DESIGNATORS, t).is_some())
    {
        let take = if tokens.get(1).is_some_and(|t| t == "#") { 3 } else { 2 };
        let take = take.min(tokens.len());
        leading_unit = tokens.drain(..take).collect();
    }

    let suffix_at = tokens
        .iter()
        .enumerate()
        .skip(2)
        .find(|(_, t)| is_suffix(t))
        .map(|(i, _)| i)
        .ok_or_else(|| IdentityError::AmbiguousStreet(input.to_string()))?;

    let mut end = suffix_at + 1;
    if tokens.get(end).is_some_and(|t| is_directional(t)) && tokens.len() > end + 1 {
        end += 1;
    }
    if tokens
        .get(end)
        .is_some_and(|t| lookup(UNIT_DESIGNATORS, t).is_some())
    {
        end += 1;
        if tokens.get(end).is_some_and(|t| t == "#") {
            end += 1;
        }
        end = (end + 1).min(tokens.len());
    }

    let city = tokens.split_off(end);
    let mut street = leading_unit;
    street.extend(tokens);
    Ok((street, city))
}

fn title_case(text: &str) -> String {
    text.split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canonical(text: &str) -> String {
        normalize_address(text).unwrap().canonical()
    }

    #[test]
    fn formatting_variants_resolve_to_the_same_identifier() {
        let a = resolve(&RawAddress::line("123 Main St, Apt 4B, Seattle, WA 98101")).unwrap();
        let b = resolve(&RawAddress::line("123 main street unit 4b seattle wa 98101")).unwrap();
        assert_eq!(a.address.canonical(), "123 main st|apt 4b|seattle|wa|98101");
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.as_str().len(), 64);
    }

    #[test]
    fn structured_fields_match_the_free_text_line() {
        let structured = resolve(&RawAddress {
            line: "123 Main Street".into(),
            unit: Some("Unit 4B".into()),
            city: Some("Seattle".into()),
            state: Some("Washington".into()),
            zip: Some("98101-2233".into()),
        })
        .unwrap();
        let line = resolve(&RawAddress::line("123 Main St Apt 4B, Seattle, WA 98101")).unwrap();
        assert_eq!(structured.id, line.id);
    }

    #[test]
    fn suffixes_directionals_and_units_are_canonicalised() {
        assert_eq!(
            canonical("7301 Northeast 175th Street, Kenmore, WA 98028"),
            "7301 ne 175th st||kenmore|wa|98028"
        );
        assert_eq!(
            canonical("6910 Old Redmond Rd #116,Redmond, WA 98052"),
            canonical("Apt 116, 6910 Old Redmond Road, Redmond, WA, 98052")
        );
        assert_eq!(
            canonical("655 Crockett St Unit A107,Seattle, WA 98109"),
            "655 crockett st|apt a107|seattle|wa|98109"
        );
        assert_eq!(
            canonical("11170 (HS #24) NE 134th Ct NE, Redmond, WA 98052"),
            "11170 ne 134th ct ne|apt 24|redmond|wa|98052"
        );
        assert_eq!(
            canonical("7425 166th Ave NE c230, Redmond, WA 98052"),
            "7425 166th ave ne|apt c230|redmond|wa|98052"
        );
        assert_eq!(canonical("1203 X Dave Road, Redmond, WA 98052"), canonical("1203 X Dave Rd,Redmond, WA 98052"));
    }

    #[test]
    fn multi_word_states_and_cities_are_split_correctly() {
        let address = normalize_address("10 Ocean Pkwy, New York, New York 11218").unwrap();
        assert_eq!(address.city, "new york");
        assert_eq!(address.state, "ny");
        let single = normalize_address("44 Elm Street Unit 2 Kansas City MO 64105").unwrap();
        assert_eq!(single.city, "kansas city");
        assert_eq!(single.unit.as_deref(), Some("apt 2"));
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        assert_eq!(normalize_address("  "), Err(IdentityError::Empty));
        assert!(matches!(
            normalize_address("123 Main St, Seattle, WA"),
            Err(IdentityError::MissingZip(_))
        ));
        assert!(matches!(
            normalize_address("123 Main St, Seattle, 98101"),
            Err(IdentityError::MissingState(_))
        ));
        assert!(matches!(
            normalize_address("Main St, Seattle, WA 98101"),
            Err(IdentityError::MissingStreetNumber(_))
        ));
        assert!(matches!(
            normalize_address("PO Box 12, Seattle, WA 98101"),
            Err(IdentityError::Unsupported { .. })
        ));
        assert!(matches!(
            normalize_address("123 broadway seattle wa 98101"),
            Err(IdentityError::AmbiguousStreet(_))
        ));
    }

    #[test]
    fn display_line_is_human_readable() {
        let address = normalize_address("123 main street unit 4b seattle wa 98101").unwrap();
        assert_eq!(address.display_line(), "123 Main St Apt 4b, Seattle, WA 98101");
    }
}

//! Naming rules for third-party resources
//!
//! A declaration named `foo-bar.company.com` describes kind `FooBar` in group
//! `company.com`, served under the plural resource `foobars`.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NameError {
    #[error("resource name {0:?} is too short, expected <kind>.<domain>.<tld>")]
    TooShort(String),

    #[error("resource name {name:?} has an empty segment")]
    EmptySegment { name: String },

    #[error("resource name {name:?} contains invalid character {ch:?}")]
    InvalidCharacter { name: String, ch: char },
}

/// Split a declaration name into `(group, kind)`
pub fn extract_group_and_kind(name: &str) -> Result<(String, String), NameError> {
    if let Some(ch) = name
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-' || *c == '.'))
    {
        return Err(NameError::InvalidCharacter {
            name: name.to_string(),
            ch,
        });
    }

    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() < 3 {
        return Err(NameError::TooShort(name.to_string()));
    }
    if parts.iter().any(|p| p.is_empty()) {
        return Err(NameError::EmptySegment {
            name: name.to_string(),
        });
    }

    let kind = to_camel_case(parts[0]);
    if kind.is_empty() {
        return Err(NameError::EmptySegment {
            name: name.to_string(),
        });
    }

    Ok((parts[1..].join("."), kind))
}

fn to_camel_case(segment: &str) -> String {
    segment
        .split('-')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

/// Lower-cased plural resource name for a kind
pub fn pluralize(kind: &str) -> String {
    let lower = kind.to_ascii_lowercase();

    if lower.ends_with('s')
        || lower.ends_with('x')
        || lower.ends_with('z')
        || lower.ends_with("ch")
        || lower.ends_with("sh")
    {
        return format!("{}es", lower);
    }

    if let Some(stem) = lower.strip_suffix('y') {
        let consonant_before = stem
            .chars()
            .last()
            .map(|c| !matches!(c, 'a' | 'e' | 'i' | 'o' | 'u'))
            .unwrap_or(false);
        if consonant_before {
            return format!("{}ies", stem);
        }
    }

    format!("{}s", lower)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_group_and_kind() {
        let (group, kind) = extract_group_and_kind("foo.company.com").unwrap();
        assert_eq!(group, "company.com");
        assert_eq!(kind, "Foo");

        let (group, kind) = extract_group_and_kind("cron-tab.stable.example.io").unwrap();
        assert_eq!(group, "stable.example.io");
        assert_eq!(kind, "CronTab");
    }

    #[test]
    fn test_extract_rejects_bad_names() {
        assert_eq!(
            extract_group_and_kind("foo.com"),
            Err(NameError::TooShort("foo.com".to_string()))
        );
        assert!(matches!(
            extract_group_and_kind("foo..com"),
            Err(NameError::EmptySegment { .. })
        ));
        assert!(matches!(
            extract_group_and_kind("Foo.company.com"),
            Err(NameError::InvalidCharacter { ch: 'F', .. })
        ));
        assert!(matches!(
            extract_group_and_kind("-.company.com"),
            Err(NameError::EmptySegment { .. })
        ));
    }

    #[test]
    fn test_pluralize() {
        assert_eq!(pluralize("Foo"), "foos");
        assert_eq!(pluralize("CronTab"), "crontabs");
        assert_eq!(pluralize("Policy"), "policies");
        assert_eq!(pluralize("Gateway"), "gateways");
        assert_eq!(pluralize("Ingress"), "ingresses");
        assert_eq!(pluralize("Box"), "boxes");
        assert_eq!(pluralize("Patch"), "patches");
    }
}

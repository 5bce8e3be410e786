// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Config validation for pools and volumes.
//!
//! Each driver declares a rule table mapping option keys to validator
//! functions. Validation walks the whole table and reports every failing
//! key in one [`Error::ConfigInvalid`] so a caller can fix the entire
//! config in one pass. Keys under `user.` are free-form and never
//! validated.

use std::collections::BTreeMap;

use crate::error::Error;
use crate::units::parse_byte_size;

pub type Validator = Box<dyn Fn(&str) -> Result<(), String> + Send + Sync>;
pub type Rules = BTreeMap<&'static str, Validator>;

pub fn is_any(_: &str) -> Result<(), String> {
    Ok(())
}

pub fn is_bool(value: &str) -> Result<(), String> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "false" | "yes" | "no" | "1" | "0" | "on" | "off" => Ok(()),
        _ => Err(format!("{value:?} is not a boolean")),
    }
}

pub fn is_size(value: &str) -> Result<(), String> {
    parse_byte_size(value).map(|_| ())
}

pub fn is_uint(value: &str) -> Result<(), String> {
    value
        .parse::<u64>()
        .map(|_| ())
        .map_err(|_| format!("{value:?} is not an unsigned integer"))
}

/// Restricts a value to a fixed set of choices.
pub fn one_of(choices: &'static [&'static str]) -> Validator {
    Box::new(move |value| {
        if choices.contains(&value) {
            Ok(())
        } else {
            Err(format!("{value:?} is not one of {choices:?}"))
        }
    })
}

/// Accepts the empty string, otherwise defers to `inner`.
pub fn optional(
    inner: impl Fn(&str) -> Result<(), String> + Send + Sync + 'static,
) -> Validator {
    Box::new(move |value| {
        if value.is_empty() {
            Ok(())
        } else {
            inner(value)
        }
    })
}

/// Reads a config value as a boolean, treating missing keys as false.
pub fn bool_value(config: &BTreeMap<String, String>, key: &str) -> bool {
    matches!(
        config.get(key).map(|v| v.to_ascii_lowercase()).as_deref(),
        Some("true") | Some("yes") | Some("1") | Some("on")
    )
}

/// Validates `config` against `rules`, reporting every violation.
/// Unknown keys are removed when `remove_unknown` is set (used when
/// inheriting config across pools), otherwise reported as violations.
pub fn validate(
    config: &mut BTreeMap<String, String>,
    rules: &Rules,
    remove_unknown: bool,
) -> Result<(), Error> {
    let mut problems = Vec::new();

    for (key, rule) in rules {
        if let Some(value) = config.get(*key) {
            if let Err(msg) = rule(value) {
                problems.push(format!("{key}: {msg}"));
            }
        }
    }

    let unknown: Vec<String> = config
        .keys()
        .filter(|k| {
            !rules.contains_key(k.as_str()) && !k.starts_with("user.")
        })
        .cloned()
        .collect();
    for key in unknown {
        if remove_unknown {
            config.remove(&key);
        } else {
            problems.push(format!("{key}: unknown option"));
        }
    }

    if !problems.is_empty() {
        return Err(Error::ConfigInvalid(problems));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> Rules {
        let mut rules = Rules::new();
        rules.insert("size", optional(is_size));
        rules.insert("security.shifted", optional(is_bool));
        rules.insert(
            "block.filesystem",
            optional(one_of(&["ext4", "xfs", "btrfs"])),
        );
        rules
    }

    #[test]
    fn all_violations_reported_together() {
        let mut config = BTreeMap::from([
            ("size".to_string(), "banana".to_string()),
            ("security.shifted".to_string(), "maybe".to_string()),
            ("block.filesystem".to_string(), "ext4".to_string()),
        ]);
        let err = validate(&mut config, &rules(), false).unwrap_err();
        match err {
            Error::ConfigInvalid(problems) => {
                assert_eq!(problems.len(), 2);
                assert!(problems.iter().any(|p| p.starts_with("size:")));
                assert!(problems
                    .iter()
                    .any(|p| p.starts_with("security.shifted:")));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_keys_rejected_or_removed() {
        let mut config =
            BTreeMap::from([("rocket.fuel".to_string(), "lots".to_string())]);
        assert!(validate(&mut config.clone(), &rules(), false).is_err());

        validate(&mut config, &rules(), true).unwrap();
        assert!(config.is_empty());
    }

    #[test]
    fn user_keys_always_pass() {
        let mut config =
            BTreeMap::from([("user.note".to_string(), "mine".to_string())]);
        validate(&mut config, &rules(), false).unwrap();
        assert_eq!(config.len(), 1);
    }

    #[test]
    fn empty_values_pass_optional() {
        let mut config = BTreeMap::from([
            ("size".to_string(), String::new()),
            ("block.filesystem".to_string(), String::new()),
        ]);
        validate(&mut config, &rules(), false).unwrap();
    }
}

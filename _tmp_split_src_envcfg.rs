// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Environment variable conventions layered on top of the TOML config,
//! grounded in `original_source/app/wyzebridge/bridge_utils.py`: per-camera
//! overrides (`X_<URI>`), the `X_ALL` fallback, and the small set of parsing
//! styles the upstream bridge uses for its env knobs.

use std::collections::HashSet;
use std::env;

/// How [`env_bool`] should coerce a non-empty value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Style {
    Raw,
    Bool,
    Int,
    Upper,
}

/// Reads `name` (case/dash-insensitive), treating `no`/`none`/`false`
/// (case-insensitive) as empty, and coercing per `style`.
pub fn env_bool(name: &str, default_empty: &str, default_present: &str, style: Style) -> String {
    let key = name.to_ascii_uppercase().replace('-', "_");
    let mut value = env::var(&key).unwrap_or_default();
    value = value.trim_matches(|c: char| "'\" \n\t\r".contains(c)).to_string();
    if matches!(value.to_ascii_lowercase().as_str(), "no" | "none" | "false") {
        value.clear();
    }

    match style {
        Style::Bool => {
            if !value.is_empty() || !default_empty.is_empty() {
                "true".into()
            } else {
                String::new()
            }
        }
        Style::Int => {
            let digits: String = if value.is_empty() { default_empty.to_string() } else { value };
            let digits: String = digits.chars().filter(|c| c.is_ascii_digit()).collect();
            if digits.is_empty() { "0".into() } else { digits }
        }
        Style::Upper if !value.is_empty() => value.to_ascii_uppercase(),
        _ => {
            if !value.is_empty() {
                if !default_present.is_empty() { default_present.to_string() } else { value.to_ascii_lowercase() }
            } else if !default_empty.is_empty() {
                default_empty.to_string()
            } else {
                String::new()
            }
        }
    }
}

/// Resolve `ENV_<uri>`, falling back to plain `ENV`, then `ENV_ALL`.
pub fn env_cam(name: &str, uri: &str, default: &str) -> String {
    let all_fallback = env_bool(&format!("{name}_all"), default, "", Style::Raw);
    let plain_fallback = env_bool(name, &all_fallback, "", Style::Raw);
    env_bool(&format!("{name}_{uri}"), &plain_fallback, "", Style::Raw)
}

/// A comma-separated environment list, trimmed, uppercased, colon-stripped.
pub fn env_list(name: &str) -> HashSet<String> {
    env::var(name.to_ascii_uppercase())
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim_matches(|c: char| "'\"\n ".contains(c)).to_ascii_uppercase().replace(':', ""))
        .filter(|s| !s.is_empty())
        .collect()
}

/// Split a value like `"CW30"` into its alphabetic prefix and numeric
/// remainder, clamped to `>= min`.
pub fn split_int_str(value: &str, min: i64, default: i64) -> (String, i64) {
    let alpha: String = value.chars().filter(|c| c.is_ascii_alphabetic()).collect();
    let digits: String = value.chars().filter(|c| c.is_ascii_digit()).collect();
    let parsed = if digits.is_empty() { default } else { digits.parse().unwrap_or(default) };
    (alpha, parsed.max(min))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn env_bool_treats_falsy_words_as_empty() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("TEST_FLAG_ENVCFG", "none");
        assert_eq!(env_bool("TEST_FLAG_ENVCFG", "fallback", "", Style::Raw), "fallback");
        env::remove_var("TEST_FLAG_ENVCFG");
    }

    #[test]
    fn env_cam_prefers_uri_specific_value() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("QUALITY_FRONT_DOOR", "SD30");
        env::set_var("QUALITY_ALL", "HD120");
        assert_eq!(env_cam("QUALITY", "FRONT_DOOR", ""), "sd30");
        env::remove_var("QUALITY_FRONT_DOOR");
        env::remove_var("QUALITY_ALL");
    }

    #[test]
    fn split_int_str_extracts_prefix_and_digits() {
        assert_eq!(split_int_str("CW30", 0, 0), ("CW".to_string(), 30));
        assert_eq!(split_int_str("CCW", 5, 5), ("CCW".to_string(), 5));
    }

    #[test]
    fn env_list_normalizes_entries() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("FILTER_NAMES_ENVCFG_TEST", " front:door , Garage ");
        let set = env_list("FILTER_NAMES_ENVCFG_TEST");
        assert!(set.contains("FRONTDOOR"));
        assert!(set.contains("GARAGE"));
        env::remove_var("FILTER_NAMES_ENVCFG_TEST");
    }
}



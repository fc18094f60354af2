//! Line-oriented parser and writer for the firmware tool's setting
//! dump format (SPEC_FULL.md §4.2/§6):
//!
//! ```text
//! Setup Question = <Name>
//! Token         = <opaque>
//! Offset        = <opaque>
//! Width         = <opaque>
//! BIOS Default  = <value>
//! Value         = <value>
//! ```
//!
//! Blocks are terminated by a blank line or the next `Setup Question`.

use crate::error::SettingStoreError;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// A firmware setting's value, tagged by how it was represented in
/// the dump. Carrying the tag (rather than collapsing everything to
/// an integer) is what lets `format_for_write` round-trip hex values
/// as hex and booleans as `0`/`1` instead of arbitrary decimal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Hex(i64),
    Float(f64),
    Str(String),
}

impl SettingValue {
    pub fn declared_type(&self) -> &'static str {
        match self {
            SettingValue::Bool(_) => "bool",
            SettingValue::Int(_) => "int",
            SettingValue::Hex(_) => "hex",
            SettingValue::Float(_) => "float",
            SettingValue::Str(_) => "string",
        }
    }

    /// Project this value to an integer the way `read_value` does:
    /// hex/int pass through, floats truncate, bools become 0/1, and an
    /// unparseable string falls back to a hash of itself (see
    /// SPEC_FULL.md §9's open question on the hash fallback).
    pub fn as_int(&self) -> i64 {
        match self {
            SettingValue::Bool(b) => *b as i64,
            SettingValue::Int(v) | SettingValue::Hex(v) => *v,
            SettingValue::Float(f) => *f as i64,
            SettingValue::Str(s) => hash_fallback(s),
        }
    }
}

/// `hash(val_str) % 10000`, reimplemented with `DefaultHasher` and
/// `rem_euclid` so the result is always non-negative regardless of
/// hash sign, matching Python's `%` semantics for this use.
pub fn hash_fallback(raw: &str) -> i64 {
    let mut hasher = DefaultHasher::new();
    raw.hash(&mut hasher);
    (hasher.finish() as i64).rem_euclid(10_000)
}

/// Parse a single `Value`/`BIOS Default`-style raw string into a
/// typed [`SettingValue`], per SPEC_FULL.md §4.2's six-rule order.
pub fn parse_value(raw: &str) -> SettingValue {
    let trimmed = raw.trim();
    let lower = trimmed.to_lowercase();

    if let Some(hex_digits) = lower.strip_prefix("0x") {
        if let Ok(v) = i64::from_str_radix(hex_digits, 16) {
            return SettingValue::Hex(v);
        }
    }
    if let Some(hex_digits) = lower.strip_suffix('h') {
        if let Ok(v) = i64::from_str_radix(hex_digits, 16) {
            return SettingValue::Hex(v);
        }
    }
    if trimmed == "0" || trimmed == "1" {
        return SettingValue::Bool(trimmed == "1");
    }
    if let Ok(v) = trimmed.parse::<i64>() {
        return SettingValue::Int(v);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        return SettingValue::Float(f);
    }
    SettingValue::Str(trimmed.to_string())
}

/// Format `new_value` for writing back, preserving the representation
/// implied by `previous`: boolean stays `0`/`1`, hex stays
/// uppercase `0x%X`, everything else is plain decimal.
pub fn format_for_write(new_value: i64, previous: &SettingValue) -> String {
    match previous {
        SettingValue::Bool(_) => {
            if new_value != 0 {
                "1".to_string()
            } else {
                "0".to_string()
            }
        }
        SettingValue::Hex(_) => format!("0x{:X}", new_value),
        _ => new_value.to_string(),
    }
}

/// One parsed `Setup Question` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedSetting {
    pub name: String,
    pub value: SettingValue,
    pub raw_value: String,
    pub default_raw: Option<String>,
}

/// Parse an entire dump into its ordered list of settings.
pub fn parse_all(dump: &str) -> Vec<ParsedSetting> {
    let mut settings = Vec::new();
    let mut current_name: Option<String> = None;
    let mut current_value: Option<SettingValue> = None;
    let mut current_raw: Option<String> = None;
    let mut current_default: Option<String> = None;

    let flush = |settings: &mut Vec<ParsedSetting>,
                 name: &mut Option<String>,
                 value: &mut Option<SettingValue>,
                 raw: &mut Option<String>,
                 default: &mut Option<String>| {
        if let (Some(n), Some(v), Some(r)) = (name.take(), value.take(), raw.take()) {
            settings.push(ParsedSetting {
                name: n,
                value: v,
                raw_value: r,
                default_raw: default.take(),
            });
        } else {
            *name = None;
            *value = None;
            *raw = None;
            *default = None;
        }
    };

    for line in dump.lines() {
        let trimmed = line.trim();

        if trimmed.starts_with("Setup Question") {
            flush(
                &mut settings,
                &mut current_name,
                &mut current_value,
                &mut current_raw,
                &mut current_default,
            );
            if let Some((_, rhs)) = trimmed.split_once('=') {
                current_name = Some(rhs.trim().to_string());
            }
            continue;
        }

        if current_name.is_none() || !trimmed.contains('=') {
            continue;
        }

        let (key, value) = trimmed.split_once('=').unwrap();
        let key = key.trim();
        let value = value.trim();

        match key {
            "Value" => {
                current_value = Some(parse_value(value));
                current_raw = Some(value.to_string());
            }
            "BIOS Default" => {
                current_default = Some(value.to_string());
            }
            _ => {}
        }
    }
    flush(
        &mut settings,
        &mut current_name,
        &mut current_value,
        &mut current_raw,
        &mut current_default,
    );

    settings
}

/// Locate `name`'s block in `dump` and rewrite its `Value` line to
/// `new_value_str`, returning a script containing only that block
/// (the minimal import script the firmware tool expects).
pub fn build_write_script(
    dump: &str,
    name: &str,
    new_value_str: &str,
) -> Result<String, SettingStoreError> {
    let name_lower = name.to_lowercase();
    let mut section_lines: Vec<String> = Vec::new();
    let mut in_section = false;
    let mut found = false;

    for line in dump.lines() {
        let trimmed = line.trim();
        if !in_section {
            if trimmed.starts_with("Setup Question") && trimmed.to_lowercase().contains(&name_lower)
            {
                in_section = true;
                found = true;
                section_lines.push(line.to_string());
            }
        } else {
            if trimmed.starts_with("Setup Question") || trimmed.is_empty() {
                break;
            }
            if trimmed.starts_with("Value") {
                if let Some(eq_pos) = line.find('=') {
                    let prefix = &line[..=eq_pos];
                    section_lines.push(format!("{} {}", prefix, new_value_str));
                } else {
                    section_lines.push(line.to_string());
                }
            } else {
                section_lines.push(line.to_string());
            }
        }
    }

    if !found {
        return Err(SettingStoreError::SettingNotFound(name.to_string()));
    }

    Ok(section_lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_DUMP: &str = "\
Setup Question = Long Duration Power Limit
Token         = 0x1A2B
Offset        = 0x10
Width         = 8
BIOS Default  = 65
Value         = 65

Setup Question = Core Voltage Offset
Token         = 0x1A2C
Offset        = 0x20
Width         = 8
BIOS Default  = 0
Value         = 0xFFEC

Setup Question = CPU C State
Token         = 0x1A2D
Offset        = 0x30
Width         = 1
BIOS Default  = 1
Value         = 1
";

    #[test]
    fn parse_value_rules_in_order() {
        assert_eq!(parse_value("0x1F"), SettingValue::Hex(0x1F));
        assert_eq!(parse_value("1Fh"), SettingValue::Hex(0x1F));
        assert_eq!(parse_value("42"), SettingValue::Int(42));
        assert_eq!(parse_value("3.5"), SettingValue::Float(3.5));
        assert_eq!(parse_value("0"), SettingValue::Bool(false));
        assert_eq!(parse_value("1"), SettingValue::Bool(true));
        assert_eq!(
            parse_value("Auto"),
            SettingValue::Str("Auto".to_string())
        );
    }

    #[test]
    fn parse_all_extracts_three_blocks() {
        let settings = parse_all(SAMPLE_DUMP);
        assert_eq!(settings.len(), 3);
        assert_eq!(settings[0].name, "Long Duration Power Limit");
        assert_eq!(settings[0].value, SettingValue::Int(65));
        assert_eq!(settings[1].name, "Core Voltage Offset");
        assert_eq!(settings[1].value, SettingValue::Hex(0xFFEC));
        assert_eq!(settings[2].value, SettingValue::Bool(true));
    }

    #[test]
    fn hex_value_round_trips_uppercase() {
        let previous = SettingValue::Hex(0x1F);
        assert_eq!(format_for_write(0x1F, &previous), "0x1F");
    }

    #[test]
    fn bool_value_round_trips_as_zero_or_one() {
        let previous = SettingValue::Bool(true);
        assert_eq!(format_for_write(0, &previous), "0");
        assert_eq!(format_for_write(1, &previous), "1");
    }

    #[test]
    fn decimal_value_round_trips_plain() {
        let previous = SettingValue::Int(65);
        assert_eq!(format_for_write(70, &previous), "70");
    }

    #[test]
    fn unparseable_value_hashes_to_nonnegative_stand_in() {
        let v = parse_value("Auto");
        let n = v.as_int();
        assert!((0..10_000).contains(&n));
    }

    #[test]
    fn build_write_script_replaces_only_the_value_line() {
        let script = build_write_script(SAMPLE_DUMP, "Core Voltage Offset", "0xFFD8").unwrap();
        assert!(script.contains("Setup Question = Core Voltage Offset"));
        assert!(script.contains("Value         = 0xFFD8"));
        assert!(!script.contains("CPU C State"));
    }

    #[test]
    fn build_write_script_errors_when_setting_missing() {
        let result = build_write_script(SAMPLE_DUMP, "Nonexistent Setting", "1");
        assert!(result.is_err());
    }
}

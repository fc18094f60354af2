//! Static keyword tables used to categorize and find firmware settings
//! by name. Kept separate from access logic per the "category tables"
//! design note: these are plain data, not behavior.

/// Category buckets, each a list of case-insensitive substrings
/// matched against a setting's name. First matching bucket wins, in
/// the order listed here; no match falls back to `"other"`.
pub const PARAM_CATEGORIES: &[(&str, &[&str])] = &[
    ("cpu_power", &["power limit", "pl1", "pl2", "ppt", "tdc", "edc", "tdp"]),
    (
        "cpu_freq",
        &["ratio", "multiplier", "turbo", "boost", "frequency", "clock", "bclk"],
    ),
    ("cpu_voltage", &["voltage", "vcore", "offset", "vid"]),
    ("memory", &["memory", "dram", "ram", "xmp", "docp", "timing"]),
    (
        "cpu_features",
        &["c-state", "hyper", "threading", "smt", "avx", "speedstep", "coolnquiet"],
    ),
];

/// Any setting whose name contains one of these is "performance related".
pub const PERFORMANCE_KEYWORDS: &[&str] = &[
    "cpu", "power", "limit", "ratio", "turbo", "boost", "overclock", "xmp", "docp",
    "performance", "frequency", "clock", "c-state", "voltage", "vcore", "offset",
    "c-states", "multiplier", "tdp", "pl1", "pl2", "ppt", "tdc", "edc", "smt",
    "hyper-threading", "threading", "avx", "memory", "dram", "timing", "speed",
    "bclk", "base clock", "intel speed step", "speedstep", "coolnquiet", "cool n quiet",
];

/// Any setting whose name contains one of these requires a reboot to
/// take effect once written.
pub const REBOOT_REQUIRED_KEYWORDS: &[&str] =
    &["memory", "xmp", "docp", "bclk", "base clock", "smt", "hyper-threading"];

pub const VOLTAGE_FINDER_KEYWORDS: &[&str] =
    &["voltage", "vcore", "offset", "vid", "core volt"];

pub const XMP_FINDER_KEYWORDS: &[&str] =
    &["xmp", "docp", "memory profile", "extreme memory profile"];

pub const CSTATE_FINDER_KEYWORDS: &[&str] =
    &["c-state", "c state", "c1e", "c3", "c6", "c7", "package c state"];

pub const TURBO_FINDER_KEYWORDS: &[&str] =
    &["turbo", "boost", "intel turbo", "precision boost", "core performance"];

pub const POWER_LIMIT_FINDER_KEYWORDS: &[&str] = &[
    "power limit", "tdp", "thermal design power", "pl1", "pl2", "long duration",
    "short duration", "package power", "ppt", "tdc", "edc", "power target",
];

/// Candidate setting names for the initial PL1 read, first match wins.
pub const PL1_CANDIDATES: &[&str] =
    &["Long Duration Power Limit", "Package Power Limit 1", "PPT"];

/// Candidate setting names for the initial PL2 read, first match wins.
pub const PL2_CANDIDATES: &[&str] =
    &["Short Duration Power Limit", "Package Power Limit 2", "PPT Limit"];

/// Candidate setting names for the initial voltage-offset read, first match wins.
pub const VOLTAGE_OFFSET_CANDIDATES: &[&str] =
    &["Core Voltage Offset", "CPU Core Voltage Offset", "Vcore Offset"];

fn contains_any(haystack_lower: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|kw| haystack_lower.contains(kw))
}

/// Derive the category of a setting from its name (case-insensitive).
pub fn categorize(name: &str) -> &'static str {
    let lower = name.to_lowercase();
    for (category, keywords) in PARAM_CATEGORIES {
        if contains_any(&lower, keywords) {
            return category;
        }
    }
    "other"
}

pub fn is_performance_related(name: &str) -> bool {
    contains_any(&name.to_lowercase(), PERFORMANCE_KEYWORDS)
}

pub fn requires_reboot(name: &str) -> bool {
    contains_any(&name.to_lowercase(), REBOOT_REQUIRED_KEYWORDS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categorizes_voltage_offset_as_cpu_voltage() {
        assert_eq!(categorize("CPU Core Voltage Offset"), "cpu_voltage");
    }

    #[test]
    fn categorizes_unknown_setting_as_other() {
        assert_eq!(categorize("Quiet Boot"), "other");
    }

    #[test]
    fn memory_settings_require_reboot() {
        assert!(requires_reboot("DRAM Frequency"));
        assert!(requires_reboot("Extreme Memory Profile (XMP)"));
        assert!(!requires_reboot("Long Duration Power Limit"));
    }

    #[test]
    fn performance_related_is_broad() {
        assert!(is_performance_related("Core Voltage Offset"));
        assert!(is_performance_related("CPU Ratio"));
        assert!(!is_performance_related("Quiet Boot"));
    }
}

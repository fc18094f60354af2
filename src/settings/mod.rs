//! Setting Store (C1.2 / SPEC_FULL.md §4.2): enumerates firmware
//! settings, reads value/type, writes values, and snapshots/restores
//! the full dump. [`ScewinSettingStore`] talks to a SCEWIN-shaped
//! external tool via subprocess; [`MockSettingStore`] is an in-memory
//! double used by tests and the scenario suite.

pub mod parser;
pub mod tables;

use crate::error::SettingStoreError;
use parser::{ParsedSetting, SettingValue};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// A firmware setting as exposed to the rest of the engine
/// (SPEC_FULL.md §3's `Setting`).
#[derive(Debug, Clone)]
pub struct Setting {
    pub name: String,
    pub value: SettingValue,
    pub declared_type: &'static str,
    pub category: &'static str,
    pub performance_related: bool,
    pub reboot_required: bool,
}

impl Setting {
    fn from_parsed(parsed: &ParsedSetting) -> Self {
        Setting {
            name: parsed.name.clone(),
            value: parsed.value.clone(),
            declared_type: parsed.value.declared_type(),
            category: tables::categorize(&parsed.name),
            performance_related: tables::is_performance_related(&parsed.name),
            reboot_required: tables::requires_reboot(&parsed.name),
        }
    }
}

/// Abstraction over the external firmware-setting provider. The
/// Tuning Engine never talks to a concrete tool directly.
pub trait SettingStore {
    fn read_value(&self, name: &str) -> Result<i64, SettingStoreError>;
    fn read_type(&self, name: &str) -> Result<String, SettingStoreError>;
    fn write_value(&self, name: &str, new_value: i64) -> Result<(), SettingStoreError>;
    fn parse_all(&self) -> Result<HashMap<String, Setting>, SettingStoreError>;
    fn snapshot_to(&self, path: &Path) -> Result<(), SettingStoreError>;
    fn restore_from(&self, path: &Path) -> Result<bool, SettingStoreError>;

    fn find_power_limit_parameters(&self) -> Result<Vec<String>, SettingStoreError> {
        find_by_keywords(self, tables::POWER_LIMIT_FINDER_KEYWORDS, true)
    }

    fn find_voltage_parameters(&self) -> Result<Vec<String>, SettingStoreError> {
        find_by_keywords(self, tables::VOLTAGE_FINDER_KEYWORDS, true)
    }

    fn find_xmp_parameters(&self) -> Result<Vec<String>, SettingStoreError> {
        find_by_keywords(self, tables::XMP_FINDER_KEYWORDS, false)
    }

    fn find_cstate_parameters(&self) -> Result<Vec<String>, SettingStoreError> {
        find_by_keywords(self, tables::CSTATE_FINDER_KEYWORDS, false)
    }

    fn find_turbo_boost_parameters(&self) -> Result<Vec<String>, SettingStoreError> {
        find_by_keywords(self, tables::TURBO_FINDER_KEYWORDS, true)
    }
}

fn find_by_keywords<S: SettingStore + ?Sized>(
    store: &S,
    keywords: &[&str],
    performance_only: bool,
) -> Result<Vec<String>, SettingStoreError> {
    let settings = store.parse_all()?;
    let mut names: Vec<String> = settings
        .values()
        .filter(|s| !performance_only || s.performance_related)
        .filter(|s| {
            let lower = s.name.to_lowercase();
            keywords.iter().any(|kw| lower.contains(kw))
        })
        .map(|s| s.name.clone())
        .collect();
    names.sort();
    Ok(names)
}

/// Setting Store backed by a SCEWIN-shaped external firmware tool.
pub struct ScewinSettingStore {
    tool_path: PathBuf,
    dump_file: PathBuf,
    script_file: PathBuf,
    backup_file: PathBuf,
    /// Raw dump text and its parsed form, invalidated on every write
    /// (SPEC_FULL.md §4.2's caching note / §5's ordering guarantee).
    cache: RefCell<Option<(String, HashMap<String, ParsedSetting>)>>,
}

impl ScewinSettingStore {
    /// Construct a store and take the one-time session backup. Only
    /// a missing tool binary is fatal; a failed backup is logged and
    /// swallowed, matching the source's own init-time leniency.
    pub fn new(tool_path: PathBuf) -> Result<Self, SettingStoreError> {
        if !tool_path.exists() {
            return Err(SettingStoreError::ToolMissing(
                tool_path.display().to_string(),
            ));
        }
        let tmp = std::env::temp_dir();
        let store = ScewinSettingStore {
            tool_path,
            dump_file: tmp.join("bios_out.txt"),
            script_file: tmp.join("bios_set.txt"),
            backup_file: tmp.join("bios_backup.txt"),
            cache: RefCell::new(None),
        };

        match store.export_all() {
            Ok(dump) => {
                if let Err(e) = fs::write(&store.backup_file, &dump) {
                    log::warn!("failed to persist BIOS backup: {e}");
                }
            }
            Err(e) => log::warn!("failed to create BIOS settings backup: {e}"),
        }

        Ok(store)
    }

    fn export_all(&self) -> Result<String, SettingStoreError> {
        log::debug!("exporting BIOS settings to {}", self.dump_file.display());
        let output = Command::new(&self.tool_path)
            .arg("/o")
            .arg("/s")
            .arg(&self.dump_file)
            .output()
            .map_err(|e| SettingStoreError::ToolIo {
                op: "export".to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(SettingStoreError::ToolIo {
                op: "export".to_string(),
                reason: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        if !self.dump_file.exists() {
            return Err(SettingStoreError::ToolIo {
                op: "export".to_string(),
                reason: format!("output file {} was not created", self.dump_file.display()),
            });
        }

        let content = fs::read_to_string(&self.dump_file)?;
        if content.trim().is_empty() {
            return Err(SettingStoreError::ToolIo {
                op: "export".to_string(),
                reason: "export produced an empty dump".to_string(),
            });
        }
        Ok(content)
    }

    fn ensure_cached(&self) -> Result<(), SettingStoreError> {
        if self.cache.borrow().is_some() {
            return Ok(());
        }
        let dump = self.export_all()?;
        let parsed: HashMap<String, ParsedSetting> = parser::parse_all(&dump)
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();
        *self.cache.borrow_mut() = Some((dump, parsed));
        Ok(())
    }

    fn cached_setting(&self, name: &str) -> Result<ParsedSetting, SettingStoreError> {
        self.ensure_cached()?;
        let cache = self.cache.borrow();
        let (_, parsed) = cache.as_ref().unwrap();
        parsed
            .get(name)
            .cloned()
            .ok_or_else(|| SettingStoreError::SettingNotFound(name.to_string()))
    }
}

impl SettingStore for ScewinSettingStore {
    fn read_value(&self, name: &str) -> Result<i64, SettingStoreError> {
        let setting = self.cached_setting(name)?;
        if matches!(setting.value, SettingValue::Str(_)) {
            log::debug!(
                "setting '{name}' has an unparseable value '{}', falling back to hash stand-in",
                setting.raw_value
            );
        }
        Ok(setting.value.as_int())
    }

    fn read_type(&self, name: &str) -> Result<String, SettingStoreError> {
        let setting = self.cached_setting(name)?;
        Ok(setting.value.declared_type().to_string())
    }

    fn write_value(&self, name: &str, new_value: i64) -> Result<(), SettingStoreError> {
        self.ensure_cached()?;
        let (dump, new_value_str) = {
            let cache = self.cache.borrow();
            let (dump, parsed) = cache.as_ref().unwrap();
            let current = parsed
                .get(name)
                .ok_or_else(|| SettingStoreError::SettingNotFound(name.to_string()))?;
            (dump.clone(), parser::format_for_write(new_value, &current.value))
        };

        let script = parser::build_write_script(&dump, name, &new_value_str)?;
        fs::write(&self.script_file, &script)?;

        log::info!("applying BIOS setting change: {name} = {new_value_str}");
        let output = Command::new(&self.tool_path)
            .arg("/i")
            .arg("/s")
            .arg(&self.script_file)
            .output()
            .map_err(|e| SettingStoreError::ToolIo {
                op: "import".to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() || !output.stderr.is_empty() {
            return Err(SettingStoreError::ToolIo {
                op: "import".to_string(),
                reason: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        // Invalidate: the next read must observe this write (§5 ordering guarantee).
        *self.cache.borrow_mut() = None;
        Ok(())
    }

    fn parse_all(&self) -> Result<HashMap<String, Setting>, SettingStoreError> {
        self.ensure_cached()?;
        let cache = self.cache.borrow();
        let (_, parsed) = cache.as_ref().unwrap();
        Ok(parsed
            .values()
            .map(|p| (p.name.clone(), Setting::from_parsed(p)))
            .collect())
    }

    fn snapshot_to(&self, path: &Path) -> Result<(), SettingStoreError> {
        let dump = self.export_all()?;
        fs::write(path, dump)?;
        Ok(())
    }

    fn restore_from(&self, path: &Path) -> Result<bool, SettingStoreError> {
        if !path.exists() {
            log::error!("BIOS backup file not found at {}", path.display());
            return Ok(false);
        }
        log::info!("restoring BIOS settings from {}", path.display());
        match Command::new(&self.tool_path).arg("/i").arg("/s").arg(path).output() {
            Ok(output) if output.status.success() => {
                *self.cache.borrow_mut() = None;
                Ok(true)
            }
            Ok(output) => {
                log::error!(
                    "BIOS restore failed: {}",
                    String::from_utf8_lossy(&output.stderr)
                );
                Ok(false)
            }
            Err(e) => {
                log::error!("BIOS restore failed: {e}");
                Ok(false)
            }
        }
    }
}

/// In-memory `SettingStore` used by unit and scenario tests: no
/// subprocess, no filesystem except for `snapshot_to`/`restore_from`.
pub struct MockSettingStore {
    settings: RefCell<HashMap<String, ParsedSetting>>,
}

impl MockSettingStore {
    pub fn new() -> Self {
        MockSettingStore {
            settings: RefCell::new(HashMap::new()),
        }
    }

    /// Seed a setting with a raw value string, as it would appear in
    /// a real dump (e.g. `"65"`, `"0xFFEC"`, `"1"`).
    pub fn seed(&self, name: &str, raw_value: &str) {
        self.settings.borrow_mut().insert(
            name.to_string(),
            ParsedSetting {
                name: name.to_string(),
                value: parser::parse_value(raw_value),
                raw_value: raw_value.to_string(),
                default_raw: None,
            },
        );
    }
}

impl Default for MockSettingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingStore for MockSettingStore {
    fn read_value(&self, name: &str) -> Result<i64, SettingStoreError> {
        self.settings
            .borrow()
            .get(name)
            .map(|s| s.value.as_int())
            .ok_or_else(|| SettingStoreError::SettingNotFound(name.to_string()))
    }

    fn read_type(&self, name: &str) -> Result<String, SettingStoreError> {
        self.settings
            .borrow()
            .get(name)
            .map(|s| s.value.declared_type().to_string())
            .ok_or_else(|| SettingStoreError::SettingNotFound(name.to_string()))
    }

    fn write_value(&self, name: &str, new_value: i64) -> Result<(), SettingStoreError> {
        let mut settings = self.settings.borrow_mut();
        let current = settings
            .get(name)
            .ok_or_else(|| SettingStoreError::SettingNotFound(name.to_string()))?;
        let raw = parser::format_for_write(new_value, &current.value);
        let value = parser::parse_value(&raw);
        settings.insert(
            name.to_string(),
            ParsedSetting {
                name: name.to_string(),
                value,
                raw_value: raw,
                default_raw: current.default_raw.clone(),
            },
        );
        Ok(())
    }

    fn parse_all(&self) -> Result<HashMap<String, Setting>, SettingStoreError> {
        Ok(self
            .settings
            .borrow()
            .values()
            .map(|p| (p.name.clone(), Setting::from_parsed(p)))
            .collect())
    }

    fn snapshot_to(&self, path: &Path) -> Result<(), SettingStoreError> {
        let body = serde_json::to_string_pretty(&*self.settings.borrow())
            .map_err(|e| SettingStoreError::ToolIo {
                op: "snapshot".to_string(),
                reason: e.to_string(),
            })?;
        fs::write(path, body)?;
        Ok(())
    }

    fn restore_from(&self, path: &Path) -> Result<bool, SettingStoreError> {
        if !path.exists() {
            return Ok(false);
        }
        let content = fs::read_to_string(path)?;
        let restored: HashMap<String, ParsedSetting> =
            serde_json::from_str(&content).map_err(|e| SettingStoreError::ToolIo {
                op: "restore".to_string(),
                reason: e.to_string(),
            })?;
        *self.settings.borrow_mut() = restored;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_store_read_write_round_trip() {
        let store = MockSettingStore::new();
        store.seed("Long Duration Power Limit", "65");
        assert_eq!(store.read_value("Long Duration Power Limit").unwrap(), 65);
        store.write_value("Long Duration Power Limit", 70).unwrap();
        assert_eq!(store.read_value("Long Duration Power Limit").unwrap(), 70);
    }

    #[test]
    fn mock_store_preserves_hex_format_on_write() {
        let store = MockSettingStore::new();
        store.seed("Core Voltage Offset", "0x1F");
        store.write_value("Core Voltage Offset", 0x20).unwrap();
        assert_eq!(store.read_type("Core Voltage Offset").unwrap(), "hex");
        assert_eq!(store.read_value("Core Voltage Offset").unwrap(), 0x20);
    }

    #[test]
    fn mock_store_snapshot_restore_round_trip() {
        let store = MockSettingStore::new();
        store.seed("PPT", "65");
        store.seed("CPU C State", "1");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        store.snapshot_to(&path).unwrap();

        store.write_value("PPT", 999).unwrap();
        assert_eq!(store.read_value("PPT").unwrap(), 999);

        assert!(store.restore_from(&path).unwrap());
        assert_eq!(store.read_value("PPT").unwrap(), 65);
    }

    #[test]
    fn finders_filter_by_keyword_and_performance_relation() {
        let store = MockSettingStore::new();
        store.seed("Long Duration Power Limit", "65");
        store.seed("Extreme Memory Profile (XMP)", "0");
        store.seed("Quiet Boot", "1");

        let power = store.find_power_limit_parameters().unwrap();
        assert_eq!(power, vec!["Long Duration Power Limit".to_string()]);

        let xmp = store.find_xmp_parameters().unwrap();
        assert_eq!(xmp, vec!["Extreme Memory Profile (XMP)".to_string()]);
    }

    #[test]
    fn read_value_missing_setting_is_an_error() {
        let store = MockSettingStore::new();
        assert!(store.read_value("Does Not Exist").is_err());
    }
}

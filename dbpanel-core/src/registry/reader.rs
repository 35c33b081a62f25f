//! Registry readers: the live Windows registry, an always-empty reader for
//! other platforms, and an in-memory reader.

use super::{RegistryHive, RegistryValues};
use std::collections::BTreeMap;

/// Synchronous access to registry keys.
///
/// A key that does not exist or cannot be opened reads as `None`; readers
/// never distinguish "missing" from "denied".
pub trait RegistryReader: Send + Sync {
    /// Flattens a key's values into strings.
    fn read_values(&self, hive: RegistryHive, path: &str) -> Option<RegistryValues>;

    /// Names of a key's direct subkeys.
    fn subkeys(&self, hive: RegistryHive, path: &str) -> Option<Vec<String>>;
}

/// Reader for platforms without a registry; every key is absent.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableRegistry;

impl RegistryReader for UnavailableRegistry {
    fn read_values(&self, _hive: RegistryHive, _path: &str) -> Option<RegistryValues> {
        None
    }

    fn subkeys(&self, _hive: RegistryHive, _path: &str) -> Option<Vec<String>> {
        None
    }
}

/// In-memory registry with case-insensitive key paths.
///
/// Subkeys are derived from the stored paths, so adding
/// `SOFTWARE\MySQL AB\MySQL Server 8.0` makes `MySQL Server 8.0` a subkey of
/// `SOFTWARE\MySQL AB`.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegistry {
    keys: BTreeMap<(RegistryHive, String), (String, RegistryValues)>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method adding a key with its values.
    pub fn with_key<K, V>(
        mut self,
        hive: RegistryHive,
        path: &str,
        values: impl IntoIterator<Item = (K, V)>,
    ) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let values = values
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.keys
            .insert((hive, normalize(path)), (path.trim_matches('\\').to_string(), values));
        self
    }
}

impl RegistryReader for MemoryRegistry {
    fn read_values(&self, hive: RegistryHive, path: &str) -> Option<RegistryValues> {
        self.keys
            .get(&(hive, normalize(path)))
            .map(|(_, values)| values.clone())
    }

    fn subkeys(&self, hive: RegistryHive, path: &str) -> Option<Vec<String>> {
        let prefix = format!("{}\\", normalize(path));
        let mut children: Vec<String> = Vec::new();

        for ((key_hive, normalized), (original, _)) in &self.keys {
            if *key_hive != hive {
                continue;
            }
            let Some(rest) = normalized.strip_prefix(&prefix) else {
                continue;
            };
            let depth = rest.split('\\').next().map_or(0, str::len);
            // Recover the original casing of the child component.
            let start = original.len().saturating_sub(rest.len());
            let child: String = original
                .get(start..)
                .unwrap_or(rest)
                .chars()
                .take(depth)
                .collect();
            if !children.iter().any(|c| c.eq_ignore_ascii_case(&child)) {
                children.push(child);
            }
        }

        let exists = self.keys.contains_key(&(hive, normalize(path)));
        if children.is_empty() && !exists {
            None
        } else {
            Some(children)
        }
    }
}

fn normalize(path: &str) -> String {
    path.trim_matches('\\').to_ascii_lowercase()
}

/// Reader backed by the live Windows registry.
#[cfg(windows)]
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsRegistry;

#[cfg(windows)]
impl WindowsRegistry {
    fn open(hive: RegistryHive, path: &str) -> Option<winreg::RegKey> {
        use winreg::RegKey;
        use winreg::enums::{HKEY_CURRENT_USER, HKEY_LOCAL_MACHINE, KEY_READ};

        let root = match hive {
            RegistryHive::CurrentUser => RegKey::predef(HKEY_CURRENT_USER),
            RegistryHive::LocalMachine => RegKey::predef(HKEY_LOCAL_MACHINE),
        };
        root.open_subkey_with_flags(path, KEY_READ).ok()
    }

    fn value_to_string(value: &winreg::RegValue) -> Option<String> {
        use winreg::enums::RegType;
        use winreg::types::FromRegValue;

        match value.vtype {
            RegType::REG_SZ | RegType::REG_EXPAND_SZ => String::from_reg_value(value).ok(),
            RegType::REG_MULTI_SZ => Vec::<String>::from_reg_value(value)
                .ok()
                .map(|parts| parts.join(";")),
            RegType::REG_DWORD => u32::from_reg_value(value).ok().map(|v| v.to_string()),
            RegType::REG_QWORD => u64::from_reg_value(value).ok().map(|v| v.to_string()),
            _ => None,
        }
    }
}

#[cfg(windows)]
impl RegistryReader for WindowsRegistry {
    fn read_values(&self, hive: RegistryHive, path: &str) -> Option<RegistryValues> {
        let key = Self::open(hive, path)?;
        Some(
            key.enum_values()
                .filter_map(std::result::Result::ok)
                .filter_map(|(name, value)| Self::value_to_string(&value).map(|v| (name, v)))
                .collect(),
        )
    }

    fn subkeys(&self, hive: RegistryHive, path: &str) -> Option<Vec<String>> {
        let key = Self::open(hive, path)?;
        Some(key.enum_keys().filter_map(std::result::Result::ok).collect())
    }
}

/// Reader for the current platform.
pub fn system_registry() -> std::sync::Arc<dyn RegistryReader> {
    #[cfg(windows)]
    {
        std::sync::Arc::new(WindowsRegistry)
    }
    #[cfg(not(windows))]
    {
        std::sync::Arc::new(UnavailableRegistry)
    }
}

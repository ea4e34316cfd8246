//! Plain-text configuration store for instrument aliases and defaults.
//!
//! The store is an ordered list of records loaded from a single file:
//! `[name]` lines open a section, `key value` lines are options belonging to
//! the most recent section. Comments (`#`) and blank lines are dropped on
//! load. Ordering is significant and round-trips through save/load.

use std::fs;
use std::path::Path;

use crate::error::{Result, StoreError, TmError};

/// Default configuration store location
pub const DEFAULT_STORE_PATH: &str = "/usr/local/etc/opentmlib.store";

/// Maximum accepted store file size
const MAX_STORE_SIZE: usize = 50 * 1024;

const BANNER: &str = "# Instrument configuration store";

/// One store record. A record with an empty value is a section header and
/// its key carries the brackets (`[name]`).
#[derive(Debug, Clone, PartialEq, Eq)]
struct Record {
    key: String,
    value: String,
}

impl Record {
    fn is_header(&self) -> bool {
        self.value.is_empty()
    }
}

/// Alias lookup result: the resource string plus the remaining options of
/// the alias section, in file order.
#[derive(Debug)]
pub struct AliasEntry<'a> {
    pub address: &'a str,
    pub options: Vec<(&'a str, &'a str)>,
}

/// Section-structured options file, kept in insertion order
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConfigStore {
    records: Vec<Record>,
}

impl ConfigStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a store from `path`.
    ///
    /// Fails with `StoreError::FileSize` for files beyond ~50 KiB, with
    /// `StoreError::BadSection` for a section line not of the form `[name]`
    /// and with `StoreError::BadValue` for an option line with an empty
    /// value.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read(path.as_ref())?;
        if raw.len() > MAX_STORE_SIZE {
            return Err(StoreError::FileSize.into());
        }

        let contents = String::from_utf8_lossy(&raw);
        let mut records = Vec::new();
        for line in contents.split('\n') {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once(' ') {
                None => {
                    if !(line.starts_with('[') && line.ends_with(']') && line.len() > 2) {
                        return Err(StoreError::BadSection.into());
                    }
                    records.push(Record {
                        key: line.to_string(),
                        value: String::new(),
                    });
                }
                Some((key, value)) => {
                    if value.is_empty() {
                        return Err(StoreError::BadValue.into());
                    }
                    records.push(Record {
                        key: key.to_string(),
                        value: value.to_string(),
                    });
                }
            }
        }

        Ok(Self { records })
    }

    /// Write the store to `path` with a banner comment, one record per line.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut out = String::new();
        out.push_str(BANNER);
        out.push('\n');
        for record in &self.records {
            if record.is_header() {
                out.push('\n');
                out.push_str(&record.key);
                out.push('\n');
            } else {
                out.push_str(&record.key);
                out.push(' ');
                out.push_str(&record.value);
                out.push('\n');
            }
        }
        fs::write(path.as_ref(), out)?;
        Ok(())
    }

    /// Look up one option inside a section. First match wins; `None` when
    /// either the section or the option is absent.
    pub fn lookup(&self, section: &str, option: &str) -> Option<&str> {
        let start = self.section_start(section)?;
        self.records[start + 1..]
            .iter()
            .take_while(|r| !r.is_header())
            .find(|r| r.key == option)
            .map(|r| r.value.as_str())
    }

    /// Ordered `(key, value)` pairs of one section, or `None` when the
    /// section is absent.
    pub fn section_options(&self, section: &str) -> Option<Vec<(&str, &str)>> {
        let start = self.section_start(section)?;
        Some(
            self.records[start + 1..]
                .iter()
                .take_while(|r| !r.is_header())
                .map(|r| (r.key.as_str(), r.value.as_str()))
                .collect(),
        )
    }

    /// Resolve an alias section: `Ok(None)` when no such section exists,
    /// `StoreError::BadAlias` when the section lacks an `address` option.
    pub fn resolve_alias(&self, alias: &str) -> Result<Option<AliasEntry<'_>>> {
        let Some(options) = self.section_options(alias) else {
            return Ok(None);
        };
        let address = options
            .iter()
            .find(|(key, _)| *key == "address")
            .map(|(_, value)| *value)
            .ok_or(TmError::from(StoreError::BadAlias))?;
        Ok(Some(AliasEntry { address, options }))
    }

    /// Set an option, replacing an existing value or inserting right after
    /// the section header. A missing section is appended at the end.
    pub fn update(&mut self, section: &str, option: &str, value: &str) -> Result<()> {
        if option.is_empty() || value.is_empty() {
            return Err(StoreError::BadValue.into());
        }

        match self.section_start(section) {
            Some(start) => {
                let end = self.section_end(start);
                for record in &mut self.records[start + 1..end] {
                    if record.key == option {
                        record.value = value.to_string();
                        return Ok(());
                    }
                }
                self.records.insert(
                    start + 1,
                    Record {
                        key: option.to_string(),
                        value: value.to_string(),
                    },
                );
            }
            None => {
                self.records.push(Record {
                    key: format!("[{section}]"),
                    value: String::new(),
                });
                self.records.push(Record {
                    key: option.to_string(),
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Remove one option, or the whole section (header included) when
    /// `option` is empty.
    pub fn remove(&mut self, section: &str, option: &str) -> Result<()> {
        let start = self
            .section_start(section)
            .ok_or(TmError::from(StoreError::BadSection))?;
        let end = self.section_end(start);

        if option.is_empty() {
            self.records.drain(start..end);
            return Ok(());
        }

        let index = self.records[start + 1..end]
            .iter()
            .position(|r| r.key == option)
            .ok_or(TmError::from(StoreError::BadOption))?;
        self.records.remove(start + 1 + index);
        Ok(())
    }

    fn section_start(&self, section: &str) -> Option<usize> {
        let wanted = format!("[{section}]");
        self.records.iter().position(|r| r.key == wanted)
    }

    /// Index one past the last option of the section starting at `start`.
    fn section_end(&self, start: usize) -> usize {
        self.records[start + 1..]
            .iter()
            .position(|r| r.is_header())
            .map(|offset| start + 1 + offset)
            .unwrap_or(self.records.len())
    }
}

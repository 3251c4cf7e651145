//! Site-local settings. Nothing here changes the request/response protocol; these only tune how
//! a site reads its files and solves its local fits.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("IO error while reading settings: {0}")]
    Io(#[from] std::io::Error),
    #[error("Settings file is not valid TOML for this tool: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid setting '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SiteSettings {
    pub solver: SolverSettings,
    pub data: DataSettings,
    pub output: OutputSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SolverSettings {
    /// Relative singular-value cutoff for the pseudo-inverse. Unset means `max(n, p) · ε`.
    pub rcond: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DataSettings {
    /// Field separator for file-backed tables.
    pub separator: char,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self { separator: '\t' }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputSettings {
    /// Include `local_stats_dict` in the round-one output.
    pub local_stats: bool,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self { local_stats: true }
    }
}

impl SiteSettings {
    pub fn from_toml_str(text: &str) -> Result<Self, SettingsError> {
        let settings: SiteSettings = toml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Loads settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// The separator as the single byte polars expects.
    pub fn separator_byte(&self) -> u8 {
        // `validate` guarantees ASCII.
        self.data.separator as u8
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if let Some(rcond) = self.solver.rcond {
            if !rcond.is_finite() || rcond < 0.0 {
                return Err(SettingsError::Invalid {
                    key: "solver.rcond",
                    reason: format!("expected a finite non-negative number, found {rcond}"),
                });
            }
        }
        if !self.data.separator.is_ascii() {
            return Err(SettingsError::Invalid {
                key: "data.separator",
                reason: format!("'{}' is not an ASCII character", self.data.separator),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn empty_file_gives_defaults() {
        let settings = SiteSettings::from_toml_str("").unwrap();
        assert_eq!(settings, SiteSettings::default());
        assert_eq!(settings.separator_byte(), b'\t');
        assert!(settings.output.local_stats);
        assert_eq!(settings.solver.rcond, None);
    }

    #[test]
    fn load_reads_all_sections() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[solver]\nrcond = 1e-12\n\n[data]\nseparator = \",\"\n\n[output]\nlocal_stats = false"
        )
        .unwrap();
        file.flush().unwrap();

        let settings = SiteSettings::load(file.path()).unwrap();
        assert_eq!(settings.solver.rcond, Some(1e-12));
        assert_eq!(settings.separator_byte(), b',');
        assert!(!settings.output.local_stats);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = SiteSettings::from_toml_str("[solver]\ntolerance = 3").unwrap_err();
        assert!(matches!(err, SettingsError::Toml(_)));
    }

    #[test]
    fn negative_rcond_is_rejected() {
        let err = SiteSettings::from_toml_str("[solver]\nrcond = -1.0").unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { key: "solver.rcond", .. }));
    }

    #[test]
    fn non_ascii_separator_is_rejected() {
        let err = SiteSettings::from_toml_str("[data]\nseparator = \"§\"").unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { key: "data.separator", .. }));
    }
}

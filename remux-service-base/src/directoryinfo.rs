use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

pub const DIRECTORY_INFO_FILE: &str = ".unmanic";

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct DirectoryInfoError {
    pub message: String,
    pub path: PathBuf,
}

type Sections = BTreeMap<String, BTreeMap<String, String>>;

/// Per-directory metadata stored in a `.unmanic` file.
///
/// The on-disk format is JSON (`{section: {option: value}}`). Files written
/// by older installations in INI format are detected and migrated on read;
/// the write path only ever produces JSON. Section and option keys are
/// case-insensitive and stored lowercase.
#[derive(Debug)]
pub struct DirectoryInfo {
    file_path: PathBuf,
    data: Sections,
}

impl DirectoryInfo {
    pub fn new(directory: &Path) -> Result<Self, DirectoryInfoError> {
        let file_path = directory.join(DIRECTORY_INFO_FILE);
        let data = Self::read(&file_path)?;
        Ok(Self { file_path, data })
    }

    fn read(file_path: &Path) -> Result<Sections, DirectoryInfoError> {
        let content = match std::fs::read_to_string(file_path) {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Sections::new())
            }
            Err(error) => {
                return Err(DirectoryInfoError {
                    message: format!("Failed to read directory info file: {error}"),
                    path: file_path.to_path_buf(),
                })
            }
        };

        if let Ok(json) = serde_json::from_str::<Value>(&content) {
            return Self::from_json(json, file_path);
        }

        Self::from_ini(&content, file_path)
    }

    fn from_json(json: Value, file_path: &Path) -> Result<Sections, DirectoryInfoError> {
        let object = json.as_object().ok_or_else(|| DirectoryInfoError {
            message: "Directory info file must contain a JSON object".to_string(),
            path: file_path.to_path_buf(),
        })?;

        let mut data = Sections::new();
        for (section, options) in object {
            let options = options.as_object().ok_or_else(|| DirectoryInfoError {
                message: format!("Section '{section}' must be a JSON object"),
                path: file_path.to_path_buf(),
            })?;
            let section_data = data.entry(section.to_lowercase()).or_default();
            for (option, value) in options {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                section_data.insert(option.to_lowercase(), value);
            }
        }
        Ok(data)
    }

    fn from_ini(content: &str, file_path: &Path) -> Result<Sections, DirectoryInfoError> {
        let mut data = Sections::new();
        let mut current_section: Option<String> = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                let section = line[1..line.len() - 1].trim().to_lowercase();
                data.entry(section.clone()).or_default();
                current_section = Some(section);
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let section = current_section.as_ref().ok_or_else(|| DirectoryInfoError {
                    message: "Option found outside of any section".to_string(),
                    path: file_path.to_path_buf(),
                })?;
                data.get_mut(section).expect("section exists").insert(
                    key.trim().to_lowercase(),
                    value.trim().to_string(),
                );
                continue;
            }
            return Err(DirectoryInfoError {
                message: format!("Unparseable directory info line: '{line}'"),
                path: file_path.to_path_buf(),
            });
        }

        Ok(data)
    }

    pub fn get(&self, section: &str, option: &str) -> Option<&str> {
        self.data
            .get(&section.to_lowercase())
            .and_then(|options| options.get(&option.to_lowercase()))
            .map(String::as_str)
    }

    pub fn set(&mut self, section: &str, option: &str, value: &str) {
        self.data
            .entry(section.to_lowercase())
            .or_default()
            .insert(option.to_lowercase(), value.to_string());
    }

    /// Persist as pretty-printed JSON, regardless of the format read.
    pub fn save(&self) -> Result<(), DirectoryInfoError> {
        let json = serde_json::to_string_pretty(&self.data).map_err(|error| {
            DirectoryInfoError {
                message: format!("Failed to serialize directory info: {error}"),
                path: self.file_path.clone(),
            }
        })?;
        std::fs::write(&self.file_path, json).map_err(|error| DirectoryInfoError {
            message: format!("Failed to write directory info file: {error}"),
            path: self.file_path.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn missing_file_yields_empty_data() {
        let dir = tempfile::tempdir().unwrap();
        let info = DirectoryInfo::new(dir.path()).unwrap();
        assert_eq!(info.get("section", "key"), None);
    }

    #[test]
    fn reads_json_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(DIRECTORY_INFO_FILE),
            r#"{"section": {"key": "value"}}"#,
        )
        .unwrap();

        let info = DirectoryInfo::new(dir.path()).unwrap();
        assert_eq!(info.get("section", "key"), Some("value"));
    }

    #[test]
    fn keys_are_case_insensitive_and_stored_lowercase() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(DIRECTORY_INFO_FILE),
            r#"{"Section": {"KEY": "value", "MixedCase": "test"}}"#,
        )
        .unwrap();

        let info = DirectoryInfo::new(dir.path()).unwrap();
        assert_eq!(info.get("section", "key"), Some("value"));
        assert_eq!(info.get("SECTION", "mixedcase"), Some("test"));
    }

    #[test]
    fn migrates_ini_files_and_saves_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(DIRECTORY_INFO_FILE),
            "[Section]\nKey = value\n",
        )
        .unwrap();

        let info = DirectoryInfo::new(dir.path()).unwrap();
        assert_eq!(info.get("section", "key"), Some("value"));

        info.save().unwrap();
        let written = std::fs::read_to_string(dir.path().join(DIRECTORY_INFO_FILE)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&written).unwrap();
        assert_eq!(json["section"]["key"], "value");
    }

    #[test]
    fn ini_round_trip_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(DIRECTORY_INFO_FILE),
            "[movies]\nignore = true\nreason = manual\n",
        )
        .unwrap();

        {
            let info = DirectoryInfo::new(dir.path()).unwrap();
            info.save().unwrap();
        }

        let reloaded = DirectoryInfo::new(dir.path()).unwrap();
        assert_eq!(reloaded.get("movies", "ignore"), Some("true"));
        assert_eq!(reloaded.get("movies", "reason"), Some("manual"));
    }

    #[test]
    fn invalid_content_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(DIRECTORY_INFO_FILE),
            "this is not valid json or ini\nno sections here",
        )
        .unwrap();

        assert!(DirectoryInfo::new(dir.path()).is_err());
    }

    #[test]
    fn set_then_save_then_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut info = DirectoryInfo::new(dir.path()).unwrap();
            info.set("Scanner", "IgnoreDirectory", "yes");
            info.save().unwrap();
        }
        let info = DirectoryInfo::new(dir.path()).unwrap();
        assert_eq!(info.get("scanner", "ignoredirectory"), Some("yes"));
    }
}

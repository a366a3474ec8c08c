use std::io;
use std::path::{Path, PathBuf};

/// One rename record: the file's current name and the oldest name it is
/// known to have carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameEntry {
    pub newname: String,
    pub originalname: String,
}

/// Rename history for a single media file, persisted next to it as
/// `<basename>.unmanic.info` with one `newname="originalname"` record per
/// line. Appending a rename traces through existing records so every entry
/// points at the oldest original name in the chain.
#[derive(Debug, Default)]
pub struct FileInfo {
    pub path: PathBuf,
    pub entries: Vec<RenameEntry>,
}

impl FileInfo {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Vec::new(),
        }
    }

    /// The info-file path for a given media file.
    pub fn for_file(media_abspath: &Path) -> Self {
        let basename = media_abspath
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let info_path = media_abspath
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .join(format!("{basename}.unmanic.info"));
        Self::new(info_path)
    }

    /// Record a rename. `originalname` is resolved to the oldest name in
    /// any existing chain before being stored.
    pub fn append(&mut self, newname: &str, originalname: &str) {
        let oldest = self.find_oldest_name(originalname);
        self.entries.push(RenameEntry {
            newname: newname.to_string(),
            originalname: oldest,
        });
    }

    fn find_oldest_name(&self, name: &str) -> String {
        for entry in &self.entries {
            if entry.newname == name {
                return entry.originalname.clone();
            }
        }
        name.to_string()
    }

    /// Replace the in-memory entries with the file contents. A missing file
    /// leaves the list empty.
    pub fn load(&mut self) -> io::Result<()> {
        self.entries.clear();
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(error) => return Err(error),
        };
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some((newname, rest)) = line.split_once("=\"") {
                if let Some(originalname) = rest.strip_suffix('"') {
                    self.entries.push(RenameEntry {
                        newname: newname.to_string(),
                        originalname: originalname.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn save(&self) -> io::Result<()> {
        let mut content = String::new();
        for entry in &self.entries {
            content.push_str(&format!("{}=\"{}\"\n", entry.newname, entry.originalname));
        }
        std::fs::write(&self.path, content)
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn append_traces_back_to_oldest_name() {
        let mut info = FileInfo::new("/tmp/test.info");
        info.append("renamed1.mp4", "original.mp4");
        info.append("renamed2.mp4", "renamed1.mp4");

        assert_eq!(info.entries.len(), 2);
        assert_eq!(info.entries[1].originalname, "original.mp4");
    }

    #[test]
    fn oldest_name_of_unknown_file_is_itself() {
        let info = FileInfo::new("/tmp/test.info");
        assert_eq!(info.find_oldest_name("unknown.mp4"), "unknown.mp4");
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.info");

        let mut info = FileInfo::new(&path);
        info.append("new.mp4", "original.mp4");
        info.save().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), "new.mp4=\"original.mp4\"");

        let mut reloaded = FileInfo::new(&path);
        reloaded.append("stale.mp4", "stale_original.mp4");
        reloaded.load().unwrap();
        assert_eq!(reloaded.entries.len(), 1);
        assert_eq!(reloaded.entries[0].newname, "new.mp4");
        assert_eq!(reloaded.entries[0].originalname, "original.mp4");
    }

    #[test]
    fn load_of_missing_file_leaves_entries_empty() {
        let mut info = FileInfo::new("/nonexistent/path/file.info");
        info.load().unwrap();
        assert!(info.entries.is_empty());
    }

    #[test]
    fn info_path_derives_from_media_basename() {
        let info = FileInfo::for_file(Path::new("/library/Movies/A.mkv"));
        assert_eq!(
            info.path,
            PathBuf::from("/library/Movies/A.mkv.unmanic.info")
        );
    }
}

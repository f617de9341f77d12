use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// An uploaded file already written to disk.
#[derive(Clone, Debug)]
pub struct PostedFile {
    file_name: String,
    content_length: u64,
    content_type: String,
    stored_path: PathBuf,
}

impl PostedFile {
    pub fn new(
        file_name: impl Into<String>,
        content_length: u64,
        content_type: impl Into<String>,
        stored_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            content_length,
            content_type: content_type.into(),
            stored_path: stored_path.into(),
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn stored_path(&self) -> &Path {
        &self.stored_path
    }

    pub fn save_as(&self, dest: &Path) -> io::Result<u64> {
        fs::copy(&self.stored_path, dest)
    }
}

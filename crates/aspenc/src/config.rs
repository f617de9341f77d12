use std::path::PathBuf;

use serde::Deserialize;

/// Host options controlling artifact caching and upload placement.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub cache_lua: bool,
    #[serde(default)]
    pub cache_luac: bool,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default)]
    pub upload_dir: Option<PathBuf>,
}

impl HostConfig {
    pub fn is_option(option: &str) -> bool {
        matches!(
            option,
            "cache_lua" | "cache_luac" | "cache_dir" | "upload_dir"
        )
    }

    pub fn set_option(&mut self, option: &str, value: &str) -> bool {
        match option {
            "cache_lua" => self.cache_lua = parse_bool(value),
            "cache_luac" => self.cache_luac = parse_bool(value),
            "cache_dir" => self.cache_dir = Some(PathBuf::from(value)),
            "upload_dir" => self.upload_dir = Some(PathBuf::from(value)),
            _ => return false,
        }
        true
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value, "true" | "1" | "yes")
}

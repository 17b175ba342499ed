use std::path::PathBuf;

/// Returns the config directory for cloudide.
pub fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("cloudide")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("cloudide")
    } else {
        PathBuf::from("/tmp/cloudide")
    }
}

/// Returns the client config file path, honouring `$CLOUDIDE_CONFIG`.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("CLOUDIDE_CONFIG") {
        return PathBuf::from(path);
    }
    dirs_path().join("config.toml")
}

use std::path::PathBuf;

/// Home directory of the key manager: `$A3S_KMS_HOME`, else `~/.a3s/kms`.
pub fn kms_home() -> PathBuf {
    if let Ok(home) = std::env::var("A3S_KMS_HOME") {
        return PathBuf::from(home);
    }
    directories::BaseDirs::new()
        .map(|base| base.home_dir().join(".a3s").join("kms"))
        .unwrap_or_else(|| PathBuf::from(".a3s").join("kms"))
}

pub fn config_path() -> PathBuf {
    kms_home().join("config.toml")
}

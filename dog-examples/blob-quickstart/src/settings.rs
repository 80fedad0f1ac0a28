use dog_transfer::S3Config;

pub const ENDPOINT_VAR: &str = "STORAGE_ENDPOINT_URL";
pub const REGION_VAR: &str = "STORAGE_REGION";
pub const PATH_STYLE_VAR: &str = "STORAGE_FORCE_PATH_STYLE";

/// S3 connection settings from the process environment
pub fn store_config() -> S3Config {
    store_config_from(|key| std::env::var(key).ok())
}

/// Custom endpoints default to path-style addressing, as MinIO and RustFS expect
pub fn store_config_from<F>(var: F) -> S3Config
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = S3Config::default();
    if let Some(region) = var(REGION_VAR).filter(|r| !r.trim().is_empty()) {
        config.region = region;
    }
    if let Some(endpoint) = var(ENDPOINT_VAR).filter(|e| !e.trim().is_empty()) {
        config = config.with_endpoint(endpoint).with_path_style(true);
    }
    if let Some(flag) = var(PATH_STYLE_VAR) {
        config.force_path_style = matches!(flag.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_target_aws() {
        let config = store_config_from(|_| None);
        assert_eq!(config, S3Config::default());
    }

    #[test]
    fn custom_endpoint_switches_to_path_style() {
        let config = store_config_from(|key| match key {
            ENDPOINT_VAR => Some("http://localhost:9000".to_string()),
            REGION_VAR => Some("eu-west-1".to_string()),
            _ => None,
        });
        assert_eq!(config.endpoint_url.as_deref(), Some("http://localhost:9000"));
        assert_eq!(config.region, "eu-west-1");
        assert!(config.force_path_style);
    }

    #[test]
    fn explicit_flag_overrides_path_style() {
        let config = store_config_from(|key| match key {
            ENDPOINT_VAR => Some("http://localhost:9000".to_string()),
            PATH_STYLE_VAR => Some("false".to_string()),
            _ => None,
        });
        assert!(!config.force_path_style);
    }
}

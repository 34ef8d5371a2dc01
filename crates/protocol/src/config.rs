use serde::{Deserialize, Serialize};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CourierConfig {
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub receive: ReceiveConfig,
}

/// ICE configuration for WebRTC NAT traversal.
///
/// Candidates are gathered non-trickle: every candidate is bundled into
/// the single out-of-band signal string, so there is no second chance to
/// add servers after the offer is shipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN server URLs. An empty list restricts gathering to host
    /// candidates (LAN-only sessions, tests).
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReceiveConfig {
    /// Directory completed files are saved to. Defaults to ~/Downloads
    /// at runtime.
    pub downloads_dir: Option<String>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
        }
    }
}

impl CourierConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal) or "WARNING:"
    /// (advisory). Returns `Ok(())` if no issues.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        for url in &self.ice.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{}' must start with 'stun:' or 'stuns:'. \
                     Example: stun:stun.l.google.com:19302",
                    url
                ));
            }
        }

        if self.ice.stun_urls.is_empty() {
            issues.push(
                "WARNING: no STUN servers configured. Only host candidates will be \
                 gathered, so peers outside the local network cannot connect."
                    .to_string(),
            );
        }

        if let Some(dir) = &self.receive.downloads_dir {
            if dir.trim().is_empty() {
                issues.push("ERROR: receive.downloads_dir is set but empty.".to_string());
            }
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

fn default_stun_urls() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
        "stun:stun2.l.google.com:19302".to_string(),
        "stun:stun.cloudflare.com:3478".to_string(),
        "stun:global.stun.twilio.com:3478".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_from_empty_string() {
        let config: CourierConfig =
            toml::from_str("").expect("empty string should deserialize to default config");

        assert_eq!(config.ice.stun_urls.len(), 5);
        assert_eq!(config.ice.stun_urls[0], "stun:stun.l.google.com:19302");
        assert_eq!(config.ice.stun_urls[3], "stun:stun.cloudflare.com:3478");
        assert_eq!(config.ice.stun_urls[4], "stun:global.stun.twilio.com:3478");
        assert!(config.receive.downloads_dir.is_none());
    }

    #[test]
    fn default_trait_matches_empty_toml() {
        let from_toml: CourierConfig = toml::from_str("").unwrap();
        let from_default = CourierConfig::default();
        assert_eq!(from_default.ice.stun_urls, from_toml.ice.stun_urls);
        assert_eq!(
            from_default.receive.downloads_dir,
            from_toml.receive.downloads_dir
        );
    }

    #[test]
    fn custom_values_override_defaults() {
        let toml_str = r#"
[ice]
stun_urls = ["stun:stun.example.com:3478"]

[receive]
downloads_dir = "/data/incoming"
"#;
        let config: CourierConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.ice.stun_urls, vec!["stun:stun.example.com:3478"]);
        assert_eq!(config.receive.downloads_dir.as_deref(), Some("/data/incoming"));
    }

    #[test]
    fn partial_config_keeps_other_defaults() {
        let config: CourierConfig = toml::from_str("[receive]\ndownloads_dir = \"/tmp\"\n").unwrap();
        assert_eq!(config.ice.stun_urls.len(), 5);
        assert_eq!(config.receive.downloads_dir.as_deref(), Some("/tmp"));
    }

    #[test]
    fn validate_default_config_passes() {
        assert!(CourierConfig::default().validate().is_ok());
    }

    #[test]
    fn validate_bad_stun_prefix_is_error() {
        let mut config = CourierConfig::default();
        config.ice.stun_urls = vec!["http://stun.example.com:3478".to_string()];
        let issues = config.validate().unwrap_err();
        assert!(
            issues
                .iter()
                .any(|i| i.starts_with("ERROR:") && i.contains("STUN URL"))
        );
    }

    #[test]
    fn validate_stuns_prefix_is_ok() {
        let mut config = CourierConfig::default();
        config.ice.stun_urls = vec!["stuns:stun.example.com:5349".to_string()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_empty_stun_list_warns_only() {
        let mut config = CourierConfig::default();
        config.ice.stun_urls.clear();
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().all(|i| i.starts_with("WARNING:")));
    }

    #[test]
    fn validate_empty_downloads_dir_is_error() {
        let mut config = CourierConfig::default();
        config.receive.downloads_dir = Some("  ".to_string());
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("downloads_dir")));
    }
}

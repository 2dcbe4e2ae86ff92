use serde::{Deserialize, Serialize};

/// Cluster notification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// PostgreSQL channel carrying control envelopes.
    #[serde(default = "default_channel")]
    pub channel: String,

    /// Capacity of the outbound publish queue; publishes beyond it are dropped.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

fn default_channel() -> String {
    "direktiv".to_string()
}

fn default_outbound_buffer() -> usize {
    1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_cluster_config() {
        let config = ClusterConfig::default();
        assert_eq!(config.channel, "direktiv");
        assert_eq!(config.outbound_buffer, 1024);
    }

    #[test]
    fn test_parse_cluster_config() {
        let toml = r#"
            channel = "production"
        "#;

        let config: ClusterConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.channel, "production");
        assert_eq!(config.outbound_buffer, 1024);
    }
}

//! Configuration flags shared by every subcommand.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use dotsync_core::{AgentConfig, BrokerConfig};

#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// Agent configuration file.
    #[arg(long, global = true, env = "DOTSYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Token for the git host API.
    #[arg(long, global = true, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub github_token: Option<String>,

    /// Coordination broker base URL.
    #[arg(long, global = true, env = "DOTFILE_BROKER_URL")]
    pub broker_url: Option<String>,

    /// Identifier this machine reports to the broker.
    #[arg(long, global = true, env = "DOTFILE_MACHINE_ID")]
    pub machine_id: Option<String>,

    /// Push relay (SSE) URL.
    #[arg(long, global = true, env = "DOTSYNC_WEBHOOK")]
    pub webhook_url: Option<String>,

    /// Port the agent listens on.
    #[arg(long, global = true, env = "DOTSYNC_PORT")]
    pub port: Option<u16>,
}

impl ConfigArgs {
    /// Load the configuration file, then apply flags and environment.
    pub fn load(&self) -> Result<AgentConfig> {
        let path = match &self.config {
            Some(path) => path.clone(),
            None => AgentConfig::default_path().context("could not locate config directory")?,
        };
        let mut config = AgentConfig::load_at(&path)
            .with_context(|| format!("failed to load {}", path.display()))?;
        self.apply(&mut config);
        Ok(config)
    }

    fn apply(&self, config: &mut AgentConfig) {
        if let Some(token) = &self.github_token {
            config.github_token = Some(token.clone());
        }
        if let Some(url) = &self.webhook_url {
            config.webhook_url = Some(url.clone());
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.broker_url.is_some() || self.machine_id.is_some() {
            let mut broker = config.broker.take().unwrap_or(BrokerConfig {
                url: String::new(),
                machine_id: String::new(),
            });
            if let Some(url) = &self.broker_url {
                broker.url = url.clone();
            }
            if let Some(id) = &self.machine_id {
                broker.machine_id = id.clone();
            }
            config.broker = Some(broker);
        }
    }

    /// Base URL of the local agent.
    pub fn agent_url(&self, config: &AgentConfig) -> String {
        format!("http://127.0.0.1:{}", config.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_file_values() {
        let args = ConfigArgs {
            github_token: Some("t".into()),
            port: Some(4000),
            machine_id: Some("laptop".into()),
            ..ConfigArgs::default()
        };
        let mut config = AgentConfig {
            broker: Some(BrokerConfig {
                url: "http://broker".into(),
                machine_id: "old".into(),
            }),
            ..AgentConfig::default()
        };
        args.apply(&mut config);

        assert_eq!(config.github_token.as_deref(), Some("t"));
        assert_eq!(config.port, 4000);
        let broker = config.broker().expect("broker enabled");
        assert_eq!(broker.url, "http://broker");
        assert_eq!(broker.machine_id, "laptop");
        assert_eq!(args.agent_url(&config), "http://127.0.0.1:4000");
    }

    #[test]
    fn half_configured_broker_stays_disabled() {
        let args = ConfigArgs {
            machine_id: Some("laptop".into()),
            ..ConfigArgs::default()
        };
        let mut config = AgentConfig::default();
        args.apply(&mut config);
        assert!(config.broker().is_none());
    }
}

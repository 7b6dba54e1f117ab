//! Command line arguments
//!
//! Every flag can also be set through an environment variable with the
//! `HUB_SSH_PROXY_` prefix.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "SSH proxy to JupyterHub single-user pods")]
#[command(rename_all = "kebab-case")]
pub struct CliArgs {
    /// Listen address; overrides `listen` in the config file
    #[arg(long, env = "HUB_SSH_PROXY_LISTEN")]
    pub listen: Option<String>,

    /// JSON configuration file
    #[arg(long, env = "HUB_SSH_PROXY_CONFIG_FILE", default_value = "./etc/config.json")]
    pub config_file: PathBuf,

    /// Default log filter when RUST_LOG is unset (error, warn, info, debug, trace)
    #[arg(long, env = "HUB_SSH_PROXY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl CliArgs {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Listen address to use, given the one from the config file
    pub fn listen_addr<'a>(&'a self, from_config: &'a str) -> &'a str {
        self.listen.as_deref().unwrap_or(from_config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = CliArgs::try_parse_from(["hub-ssh-proxy"]).unwrap();
        assert_eq!(cli.config_file, PathBuf::from("./etc/config.json"));
        assert_eq!(cli.log_level, "info");
        assert_eq!(cli.listen_addr("0.0.0.0:8080"), "0.0.0.0:8080");
    }

    #[test]
    fn test_listen_flag_wins() {
        let cli = CliArgs::try_parse_from([
            "hub-ssh-proxy",
            "--listen",
            "127.0.0.1:2222",
            "--config-file",
            "/etc/proxy.json",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.listen_addr("0.0.0.0:8080"), "127.0.0.1:2222");
        assert_eq!(cli.config_file, PathBuf::from("/etc/proxy.json"));
        assert_eq!(cli.log_level, "debug");
    }
}

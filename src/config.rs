use std::time::Duration;

use crate::cli::Args;

/// Runtime configuration derived from CLI args
#[derive(Debug, Clone)]
pub struct Config {
    /// Shared numeric key gating envelope acceptance
    pub key: u32,
    /// Idle session timeout
    pub timeout: Duration,
    /// Sweep/report interval for the control loop
    pub tick: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            key: 0,
            timeout: Duration::from_secs(60),
            tick: Duration::from_secs(1),
        }
    }
}

impl From<&Args> for Config {
    fn from(args: &Args) -> Self {
        Self {
            key: args.key,
            timeout: args.timeout_duration(),
            tick: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_config_from_args() {
        let args = Args::parse_from(["pingtun", "--key", "42", "--timeout", "30"]);
        let config = Config::from(&args);
        assert_eq!(config.key, 42);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.tick, Duration::from_secs(1));
    }
}

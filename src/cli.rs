use clap::Parser;
use std::time::Duration;

/// UDP-over-ICMP tunnel server: relays envelopes carried in ICMP echoes to
/// real UDP targets and pulls the replies back through ICMP
#[derive(Parser, Debug, Clone)]
#[command(name = "pingtun")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Shared key; envelopes carrying any other key are silently discarded
    #[arg(short = 'k', long = "key", default_value = "0")]
    pub key: u32,

    /// Idle session timeout in seconds
    #[arg(short = 't', long = "timeout", default_value = "60")]
    pub timeout: u64,

    /// Verbose logging
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Args {
    /// Get idle timeout as Duration
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["pingtun"]);
        assert_eq!(args.key, 0);
        assert_eq!(args.timeout_duration(), Duration::from_secs(60));
        assert!(!args.verbose);
    }
}

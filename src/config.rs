use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use crate::broker::BrokerConfig;

/// Command-line and environment configuration for the pollcast server.
#[derive(Parser, Debug, Clone)]
#[command(name = "pollcast", version, about = "Short polling, long polling, SSE and websocket push demo server")]
pub struct Config {
    /// Address to listen on.
    #[arg(long, env = "POLLCAST_BIND", default_value = "127.0.0.1:8080")]
    pub bind: SocketAddr,

    /// Default long-poll timeout when the request does not pass `timeout_ms`.
    #[arg(long, env = "POLLCAST_LONG_POLL_TIMEOUT_MS", default_value_t = 5000)]
    pub long_poll_timeout_ms: u64,

    /// Upper bound applied to a client-supplied long-poll `timeout_ms`.
    #[arg(long, env = "POLLCAST_MAX_LONG_POLL_TIMEOUT_MS", default_value_t = 60_000)]
    pub max_long_poll_timeout_ms: u64,

    /// Maximum number of open SSE/websocket subscribers.
    #[arg(long, env = "POLLCAST_MAX_SUBSCRIBERS")]
    pub max_subscribers: Option<usize>,

    /// Maximum number of pending long polls.
    #[arg(long, env = "POLLCAST_MAX_WAITERS")]
    pub max_waiters: Option<usize>,

    /// Keep a single subscriber; a new subscribe replaces the previous one.
    #[arg(long, env = "POLLCAST_SINGLE_SUBSCRIBER")]
    pub single_subscriber: bool,

    /// Interval between SSE keep-alive comments.
    #[arg(long, env = "POLLCAST_KEEP_ALIVE_SECS", default_value_t = 15)]
    pub keep_alive_secs: u64,
}

impl Config {
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            max_subscribers: self.max_subscribers,
            max_waiters: self.max_waiters,
            single_subscriber: self.single_subscriber,
        }
    }

    pub fn long_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.long_poll_timeout_ms)
    }

    pub fn max_long_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.max_long_poll_timeout_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::try_parse_from(["pollcast"]).unwrap();
        assert_eq!(config.bind, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(config.long_poll_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_long_poll_timeout(), Duration::from_secs(60));
        assert_eq!(config.keep_alive(), Duration::from_secs(15));

        let broker = config.broker_config();
        assert_eq!(broker.max_subscribers, None);
        assert_eq!(broker.max_waiters, None);
        assert!(!broker.single_subscriber);
    }

    #[test]
    fn flags_map_onto_broker_config() {
        let config = Config::try_parse_from([
            "pollcast",
            "--bind",
            "0.0.0.0:9000",
            "--long-poll-timeout-ms",
            "250",
            "--max-long-poll-timeout-ms",
            "1000",
            "--max-subscribers",
            "3",
            "--max-waiters",
            "10",
            "--single-subscriber",
        ])
        .unwrap();

        assert_eq!(config.bind.port(), 9000);
        assert_eq!(config.long_poll_timeout(), Duration::from_millis(250));
        assert_eq!(config.max_long_poll_timeout(), Duration::from_secs(1));
        let broker = config.broker_config();
        assert_eq!(broker.max_subscribers, Some(3));
        assert_eq!(broker.max_waiters, Some(10));
        assert!(broker.single_subscriber);
    }

    #[test]
    fn rejects_bad_bind_address() {
        assert!(Config::try_parse_from(["pollcast", "--bind", "not-an-address"]).is_err());
    }
}

use std::time::Duration;

use clap::Parser;

use loyalty_infra::{BackoffPolicy, PipelineConfig};

/// Accrual reconciliation worker.
///
/// Every option can also be set through the environment variable named next
/// to it.
#[derive(Parser, Debug, Clone)]
#[command(name = "loyalty-accrual-worker", version)]
pub struct Config {
    /// Postgres connection string.
    #[arg(short = 'd', long, env = "DATABASE_URI")]
    pub database_uri: String,

    /// Address of the accrual authority (`host:port` or a full URL).
    #[arg(short = 'r', long, env = "ACCRUAL_SYSTEM_ADDRESS")]
    pub accrual_system_address: String,

    /// Default log level; `RUST_LOG` wins when set.
    #[arg(short = 'l', long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Concurrent pipeline workers.
    #[arg(long, env = "WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Capacity of the pipeline intake.
    #[arg(long, env = "QUEUE_CAPACITY", default_value_t = 1024)]
    pub queue_capacity: usize,

    /// First storage retry delay.
    #[arg(long, env = "RETRY_MIN_DELAY", default_value = "1s", value_parser = parse_duration)]
    pub retry_min_delay: Duration,

    /// Ceiling of the storage retry delay.
    #[arg(long, env = "RETRY_MAX_DELAY", default_value = "10s", value_parser = parse_duration)]
    pub retry_max_delay: Duration,

    /// Storage retries before giving up.
    #[arg(long, env = "RETRY_MAX_ATTEMPTS", default_value_t = 3)]
    pub retry_max_attempts: u32,

    /// Growth of the storage retry delay per attempt.
    #[arg(long, env = "RETRY_STEP", default_value = "2s", value_parser = parse_duration)]
    pub retry_step: Duration,

    /// Pause before an order is polled again.
    #[arg(long, env = "REPOLL_DELAY", default_value = "1s", value_parser = parse_duration)]
    pub repoll_delay: Duration,

    /// Failed passes before an order is dead-lettered; 0 retries forever.
    #[arg(long, env = "MAX_POLL_ATTEMPTS", default_value_t = 100)]
    pub max_poll_attempts: u32,

    /// Timeout of one accrual authority request.
    #[arg(long, env = "ACCRUAL_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    pub accrual_timeout: Duration,
}

impl Config {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.retry_min_delay, self.retry_max_delay, self.retry_max_attempts)
            .with_step(self.retry_step)
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            queue_capacity: self.queue_capacity,
            repoll_delay: self.repoll_delay,
            max_poll_attempts: (self.max_poll_attempts > 0).then_some(self.max_poll_attempts),
            ..PipelineConfig::default()
        }
    }
}

/// Parse `250ms`, `2s`, `1m`, or a bare number of seconds.
fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let (digits, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => raw.split_at(idx),
        None => (raw, "s"),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration: {raw:?}"))?;

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        _ => Err(format!("invalid duration unit in {raw:?} (expected ms, s or m)")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec![
            "loyalty-accrual-worker",
            "-d",
            "postgres://db",
            "-r",
            "localhost:8081",
        ];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("3"), Ok(Duration::from_secs(3)));
        assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
        assert!(parse_duration("2h").is_err());
        assert!(parse_duration("fast").is_err());
    }

    #[test]
    fn builds_policies_from_flags() {
        let config = parse(&[
            "--retry-min-delay",
            "500ms",
            "--retry-max-attempts",
            "5",
            "--max-poll-attempts",
            "0",
        ]);

        let policy = config.backoff_policy();
        assert_eq!(policy.min_delay, Duration::from_millis(500));
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(config.pipeline_config().max_poll_attempts, None);
    }
}

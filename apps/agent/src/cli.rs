use clap::Parser;

/// Citadel compute-node agent: attaches this host to the control
/// plane and executes inference jobs on demand.
///
/// Precedence for every setting: flag > environment > identity file >
/// built-in default.
#[derive(Debug, Parser)]
#[command(name = "citadel-agent", version, about)]
pub struct Cli {
    /// Control-plane base URL
    #[arg(long, env = "CITADEL_API_BASE_URL")]
    pub api_url: Option<String>,

    /// Stream database URL for direct mode (otherwise REDIS_URL /
    /// identity file)
    #[arg(long)]
    pub redis_url: Option<String>,

    /// Queue to consume; repeat the flag or comma-separate to
    /// multiplex several queues
    #[arg(long = "queue", env = "WORKER_QUEUE", value_delimiter = ',')]
    pub queues: Vec<String>,

    /// Consumer group shared by the node fleet
    #[arg(long, env = "CONSUMER_GROUP", default_value = "node_workers")]
    pub group: String,

    /// Maximum concurrent jobs (default: one per detected GPU)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Use the direct stream-database source even when a device token
    /// is present
    #[arg(long, env = "CITADEL_DIRECT")]
    pub direct: bool,

    /// Node name override
    #[arg(long)]
    pub node_name: Option<String>,

    /// Listen port for health probes and metrics
    #[arg(long, env = "HEALTH_PORT", default_value_t = 8082)]
    pub health_port: u16,

    /// Log every fetched job envelope
    #[arg(long, short)]
    pub verbose: bool,
}

impl Cli {
    /// Queues to consume, defaulting to the fleet-wide job queue.
    pub fn queue_names(&self) -> Vec<String> {
        if self.queues.is_empty() {
            vec!["node:jobs".to_string()]
        } else {
            self.queues.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        temp_env::with_vars(
            [
                ("WORKER_QUEUE", None::<&str>),
                ("CONSUMER_GROUP", None),
                ("CITADEL_DIRECT", None),
                ("HEALTH_PORT", None),
                ("CITADEL_API_BASE_URL", None),
            ],
            || {
                let cli = Cli::parse_from(["citadel-agent"]);
                assert_eq!(cli.queue_names(), vec!["node:jobs"]);
                assert_eq!(cli.group, "node_workers");
                assert_eq!(cli.health_port, 8082);
                assert!(!cli.direct);
                assert!(cli.concurrency.is_none());
            },
        );
    }

    #[test]
    fn test_comma_separated_queues() {
        let cli = Cli::parse_from(["citadel-agent", "--queue", "node:jobs,node:priority"]);
        assert_eq!(cli.queue_names(), vec!["node:jobs", "node:priority"]);
    }

    #[test]
    fn test_repeated_queue_flags() {
        let cli = Cli::parse_from(["citadel-agent", "--queue", "a", "--queue", "b"]);
        assert_eq!(cli.queue_names(), vec!["a", "b"]);
    }
}

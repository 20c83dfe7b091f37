use std::str::FromStr;
use std::time::Duration;
use std::{env, fmt};

/// Host of the trace agent.
pub(crate) const DD_AGENT_HOST: &str = "DD_AGENT_HOST";
/// Port of the trace agent.
pub(crate) const DD_TRACE_AGENT_PORT: &str = "DD_TRACE_AGENT_PORT";
/// Full agent URL override; takes precedence over host and port.
pub(crate) const DD_TRACE_AGENT_URL: &str = "DD_TRACE_AGENT_URL";

const DEFAULT_AGENT_HOST: &str = "localhost";
const DEFAULT_AGENT_PORT: u16 = 8126;
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_MAX_QUEUED_TRACES: usize = 7_000;
const DEFAULT_RETRY_SCHEDULE: [Duration; 2] =
    [Duration::from_millis(500), Duration::from_millis(2_500)];

/// Configuration for an [`AgentWriter`].
///
/// [`WriterConfig::default`] reads `DD_AGENT_HOST`, `DD_TRACE_AGENT_PORT`
/// and `DD_TRACE_AGENT_URL` from the environment; the `with_*` setters
/// override both the built-in defaults and any environment value.
///
/// [`AgentWriter`]: crate::AgentWriter
#[derive(Clone)]
pub struct WriterConfig {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) url: String,
    pub(crate) flush_interval: Duration,
    pub(crate) max_queued_traces: usize,
    pub(crate) retry_schedule: Vec<Duration>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            host: DEFAULT_AGENT_HOST.to_string(),
            port: DEFAULT_AGENT_PORT,
            url: String::new(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_queued_traces: DEFAULT_MAX_QUEUED_TRACES,
            retry_schedule: DEFAULT_RETRY_SCHEDULE.to_vec(),
        }
        .init_from_env_vars()
    }
}

impl WriterConfig {
    /// Set the agent host used when no URL override is configured.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the agent port used when no URL override is configured.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the agent URL override.
    ///
    /// An empty string selects `http://{host}:{port}`. `http://` and
    /// `https://` URLs are used as given; `unix:///path` or a bare `/path`
    /// route the request over a Unix domain socket. Any other scheme fails
    /// writer construction.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Set the cadence of the periodic background flush.
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Set the bound on in-memory traces. Writes beyond the bound are
    /// dropped until the worker drains the queue.
    pub fn with_max_queued_traces(mut self, max_queued_traces: usize) -> Self {
        self.max_queued_traces = max_queued_traces;
        self
    }

    /// Set the backoff durations between send attempts for one batch.
    /// An empty schedule disables retries; `n` entries allow `n + 1`
    /// attempts in total.
    pub fn with_retry_schedule(mut self, retry_schedule: Vec<Duration>) -> Self {
        self.retry_schedule = retry_schedule;
        self
    }

    fn init_from_env_vars(mut self) -> Self {
        if let Ok(host) = env::var(DD_AGENT_HOST) {
            if !host.is_empty() {
                self.host = host;
            }
        }

        if let Some(port) = env::var(DD_TRACE_AGENT_PORT)
            .ok()
            .and_then(|port| u16::from_str(&port).ok())
        {
            self.port = port;
        }

        if let Ok(url) = env::var(DD_TRACE_AGENT_URL) {
            self.url = url;
        }

        self
    }
}

impl fmt::Debug for WriterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("url", &self.url)
            .field("flush_interval", &self.flush_interval)
            .field("max_queued_traces", &self.max_queued_traces)
            .field("retry_schedule", &self.retry_schedule)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_without_env() {
        let config = temp_env::with_vars_unset(
            [DD_AGENT_HOST, DD_TRACE_AGENT_PORT, DD_TRACE_AGENT_URL],
            WriterConfig::default,
        );

        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 8126);
        assert_eq!(config.url, "");
        assert_eq!(config.flush_interval, Duration::from_secs(1));
        assert_eq!(config.max_queued_traces, 7_000);
        assert_eq!(
            config.retry_schedule,
            vec![Duration::from_millis(500), Duration::from_millis(2_500)]
        );
    }

    #[test]
    fn env_vars_override_defaults() {
        let config = temp_env::with_vars(
            [
                (DD_AGENT_HOST, Some("trace-agent.internal")),
                (DD_TRACE_AGENT_PORT, Some("9126")),
                (DD_TRACE_AGENT_URL, Some("unix:///var/run/datadog/apm.socket")),
            ],
            WriterConfig::default,
        );

        assert_eq!(config.host, "trace-agent.internal");
        assert_eq!(config.port, 9126);
        assert_eq!(config.url, "unix:///var/run/datadog/apm.socket");
    }

    #[test]
    fn unparseable_port_keeps_default() {
        let config = temp_env::with_vars(
            [
                (DD_AGENT_HOST, None),
                (DD_TRACE_AGENT_PORT, Some("I am not a number")),
                (DD_TRACE_AGENT_URL, None),
            ],
            WriterConfig::default,
        );

        assert_eq!(config.port, 8126);
    }

    #[test]
    fn setters_override_env() {
        let config = temp_env::with_vars(
            [
                (DD_AGENT_HOST, Some("from-env")),
                (DD_TRACE_AGENT_PORT, Some("1")),
                (DD_TRACE_AGENT_URL, None),
            ],
            || {
                WriterConfig::default()
                    .with_host("from-code")
                    .with_port(6319)
                    .with_max_queued_traces(25)
                    .with_retry_schedule(Vec::new())
            },
        );

        assert_eq!(config.host, "from-code");
        assert_eq!(config.port, 6319);
        assert_eq!(config.max_queued_traces, 25);
        assert!(config.retry_schedule.is_empty());
    }
}

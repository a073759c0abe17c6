//! Command line and environment configuration.

use std::time::Duration;

use clap::Parser;

use crate::process::WorkerConfig;
use crate::transport::ServerConfig;

/// Bridge a stdio JSON-RPC worker to HTTP.
#[derive(Debug, Parser)]
#[command(name = "rpclet", version, about, long_about = None)]
pub struct Cli {
    /// Address to bind the HTTP server to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind the HTTP server to
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// How long a request may wait for the worker's answer
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value_t = 30_000)]
    pub request_timeout_ms: u64,

    /// Worker executable
    #[arg(long, env = "WORKER_COMMAND", default_value = "node")]
    pub worker_command: String,

    /// Worker argument (repeatable; WORKER_ARGS is space separated)
    #[arg(
        long = "worker-arg",
        env = "WORKER_ARGS",
        value_delimiter = ' ',
        default_value = "dist/index.js"
    )]
    pub worker_args: Vec<String>,

    /// Exit when the worker exits instead of answering 503
    #[arg(long, env = "EXIT_ON_WORKER_EXIT")]
    pub exit_on_worker_exit: bool,

    #[arg(long, env = "MAX_CONTENT_LENGTH")]
    pub max_content_length: Option<String>,

    #[arg(long, env = "DEFAULT_TIMEOUT")]
    pub default_timeout: Option<String>,

    #[arg(long, env = "MAX_BROWSERS")]
    pub max_browsers: Option<String>,

    #[arg(long, env = "BROWSER_HEADLESS")]
    pub browser_headless: Option<String>,

    #[arg(long, env = "ENABLE_RELEVANCE_CHECKING")]
    pub enable_relevance_checking: Option<String>,

    #[arg(long, env = "RELEVANCE_THRESHOLD")]
    pub relevance_threshold: Option<String>,

    /// Browser install location override
    #[arg(long, env = "PLAYWRIGHT_BROWSERS_PATH")]
    pub browsers_path: Option<String>,
}

impl Cli {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            command: self.worker_command.clone(),
            args: self.worker_args.clone(),
            max_content_length: self.max_content_length.clone(),
            default_timeout: self.default_timeout.clone(),
            max_browsers: self.max_browsers.clone(),
            browser_headless: self.browser_headless.clone(),
            enable_relevance_checking: self.enable_relevance_checking.clone(),
            relevance_threshold: self.relevance_threshold.clone(),
            browsers_path: self.browsers_path.clone(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn explicit_flags() {
        let cli = Cli::try_parse_from([
            "rpclet",
            "--host",
            "127.0.0.1",
            "--port",
            "8080",
            "--request-timeout-ms",
            "1500",
            "--worker-command",
            "python3",
            "--worker-arg",
            "server.py",
            "--worker-arg",
            "stdio",
        ])
        .unwrap();

        let server = cli.server_config();
        assert_eq!(server.host, "127.0.0.1");
        assert_eq!(server.port, 8080);
        assert_eq!(cli.request_timeout(), Duration::from_millis(1500));

        let worker = cli.worker_config();
        assert_eq!(worker.command, "python3");
        assert_eq!(worker.args, vec!["server.py", "stdio"]);
    }

    #[test]
    fn worker_options_pass_through_untouched() {
        let cli = Cli::try_parse_from([
            "rpclet",
            "--max-browsers",
            "2",
            "--browser-headless",
            "false",
            "--relevance-threshold",
            "0.35",
            "--browsers-path",
            "/ms-playwright",
        ])
        .unwrap();

        let worker = cli.worker_config();
        assert_eq!(worker.max_browsers.as_deref(), Some("2"));
        assert_eq!(worker.browser_headless.as_deref(), Some("false"));
        assert_eq!(worker.relevance_threshold.as_deref(), Some("0.35"));
        assert_eq!(worker.browsers_path.as_deref(), Some("/ms-playwright"));
    }

    #[test]
    fn rejects_invalid_port() {
        assert!(Cli::try_parse_from(["rpclet", "--port", "99999"]).is_err());
    }
}

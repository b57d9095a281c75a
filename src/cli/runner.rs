//! Runner tying parsed arguments to a push run

use crate::cli::args::Args;
use crate::error::Result;
use crate::logging::Logger;
use crate::pusher::{ImagePusher, PushSummary};

pub struct Runner {
    args: Args,
    output: Logger,
}

impl Runner {
    pub fn new(args: Args) -> Self {
        let output = if args.quiet {
            Logger::new_quiet()
        } else {
            Logger::new(args.verbose)
        };
        Self { args, output }
    }

    pub fn output(&self) -> &Logger {
        &self.output
    }

    pub async fn run(self) -> Result<PushSummary> {
        self.output.section("Docker Registry Pusher");

        let config = self.args.into_config()?;
        self.output.info(&format!("Archive: {}", config.archive_path.display()));
        self.output.info(&format!("Registry: {}", config.registry.url));
        if let Some(username) = &config.auth.username {
            self.output.step(&format!("Using credentials for user {}", username));
        } else {
            self.output.step("No credentials provided - attempting anonymous access");
        }
        self.output.detail(&format!(
            "Concurrency {}, chunk size {}, timeout {}, {} attempts per operation",
            config.upload.concurrency,
            self.output.format_size(config.upload.chunk_size as u64),
            self.output.format_duration(config.registry.timeout),
            config.retry.max_attempts
        ));

        let pusher = ImagePusher::new(config, self.output.clone())?;
        let summary = pusher.run().await?;

        self.output.success(&format!(
            "Pushed {} manifest(s) in {}",
            summary.manifests.len(),
            self.output.elapsed()
        ));
        Ok(summary)
    }
}

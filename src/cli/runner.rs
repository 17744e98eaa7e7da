//! Runs one extraction for the command line

use crate::cli::args::Args;
use crate::error::ExtractError;
use crate::extractor::Extractor;
use crate::logging::Logger;
use crate::registry::RegistryStoreProvider;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct Runner {
    args: Args,
    logger: Logger,
}

impl Runner {
    pub fn new(args: Args) -> Result<Self, String> {
        args.validate()?;

        let logger = if args.quiet {
            Logger::new_quiet()
        } else {
            Logger::new(args.verbose)
        };

        Ok(Self { args, logger })
    }

    /// Extracts the requested image, returning the directory it landed in.
    ///
    /// Ctrl-C and the `--timeout` deadline both cancel the extraction.
    pub async fn run(&self) -> Result<PathBuf, ExtractError> {
        self.logger.section("Image Extractor");

        let config = self.args.registry_config();
        self.logger.debug(&format!("Platform: {}", config.platform));
        match &config.cache_dir {
            Some(dir) => self.logger.debug(&format!("Cache: {}", dir.display())),
            None => self.logger.debug("Cache: temporary"),
        }

        let cancel = CancellationToken::new();
        let watcher = tokio::spawn(cancel_on_interrupt(
            cancel.clone(),
            self.args.timeout.map(Duration::from_secs),
            self.logger.clone(),
        ));

        let result = Extractor::new(RegistryStoreProvider::new(config))
            .with_logger(self.logger.clone())
            .with_options(self.args.extract_options())
            .extract(&cancel, &self.args.image)
            .await;

        watcher.abort();
        result
    }
}

/// Cancels `cancel` on Ctrl-C or once `deadline` has passed
async fn cancel_on_interrupt(cancel: CancellationToken, deadline: Option<Duration>, logger: Logger) {
    let expired = async {
        match deadline {
            Some(deadline) => tokio::time::sleep(deadline).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = expired => {
            logger.warning(&format!(
                "Timed out after {}, cancelling",
                logger.format_duration(deadline.unwrap_or_default())
            ));
        }
        Ok(()) = tokio::signal::ctrl_c() => {
            logger.warning("Interrupted, cancelling");
        }
    }
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn invalid_arguments_are_rejected() {
        let args = Args::try_parse_from(["image-extractor", "--timeout", "0", "alpine"]).unwrap();
        assert!(Runner::new(args).is_err());
    }

    #[tokio::test]
    async fn deadline_cancels() {
        let cancel = CancellationToken::new();
        cancel_on_interrupt(
            cancel.clone(),
            Some(Duration::from_millis(10)),
            Logger::discard(),
        )
        .await;
        assert!(cancel.is_cancelled());
    }
}

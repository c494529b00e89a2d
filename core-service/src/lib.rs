//! Service façade of the dropout soak harness.
//!
//! [`SoakTest`] runs one soak against any [`StreamingService`] and device
//! resolver. [`run`] is the command-line entry: it parses the invocation,
//! sets up logging and the desktop bridges (reqwest HTTP, TIDAL, OpenHome),
//! runs the soak and maps the outcome onto an exit status.
//!
//! | Status | Meaning |
//! |--------|---------|
//! | 0 | verdict `PASS` |
//! | 1 | verdict `FAIL` |
//! | 2 | configuration error or fatal error, no verdict |
//!
//! [`StreamingService`]: bridge_traits::StreamingService

pub mod args;
pub mod error;
pub mod soak;

pub use args::SoakArgs;
pub use error::{CoreError, Result, EXIT_FAIL, EXIT_FATAL, EXIT_PASS};
pub use soak::SoakTest;

use core_playback::TestRunResult;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Usage text of the `test-tidal-dropout` entry point.
pub const DOC: &str = "\
TestTidalDropout - play TIDAL tracks through a Sender and optional Repeater
and Slave, and fail on any audible dropout.

Usage:
    test-tidal-dropout <sender> <repeater> <slave> <duration> <mode>
                       <track-count> <service-id> <username> <password>

    sender       DUT that streams from TIDAL; 'local' for the SoftPlayer
    repeater     DUT relaying the sender, or 'None'
    slave        DUT following the repeater (or sender), or 'None'
    duration     seconds to run, or 'forever' (stop with Ctrl+C)
    mode         'unicast' or 'multicast' transmission from the sender
    track-count  tracks queried from the catalog; 0 plays the fixed list
    service-id   TIDAL account or application id
    username     TIDAL username
    password     TIDAL password

A dropout is any interruption of playback on a participating device. Gaps of
one second or more are stalls and fail the run, shorter gaps are glitches and
are reported as warnings. Exit status: 0 pass, 1 fail, 2 error.
";

/// Parse `args` (program name first), run the soak and return the exit
/// status.
#[cfg(feature = "desktop-shims")]
pub async fn run<I, T>(args: I) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    use clap::Parser;

    let args = match SoakArgs::try_parse_from(args) {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() { EXIT_FATAL } else { EXIT_PASS };
        }
    };

    match args.logging_config() {
        Ok(logging) => {
            // A host that already installed a subscriber keeps it
            let _ = core_runtime::logging::init_logging(logging);
        }
        Err(e) => {
            eprintln!("{}", e);
            return EXIT_FATAL;
        }
    }

    let cancel = CancellationToken::new();
    let ctrl_c = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, stopping after the current sample");
                cancel.cancel();
            }
        }
    });

    let code = execute(&args, cancel).await;
    ctrl_c.abort();
    code
}

/// Run with already parsed arguments.
#[cfg(feature = "desktop-shims")]
pub async fn execute(args: &SoakArgs, cancel: CancellationToken) -> i32 {
    let outcome = match desktop_soak(args) {
        Ok(soak) => soak.with_cancel_token(cancel).run().await,
        Err(e) => Err(e),
    };
    conclude(outcome, args.report_json.as_deref())
}

#[cfg(feature = "desktop-shims")]
fn desktop_soak(args: &SoakArgs) -> Result<SoakTest> {
    use bridge_traits::HttpClient;
    use std::sync::Arc;

    let config = args.soak_config()?;
    let http: Arc<dyn HttpClient> = Arc::new(
        bridge_desktop::ReqwestHttpClient::new()
            .map_err(|e| CoreError::InitializationFailed(e.to_string()))?,
    );

    let tidal = provider_tidal::TidalConnector::new(http.clone(), args.tidal_config()?);
    let openhome = device_openhome::OpenHomeResolver::new(http)
        .with_path_template(args.openhome_path_template.clone());

    Ok(SoakTest::new(config, Arc::new(tidal)).with_remote_resolver(Arc::new(openhome)))
}

/// Print the report, write the JSON copy and pick the exit status.
pub fn conclude(outcome: Result<TestRunResult>, report_json: Option<&std::path::Path>) -> i32 {
    let result = match outcome {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Soak run failed");
            eprintln!("ERROR: {}", e);
            return e.exit_code();
        }
    };

    println!("{}", result);

    if let Some(path) = report_json {
        if let Err(e) = write_report(&result, path) {
            error!(error = %e, "Report not written");
            eprintln!("ERROR: {}", e);
            return e.exit_code();
        }
        info!(path = %path.display(), "Report written");
    }

    result.exit_code()
}

fn write_report(result: &TestRunResult, path: &std::path::Path) -> Result<()> {
    let report_error = |source| CoreError::Report {
        path: path.display().to_string(),
        source,
    };
    let json = result
        .to_json()
        .map_err(|e| report_error(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    std::fs::write(path, json).map_err(report_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_lists_every_positional() {
        for name in [
            "sender",
            "repeater",
            "slave",
            "duration",
            "mode",
            "track-count",
            "service-id",
            "username",
            "password",
        ] {
            assert!(DOC.contains(name), "DOC is missing {}", name);
        }
    }

    #[test]
    fn test_conclude_maps_errors_to_fatal() {
        let outcome = Err(CoreError::InitializationFailed("no TLS roots".to_string()));
        assert_eq!(conclude(outcome, None), EXIT_FATAL);
    }
}

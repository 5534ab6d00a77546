//! SR-IOV CNI plugin entry point

use std::io::{Read, Write};
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use sriov_cni::config::PluginSettings;
use sriov_cni::netns::NsWorker;
use sriov_cni::skel::{self, CniArgs, CniCommand};
use sriov_cni::Attachments;
use sriov_cni_common::SriovResult;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("sriov: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<ExitCode> {
    let args = CniArgs::parse();

    if args.command == CniCommand::Version {
        let json = skel::version_json().context("encoding version info")?;
        return emit(&json).map(|_| ExitCode::SUCCESS);
    }

    let mut payload = Vec::new();
    std::io::stdin()
        .read_to_end(&mut payload)
        .context("reading network configuration from stdin")?;

    let outcome = invoke(&args, payload.clone());
    match outcome {
        Ok(Some(json)) => emit(&json).map(|_| ExitCode::SUCCESS),
        Ok(None) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            error!(error = %e, code = e.code(), "Command failed");
            emit(&skel::error_json(&payload, &e))?;
            Ok(ExitCode::FAILURE)
        }
    }
}

fn invoke(args: &CniArgs, payload: Vec<u8>) -> SriovResult<Option<String>> {
    let settings = PluginSettings::load_or_default(&args.config);
    init_tracing(settings.as_ref().map(|s| s.log_level.as_str()).unwrap_or("info"));
    let settings = settings?;
    debug!(command = ?args.command, container_id = %args.container_id, "Invoked");

    let command = args.command;
    let request = args.request(payload);
    NsWorker::run(move || async move {
        let attachments = Attachments::on_host(settings);
        skel::dispatch(command, &request, &attachments).await
    })?
}

/// Logs go to stderr; stdout belongs to the runtime.
fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .init();
}

fn emit(json: &str) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", json).context("writing result to stdout")?;
    stdout.flush().context("flushing stdout")
}

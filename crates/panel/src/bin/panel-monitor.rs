//! panel-monitor: headless panel session against a live compute service.
//!
//! Lists the available models, follows the progress channel, and can submit
//! an inference job for one image series and wait for it to finish.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use provisioner_channel::{ChannelEvent, ProgressChannel, SseSource};
use provisioner_core::config::{self, Config};
use provisioner_core::SubjectDescriptor;
use provisioner_jobs::{HttpComputeService, JobStatus};
use provisioner_panel::{InMemoryRegistry, PanelSession};

// ── CLI ─────────────────────────────────────────────────────────────

/// Follow a compute service's job channel and optionally start a model run.
#[derive(Parser, Debug)]
#[command(name = "panel-monitor", version, about)]
struct Cli {
    /// Config profile (overrides PROVISIONER_PROFILE).
    #[arg(long)]
    profile: Option<String>,

    /// Print the config profiles found in the environment and exit.
    #[arg(long)]
    list_profiles: bool,

    /// Compute service base URL (overrides SERVICE_URL).
    #[arg(long)]
    service_url: Option<String>,

    /// Model to run. Without it the monitor only lists models and follows events.
    #[arg(long)]
    model: Option<String>,

    /// Series instance UID of the image series to run against.
    #[arg(long, env = "PANEL_PARENT_ID")]
    parent_id: Option<String>,

    #[arg(long, env = "PANEL_STUDY_ID")]
    study_id: Option<String>,

    #[arg(long, env = "PANEL_STUDY_UID")]
    study_uid: Option<String>,

    #[arg(long, env = "PANEL_PATIENT_ID")]
    patient_id: Option<String>,
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if cli.list_profiles {
        for profile in Config::available_profiles() {
            println!("{profile}");
        }
        return Ok(());
    }

    let mut config = match cli.profile.as_deref() {
        Some(profile) => Config::for_profile(profile),
        None => Config::from_env(),
    };
    if let Some(url) = cli.service_url.clone() {
        config.service.base_url = url;
    }
    config.log_summary();

    let client = reqwest::Client::new();
    let service = Arc::new(HttpComputeService::with_client(client.clone(), config.service.clone()));

    // Events are echoed to stdout from a bounded queue so a slow terminal never stalls the pump.
    let (echo_tx, mut echo_rx) = mpsc::channel::<ChannelEvent>(config.channel.buffer);
    let mut channel = ProgressChannel::new();
    let _echo = channel.subscribe_all(move |event| {
        if echo_tx.try_send(event.clone()).is_err() {
            debug!("echo queue full, event not printed");
        }
    });
    let events_url = config.events_url();
    if !channel.connect(SseSource::connect(&client, &events_url)).await {
        warn!(url = %events_url, "no live updates; job state will only reflect direct responses");
    }

    let registry = Arc::new(InMemoryRegistry::new());
    let session = PanelSession::mount(registry, service, channel);

    match session.refresh_models().await {
        Ok(models) => {
            for model in &models {
                let updated = model
                    .updated_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!("{:<40} running={:<5} updated={}", model.name, model.running, updated);
            }
        }
        Err(e) => warn!(error = %e, "could not list models"),
    }

    let Some(model) = cli.model.clone() else {
        info!("no model requested, following events until ctrl-c");
        loop {
            tokio::select! {
                Some(event) = echo_rx.recv() => println!("{}", event.to_json()),
                _ = tokio::signal::ctrl_c() => break,
            }
        }
        session.unmount().await;
        return Ok(());
    };

    session.set_subject(SubjectDescriptor {
        patient_id: cli.patient_id,
        study_id: cli.study_id,
        study_uid: cli.study_uid,
        parent_id: cli.parent_id,
        study_description: None,
    });

    let mut job = session.watch_job();
    let submitted = session.submit_inference(Some(model)).await?;
    info!(generation = submitted.generation, status = %submitted.status, "inference submitted");

    loop {
        tokio::select! {
            Some(event) = echo_rx.recv() => println!("{}", event.to_json()),
            changed = job.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = job.borrow_and_update().clone();
                if snapshot.status.is_terminal() {
                    info!(status = %snapshot.status, message = ?snapshot.message, "job finished");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, leaving the remote job running");
                break;
            }
        }
    }

    let failed = session.job().status == JobStatus::Failed;
    session.unmount().await;
    if failed {
        anyhow::bail!("job failed");
    }
    Ok(())
}

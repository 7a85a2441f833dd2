use std::{collections::BTreeMap, process, sync::Arc, time::Duration};

use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

use stampa::{
    application::{
        archive::ArchiveAggregator,
        error::AppError,
        export::{
            ExportRequest, ExportService, PageSelection, PersonalizedExportRequest,
        },
        progress::{Phase, ProgressEstimator},
    },
    config::{self, Command, InvitationsArgs, PagesArgs, Settings},
    domain::types::Deliverable,
    infra::{error::InfraError, render::HttpRenderClient, telemetry},
};

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    let service = build_service(&settings)?;
    let progress = service.progress();
    let reporter = tokio::spawn(report_progress(progress.clone()));

    let result = match cli_args.command {
        Command::Pages(args) => run_pages(&service, args).await,
        Command::Invitations(args) => run_invitations(&service, args).await,
    };

    reporter.abort();
    let _ = reporter.await;

    let deliverable = result?;
    deliver(&settings, &deliverable).await?;
    progress.reset();

    Ok(())
}

fn build_service(settings: &Settings) -> Result<ExportService, AppError> {
    let http = reqwest::Client::builder()
        .timeout(settings.render.request_timeout)
        .build()
        .map_err(|err| AppError::unexpected(format!("failed to build http client: {err}")))?;

    let backend = Arc::new(HttpRenderClient::new(
        http.clone(),
        settings.render.endpoint.clone(),
        settings.render.app_id.clone(),
    ));
    let progress = ProgressEstimator::new(settings.progress.tick_interval);

    Ok(ExportService::new(
        backend,
        ArchiveAggregator::new(http),
        progress,
        settings.render.concurrency,
    ))
}

async fn run_pages(service: &ExportService, args: PagesArgs) -> Result<Deliverable, AppError> {
    let request = ExportRequest {
        subject_id: args.subject,
        label: args.label,
        width: args.width,
        height: args.height,
        suffix: args.format,
        pages: args
            .blocks
            .into_iter()
            .map(|block_id| PageSelection {
                block_id,
                query: BTreeMap::new(),
            })
            .collect(),
    };

    Ok(service.export_pages(request).await?)
}

async fn run_invitations(
    service: &ExportService,
    args: InvitationsArgs,
) -> Result<Deliverable, AppError> {
    let request = PersonalizedExportRequest {
        subject_id: args.subject,
        label: args.label,
        width: args.width,
        height: args.height,
        suffix: args.format,
        block_id: args.block,
        invitees: args.invitees,
    };

    Ok(service.export_invitations(request).await?)
}

async fn deliver(settings: &Settings, deliverable: &Deliverable) -> Result<(), AppError> {
    tokio::fs::create_dir_all(&settings.output.directory)
        .await
        .map_err(InfraError::from)?;

    let path = settings.output.directory.join(deliverable.filename());
    tokio::fs::write(&path, deliverable.bytes())
        .await
        .map_err(InfraError::from)?;

    info!(
        target = "stampa::main",
        path = %path.display(),
        size_bytes = deliverable.bytes().len(),
        "deliverable written"
    );

    Ok(())
}

async fn report_progress(progress: ProgressEstimator) {
    let mut interval = tokio::time::interval(Duration::from_millis(200));
    interval.tick().await; // Skip the first immediate tick
    loop {
        interval.tick().await;
        let snapshot = progress.snapshot();
        if snapshot.phase == Phase::Running {
            info!(
                target = "stampa::main",
                completed = snapshot.completed,
                expected = snapshot.expected,
                displayed = format!("{:.0}%", snapshot.displayed),
                "export progress"
            );
        }
    }
}

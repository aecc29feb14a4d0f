mod cli;
mod error;

use std::path::Path;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ferry_engine::source::create_client;
use ferry_engine::{
    Credential, CredentialPlacement, CredentialStore, FerryConfig, FixedCredential,
    HttpAuthenticator, HttpConfig, HttpSegmentSource, MediaSource, RelayConfig, ResilientInvoker,
    UploadPipeline, UploadTarget, WsConnector,
};
use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::cli::{Args, Commands, UploadArgs};
use crate::error::{AppError, Result};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received Ctrl-C, cancelling upload");
            signal_token.cancel();
        }
    });

    let result = match args.command {
        Commands::Upload(upload) => run_upload(upload, &token).await,
    };

    if let Err(e) = result {
        error!("Application error: {}", e);
        eprintln!("Error: {e}");
        if let AppError::Pipeline(failure) = &e {
            eprintln!("  stage: {}", failure.stage);
            eprintln!("  bytes uploaded: {}", failure.last_offset);
            if let Some(segment) = &failure.last_segment {
                eprintln!("  last segment: {segment}");
            }
        }
        process::exit(1);
    }
}

async fn run_upload(args: UploadArgs, token: &CancellationToken) -> Result<()> {
    let http = http_config(&args)?;
    let mut config = FerryConfig {
        relay: RelayConfig::default().with_capacity(args.relay_capacity),
        http,
        ..FerryConfig::default()
    };
    if let Some(path) = &args.mirror {
        config.relay = config.relay.with_mirror(path);
    }
    config.source = config
        .source
        .with_start_offset(seconds("start-offset", args.start_offset)?)
        .with_max_duration(args.max_duration.map(|s| seconds("max-duration", s)).transpose()?);
    config.source.variant_policy = args.variant.into();
    config.upload.max_buffer_size = args.max_buffer_size;
    if let Some(name) = &args.token_query {
        config.upload.credential_placement = CredentialPlacement::QueryParameter(name.clone());
    }

    let credentials = credentials(&args, &config.http).await?;
    let invoker = ResilientInvoker::new(
        config.resilience.clone(),
        credentials,
        tracing::Span::current(),
    );
    let connector = WsConnector::new(args.endpoint.clone(), &config.upload)?;

    let (media, target) = match (&args.manifest, &args.input) {
        (Some(url), _) => {
            let source = HttpSegmentSource::new(&config.http)?;
            let name = args
                .file_name
                .clone()
                .unwrap_or_else(|| default_name_for_url(url));
            let media = MediaSource::Manifest {
                source: Arc::new(source),
                url: url.clone(),
            };
            (media, UploadTarget::new(name, args.total_size))
        }
        (None, Some(path)) => {
            let file = tokio::fs::File::open(path).await?;
            let size = match args.total_size {
                Some(size) => Some(size),
                None => Some(file.metadata().await?.len()),
            };
            let name = args
                .file_name
                .clone()
                .unwrap_or_else(|| default_name_for_path(path));
            (
                MediaSource::Reader(Box::new(file)),
                UploadTarget::new(name, size),
            )
        }
        (None, None) => {
            return Err(AppError::InvalidInput(
                "either --manifest or --input is required".to_owned(),
            ));
        }
    };

    let pipeline = UploadPipeline::new(connector, invoker, config);
    let report = pipeline.run(media, target, token).await?;

    info!(
        bytes = report.upload.bytes_sent,
        frames = report.upload.frames_sent,
        buffer_size = report.upload.buffer_size,
        close_code = ?report.upload.close_code,
        "Upload complete"
    );
    if let Some(source) = &report.source {
        info!(
            segments = source.segments_forwarded,
            skipped = source.segments_skipped,
            duration = ?source.duration_forwarded,
            polls = source.polls,
            "Source summary"
        );
    }
    Ok(())
}

fn http_config(args: &UploadArgs) -> Result<HttpConfig> {
    let mut http = HttpConfig::default();
    for header in &args.headers {
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| AppError::InvalidInput(format!("malformed header: {header}")))?;
        http = http.with_header(name.trim(), value.trim());
    }
    for param in &args.params {
        let (key, value) = param
            .split_once('=')
            .ok_or_else(|| AppError::InvalidInput(format!("malformed parameter: {param}")))?;
        http = http.with_param(key, value);
    }
    Ok(http)
}

async fn credentials(args: &UploadArgs, http: &HttpConfig) -> Result<CredentialStore> {
    if let Some(login_url) = &args.auth_url {
        let (Some(username), Some(password)) = (&args.username, &args.password) else {
            return Err(AppError::InvalidInput(
                "--auth-url needs --username and --password".to_owned(),
            ));
        };
        let authenticator =
            HttpAuthenticator::new(create_client(http)?, login_url.clone(), username, password);
        return Ok(CredentialStore::login(Arc::new(authenticator)).await?);
    }

    let Some(token) = &args.token else {
        return Err(AppError::InvalidInput(
            "either --token or --auth-url is required".to_owned(),
        ));
    };
    Ok(CredentialStore::new(
        Credential::new(token.clone()),
        Arc::new(FixedCredential::new(token.clone())),
    ))
}

fn seconds(flag: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).map_err(|_| {
        AppError::InvalidInput(format!("--{flag} must be a non-negative number of seconds"))
    })
}

fn default_name_for_path(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload.bin".to_owned())
}

fn default_name_for_url(url: &url::Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .map(|name| match name.rsplit_once('.') {
            Some((stem, _)) => format!("{stem}.ts"),
            None => format!("{name}.ts"),
        })
        .unwrap_or_else(|| "stream.ts".to_owned())
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(verbose).with_writer(std::io::stderr))
        .init();
}

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use soundmark::config::StoreBackend;
use soundmark::session::{now_ms, start_after, SessionPatch, SessionUpdate};
use soundmark::trigger::analyze_pcm;
use soundmark::{
    create_router, AppState, AudioBackendFactory, AudioFile, AudioSource, BlobStore, Config,
    HttpReferenceClock, LocalClock, MemoryBlobStore, MemorySessionStore, NatsClient,
    OffsetEstimator, ReferenceClock, SessionDoc, SessionRunner, SessionServices, SessionStore,
    TriggerMode,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "soundmark")]
#[command(about = "Synchronized acoustic-trigger recording engine")]
#[command(version = "0.1.0")]
struct Cli {
    /// Config file (extension optional; missing file means defaults)
    #[arg(long, global = true, default_value = "config/soundmark")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API and reference clock
    Serve,

    /// Measure this device's offset against the reference clock
    Offset {
        /// Reference endpoint (overrides clock.reference_url)
        #[arg(long)]
        url: Option<String>,
    },

    /// Run the horn detector over a recorded clip
    Analyze {
        file: PathBuf,

        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Create a session, optionally scheduled
    Create {
        session: String,

        #[arg(long)]
        name: Option<String>,

        /// Schedule the start this many seconds from now
        #[arg(long)]
        start_in: Option<f64>,
    },

    /// Join a session as this device and record once
    Join {
        session: String,

        #[arg(long)]
        participant: Option<String>,

        #[arg(long, value_enum)]
        mode: Option<TriggerMode>,

        /// Replay this file instead of the microphone
        #[arg(long)]
        input: Option<PathBuf>,
    },
}

async fn build_services(cfg: &Config) -> Result<SessionServices> {
    let (sessions, blobs): (Arc<dyn SessionStore>, Arc<dyn BlobStore>) = match cfg.store.backend {
        StoreBackend::Memory => {
            info!("Using in-memory session and artifact stores");
            (
                Arc::new(MemorySessionStore::new()),
                Arc::new(MemoryBlobStore::new(
                    cfg.store.blob_bucket.clone(),
                    cfg.store.public_url_base.clone(),
                )),
            )
        }
        StoreBackend::Nats => {
            let client = NatsClient::connect(&cfg.store.nats_url).await?;
            (
                Arc::new(client.session_store(&cfg.store.session_bucket).await?),
                Arc::new(
                    client
                        .blob_store(&cfg.store.blob_bucket, &cfg.store.public_url_base)
                        .await?,
                ),
            )
        }
    };

    let reference: Option<Arc<dyn ReferenceClock>> = match &cfg.clock.reference_url {
        Some(url) => Some(Arc::new(HttpReferenceClock::new(
            url.clone(),
            cfg.clock.request_timeout(),
        )?)),
        None => {
            warn!("No clock.reference_url configured; scheduling on the local clock");
            None
        }
    };

    Ok(SessionServices {
        sessions,
        blobs,
        input: Arc::new(AudioBackendFactory::new(
            cfg.audio_source(),
            cfg.audio_backend(),
        )),
        reference,
    })
}

async fn serve(cfg: Config) -> Result<()> {
    let services = build_services(&cfg).await?;
    let state = AppState::new(services, cfg.session(""));

    let addr = format!("{}:{}", cfg.http.bind, cfg.http.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("{} listening on {}", cfg.service.name, addr);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .context("HTTP server failed")?;

    Ok(())
}

async fn offset(cfg: Config, url: Option<String>) -> Result<()> {
    let url = url
        .or(cfg.clock.reference_url.clone())
        .context("No reference clock URL (use --url or clock.reference_url)")?;

    let reference = HttpReferenceClock::new(url.clone(), cfg.clock.request_timeout())?;
    let local = LocalClock::system();
    let offset = OffsetEstimator::new(cfg.clock.samples)
        .estimate(&reference, &local)
        .await?;

    println!("{}: {:+.1} ms", url, offset.as_millis());
    Ok(())
}

fn analyze(cfg: Config, file: PathBuf, json: bool) -> Result<()> {
    let audio = AudioFile::open(&file)?;
    info!(
        "Analyzing {} ({:.1}s, {} Hz, {} channels)",
        file.display(),
        audio.duration_seconds,
        audio.sample_rate,
        audio.channels
    );

    let events = analyze_pcm(&audio.into_pcm(), &cfg.trigger.detector());
    for event in &events {
        if json {
            println!("{}", serde_json::to_string(event)?);
        } else {
            println!("{:?}", event);
        }
    }

    let triggers = events.iter().filter(|e| e.is_trigger()).count();
    info!("{} events, {} triggers", events.len(), triggers);
    Ok(())
}

async fn create(cfg: Config, session: String, name: Option<String>, start_in: Option<f64>) -> Result<()> {
    if cfg.store.backend == StoreBackend::Memory {
        warn!("In-memory store: the session disappears when this command exits");
    }

    let start = start_in
        .map(|secs| {
            start_after(now_ms(), secs).with_context(|| format!("--start-in {} is out of range", secs))
        })
        .transpose()?;

    let services = build_services(&cfg).await?;
    services
        .sessions
        .create(&session, SessionDoc::new(&session, name))
        .await?;

    if let Some(start) = start {
        services
            .sessions
            .update(&session, SessionPatch::schedule(start))
            .await?;
        println!("Created {} starting at {}", session, start);
    } else {
        println!("Created {}", session);
    }

    Ok(())
}

async fn join(
    mut cfg: Config,
    session: String,
    participant: Option<String>,
    mode: Option<TriggerMode>,
    input: Option<PathBuf>,
) -> Result<()> {
    if let Some(participant) = participant {
        cfg.service.participant = participant;
    }
    if let Some(mode) = mode {
        cfg.service.mode = mode;
    }
    if let Some(input) = input {
        cfg.service.input_file = Some(input);
    }
    if let AudioSource::File(path) = cfg.audio_source() {
        info!("Using {} as input", path.display());
    }

    let services = build_services(&cfg).await?;
    let runner = SessionRunner::new(cfg.session(&session), services);
    let handle = runner.handle();

    let mut updates = handle.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(SessionUpdate::State { state, .. }) => println!("{:?}", state),
                Ok(other) => println!("{:?}", other),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut task = tokio::spawn(runner.run());
    let outcome = tokio::select! {
        outcome = &mut task => outcome?,
        _ = tokio::signal::ctrl_c() => {
            handle.leave();
            task.await?
        }
    };
    printer.abort();

    match (&outcome.upload, &outcome.failure) {
        (Some(upload), _) => println!("Uploaded {}", upload.url),
        (None, Some(failure)) => println!("Finished without upload: {}", failure),
        (None, None) => println!("Left session in {:?}", outcome.state),
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)?;

    info!("Soundmark v0.1.0");
    info!("Loaded config: {}", cfg.service.name);

    match cli.command {
        Commands::Serve => serve(cfg).await,
        Commands::Offset { url } => offset(cfg, url).await,
        Commands::Analyze { file, json } => analyze(cfg, file, json),
        Commands::Create {
            session,
            name,
            start_in,
        } => create(cfg, session, name, start_in).await,
        Commands::Join {
            session,
            participant,
            mode,
            input,
        } => join(cfg, session, participant, mode, input).await,
    }
}

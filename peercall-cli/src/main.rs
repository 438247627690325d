//! Peercall CLI
//!
//! Runs two engines in one process over the loopback network and walks them
//! through a call scenario, printing every lifecycle event.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use peercall_core::prelude::*;
use peercall_core::LoopbackTransport;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use timeline::Timeline;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

mod timeline;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// JSON engine configuration shared by both parties
    #[arg(short, long, env = "PEERCALL_CONFIG")]
    config: Option<PathBuf>,

    /// Identity of the calling party
    #[arg(long, env = "PEERCALL_CALLER")]
    caller: Option<String>,

    /// Identity of the called party
    #[arg(long, env = "PEERCALL_CALLEE")]
    callee: Option<String>,

    /// Override the hangup acknowledgement timeout
    #[arg(long, env = "PEERCALL_HANGUP_TIMEOUT_MS")]
    hangup_timeout_ms: Option<u64>,

    /// Override the connectivity timeout
    #[arg(long, env = "PEERCALL_ICE_TIMEOUT_MS")]
    ice_timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Place a call, answer it and hang up
    Call {
        /// Request video
        #[arg(long)]
        video: bool,

        /// Time to stay in the call
        #[arg(long, default_value = "2000")]
        hangup_after_ms: u64,
    },

    /// Place a call that the callee rejects
    Reject,

    /// Measure signaling round-trip latency
    Probe {
        /// Give up after this long
        #[arg(long, default_value = "1000")]
        timeout_ms: u64,
    },

    /// Hang up while the hangup acknowledgement is lost in transit
    LossyHangup,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("peercall=info")))
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => EngineConfig::default(),
    };
    if let Some(ms) = cli.hangup_timeout_ms {
        config.hangup_timeout_ms = ms;
    }
    if let Some(ms) = cli.ice_timeout_ms {
        config.ice_timeout_ms = ms;
    }

    let caller = PeerId::parse(&cli.caller.unwrap_or_else(generate_random_identity))?;
    let callee = PeerId::parse(&cli.callee.unwrap_or_else(generate_random_identity))?;
    if caller == callee {
        bail!("caller and callee must differ");
    }
    println!("🔗 Caller: {caller} | Callee: {callee}");

    let demo = Demo::start(&config, caller, callee)?;
    let result = match cli.command {
        Commands::Call { video, hangup_after_ms } => {
            demo.call(video, Duration::from_millis(hangup_after_ms)).await
        }
        Commands::Reject => demo.reject().await,
        Commands::Probe { timeout_ms } => demo.probe(Duration::from_millis(timeout_ms)).await,
        Commands::LossyHangup => demo.lossy_hangup().await,
    };
    demo.shutdown();
    result
}

fn load_config(path: &Path) -> Result<EngineConfig> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let config: EngineConfig =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(config)
}

/// Upper bound for any single step of a scenario
const STEP_TIMEOUT: Duration = Duration::from_secs(30);

struct Party {
    id: PeerId,
    engine: Arc<SignalingEngine<LoopbackTransport>>,
    events: BroadcastDelegate,
}

impl Party {
    fn start(network: &LoopbackNetwork, config: &EngineConfig, id: PeerId, timeline: Timeline) -> Result<Self> {
        let signaling = Arc::new(SignalingHandler::new(Arc::new(network.join(id.clone()))));
        let events = BroadcastDelegate::default();
        let mut config = config.clone();
        config.local_id = id.clone();

        let engine = Arc::new(
            SignalingEngine::builder(signaling, Arc::new(SimulatedMediaFactory::new()))
                .with_config(config)
                .with_delegate(Arc::new(events.clone()))
                .build()
                .with_context(|| format!("starting engine for {id}"))?,
        );

        let pump = engine.clone();
        tokio::spawn(async move { pump.run().await });

        let mut printer = events.subscribe();
        let label = id.to_string();
        tokio::spawn(async move {
            while let Ok(event) = printer.recv().await {
                println!("{}", timeline.line(&label, &event));
            }
        });

        Ok(Self { id, engine, events })
    }

    fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }
}

/// Wait for the first event named `name`
async fn wait_for(events: &mut broadcast::Receiver<CallEvent>, name: &str) -> Result<CallEvent> {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if event.name() == name => return Ok(event),
                Ok(event) if event.is_terminal() => bail!("call finished early: {}", timeline::describe(&event)),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => bail!("event stream closed"),
            }
        }
    };
    tokio::time::timeout(STEP_TIMEOUT, wait)
        .await
        .with_context(|| format!("timed out waiting for {name}"))?
}

/// Wait for the call to end or fail
async fn wait_terminal(events: &mut broadcast::Receiver<CallEvent>) -> Result<CallEvent> {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if event.is_terminal() => return Ok(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => bail!("event stream closed"),
            }
        }
    };
    tokio::time::timeout(STEP_TIMEOUT, wait)
        .await
        .context("timed out waiting for the call to finish")?
}

struct Demo {
    network: LoopbackNetwork,
    caller: Party,
    callee: Party,
}

impl Demo {
    fn start(config: &EngineConfig, caller: PeerId, callee: PeerId) -> Result<Self> {
        let network = LoopbackNetwork::new();
        let timeline = Timeline::new();
        let caller = Party::start(&network, config, caller, timeline)?;
        let callee = Party::start(&network, config, callee, timeline)?;
        Ok(Self {
            network,
            caller,
            callee,
        })
    }

    async fn place_call(&self, video: bool) -> Result<(broadcast::Receiver<CallEvent>, broadcast::Receiver<CallEvent>)> {
        let mut caller_events = self.caller.subscribe();
        let mut callee_events = self.callee.subscribe();
        if !self.caller.engine.make_call(self.callee.id.clone(), video).await {
            bail!("make_call refused");
        }
        wait_for(&mut callee_events, "call").await?;
        wait_for(&mut caller_events, "ringing").await?;
        Ok((caller_events, callee_events))
    }

    async fn connect(&self, video: bool) -> Result<(broadcast::Receiver<CallEvent>, broadcast::Receiver<CallEvent>)> {
        let (mut caller_events, mut callee_events) = self.place_call(video).await?;
        if !self.callee.engine.answer_call(&self.caller.id).await {
            bail!("answer_call refused");
        }
        wait_for(&mut caller_events, "connected").await?;
        wait_for(&mut callee_events, "connected").await?;
        Ok((caller_events, callee_events))
    }

    async fn call(&self, video: bool, hangup_after: Duration) -> Result<()> {
        let (mut caller_events, mut callee_events) = self.connect(video).await?;
        tokio::time::sleep(hangup_after).await;
        self.caller.engine.terminate_call(&self.callee.id).await;
        wait_terminal(&mut caller_events).await?;
        wait_terminal(&mut callee_events).await?;
        println!("📞 Call finished");
        Ok(())
    }

    async fn reject(&self) -> Result<()> {
        let (mut caller_events, mut callee_events) = self.place_call(false).await?;
        self.callee.engine.terminate_call(&self.caller.id).await;
        wait_terminal(&mut caller_events).await?;
        wait_terminal(&mut callee_events).await?;
        println!("📞 Call rejected");
        Ok(())
    }

    async fn probe(&self, timeout: Duration) -> Result<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let started = self
            .caller
            .engine
            .reply(
                self.callee.id.clone(),
                timeout,
                Box::new(move |ok, peer, timing| {
                    let _ = tx.send((ok, peer, timing));
                }),
            )
            .await;
        if !started {
            bail!("probe refused");
        }
        let (ok, peer, timing) = rx.await.context("probe callback dropped")?;
        match (ok, timing) {
            (true, Some(timing)) => println!(
                "⏱️  {peer}: local latency {}ms, remote processing {}ms",
                timing.local_latency.unwrap_or_default(),
                timing.remote_latency.unwrap_or_default()
            ),
            _ => println!("⏱️  {peer}: no answer within {}ms", timeout.as_millis()),
        }
        Ok(())
    }

    async fn lossy_hangup(&self) -> Result<()> {
        let (mut caller_events, mut callee_events) = self.connect(false).await?;
        self.network
            .set_drop_filter(|_, _, message| matches!(message, SignalingMessage::ByeAck { .. }));
        println!("⚠️  Dropping every bye acknowledgement");

        let hung_up = Instant::now();
        self.caller.engine.terminate_call(&self.callee.id).await;
        wait_terminal(&mut callee_events).await?;
        wait_terminal(&mut caller_events).await?;
        println!(
            "⏱️  Caller released the call {}ms after hanging up (timeout {}ms)",
            hung_up.elapsed().as_millis(),
            self.caller.engine.config().hangup_timeout_ms
        );
        Ok(())
    }

    fn shutdown(&self) {
        self.caller.engine.shutdown();
        self.callee.engine.shutdown();
    }
}

fn generate_random_identity() -> String {
    const WORDS: &[&str] = &[
        "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel", "india", "juliet", "kilo",
        "lima", "mike", "november", "oscar", "papa", "quebec", "romeo", "sierra", "tango", "uniform", "victor",
        "whiskey", "xray", "yankee", "zulu",
    ];

    let mut rng = rand::thread_rng();
    let first = WORDS[rng.gen_range(0..WORDS.len())];
    let second = WORDS[rng.gen_range(0..WORDS.len())];
    format!("{first}-{second}-{}", rng.gen_range(100..1000))
}

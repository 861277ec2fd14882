use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use dreamdeck_contracts::{
    BackendId, ErrorReporter, GenerationRequest, HostScheduler, Sampler, Seed, Settings,
    TaskQueue, UiNotifier, UpscaleRequest,
};
use dreamdeck_engine::{spawn_generation, spawn_upscale, BackendRegistry, ReqwestTransport};
use tracing::{info, warn, Level};

const TICK_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Parser)]
#[command(
    name = "dreamdeck",
    version,
    about = "Image-to-image generation on remote Stable Diffusion backends"
)]
struct Cli {
    /// JSON settings file. Environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Backend to use instead of the configured one.
    #[arg(long, global = true)]
    backend: Option<String>,
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Generate(GenerateArgs),
    Upscale(UpscaleArgs),
    /// Print each backend's capabilities.
    Backends,
    /// List the models a backend offers.
    Models(ModelsArgs),
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    source: PathBuf,
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    negative_prompt: Option<String>,
    #[arg(long, default_value_t = 512)]
    width: u32,
    #[arg(long, default_value_t = 512)]
    height: u32,
    #[arg(long, default_value = "random")]
    seed: Seed,
    #[arg(long, default_value_t = 0.5)]
    similarity: f64,
    #[arg(long, default_value_t = 7.0)]
    guidance_scale: f64,
    #[arg(long, default_value_t = 30)]
    steps: u32,
    /// Canonical sampler id, e.g. k_lms or k_dpmpp_2m. Defaults to the backend's.
    #[arg(long)]
    sampler: Option<Sampler>,
    #[arg(long, default_value = "dreamdeck-")]
    prefix: String,
}

#[derive(Debug, Parser)]
struct UpscaleArgs {
    #[arg(long)]
    source: PathBuf,
    #[arg(long, default_value_t = 2.0)]
    factor: f64,
    #[arg(long, default_value = "")]
    upscaler: String,
    #[arg(long, default_value = "dreamdeck-upscaled-")]
    prefix: String,
}

#[derive(Debug, Parser)]
struct ModelsArgs {
    #[arg(long)]
    refresh: bool,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("dreamdeck error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let mut settings = match &cli.config {
        Some(path) => Settings::load(path)?,
        None => Settings::from_env(),
    };
    if let Some(backend) = &cli.backend {
        settings.backend = Some(backend.clone());
    }
    let registry = BackendRegistry::from_settings(&settings, Arc::new(ReqwestTransport::new()));

    match cli.command {
        Command::Generate(args) => run_generate(&registry, args),
        Command::Upscale(args) => run_upscale(&registry, args),
        Command::Backends => {
            print_backends(&registry);
            Ok(0)
        }
        Command::Models(args) => run_models(&registry, &settings, args),
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run_generate(registry: &BackendRegistry, args: GenerateArgs) -> Result<i32> {
    let backend = registry.active().map_err(|err| anyhow!(err))?;
    let capabilities = backend.capabilities();
    let mut request = GenerationRequest::new(args.prompt, args.source);
    request.negative_prompt = args.negative_prompt;
    request.width = args.width;
    request.height = args.height;
    request.seed = args.seed;
    request.similarity = args.similarity;
    request.guidance_scale = args.guidance_scale;
    request.steps = args.steps;
    request.sampler = args.sampler.unwrap_or(capabilities.default_sampler);

    let mut host = HostLoop::new();
    let outcome = host.outcome();
    let worker = spawn_generation(
        backend,
        request,
        args.prefix,
        host.reporter(),
        move |path| outcome.record(&path),
    );
    host.run_until_done(worker)
}

fn run_upscale(registry: &BackendRegistry, args: UpscaleArgs) -> Result<i32> {
    let backend = registry.active().map_err(|err| anyhow!(err))?;
    if !backend.capabilities().supports_upscaling {
        bail!("{} does not support upscaling", backend.id().display_name());
    }
    let request = UpscaleRequest {
        source_image: args.source,
        factor: args.factor,
        upscaler: args.upscaler,
    };

    let mut host = HostLoop::new();
    let outcome = host.outcome();
    let worker = spawn_upscale(
        backend,
        request,
        args.prefix,
        host.reporter(),
        move |path| outcome.record(&path),
    );
    host.run_until_done(worker)
}

fn print_backends(registry: &BackendRegistry) {
    for id in registry.ids() {
        let Some(caps) = registry.capabilities(id) else {
            continue;
        };
        let samplers = caps
            .samplers
            .iter()
            .map(|sampler| sampler.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        println!("{} ({})", id.display_name(), id);
        println!(
            "  image size: {}..{} pixels, max steps {}, output .{}",
            caps.min_image_size, caps.max_image_size, caps.max_steps, caps.output_extension
        );
        println!(
            "  api key: {}, negative prompts: {}, upscaling: {}",
            if caps.requires_api_key { "required" } else { "optional" },
            yes_no(caps.supports_negative_prompts),
            yes_no(caps.supports_upscaling)
        );
        println!("  samplers: {samplers} (default {})", caps.default_sampler);
    }
}

fn run_models(registry: &BackendRegistry, settings: &Settings, args: ModelsArgs) -> Result<i32> {
    let backend = match settings.selected_backend() {
        Some(raw) => raw.parse::<BackendId>().map_err(|message| anyhow!(message))?,
        None => bail!("no backend selected; pass --backend or set DREAMDECK_BACKEND"),
    };
    let models = registry
        .models(backend, args.refresh)
        .map_err(|err| anyhow!(err))
        .with_context(|| format!("failed listing {} models", backend.display_name()))?;
    for model in models {
        println!("{model}");
    }
    Ok(0)
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

/// Terminal stand-in for a host UI: prints errors, remembers the outcome.
#[derive(Default)]
struct Outcome {
    failed: AtomicBool,
    written: Mutex<Vec<PathBuf>>,
}

impl Outcome {
    fn record(&self, path: &Path) {
        match image::image_dimensions(path) {
            Ok((width, height)) => println!("{} ({width}x{height})", path.display()),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "result is not a readable image");
                println!("{}", path.display());
            }
        }
        if let Ok(mut written) = self.written.lock() {
            written.push(path.to_path_buf());
        }
    }
}

impl UiNotifier for Outcome {
    fn notify_error(&self, message: &str, key: &str) {
        self.failed.store(true, Ordering::SeqCst);
        if key.is_empty() {
            eprintln!("error: {message}");
        } else {
            eprintln!("error [{key}]: {message}");
        }
    }
}

/// Single-threaded cooperative tick, the way an embedding host would run.
#[derive(Default)]
struct TickLoop {
    callbacks: Vec<Box<dyn FnMut()>>,
}

impl HostScheduler for TickLoop {
    fn schedule_repeating(&mut self, callback: Box<dyn FnMut() + 'static>) {
        self.callbacks.push(callback);
    }
}

impl TickLoop {
    fn tick(&mut self) {
        for callback in &mut self.callbacks {
            callback();
        }
    }
}

struct HostLoop {
    ticks: TickLoop,
    queue: TaskQueue,
    outcome: Arc<Outcome>,
}

impl HostLoop {
    fn new() -> Self {
        let mut ticks = TickLoop::default();
        let queue = TaskQueue::global();
        queue.register(&mut ticks);
        Self {
            ticks,
            queue,
            outcome: Arc::new(Outcome::default()),
        }
    }

    fn outcome(&self) -> Arc<Outcome> {
        Arc::clone(&self.outcome)
    }

    fn reporter(&self) -> ErrorReporter {
        ErrorReporter::new(self.queue.clone(), self.outcome.clone())
    }

    fn run_until_done(&mut self, worker: Option<JoinHandle<()>>) -> Result<i32> {
        if let Some(worker) = worker {
            while !worker.is_finished() {
                self.ticks.tick();
                thread::sleep(TICK_INTERVAL);
            }
            if worker.join().is_err() {
                bail!("background worker panicked");
            }
        }
        // Whatever the worker queued before exiting.
        self.ticks.tick();

        let written = self
            .outcome
            .written
            .lock()
            .map(|paths| paths.len())
            .unwrap_or_default();
        info!(written, "done");
        if self.outcome.failed.load(Ordering::SeqCst) || written == 0 {
            Ok(1)
        } else {
            Ok(0)
        }
    }
}

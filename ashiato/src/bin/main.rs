use anyhow::anyhow;
use ashiato::bpf_events::Event;
use ashiato::config::Config;
use ashiato::events::Renderer;
use ashiato::reporter::{self, done_channel, JsonReporter, Output};
use ashiato::state::State;
use ashiato::util::account::Accounts;
use clap::builder::styling;
use clap::{Args, CommandFactory, FromArgMatches, Parser, Subcommand};
use env_logger::Builder;
use log::{info, warn, LevelFilter};

use std::fs;
use std::io::{self, BufRead, BufReader, Read};
use std::path::PathBuf;
use std::sync::Arc;

const ABOUT_ASHIATO: &str = r#"
        ▄▀█ █▀ █░█ █ ▄▀█ ▀█▀ █▀█
        █▀█ ▄█ █▀█ █ █▀█ ░█░ █▄█

Ashiato correlates process, socket and packet events coming from
the kernel into network flows attributed to the processes which
produced them. Flows are reported as JSON lines.
"#;

enum Input {
    Stdin(io::Stdin),
    File(fs::File),
}

impl Input {
    fn from_file(f: fs::File) -> Self {
        Self::File(f)
    }

    fn from_stdin() -> Self {
        Self::Stdin(io::stdin())
    }
}

impl Read for Input {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Stdin(stdin) => stdin.read(buf),
            Self::File(f) => f.read(buf),
        }
    }
}

#[derive(Parser)]
#[command(author, version, about = ABOUT_ASHIATO, long_about = None)]
struct Cli {
    /// Enable debugging
    #[arg(short, long)]
    debug: bool,

    /// Silents out debug, info, error logging.
    #[arg(short, long)]
    silent: bool,

    /// Set verbosity level, repeat option for more verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct ReplayOpt {
    /// Specify a configuration file to use. Command line options supersede the ones specified in the configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Where to write reports (stdout, stderr or a file path). Supersedes configuration file.
    #[arg(short, long)]
    output: Option<String>,

    /// Pid clock synchronization events are expected from. Defaults to
    /// the pid of the running process, set it to replay recorded events.
    #[arg(long)]
    clock_pid: Option<u32>,

    /// JSON line event files to replay, stdin is read if none is given
    /// or if a file is "-"
    files: Vec<String>,
}

impl TryFrom<&ReplayOpt> for Config {
    type Error = anyhow::Error;
    fn try_from(opt: &ReplayOpt) -> Result<Self, Self::Error> {
        let mut conf = match opt.config.as_ref() {
            Some(p) => Config::from_file(p)
                .map_err(|e| anyhow!("failed to load config {}: {e}", p.to_string_lossy()))?,
            None => Config::default(),
        };

        // command line supersedes configuration
        if let Some(output) = opt.output.as_ref() {
            conf = conf.output(output);
        }

        Ok(conf)
    }
}

#[derive(Debug, Args)]
struct ConfigOpt {
    /// Dump a default configuration on the terminal
    #[arg(long, exclusive = true)]
    dump: bool,

    /// Validate a configuration file
    #[arg(long, value_name = "FILE", exclusive = true)]
    check: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replay recorded kernel events and report the resulting flows
    Replay(ReplayOpt),
    /// Dump or check configuration
    Config(ConfigOpt),
}

/// Applies every event of `files` to the state, serially
fn ingest(state: &State, files: &[String]) -> anyhow::Result<()> {
    let stdin = vec!["-".to_string()];
    let files = if files.is_empty() { &stdin[..] } else { files };

    for f in files {
        let reader = if f == "-" {
            BufReader::new(Input::from_stdin())
        } else {
            BufReader::new(Input::from_file(
                fs::File::open(f).map_err(|e| anyhow!("failed to open {f}: {e}"))?,
            ))
        };

        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            let ev: Event = match serde_json::from_str(&line) {
                Ok(ev) => ev,
                Err(e) => {
                    warn!("{f}:{}: failed to decode event: {e}", i + 1);
                    continue;
                }
            };

            let _ = ev
                .update(state)
                .inspect_err(|e| warn!("{f}:{}: {e}", i + 1));
        }
    }

    Ok(())
}

impl Command {
    fn replay(o: ReplayOpt) -> anyhow::Result<()> {
        let conf = Config::try_from(&o)?;
        conf.validate()?;

        let host_uuid = conf
            .clone()
            .generate_host_uuid()
            .host_uuid()
            .ok_or(anyhow!("failed to get host_uuid"))?;

        let mut state = State::new(&conf);
        if let Some(pid) = o.clock_pid {
            state = state.with_own_pid(pid);
        }
        let state = Arc::new(state);

        let renderer = Arc::new(
            Renderer::new(host_uuid, Accounts::from_sys()).with_resolver(state.host_resolver()),
        );
        let sink = Arc::new(JsonReporter::new(
            Output::open(&conf.output)
                .map_err(|e| anyhow!("failed to open output {}: {e}", conf.output))?,
        ));

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;

        let res = runtime.block_on(async move {
            let (canceller, shutdown) = done_channel();

            let reaper = tokio::spawn(reporter::reap_loop(
                state.clone(),
                sink.clone(),
                renderer.clone(),
                conf.reap_interval,
                shutdown.clone(),
            ));

            let logger = tokio::spawn(reporter::log_state_loop(
                state.clone(),
                conf.state_log_interval,
                shutdown,
            ));

            let files = o.files;
            let ingest_state = state.clone();
            let ingestion = tokio::task::spawn_blocking(move || ingest(&ingest_state, &files));

            let res = tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted");
                    Ok(())
                },
                res = ingestion => res?,
            };

            canceller.cancel();
            reaper.await?;
            logger.await?;

            // in flight flows get reported on exit
            state.terminate_all();
            reporter::flush(&state, sink.as_ref(), &renderer);
            info!("final state: {}", state.stats());

            res
        });

        // ingestion may still be blocked reading stdin
        runtime.shutdown_background();
        res
    }

    fn config(o: ConfigOpt) -> anyhow::Result<()> {
        if o.dump {
            println!("{}", serde_yaml::to_string(&Config::default())?);
            return Ok(());
        }

        if let Some(p) = o.check {
            Config::from_file(&p)
                .map_err(|e| anyhow!("invalid config {}: {e}", p.to_string_lossy()))?;
            println!("{} is valid", p.to_string_lossy());
            return Ok(());
        }

        Err(anyhow!("one of --dump or --check is expected"))
    }
}

fn main() -> Result<(), anyhow::Error> {
    let c = {
        let c: clap::Command = Cli::command();
        let styles = styling::Styles::styled()
            .header(styling::AnsiColor::Green.on_default() | styling::Effects::BOLD)
            .usage(styling::AnsiColor::Green.on_default() | styling::Effects::BOLD)
            .literal(styling::AnsiColor::Blue.on_default() | styling::Effects::BOLD)
            .placeholder(styling::AnsiColor::Cyan.on_default());

        c.styles(styles)
    };

    let cli: Cli = Cli::from_arg_matches(&c.get_matches())?;

    // setting log level according to the verbosity level
    let mut log_level = LevelFilter::Warn;
    match cli.verbose {
        1 => log_level = LevelFilter::Info,
        2 => log_level = LevelFilter::Debug,
        3..=u8::MAX => log_level = LevelFilter::Trace,
        _ => {}
    }

    // silent out logging if specified in CLI
    if cli.silent {
        log_level = LevelFilter::Off;
    }

    if cli.debug {
        log_level = LevelFilter::Debug;
    }

    // building the logger
    Builder::new().filter_level(log_level).init();

    match cli.command {
        Command::Replay(o) => Command::replay(o),
        Command::Config(o) => Command::config(o),
    }
}

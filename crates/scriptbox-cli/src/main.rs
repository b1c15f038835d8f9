use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use log::LevelFilter;
use scriptbox_core::config::LoggingConfig;
use scriptbox_core::{
    find_language, language_for_extension, ConfigLoader, Dispatcher, InputHandler,
    InputRendezvous, RunOutcome, ScriptboxConfig, ScriptboxError, StdoutConsole,
};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[clap(
    name = "scriptbox",
    author,
    version,
    about = "Run interactive JavaScript, Lua and Python programs in isolated workers"
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[clap(
        long,
        short,
        default_value = "scriptbox.yaml",
        help = "Configuration file; defaults apply when it does not exist"
    )]
    config: PathBuf,

    #[clap(long, short, help = "Log level (off, error, warn, info, debug, trace)")]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a program, answering its input requests from stdin
    Run {
        file: PathBuf,

        #[clap(long, help = "Language id; inferred from the file extension when omitted")]
        lang: Option<String>,

        #[clap(long, help = "Write each answer back to the console")]
        echo_input: bool,
    },
    /// List the languages this build can run
    Languages,
    /// Print the sample program for a language
    Sample { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ConfigLoader::from_file_or_default(&cli.config)
        .await
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    init_logging(&config.logging)?;

    match cli.command {
        Commands::Run {
            file,
            lang,
            echo_input,
        } => run_program(config, &file, lang, echo_input).await,
        Commands::Languages => {
            let dispatcher = Dispatcher::from_config(&config);
            for lang in dispatcher.languages() {
                println!("{:<4} {:<12} {:<12} .{}", lang.short, lang.id, lang.name, lang.extension);
            }
            Ok(())
        }
        Commands::Sample { id } => {
            let lang = find_language(&id).ok_or_else(|| anyhow!("Unknown language '{}'", id))?;
            print!("{}", lang.sample);
            Ok(())
        }
    }
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let level = logging.level.parse().unwrap_or(LevelFilter::Info);
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);

    // Program output owns stdout; diagnostics go to stderr or a file.
    if let Some(path) = &logging.file {
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }

    builder.init();
    Ok(())
}

async fn run_program(
    mut config: ScriptboxConfig,
    file: &Path,
    lang: Option<String>,
    echo_input: bool,
) -> Result<()> {
    let language = match lang {
        Some(id) => id,
        None => file
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(language_for_extension)
            .map(|lang| lang.id.to_string())
            .ok_or_else(|| {
                anyhow!(
                    "Cannot infer the language of {}; pass --lang",
                    file.display()
                )
            })?,
    };
    let source = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    if echo_input {
        config.runners.javascript.echo_input = true;
        config.runners.lua.echo_input = true;
        config.runners.python.echo_input = true;
    }

    let dispatcher = Arc::new(Dispatcher::from_config(&config));
    let input = Arc::new(InputRendezvous::new());
    let prompts = tokio::spawn(answer_prompts(Arc::clone(&input)));
    let interrupts = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                log::info!("Interrupt received, cancelling run");
                dispatcher.cancel_current();
            }
        })
    };

    let outcome = dispatcher
        .dispatch(&language, &source, input, Arc::new(StdoutConsole))
        .await;

    interrupts.abort();
    prompts.abort();
    dispatcher.cleanup_all();

    match outcome {
        RunOutcome::Completed => Ok(()),
        RunOutcome::Cancelled => bail!("Execution cancelled"),
        RunOutcome::Failed(message) => bail!("Execution failed: {}", message),
        RunOutcome::Unsupported => Err(ScriptboxError::UnsupportedLanguage(language).into()),
    }
}

/// Feeds stdin lines to the program whenever it asks for input.
async fn answer_prompts(input: Arc<InputRendezvous>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        input.wait_for_request().await;
        match lines.next_line().await {
            Ok(Some(line)) => {
                input.submit(&line);
            }
            Ok(None) => input.abandon(),
            Err(e) => {
                log::warn!("Failed to read from stdin: {}", e);
                input.abandon();
            }
        }
    }
}

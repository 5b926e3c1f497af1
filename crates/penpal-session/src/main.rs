//! Terminal front end: type to talk, slash commands to control the session.

use anyhow::Context;
use clap::Parser;
use penpal_session::{
    LaunchProfile, PersonaTable, SessionConfig, ShutdownConfig, TrailingLinePolicy, WriterSink,
    init_tracing, new_session,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

#[derive(Debug, Parser)]
#[command(name = "penpal-session", version, about = "Practise a language with a conversational pen-pal")]
struct Cli {
    /// Language to practise (looked up in the persona table)
    #[arg(short, long, default_value = "American")]
    language: String,

    /// Persona name, overriding the persona table
    #[arg(short, long)]
    persona: Option<String>,

    /// JSON file mapping language to persona name
    #[arg(long)]
    persona_table: Option<PathBuf>,

    #[arg(long, default_value = "python3")]
    interpreter: String,

    /// Conversation script passed to the interpreter
    #[arg(long, default_value = "penpal.py")]
    script: PathBuf,

    #[arg(long)]
    working_dir: Option<PathBuf>,

    /// Milliseconds the child gets to exit after EXIT
    #[arg(long, default_value_t = 3_000)]
    exit_timeout_ms: u64,

    #[arg(long, default_value_t = 2_000)]
    kill_timeout_ms: u64,

    #[arg(long, default_value_t = 500)]
    drain_timeout_ms: u64,

    /// Drop output lines longer than this many bytes
    #[arg(long)]
    max_line_length: Option<usize>,

    /// Deliver a final unterminated output line instead of dropping it
    #[arg(long)]
    flush_trailing: bool,

    /// Emit logs as JSON on stderr
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn session_config(&self) -> anyhow::Result<SessionConfig> {
        let table = match &self.persona_table {
            Some(path) => PersonaTable::load(path)?,
            None => PersonaTable::default(),
        };

        let profile = match &self.persona {
            Some(persona) => LaunchProfile::new(self.language.trim(), persona.trim()),
            None => LaunchProfile::from_table(&self.language, &table).with_context(|| {
                let known: Vec<&str> = table.languages().collect();
                format!(
                    "no persona for language '{}' (known: {})",
                    self.language,
                    known.join(", ")
                )
            })?,
        };

        let mut builder = SessionConfig::builder();
        builder
            .interpreter(self.interpreter.as_str())
            .script(self.script.clone())
            .profile(profile)
            .shutdown(ShutdownConfig {
                exit_timeout_ms: self.exit_timeout_ms,
                kill_timeout_ms: self.kill_timeout_ms,
                drain_timeout_ms: self.drain_timeout_ms,
            });
        if let Some(dir) = &self.working_dir {
            builder.working_directory(dir.clone());
        }
        if let Some(max) = self.max_line_length {
            builder.max_line_length(max);
        }
        if self.flush_trailing {
            builder.trailing_line(TrailingLinePolicy::Flush);
        }

        Ok(builder.build()?)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    TogglePause,
    Audio,
    Stop,
    Start,
    Quit,
    Say(&'a str),
}

impl<'a> Command<'a> {
    fn parse(line: &'a str) -> Self {
        match line.trim() {
            "/pause" | "/resume" => Command::TogglePause,
            "/audio" => Command::Audio,
            "/stop" => Command::Stop,
            "/start" => Command::Start,
            "/quit" | "/exit" => Command::Quit,
            _ => Command::Say(line),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing("warn", cli.log_json);

    let config = cli.session_config()?;
    info!(
        language = %config.profile.language,
        persona = %config.profile.persona,
        "starting penpal session"
    );

    let mut session = new_session(config, Arc::new(WriterSink::stdio()));
    // A failed start is already reported on stderr; /start retries.
    if let Err(e) = session.start().await {
        debug!(error = %e, "initial start failed");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read terminal input")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        let result = match Command::parse(&line) {
            Command::TogglePause => session.toggle_pause().await.map(|state| {
                eprintln!("[{state}] next: {}", state.pause_label());
            }),
            Command::Audio => session.start_audio().await.map(drop),
            Command::Stop => {
                session.stop().await;
                Ok(())
            }
            Command::Start => session.start().await.map(drop),
            Command::Quit => break,
            Command::Say(text) => session.send_line(text).await.map(drop),
        };
        if let Err(e) = result {
            debug!(error = %e, "command failed");
        }
    }

    let report = session.stop().await;
    if report.was_forced() {
        info!(errors = ?report.errors, "conversation had to be killed");
    }
    Ok(())
}

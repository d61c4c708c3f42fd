//! Encore CLI - Command-line interface for the Encore runtime
//!
//! Runs workflow programs against a scripted oracle and inspects the
//! sessions and checkpoints they leave behind.

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use encore::runtime::checkpoint::load_checkpoint;
use encore::runtime::storage::{self, CheckpointStore, FilesystemCheckpointStore};
use encore::runtime::{
    Codec, Program, ResumeRequest, RuntimeConfig, ScriptedOracle, SessionRegistry, WorkflowSet,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "encore")]
#[command(about = "Resumable multi-agent playbook runtime", long_about = None)]
struct Cli {
    /// Root directory for runtime storage
    #[arg(short, long, default_value = ".encore")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the storage root and write a config file
    Init {
        /// Checkpoints kept per execution (0 keeps everything)
        #[arg(long, default_value = "20")]
        keep_last: usize,

        /// Checkpoint encoding
        #[arg(long, value_enum, default_value_t = Codec::Json)]
        codec: Codec,
    },

    /// Run a program
    Run {
        /// Workflow files defining the agent classes
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Oracle script (JSON object of class or agent id to turns)
        #[arg(long)]
        script: PathBuf,

        /// Resume the last session of these workflows, or the given session
        #[arg(long, num_args = 0..=1, value_name = "SESSION")]
        resume: Option<Option<String>>,

        /// Split scripted turns into chunks of this many characters
        #[arg(long, default_value = "0")]
        chunk_size: usize,
    },

    /// List known sessions
    Sessions,

    /// List checkpoints of a session
    Checkpoints {
        /// Session id
        session: String,

        /// Execution id (an agent id); defaults to the program index
        execution: Option<String>,
    },

    /// Delete old checkpoints of one execution
    Prune {
        /// Session id
        session: String,

        /// Execution id (an agent id, or `{session}_program`)
        execution: String,

        /// Checkpoints to keep
        #[arg(long)]
        keep: usize,
    },
}

fn load_or_default(root: &Path) -> RuntimeConfig {
    match storage::load_config(root) {
        Ok(config) => RuntimeConfig {
            root: root.to_path_buf(),
            ..config
        },
        Err(_) => RuntimeConfig::with_root(root),
    }
}

fn session_store(config: &RuntimeConfig, session: &str) -> anyhow::Result<FilesystemCheckpointStore> {
    if !storage::is_safe_execution_id(session) {
        bail!("'{}' is not a valid session id", session);
    }
    let dir = config.session_dir(session);
    if !dir.exists() {
        bail!("no checkpoints for session {}", session);
    }
    Ok(FilesystemCheckpointStore::new(dir, config.max_checkpoint_bytes))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_or_default(&cli.root);

    let level = if config.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    match cli.command {
        Commands::Init { keep_last, codec } => {
            let config = RuntimeConfig {
                keep_last,
                codec,
                ..RuntimeConfig::with_root(&cli.root)
            };
            storage::init_storage(&config.root)?;
            storage::write_config(&config)?;
            println!("Initialized Encore runtime at {:?}", config.root);
        }

        Commands::Run {
            files,
            script,
            resume,
            chunk_size,
        } => {
            let workflows = WorkflowSet::load(&files).context("loading workflows")?;
            let oracle = ScriptedOracle::from_file(&script)
                .context("loading oracle script")?
                .with_chunk_size(chunk_size);

            let mut program = Program::new(config, workflows, Arc::new(oracle));
            let start = program.prepare(ResumeRequest::from_flag(resume))?;
            println!("Session: {}", start.session_id);
            if let Some(restore) = &start.restore {
                println!("Resumed: {}", restore);
            }

            program.start()?;
            let report = tokio::select! {
                report = program.wait() => report?,
                _ = tokio::signal::ctrl_c() => {
                    program.abort();
                    println!("Interrupted; resume with --resume {}", start.session_id);
                    return Ok(());
                }
            };

            for entry in &report.transcript {
                println!("[{}] {}", entry.from, entry.content);
            }
            println!("{} agents, session {}", report.agents.len(), report.session_id);
        }

        Commands::Sessions => {
            let sessions = SessionRegistry::open(&config.checkpoints_dir())?;
            let entries = sessions.entries();
            if entries.is_empty() {
                println!("No sessions");
            }
            for (hash, session) in entries {
                println!("{}  {}", hash, session);
            }
        }

        Commands::Checkpoints { session, execution } => {
            let store = session_store(&config, &session)?;
            let execution = execution.unwrap_or_else(|| format!("{}_program", session));
            let ids = store.list(&execution)?;
            if ids.is_empty() {
                println!("No checkpoints for {}", execution);
            }
            for id in ids {
                match load_checkpoint(&store, &id) {
                    Ok(Some(checkpoint)) => println!(
                        "{}  {}  [{}]  {}",
                        id,
                        checkpoint.metadata.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        checkpoint
                            .metadata
                            .call_stack
                            .iter()
                            .map(|frame| frame.instruction_pointer.to_string())
                            .collect::<Vec<_>>()
                            .join(", "),
                        checkpoint.metadata.statement
                    ),
                    // The program index is not an agent checkpoint
                    _ => println!("{}", id),
                }
            }
        }

        Commands::Prune {
            session,
            execution,
            keep,
        } => {
            let store = session_store(&config, &session)?;
            let removed = store.prune(&execution, keep)?;
            println!("Removed {} checkpoints of {}", removed, execution);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_codec(args: &[&str]) -> Result<Codec, clap::Error> {
        let cli = Cli::try_parse_from(args)?;
        match cli.command {
            Commands::Init { codec, .. } => Ok(codec),
            _ => panic!("expected init"),
        }
    }

    #[test]
    fn codec_flag_accepts_known_encodings() {
        assert_eq!(init_codec(&["encore", "init"]).unwrap(), Codec::Json);
        assert_eq!(
            init_codec(&["encore", "init", "--codec", "preserves"]).unwrap(),
            Codec::Preserves
        );
    }

    #[test]
    fn codec_flag_rejects_unknown_encoding() {
        let err = init_codec(&["encore", "init", "--codec", "yaml"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidValue);
    }
}

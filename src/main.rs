use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tribrid_rag::commands::{
    index_corpus, mine_usage, promote_run, run_learning_loop, search_corpus, show_config,
    show_status, train_adapter,
};

#[derive(Parser)]
#[command(name = "tribrid-rag")]
#[command(about = "Tri-brid retrieval-augmented search over source-code corpora")]
#[command(version)]
struct Cli {
    /// Base directory for config, indexes, and caches
    #[arg(long, default_value = ".tribrid")]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build or refresh the index for a corpus
    Index {
        /// Corpus identifier
        corpus: String,
        /// Corpus root directory
        path: PathBuf,
        /// Re-process every file, ignoring the delta
        #[arg(long)]
        force: bool,
    },
    /// Query a corpus
    Search {
        /// Corpus identifier
        corpus: String,
        /// Query text
        query: String,
        /// Number of results to return
        #[arg(long)]
        top_k: Option<usize>,
    },
    /// Show per-corpus build and store status
    Status,
    /// Mine training triplets from the usage event log
    Mine {
        /// Replace the triplet file instead of appending
        #[arg(long)]
        replace: bool,
    },
    /// Train a reranker adapter from mined triplets
    Train {
        /// Corpus the triplets' chunks resolve against
        corpus: String,
    },
    /// Run the background learning loop until interrupted
    Learn {
        /// Corpus the mined triplets resolve against
        corpus: String,
        /// Seconds between learning cycles
        #[arg(long, default_value_t = 300)]
        period: u64,
    },
    /// Promote a completed training run's adapter
    Promote {
        /// Training run identifier
        run_id: String,
    },
    /// Show the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Index {
            corpus,
            path,
            force,
        } => {
            index_corpus(&cli.config_dir, corpus, path, force).await?;
        }
        Commands::Search {
            corpus,
            query,
            top_k,
        } => {
            search_corpus(&cli.config_dir, corpus, query, top_k).await?;
        }
        Commands::Status => {
            show_status(&cli.config_dir).await?;
        }
        Commands::Mine { replace } => {
            mine_usage(&cli.config_dir, replace).await?;
        }
        Commands::Train { corpus } => {
            train_adapter(&cli.config_dir, corpus).await?;
        }
        Commands::Learn { corpus, period } => {
            run_learning_loop(&cli.config_dir, corpus, period).await?;
        }
        Commands::Promote { run_id } => {
            promote_run(&cli.config_dir, run_id).await?;
        }
        Commands::Config => {
            show_config(&cli.config_dir)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn parses_index_command() {
        let cli = Cli::try_parse_from(["tribrid-rag", "index", "my-corpus", "/tmp/src", "--force"])
            .expect("parse succeeds");
        match cli.command {
            Commands::Index {
                corpus,
                path,
                force,
            } => {
                assert_eq!(corpus, "my-corpus");
                assert_eq!(path, PathBuf::from("/tmp/src"));
                assert!(force);
            }
            _ => panic!("expected index command"),
        }
    }

    #[test]
    fn parses_search_with_top_k() {
        let cli = Cli::try_parse_from([
            "tribrid-rag",
            "search",
            "my-corpus",
            "login handler",
            "--top-k",
            "5",
        ])
        .expect("parse succeeds");
        match cli.command {
            Commands::Search { query, top_k, .. } => {
                assert_eq!(query, "login handler");
                assert_eq!(top_k, Some(5));
            }
            _ => panic!("expected search command"),
        }
    }

    #[test]
    fn invalid_command_is_rejected() {
        let cli = Cli::try_parse_from(["tribrid-rag", "explode"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);
        }
    }
}

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "codeduel-cli")]
#[command(about = "CodeDuel CLI - Run submissions, inspect harnesses and manage sandboxes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a solution file against a problem and print the result JSON
    Run {
        /// Problem id (e.g., two-sum)
        #[arg(short, long)]
        problem: String,

        /// Guest language (python, javascript, java, cpp or an alias)
        #[arg(short, long)]
        language: String,

        /// Path to the solution source
        #[arg(short, long)]
        file: String,

        /// Function to call (defaults to the problem's)
        #[arg(long)]
        function: Option<String>,

        /// Only run the first N test cases
        #[arg(long)]
        sample: Option<usize>,

        /// Per-run timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Print the generated program for a solution without running it
    Harness {
        #[arg(short, long)]
        problem: String,

        #[arg(short, long)]
        language: String,

        #[arg(short, long)]
        file: String,

        /// Embed the problem's test inputs instead of reading them from argv
        #[arg(long, default_value = "false")]
        embed: bool,
    },

    /// Pull images, start pooled containers and smoke-test each language
    Warmup {
        /// Languages to warm (defaults to all configured)
        #[arg(short, long)]
        language: Vec<String>,

        /// Leave the containers running afterwards
        #[arg(long, default_value = "false")]
        keep: bool,
    },

    /// Remove every container this deployment manages
    Teardown,

    /// List configured languages
    Languages,

    /// Push a submission onto the Redis queue
    Enqueue {
        #[arg(short, long)]
        problem: String,

        #[arg(short, long)]
        language: String,

        #[arg(short, long)]
        file: String,

        #[arg(long)]
        function: Option<String>,

        /// Wait up to this many seconds for the worker's result
        #[arg(long)]
        wait: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            problem,
            language,
            file,
            function,
            sample,
            timeout,
        } => {
            commands::run_solution(&problem, &language, &file, function.as_deref(), sample, timeout).await?;
        }
        Commands::Harness {
            problem,
            language,
            file,
            embed,
        } => {
            commands::print_harness(&problem, &language, &file, embed)?;
        }
        Commands::Warmup { language, keep } => {
            commands::warm_up(&language, keep).await?;
        }
        Commands::Teardown => {
            commands::teardown().await?;
        }
        Commands::Languages => {
            commands::list_languages()?;
        }
        Commands::Enqueue {
            problem,
            language,
            file,
            function,
            wait,
        } => {
            commands::enqueue(&problem, &language, &file, function.as_deref(), wait).await?;
        }
    }

    Ok(())
}

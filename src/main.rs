use std::time::Instant;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use webpipe::{Project, as_overhead, init_logging};

#[derive(Parser, Debug)]
#[command(name = "webpipe", version, about = "Front-end asset pipeline")]
struct Cli {
    /// Project root, the directory holding `package.json`.
    #[arg(long, global = true, default_value = ".")]
    root: Utf8PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the project into the output directory.
    Build,
    /// Clean, build, then rebuild on every change.
    #[cfg(feature = "live")]
    Watch,
    /// Like `watch`, also serving the output with live reload.
    #[cfg(feature = "server")]
    Serve,
    /// Run the linter over the scripts.
    Lint,
    /// Remove the staging and output directories.
    Clean,
    /// Remove cached compressed images.
    ClearImageCache,
    /// Make a compressed build from scratch and publish it.
    Deploy {
        /// Deploy environment, e.g. `dev` or `qa`.
        environment: String,
    },
    /// Print the task graph as a Mermaid diagram.
    Graph,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging()?;

    let start = Instant::now();
    let project = Project::open(&cli.root)?;

    match cli.command {
        None => {
            project.rebuild()?;
        }
        Some(Command::Build) => {
            project.build()?;
        }
        #[cfg(feature = "live")]
        Some(Command::Watch) => project.watch()?,
        #[cfg(feature = "server")]
        Some(Command::Serve) => project.serve()?,
        Some(Command::Lint) => project.lint()?,
        Some(Command::Clean) => project.clean()?,
        Some(Command::ClearImageCache) => project.clear_image_cache()?,
        Some(Command::Deploy { environment }) => {
            project.deploy(&environment)?;
        }
        Some(Command::Graph) => {
            println!("{}", project.graph());
            return Ok(());
        }
    }

    tracing::info!("done {}", as_overhead(start));
    Ok(())
}

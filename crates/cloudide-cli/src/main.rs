mod attach;
mod keys;

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use serde_json::Value;
use tracing::info;

use cloudide_protocol::{FileNode, ProjectType, WorkspaceRequest, tags};
use cloudide_session::{ClientConfig, Session};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Output of `exec` is complete once the backend has been quiet this long.
const EXEC_IDLE: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(
    name = "cloudide",
    about = "Command-line client for cloud IDE workspaces",
    after_help = "Requests are matched to replies by requestId. If every request times out, \
                  the backend probably does not echo it: set reply_matching = \"event_tag\" \
                  in the config file."
)]
struct Cli {
    /// Config file [default: $XDG_CONFIG_HOME/cloudide/config.toml]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Workspace connection URL (overrides config and $CLOUDIDE_WORKSPACE_URL)
    #[arg(long, global = true)]
    workspace_url: Option<String>,

    /// Terminal connection URL (overrides config and $CLOUDIDE_TERMINAL_URL)
    #[arg(long, global = true)]
    terminal_url: Option<String>,

    /// Workspace identifier
    #[arg(long, short = 'w', global = true, default_value = "default")]
    workspace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision the workspace from a project template
    Init {
        /// python, nodejs, golang, cpp or react
        project_type: ProjectType,
    },

    /// Print the workspace file tree
    Tree,

    /// Print a file
    Cat {
        /// Path relative to the project root
        path: String,
    },

    /// Replace a file with the contents of stdin
    Write {
        /// Path relative to the project root
        path: String,
    },

    /// Create an empty file
    Touch { path: String },

    /// Create a folder
    Mkdir { path: String },

    /// Delete a file or, with --dir, a folder
    Rm {
        path: String,

        #[arg(long)]
        dir: bool,
    },

    /// Run an instruction in the workspace terminal and print its output
    Exec { instruction: String },

    /// Attach this terminal to the workspace shell
    Attach {
        /// Logical terminal id, for several terminals on one workspace
        #[arg(long, default_value = "")]
        terminal: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so they never interleave with terminal output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,cloudide=info,cloudide_session=info".into()),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let session = connect(config, &cli.workspace).await?;

    let result = run(&session, cli.command).await;
    session.unmount();
    result
}

fn load_config(cli: &Cli) -> Result<ClientConfig> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(ClientConfig::default_path);
    let mut config = ClientConfig::load_from(&path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    config.apply_overrides(cli.workspace_url.clone(), cli.terminal_url.clone());
    config.validate()?;
    Ok(config)
}

async fn connect(config: ClientConfig, workspace: &str) -> Result<Session> {
    let url = config.workspace_url.clone();
    let session = Session::mount(config, workspace);
    let ready = timeout(CONNECT_TIMEOUT, session.wait_ready())
        .await
        .unwrap_or(false);
    if !ready {
        bail!("could not connect to workspace at {url}");
    }
    info!(%url, workspace, "connected");
    Ok(session)
}

async fn run(session: &Session, command: Commands) -> Result<()> {
    match command {
        Commands::Init { project_type } => {
            let reply = session.init_project(project_type).await?;
            println!("{}", reply.message);
        }
        Commands::Tree => {
            let tree = session.get_tree().await?;
            let mut stdout = io::stdout().lock();
            print_tree(&tree, 0, &mut stdout)?;
        }
        Commands::Cat { path } => {
            let content = session.get_file(&path).await?;
            let mut stdout = io::stdout().lock();
            stdout.write_all(content.as_bytes())?;
            stdout.flush()?;
        }
        Commands::Write { path } => {
            let mut content = String::new();
            io::stdin()
                .read_to_string(&mut content)
                .context("failed to read stdin")?;
            write_document(session, &path, content).await?;
        }
        Commands::Touch { path } => {
            println!("{}", session.create_file(&path).await?.message);
        }
        Commands::Mkdir { path } => {
            println!("{}", session.create_folder(&path).await?.message);
        }
        Commands::Rm { path, dir } => {
            let reply = if dir {
                session.delete_folder(&path).await?
            } else {
                session.delete_file(&path).await?
            };
            println!("{}", reply.message);
        }
        Commands::Exec { instruction } => exec(session, instruction).await?,
        Commands::Attach { terminal } => attach::run(session, &terminal).await?,
    }
    Ok(())
}

/// Output arrives as a stream of untagged `terminal:output` events with no
/// final reply. Print chunks until the stream goes quiet or the connection
/// closes.
async fn exec(session: &Session, instruction: String) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let subscription = session.subscribe(tags::TERMINAL_OUTPUT, move |payload| {
        let _ = tx.send(payload.clone());
    });
    if !session.send(&WorkspaceRequest::RequestTerminal { instruction }) {
        subscription.unsubscribe();
        bail!("workspace connection is not open");
    }

    let mut stdout = io::stdout().lock();
    let mut wait = CONNECT_TIMEOUT;
    let mut received = false;
    loop {
        tokio::select! {
            chunk = timeout(wait, rx.recv()) => match chunk {
                Ok(Some(payload)) => {
                    write_output(&payload, &mut stdout)?;
                    received = true;
                    wait = EXEC_IDLE;
                }
                Ok(None) | Err(_) => break,
            },
            _ = session.closed() => break,
        }
    }
    subscription.unsubscribe();
    // Chunks that arrived together with the close.
    while let Ok(payload) = rx.try_recv() {
        write_output(&payload, &mut stdout)?;
        received = true;
    }
    if !received {
        bail!("no output within {}s", CONNECT_TIMEOUT.as_secs());
    }
    Ok(())
}

fn write_output(payload: &Value, out: &mut impl Write) -> io::Result<()> {
    match payload.as_str() {
        Some(text) => out.write_all(text.as_bytes())?,
        None => writeln!(out, "{payload}")?,
    }
    out.flush()
}

/// Goes through the debounced edit path, then waits for the backend to
/// confirm the write.
async fn write_document(session: &Session, path: &str, content: String) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    session.subscribe_once(tags::FILE_UPDATED, move |_| {
        let _ = tx.send(());
    });
    session.on_document_edit(path, content);

    let wait = session.config().debounce() + CONNECT_TIMEOUT;
    match timeout(wait, rx).await {
        Ok(Ok(())) => {
            println!("{}", tags::FILE_UPDATED);
            Ok(())
        }
        _ => bail!("no confirmation for {path} within {}s", wait.as_secs()),
    }
}

fn print_tree(node: &FileNode, depth: usize, out: &mut impl Write) -> io::Result<()> {
    let marker = if node.is_folder() { "/" } else { "" };
    writeln!(out, "{}{}{marker}", "  ".repeat(depth), node.name)?;
    for child in &node.children {
        print_tree(child, depth + 1, out)?;
    }
    Ok(())
}

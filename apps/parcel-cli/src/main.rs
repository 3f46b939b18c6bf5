use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use parcel_core::{DownloadToken, ParcelConfig};
use parcel_kernel::Kernel;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "parcel-cli", version, about = "Parcel token administration")]
struct Cli {
    /// Token store directory (defaults to the server's configured state dir)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download token helpers
    Tokens {
        #[command(subcommand)]
        cmd: TokensCmd,
    },
}

#[derive(Subcommand)]
enum TokensCmd {
    /// Issue a new single-use download token
    Issue(IssueArgs),
    /// Show one token record
    Show(ShowArgs),
    /// List the most recently issued tokens
    List(ListArgs),
}

#[derive(Args)]
struct IssueArgs {
    /// Who receives the completion notification
    #[arg(long)]
    recipient: String,
    /// Asset file name under the assets directory
    #[arg(long)]
    asset: String,
    /// Explicit token value (random when omitted)
    #[arg(long)]
    token: Option<String>,
    /// Print the full record as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct ShowArgs {
    token: String,
    /// Print the full record as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct ListArgs {
    #[arg(long, default_value_t = 50)]
    limit: i64,
    /// Print records as a JSON array
    #[arg(long)]
    json: bool,
}

fn main() {
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let state_dir = match cli.state_dir {
        Some(dir) => dir,
        None => ParcelConfig::from_env()?.storage.state_dir,
    };
    let kernel = Kernel::open(&state_dir)
        .with_context(|| format!("open token store in {}", state_dir.display()))?;
    match cli.command {
        Commands::Tokens { cmd } => match cmd {
            TokensCmd::Issue(args) => cmd_issue(&kernel, args),
            TokensCmd::Show(args) => cmd_show(&kernel, args),
            TokensCmd::List(args) => cmd_list(&kernel, args),
        },
    }
}

fn cmd_issue(kernel: &Kernel, args: IssueArgs) -> Result<()> {
    let recipient = args.recipient.trim();
    let asset = args.asset.trim();
    if recipient.is_empty() {
        bail!("--recipient must not be empty");
    }
    if asset.is_empty() {
        bail!("--asset must not be empty");
    }
    let token = match args.token.as_deref().map(str::trim) {
        Some("") => bail!("--token must not be empty"),
        Some(t) => t.to_string(),
        None => uuid::Uuid::new_v4().simple().to_string(),
    };
    let record = kernel.issue_token(&token, recipient, asset)?;
    tracing::debug!(asset, "token issued");
    if args.json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        println!("{}", record.token);
    }
    Ok(())
}

fn cmd_show(kernel: &Kernel, args: ShowArgs) -> Result<()> {
    let Some(record) = kernel.get_token(args.token.trim())? else {
        bail!("token not found");
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        print_record(&record);
    }
    Ok(())
}

fn cmd_list(kernel: &Kernel, args: ListArgs) -> Result<()> {
    let records = kernel.list_tokens(args.limit.max(1))?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    for record in &records {
        println!(
            "{:<34} {:<10} {:>12}  {}",
            record.token,
            record.state.as_str(),
            record.coverage.total_covered(),
            record.asset_id
        );
    }
    Ok(())
}

fn print_record(record: &DownloadToken) {
    println!("token:      {}", record.token);
    println!("recipient:  {}", record.recipient);
    println!("asset:      {}", record.asset_id);
    println!("state:      {}", record.state);
    println!("covered:    {} bytes", record.coverage.total_covered());
    for range in record.coverage.ranges() {
        println!("  - {range}");
    }
    if let Some(at) = record.completed_at {
        println!("completed:  {}", at.to_rfc3339());
    }
    if let Some(at) = record.notified_at {
        println!("notified:   {}", at.to_rfc3339());
    }
    println!("updated:    {}", record.updated.to_rfc3339());
}

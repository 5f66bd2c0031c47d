mod ferry;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "ferry",
    version,
    about = "ferry - expose local HTTP services through pooled reverse tunnels"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses FERRY_CONFIG; then auto-detects ferry.toml > ferry.yaml > ferry.yml from CWD; then falls back to the OS default path (Linux: /etc/ferry/ferry.toml; others: user config dir).
    #[arg(long, env = "FERRY_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Public listen address for tunnel traffic and the API (overrides `api_addr`).
    #[arg(long)]
    api_addr: Option<String>,

    /// Listen address tunnel clients dial to lend sockets (overrides `tunnel_addr`).
    #[arg(long)]
    tunnel_addr: Option<String>,

    /// Base domain; tunnels are served at `<id>.<domain>` (overrides `domain`).
    #[arg(long)]
    domain: Option<String>,

    /// Maximum sockets each tunnel client may lend at once (overrides `max_sockets`).
    #[arg(long)]
    max_sockets: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    ferry::run(
        cli.config,
        ferry::config::Overrides {
            api_addr: cli.api_addr,
            tunnel_addr: cli.tunnel_addr,
            domain: cli.domain,
            max_sockets: cli.max_sockets,
        },
    )
    .await
}

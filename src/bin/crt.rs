use charm_refresh::{term, ClusterProbe};

#[derive(clap::Parser, Debug)]
#[clap(arg_required_else_help = true)]
struct Crt {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
/// Commands for terminal charm-refresh
pub enum Command {
    /// Print the refresh state of an app
    Status(AppArgs),
    /// Track a refresh until it completes
    Track(AppArgs),
}

#[derive(clap::Parser, Debug)]
pub struct AppArgs {
    /// The Juju application name (also the statefulset name)
    app: String,

    /// The namespace (Juju model) if different from context
    #[clap(short = 'n', long)]
    namespace: Option<String>,

    /// Workload container to read image digests from
    ///
    /// Defaults to the first container reporting a status.
    #[clap(short = 'c', long)]
    container: Option<String>,
}

impl AppArgs {
    fn probe(&self, client: kube::Client) -> ClusterProbe {
        ClusterProbe {
            client,
            app: self.app.clone(),
            namespace: self.namespace.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = <Crt as clap::Parser>::parse();
    let client = kube::Client::try_default().await?;
    match cli.command {
        Command::Status(args) => {
            let (view, pods) = term::cluster_view(&args.probe(client), args.container.as_deref()).await?;
            term::print_view(&view, &pods);
        }
        Command::Track(args) => {
            let done = term::track_refresh(&args.probe(client), args.container.as_deref()).await?;
            println!("outcome: {done:?}");
        }
    }
    Ok(())
}

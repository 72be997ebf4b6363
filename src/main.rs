//! songvault — resolve, fetch and publish tracks from the command line.
//!
//! Usage:
//!   songvault resolve <identity> <user_id> [--no-attribution]
//!   songvault link <url>
//!   songvault purge-attribution <user_id>

use anyhow::{bail, Context, Result};
use tracing_subscriber::EnvFilter;

use songvault::app::App;
use songvault::config::Config;
use songvault::identity::TrackIdentity;
use songvault::publish::UserContext;

const USAGE: &str = "Usage:
  songvault resolve <identity> <user_id> [--no-attribution]
  songvault link <url>
  songvault purge-attribution <user_id>";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{}", USAGE);
        std::process::exit(1);
    };

    let config = Config::load().context("Failed to load configuration")?;
    let app = App::from_config(config)?;

    match (command.as_str(), &args[1..]) {
        ("resolve", [identity, user_id, rest @ ..]) => {
            let identity: TrackIdentity = identity.parse()?;
            let mut user = UserContext::new(parse_user_id(user_id)?, "cli");
            user.attribution_opt_out = rest.iter().any(|a| a == "--no-attribution");

            let artifact = app.publisher.resolve_and_cache(&identity, &user).await?;
            println!("{}", serde_json::to_string_pretty(&artifact)?);
        }
        ("link", [url]) => match app.publisher.resolver().resolve(url).await {
            Some(link) => println!("{}", link),
            None => bail!("no song link found for {}", url),
        },
        ("purge-attribution", [user_id]) => {
            let user_id = parse_user_id(user_id)?;
            let purged = app.storage.purge_attribution(user_id).await?;
            println!("Removed attribution from {} artifacts", purged);
        }
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn parse_user_id(raw: &str) -> Result<i64> {
    raw.parse()
        .with_context(|| format!("invalid user id {:?}", raw))
}

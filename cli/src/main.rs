use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use kguard_portal::api::FetchError;
use kguard_portal::notices::{self, NoticeError};
use kguard_portal::{ConfigError, Fetched, Portal, PortalConfig};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Notice(#[from] NoticeError),
    #[error("login failed for {0}")]
    LoginFailed(String),
    #[error("not logged in")]
    NotLoggedIn,
    #[error("request failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("notice {0} not found")]
    NoticeNotFound(u64),
    #[error("invalid JSON output: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "portal-cli", about = "K-Guard portal client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Notice listing, detail and authoring.
    Notice(NoticeCommand),
    /// Global leaderboard.
    Ranking,
    /// Exchange credentials for a stored session.
    Login {
        #[arg(long, env = "PORTAL_USERNAME")]
        username: String,
        #[arg(long, env = "PORTAL_PASSWORD", hide_env_values = true)]
        password: String,
    },
    Logout,
    /// Print the current session identity.
    Whoami,
    /// Signed-in user's statistics.
    Stats,
    /// Character roster.
    Characters,
}

#[derive(Args, Debug)]
struct NoticeCommand {
    #[command(subcommand)]
    command: NoticeSubcommand,
}

#[derive(Subcommand, Debug)]
enum NoticeSubcommand {
    List {
        #[arg(long, default_value_t = 1)]
        page: u32,
    },
    Show {
        id: u64,
    },
    /// Write a new notice into the static tree.
    Create {
        title: String,
        content: String,
        #[arg(long, default_value = "public")]
        root: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command) -> Result<(), CliError> {
    // Authoring only touches the local tree.
    let command = match command {
        Command::Notice(NoticeCommand { command: NoticeSubcommand::Create { title, content, root } }) => {
            return run_notice_create(&root, &title, &content);
        }
        other => other,
    };

    let config = PortalConfig::from_env()?;
    let portal = Portal::from_config(&config)?;
    portal.session.initialize().await;

    let result = run_with_portal(&portal, command).await;
    portal.shutdown().await;
    result
}

async fn run_with_portal(portal: &Portal, command: Command) -> Result<(), CliError> {
    match command {
        Command::Notice(notice) => match notice.command {
            NoticeSubcommand::List { page } => print_fetched(portal.api.list_notices(page).await),
            NoticeSubcommand::Show { id } => {
                let fetched = portal.api.notice_detail(id).await;
                warn_fallback(&fetched);
                let detail = fetched.into_value().ok_or(CliError::NoticeNotFound(id))?;
                print_json(&detail)
            }
            NoticeSubcommand::Create { title, content, root } => run_notice_create(&root, &title, &content),
        },
        Command::Ranking => print_fetched(portal.api.global_ranking().await),
        Command::Characters => print_fetched(portal.api.user_characters().await),
        Command::Login { username, password } => {
            if !portal.session.login(&username, &password).await {
                return Err(CliError::LoginFailed(username));
            }
            let identity = portal.session.identity().ok_or(CliError::NotLoggedIn)?;
            print_json(&identity)
        }
        Command::Logout => {
            portal.session.logout();
            println!("logged out");
            Ok(())
        }
        Command::Whoami => {
            let identity = portal.session.identity().ok_or(CliError::NotLoggedIn)?;
            print_json(&identity)
        }
        Command::Stats => {
            let credential = portal.session.credential().ok_or(CliError::NotLoggedIn)?;
            let stats = portal.api.user_stats(credential.as_str()).await?;
            print_json(&stats)
        }
    }
}

fn run_notice_create(root: &std::path::Path, title: &str, content: &str) -> Result<(), CliError> {
    let detail = notices::publish_notice(root, title, content, &notices::today())?;
    println!("created notice {} ({})", detail.id, detail.date);
    Ok(())
}

fn warn_fallback<T>(fetched: &Fetched<T>) {
    if let Some(error) = fetched.error() {
        tracing::warn!(%error, "showing fallback data");
    }
}

fn print_fetched<T: Serialize>(fetched: Fetched<T>) -> Result<(), CliError> {
    warn_fallback(&fetched);
    print_json(fetched.value())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notice_create_takes_exactly_two_positionals() {
        let cli = Cli::try_parse_from(["portal-cli", "notice", "create", "Title", "Body"]).unwrap();
        match cli.command {
            Command::Notice(NoticeCommand { command: NoticeSubcommand::Create { title, content, root } }) => {
                assert_eq!(title, "Title");
                assert_eq!(content, "Body");
                assert_eq!(root, PathBuf::from("public"));
            }
            other => panic!("unexpected command: {other:?}"),
        }

        assert!(Cli::try_parse_from(["portal-cli", "notice", "create", "Title"]).is_err());
        assert!(Cli::try_parse_from(["portal-cli", "notice", "create", "a", "b", "c"]).is_err());
    }

    #[tokio::test]
    async fn notice_create_writes_into_root() {
        let dir = tempfile::tempdir().unwrap();
        let command = Command::Notice(NoticeCommand {
            command: NoticeSubcommand::Create {
                title: "Maintenance".into(),
                content: "Servers down at 02:00".into(),
                root: dir.path().to_path_buf(),
            },
        });
        run(command).await.unwrap();
        assert!(dir.path().join("notices/detail/1.json").exists());
    }

    #[tokio::test]
    async fn notice_create_replaces_corrupt_list() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("notices/list");
        std::fs::create_dir_all(&list).unwrap();
        std::fs::write(list.join("page_1.json"), "not json").unwrap();

        let command = Command::Notice(NoticeCommand {
            command: NoticeSubcommand::Create { title: "t".into(), content: "c".into(), root: dir.path().to_path_buf() },
        });
        run(command).await.unwrap();
        let rewritten: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(list.join("page_1.json")).unwrap()).unwrap();
        assert_eq!(rewritten[0]["id"], 1);
        assert_eq!(rewritten[0]["isNew"], true);
    }
}

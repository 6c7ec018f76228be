use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use teleassist_agents::SupportAgent;
use teleassist_core::{
    default_catalog, load_catalog_file, read_catalog_file, Channel, Language, MessageInput,
};
use teleassist_observability::{init_tracing, AppMetrics};
use teleassist_storage::{seed_catalog_if_empty, Store};

#[derive(Debug, Parser)]
#[command(name = "teleassist")]
#[command(about = "Teleassist customer-service CLI")]
struct Cli {
    #[arg(long, env = "TELEASSIST_DATABASE_URL")]
    database_url: Option<String>,

    #[arg(long, env = "TELEASSIST_CATALOG_PATH")]
    catalog: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Chat {
        #[arg(long)]
        lang: Option<String>,
    },
    Classify {
        text: String,
        #[arg(long)]
        lang: Option<String>,
    },
    Catalog {
        #[command(subcommand)]
        command: CatalogCommand,
    },
}

#[derive(Debug, Subcommand)]
enum CatalogCommand {
    List,
    Validate { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("teleassist_cli");
    let cli = Cli::parse();

    match cli.command {
        Command::Catalog {
            command: CatalogCommand::Validate { path },
        } => validate_file(&path)?,
        Command::Catalog {
            command: CatalogCommand::List,
        } => {
            let agent = build_agent(cli.database_url.as_deref(), cli.catalog.as_deref()).await?;
            let entries = agent.catalog().await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        Command::Chat { lang } => {
            let language = parse_lang(lang.as_deref())?;
            let agent = build_agent(cli.database_url.as_deref(), cli.catalog.as_deref()).await?;
            run_chat(agent, language).await?;
        }
        Command::Classify { text, lang } => {
            let language = parse_lang(lang.as_deref())?;
            let agent = build_agent(cli.database_url.as_deref(), cli.catalog.as_deref()).await?;
            let preview = agent.classify_text(&text, language).await?;
            println!("{}", serde_json::to_string_pretty(&preview)?);
        }
    }

    Ok(())
}

fn parse_lang(value: Option<&str>) -> Result<Option<Language>> {
    match value {
        None => Ok(None),
        Some(raw) => Language::from_optional_str(Some(raw))
            .map(Some)
            .with_context(|| format!("unsupported language `{raw}`, expected ar or fr")),
    }
}

fn validate_file(path: &Path) -> Result<()> {
    let (_, report) = read_catalog_file(path)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_chat(agent: SupportAgent<Store>, language: Option<Language>) -> Result<()> {
    let mut conversation_id: Option<String> = None;

    println!("Teleassist chat mode. type 'exit' to quit.");

    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if io::stdin().read_line(&mut line)? == 0 {
            break;
        }

        let message = line.trim_end_matches(&['\r', '\n'][..]);
        if message.trim().eq_ignore_ascii_case("exit") || message.trim().eq_ignore_ascii_case("quit")
        {
            break;
        }
        if message.trim().is_empty() {
            continue;
        }

        let reply = agent
            .handle_message(MessageInput {
                conversation_id: conversation_id.clone(),
                channel: Channel::Web,
                external_user_id: None,
                text: message.to_string(),
                language,
            })
            .await?;
        conversation_id = Some(reply.conversation_id.clone());

        match reply.bot_message {
            Some(bot) => println!(
                "\n{}\n[{} {:.3}]\n",
                bot.text, reply.intent.intent, reply.intent.confidence
            ),
            None => println!("\n(no reply configured for `{}`)\n", reply.intent.intent),
        }
    }

    Ok(())
}

async fn build_agent(
    database_url: Option<&str>,
    catalog_path: Option<&Path>,
) -> Result<SupportAgent<Store>> {
    let store = Store::from_optional_url(database_url).await?;
    let catalog = match catalog_path {
        Some(path) => load_catalog_file(path)?,
        None => default_catalog(),
    };
    seed_catalog_if_empty(&store, &catalog).await?;

    Ok(SupportAgent::new(Arc::new(store), AppMetrics::shared()))
}

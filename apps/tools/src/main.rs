use anyhow::{bail, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use shared::{
    domain::{GroupId, Role},
    protocol::MESSAGE_PAGE_LIMIT,
};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/chat.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateGroup {
        name: String,
    },
    AddMember {
        group_id: i64,
        name: String,
        #[arg(long)]
        admin: bool,
    },
    ListMembers {
        group_id: i64,
    },
    ListMessages {
        group_id: i64,
        #[arg(long, default_value_t = MESSAGE_PAGE_LIMIT)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;
    let now = Utc::now();

    match cli.command {
        Command::CreateGroup { name } => {
            let group_id = storage.create_group(name.trim(), now).await?;
            println!("created group_id={group_id}");
        }
        Command::AddMember {
            group_id,
            name,
            admin,
        } => {
            let group_id = existing_group(&storage, group_id).await?;
            let user = storage
                .find_or_create_user(name.trim(), &server_api::avatar_url_for(name.trim()), now)
                .await?;
            let role = if admin { Role::Admin } else { Role::Member };
            storage
                .add_membership(group_id, user.user_id, role, now)
                .await?;
            println!(
                "user_id={} joined group_id={group_id} as {}",
                user.user_id,
                role.as_str()
            );
        }
        Command::ListMembers { group_id } => {
            let group_id = existing_group(&storage, group_id).await?;
            for member in storage.list_members_for_group(group_id).await? {
                let last_seen = member
                    .last_seen
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{}\t{}\t{}\tlast_seen={last_seen}",
                    member.user_id,
                    member.name,
                    member.role.as_str()
                );
            }
        }
        Command::ListMessages { group_id, limit } => {
            let group_id = existing_group(&storage, group_id).await?;
            for message in storage.list_group_messages(group_id, None, limit).await? {
                let author = if message.is_anonymous {
                    "Anonymous"
                } else {
                    message.user_name.as_str()
                };
                println!(
                    "[{}] #{} {author} ({}): {}",
                    message.created_at.to_rfc3339(),
                    message.message_id,
                    message.status.as_str(),
                    message.text
                );
            }
        }
    }

    Ok(())
}

async fn existing_group(storage: &Storage, group_id: i64) -> Result<GroupId> {
    let group_id = GroupId(group_id);
    if !storage.group_exists(group_id).await? {
        bail!("group {group_id} does not exist");
    }
    Ok(group_id)
}

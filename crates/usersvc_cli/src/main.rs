//! Users service command-line entry point.
//!
//! # Responsibility
//! - Load configuration once and initialize logging from it.
//! - Drive the user service operations and print results as JSON.

use clap::{Parser, Subcommand};
use log::{error, info};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use usersvc_core::{
    init_logging, ConnectionManager, CreateUserRequest, ServiceConfig, SessionUserRepository,
    UserService, UserUpdate,
};

#[derive(Parser)]
#[command(name = "usersvc")]
#[command(about = "Users service storage tool", version)]
struct Cli {
    /// Path to the JSON service configuration.
    #[arg(long, env = "USERSVC_CONFIG", default_value = "usersvc.json")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    CreateUser {
        #[arg(long)]
        login: String,
        #[arg(long)]
        password: String,
    },
    FindUser {
        #[arg(long)]
        login: String,
    },
    DeleteUser {
        #[arg(long)]
        id: i64,
    },
    /// Bulk loads a JSON array of `{ "login", "password" }` objects.
    ImportUsers {
        #[arg(long)]
        file: PathBuf,
    },
    /// Applies a JSON array of `{ "id", "login", "password", "is_deleted" }` objects.
    UpdateUsers {
        #[arg(long)]
        file: PathBuf,
    },
    Ping,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("event=cli_exit module=cli status=error error={}", message);
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), String> {
    let config = ServiceConfig::from_file(&cli.config).map_err(|err| err.to_string())?;
    init_logging(&config.log)?;
    info!(
        "event=cli_start module=cli status=ok config={} bind_address={}",
        cli.config.display(),
        config.server.bind_address
    );

    let manager = ConnectionManager::new(config.database.clone());
    let service = UserService::new(SessionUserRepository::new(&manager));

    let output = match cli.command {
        Command::CreateUser { login, password } => {
            let users = service
                .create_user(&CreateUserRequest::new(login, password))
                .map_err(|err| err.to_string())?;
            to_json(&users)?
        }
        Command::FindUser { login } => {
            let user = service.find_user(&login).map_err(|err| err.to_string())?;
            to_json(&user)?
        }
        Command::DeleteUser { id } => {
            service.delete_user(id).map_err(|err| err.to_string())?;
            format!("{{\"deleted\":{id}}}")
        }
        Command::ImportUsers { file } => {
            let users: Vec<CreateUserRequest> = read_json(&file)?;
            let written = service.import_users(&users).map_err(|err| err.to_string())?;
            format!("{{\"imported\":{written}}}")
        }
        Command::UpdateUsers { file } => {
            let updates: Vec<UserUpdate> = read_json(&file)?;
            let affected = service
                .update_users(&updates)
                .map_err(|err| err.to_string())?;
            format!("{{\"updated\":{affected}}}")
        }
        Command::Ping => {
            service.ping().map_err(|err| err.to_string())?;
            "{\"status\":\"ok\"}".to_string()
        }
    };

    println!("{output}");
    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|err| format!("cannot encode output: {err}"))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| format!("cannot read `{}`: {err}", path.display()))?;
    serde_json::from_str(&raw).map_err(|err| format!("malformed `{}`: {err}", path.display()))
}

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ognite_client::client::{ClientConfig, Role, SessionManager};
use ognite_client::gateway::notice::user_message;
use ognite_client::gateway::{
    ApiRequest, AuthFailure, AuthFailureHandler, FormField, Gateway, Payload,
};
use ognite_client::security::credential_store::FileStore;
use ognite_client::utils;
use reqwest::Method;
use tracing::debug;

#[derive(Parser)]
#[command(name = "ognite", version, about = "Ognite marketplace API client")]
struct AppCli {
    /// Config file path
    #[arg(short, long, default_value = "ognite.json", global = true)]
    config: PathBuf,

    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in and store the session tokens
    Login {
        #[arg(short, long)]
        username: String,
        /// Falls back to OGNITE_PASSWORD
        #[arg(short, long, env = "OGNITE_PASSWORD", hide_env_values = true)]
        password: String,
        /// candidate, recruiter or university
        #[arg(short, long)]
        role: Role,
    },
    /// Clear the stored session and notify the backend
    Logout,
    /// Create an account; fields go as JSON or as a multipart form
    Register {
        /// candidate, recruiter or university
        #[arg(short, long)]
        role: Role,
        /// JSON body
        #[arg(long, conflicts_with_all = ["file", "field"])]
        json: Option<String>,
        /// Multipart file part as name=path (repeatable)
        #[arg(long, value_parser = parse_pair)]
        file: Vec<(String, String)>,
        /// Multipart text part as name=value (repeatable)
        #[arg(long, value_parser = parse_pair)]
        field: Vec<(String, String)>,
    },
    /// Request a password reset email
    ForgotPassword {
        #[arg(short, long)]
        email: String,
    },
    /// Set a new password from the uid and token in a reset link
    ResetPassword {
        uidb64: String,
        token: String,
        /// Falls back to OGNITE_NEW_PASSWORD
        #[arg(long, env = "OGNITE_NEW_PASSWORD", hide_env_values = true)]
        new_password: String,
    },
    /// Change the signed-in user's password
    ChangePassword {
        /// Falls back to OGNITE_PASSWORD
        #[arg(long, env = "OGNITE_PASSWORD", hide_env_values = true)]
        old_password: String,
        /// Falls back to OGNITE_NEW_PASSWORD
        #[arg(long, env = "OGNITE_NEW_PASSWORD", hide_env_values = true)]
        new_password: String,
    },
    /// Show the stored session
    Session,
    /// Send an authenticated request, refreshing the token if needed
    Request {
        /// HTTP method (GET, POST, PUT, PATCH, DELETE)
        method: String,
        /// Endpoint path such as /api/candidates/profile/, or an absolute URL
        path: String,
        /// JSON body
        #[arg(long, conflicts_with_all = ["file", "field"])]
        json: Option<String>,
        /// Multipart file part as name=path (repeatable)
        #[arg(long, value_parser = parse_pair)]
        file: Vec<(String, String)>,
        /// Multipart text part as name=value (repeatable)
        #[arg(long, value_parser = parse_pair)]
        field: Vec<(String, String)>,
        /// Extra header as name=value (repeatable)
        #[arg(short = 'H', long, value_parser = parse_pair)]
        header: Vec<(String, String)>,
    },
}

fn parse_pair(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected name=value, got {raw:?}"))
}

/// Prints the notice and points the user at `ognite login`.
#[derive(Debug)]
struct CliHandler;

impl AuthFailureHandler for CliHandler {
    fn on_auth_failure(&self, failure: &AuthFailure, login_path: &str) {
        eprintln!("{}: {}", failure.context(), failure.message());
        eprintln!("Redirecting to {login_path}: run `ognite login` to sign in again.");
    }
}

async fn build_payload(
    json: Option<String>,
    files: Vec<(String, String)>,
    fields: Vec<(String, String)>,
) -> Result<Payload> {
    if let Some(raw) = json {
        let body = serde_json::from_str(&raw).context("parsing --json body")?;
        return Ok(Payload::Json(body));
    }
    if files.is_empty() && fields.is_empty() {
        return Ok(Payload::Empty);
    }
    let mut parts: Vec<FormField> = fields
        .into_iter()
        .map(|(name, value)| FormField::text(name, value))
        .collect();
    for (name, file) in files {
        parts.push(FormField::file_from_path(name, Path::new(&file)).await?);
    }
    Ok(Payload::Multipart(parts))
}

async fn build_request(
    method: &str,
    path: String,
    json: Option<String>,
    files: Vec<(String, String)>,
    fields: Vec<(String, String)>,
    headers: Vec<(String, String)>,
) -> Result<ApiRequest> {
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("invalid HTTP method: {method}"))?;
    let mut req = ApiRequest {
        payload: build_payload(json, files, fields).await?,
        ..ApiRequest::new(method, path)
    };

    for (name, value) in headers {
        req = req.header(name, value);
    }
    Ok(req)
}

async fn print_response(resp: reqwest::Response) -> Result<ExitCode> {
    let status = resp.status();
    let body = resp.text().await.context("reading response body")?;
    println!("{status}");
    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(_) if body.is_empty() => {}
        Err(_) => println!("{body}"),
    }
    if status.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        debug!(status_code = status.as_u16(), "request returned an error status");
        eprintln!("{}", user_message(status.as_u16()));
        Ok(ExitCode::FAILURE)
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = AppCli::parse();
    utils::logging::init(&args.log_level);

    let config = ClientConfig::load(&args.config)?;
    let store = Arc::new(FileStore::open(&config.session_file)?);
    let gateway = Gateway::new(config, store)?.with_handler(Arc::new(CliHandler));
    let sessions = SessionManager::new(gateway.clone());

    match args.command {
        Commands::Login {
            username,
            password,
            role,
        } => {
            sessions.login(&username, &password, role).await?;
            println!("Welcome back, {username}! Dashboard: {}", role.dashboard_path());
        }
        Commands::Logout => {
            if let Some(notice) = sessions.logout()? {
                // Let the background notice finish before the runtime shuts down.
                let _ = notice.await;
            }
            println!("Logged out. Login page: {}", gateway.config().login_path);
        }
        Commands::Register {
            role,
            json,
            file,
            field,
        } => {
            let payload = build_payload(json, file, field).await?;
            sessions.register(role, payload).await?;
            println!("Registration successful. You can now log in as a {role}.");
        }
        Commands::ForgotPassword { email } => {
            println!("{}", sessions.forgot_password(&email).await?);
        }
        Commands::ResetPassword {
            uidb64,
            token,
            new_password,
        } => {
            println!("{}", sessions.reset_password(&uidb64, &token, &new_password).await?);
        }
        Commands::ChangePassword {
            old_password,
            new_password,
        } => {
            println!("{}", sessions.change_password(&old_password, &new_password).await?);
        }
        Commands::Session => {
            let info = sessions.current();
            println!("backend: {}", gateway.config().backend_url);
            println!("user: {}", info.username.as_deref().unwrap_or("-"));
            match info.role {
                Some(role) => println!("role: {role} ({})", role.dashboard_path()),
                None => println!("role: -"),
            }
            println!("access token: {}", if info.has_access_token { "present" } else { "missing" });
            println!("refresh token: {}", if info.has_refresh_token { "present" } else { "missing" });
        }
        Commands::Request {
            method,
            path,
            json,
            file,
            field,
            header,
        } => {
            let req = build_request(&method, path, json, file, field, header).await?;
            match gateway.request(&req).await {
                Ok(Some(resp)) => return print_response(resp).await,
                // CliHandler already told the user where to go.
                Ok(None) => return Ok(ExitCode::from(2)),
                Err(err) => {
                    eprintln!("{}", err.user_message());
                    return Err(err.into());
                }
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

use crate::error::{AuthFailure, ConfigError, HttpError, TransportError};
use crate::http::{chat_channel, UploadFile, DEFAULT_UPLOAD_FIELD};
use crate::state::SessionController;
use crate::types::{PasswordChange, ProfileUpdate, RegistrationRequest, UploadProgress};
use clap::Subcommand;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Auth(#[from] AuthFailure),
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Usage(String),
}

impl From<TransportError> for CommandError {
    fn from(value: TransportError) -> Self {
        Self::Http(value.into())
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Sign in and keep the session
    Login {
        email: String,
        #[arg(long, env = "KYS_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Create an account and sign in
    Register {
        email: String,
        #[arg(long, env = "KYS_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long)]
        full_name: Option<String>,
        #[arg(long)]
        company_name: Option<String>,
        #[arg(long)]
        phone_number: Option<String>,
    },
    /// End the session locally and on the server
    Logout,
    /// Show the stored session without contacting the server
    Whoami,
    /// Fetch the current profile from the server
    Profile,
    UpdateProfile {
        #[arg(long)]
        full_name: Option<String>,
        #[arg(long)]
        company_name: Option<String>,
        #[arg(long)]
        phone_number: Option<String>,
    },
    ChangePassword {
        #[arg(long)]
        old_password: String,
        #[arg(long)]
        new_password: String,
        /// Defaults to the new password
        #[arg(long)]
        confirm: Option<String>,
    },
    /// Authenticated GET against any API path
    Get { path: String },
    /// Multipart upload of a file, with progress on stderr
    Upload {
        path: String,
        file: PathBuf,
        #[arg(long, default_value = DEFAULT_UPLOAD_FIELD)]
        field: String,
        #[arg(long)]
        mime: Option<String>,
        /// Extra form field, as key=value
        #[arg(short = 'F', long = "form", value_parser = parse_form_field)]
        form: Vec<(String, String)>,
    },
    /// Print the streaming URL for a channel or a conversation
    StreamUrl {
        #[arg(required_unless_present = "conversation")]
        channel: Option<String>,
        #[arg(long, conflicts_with = "channel")]
        conversation: Option<String>,
    },
}

fn parse_form_field(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got `{raw}`")),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

async fn require_session(controller: &SessionController) -> Result<(), CommandError> {
    if controller.is_authenticated().await {
        Ok(())
    } else {
        Err(CommandError::Usage("not signed in, run `kys login` first".to_string()))
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, CommandError> {
    serde_json::to_value(value).map_err(|e| CommandError::Usage(format!("unprintable output: {e}")))
}

pub async fn execute(controller: &SessionController, command: Command) -> Result<Value, CommandError> {
    match command {
        Command::Login { email, password } => {
            let user = controller.login(&email, &password).await?;
            to_value(&user)
        }
        Command::Register {
            email,
            password,
            full_name,
            company_name,
            phone_number,
        } => {
            let request = RegistrationRequest {
                email: email.trim().to_string(),
                password_confirm: password.clone(),
                password,
                full_name: non_empty(full_name),
                company_name: non_empty(company_name),
                phone_number: non_empty(phone_number),
                ..Default::default()
            };
            let user = controller.register(&request).await?;
            to_value(&user)
        }
        Command::Logout => {
            controller.logout().await;
            Ok(Value::Null)
        }
        Command::Whoami => to_value(&controller.view().await),
        Command::Profile => {
            require_session(controller).await?;
            let user = controller.fetch_profile().await?;
            to_value(&user)
        }
        Command::UpdateProfile {
            full_name,
            company_name,
            phone_number,
        } => {
            require_session(controller).await?;
            let update = ProfileUpdate {
                full_name: non_empty(full_name),
                company_name: non_empty(company_name),
                phone_number: non_empty(phone_number),
            };
            if update.full_name.is_none() && update.company_name.is_none() && update.phone_number.is_none() {
                return Err(CommandError::Usage("nothing to update".to_string()));
            }
            let user = controller.update_profile(&update).await?;
            to_value(&user)
        }
        Command::ChangePassword {
            old_password,
            new_password,
            confirm,
        } => {
            require_session(controller).await?;
            let change = PasswordChange {
                old_password,
                new_password_confirm: confirm.unwrap_or_else(|| new_password.clone()),
                new_password,
            };
            let message = controller.change_password(&change).await?;
            Ok(json!({ "message": message }))
        }
        Command::Get { path } => Ok(controller.api().get::<Value>(&path).await?),
        Command::Upload {
            path,
            file,
            field,
            mime,
            form,
        } => {
            let mut upload = UploadFile::from_path(&file).await?.with_field(field);
            if let Some(mime) = non_empty(mime) {
                upload = upload.with_mime(mime);
            }

            let (tx, mut rx) = mpsc::unbounded_channel::<UploadProgress>();
            let printer = tokio::spawn(async move {
                let mut last = None;
                while let Some(progress) = rx.recv().await {
                    let percent = progress.percent();
                    if last != Some(percent) {
                        eprint!("\ruploading... {percent:>3}%");
                        last = Some(percent);
                    }
                }
                if last.is_some() {
                    eprintln!();
                }
            });

            let result = controller.api().upload::<Value>(&path, upload, form, Some(tx)).await;
            if tokio::time::timeout(Duration::from_secs(1), printer).await.is_err() {
                tracing::debug!("progress printer did not finish");
            }
            Ok(result?)
        }
        Command::StreamUrl {
            channel,
            conversation,
        } => {
            let channel = match (non_empty(conversation), non_empty(channel)) {
                (Some(conversation), _) => {
                    controller.select_conversation(Some(conversation.clone())).await;
                    chat_channel(&conversation)
                }
                (None, Some(channel)) => channel,
                (None, None) => {
                    return Err(CommandError::Usage(
                        "a channel or --conversation is required".to_string(),
                    ))
                }
            };
            Ok(Value::String(controller.api().stream_url(&channel).await))
        }
    }
}

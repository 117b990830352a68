//! Command-line front end.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bulkmail_smtp::{
    count_recipients_in_file, export_logs_csv, inline_image_tag, load_recipients,
    BulkMailService, BulkSendEvent, BulkSendRequest, LogEntry, MailTransport, SendSummary,
    SmtpTransport, Template, TemplateStore,
};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};

#[derive(Debug, Parser)]
#[command(name = "bulkmail")]
#[command(version)]
#[command(about = "Send bulk HTML email through an SMTP account", long_about = None)]
pub struct Cli {
    /// Config file (defaults to the per-user config directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    pub json: bool,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Send a message to every address in a recipient file
    Send(SendArgs),
    /// Check that the configured SMTP account works
    Validate,
    /// Inspect recipient files
    Recipients {
        #[command(subcommand)]
        command: RecipientsCommand,
    },
    /// Manage saved templates
    Templates {
        #[command(subcommand)]
        command: TemplatesCommand,
    },
    /// Manage the config file
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Print an <img> snippet for a local image
    ImageTag {
        path: PathBuf,
        #[arg(long, default_value_t = 300)]
        width: u32,
    },
}

#[derive(Debug, Args)]
pub struct SendArgs {
    /// Recipient file (.csv or one address per line)
    #[arg(long)]
    pub recipients: PathBuf,

    /// Use a saved template for subject, body and attachments
    #[arg(long, conflicts_with_all = ["subject", "body_file"])]
    pub template: Option<String>,

    #[arg(long, requires = "body_file")]
    pub subject: Option<String>,

    /// File containing the HTML body
    #[arg(long, requires = "subject")]
    pub body_file: Option<PathBuf>,

    /// Extra attachment (repeatable)
    #[arg(long = "attach")]
    pub attachments: Vec<PathBuf>,

    /// Write the send log to this CSV file
    #[arg(long)]
    pub export: Option<PathBuf>,

    /// Do not retry failed recipients
    #[arg(long)]
    pub no_retry: bool,

    /// Skip the SMTP check before sending
    #[arg(long)]
    pub no_validate: bool,
}

#[derive(Debug, Subcommand)]
pub enum RecipientsCommand {
    /// Count valid addresses (duplicates included)
    Count { file: PathBuf },
    /// List the addresses a send would use
    Show { file: PathBuf },
}

#[derive(Debug, Subcommand)]
pub enum TemplatesCommand {
    /// List saved templates
    List,
    /// Print one template
    Show { name: String },
    /// Save or replace a template
    Save {
        name: String,
        #[arg(long)]
        subject: String,
        /// File containing the HTML body
        #[arg(long)]
        body_file: PathBuf,
        #[arg(long = "attach")]
        attachments: Vec<PathBuf>,
    },
    /// Delete a template
    Delete { name: String },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration (password hidden)
    Show,
}

// ─── Dispatch ───────────────────────────────────────────────────────

/// Execute a parsed command line.
pub async fn execute(cli: Cli) -> AppResult<()> {
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => AppConfig::default_path()?,
    };

    match cli.command {
        Command::Config { command } => config_command(command, &config_path),
        Command::Recipients { command } => recipients_command(command),
        Command::ImageTag { path, width } => {
            let tag = inline_image_tag(&path, width);
            if tag.is_empty() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{} does not exist", path.display()),
                )
                .into());
            }
            println!("{}", tag);
            Ok(())
        }
        Command::Templates { command } => {
            let config = AppConfig::load(&config_path)?;
            let store = TemplateStore::open(config.templates_dir()?)?;
            templates_command(command, &store)
        }
        Command::Validate => {
            let config = AppConfig::load(&config_path)?;
            config.validate()?;
            let service = BulkMailService::new();
            let outcome = service.validate(config.smtp).await;
            println!("{}", outcome.message);
            match outcome.into_error() {
                Some(err) => Err(err.into()),
                None => Ok(()),
            }
        }
        Command::Send(args) => {
            let config = AppConfig::load(&config_path)?;
            let log = run_send(&config, &args, Arc::new(SmtpTransport)).await?;
            let summary = SendSummary::from_entries(&log);
            println!(
                "{} attempt(s): {} sent, {} failed ({} retries)",
                summary.attempts, summary.sent, summary.failed, summary.retries
            );
            Ok(())
        }
    }
}

// ─── send ───────────────────────────────────────────────────────────

/// Run a bulk send for `args` through `transport` and return its log.
///
/// Ctrl-C stops the send cooperatively; the partial log is still exported.
pub async fn run_send(
    config: &AppConfig,
    args: &SendArgs,
    transport: Arc<dyn MailTransport>,
) -> AppResult<Vec<LogEntry>> {
    config.validate()?;

    let recipients = load_recipients(&args.recipients)?;
    info!("[cli] {} recipient(s) loaded", recipients.len());

    let (subject, body, mut attachments) = match &args.template {
        Some(name) => {
            let store = TemplateStore::open(config.templates_dir()?)?;
            let template = store
                .load_by_name(name)?
                .ok_or_else(|| AppError::TemplateNotFound(name.clone()))?;
            let paths = template.attachment_paths();
            (template.subject, template.body, paths)
        }
        None => {
            let (Some(subject), Some(body_file)) = (&args.subject, &args.body_file) else {
                return Err(AppError::InvalidConfig(
                    "either --template or both --subject and --body-file are required".into(),
                ));
            };
            (subject.clone(), read_body(body_file)?, Vec::new())
        }
    };
    attachments.extend(args.attachments.iter().cloned());

    let mut options = config.send_options();
    if args.no_retry {
        options.retry_failed = false;
    }

    let request = BulkSendRequest {
        config: config.smtp.clone(),
        recipients,
        subject,
        body,
        attachments,
        options,
        validate_first: config.validate_before_send && !args.no_validate,
    };

    let service = BulkMailService::with_transport(transport);
    let mut job = service.start_bulk_send(request).await?;

    let cancel = job.cancel.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("[cli] interrupt received, stopping after the current recipient");
            cancel.cancel();
        }
    });

    while let Some(event) = job.events.recv().await {
        match event {
            BulkSendEvent::Progress {
                completed,
                total,
                percent,
            } => info!("[cli] progress {}/{} ({}%)", completed, total, percent),
            BulkSendEvent::Log(entry) => println!("{}", entry),
        }
    }
    let result = job.wait().await;
    ctrl_c.abort();
    let log = result?;

    if let Some(path) = &args.export {
        export_logs_csv(&log, path)?;
        println!("Log exported to {}", path.display());
    }
    Ok(log)
}

fn read_body(path: &Path) -> AppResult<String> {
    std::fs::read_to_string(path).map_err(|e| {
        AppError::Io(std::io::Error::new(
            e.kind(),
            format!("cannot read body file {}: {}", path.display(), e),
        ))
    })
}

// ─── recipients ─────────────────────────────────────────────────────

fn recipients_command(command: RecipientsCommand) -> AppResult<()> {
    match command {
        RecipientsCommand::Count { file } => {
            println!("{}", count_recipients_in_file(&file));
        }
        RecipientsCommand::Show { file } => {
            for addr in load_recipients(&file)? {
                println!("{}", addr);
            }
        }
    }
    Ok(())
}

// ─── templates ──────────────────────────────────────────────────────

fn templates_command(command: TemplatesCommand, store: &TemplateStore) -> AppResult<()> {
    match command {
        TemplatesCommand::List => {
            for t in store.list()? {
                println!("{}\t{}", t.name, t.subject);
            }
        }
        TemplatesCommand::Show { name } => {
            let template = store
                .load_by_name(&name)?
                .ok_or(AppError::TemplateNotFound(name))?;
            println!("{}", serde_json::to_string_pretty(&template)?);
        }
        TemplatesCommand::Save {
            name,
            subject,
            body_file,
            attachments,
        } => {
            let body = read_body(&body_file)?;
            let attachments = attachments
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect();
            let path = store.save(&Template::new(name, subject, body, attachments))?;
            println!("Saved {}", path.display());
        }
        TemplatesCommand::Delete { name } => {
            if !store.delete(&name)? {
                return Err(AppError::TemplateNotFound(name));
            }
            println!("Deleted {}", name);
        }
    }
    Ok(())
}

// ─── config ─────────────────────────────────────────────────────────

fn config_command(command: ConfigCommand, path: &Path) -> AppResult<()> {
    match command {
        ConfigCommand::Init { force } => {
            if path.exists() && !force {
                return Err(AppError::InvalidConfig(format!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                )));
            }
            AppConfig::default().save(path)?;
            println!("Wrote {}", path.display());
        }
        ConfigCommand::Show => {
            let mut config = AppConfig::load(path)?;
            if !config.smtp.password.is_empty() {
                config.smtp.password = "***".into();
            }
            println!("# {}", path.display());
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }
    Ok(())
}

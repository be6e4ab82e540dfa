//! si - command line for the si vault
//!
//! Commands (all under `si vault`):
//! - init / status / keygen [--rotate]
//! - set / get [--reveal] / unset / dump [--reveal]
//! - encrypt [--reencrypt] / decrypt [--stdout | --yes] / fmt [--all] [--check]
//! - trust status|accept|forget
//! - recipients list|add|remove
//! - sync status|push|pull
//! - run -- CMD [ARGS...] / check / hydrate

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use si_vault::commands::{
    self, CheckArgs, DecryptMode, FmtArgs, RunArgs, SetArgs, TargetInfo, ValueSource,
};
use si_vault::error::{self, VaultError};
use si_vault::{manage, Context, Done, Report, Selector};
use std::os::unix::process::CommandExt;
use std::process::{Command, ExitCode};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "si")]
#[command(about = "si - workstation tooling; `si vault` keeps dotenv secrets age-encrypted at rest")]
#[command(version)]
struct Cli {
    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encrypted dotenv vault
    Vault {
        #[command(subcommand)]
        command: VaultCommand,
    },
}

/// `--scope` / `--file` shared by every file-targeting verb
#[derive(Args, Debug, Clone, Default)]
struct TargetArgs {
    /// Named scope from vault settings (default: vault.default_scope)
    #[arg(long)]
    scope: Option<String>,

    /// Explicit dotenv file path
    #[arg(long, short = 'f', conflicts_with = "scope")]
    file: Option<String>,
}

impl From<&TargetArgs> for Selector {
    fn from(args: &TargetArgs) -> Self {
        Selector {
            scope: args.scope.clone(),
            file: args.file.clone(),
        }
    }
}

#[derive(Subcommand)]
enum VaultCommand {
    /// Create the vault file and identity, stamp the header, record trust
    Init {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Show path, backend, identity, trust and value counts (never decrypts)
    Status {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Create the vault identity, or replace it with --rotate
    Keygen {
        /// Replace the current identity (old keys stay available for decryption)
        #[arg(long)]
        rotate: bool,
    },

    /// Encrypt and store a value (prompts securely if VALUE is omitted)
    Set {
        /// Variable name ([A-Za-z_][A-Za-z0-9_]*)
        key: String,
        /// Plaintext value
        value: Option<String>,
        /// Read the value from stdin
        #[arg(long, conflicts_with = "value")]
        stdin: bool,
        /// Insert into a `# [name]` section
        #[arg(long)]
        section: Option<String>,
        /// Normalize the file after writing
        #[arg(long)]
        format: bool,
        /// Proceed despite a recipient trust mismatch
        #[arg(long)]
        force: bool,
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Show whether a key is encrypted; --reveal prints the plaintext
    Get {
        key: String,
        #[arg(long)]
        reveal: bool,
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Remove a key, keeping the surrounding layout
    Unset {
        key: String,
        #[arg(long)]
        force: bool,
        #[command(flatten)]
        target: TargetArgs,
    },

    /// List keys; --reveal prints KEY=VALUE lines
    Dump {
        #[arg(long)]
        reveal: bool,
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Encrypt every plaintext value in place
    Encrypt {
        /// Also re-wrap encrypted values for the current recipients
        #[arg(long)]
        reencrypt: bool,
        #[arg(long)]
        force: bool,
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Decrypt the file to stdout, or back to disk with --yes
    Decrypt {
        /// Print the decrypted file without touching disk
        #[arg(long, conflicts_with = "yes")]
        stdout: bool,
        /// Write plaintext back to the file
        #[arg(long)]
        yes: bool,
        #[arg(long)]
        force: bool,
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Normalize quoting, spacing and the header
    Fmt {
        /// Format every .env* file next to the target
        #[arg(long)]
        all: bool,
        /// Report files that would change and exit 1
        #[arg(long)]
        check: bool,
        /// Sort assignments within each section
        #[arg(long)]
        sort: bool,
        #[arg(long)]
        force: bool,
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Inspect and manage recipient trust records
    Trust {
        #[command(subcommand)]
        command: TrustCommand,
    },

    /// Manage the recipients in the file header
    Recipients {
        #[command(subcommand)]
        command: RecipientsCommand,
    },

    /// Back up to and restore from the sync backend
    Sync {
        #[command(subcommand)]
        command: SyncCommand,
    },

    /// Run a command with decrypted values in its environment
    Run {
        /// Allow plaintext values in the file
        #[arg(long)]
        allow_plaintext: bool,
        /// Run through $SHELL -lc (pipes, redirection)
        #[arg(long)]
        shell: bool,
        /// With --shell, use -ic instead of -lc
        #[arg(long, requires = "shell")]
        shell_interactive: bool,
        /// With --shell, the shell binary (default: $SHELL, then /bin/bash)
        #[arg(long, requires = "shell")]
        shell_path: Option<String>,
        #[command(flatten)]
        target: TargetArgs,
        /// Command to exec
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// Exit 2 when dotenv files contain plaintext values (pre-commit hook)
    Check {
        /// File to scan (repeatable)
        #[arg(long = "file", short = 'f')]
        files: Vec<String>,
        /// Scan every .env* file under the working directory
        #[arg(long)]
        all: bool,
        /// Include .env.example / sample / template files
        #[arg(long)]
        include_examples: bool,
        #[arg(long)]
        scope: Option<String>,
    },

    /// Load the sun identity into this process
    Hydrate,
}

#[derive(Subcommand)]
enum TrustCommand {
    /// Show the trust record and diff against the file's recipients
    Status {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Trust the file's current recipients
    Accept {
        #[arg(long, short = 'y')]
        yes: bool,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Drop the trust record for the file
    Forget {
        #[command(flatten)]
        target: TargetArgs,
    },
}

#[derive(Subcommand)]
enum RecipientsCommand {
    /// List header recipients
    List {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Add an age recipient (age1...)
    Add {
        recipient: String,
        #[arg(long)]
        force: bool,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Remove an age recipient
    Remove {
        recipient: String,
        #[arg(long)]
        force: bool,
        #[command(flatten)]
        target: TargetArgs,
    },
}

#[derive(Subcommand)]
enum SyncCommand {
    /// Show mode, strictness and remote backup presence
    Status {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Upload the local vault as a backup
    Push {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Replace the local vault with the backup
    Pull {
        #[arg(long)]
        force: bool,
        #[command(flatten)]
        target: TargetArgs,
    },
}

impl VaultCommand {
    /// Command name used in JSON output
    fn name(&self) -> &'static str {
        match self {
            VaultCommand::Init { .. } => "init",
            VaultCommand::Status { .. } => "status",
            VaultCommand::Keygen { .. } => "keygen",
            VaultCommand::Set { .. } => "set",
            VaultCommand::Get { .. } => "get",
            VaultCommand::Unset { .. } => "unset",
            VaultCommand::Dump { .. } => "dump",
            VaultCommand::Encrypt { .. } => "encrypt",
            VaultCommand::Decrypt { .. } => "decrypt",
            VaultCommand::Fmt { .. } => "fmt",
            VaultCommand::Trust { command } => match command {
                TrustCommand::Status { .. } => "trust status",
                TrustCommand::Accept { .. } => "trust accept",
                TrustCommand::Forget { .. } => "trust forget",
            },
            VaultCommand::Recipients { command } => match command {
                RecipientsCommand::List { .. } => "recipients list",
                RecipientsCommand::Add { .. } => "recipients add",
                RecipientsCommand::Remove { .. } => "recipients remove",
            },
            VaultCommand::Sync { command } => match command {
                SyncCommand::Status { .. } => "sync status",
                SyncCommand::Push { .. } => "sync push",
                SyncCommand::Pull { .. } => "sync pull",
            },
            VaultCommand::Run { .. } => "run",
            VaultCommand::Check { .. } => "check",
            VaultCommand::Hydrate => "hydrate",
        }
    }
}

#[derive(Serialize)]
struct Envelope<'a, R: Serialize> {
    ok: bool,
    command: &'a str,
    context: Option<&'a TargetInfo>,
    mode: Option<&'a str>,
    #[serde(flatten)]
    report: &'a R,
}

#[derive(Serialize)]
struct Failure {
    error: String,
    category: &'static str,
    hint: Option<&'static str>,
}

/// How results are printed
struct Output {
    json: bool,
    command: &'static str,
    mode: Option<&'static str>,
}

impl Output {
    fn emit<R: Report>(&self, done: Done<R>) -> Result<ExitCode> {
        if self.json {
            let envelope = Envelope {
                ok: done.exit_code == 0,
                command: self.command,
                context: done.target.as_ref(),
                mode: self.mode,
                report: &done.report,
            };
            println!("{}", serde_json::to_string_pretty(&envelope)?);
        } else {
            print!("{}", done.report.render());
        }
        Ok(ExitCode::from(done.exit_code))
    }

    fn fail(&self, err: &anyhow::Error) -> ExitCode {
        let hint = error::classify(err).and_then(VaultError::hint);
        if self.json {
            let envelope = Envelope {
                ok: false,
                command: self.command,
                context: None,
                mode: self.mode,
                report: &Failure {
                    error: format!("{:#}", err),
                    category: error::category_of(err),
                    hint,
                },
            };
            match serde_json::to_string_pretty(&envelope) {
                Ok(text) => println!("{}", text),
                Err(e) => eprintln!("error: {}", e),
            }
        } else {
            eprintln!("error: {:#}", err);
            if let Some(hint) = hint {
                eprintln!("hint: {}", hint);
            }
        }
        ExitCode::from(error::exit_code_of(err))
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let Commands::Vault { command } = cli.command;

    let mut out = Output {
        json: cli.json,
        command: command.name(),
        mode: None,
    };

    let ctx = match Context::load() {
        Ok(ctx) => ctx,
        Err(e) => return out.fail(&e),
    };
    out.mode = Some(ctx.mode());

    match dispatch(&ctx, command, &out) {
        Ok(code) => code,
        Err(e) => out.fail(&e),
    }
}

fn dispatch(ctx: &Context, command: VaultCommand, out: &Output) -> Result<ExitCode> {
    match command {
        VaultCommand::Init { target } => out.emit(commands::init(ctx, &(&target).into())?),
        VaultCommand::Status { target } => out.emit(commands::status(ctx, &(&target).into())?),
        VaultCommand::Keygen { rotate } => out.emit(manage::keygen(ctx, rotate)?),
        VaultCommand::Set {
            key,
            value,
            stdin,
            section,
            format,
            force,
            target,
        } => {
            let value = match (value, stdin) {
                (_, true) => ValueSource::Stdin,
                (Some(v), false) => ValueSource::Literal(v),
                (None, false) => ValueSource::Prompt,
            };
            let args = SetArgs {
                key,
                value,
                section,
                format,
                force,
            };
            out.emit(commands::set(ctx, &(&target).into(), &args)?)
        }
        VaultCommand::Get {
            key,
            reveal,
            target,
        } => out.emit(commands::get(ctx, &(&target).into(), &key, reveal)?),
        VaultCommand::Unset { key, force, target } => {
            out.emit(commands::unset(ctx, &(&target).into(), &key, force)?)
        }
        VaultCommand::Dump { reveal, target } => {
            out.emit(commands::dump(ctx, &(&target).into(), reveal)?)
        }
        VaultCommand::Encrypt {
            reencrypt,
            force,
            target,
        } => out.emit(commands::encrypt(ctx, &(&target).into(), reencrypt, force)?),
        VaultCommand::Decrypt {
            stdout,
            yes,
            force,
            target,
        } => {
            let mode = if stdout {
                Some(DecryptMode::Stdout)
            } else if yes {
                Some(DecryptMode::InPlace)
            } else {
                None
            };
            out.emit(commands::decrypt(ctx, &(&target).into(), mode, force)?)
        }
        VaultCommand::Fmt {
            all,
            check,
            sort,
            force,
            target,
        } => {
            let args = FmtArgs {
                all,
                check,
                sort,
                force,
            };
            out.emit(commands::fmt(ctx, &(&target).into(), args)?)
        }
        VaultCommand::Trust { command } => match command {
            TrustCommand::Status { target } => {
                out.emit(manage::trust_status(ctx, &(&target).into())?)
            }
            TrustCommand::Accept { yes, target } => {
                out.emit(manage::trust_accept(ctx, &(&target).into(), yes)?)
            }
            TrustCommand::Forget { target } => {
                out.emit(manage::trust_forget(ctx, &(&target).into())?)
            }
        },
        VaultCommand::Recipients { command } => match command {
            RecipientsCommand::List { target } => {
                out.emit(manage::recipients_list(ctx, &(&target).into())?)
            }
            RecipientsCommand::Add {
                recipient,
                force,
                target,
            } => out.emit(manage::recipients_add(
                ctx,
                &(&target).into(),
                &recipient,
                force,
            )?),
            RecipientsCommand::Remove {
                recipient,
                force,
                target,
            } => out.emit(manage::recipients_remove(
                ctx,
                &(&target).into(),
                &recipient,
                force,
            )?),
        },
        VaultCommand::Sync { command } => match command {
            SyncCommand::Status { target } => {
                out.emit(manage::sync_status(ctx, &(&target).into())?)
            }
            SyncCommand::Push { target } => out.emit(manage::sync_push(ctx, &(&target).into())?),
            SyncCommand::Pull { force, target } => {
                out.emit(manage::sync_pull(ctx, &(&target).into(), force)?)
            }
        },
        VaultCommand::Run {
            allow_plaintext,
            shell,
            shell_interactive,
            shell_path,
            target,
            command,
        } => {
            let args = RunArgs {
                command,
                allow_plaintext,
                shell,
                shell_interactive,
                shell_path,
            };
            exec_run(ctx, &(&target).into(), &args)
        }
        VaultCommand::Check {
            files,
            all,
            include_examples,
            scope,
        } => {
            let sel = Selector { scope, file: None };
            let args = CheckArgs {
                files,
                all,
                include_examples,
            };
            out.emit(commands::check(ctx, &sel, &args)?)
        }
        VaultCommand::Hydrate => out.emit(manage::hydrate(ctx)?),
    }
}

/// Replace this process with the planned command
fn exec_run(ctx: &Context, sel: &Selector, args: &RunArgs) -> Result<ExitCode> {
    let plan = commands::run(ctx, sel, args)?;

    let mut cmd = Command::new(&plan.program);
    cmd.args(&plan.args);
    for name in &plan.scrub {
        cmd.env_remove(name);
    }
    for (name, value) in &plan.env {
        cmd.env(name, value);
    }

    // exec() only returns on failure
    let err = cmd.exec();
    Err(anyhow::anyhow!("Failed to execute {}: {}", plan.program, err))
}

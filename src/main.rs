// External ACL helper for caching proxies: answers "is this user in that
// group/OU" from a pool of LDAP connections spread over domain controllers.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use ldap_acl_pool::helper::{
    self, DEFAULT_OPERATION_TIMEOUT, HelperContext, HelperSettings, Lookup,
};
use ldap_acl_pool::{ConnectionPool, LdapConnector, PoolConfiguration, ServerPool, Strategy};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Replies buffered between request tasks and the stdout writer
const REPLY_BUFFER: usize = 10 * 1024;

#[derive(Parser)]
#[command(name = "ldap-acl-helper")]
#[command(version, about = "LDAP group/OU external ACL helper", long_about = None)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,

    /// Domain controller address (repeat for several servers)
    #[arg(short = 's', long = "server", required = true)]
    servers: Vec<String>,

    /// Domain controller LDAP port
    #[arg(short = 'p', long, default_value_t = 389)]
    port: u16,

    /// Use LDAP over TLS
    #[arg(long)]
    tls: bool,

    /// Username for the bind operation
    #[arg(short = 'u', long = "binduser")]
    bind_user: String,

    /// Password for the bind operation
    #[arg(short = 'w', long = "bindpassword")]
    bind_password: Option<String>,

    /// File whose first line is the bind password
    #[arg(short = 'f', long = "pwdfile")]
    password_file: Option<PathBuf>,

    /// Base DN for searches (%ou = requested OU in ou mode)
    #[arg(short = 'b', long = "basedn")]
    base_dn: String,

    /// Strip Kerberos realm from usernames
    #[arg(long)]
    strip_realm: bool,

    /// Strip NT domain from usernames
    #[arg(long)]
    strip_domain: bool,

    /// Always prefer the first reachable server instead of rotating
    #[arg(long)]
    fixed_order: bool,

    /// How long a dead server is skipped before being probed again (ms)
    #[arg(long, default_value_t = 10_000)]
    retry_backoff_ms: u64,

    /// Timeout of a single server liveness probe (ms)
    #[arg(long, default_value_t = 200)]
    probe_timeout_ms: u64,

    /// Path to log file
    #[arg(long = "log", default_value = "/var/log/squid-ext-acl-ldap.log")]
    log_file: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Mode {
    /// Membership of the user in a group
    Group {
        /// User search filter pattern, %u = login
        #[arg(long)]
        user_filter: String,

        /// Group search filter pattern, %u = user DN, %g = group name
        #[arg(long)]
        group_filter: String,
    },

    /// Presence of the user under an OU
    Ou {
        /// User search filter pattern, %u = login
        #[arg(long)]
        filter: String,
    },
}

enum Stop {
    Reload,
    Exit,
}

impl Cli {
    fn addresses(&self) -> Vec<String> {
        self.servers
            .iter()
            .map(|server| format!("{server}:{}", self.port))
            .collect()
    }

    fn bind_password(&self) -> Result<String> {
        if let Some(password) = self.bind_password.as_ref().filter(|p| !p.is_empty()) {
            return Ok(password.clone());
        }
        let Some(path) = &self.password_file else {
            bail!("Password for LDAP bind is not set");
        };
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read password file {}", path.display()))?;
        Ok(contents.lines().next().unwrap_or_default().to_string())
    }

    fn settings(&self, bind_password: String) -> HelperSettings {
        let lookup = match &self.mode {
            Mode::Group {
                user_filter,
                group_filter,
            } => Lookup::Group {
                user_filter: user_filter.clone(),
                group_filter: group_filter.clone(),
            },
            Mode::Ou { filter } => Lookup::Ou {
                filter: filter.clone(),
            },
        };

        HelperSettings {
            bind_dn: self.bind_user.clone(),
            bind_password,
            base_dn: self.base_dn.clone(),
            lookup,
            strip_realm: self.strip_realm,
            strip_domain: self.strip_domain,
        }
    }

    /// Idle capacity: generous for the two-query group lookups.
    fn capacity(&self) -> usize {
        match self.mode {
            Mode::Group { .. } => 100 * self.servers.len(),
            Mode::Ou { .. } => self.servers.len(),
        }
    }
}

fn init_logging(cli: &Cli) {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| cli.log_level.clone().into())
    };

    match OpenOptions::new().create(true).append(true).open(&cli.log_file) {
        Ok(file) => tracing_subscriber::registry()
            .with(filter())
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
            .init(),
        Err(err) => {
            tracing_subscriber::registry()
                .with(filter())
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
            warn!(path = %cli.log_file.display(), error = %err, "Cannot open log file, logging to stderr");
        }
    }
}

async fn build_context(cli: &Cli, settings: &HelperSettings) -> Result<HelperContext<LdapConnector>> {
    let servers = ServerPool::new(
        cli.addresses(),
        Duration::from_millis(cli.retry_backoff_ms),
        Duration::from_millis(cli.probe_timeout_ms),
        Strategy::from_round_robin(!cli.fixed_order),
    )
    .context("Cannot create LDAP server pool")?;

    let config = PoolConfiguration::new()
        .with_capacity(cli.capacity())
        .with_secure(cli.tls)
        .with_validation_timeout(DEFAULT_OPERATION_TIMEOUT);
    let connector = LdapConnector::new(config.dial_timeout, DEFAULT_OPERATION_TIMEOUT);

    let pool = ConnectionPool::new(connector, Arc::new(servers), config)
        .await
        .context("Cannot create LDAP connection pool")?;

    Ok(HelperContext::new(pool, settings.clone()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let bind_password = cli
        .bind_password()
        .inspect_err(|err| error!(error = %err, "Startup failed"))?;
    let settings = cli.settings(bind_password);

    let (replies, receiver) = mpsc::channel(REPLY_BUFFER);
    let writer = tokio::spawn(helper::write_replies(receiver, tokio::io::stdout()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;

    loop {
        info!("Start LDAP external ACL helper");
        let context = Arc::new(
            build_context(&cli, &settings)
                .await
                .inspect_err(|err| error!(error = %err, "Startup failed"))?,
        );

        let stop = loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => helper::dispatch(&context, &line, &replies).await,
                    Ok(None) => break Stop::Exit,
                    Err(err) => {
                        warn!(error = %err, "Stdin error");
                        break Stop::Exit;
                    }
                },
                _ = hangup.recv() => {
                    info!("Got SIGHUP to reload configuration");
                    break Stop::Reload;
                }
                _ = terminate.recv() => break Stop::Exit,
                _ = tokio::signal::ctrl_c() => break Stop::Exit,
            }
        };

        context.pool().close_all().await;
        if let Stop::Exit = stop {
            break;
        }
    }

    info!("Stop LDAP external ACL helper");
    drop(replies);
    writer.await??;
    Ok(())
}

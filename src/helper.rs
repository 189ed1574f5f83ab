//! External ACL helper: request lines in, verdict lines out
//!
//! Each input line is `[channel-id] username entity`. A leading numeric
//! channel id means the proxy runs the helper in concurrent mode: such
//! requests are answered from their own task and the reply echoes the id.

use crate::connection::{Connector, Directory};
use crate::errors::PoolResult;
use crate::pool::{ConnectionPool, PooledConnection};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(10);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(200);
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(300);

const SEARCH_ATTRIBUTES: &[&str] = &["sAMAccountName"];

/// One parsed request line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub channel_id: Option<String>,
    pub username: String,
    pub entity: String,
}

impl Request {
    /// Parse a request line.
    ///
    /// # Examples
    ///
    /// ```
    /// use ldap_acl_pool::helper::Request;
    ///
    /// let request = Request::parse("7 alice proxy-users").unwrap();
    /// assert_eq!(request.channel_id.as_deref(), Some("7"));
    /// assert!(request.is_concurrent());
    ///
    /// let request = Request::parse("alice proxy-users").unwrap();
    /// assert!(!request.is_concurrent());
    ///
    /// assert!(Request::parse("alice").is_none());
    /// ```
    pub fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [id, username, entity, ..] if id.parse::<i64>().is_ok() => Some(Self {
                channel_id: Some(id.to_string()),
                username: username.to_string(),
                entity: entity.to_string(),
            }),
            [username, entity, ..] => Some(Self {
                channel_id: None,
                username: username.to_string(),
                entity: entity.to_string(),
            }),
            _ => None,
        }
    }

    pub fn is_concurrent(&self) -> bool {
        self.channel_id.is_some()
    }
}

/// Answer to a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    channel_id: Option<String>,
    tag: Option<String>,
}

impl Reply {
    pub fn granted(channel_id: Option<String>, entity: &str) -> Self {
        Self {
            channel_id,
            tag: Some(entity.to_string()),
        }
    }

    pub fn denied(channel_id: Option<String>) -> Self {
        Self {
            channel_id,
            tag: None,
        }
    }

    pub fn is_granted(&self) -> bool {
        self.tag.is_some()
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(id) = &self.channel_id {
            write!(f, "{id} ")?;
        }
        match &self.tag {
            Some(tag) => write!(f, "OK tag={tag}"),
            None => write!(f, "ERR"),
        }
    }
}

/// Which directory query decides membership
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Find the user with `user_filter` (`%u` = login), then match groups
    /// with `group_filter` (`%u` = user DN, `%g` = requested group).
    Group {
        user_filter: String,
        group_filter: String,
    },

    /// Search `filter` (`%u` = login) under the base DN, where `%ou` in the
    /// base DN is the requested OU.
    Ou { filter: String },
}

#[derive(Debug, Clone)]
pub struct HelperSettings {
    pub bind_dn: String,
    pub bind_password: String,
    pub base_dn: String,
    pub lookup: Lookup,
    pub strip_realm: bool,
    pub strip_domain: bool,
}

impl HelperSettings {
    /// Strip a Kerberos realm (`user@REALM`) and/or an NT domain
    /// (`DOMAIN\user`) as configured.
    pub fn normalize<'a>(&self, username: &'a str) -> &'a str {
        let mut username = username;
        if self.strip_realm {
            username = username.split('@').next().unwrap_or(username);
        }
        if self.strip_domain
            && let Some(user) = username.split('\\').nth(1)
        {
            username = user;
        }
        username
    }
}

/// Replace every placeholder in a single pass, so substituted values are
/// never themselves expanded.
fn substitute(template: &str, replacements: &[(&str, &str)]) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;
    'scan: while !rest.is_empty() {
        for &(placeholder, value) in replacements {
            if let Some(tail) = rest.strip_prefix(placeholder) {
                output.push_str(value);
                rest = tail;
                continue 'scan;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            output.push(c);
        }
        rest = chars.as_str();
    }
    output
}

/// Everything a request needs, built once per helper (re)start.
pub struct HelperContext<K: Connector> {
    pool: ConnectionPool<K>,
    settings: HelperSettings,
}

impl<K> HelperContext<K>
where
    K: Connector,
    K::Connection: Directory,
{
    pub fn new(pool: ConnectionPool<K>, settings: HelperSettings) -> Self {
        Self { pool, settings }
    }

    pub fn pool(&self) -> &ConnectionPool<K> {
        &self.pool
    }

    /// Decide a request. Failures are logged and answered `ERR`.
    pub async fn handle(&self, request: &Request) -> Reply {
        let username = self.settings.normalize(&request.username);

        match self.authorize(username, &request.entity).await {
            Ok(true) => Reply::granted(request.channel_id.clone(), &request.entity),
            Ok(false) => Reply::denied(request.channel_id.clone()),
            Err(err) => {
                warn!(user = %username, entity = %request.entity, error = %err, "Lookup failed");
                Reply::denied(request.channel_id.clone())
            }
        }
    }

    async fn authorize(&self, username: &str, entity: &str) -> PoolResult<bool> {
        let mut conn = self.pool.acquire().await.inspect_err(|err| {
            error!(error = %err, "Cannot get an active LDAP connection");
        })?;

        let result = self.lookup(&mut conn, username, entity).await;
        conn.close().await;
        result
    }

    async fn lookup(
        &self,
        conn: &mut PooledConnection<K::Connection>,
        username: &str,
        entity: &str,
    ) -> PoolResult<bool> {
        let bound = conn.bind(&self.settings.bind_dn, &self.settings.bind_password).await;
        conn.track(bound)?;

        match &self.settings.lookup {
            Lookup::Ou { filter } => {
                let base = self.settings.base_dn.replace("%ou", entity);
                let filter = format!("(&({}))", substitute(filter, &[("%u", username)]));
                let found = conn.search(&base, &filter, SEARCH_ATTRIBUTES).await;
                Ok(!conn.track(found)?.is_empty())
            }
            Lookup::Group {
                user_filter,
                group_filter,
            } => {
                let filter = format!("(&({}))", substitute(user_filter, &[("%u", username)]));
                let found = conn.search(&self.settings.base_dn, &filter, SEARCH_ATTRIBUTES).await;
                let users = conn.track(found)?;
                let [user_dn] = users.as_slice() else {
                    debug!(user = %username, matches = users.len(), base = %self.settings.base_dn, "User not found");
                    return Ok(false);
                };

                let filter = substitute(group_filter, &[("%u", user_dn.as_str()), ("%g", entity)]);
                let found = conn.search(&self.settings.base_dn, &filter, SEARCH_ATTRIBUTES).await;
                Ok(!conn.track(found)?.is_empty())
            }
        }
    }
}

/// Parse one input line and answer it, from a separate task when the
/// request carries a channel id.
pub async fn dispatch<K>(context: &Arc<HelperContext<K>>, line: &str, replies: &mpsc::Sender<String>)
where
    K: Connector,
    K::Connection: Directory,
{
    let Some(request) = Request::parse(line.trim()) else {
        debug!(line = %line.trim(), "Unparseable request");
        send(replies, Reply::denied(None)).await;
        return;
    };

    if request.is_concurrent() {
        let context = Arc::clone(context);
        let replies = replies.clone();
        tokio::spawn(async move {
            let reply = context.handle(&request).await;
            send(&replies, reply).await;
        });
    } else {
        let reply = context.handle(&request).await;
        send(replies, reply).await;
    }
}

async fn send(replies: &mpsc::Sender<String>, reply: Reply) {
    if replies.send(reply.to_string()).await.is_err() {
        warn!("Reply writer has stopped");
    }
}

/// Write replies one per line, flushing after each, until every sender is gone.
pub async fn write_replies<W: AsyncWrite + Unpin>(
    mut replies: mpsc::Receiver<String>,
    out: W,
) -> std::io::Result<()> {
    let mut out = BufWriter::new(out);
    while let Some(line) = replies.recv().await {
        out.write_all(line.as_bytes()).await?;
        out.write_all(b"\n").await?;
        out.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PoolConfiguration, Strategy};
    use crate::connection::{Connection, ResultCode};
    use crate::errors::PoolError;
    use crate::server::ServerPool;
    use crate::server::testing::ScriptedProbe;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Directory answering searches from a filter → DNs table.
    #[derive(Clone, Default)]
    struct FakeDirectory {
        entries: Arc<HashMap<String, Vec<String>>>,
        bind_code: Option<ResultCode>,
        searches: Arc<Mutex<Vec<(String, String)>>>,
    }

    #[async_trait]
    impl Connection for FakeDirectory {
        async fn is_alive(&mut self) -> bool {
            true
        }

        async fn close(self) {}
    }

    #[async_trait]
    impl Directory for FakeDirectory {
        async fn bind(&mut self, _dn: &str, _password: &str) -> PoolResult<()> {
            match self.bind_code {
                Some(code) => Err(PoolError::Directory {
                    code,
                    message: "bind failed".to_string(),
                }),
                None => Ok(()),
            }
        }

        async fn search(&mut self, base: &str, filter: &str, _attrs: &[&str]) -> PoolResult<Vec<String>> {
            self.searches.lock().push((base.to_string(), filter.to_string()));
            Ok(self.entries.get(filter).cloned().unwrap_or_default())
        }
    }

    #[async_trait]
    impl Connector for FakeDirectory {
        type Connection = FakeDirectory;

        async fn connect(&self, _address: &str, _secure: bool) -> PoolResult<FakeDirectory> {
            Ok(self.clone())
        }
    }

    fn settings(lookup: Lookup) -> HelperSettings {
        HelperSettings {
            bind_dn: "cn=proxy".to_string(),
            bind_password: "secret".to_string(),
            base_dn: "ou=%ou,dc=example,dc=com".to_string(),
            lookup,
            strip_realm: true,
            strip_domain: true,
        }
    }

    fn group_lookup() -> Lookup {
        Lookup::Group {
            user_filter: "sAMAccountName=%u".to_string(),
            group_filter: "(&(member=%u)(cn=%g))".to_string(),
        }
    }

    async fn context(directory: &FakeDirectory, lookup: Lookup) -> HelperContext<FakeDirectory> {
        let probe = ScriptedProbe::reaching(&["dc1:389"]);
        let servers = Arc::new(
            ServerPool::with_probe(
                vec!["dc1:389".to_string()],
                DEFAULT_RETRY_BACKOFF,
                DEFAULT_PROBE_TIMEOUT,
                Strategy::RoundRobin,
                probe,
            )
            .unwrap(),
        );
        let pool = ConnectionPool::new(directory.clone(), servers, PoolConfiguration::new().with_capacity(2))
            .await
            .unwrap();
        HelperContext::new(pool, settings(lookup))
    }

    fn request(line: &str) -> Request {
        Request::parse(line).unwrap()
    }

    #[test]
    fn test_parse_sequential_with_numeric_user() {
        let request = request("42 staff");
        assert_eq!(request.channel_id, None);
        assert_eq!(request.username, "42");
        assert_eq!(request.entity, "staff");
    }

    #[test]
    fn test_reply_format() {
        assert_eq!(Reply::granted(None, "staff").to_string(), "OK tag=staff");
        assert_eq!(Reply::granted(Some("3".into()), "staff").to_string(), "3 OK tag=staff");
        assert_eq!(Reply::denied(None).to_string(), "ERR");
        assert_eq!(Reply::denied(Some("3".into())).to_string(), "3 ERR");
    }

    #[test]
    fn test_normalize() {
        let settings = settings(group_lookup());
        assert_eq!(settings.normalize("alice@EXAMPLE.COM"), "alice");
        assert_eq!(settings.normalize("EXAMPLE\\alice"), "alice");
        assert_eq!(settings.normalize("alice"), "alice");

        let plain = HelperSettings {
            strip_realm: false,
            strip_domain: false,
            ..settings
        };
        assert_eq!(plain.normalize("EXAMPLE\\alice"), "EXAMPLE\\alice");
    }

    #[test]
    fn test_substitute_single_pass() {
        let filter = substitute("(&(member=%u)(cn=%g))", &[("%u", "cn=%g"), ("%g", "staff")]);
        assert_eq!(filter, "(&(member=cn=%g)(cn=staff))");
    }

    #[tokio::test]
    async fn test_group_membership_granted() {
        let mut entries = HashMap::new();
        entries.insert("(&(sAMAccountName=alice))".to_string(), vec!["cn=alice".to_string()]);
        entries.insert("(&(member=cn=alice)(cn=staff))".to_string(), vec!["cn=staff".to_string()]);
        let directory = FakeDirectory {
            entries: Arc::new(entries),
            ..FakeDirectory::default()
        };
        let context = context(&directory, group_lookup()).await;

        let reply = context.handle(&request("5 EXAMPLE\\alice staff")).await;
        assert_eq!(reply.to_string(), "5 OK tag=staff");
        assert_eq!(context.pool().len(), 1);

        let reply = context.handle(&request("alice admins")).await;
        assert!(!reply.is_granted());
        assert_eq!(context.pool().get_metrics().reused, 1);
    }

    #[tokio::test]
    async fn test_unknown_user_denied() {
        let directory = FakeDirectory::default();
        let context = context(&directory, group_lookup()).await;

        let reply = context.handle(&request("bob staff")).await;
        assert_eq!(reply.to_string(), "ERR");
        assert_eq!(directory.searches.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_ou_lookup_uses_entity_in_base() {
        let mut entries = HashMap::new();
        entries.insert("(&(sAMAccountName=alice))".to_string(), vec!["cn=alice".to_string()]);
        let directory = FakeDirectory {
            entries: Arc::new(entries),
            ..FakeDirectory::default()
        };
        let lookup = Lookup::Ou {
            filter: "sAMAccountName=%u".to_string(),
        };
        let context = context(&directory, lookup).await;

        assert!(context.handle(&request("alice sales")).await.is_granted());
        let searches = directory.searches.lock();
        assert_eq!(searches[0].0, "ou=sales,dc=example,dc=com");
    }

    #[tokio::test]
    async fn test_invalid_credentials_dispose_connection() {
        let directory = FakeDirectory {
            bind_code: Some(ResultCode::INVALID_CREDENTIALS),
            ..FakeDirectory::default()
        };
        let context = context(&directory, group_lookup()).await;

        let reply = context.handle(&request("1 alice staff")).await;
        assert_eq!(reply.to_string(), "1 ERR");
        assert_eq!(context.pool().len(), 0);
        assert_eq!(context.pool().get_metrics().disposed, 1);
    }

    #[tokio::test]
    async fn test_closed_pool_answers_err() {
        let directory = FakeDirectory::default();
        let context = context(&directory, group_lookup()).await;
        context.pool().close_all().await;

        let reply = context.handle(&request("alice staff")).await;
        assert_eq!(reply.to_string(), "ERR");
    }

    #[tokio::test]
    async fn test_dispatch_and_write() {
        let directory = FakeDirectory::default();
        let context = Arc::new(context(&directory, group_lookup()).await);
        let (tx, rx) = mpsc::channel(8);

        dispatch(&context, "alice staff\n", &tx).await;
        dispatch(&context, "garbage", &tx).await;
        dispatch(&context, "9 alice staff", &tx).await;
        drop(tx);

        let mut out = Vec::new();
        write_replies(rx, &mut out).await.unwrap();
        let out = String::from_utf8(out).unwrap();

        let mut lines: Vec<&str> = out.lines().collect();
        lines.sort();
        assert_eq!(lines, ["9 ERR", "ERR", "ERR"]);
    }
}

//! Configuration of a local sync.

use syncevo_protocol::{ConfigProps, Credentials, SyncMode, DEFAULT_MAX_MSG_SIZE};

/// Default name of the helper executable.
pub const DEFAULT_HELPER: &str = "syncevo-local-sync";

/// Peer name used when a config name only names a context.
pub const DEFAULT_PEER: &str = "target-config";

/// Lower-cases a config name and drops the `@default` context.
pub fn normalize_config_name(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    match lower.strip_suffix("@default") {
        Some(peer) if !peer.is_empty() => peer.to_string(),
        Some(_) => "@default".to_string(),
        None => lower,
    }
}

/// Splits `peer@context` into peer and context; the context defaults to
/// `default`.
pub fn split_config_name(name: &str) -> (&str, &str) {
    match name.rsplit_once('@') {
        Some((peer, context)) if !context.is_empty() => (peer, context),
        Some((peer, _)) => (peer, "default"),
        None => (name, "default"),
    }
}

/// Where the helper's stdout and stderr go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Read both streams separately.
    #[default]
    Separate,
    /// Read both streams through one pipe.
    Merged,
}

/// One datastore of the parent config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatastoreConfig {
    /// Datastore name in the parent config.
    pub name: String,
    /// Sync mode as seen by the parent.
    pub mode: SyncMode,
    /// Name of the child datastore; the parent name is used if empty.
    pub uri: String,
}

impl DatastoreConfig {
    /// Creates a datastore that maps to the child datastore of the same name.
    pub fn new(name: impl Into<String>, mode: SyncMode) -> Self {
        Self {
            name: name.into(),
            mode,
            uri: String::new(),
        }
    }

    /// Maps to a differently named child datastore.
    #[must_use]
    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = uri.into();
        self
    }

    /// Child datastore name.
    pub fn target(&self) -> &str {
        if self.uri.is_empty() {
            &self.name
        } else {
            &self.uri
        }
    }
}

/// Everything the parent needs to start a local sync.
#[derive(Debug, Clone)]
pub struct LocalSyncConfig {
    /// Helper executable name or path.
    pub helper: String,

    /// Extra helper arguments.
    pub helper_args: Vec<String>,

    /// Config the child runs, `peer@context`.
    pub child_config: String,

    /// Name of the parent config.
    pub server_name: String,

    /// Root path of the parent config, `None` for ephemeral configs.
    pub server_root: Option<String>,

    /// Maximum message size; the shared buffers are twice as large.
    pub max_msg_size: usize,

    /// Log directory of the parent.
    pub log_dir: String,

    /// Whether the parent writes its own session logs.
    pub do_logging: bool,

    /// Credentials passed to the child.
    pub credentials: Credentials,

    /// Sync properties passed to the child.
    pub config_props: ConfigProps,

    /// Datastores of the parent config.
    pub datastores: Vec<DatastoreConfig>,

    /// Handling of the helper's output.
    pub output_mode: OutputMode,

    /// Extra environment of the helper.
    pub env: Vec<(String, String)>,
}

impl Default for LocalSyncConfig {
    fn default() -> Self {
        Self {
            helper: DEFAULT_HELPER.to_string(),
            helper_args: Vec::new(),
            child_config: "target-config@default".to_string(),
            server_name: String::new(),
            server_root: None,
            max_msg_size: DEFAULT_MAX_MSG_SIZE,
            log_dir: String::new(),
            do_logging: false,
            credentials: Credentials::default(),
            config_props: ConfigProps::default(),
            datastores: Vec::new(),
            output_mode: OutputMode::Separate,
            env: Vec::new(),
        }
    }
}

impl LocalSyncConfig {
    /// Creates a config for syncing `server_name` with `child_config`.
    pub fn new(server_name: impl Into<String>, child_config: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            child_config: child_config.into(),
            ..Self::default()
        }
    }

    /// Sets the helper executable.
    #[must_use]
    pub fn with_helper(mut self, helper: impl Into<String>) -> Self {
        self.helper = helper.into();
        self
    }

    /// Adds a helper argument.
    #[must_use]
    pub fn with_helper_arg(mut self, arg: impl Into<String>) -> Self {
        self.helper_args.push(arg.into());
        self
    }

    /// Sets the root path of the parent config.
    #[must_use]
    pub fn with_server_root(mut self, root: impl Into<String>) -> Self {
        self.server_root = Some(root.into());
        self
    }

    /// Sets the maximum message size.
    #[must_use]
    pub fn with_max_msg_size(mut self, size: usize) -> Self {
        self.max_msg_size = size;
        self
    }

    /// Sets the log directory and whether the parent logs itself.
    #[must_use]
    pub fn with_logging(mut self, log_dir: impl Into<String>, do_logging: bool) -> Self {
        self.log_dir = log_dir.into();
        self.do_logging = do_logging;
        self
    }

    /// Sets the credentials.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Sets a sync property.
    #[must_use]
    pub fn with_prop(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config_props.set(name, value);
        self
    }

    /// Adds a datastore.
    #[must_use]
    pub fn with_datastore(mut self, datastore: DatastoreConfig) -> Self {
        self.datastores.push(datastore);
        self
    }

    /// Sets the output mode.
    #[must_use]
    pub fn with_output_mode(mut self, mode: OutputMode) -> Self {
        self.output_mode = mode;
        self
    }

    /// Adds an environment variable for the helper.
    #[must_use]
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((name.into(), value.into()));
        self
    }

    /// Location of the parent config as sent to the child.
    pub fn server_location(&self) -> &str {
        self.server_root.as_deref().unwrap_or("ephemeral")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_names() {
        assert_eq!(normalize_config_name("Client@Default"), "client");
        assert_eq!(normalize_config_name("target-config@work"), "target-config@work");
        assert_eq!(normalize_config_name("@default"), "@default");
        assert_eq!(split_config_name("client"), ("client", "default"));
        assert_eq!(split_config_name("@work"), ("", "work"));
        assert_eq!(split_config_name("a@b@c"), ("a@b", "c"));
    }

    #[test]
    fn datastore_target_defaults_to_name() {
        let plain = DatastoreConfig::new("addressbook", SyncMode::TwoWay);
        assert_eq!(plain.target(), "addressbook");
        let mapped = plain.with_uri("contacts");
        assert_eq!(mapped.target(), "contacts");
    }

    #[test]
    fn builder() {
        let config = LocalSyncConfig::new("server", "client@other")
            .with_max_msg_size(2048)
            .with_prop("foo", "bar")
            .with_datastore(DatastoreConfig::new("calendar", SyncMode::Slow));
        assert_eq!(config.helper, DEFAULT_HELPER);
        assert_eq!(config.max_msg_size, 2048);
        assert_eq!(config.config_props.get("foo"), Some("bar"));
        assert_eq!(config.server_location(), "ephemeral");
        assert_eq!(
            config.with_server_root("/home/u/.config/server").server_location(),
            "/home/u/.config/server"
        );
    }
}

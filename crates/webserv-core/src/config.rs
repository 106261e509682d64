// src/config.rs
use crate::error::{Error, Result};
use crate::http::Method;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Whole-process configuration: engine limits plus one entry per virtual server.
///
/// ```toml
/// [limits]
/// idle_timeout_secs = 30
///
/// [[server]]
/// port = 8080
/// server_name = "localhost"
/// error_pages = { 404 = "errors/404.html" }
///
/// [[server.location]]
/// path = "/"
/// root = "www"
/// methods = ["GET", "POST", "DELETE"]
/// autoindex = true
/// cgi = { py = "/usr/bin/python3", sh = "" }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub limits: Limits,
    #[serde(default, rename = "server")]
    pub servers: Vec<ServerConfig>,
}

/// Engine-wide limits. Every field has a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Limits {
    /// Largest accepted request line plus header block, in bytes.
    pub max_header_size: usize,
    pub idle_timeout_secs: u64,
    pub cgi_timeout_secs: u64,
    /// Upper bound on one readiness wait; timeouts and shutdown are checked this often.
    pub poll_interval_ms: u64,
    pub max_connections: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_header_size: 8 * 1024,
            idle_timeout_secs: 60,
            cgi_timeout_secs: 30,
            poll_interval_ms: 100,
            max_connections: 1024,
        }
    }
}

impl Limits {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn cgi_timeout(&self) -> Duration {
        Duration::from_secs(self.cgi_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub server_name: String,
    /// Status code → HTML file served instead of the generated error page.
    #[serde(default, deserialize_with = "status_keyed")]
    pub error_pages: BTreeMap<u16, PathBuf>,
    #[serde(default = "default_body_size")]
    pub client_max_body_size: usize,
    #[serde(default, rename = "location")]
    pub locations: Vec<Location>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            server_name: String::new(),
            error_pages: BTreeMap::new(),
            client_max_body_size: default_body_size(),
            locations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Location {
    /// URL prefix this location answers for.
    pub path: String,
    pub root: PathBuf,
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,
    #[serde(default)]
    pub autoindex: bool,
    #[serde(default = "default_index")]
    pub index: Vec<String>,
    /// File extension → interpreter. An empty interpreter runs the script directly.
    #[serde(default)]
    pub cgi: BTreeMap<String, String>,
    /// Answer every request with a 301 to this URL.
    #[serde(default)]
    pub redirect: Option<String>,
    /// Where uploads are stored; the resolved request directory when unset.
    #[serde(default)]
    pub upload_dir: Option<PathBuf>,
}

impl Location {
    pub fn new(path: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            root: root.into(),
            methods: default_methods(),
            autoindex: false,
            index: default_index(),
            cgi: BTreeMap::new(),
            redirect: None,
            upload_dir: None,
        }
    }

    pub fn allows(&self, method: Method) -> bool {
        self.methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method.as_str()))
    }

    /// Value for the `Allow` header of a 405.
    pub fn allow_header(&self) -> String {
        self.methods
            .iter()
            .map(|m| m.to_ascii_uppercase())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Interpreter for a script with this extension, if the extension is a CGI one.
    pub fn cgi_interpreter(&self, extension: &str) -> Option<&str> {
        self.cgi
            .iter()
            .find(|(ext, _)| ext.trim_start_matches('.').eq_ignore_ascii_case(extension))
            .map(|(_, interpreter)| interpreter.as_str())
    }

    /// `path` falls under this location: equal, or continues with a `/`.
    pub fn matches(&self, path: &str) -> bool {
        let prefix = self.path.trim_end_matches('/');
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.is_empty(),
            None => false,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    8080
}

fn default_body_size() -> usize {
    1024 * 1024
}

fn default_methods() -> Vec<String> {
    vec!["GET".into(), "HEAD".into()]
}

fn default_index() -> Vec<String> {
    vec!["index.html".into()]
}

/// TOML keys are always strings; error pages are keyed by status code.
fn status_keyed<'de, D>(de: D) -> std::result::Result<BTreeMap<u16, PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, PathBuf>::deserialize(de)?;
    raw.into_iter()
        .map(|(code, page)| {
            code.parse::<u16>()
                .map(|code| (code, page))
                .map_err(|_| serde::de::Error::custom(format!("invalid status code `{code}`")))
        })
        .collect()
}

impl ServerConfig {
    /// Resolve `host:port` to the address the listener binds.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Config(format!("host `{}` does not resolve", self.host)))
    }

    /// Location with the longest prefix matching `path`.
    pub fn location_for(&self, path: &str) -> Option<&Location> {
        self.locations
            .iter()
            .filter(|loc| loc.matches(path))
            .max_by_key(|loc| loc.path.trim_end_matches('/').len())
    }
}

impl Config {
    /// Read, parse and validate a TOML file. Relative paths inside it are
    /// taken relative to the file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let mut config = Self::from_toml_str(&text)?;
        let base = path.parent().unwrap_or(Path::new(""));
        let base = std::path::absolute(if base.as_os_str().is_empty() {
            Path::new(".")
        } else {
            base
        })?;
        config.rebase(&base);
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn rebase(&mut self, base: &Path) {
        let join = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        for server in &mut self.servers {
            server.error_pages.values_mut().for_each(join);
            for loc in &mut server.locations {
                join(&mut loc.root);
                if let Some(dir) = loc.upload_dir.as_mut() {
                    join(dir);
                }
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(Error::Config("at least one [[server]] is required".into()));
        }
        if self.limits.max_header_size < 64 {
            return Err(Error::Config("limits.max_header_size is too small".into()));
        }
        if self.limits.max_connections == 0 {
            return Err(Error::Config("limits.max_connections must be positive".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            // Port 0 asks the OS for an ephemeral port and never collides
            if server.port != 0 && !seen.insert((server.host.clone(), server.port)) {
                return Err(Error::Config(format!(
                    "{}:{} is configured twice",
                    server.host, server.port
                )));
            }
            if let Some(code) = server
                .error_pages
                .keys()
                .find(|code| !(300..=599).contains(*code))
            {
                return Err(Error::Config(format!("error page for non-error status {code}")));
            }
            for loc in &server.locations {
                if !loc.path.starts_with('/') {
                    return Err(Error::Config(format!(
                        "location path `{}` must start with `/`",
                        loc.path
                    )));
                }
                if let Some(m) = loc
                    .methods
                    .iter()
                    .find(|m| Method::from_bytes(m.to_ascii_uppercase().as_bytes()).is_none())
                {
                    return Err(Error::Config(format!(
                        "unknown method `{m}` in location `{}`",
                        loc.path
                    )));
                }
                if loc.cgi.keys().any(|ext| ext.trim_start_matches('.').is_empty()) {
                    return Err(Error::Config(format!(
                        "empty CGI extension in location `{}`",
                        loc.path
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [limits]
        idle_timeout_secs = 5

        [[server]]
        host = "127.0.0.1"
        port = 8081
        server_name = "example"
        client_max_body_size = 2048
        error_pages = { 404 = "errors/404.html" }

        [[server.location]]
        path = "/"
        root = "www"
        autoindex = true

        [[server.location]]
        path = "/cgi-bin"
        root = "cgi"
        methods = ["GET", "POST"]
        cgi = { py = "/usr/bin/python3", ".sh" = "" }
    "#;

    #[test]
    fn parses_full_config_with_defaults() {
        let cfg = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.limits.idle_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.limits.cgi_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.limits.max_header_size, 8192);

        let server = &cfg.servers[0];
        assert_eq!(server.port, 8081);
        assert_eq!(server.client_max_body_size, 2048);
        assert_eq!(server.error_pages[&404], PathBuf::from("errors/404.html"));

        let root = &server.locations[0];
        assert!(root.autoindex);
        assert!(root.allows(Method::Get) && root.allows(Method::Head));
        assert!(!root.allows(Method::Delete));
        assert_eq!(root.index, vec!["index.html".to_string()]);

        let cgi = &server.locations[1];
        assert_eq!(cgi.cgi_interpreter("py"), Some("/usr/bin/python3"));
        assert_eq!(cgi.cgi_interpreter("sh"), Some(""));
        assert_eq!(cgi.cgi_interpreter("rb"), None);
        assert_eq!(cgi.allow_header(), "GET, POST");
    }

    #[test]
    fn longest_prefix_on_segment_boundary() {
        let cfg = Config::from_toml_str(SAMPLE).unwrap();
        let server = &cfg.servers[0];
        assert_eq!(server.location_for("/cgi-bin/hello.py").unwrap().path, "/cgi-bin");
        assert_eq!(server.location_for("/cgi-bin").unwrap().path, "/cgi-bin");
        assert_eq!(server.location_for("/cgi-binary").unwrap().path, "/");
        assert_eq!(server.location_for("/").unwrap().path, "/");
    }

    #[test]
    fn defaults_apply_to_bare_server() {
        let cfg = Config::from_toml_str("[[server]]\n").unwrap();
        let server = &cfg.servers[0];
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.port, 8080);
        assert_eq!(server.client_max_body_size, 1024 * 1024);
        assert_eq!(cfg.limits.max_connections, 1024);
        assert_eq!(cfg.limits.poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn validation_failures() {
        for bad in [
            "",
            "[[server]]\n[[server.location]]\npath = \"nope\"\nroot = \".\"\n",
            "[[server]]\n[[server.location]]\npath = \"/\"\nroot = \".\"\nmethods = [\"FETCH\"]\n",
            "[[server]]\nerror_pages = { 200 = \"ok.html\" }\n",
            "[[server]]\nport = 80\n[[server]]\nport = 80\n",
        ] {
            let err = Config::from_toml_str(bad).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{bad:?} gave {err}");
        }
    }

    #[test]
    fn syntax_errors_are_reported() {
        assert!(matches!(
            Config::from_toml_str("[[server]]\nport = \"x\"\n"),
            Err(Error::Toml(_))
        ));
        assert!(matches!(
            Config::from_toml_str("[[server]]\nerror_pages = { abc = \"x\" }\n"),
            Err(Error::Toml(_))
        ));
    }

    #[test]
    fn load_rebases_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("site.toml");
        std::fs::write(&file, SAMPLE).unwrap();
        let cfg = Config::load(&file).unwrap();
        assert_eq!(cfg.servers[0].locations[0].root, dir.path().join("www"));
        assert_eq!(cfg.servers[0].error_pages[&404], dir.path().join("errors/404.html"));
    }

    #[test]
    fn load_from_relative_file_yields_absolute_roots() {
        let cwd = std::env::current_dir().unwrap();
        let dir = tempfile::tempdir_in(&cwd).unwrap();
        std::fs::write(dir.path().join("site.toml"), SAMPLE).unwrap();
        let relative = dir.path().strip_prefix(&cwd).unwrap().join("site.toml");

        let cfg = Config::load(&relative).unwrap();
        let root = &cfg.servers[0].locations[0].root;
        assert!(root.is_absolute(), "{}", root.display());
        assert_eq!(root, &dir.path().join("www"));
    }

    #[test]
    fn listen_addr_resolves() {
        let server = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..ServerConfig::default()
        };
        assert_eq!(server.listen_addr().unwrap(), "127.0.0.1:0".parse().unwrap());
    }
}

//! External mutation executor: the boundary to WordPress itself.
//!
//! Reconciliation never touches a WordPress database directly. It asks a
//! [`WpExecutor`] to run named operations against a site and gets back
//! the captured output. [`WpCliExecutor`] runs them through `wp`, `php`
//! and the MariaDB client tools; tests substitute in-memory fakes.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{ExecError, ExecResult};
use crate::model::{Language, plain_text};

/// Printed by the install script when it succeeded.
pub const INSTALL_SUCCESS_MARKER: &str = "WordPress successfully installed";

/// PHP evaluated to read the site's current configuration.
pub const STATUS_PHP: &str =
    "echo(json_encode(apply_filters('wp_operator_status',[]), JSON_PRETTY_PRINT));";

/// Which WordPress a command is aimed at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SiteHandle {
    pub namespace: String,
    /// Site name; also the name of its ingress.
    pub name: String,
}

impl SiteHandle {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for SiteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Arguments of the one-time install step.
#[derive(Clone, PartialEq)]
pub struct InstallParams {
    pub hostname: String,
    pub path: String,
    pub title: String,
    pub tagline: String,
    pub unit_id: Option<String>,
    pub db_host: String,
    pub db_name: String,
    pub db_user: String,
    pub db_password: String,
}

impl fmt::Debug for InstallParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallParams")
            .field("hostname", &self.hostname)
            .field("path", &self.path)
            .field("title", &self.title)
            .field("db_host", &self.db_host)
            .field("db_name", &self.db_name)
            .field("db_user", &self.db_user)
            .finish_non_exhaustive()
    }
}

/// Copy of a restored database into a site's own database.
#[derive(Clone, PartialEq)]
pub struct ImportParams {
    pub source_host: String,
    pub source_database: String,
    pub source_password: String,
    pub target_host: String,
    pub target_database: String,
    /// URL of the original site, rewritten to `target_url`.
    pub url_source: Option<String>,
    pub target_url: String,
}

impl fmt::Debug for ImportParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportParams")
            .field("source_host", &self.source_host)
            .field("source_database", &self.source_database)
            .field("target_host", &self.target_host)
            .field("target_database", &self.target_database)
            .field("url_source", &self.url_source)
            .field("target_url", &self.target_url)
            .finish_non_exhaustive()
    }
}

/// A named operation against one site.
#[derive(Debug, Clone, PartialEq)]
pub enum WpOperation {
    Install(InstallParams),
    Import(ImportParams),
    ActivatePlugins(Vec<String>),
    DeactivatePlugins(Vec<String>),
    /// Evaluate PHP inside the site.
    Eval(String),
    AddLanguage(Language),
    /// Remove a language by slug.
    DeleteLanguage(String),
    DeleteTransient(String),
    /// Run the SQL file against the site's database.
    ApplySql(PathBuf),
    /// Read the site's status JSON.
    QueryStatus,
}

impl WpOperation {
    pub fn name(&self) -> &'static str {
        match self {
            WpOperation::Install(_) => "install",
            WpOperation::Import(_) => "import",
            WpOperation::ActivatePlugins(_) => "plugin activate",
            WpOperation::DeactivatePlugins(_) => "plugin deactivate",
            WpOperation::Eval(_) => "eval",
            WpOperation::AddLanguage(_) => "language create",
            WpOperation::DeleteLanguage(_) => "language delete",
            WpOperation::DeleteTransient(_) => "transient delete",
            WpOperation::ApplySql(_) => "db query",
            WpOperation::QueryStatus => "status",
        }
    }
}

/// Captured output of a successful operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
}

/// Runs operations against WordPress sites.
#[async_trait]
pub trait WpExecutor: Send + Sync {
    async fn run(&self, site: &SiteHandle, op: &WpOperation) -> ExecResult<ExecOutput>;
}

/// Programs and paths used by [`WpCliExecutor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub wp_cli: PathBuf,
    pub php: PathBuf,
    pub install_script: PathBuf,
    /// WordPress sources the install script loads.
    pub wp_dir: PathBuf,
    pub secret_dir: PathBuf,
    pub mariadb_dump: PathBuf,
    pub mariadb_client: PathBuf,
    /// Log command lines instead of running them.
    pub dry_run: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            wp_cli: "wp".into(),
            php: "php".into(),
            install_script: "ensure-wordpress-and-theme.php".into(),
            wp_dir: "/wp/".into(),
            secret_dir: "/keybase".into(),
            mariadb_dump: "mariadb-dump".into(),
            mariadb_client: "mariadb".into(),
            dry_run: false,
        }
    }
}

/// A fully resolved process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub stdin: Option<PathBuf>,
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            if arg.starts_with("--db-password=") || arg.starts_with("-p") {
                write!(f, " <redacted>")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Executor backed by `wp`, the install script and MariaDB client tools.
pub struct WpCliExecutor {
    config: ExecutorConfig,
}

impl WpCliExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    fn wp(&self, site: &SiteHandle, args: Vec<String>) -> CommandLine {
        let mut full = vec![format!("--ingress={}", site.name)];
        full.extend(args);
        CommandLine {
            program: self.config.wp_cli.clone(),
            args: full,
            stdin: None,
        }
    }

    /// The command `op` runs. `Import` is a pipeline and has none.
    pub fn command_line(&self, site: &SiteHandle, op: &WpOperation) -> Option<CommandLine> {
        let line = match op {
            WpOperation::Install(p) => CommandLine {
                program: self.config.php.clone(),
                args: vec![
                    self.config.install_script.display().to_string(),
                    format!("--name={}", site.name),
                    format!("--path={}", p.path),
                    format!("--wp-dir={}", with_final_slash(&self.config.wp_dir)),
                    format!("--wp-host={}", p.hostname),
                    format!("--db-host={}", p.db_host),
                    format!("--db-name={}", p.db_name),
                    format!("--db-user={}", p.db_user),
                    format!("--db-password={}", p.db_password),
                    format!("--title={}", p.title),
                    format!("--tagline={}", p.tagline),
                    format!("--unit-id={}", p.unit_id.as_deref().unwrap_or_default()),
                    format!("--secret-dir={}", self.config.secret_dir.display()),
                ],
                stdin: None,
            },
            WpOperation::Import(_) => return None,
            WpOperation::ActivatePlugins(names) => {
                let mut args = vec!["plugin".to_string(), "activate".to_string()];
                args.extend(names.iter().cloned());
                self.wp(site, args)
            }
            WpOperation::DeactivatePlugins(names) => {
                let mut args = vec!["plugin".to_string(), "deactivate".to_string()];
                args.extend(names.iter().cloned());
                self.wp(site, args)
            }
            WpOperation::Eval(php) => self.wp(site, vec!["eval".into(), php.clone()]),
            WpOperation::AddLanguage(lang) => self.wp(
                site,
                vec![
                    "pll".into(),
                    "lang".into(),
                    "create".into(),
                    lang.name.clone(),
                    lang.slug.clone(),
                    lang.locale.clone(),
                    format!("--rtl={}", flag_arg(&lang.rtl)),
                    format!("--order={}", flag_arg(&lang.term_group)),
                    format!("--flag={}", lang.flag),
                ],
            ),
            WpOperation::DeleteLanguage(slug) => {
                self.wp(site, vec!["pll".into(), "lang".into(), "delete".into(), slug.clone()])
            }
            WpOperation::DeleteTransient(name) => {
                self.wp(site, vec!["transient".into(), "delete".into(), name.clone()])
            }
            WpOperation::ApplySql(path) => CommandLine {
                stdin: Some(path.clone()),
                ..self.wp(site, vec!["db".into(), "query".into()])
            },
            WpOperation::QueryStatus => self.wp(site, vec!["eval".into(), STATUS_PHP.into()]),
        };
        Some(line)
    }

    async fn spawn(&self, op: &WpOperation, line: &CommandLine) -> ExecResult<String> {
        let stdout = self.spawn_raw(op, line, None).await?;
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }

    /// Run `line` to completion and return its stdout bytes untouched.
    async fn spawn_raw(&self, op: &WpOperation, line: &CommandLine, input: Option<Vec<u8>>) -> ExecResult<Vec<u8>> {
        debug!(command = %line, "running");
        let mut command = Command::new(&line.program);
        command
            .args(&line.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let input = match (&line.stdin, input) {
            (_, Some(bytes)) => Some(bytes),
            (Some(path), None) => Some(tokio::fs::read(path).await.map_err(|source| ExecError::Spawn {
                program: path.display().to_string(),
                source,
            })?),
            (None, None) => None,
        };
        command.stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() });

        let spawn_error = |source| ExecError::Spawn {
            program: line.program.display().to_string(),
            source,
        };
        let mut child = command.spawn().map_err(spawn_error)?;
        let stdin = child.stdin.take();
        // Feed stdin while draining stdout and stderr; stdin closes on drop.
        let feed = async move {
            match (input, stdin) {
                (Some(bytes), Some(mut stdin)) => stdin.write_all(&bytes).await,
                _ => Ok(()),
            }
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output.map_err(spawn_error)?;
        if !output.status.success() {
            return Err(ExecError::Failed {
                operation: op.name().to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        fed.map_err(spawn_error)?;
        Ok(output.stdout)
    }

    /// Dump the restored database, rewrite its URL and name, and load it
    /// into the site's database.
    async fn import(&self, op: &WpOperation, p: &ImportParams) -> ExecResult<String> {
        let dump = CommandLine {
            program: self.config.mariadb_dump.clone(),
            args: vec![
                "-h".into(),
                p.source_host.clone(),
                "-u".into(),
                "root".into(),
                format!("-p{}", p.source_password),
                p.source_database.clone(),
            ],
            stdin: None,
        };
        let load = CommandLine {
            program: self.config.mariadb_client.clone(),
            args: vec![
                "-h".into(),
                p.target_host.clone(),
                "-u".into(),
                "root".into(),
                format!("-p{}", p.source_password),
                p.target_database.clone(),
            ],
            stdin: None,
        };
        if self.config.dry_run {
            info!(dump = %dump, load = %load, "dry run, not importing");
            return Ok(String::new());
        }
        let dumped = self.spawn_raw(op, &dump, None).await?;
        let rewritten = rewrite_dump(&dumped, p);
        let loaded = self.spawn_raw(op, &load, Some(rewritten)).await?;
        Ok(String::from_utf8_lossy(&loaded).into_owned())
    }
}

#[async_trait]
impl WpExecutor for WpCliExecutor {
    async fn run(&self, site: &SiteHandle, op: &WpOperation) -> ExecResult<ExecOutput> {
        let stdout = match op {
            WpOperation::Import(params) => self.import(op, params).await?,
            _ => {
                let Some(line) = self.command_line(site, op) else {
                    return Err(ExecError::Unsupported(op.name().to_string()));
                };
                if self.config.dry_run {
                    info!(%site, command = %line, "dry run, not executing");
                    return Ok(ExecOutput {
                        stdout: match op {
                            WpOperation::Install(_) => INSTALL_SUCCESS_MARKER.to_string(),
                            WpOperation::QueryStatus => "{}".to_string(),
                            _ => String::new(),
                        },
                    });
                }
                self.spawn(op, &line).await?
            }
        };
        if matches!(op, WpOperation::Install(_)) && !stdout.contains(INSTALL_SUCCESS_MARKER) {
            return Err(ExecError::MissingMarker {
                operation: op.name().to_string(),
                marker: INSTALL_SUCCESS_MARKER.to_string(),
            });
        }
        Ok(ExecOutput { stdout })
    }
}

fn with_final_slash(path: &std::path::Path) -> String {
    let text = path.display().to_string();
    if text.ends_with('/') { text } else { format!("{text}/") }
}

/// `--rtl=` / `--order=` argument text.
fn flag_arg(value: &serde_json::Value) -> String {
    match plain_text(value) {
        s if s.is_empty() => "0".to_string(),
        s => s,
    }
}

/// Byte-level rewrite: dumps carry binary column data verbatim.
fn rewrite_dump(dump: &[u8], p: &ImportParams) -> Vec<u8> {
    let renamed = replace_bytes(dump, p.source_database.as_bytes(), p.target_database.as_bytes());
    match p.url_source.as_deref().map(|u| u.trim_end_matches('/')) {
        Some(source) if !source.is_empty() => {
            replace_bytes(&renamed, source.as_bytes(), p.target_url.trim_end_matches('/').as_bytes())
        }
        _ => renamed,
    }
}

fn replace_bytes(haystack: &[u8], from: &[u8], to: &[u8]) -> Vec<u8> {
    if from.is_empty() {
        return haystack.to_vec();
    }
    let mut out = Vec::with_capacity(haystack.len());
    let mut rest = haystack;
    while let Some(at) = rest.windows(from.len()).position(|w| w == from) {
        out.extend_from_slice(&rest[..at]);
        out.extend_from_slice(to);
        rest = &rest[at + from.len()..];
    }
    out.extend_from_slice(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn site() -> SiteHandle {
        SiteHandle::new("ns", "blog")
    }

    fn executor() -> WpCliExecutor {
        WpCliExecutor::new(ExecutorConfig::default())
    }

    fn install_params() -> InstallParams {
        InstallParams {
            hostname: "www.example.com".into(),
            path: "/blog".into(),
            title: "Blog".into(),
            tagline: "".into(),
            unit_id: Some("13030".into()),
            db_host: "mariadb-01".into(),
            db_name: "wp-db-blog".into(),
            db_user: "wp-db-user-blog".into(),
            db_password: "s3cret".into(),
        }
    }

    #[test]
    fn wp_commands_target_the_site_ingress() {
        let line = executor()
            .command_line(&site(), &WpOperation::ActivatePlugins(vec!["a".into(), "b".into()]))
            .unwrap();
        assert_eq!(line.program, PathBuf::from("wp"));
        assert_eq!(line.args, vec!["--ingress=blog", "plugin", "activate", "a", "b"]);
    }

    #[test]
    fn language_creation_arguments() {
        let lang = Language {
            name: "Français".into(),
            slug: "fr".into(),
            locale: "fr_FR".into(),
            rtl: json!(false),
            term_group: json!(1),
            flag: "fr".into(),
        };
        let line = executor().command_line(&site(), &WpOperation::AddLanguage(lang)).unwrap();
        assert_eq!(
            line.args,
            vec!["--ingress=blog", "pll", "lang", "create", "Français", "fr", "fr_FR", "--rtl=0", "--order=1", "--flag=fr"]
        );
    }

    #[test]
    fn sql_is_fed_on_stdin() {
        let line = executor()
            .command_line(&site(), &WpOperation::ApplySql("redirection.sql".into()))
            .unwrap();
        assert_eq!(line.args, vec!["--ingress=blog", "db", "query"]);
        assert_eq!(line.stdin, Some(PathBuf::from("redirection.sql")));
    }

    #[test]
    fn install_command_hides_password_when_displayed() {
        let line = executor()
            .command_line(&site(), &WpOperation::Install(install_params()))
            .unwrap();
        assert!(line.args.contains(&"--db-password=s3cret".to_string()));
        assert!(line.args.contains(&"--wp-dir=/wp/".to_string()));
        assert!(!line.to_string().contains("s3cret"));
        assert!(!format!("{:?}", install_params()).contains("s3cret"));
    }

    #[tokio::test]
    async fn dry_run_reports_success_without_spawning() {
        let executor = WpCliExecutor::new(ExecutorConfig {
            wp_cli: "/nonexistent/wp".into(),
            php: "/nonexistent/php".into(),
            dry_run: true,
            ..ExecutorConfig::default()
        });
        let out = executor
            .run(&site(), &WpOperation::Install(install_params()))
            .await
            .unwrap();
        assert!(out.stdout.contains(INSTALL_SUCCESS_MARKER));
        let status = executor.run(&site(), &WpOperation::QueryStatus).await.unwrap();
        assert_eq!(status.stdout, "{}");
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let executor = WpCliExecutor::new(ExecutorConfig {
            wp_cli: "/nonexistent/wp".into(),
            ..ExecutorConfig::default()
        });
        let err = executor.run(&site(), &WpOperation::QueryStatus).await.unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }

    #[test]
    fn dump_rewrite_moves_url_and_database() {
        let params = ImportParams {
            source_host: "mariadb-restore".into(),
            source_database: "wp-db-old".into(),
            source_password: "root".into(),
            target_host: "mariadb-01".into(),
            target_database: "wp-db-blog".into(),
            url_source: Some("https://old.example.com/".into()),
            target_url: "https://www.example.com/blog".into(),
        };
        let dump = "USE `wp-db-old`; INSERT INTO wp_options VALUES ('siteurl','https://old.example.com/x');";
        assert_eq!(
            rewrite_dump(dump.as_bytes(), &params),
            b"USE `wp-db-blog`; INSERT INTO wp_options VALUES ('siteurl','https://www.example.com/blog/x');"
        );

        // Binary column data passes through byte for byte.
        let mut blob = b"INSERT INTO wp_blobs VALUES ('".to_vec();
        blob.extend_from_slice(&[0xff, 0x00, 0xc3, 0x28, 0x80]);
        blob.extend_from_slice(b"','https://old.example.com/y');");
        let mut expected = b"INSERT INTO wp_blobs VALUES ('".to_vec();
        expected.extend_from_slice(&[0xff, 0x00, 0xc3, 0x28, 0x80]);
        expected.extend_from_slice(b"','https://www.example.com/blog/y');");
        assert_eq!(rewrite_dump(&blob, &params), expected);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn large_stdin_does_not_deadlock_on_stderr() {
        // cat echoes 1 MiB to stderr while it is still being fed.
        let line = CommandLine {
            program: "sh".into(),
            args: vec!["-c".into(), "cat >&2".into()],
            stdin: None,
        };
        let input = vec![b'x'; 1 << 20];
        let out = executor()
            .spawn_raw(&WpOperation::QueryStatus, &line, Some(input))
            .await
            .unwrap();
        assert!(out.is_empty());
    }
}

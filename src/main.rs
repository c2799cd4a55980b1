//! Script content CLI
//!
//! Single-shot mode:
//!   script-content [--script NAME] [--template NAME] [--build JSON] ...
//!
//! Server mode (persistent process, reads from stdin):
//!   script-content --server
//!
//! Protocol (server mode):
//!   Request (stdin, one line):
//!     {"args":{"script":"email-ext.js"},"build":{"number":1},"project":{},"publisher":{}}
//!
//!   Response (stdout):
//!     Status:Ok
//!     Length:1234
//!
//!     <html>...
//!
//!   Error response (invalid request or broken sandbox setup):
//!     Status:Error
//!     Length:42
//!
//!     Invalid request JSON: expected value at...

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use script_content::{EmailType, JsonBuild, JsonPublisher, RendererConfig, ScriptContent};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "script-content", version, about = "Render script-generated email content")]
struct Cli {
    /// Run as a persistent process reading requests from stdin
    #[arg(long)]
    server: bool,

    /// Script name (default: email-ext.js)
    #[arg(long)]
    script: Option<String>,

    /// Template name (default: js-html.template)
    #[arg(long)]
    template: Option<String>,

    /// Skip the init script
    #[arg(long)]
    no_init: bool,

    /// Home directory; custom scripts are read from its email-templates subdirectory
    #[arg(long, env = "SCRIPT_CONTENT_HOME")]
    home: Option<PathBuf>,

    /// Run user scripts without the sandbox policy
    #[arg(long, env = "SCRIPT_CONTENT_INSECURE")]
    insecure: bool,

    /// Base URL exposed to scripts as `rooturl`
    #[arg(long, env = "SCRIPT_CONTENT_ROOT_URL", default_value = "")]
    root_url: String,

    /// V8 heap limit in megabytes (0 = unlimited)
    #[arg(long, default_value_t = 64)]
    max_heap_mb: usize,

    /// Build as JSON
    #[arg(long, default_value = "{}")]
    build: String,

    /// Project as JSON
    #[arg(long, default_value = "{}")]
    project: String,

    /// Publisher as JSON
    #[arg(long, default_value = "{}")]
    publisher: String,

    /// Email type the content is rendered for
    #[arg(long, default_value = "default")]
    email_type: String,
}

impl Cli {
    fn config(&self) -> RendererConfig {
        let defaults = RendererConfig::default();
        RendererConfig {
            home_dir: self.home.clone().unwrap_or(defaults.home_dir),
            security_enabled: !self.insecure,
            root_url: self.root_url.clone(),
            max_heap_size: (self.max_heap_mb > 0).then(|| self.max_heap_mb * 1024 * 1024),
        }
    }

    fn args(&self) -> HashMap<String, String> {
        let mut args = HashMap::new();
        if let Some(script) = &self.script {
            args.insert("script".to_string(), script.clone());
        }
        if let Some(template) = &self.template {
            args.insert("template".to_string(), template.clone());
        }
        if self.no_init {
            args.insert("init".to_string(), "false".to_string());
        }
        args
    }
}

/// One render request in server mode
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Request {
    args: HashMap<String, String>,
    build: Value,
    project: Value,
    publisher: Value,
    email_type: Option<String>,
}

fn parse_json(label: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("Invalid {} JSON", label))
}

/// Run in single-shot mode
async fn run_single_shot(cli: &Cli) -> Result<()> {
    let content = ScriptContent::new(cli.config());
    let build = JsonBuild {
        build: parse_json("build", &cli.build)?,
        project: parse_json("project", &cli.project)?,
    };
    let publisher = JsonPublisher(parse_json("publisher", &cli.publisher)?);

    let text = content
        .render(&build, &publisher, &EmailType::new(&cli.email_type), &cli.args())
        .await?;

    println!("{}", text);
    Ok(())
}

/// Run in server mode (persistent process, reads requests from stdin)
async fn run_server(cli: &Cli) -> Result<()> {
    let content = ScriptContent::new(cli.config());

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let mut reader = stdin.lock();

    tracing::info!("Server ready, reading from stdin");

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line)?;
        if bytes_read == 0 {
            // EOF - stdin closed, exit gracefully
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                write_response(&mut stdout, false, &format!("Invalid request JSON: {}", e))?;
                continue;
            }
        };

        let build = JsonBuild {
            build: request.build,
            project: request.project,
        };
        let publisher = JsonPublisher(request.publisher);
        let email_type = EmailType::new(request.email_type.unwrap_or_else(|| cli.email_type.clone()));

        match content.render(&build, &publisher, &email_type, &request.args).await {
            Ok(text) => write_response(&mut stdout, true, &text)?,
            Err(e) => {
                tracing::error!("Render aborted: {}", e);
                write_response(&mut stdout, false, &e.to_string())?;
            }
        }
    }

    tracing::info!("Server shutting down");
    Ok(())
}

/// Write response in length-prefixed protocol
fn write_response(stdout: &mut std::io::Stdout, ok: bool, body: &str) -> Result<()> {
    let status = if ok { "Ok" } else { "Error" };

    writeln!(stdout, "Status:{}", status)?;
    writeln!(stdout, "Length:{}", body.len())?;
    writeln!(stdout)?; // Empty line separator
    write!(stdout, "{}", body)?;
    stdout.flush()?;

    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    if cli.server {
        if cli.script.is_some() || cli.template.is_some() {
            return Err(anyhow!("--script and --template are per-request in server mode"));
        }
        return run_server(&cli).await;
    }

    run_single_shot(&cli).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_is_on_unless_insecure() {
        let cli = Cli::try_parse_from(["script-content"]).unwrap();
        assert!(cli.config().security_enabled);

        let cli = Cli::try_parse_from(["script-content", "--insecure"]).unwrap();
        assert!(!cli.config().security_enabled);

        assert!(Cli::try_parse_from(["script-content", "--security"]).is_err());
    }

    #[test]
    fn test_flags_become_token_arguments() {
        let cli = Cli::try_parse_from([
            "script-content",
            "--script",
            "custom.js",
            "--no-init",
            "--max-heap-mb",
            "0",
        ])
        .unwrap();

        let args = cli.args();
        assert_eq!(args.get("script").map(String::as_str), Some("custom.js"));
        assert_eq!(args.get("init").map(String::as_str), Some("false"));
        assert!(!args.contains_key("template"));
        assert_eq!(cli.config().max_heap_size, None);
    }
}

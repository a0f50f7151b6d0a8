use std::io::{Cursor, Read};
use std::sync::Arc;
use std::time::Duration;

use dossier_probes::{ProbeOptions, default_source_set};
use facet::Facet;
use figue as args;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Facet, Debug)]
struct ServerCli {
    #[facet(flatten)]
    builtins: args::FigueBuiltins,
    #[facet(args::named, default)]
    listen: Option<String>,
    #[facet(args::named, default)]
    path: Option<String>,
    #[facet(args::named, default)]
    profile_ms: Option<u64>,
}

#[derive(Facet, Debug)]
struct ClientCli {
    #[facet(flatten)]
    builtins: args::FigueBuiltins,
    #[facet(args::subcommand)]
    command: ClientCommand,
}

#[derive(Facet, Debug)]
#[repr(u8)]
enum ClientCommand {
    Fetch {
        #[facet(args::named, default)]
        url: Option<String>,
        #[facet(args::named, default)]
        path: Option<String>,
        #[facet(args::named, default)]
        out: Option<String>,
    },
    List {
        #[facet(args::named, default)]
        url: Option<String>,
        #[facet(args::named, default)]
        path: Option<String>,
    },
}

const LISTEN_ENV: &str = "DOSSIER_HTTP";
const PATH_ENV: &str = "DOSSIER_PATH";
const PROFILE_MS_ENV: &str = "DOSSIER_PROFILE_MS";

const DEFAULT_LISTEN: &str = "127.0.0.1:9140";
const DEFAULT_BASE_URL: &str = "http://127.0.0.1:9140";
const DEFAULT_PATH: &str = "/debug/dump";
const DEFAULT_PROFILE_MS: u64 = 5_000;

fn main() {
    let cli_args: Vec<String> = std::env::args().skip(1).collect();
    if cli_args
        .first()
        .map(String::as_str)
        .is_some_and(is_client_command)
    {
        if let Err(err) = run_client() {
            eprintln!("{err}");
            std::process::exit(1);
        }
        return;
    }

    register_current_thread();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .on_thread_start(register_current_thread)
        .on_thread_stop(deregister_current_thread)
        .build();
    let runtime = match runtime {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to build tokio runtime: {err}");
            std::process::exit(1);
        }
    };
    runtime.block_on(async {
        if let Err(err) = run_server().await {
            eprintln!("{err}");
            std::process::exit(1);
        }
    });
}

fn is_client_command(value: &str) -> bool {
    matches!(value, "fetch" | "list")
}

#[cfg(unix)]
fn register_current_thread() {
    let thread = std::thread::current();
    dossier_probes::register_thread(thread.name().unwrap_or("unnamed"));
}

#[cfg(unix)]
fn deregister_current_thread() {
    dossier_probes::deregister_thread();
}

#[cfg(not(unix))]
fn register_current_thread() {}

#[cfg(not(unix))]
fn deregister_current_thread() {}

async fn run_server() -> Result<(), String> {
    let cli = parse_server_cli()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let listen = cli
        .listen
        .or_else(|| std::env::var(LISTEN_ENV).ok())
        .unwrap_or_else(|| DEFAULT_LISTEN.into());
    let path = cli
        .path
        .or_else(|| std::env::var(PATH_ENV).ok())
        .unwrap_or_else(|| DEFAULT_PATH.into());
    let profile_ms = match cli.profile_ms {
        Some(ms) => ms,
        None => profile_ms_from_env()?,
    };

    let registry = default_source_set(Duration::from_millis(profile_ms), ProbeOptions::default())
        .map_err(|e| format!("failed to set up diagnostic sources: {e}"))?;
    let registry = Arc::new(registry);
    let app = dossier::http::router(&path, Arc::clone(&registry))
        .map_err(|e| format!("failed to route {path}: {e}"))?;

    let listener = TcpListener::bind(&listen)
        .await
        .map_err(|e| format!("failed to bind HTTP on {listen}: {e}"))?;
    info!(
        %listen,
        %path,
        profile_ms,
        sources = ?registry.names(),
        "dossier debug endpoint ready"
    );
    println!();
    println!("  Download a debug bundle: \x1b[32mcurl -o dossier.zip http://{listen}{path}\x1b[0m");
    println!();

    if let Err(e) = axum::serve(listener, app).await {
        error!(%e, "HTTP server error");
        return Err(format!("HTTP server error: {e}"));
    }
    Ok(())
}

fn profile_ms_from_env() -> Result<u64, String> {
    match std::env::var(PROFILE_MS_ENV) {
        Ok(raw) => raw
            .parse::<u64>()
            .map_err(|e| format!("invalid {PROFILE_MS_ENV}={raw:?}: {e}")),
        Err(_) => Ok(DEFAULT_PROFILE_MS),
    }
}

fn parse_server_cli() -> Result<ServerCli, String> {
    let figue_config = args::builder::<ServerCli>()
        .map_err(|e| format!("failed to build CLI schema: {e}"))?
        .cli(|cli| cli.strict())
        .help(|h| {
            h.program_name("dossier")
                .description("Serve on-demand debug bundles over HTTP")
                .version(option_env!("CARGO_PKG_VERSION").unwrap_or("dev"))
        })
        .build();
    let cli = args::Driver::new(figue_config)
        .run()
        .into_result()
        .map_err(|e| e.to_string())?;
    Ok(cli.value)
}

fn parse_client_cli() -> Result<ClientCli, String> {
    let figue_config = args::builder::<ClientCli>()
        .map_err(|e| format!("failed to build CLI schema: {e}"))?
        .cli(|cli| cli.strict())
        .help(|h| {
            h.program_name("dossier")
                .description("Download and inspect dossier debug bundles")
                .version(option_env!("CARGO_PKG_VERSION").unwrap_or("dev"))
        })
        .build();
    let cli = args::Driver::new(figue_config)
        .run()
        .into_result()
        .map_err(|e| e.to_string())?;
    Ok(cli.value)
}

fn run_client() -> Result<(), String> {
    let cli = parse_client_cli()?;
    match cli.command {
        ClientCommand::Fetch { url, path, out } => run_fetch(url, path, out),
        ClientCommand::List { url, path } => run_list(url, path),
    }
}

fn bundle_url(url: Option<String>, path: Option<String>) -> String {
    let base_url = url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    let path = path.unwrap_or_else(|| DEFAULT_PATH.to_string());
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}

fn run_fetch(url: Option<String>, path: Option<String>, out: Option<String>) -> Result<(), String> {
    let url = bundle_url(url, path);
    let archive = http_get_bytes(&url)?;
    let entries = list_entries(&archive)?;

    let out = out.unwrap_or_else(|| format!("dossier-{}.zip", dossier_types::now_ms()));
    std::fs::write(&out, &archive).map_err(|e| format!("write {out}: {e}"))?;

    println!("saved {} bytes to {out}", archive.len());
    print_entries(&entries);
    Ok(())
}

fn run_list(url: Option<String>, path: Option<String>) -> Result<(), String> {
    let url = bundle_url(url, path);
    let archive = http_get_bytes(&url)?;
    print_entries(&list_entries(&archive)?);
    Ok(())
}

fn http_get_bytes(url: &str) -> Result<Vec<u8>, String> {
    let response = match ureq::get(url).call() {
        Ok(response) => response,
        Err(ureq::Error::Status(code, response)) => {
            let body = response.into_string().unwrap_or_default();
            return Err(format!("GET {url}: HTTP {code}: {body}"));
        }
        Err(e) => return Err(format!("GET {url}: {e}")),
    };
    let mut body = Vec::new();
    response
        .into_reader()
        .read_to_end(&mut body)
        .map_err(|e| format!("read GET response body: {e}"))?;
    Ok(body)
}

fn list_entries(archive: &[u8]) -> Result<Vec<(String, u64)>, String> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive))
        .map_err(|e| format!("response is not a zip archive: {e}"))?;
    let mut entries = Vec::with_capacity(zip.len());
    for i in 0..zip.len() {
        let file = zip
            .by_index(i)
            .map_err(|e| format!("read zip entry {i}: {e}"))?;
        entries.push((file.name().to_string(), file.size()));
    }
    Ok(entries)
}

fn print_entries(entries: &[(String, u64)]) {
    for (name, size) in entries {
        println!("  {size:>10}  {name}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_commands_are_routed_away_from_the_server() {
        assert!(is_client_command("fetch"));
        assert!(is_client_command("list"));
        assert!(!is_client_command("--listen"));
        assert!(!is_client_command("serve"));
    }

    #[test]
    fn bundle_url_joins_base_and_path() {
        assert_eq!(bundle_url(None, None), "http://127.0.0.1:9140/debug/dump");
        assert_eq!(
            bundle_url(Some("http://host:8080/".into()), Some("/diag".into())),
            "http://host:8080/diag"
        );
    }

    #[test]
    fn list_entries_rejects_non_zip_bodies() {
        let err = list_entries(b"{\"error\":\"boom\"}").expect_err("json is not a zip");
        assert!(err.contains("not a zip archive"));
    }
}

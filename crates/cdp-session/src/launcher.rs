use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chromiumoxide::async_process::Child;
use chromiumoxide::browser::BrowserConfig;
use futures::io::{AsyncBufReadExt, BufReader};
use futures::stream::StreamExt;
use tempfile::TempDir;
use tokio::time::timeout;
use tracing::{debug, info};
use which::which;

use crate::config::SessionConfig;
use crate::error::SessionError;

/// A browser we spawned ourselves: the child process, its DevTools endpoint,
/// and the scratch profile directory kept alive for the process lifetime.
pub struct LaunchedBrowser {
    pub child: Child,
    pub ws_url: String,
    #[allow(dead_code)]
    scratch_profile: Option<TempDir>,
}

/// Spawn a local browser per `config` and wait for its DevTools endpoint.
pub async fn launch(config: &SessionConfig) -> Result<LaunchedBrowser, SessionError> {
    let (profile_dir, scratch_profile) = prepare_profile(config)?;
    let browser_config = build_browser_config(config, &profile_dir)?;

    let mut child = browser_config
        .launch()
        .map_err(|err| SessionError::Launch(format!("failed to spawn browser: {err}")))?;

    let ws_url = wait_for_ws_url(&mut child).await?;
    info!(target: "cdp", url = %ws_url, profile = %profile_dir.display(), "browser launched");

    Ok(LaunchedBrowser {
        child,
        ws_url,
        scratch_profile,
    })
}

/// Resolve which profile directory the browser gets.
///
/// A configured profile is copied into a scratch directory by default so a
/// concurrently running browser keeps its singleton lock; without a
/// configured profile we hand out a fresh scratch directory.
fn prepare_profile(config: &SessionConfig) -> Result<(PathBuf, Option<TempDir>), SessionError> {
    match &config.user_data_dir {
        Some(dir) if !config.copy_profile => Ok((dir.clone(), None)),
        Some(dir) => {
            let scratch = TempDir::new()
                .map_err(|err| SessionError::Launch(format!("scratch profile dir: {err}")))?;
            if dir.exists() {
                copy_profile_tree(dir, scratch.path())?;
                debug!(
                    target: "cdp",
                    from = %dir.display(),
                    to = %scratch.path().display(),
                    "profile copied for reuse"
                );
            }
            Ok((scratch.path().to_path_buf(), Some(scratch)))
        }
        None => {
            let scratch = TempDir::new()
                .map_err(|err| SessionError::Launch(format!("scratch profile dir: {err}")))?;
            Ok((scratch.path().to_path_buf(), Some(scratch)))
        }
    }
}

/// Recursive copy skipping the browser's singleton lock artifacts.
fn copy_profile_tree(from: &Path, to: &Path) -> Result<(), SessionError> {
    fs::create_dir_all(to).map_err(|err| SessionError::Launch(err.to_string()))?;
    let entries = fs::read_dir(from).map_err(|err| SessionError::Launch(err.to_string()))?;
    for entry in entries {
        let entry = entry.map_err(|err| SessionError::Launch(err.to_string()))?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with("Singleton") {
            continue;
        }
        let source = entry.path();
        let dest = to.join(&name);
        let kind = entry
            .file_type()
            .map_err(|err| SessionError::Launch(err.to_string()))?;
        if kind.is_dir() {
            copy_profile_tree(&source, &dest)?;
        } else if kind.is_file() {
            fs::copy(&source, &dest).map_err(|err| SessionError::Launch(err.to_string()))?;
        }
        // Symlinks (singleton socket et al.) are intentionally not carried.
    }
    Ok(())
}

fn build_browser_config(
    config: &SessionConfig,
    profile_dir: &Path,
) -> Result<BrowserConfig, SessionError> {
    let executable = match &config.executable {
        Some(path) => {
            if !path.exists() {
                return Err(SessionError::Launch(format!(
                    "browser executable not found at {}",
                    path.display()
                )));
            }
            Some(path.clone())
        }
        None => detect_executable(),
    };

    let mut builder = BrowserConfig::builder()
        .request_timeout(config.command_timeout())
        .launch_timeout(Duration::from_secs(20));

    if !config.headless {
        builder = builder.with_head();
    }
    if config.no_sandbox {
        builder = builder.no_sandbox();
    }

    let window_size = format!("--window-size={},{}", config.window_width, config.window_height);
    let mut args = vec![
        "--disable-background-networking",
        "--disable-background-timer-throttling",
        "--disable-breakpad",
        "--disable-client-side-phishing-detection",
        "--disable-component-update",
        "--disable-default-apps",
        "--disable-dev-shm-usage",
        "--disable-hang-monitor",
        "--disable-popup-blocking",
        "--disable-prompt-on-repost",
        "--disable-sync",
        "--metrics-recording-only",
        "--no-first-run",
        "--no-default-browser-check",
        "--password-store=basic",
        "--remote-allow-origins=*",
        "--use-mock-keychain",
        window_size.as_str(),
    ];
    if config.headless {
        args.push("--headless=new");
        args.push("--hide-scrollbars");
        args.push("--mute-audio");
    }
    builder = builder.args(args);

    if let Some(path) = executable {
        builder = builder.chrome_executable(path);
    }
    builder = builder.user_data_dir(profile_dir);

    builder
        .build()
        .map_err(|err| SessionError::Launch(format!("browser config error: {err}")))
}

const BROWSER_NAMES: &[&str] = &[
    "google-chrome-stable",
    "google-chrome",
    "chromium",
    "chromium-browser",
    "msedge",
    "chrome",
];

fn detect_executable() -> Option<PathBuf> {
    if let Ok(raw) = std::env::var("HELMSMAN_BROWSER") {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            let candidate = PathBuf::from(trimmed);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    for name in BROWSER_NAMES {
        if let Ok(path) = which(name) {
            return Some(path);
        }
    }
    None
}

/// Read the child's stderr until it announces the DevTools WebSocket URL.
async fn wait_for_ws_url(child: &mut Child) -> Result<String, SessionError> {
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| SessionError::Launch("browser process missing stderr handle".to_string()))?;
    let mut lines = BufReader::new(stderr).lines();
    let mut preview = Vec::new();

    let reader = async {
        while let Some(line) = lines.next().await {
            let line = line.map_err(|err| SessionError::Launch(err.to_string()))?;
            preview.push(line.clone());
            if let Some((_, rest)) = line.rsplit_once("listening on ") {
                let candidate = rest.trim();
                if candidate.starts_with("ws") && candidate.contains("devtools/browser") {
                    return Ok(candidate.to_string());
                }
            }
        }
        Err(SessionError::Launch(format!(
            "browser exited before exposing a devtools endpoint; stderr: {}",
            preview
                .iter()
                .take(8)
                .cloned()
                .collect::<Vec<_>>()
                .join(" | ")
        )))
    };

    timeout(Duration::from_secs(20), reader)
        .await
        .map_err(|_| SessionError::Launch("timed out waiting for devtools endpoint".to_string()))?
}

use std::path::PathBuf;

use anyhow::{Context, Result};
use frontier_xhr::xhr::UploadFailure;
use frontier_xhr::{JsXhrEnvironment, XhrConfig, XmlHttpRequest};
use tracing_subscriber::EnvFilter;

const CHUNK: u64 = 16 * 1024;

fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .try_init();

    let total: u64 = std::env::args()
        .nth(1)
        .map(|raw| raw.parse::<u64>())
        .transpose()
        .context("body size must be a byte count")?
        .unwrap_or(256 * 1024);
    let abort_at: Option<u64> = std::env::args()
        .nth(2)
        .map(|raw| raw.parse::<u64>())
        .transpose()
        .context("abort offset must be a byte count")?;

    let config_path = std::env::var("FRONTIER_XHR_CONFIG").ok().map(PathBuf::from);
    let config = XhrConfig::load(config_path).unwrap_or_else(|err| {
        eprintln!("Failed to load xhr configuration: {err}. Using defaults.");
        XhrConfig::default()
    });

    let environment = JsXhrEnvironment::new()?;
    let request = XmlHttpRequest::new(config);
    let handle = request.upload().script_handle(&environment)?;
    environment.expose(&handle, "upload")?;
    environment.eval(
        r#"
            upload.onloadstart = (event) => console.log(`upload started: ${event.total} bytes`);
            upload.addEventListener('progress', (event) => {
                const percent = event.lengthComputable
                    ? Math.round((event.loaded / event.total) * 100)
                    : '?';
                console.log(`progress ${event.loaded}/${event.total} (${percent}%)`);
            });
            upload.onabort = () => console.log('upload aborted');
            upload.onloadend = (event) => console.log(`upload finished with ${event.loaded} bytes`);
        "#,
        "upload-demo.js",
    )?;

    request.start_upload(total);
    let mut sent = 0;
    while sent < total {
        sent = (sent + CHUNK).min(total);
        if abort_at.is_some_and(|limit| sent >= limit) {
            request.fail_upload(UploadFailure::Abort);
            return Ok(());
        }
        request.report_upload_progress(sent);
    }
    request.complete_upload();
    Ok(())
}

//! CLI command implementations

use crate::output::{print_report, OutputFormat, Row};
use anyhow::{anyhow, Context};
use base64::{engine::general_purpose::STANDARD, Engine};
use castello_core::seek::{normalize, normalize_command};
use castello_core::{
    derive_source, EntitlementClient, HttpEntitlementClient, HttpLicenseTransport, KeySystem, LoadRequestData,
    ReceiverConfig, SourceDescriptor,
};
use clap::ValueEnum;
use serde_json::json;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use url::Url;

/// Key system selectable on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KeySystemArg {
    Widevine,
    #[value(name = "playready")]
    PlayReady,
}

impl From<KeySystemArg> for KeySystem {
    fn from(arg: KeySystemArg) -> Self {
        match arg {
            KeySystemArg::Widevine => KeySystem::Widevine,
            KeySystemArg::PlayReady => KeySystem::PlayReady,
        }
    }
}

/// Normalize a requested start position
pub fn seek(raw: f64, duration: f64, watch_from_start: bool, format: OutputFormat) -> anyhow::Result<()> {
    let target = normalize(raw, duration, watch_from_start);
    let unit = if !watch_from_start && duration > 0.0 && raw > duration {
        "milliseconds"
    } else {
        "seconds"
    };

    let report = json!({
        "requested": raw,
        "duration": duration,
        "watchFromStart": watch_from_start,
        "interpretedAs": unit,
        "targetSeconds": target,
    });
    print_report(
        &report,
        vec![
            Row::new("Requested", raw),
            Row::new("Duration", duration),
            Row::new("Interpreted as", unit),
            Row::new("Target (s)", target),
        ],
        format,
    )
}

/// Show the source a LOAD request resolves to
pub fn describe(request: &Path, config: &ReceiverConfig, format: OutputFormat) -> anyhow::Result<()> {
    let (data, source) = resolve(request, config)?;
    let command = data.to_command()?;
    let start = normalize_command(command.requested_seek_seconds, command.duration, command.watch_from_start);

    let summary = source.summary();
    let mut rows = vec![
        Row::new("URL", &summary.url),
        Row::new("Content type", &summary.content_type),
        Row::new("Container", summary.container_type),
        Row::new("Start (s)", start),
        Row::new("Entitlement", command.token().is_some()),
    ];
    for key_system in &summary.key_systems {
        rows.push(Row::new(&key_system.system.to_string(), &key_system.license_url));
    }
    if summary.key_systems.is_empty() {
        rows.push(Row::new("DRM", "none"));
    }

    let mut report = serde_json::to_value(&summary)?;
    report["startSeconds"] = json!(start);
    print_report(&report, rows, format)
}

/// Run a license exchange for a LOAD request
pub async fn license(
    request: &Path,
    key_message: &Path,
    system: KeySystem,
    output: Option<PathBuf>,
    config: &ReceiverConfig,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let (_, source) = resolve(request, config)?;
    let key_system = source
        .key_system(system)
        .ok_or_else(|| anyhow!("the request carries no {} configuration", system))?;

    let message = std::fs::read(key_message)
        .with_context(|| format!("reading key message {}", key_message.display()))?;
    info!(system = %system, url = %key_system.license_url(), "Requesting license");
    let license = key_system.request_license(&message).await?;
    let stats = key_system.broker().stats();

    if let Some(path) = &output {
        std::fs::write(path, &license)?;
    }

    let report = json!({
        "system": system,
        "licenseUrl": key_system.license_url().as_str(),
        "bytes": license.len(),
        "retries": stats.retries(),
        "license": output.is_none().then(|| STANDARD.encode(&license)),
    });
    let mut rows = vec![
        Row::new("Key system", system),
        Row::new("License URL", key_system.license_url()),
        Row::new("Bytes", license.len()),
        Row::new("Retries", stats.retries()),
    ];
    match &output {
        Some(path) => rows.push(Row::new("Written to", path.display())),
        None => rows.push(Row::new("License", STANDARD.encode(&license))),
    }
    print_report(&report, rows, format)
}

/// Run a single multiplay entitlement check
pub async fn entitlement(
    token: &str,
    url: Option<Url>,
    config: &ReceiverConfig,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let endpoint = url
        .or_else(|| config.entitlement_url.clone())
        .ok_or_else(|| anyhow!("no entitlement endpoint given and none configured"))?;
    let client = HttpEntitlementClient::new(endpoint.clone(), config)?;
    let verdict = client.check(token).await?;

    let (code, message) = if verdict.accepted {
        (None, None)
    } else {
        (Some(verdict.code()), Some(verdict.message()))
    };
    let report = json!({
        "endpoint": endpoint.as_str(),
        "accepted": verdict.accepted,
        "status": verdict.status,
        "code": code,
        "message": message,
    });
    let mut rows = vec![
        Row::new("Endpoint", &endpoint),
        Row::new("Status", verdict.status),
        Row::new("Accepted", verdict.accepted),
    ];
    if let (Some(code), Some(message)) = (code, message) {
        rows.push(Row::new("Code", code));
        rows.push(Row::new("Message", message));
    }
    print_report(&report, rows, format)?;

    if !verdict.accepted {
        return Err(verdict.to_error().into());
    }
    Ok(())
}

/// Read a LOAD request and derive its source
fn resolve(request: &Path, config: &ReceiverConfig) -> anyhow::Result<(LoadRequestData, SourceDescriptor)> {
    let raw = if request.as_os_str() == "-" {
        let mut raw = String::new();
        std::io::stdin().read_to_string(&mut raw)?;
        raw
    } else {
        std::fs::read_to_string(request).with_context(|| format!("reading {}", request.display()))?
    };

    let data = LoadRequestData::from_json(&raw)?;
    let command = data.to_command()?;
    let transport = Arc::new(HttpLicenseTransport::new(config)?);
    let source = derive_source(&command, transport, config, None)?;
    Ok((data, source))
}

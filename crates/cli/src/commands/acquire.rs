use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::Args;
use serde::Serialize;
use tracing::info;

use keyward_lock::{LockManager, LockReleased};

use crate::OutputFormat;

#[derive(Args, Debug)]
pub struct AcquireArgs {
    /// Lock key.
    pub key: String,
    /// Issuer token. Defaults to a random UUID.
    #[arg(long)]
    pub issuer: Option<String>,
    /// Time-to-live in seconds.
    #[arg(long, default_value_t = 30)]
    pub ttl_secs: u64,
    /// Hold the lock for this many seconds, then release it.
    #[arg(long)]
    pub hold_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
struct AcquireOutput<'a> {
    key: &'a str,
    issuer: &'a str,
    acquired: bool,
    expires_on: Option<DateTime<Utc>>,
    released: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    release_event: Option<LockReleased>,
}

pub async fn run(
    locks: &LockManager,
    args: &AcquireArgs,
    format: &OutputFormat,
) -> anyhow::Result<()> {
    let issuer = args
        .issuer
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let ttl = Duration::from_secs(args.ttl_secs);

    let Some(handle) = locks.acquire(&args.key, &issuer, ttl).await? else {
        print(
            format,
            &AcquireOutput {
                key: &args.key,
                issuer: &issuer,
                acquired: false,
                expires_on: None,
                released: None,
                release_event: None,
            },
        )?;
        std::process::exit(1);
    };

    let release_event = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&release_event);
    handle.on_released(move |event| {
        info!(key = %event.key, issuer = %event.issuer, "lock released");
        *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(event.clone());
    });

    let released = match args.hold_secs {
        Some(hold) => {
            tokio::time::sleep(Duration::from_secs(hold)).await;
            Some(locks.release(&handle).await)
        }
        None => None,
    };
    let release_event = release_event
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();

    print(
        format,
        &AcquireOutput {
            key: handle.key(),
            issuer: handle.issuer(),
            acquired: true,
            expires_on: Some(handle.expires_on()),
            released,
            release_event,
        },
    )
}

fn print(format: &OutputFormat, output: &AcquireOutput<'_>) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(output)?),
        OutputFormat::Text => {
            if !output.acquired {
                println!("{} is held by another issuer.", output.key);
                return Ok(());
            }
            println!("{} acquired by {}", output.key, output.issuer);
            if let Some(expires_on) = output.expires_on {
                println!("  expires: {}", expires_on.to_rfc3339());
            }
            match output.released {
                Some(true) => match &output.release_event {
                    Some(event) => println!("  released by {}", event.issuer),
                    None => println!("  released"),
                },
                Some(false) => println!("  already gone at release time"),
                None => {}
            }
        }
    }
    Ok(())
}

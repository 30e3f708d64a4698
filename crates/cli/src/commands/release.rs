use clap::Args;

use keyward_lock::LockManager;

use crate::OutputFormat;

#[derive(Args, Debug)]
pub struct ReleaseArgs {
    /// Lock key.
    pub key: String,
}

pub async fn run(
    locks: &LockManager,
    args: &ReleaseArgs,
    format: &OutputFormat,
) -> anyhow::Result<()> {
    let released = locks.release_key(&args.key).await?;
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({ "key": args.key, "released": released })
        ),
        OutputFormat::Text => {
            if released {
                println!("{} released.", args.key);
            } else {
                println!("{} was not held.", args.key);
            }
        }
    }
    if !released {
        std::process::exit(1);
    }
    Ok(())
}

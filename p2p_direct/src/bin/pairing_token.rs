//! Encode and decode pairing tokens from the command line.
//!
//! Usage:
//!   pairing_token encode <offer|answer> <description-file> [--key-hint H] [--qr]
//!   pairing_token decode <token>

use anyhow::{Context, Result, anyhow, bail};
use p2p_direct::pairing::{PairingPayload, PairingRole, render_qr};
use p2p_direct::AppConfig;

const USAGE: &str = "usage:
  pairing_token encode <offer|answer> <description-file> [--key-hint H] [--qr]
  pairing_token decode <token>";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let codec = AppConfig::load().signaling_codec();

    match args.first().map(String::as_str) {
        Some("encode") => {
            let role: PairingRole = args
                .get(1)
                .ok_or_else(|| anyhow!(USAGE))?
                .parse()?;
            let path = args.get(2).ok_or_else(|| anyhow!(USAGE))?;
            let description = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path))?;

            let mut payload = PairingPayload::new(role, description);
            let mut show_qr = false;
            let mut rest = args[3..].iter();
            while let Some(flag) = rest.next() {
                match flag.as_str() {
                    "--key-hint" => {
                        let hint = rest.next().ok_or_else(|| anyhow!("--key-hint needs a value"))?;
                        payload = payload.with_key_hint(hint.clone());
                    }
                    "--qr" => show_qr = true,
                    other => bail!("unknown option '{}'\n{}", other, USAGE),
                }
            }

            let token = codec.encode(&payload)?;
            tracing::info!("Encoded {} token ({} chars)", role, token.len());
            println!("{}", token);
            if show_qr {
                println!("{}", render_qr(&token)?);
            }
        }
        Some("decode") => {
            let token = args.get(1).ok_or_else(|| anyhow!(USAGE))?;
            let payload = codec.decode(token)?;
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        _ => bail!(USAGE),
    }
    Ok(())
}

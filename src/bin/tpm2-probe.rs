// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Exercise a TPM through the protocol stack

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tpm2_proto::{
    crypto, CommandAudit, GetRandom, ParameterEncryption, PolicyCalculator, PolicyPcr,
    PolicyUpdate, Session, SessionOptions, Tpm2bDigest, TpmAlgId, TpmContext, TpmHandle,
    TpmlPcrSelection,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TPM device path or simulator address (auto-detected when unset)
    #[arg(short, long, env = "TPM_DEVICE")]
    device: Option<String>,

    /// Session and PCR bank hash algorithm
    #[arg(long, env = "TPM_HASH", value_enum, default_value_t = HashArg::Sha256)]
    hash: HashArg,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Show the device and check that it answers
    Info,
    /// Draw random bytes from the TPM RNG
    Random {
        #[arg(default_value_t = 32)]
        bytes: usize,
    },
    /// Read PCR values
    PcrRead {
        #[arg(value_delimiter = ',', default_value = "0,1,2,7")]
        pcrs: Vec<u32>,
    },
    /// Read an NV index
    NvRead {
        #[arg(value_parser = parse_handle)]
        index: u32,
    },
    /// Draw random bytes over an audited, response-encrypted HMAC session
    Session {
        #[arg(default_value_t = 16)]
        bytes: u16,
    },
    /// Compute a PolicyPCR digest offline and compare it with a trial session
    PolicyPcr {
        #[arg(value_delimiter = ',', default_value = "0,7")]
        pcrs: Vec<u32>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum HashArg {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl From<HashArg> for TpmAlgId {
    fn from(hash: HashArg) -> Self {
        match hash {
            HashArg::Sha1 => TpmAlgId::Sha1,
            HashArg::Sha256 => TpmAlgId::Sha256,
            HashArg::Sha384 => TpmAlgId::Sha384,
            HashArg::Sha512 => TpmAlgId::Sha512,
        }
    }
}

fn parse_handle(s: &str) -> Result<u32> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).with_context(|| format!("invalid handle: {s}"))
}

fn main() -> Result<()> {
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt().with_env_filter(filter).init();
    }
    let args = Args::parse();
    let hash = TpmAlgId::from(args.hash);

    let mut ctx = TpmContext::new(args.device.as_deref()).context("failed to open TPM")?;
    info!("using TPM at {}", ctx.device_path());

    match args.command {
        Cmd::Info => {
            let bytes = ctx.get_random(8)?;
            println!("device: {}", ctx.device_path());
            println!("responding: yes ({})", hex::encode(bytes));
        }
        Cmd::Random { bytes } => {
            println!("{}", hex::encode(ctx.get_random(bytes)?));
        }
        Cmd::PcrRead { pcrs } => {
            let selection = TpmlPcrSelection::single(hash, &pcrs);
            for (idx, value) in ctx.pcr_read(&selection)? {
                println!("PCR[{idx}] = {}", hex::encode(value));
            }
        }
        Cmd::NvRead { index } => {
            let (public, _) = ctx.nv_read_public(index)?;
            info!(
                "NV index 0x{index:08x}: {} bytes, attributes 0x{:08x}",
                public.data_size, public.attributes.0
            );
            println!("{}", hex::encode(ctx.nv_read(index)?));
        }
        Cmd::Session { bytes } => session_random(&mut ctx, hash, bytes)?,
        Cmd::PolicyPcr { pcrs } => policy_pcr(&mut ctx, hash, &pcrs)?,
    }
    Ok(())
}

fn session_random(ctx: &mut TpmContext, hash: TpmAlgId, bytes: u16) -> Result<()> {
    let opts = SessionOptions::new()
        .audit()
        .aes_encryption(128, ParameterEncryption::EncryptOut);
    let mut session = ctx
        .hmac_session(hash, opts)
        .context("failed to start HMAC session")?;
    info!("started HMAC session 0x{:08x}", session.handle());

    let mut audit = CommandAudit::new(hash)?;
    let mut cmd = GetRandom {
        bytes_requested: bytes,
    };
    let result = ctx.execute(&mut cmd, &mut [&mut session]);
    let rsp = match result {
        Ok(rsp) => rsp,
        Err(e) => {
            session.flush(ctx.transport())?;
            return Err(e).context("GetRandom over session failed");
        }
    };
    audit.update(&mut cmd, &rsp)?;
    session.flush(ctx.transport())?;

    println!("random: {}", hex::encode(rsp.random_bytes.as_bytes()));
    println!("audit:  {}", hex::encode(audit.digest()));
    Ok(())
}

fn policy_pcr(ctx: &mut TpmContext, hash: TpmAlgId, pcrs: &[u32]) -> Result<()> {
    let selection = TpmlPcrSelection::single(hash, pcrs);
    let values = ctx.pcr_read(&selection)?;
    if values.len() != pcrs.len() {
        bail!("TPM returned {} of {} PCRs", values.len(), pcrs.len());
    }
    let parts: Vec<&[u8]> = values.iter().map(|(_, v)| v.as_slice()).collect();
    let pcr_digest = crypto::hash(hash, &parts)?;

    let mut calc = PolicyCalculator::new(hash)?;
    PolicyPcr {
        policy_session: TpmHandle(0),
        pcr_digest: Tpm2bDigest::new(pcr_digest),
        pcrs: selection.clone(),
    }
    .update(&mut calc)?;
    let expected = calc.hash().to_vec();
    println!("computed: {}", hex::encode(&expected));

    let session = ctx
        .policy_session(hash, SessionOptions::new().trial())
        .context("failed to start trial session")?;
    let mut cmd = PolicyPcr {
        policy_session: TpmHandle(session.handle()),
        pcr_digest: Tpm2bDigest::empty(),
        pcrs: selection,
    };
    let digest = ctx
        .execute(&mut cmd, &mut [])
        .map_err(anyhow::Error::from)
        .and_then(|_| Ok(ctx.policy_get_digest(&session)?));
    session.flush(ctx.transport())?;
    let digest = digest.context("trial PolicyPCR failed")?;
    println!("trial:    {}", hex::encode(&digest));

    if digest != expected {
        bail!("policy digest mismatch");
    }
    println!("policy digests match");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_handle() {
        assert_eq!(parse_handle("0x01500000").unwrap(), 0x01500000);
        assert_eq!(parse_handle("1c00002").unwrap(), 0x01c00002);
        assert!(parse_handle("nope").is_err());
    }

    #[test]
    fn test_args() {
        let args = Args::try_parse_from(["tpm2-probe", "--hash", "sha1", "pcr-read", "0,7"]).unwrap();
        assert!(matches!(args.hash, HashArg::Sha1));
        match args.command {
            Cmd::PcrRead { pcrs } => assert_eq!(pcrs, vec![0, 7]),
            other => panic!("unexpected command {other:?}"),
        }
    }
}

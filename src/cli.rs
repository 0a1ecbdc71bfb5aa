// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use crate::{
    command::Tpm,
    context::{unwrap_context, RestoredContext},
    device::TpmDevice,
    error::ParseError,
    parser::{parse_policy, PolicyExpr},
    pcr::alg_from_str,
    policy::{expr_name, TrialPolicy},
    resource::HandleType,
    util::parse_exact,
};
use anyhow::{bail, Context};
use base64::{engine::general_purpose::STANDARD as base64_engine, Engine};
use clap::{
    builder::styling::{AnsiColor, Color, Style, Styles},
    Args, CommandFactory, Parser, Subcommand,
};
use log::debug;
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};
use tpm2_protocol::data::{TpmAlgId, TpmSu, TpmsContext};

/// Subcommand not requiring TPM device access.
pub trait LocalCommand {
    /// Runs a command.
    ///
    /// # Errors
    ///
    /// Returns an error if the execution fails
    fn run<W: Write>(&self, cli: &Cli, writer: &mut W) -> anyhow::Result<()>;
}

/// Subcommand requiring TPM device access.
pub trait DeviceCommand {
    /// Runs a command.
    ///
    /// # Errors
    ///
    /// Returns an error if the execution fails
    fn run<W: Write>(&self, tpm: &mut Tpm, writer: &mut W) -> anyhow::Result<()>;
}

const STYLES: Styles = Styles::styled()
    .header(Style::new().bold())
    .usage(Style::new().bold())
    .literal(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Green))))
    .placeholder(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Yellow))));

const USAGE_TEMPLATE: &str = "
{about-with-newline}
{usage-heading} {usage}

{options-heading}
{options}
";

const HELP_TEMPLATE: &str = "
{about-with-newline}
{usage-heading} {usage}

{subcommands-heading}
{subcommands}

{options-heading}
{options}
";

/// TPM 2.0 context and policy tool
#[derive(Parser, Debug)]
#[command(version, about, styles = STYLES, help_template = HELP_TEMPLATE)]
pub struct Cli {
    #[arg(
        short = 'd',
        long,
        env = "TPM2CTX_DEVICE",
        default_value = "/dev/tpmrm0",
        global = true,
        help = "TPM device path"
    )]
    pub device: String,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    /// Opens the TPM device.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be opened.
    pub fn open(&self) -> anyhow::Result<Tpm> {
        let device = TpmDevice::open(&self.device)?.with_spinner(true);
        Ok(Tpm::new(device))
    }
}

macro_rules! tpm2ctx_command {
    (
        local: [$($local_command:ident),* $(,)?],
        device: [$($device_command:ident),* $(,)?]
        $(,)?
    ) => {
        #[derive(Subcommand, Debug)]
        pub enum Commands {
            $($local_command($local_command),)*
            $($device_command($device_command),)*
        }

        impl Commands {
            /// Returns `true` if the command does not require TPM device
            /// access.
            #[must_use]
            pub fn is_local(&self) -> bool {
                match self {
                    $(Self::$local_command(_) => true,)*
                    $(Self::$device_command(_) => false,)*
                }
            }

            /// Runs the command, opening the device for device commands.
            ///
            /// # Errors
            ///
            /// Returns an error if opening the device or the execution fails.
            pub fn run<W: Write>(&self, cli: &Cli, writer: &mut W) -> anyhow::Result<()> {
                match self {
                    $(Self::$local_command(args) => LocalCommand::run(args, cli, writer),)*
                    $(
                        Self::$device_command(args) => {
                            let mut tpm = cli.open()?;
                            DeviceCommand::run(args, &mut tpm, writer)
                        }
                    )*
                }
            }
        }
    };
}

tpm2ctx_command!(
    local: [Inspect, Policy],
    device: [Flush, Shutdown, Startup],
);

/// Parses a handle given in hex, with or without the `0x` prefix.
///
/// # Errors
///
/// Returns `ParseError::Int` if the string is not a 32-bit hex number.
pub fn parse_handle(s: &str) -> Result<u32, ParseError> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    Ok(u32::from_str_radix(digits, 16)?)
}

/// Returns true if `expr` can only be evaluated with the help of the TPM.
fn needs_device(expr: &PolicyExpr) -> bool {
    match expr {
        PolicyExpr::Pcr { digest, .. } => digest.is_none(),
        PolicyExpr::Secret { name, .. }
        | PolicyExpr::Signed { name, .. }
        | PolicyExpr::Nv { name, .. } => expr_name(name).is_err(),
        PolicyExpr::Or(items) | PolicyExpr::All(items) => items.iter().any(needs_device),
        _ => false,
    }
}

/// Computes the digest of a policy expression
#[derive(Args, Debug)]
pub struct Policy {
    #[arg(help = "Policy expression (e.g., 'pcr(sha256:0,7); authvalue()')")]
    pub expression: String,

    #[arg(
        long,
        default_value = "sha256",
        value_parser = alg_from_str,
        help = "Policy digest algorithm"
    )]
    pub hash_alg: TpmAlgId,
}

impl LocalCommand for Policy {
    fn run<W: Write>(&self, cli: &Cli, writer: &mut W) -> anyhow::Result<()> {
        let expr = parse_policy(&self.expression)?;
        let trial = if needs_device(&expr) {
            debug!("resolving '{expr}' with {}", cli.device);
            cli.open()?.trial_policy(self.hash_alg, &expr)?
        } else {
            let mut trial = TrialPolicy::new(self.hash_alg)?;
            trial.apply(&expr)?;
            trial
        };
        writeln!(writer, "{}", hex::encode(trial.digest()))?;
        Ok(())
    }
}

/// Reads a saved context in binary or base64 form.
fn read_context(path: &Path) -> anyhow::Result<TpmsContext> {
    let bytes = fs::read(path).with_context(|| format!("'{}'", path.display()))?;
    let raw = match std::str::from_utf8(&bytes) {
        Ok(text) => match base64_engine.decode(text.trim()) {
            Ok(decoded) => decoded,
            Err(_) => bytes,
        },
        Err(_) => bytes,
    };
    parse_exact::<TpmsContext>(&raw)
        .map_err(|e| anyhow::anyhow!("'{}': not a saved context: {e}", path.display()))
}

/// Verifies a saved context and prints its metadata
#[derive(Args, Debug)]
pub struct Inspect {
    #[arg(help = "File holding a saved context, raw or base64")]
    pub file: PathBuf,
}

impl LocalCommand for Inspect {
    fn run<W: Write>(&self, _cli: &Cli, writer: &mut W) -> anyhow::Result<()> {
        let context = read_context(&self.file)?;
        let (restored, _) = unwrap_context(&context)?;
        writeln!(writer, "sequence: {}", context.sequence)?;
        writeln!(writer, "saved-handle: 0x{:08x}", context.saved_handle.0)?;
        writeln!(writer, "hierarchy: {:?}", context.hierarchy)?;
        match restored {
            RestoredContext::Object(object) => {
                writeln!(writer, "type: object")?;
                writeln!(writer, "object-type: {:?}", object.public.object_type)?;
                writeln!(writer, "name-alg: {:?}", object.public.name_alg)?;
                writeln!(writer, "name: {}", hex::encode(&object.name))?;
            }
            RestoredContext::Session(session) => {
                writeln!(writer, "type: {:?} session", session.session_type)?;
                writeln!(writer, "hash-alg: {:?}", session.hash_alg)?;
                writeln!(writer, "bound: {}", session.is_bound)?;
                writeln!(writer, "audit: {}", session.is_audit)?;
                writeln!(writer, "exclusive: {}", session.is_exclusive)?;
                writeln!(writer, "policy-hmac: {:?}", session.policy_hmac_type)?;
                writeln!(writer, "symmetric: {:?}", session.symmetric)?;
            }
        }
        Ok(())
    }
}

/// Runs TPM2_Startup
#[derive(Args, Debug)]
pub struct Startup {
    #[arg(long, help = "Resume the state saved by a shutdown")]
    pub state: bool,
}

impl DeviceCommand for Startup {
    fn run<W: Write>(&self, tpm: &mut Tpm, _writer: &mut W) -> anyhow::Result<()> {
        tpm.startup(if self.state { TpmSu::State } else { TpmSu::Clear })?;
        Ok(())
    }
}

/// Runs TPM2_Shutdown
#[derive(Args, Debug)]
pub struct Shutdown {
    #[arg(long, help = "Save the state for a later startup")]
    pub state: bool,
}

impl DeviceCommand for Shutdown {
    fn run<W: Write>(&self, tpm: &mut Tpm, _writer: &mut W) -> anyhow::Result<()> {
        tpm.shutdown(if self.state { TpmSu::State } else { TpmSu::Clear })?;
        Ok(())
    }
}

/// Flushes a transient object or a session
#[derive(Args, Debug)]
pub struct Flush {
    #[arg(value_parser = parse_handle, help = "Handle (e.g., '0x80000000')")]
    pub handle: u32,
}

impl DeviceCommand for Flush {
    fn run<W: Write>(&self, tpm: &mut Tpm, writer: &mut W) -> anyhow::Result<()> {
        if !matches!(
            HandleType::from_handle(self.handle),
            Some(HandleType::Transient | HandleType::HmacSession | HandleType::PolicySession)
        ) {
            bail!("0x{:08x} cannot be flushed", self.handle);
        }
        tpm.flush_context(self.handle)?;
        writeln!(writer, "0x{:08x}", self.handle)?;
        Ok(())
    }
}

/// Parses command-line arguments and executes the corresponding command.
///
/// # Errors
///
/// Returns an error if opening the device, or executing the command fails.
pub fn execute_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(command) = &cli.command {
        debug!("local: {}", command.is_local());
        command.run(&cli, &mut io::stdout())
    } else {
        Cli::command().help_template(USAGE_TEMPLATE).print_help()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::wrap_context,
        session::{SessionCipher, SessionContext},
        util::build_to_vec,
    };
    use rstest::rstest;
    use tpm2_protocol::{
        data::{TpmRh, TpmSe},
        TpmBuffer, TpmTransient,
    };

    fn cli(command: Commands) -> Cli {
        Cli {
            device: "/nonexistent/tpm".to_string(),
            command: Some(command),
        }
    }

    fn run_local<C: LocalCommand>(command: &C) -> anyhow::Result<String> {
        let cli = cli(Commands::Inspect(Inspect {
            file: PathBuf::new(),
        }));
        let mut out = Vec::new();
        command.run(&cli, &mut out)?;
        Ok(String::from_utf8(out)?)
    }

    fn saved_session() -> TpmsContext {
        let session = SessionContext::new(
            0x0300_0001,
            TpmSe::Policy,
            TpmAlgId::Sha256,
            SessionCipher::Null,
            vec![1; 32],
            vec![2; 32],
            None,
            &[],
        )
        .unwrap();
        let context = TpmsContext {
            sequence: 7,
            saved_handle: TpmTransient(0x0300_0001),
            hierarchy: TpmRh::Null,
            context_blob: TpmBuffer::try_from(&[0xaa; 16][..]).unwrap(),
        };
        wrap_context(&context, &session).unwrap()
    }

    #[rstest]
    #[case("0x80000001", 0x8000_0001)]
    #[case("03000000", 0x0300_0000)]
    fn test_parse_handle(#[case] s: &str, #[case] handle: u32) {
        assert_eq!(parse_handle(s).unwrap(), handle);
    }

    #[rstest]
    #[case("authvalue()", false)]
    #[case("pcr(sha256:0)", true)]
    #[case("secret(tpm://0x40000001)", false)]
    #[case("or(authvalue(), secret(tpm://0x81000001))", true)]
    fn test_needs_device(#[case] input: &str, #[case] expected: bool) {
        assert_eq!(needs_device(&parse_policy(input).unwrap()), expected);
    }

    #[test]
    fn test_policy_offline() {
        let command = Policy {
            expression: "authvalue()".to_string(),
            hash_alg: TpmAlgId::Sha256,
        };
        let out = run_local(&command).unwrap();

        let mut trial = TrialPolicy::new(TpmAlgId::Sha256).unwrap();
        trial.policy_auth_value();
        assert_eq!(out.trim(), hex::encode(trial.digest()));
    }

    #[rstest]
    #[case(false)]
    #[case(true)]
    fn test_inspect(#[case] base64: bool) {
        let bytes = build_to_vec(&saved_session()).unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        if base64 {
            file.write_all(base64_engine.encode(&bytes).as_bytes()).unwrap();
        } else {
            file.write_all(&bytes).unwrap();
        }
        let command = Inspect {
            file: file.path().to_path_buf(),
        };
        let out = run_local(&command).unwrap();
        assert!(out.contains("saved-handle: 0x03000001"));
        assert!(out.contains("type: Policy session"));
    }

    #[test]
    fn test_inspect_tampered() {
        let mut bytes = build_to_vec(&saved_session()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 1;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();
        let command = Inspect {
            file: file.path().to_path_buf(),
        };
        let err = run_local(&command).unwrap_err();
        assert!(err.to_string().starts_with("integrity"));
    }

    #[test]
    fn test_device_command_without_device() {
        let cli = cli(Commands::Flush(Flush {
            handle: 0x8000_0000,
        }));
        let command = cli.command.as_ref().unwrap();
        assert!(!command.is_local());
        assert!(command.run(&cli, &mut Vec::new()).is_err());
    }
}

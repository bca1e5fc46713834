use crate::board::{self, BoardClient, Reading};
use crate::connection::{self, Connection};
use crate::{output, poll, registers};
use futures::StreamExt as _;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not start the async runtime")]
    Runtime(#[source] std::io::Error),
    #[error("could not open the serial connection")]
    Connect(#[source] connection::Error),
    #[error("invalid register target")]
    Target(#[source] registers::Error),
    #[error("board operation failed ({})", .0.kind())]
    Board(#[source] board::Error),
    #[error(transparent)]
    Output(#[from] output::Error),
    #[error("redfish request failed")]
    Redfish(#[source] crate::redfish::Error),
    #[error("could not read {1:?}")]
    ReadFile(#[source] std::io::Error, PathBuf),
    #[error("could not write {1:?}")]
    WriteFile(#[source] std::io::Error, PathBuf),
}

fn runtime() -> Result<tokio::runtime::Runtime, Error> {
    tokio::runtime::Builder::new_multi_thread().enable_all().build().map_err(Error::Runtime)
}

async fn connect(args: connection::Args) -> Result<BoardClient, Error> {
    let slave_id = args.slave_id();
    let connection = Connection::new(args).await.map_err(Error::Connect)?;
    Ok(BoardClient::new(Arc::new(connection), slave_id))
}

/// Run `operation` once, or every `repeat` until Ctrl-C, passing each success to `report`.
///
/// Failures of a repeated operation are logged and the schedule continues.
async fn once_or_every<T, Fut>(
    repeat: Option<humantime::Duration>,
    operation: impl FnMut() -> Fut,
    mut report: impl FnMut(T) -> Result<(), output::Error>,
) -> Result<(), Error>
where
    Fut: Future<Output = Result<T, board::Error>>,
{
    let Some(period) = repeat else {
        let mut operation = operation;
        let value = operation().await.map_err(Error::Board)?;
        return Ok(report(value)?);
    };
    let ticks = poll::periodic(*period, poll::cancel_on_ctrl_c(), operation);
    let mut ticks = std::pin::pin!(ticks);
    while let Some(outcome) = ticks.next().await {
        match outcome {
            Ok(value) => report(value)?,
            Err(e) => warn!(
                message = "operation failed, will retry on the next tick",
                kind = %e.kind(),
                error = (&e as &dyn std::error::Error)
            ),
        }
    }
    Ok(())
}

const READING_HEADERS: [&str; 4] = ["Function", "Address", "Words", "Value"];

fn reading_row(reading: &Reading, signed: bool) -> Vec<String> {
    let words = reading.words.iter().map(|w| w.to_string()).collect::<Vec<_>>().join(", ");
    let value = match (&reading.words[..], signed) {
        _ if reading.function == Some(registers::Function::AnalogMode) => reading
            .value
            .and_then(|v| u16::try_from(v).ok())
            .and_then(registers::AnalogMode::from_repr)
            .map(|mode| <&'static str>::from(mode).to_string())
            .or_else(|| reading.value.map(|v| v.to_string()))
            .unwrap_or_default(),
        ([word], true) => (*word as i16).to_string(),
        ([low, high], true) => crate::wide_value::decode32_signed(*low, *high).to_string(),
        _ => reading.value.map(|v| v.to_string()).unwrap_or_default(),
    };
    vec![
        reading.function.map(|f| f.name()).unwrap_or("-").to_string(),
        reading.address.to_string(),
        words,
        value,
    ]
}

/// Selects one function instance by slot and channel (or analog port).
#[derive(clap::Parser, Clone, Debug)]
#[group(id = "commands::TargetArgs")]
pub struct TargetArgs {
    #[arg(value_enum)]
    function: registers::Function,
    #[arg(long, short = 's', default_value = "0")]
    slot: u16,
    /// Channel index, counted from 0.
    #[arg(long, short = 'c', default_value = "0", conflicts_with = "analog_port")]
    channel: u16,
    /// Analog port, equivalent to `--channel 0..3` for the I/O board analog functions.
    #[arg(long, value_enum)]
    analog_port: Option<registers::AnalogPort>,
}

impl TargetArgs {
    pub fn target(&self) -> Result<registers::Target, Error> {
        let channel = self.analog_port.map(|p| p.channel()).unwrap_or(self.channel);
        registers::Target::new(self.function, self.slot, channel).map_err(Error::Target)
    }
}

pub mod registers_list {
    use super::Error;
    use crate::output;
    use crate::registers::{Board, Function, Mode};
    use strum::VariantArray as _;

    /// Search and output the known board functions.
    #[derive(clap::Parser)]
    pub struct Args {
        /// Only list functions whose name, board, description or address contains this text.
        filter: Option<String>,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(serde::Serialize)]
    pub struct RegisterSchema {
        pub name: Function,
        pub board: Board,
        /// Address of slot 0, channel 0.
        pub address: u16,
        pub width: u16,
        pub channels: u16,
        pub mode: Mode,
        pub description: &'static str,
    }

    impl RegisterSchema {
        pub fn all_registers() -> impl Iterator<Item = Self> {
            Function::VARIANTS.iter().filter_map(|&function| {
                let target = crate::registers::Target::new(function, 0, 0).ok()?;
                Some(RegisterSchema {
                    name: function,
                    board: function.board(),
                    address: target.address(),
                    width: function.width(),
                    channels: function.channels(),
                    mode: function.mode(),
                    description: function.description(),
                })
            })
        }

        pub fn is_match(&self, pattern: &str) -> bool {
            let pattern = pattern.to_lowercase();
            self.name.name().contains(&pattern)
                || self.board.to_string().to_lowercase().contains(&pattern)
                || self.description.to_lowercase().contains(&pattern)
                || self.address.to_string().contains(&pattern)
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let mut output = args.output.to_output()?;
        output.table_headers(vec![
            "Name",
            "Board",
            "Address",
            "Width",
            "Channels",
            "Mode",
            "Description",
        ])?;
        for register in RegisterSchema::all_registers() {
            if let Some(pattern) = &args.filter {
                if !register.is_match(pattern) {
                    continue;
                }
            }
            output.result(
                || {
                    vec![
                        register.name.to_string(),
                        register.board.to_string(),
                        register.address.to_string(),
                        register.width.to_string(),
                        register.channels.to_string(),
                        register.mode.to_string(),
                        register.description.to_string(),
                    ]
                },
                || &register,
            )?;
        }
        Ok(output.commit()?)
    }
}

pub mod read {
    use super::{Error, READING_HEADERS, TargetArgs};
    use crate::{connection, output};

    /// Read the value of a board function.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        target: TargetArgs,
        /// Interpret the value as a two's complement signed integer.
        #[arg(long)]
        signed: bool,
        /// Keep reading at this interval until interrupted.
        #[arg(long, short = 'r')]
        repeat: Option<humantime::Duration>,
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        output: output::Args,
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let Args { target, signed, repeat, connection, output } = args;
        let target = target.target()?;
        let mut output = output.to_output()?;
        output.table_headers(READING_HEADERS.to_vec())?;
        super::runtime()?.block_on(async {
            let board = super::connect(connection).await?;
            super::once_or_every(
                repeat,
                || board.read(target),
                |reading| output.result(|| super::reading_row(&reading, signed), || &reading),
            )
            .await
        })?;
        Ok(output.commit()?)
    }
}

pub mod pressure {
    use super::{Error, READING_HEADERS};
    use crate::registers::Target;
    use crate::{connection, output};

    /// Read an RS-485 pressure sensor attached to an RTD board.
    #[derive(clap::Parser)]
    pub struct Args {
        #[arg(long, short = 's', default_value = "0")]
        slot: u16,
        /// Sensor id, counted from 1.
        #[arg(long, short = 'n')]
        sensor: u16,
        #[arg(long, short = 'r')]
        repeat: Option<humantime::Duration>,
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        output: output::Args,
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let Args { slot, sensor, repeat, connection, output } = args;
        let target = Target::pressure_sensor(slot, sensor).map_err(Error::Target)?;
        let mut output = output.to_output()?;
        output.table_headers(READING_HEADERS.to_vec())?;
        super::runtime()?.block_on(async {
            let board = super::connect(connection).await?;
            super::once_or_every(
                repeat,
                || board.read(target),
                |reading| output.result(|| super::reading_row(&reading, false), || &reading),
            )
            .await
        })?;
        Ok(output.commit()?)
    }
}

pub mod write {
    use super::{Error, TargetArgs};
    use crate::connection;
    use tracing::info;

    /// Write a value to a board function.
    ///
    /// Double register functions take a single 32-bit value which is split low word first.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        target: TargetArgs,
        #[arg(allow_negative_numbers = true)]
        value: i64,
        /// Keep writing the value at this interval until interrupted.
        #[arg(long, short = 'r')]
        repeat: Option<humantime::Duration>,
        #[clap(flatten)]
        connection: connection::Args,
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let target = args.target.target()?;
        let value = args.value;
        super::runtime()?.block_on(async move {
            let board = super::connect(args.connection).await?;
            super::once_or_every(
                args.repeat,
                || board.write_value(target, value),
                |()| {
                    info!(message = "written", %target, value);
                    Ok(())
                },
            )
            .await
        })
    }
}

pub mod analog_mode {
    use super::Error;
    use crate::connection;
    use crate::registers::{AnalogMode, AnalogPort};
    use tracing::info;

    /// Configure an I/O board analog port.
    #[derive(clap::Parser)]
    pub struct Args {
        #[arg(long, short = 's', default_value = "0")]
        slot: u16,
        #[arg(long, value_enum)]
        analog_port: AnalogPort,
        #[arg(value_enum)]
        mode: AnalogMode,
        #[clap(flatten)]
        connection: connection::Args,
    }

    pub fn run(args: Args) -> Result<(), Error> {
        super::runtime()?.block_on(async move {
            let board = super::connect(args.connection).await?;
            board
                .set_analog_mode(args.slot, args.analog_port, args.mode)
                .await
                .map_err(Error::Board)?;
            let mode: &'static str = args.mode.into();
            info!(message = "analog mode set", slot = args.slot, port = ?args.analog_port, mode);
            Ok(())
        })
    }
}

pub mod raw_read {
    use super::{Error, READING_HEADERS};
    use crate::{connection, output};

    /// Read a range of holding registers by address.
    #[derive(clap::Parser)]
    pub struct Args {
        #[arg(long, short = 'a')]
        address: u16,
        #[arg(long, short = 'n', default_value = "1")]
        count: u16,
        #[arg(long, short = 'r')]
        repeat: Option<humantime::Duration>,
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        output: output::Args,
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let Args { address, count, repeat, connection, output } = args;
        let mut output = output.to_output()?;
        output.table_headers(READING_HEADERS.to_vec())?;
        super::runtime()?.block_on(async {
            let board = super::connect(connection).await?;
            super::once_or_every(
                repeat,
                || board.read_raw(address, count),
                |reading| output.result(|| super::reading_row(&reading, false), || &reading),
            )
            .await
        })?;
        Ok(output.commit()?)
    }
}

pub mod raw_write {
    use super::Error;
    use crate::connection;
    use tracing::info;

    /// Write one or more holding registers by address.
    #[derive(clap::Parser)]
    pub struct Args {
        #[arg(long, short = 'a')]
        address: u16,
        /// Register values, written to consecutive addresses.
        #[arg(required = true, num_args = 1..)]
        values: Vec<u16>,
        #[clap(flatten)]
        connection: connection::Args,
    }

    pub fn run(args: Args) -> Result<(), Error> {
        super::runtime()?.block_on(async move {
            let board = super::connect(args.connection).await?;
            board.write_raw(args.address, &args.values).await.map_err(Error::Board)?;
            info!(message = "written", address = args.address, values = ?args.values);
            Ok(())
        })
    }
}

pub mod redfish {
    use super::Error;
    use crate::redfish::{self, Client, CsrArgs};
    use std::io::Write as _;
    use std::path::PathBuf;

    /// Redfish management requests.
    #[derive(clap::Subcommand)]
    pub enum Commands {
        UpdateFirmware(UpdateFirmwareArgs),
        GenerateCsr(GenerateCsrArgs),
        ReplaceCertificate(ReplaceCertificateArgs),
    }

    /// Upload a firmware image as a multipart form.
    #[derive(clap::Parser)]
    pub struct UpdateFirmwareArgs {
        image: PathBuf,
        /// Value of `@Redfish.OperationApplyTime`.
        #[arg(long, default_value = "Immediate")]
        apply_time: String,
        #[clap(flatten)]
        redfish: redfish::Args,
    }

    /// Have the controller generate a key pair and a certificate signing request.
    #[derive(clap::Parser)]
    pub struct GenerateCsrArgs {
        /// Write the PEM encoded CSR here instead of the terminal.
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
        #[clap(flatten)]
        csr: CsrArgs,
        #[clap(flatten)]
        redfish: redfish::Args,
    }

    /// Install a signed PEM certificate.
    #[derive(clap::Parser)]
    pub struct ReplaceCertificateArgs {
        certificate: PathBuf,
        /// Redfish URI of the certificate to replace.
        #[arg(
            long,
            default_value = "/redfish/v1/Managers/Kenmec/NetworkProtocol/HTTPS/Certificates/1"
        )]
        uri: String,
        #[clap(flatten)]
        redfish: redfish::Args,
    }

    pub fn run(command: Commands) -> Result<(), Error> {
        super::runtime()?.block_on(async {
            match command {
                Commands::UpdateFirmware(args) => {
                    let client = Client::new(args.redfish).await.map_err(Error::Redfish)?;
                    let reply = client
                        .upload_firmware(&args.image, &args.apply_time)
                        .await
                        .map_err(Error::Redfish)?;
                    print_reply(&reply)
                }
                Commands::GenerateCsr(args) => {
                    let client = Client::new(args.redfish).await.map_err(Error::Redfish)?;
                    let csr = client.generate_csr(&args.csr).await.map_err(Error::Redfish)?;
                    match &args.output {
                        Some(path) => tokio::fs::write(path, csr.as_bytes())
                            .await
                            .map_err(|e| Error::WriteFile(e, path.clone())),
                        None => std::io::stdout()
                            .lock()
                            .write_all(csr.as_bytes())
                            .map_err(|e| crate::output::Error::WriteStdout(e).into()),
                    }
                }
                Commands::ReplaceCertificate(args) => {
                    let pem = tokio::fs::read_to_string(&args.certificate)
                        .await
                        .map_err(|e| Error::ReadFile(e, args.certificate.clone()))?;
                    let client = Client::new(args.redfish).await.map_err(Error::Redfish)?;
                    let reply = client
                        .replace_certificate(&pem, &args.uri)
                        .await
                        .map_err(Error::Redfish)?;
                    print_reply(&reply)
                }
            }
        })
    }

    fn print_reply(reply: &redfish::Reply) -> Result<(), Error> {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "HTTP {}", reply.status)
            .and_then(|()| writeln!(stdout, "{}", reply.pretty_body()))
            .map_err(|e| crate::output::Error::WriteStdout(e).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::{args, connect as fake_connect, expect_request, reply};
    use clap::Parser as _;
    use registers::{Function, Target};
    use strum::VariantArray as _;

    #[test]
    fn port_selects_the_analog_channel() {
        let args = TargetArgs::parse_from(["t", "ao-current", "--slot", "1", "--analog-port", "c"]);
        let target = args.target().unwrap();
        assert_eq!(target.function(), Function::AoCurrent);
        assert_eq!(target.channel(), 2);
        // 11000 + 100 + 45 + 2 * 2
        assert_eq!(target.address(), 11149);
    }

    #[test]
    fn port_and_channel_conflict() {
        let result =
            TargetArgs::try_parse_from(["t", "ao-current", "--analog-port", "a", "--channel", "1"]);
        assert!(result.is_err());
    }

    #[test]
    fn invalid_target_is_reported() {
        let args = TargetArgs::parse_from(["t", "digital-output", "--channel", "8"]);
        assert!(matches!(args.target(), Err(Error::Target(_))));
    }

    #[test]
    fn readings_render_signed_values() {
        let reading = Reading {
            function: Some(Function::AiVoltage),
            address: 11053,
            words: vec![0xFFFE, 0xFFFF],
            value: Some(0xFFFF_FFFE),
        };
        assert_eq!(reading_row(&reading, false)[3], "4294967294");
        assert_eq!(reading_row(&reading, true)[3], "-2");
        assert_eq!(reading_row(&reading, true)[2], "65534, 65535");
        let raw = Reading { function: None, address: 1, words: vec![1, 2, 3], value: None };
        assert_eq!(reading_row(&raw, false), ["-", "1", "1, 2, 3", ""]);
        let mode = Reading {
            function: Some(Function::AnalogMode),
            address: 11017,
            words: vec![3],
            value: Some(3),
        };
        assert_eq!(reading_row(&mode, false)[3], "ai-current-loop");
    }

    #[test]
    fn register_list_covers_every_function() {
        use registers_list::RegisterSchema;
        let all = RegisterSchema::all_registers().collect::<Vec<_>>();
        assert_eq!(all.len(), Function::VARIANTS.len());
        let duty = all.iter().find(|r| r.name == Function::PwmDuty).unwrap();
        assert_eq!(duty.address, 11506);
        assert!(duty.is_match("RTD"));
        assert!(duty.is_match("11506"));
        assert!(!duty.is_match("coolant"));
    }

    #[derive(clap::Parser)]
    struct RedfishCli {
        #[command(subcommand)]
        command: redfish::Commands,
    }

    #[test]
    fn redfish_client_setup_errors_are_reported() {
        let cli = RedfishCli::parse_from([
            "t",
            "update-firmware",
            "firmware.bin",
            "--ca-cert",
            "/nonexistent/ca.pem",
        ]);
        let result = redfish::run(cli.command);
        assert!(matches!(result, Err(Error::Redfish(crate::redfish::Error::OpenFile(_, _)))));
    }

    #[tokio::test]
    async fn single_shot_failure_is_an_error() {
        let (connection, _bus) = fake_connect(args()).await;
        let board = BoardClient::new(Arc::new(connection), 100);
        let target = Target::new(Function::DigitalInput, 0, 0).unwrap();
        let mut reports = 0;
        let result = once_or_every(None, || board.write_value(target, 1), |()| {
            reports += 1;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::Board(board::Error::NotWritable(_)))));
        assert_eq!(reports, 0);
    }

    #[tokio::test]
    async fn single_shot_success_is_reported() {
        let (connection, mut bus) = fake_connect(args()).await;
        let mut device = bus.next_device().await;
        let board = BoardClient::new(Arc::new(connection), 100);
        tokio::spawn(async move {
            // t2-avg: absolute register 11
            expect_request(&mut device, &[100, 0x03, 0x00, 0x0B, 0x00, 0x01]).await;
            reply(&mut device, &[100, 0x03, 0x02, 0x01, 0x2C]).await;
            device
        });
        let target = Target::new(Function::T2Avg, 0, 0).unwrap();
        let mut values = Vec::new();
        once_or_every(None, || board.read(target), |reading| {
            values.push(reading.value);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(values, [Some(300)]);
    }
}

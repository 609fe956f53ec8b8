//! commandvm - command-partition tool for the ControlVM channel

mod client;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use client::{CommandClient, Reply};
use common::{Environment, setup_logging};
use std::sync::Arc;
use std::time::Duration;
use visorbus::controlvm::{
    CONTROLVM_CRASHMSG_MAX, ChipsetFeatures, ControlVmChannel, ControlVmCommand, ControlVmLayout,
    ControlVmPayload, ControlVmQueue, IrqInfo, SegmentState,
};
use visorbus::header::{VHBA_CHANNEL_TYPE, VNIC_CHANNEL_TYPE};
use visorbus::{Guid, SharedRegion, TracingDiagnostics, paths};

#[derive(Parser)]
#[command(name = "commandvm")]
#[command(about = "Create the ControlVM channel and drive the chipset service through it")]
#[command(version)]
struct Cli {
    /// Backing file of the ControlVM channel
    #[arg(long, env = "CONTROLVM_CHANNEL_PATH", default_value = paths::CONTROLVM_CHANNEL_PATH)]
    path: String,

    /// Request doorbell rung after each request
    #[arg(long, env = "CONTROLVM_REQUEST_SEMAPHORE", default_value = paths::SEMAPHORE_CONTROLVM_REQUEST)]
    doorbell: String,

    /// How long to wait for the final response
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create (or recreate) the channel file and mark it ready
    Create {
        #[arg(long, default_value_t = paths::DEFAULT_PAYLOAD_SIZE as u32)]
        request_payload_bytes: u32,
        #[arg(long, default_value_t = 4096)]
        event_payload_bytes: u32,
    },
    /// Print attachment states, queue counters and the crash pool
    Status,
    #[command(flatten)]
    Request(RequestCommand),
}

/// Subcommands that send one request and wait for its response.
#[derive(Subcommand)]
enum RequestCommand {
    ChipsetInit {
        #[arg(long, default_value_t = 23)]
        bus_count: u32,
        #[arg(long, default_value_t = 0)]
        switch_count: u32,
        /// Raw feature bits
        #[arg(long, default_value_t = 0)]
        features: u32,
    },
    ChipsetReady,
    ChipsetStop,
    Selftest {
        #[arg(long, default_value_t = 0)]
        options: u32,
        #[arg(long, default_value_t = 0)]
        test: u32,
    },
    BusCreate {
        bus_no: u32,
        #[arg(long, default_value_t = 8)]
        dev_count: u32,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value_t = Guid::NIL)]
        instance: Guid,
    },
    BusDestroy {
        bus_no: u32,
    },
    DeviceCreate {
        bus_no: u32,
        dev_no: u32,
        /// Offset of the device channel
        #[arg(long, value_parser = parse_u64)]
        channel_addr: u64,
        #[arg(long, value_parser = parse_u64, default_value = "0x2000")]
        channel_bytes: u64,
        #[arg(long, value_enum, default_value_t = DeviceKind::Vhba)]
        kind: DeviceKind,
        #[arg(long)]
        name: Option<String>,
    },
    DeviceDestroy {
        bus_no: u32,
        dev_no: u32,
    },
    DeviceState {
        bus_no: u32,
        dev_no: u32,
        #[arg(value_enum)]
        state: StateArg,
        /// Target the physical device rather than the virtual one
        #[arg(long)]
        phys: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum DeviceKind {
    Vhba,
    Vnic,
}

impl DeviceKind {
    fn channel_type(self) -> Guid {
        match self {
            DeviceKind::Vhba => VHBA_CHANNEL_TYPE,
            DeviceKind::Vnic => VNIC_CHANNEL_TYPE,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum StateArg {
    Running,
    Paused,
    Standby,
}

impl From<StateArg> for SegmentState {
    fn from(state: StateArg) -> Self {
        match state {
            StateArg::Running => SegmentState::RUNNING,
            StateArg::Paused => SegmentState::PAUSED,
            StateArg::Standby => SegmentState::STANDBY,
        }
    }
}

/// Decimal or `0x`-prefixed hex.
fn parse_u64(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number {s:?}: {e}"))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(Environment::from_env())?;

    let command = match cli.command {
        Command::Create {
            request_payload_bytes,
            event_payload_bytes,
        } => return create(&cli.path, request_payload_bytes, event_payload_bytes),
        Command::Status => return status(&cli.path),
        Command::Request(command) => command,
    };

    let region = SharedRegion::open(&cli.path)
        .with_context(|| format!("Failed to open {} - run `commandvm create` first", cli.path))?;
    let channel = ControlVmChannel::open(region, Arc::new(TracingDiagnostics))
        .context("Not a ControlVM channel")?;
    let client = CommandClient::new(
        channel,
        Duration::from_millis(cli.timeout_ms),
        Duration::from_millis(5),
    );
    #[cfg(feature = "semaphores")]
    let client = client.with_doorbell(&cli.doorbell);

    run(client, command)
}

fn create(path: &str, request_payload_bytes: u32, event_payload_bytes: u32) -> anyhow::Result<()> {
    let layout = ControlVmLayout {
        request_payload_bytes,
        event_payload_bytes,
    };
    let region = SharedRegion::create(path, layout.total_size())
        .with_context(|| format!("Failed to create {path}"))?;
    ControlVmChannel::create(region, &layout, Arc::new(TracingDiagnostics))?;
    println!("Created {path} ({} bytes)", layout.total_size());
    Ok(())
}

fn status(path: &str) -> anyhow::Result<()> {
    let region = SharedRegion::open(path).with_context(|| format!("Failed to open {path}"))?;
    let channel = ControlVmChannel::open(region, Arc::new(TracingDiagnostics))?;

    let state = channel.current_state()?;
    println!("server: {:?}  client: {:?}", state.server, state.client);

    let scalars = channel.scalars()?;
    println!(
        "messages: {} x {} bytes  payload: request {} bytes, event {} bytes",
        scalars.message_count.get(),
        scalars.message_bytes.get(),
        scalars.request_payload_bytes.get(),
        scalars.event_payload_bytes.get(),
    );

    for queue in ControlVmQueue::ALL {
        let stats = channel.queue_stats(queue)?;
        println!(
            "{:<9} head {:>3} tail {:>3}  sent {:>8} received {:>8} overflows {:>6}",
            format!("{queue:?}"),
            stats.head,
            stats.tail,
            stats.num_sent,
            stats.num_received,
            stats.num_overflows,
        );
    }

    for index in 0..CONTROLVM_CRASHMSG_MAX {
        match channel.crash_message(index)? {
            Some(saved) => println!("crash slot {index}: {:?} handle {}", saved.command, saved.handle()),
            None => println!("crash slot {index}: empty"),
        }
    }
    Ok(())
}

fn run(mut client: CommandClient, command: RequestCommand) -> anyhow::Result<()> {
    let (request, payload) = match command {
        RequestCommand::ChipsetInit {
            bus_count,
            switch_count,
            features,
        } => (
            ControlVmCommand::ChipsetInit {
                bus_count,
                switch_count,
                features: ChipsetFeatures::from_bits_retain(features),
                platform_number: 0,
            },
            None,
        ),
        RequestCommand::ChipsetReady => (ControlVmCommand::ChipsetReady, None),
        RequestCommand::ChipsetStop => (ControlVmCommand::ChipsetStop, None),
        RequestCommand::Selftest { options, test } => {
            (ControlVmCommand::ChipsetSelftest { options, test }, None)
        }
        RequestCommand::BusCreate {
            bus_no,
            dev_count,
            name,
            instance,
        } => (
            ControlVmCommand::BusCreate {
                bus_no,
                dev_count,
                channel_addr: 0,
                channel_bytes: 0,
                bus_data_type: Guid::NIL,
                bus_instance: instance,
            },
            name.map(ControlVmPayload::named),
        ),
        RequestCommand::BusDestroy { bus_no } => (ControlVmCommand::BusDestroy { bus_no }, None),
        RequestCommand::DeviceCreate {
            bus_no,
            dev_no,
            channel_addr,
            channel_bytes,
            kind,
            name,
        } => (
            ControlVmCommand::DeviceCreate {
                bus_no,
                dev_no,
                channel_addr,
                channel_bytes,
                data_type: kind.channel_type(),
                dev_instance: Guid::NIL,
                intr: IrqInfo::default(),
            },
            name.map(ControlVmPayload::named),
        ),
        RequestCommand::DeviceDestroy { bus_no, dev_no } => {
            (ControlVmCommand::DeviceDestroy { bus_no, dev_no }, None)
        }
        RequestCommand::DeviceState {
            bus_no,
            dev_no,
            state,
            phys,
        } => (
            ControlVmCommand::DeviceChangeState {
                bus_no,
                dev_no,
                state: state.into(),
                phys_device: phys,
            },
            None,
        ),
    };

    let reply = client.request(request, payload.as_ref())?;
    report(&reply)
}

fn report(reply: &Reply) -> anyhow::Result<()> {
    for event in &reply.events {
        println!("event: {:?}", event.command);
    }
    let response = &reply.response;
    if reply.partials > 0 {
        println!("{} partial completion(s)", reply.partials);
    }
    if response.is_failed() {
        anyhow::bail!(
            "{:?} (handle {}) failed: {}",
            response.id(),
            response.handle(),
            response.status()
        );
    }
    println!(
        "{:?} (handle {}): {}",
        response.id(),
        response.handle(),
        response.status()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_hex_and_decimal() {
        assert_eq!(parse_u64("0x1000"), Ok(0x1000));
        assert_eq!(parse_u64("4096"), Ok(4096));
        assert!(parse_u64("0xzz").is_err());
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_device_create_arguments() {
        let cli = Cli::try_parse_from([
            "commandvm",
            "--path",
            "/tmp/cvm",
            "device-create",
            "1",
            "2",
            "--channel-addr",
            "0x100000",
            "--kind",
            "vnic",
        ])
        .unwrap();
        match cli.command {
            Command::Request(RequestCommand::DeviceCreate {
                bus_no,
                dev_no,
                channel_addr,
                channel_bytes,
                kind,
                ..
            }) => {
                assert_eq!((bus_no, dev_no), (1, 2));
                assert_eq!(channel_addr, 0x10_0000);
                assert_eq!(channel_bytes, 0x2000);
                assert_eq!(kind.channel_type(), VNIC_CHANNEL_TYPE);
            }
            _ => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn test_device_state_maps_to_segment_state() {
        let cli =
            Cli::try_parse_from(["commandvm", "device-state", "0", "3", "paused", "--phys"]).unwrap();
        let Command::Request(RequestCommand::DeviceState { state, phys, .. }) = cli.command else {
            panic!("wrong subcommand");
        };
        assert_eq!(SegmentState::from(state), SegmentState::PAUSED);
        assert!(phys);
    }
}

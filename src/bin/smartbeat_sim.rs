use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use smartbeat::clock::ManualClock;
use smartbeat::config::FabricConfig;
use smartbeat::protocol::{NotificationKind, ServiceInstance, ServiceNotification, ServiceOp, ServiceState};
use smartbeat::smartbeat::TrackedService;
use smartbeat::transport::{FlowId, Inbound, MemoryTransport, Transport};
use smartbeat::{Monitor, ServiceRecord, Smartbeat, SmartbeatController, TimerSet};

const MONITOR_FLOW: FlowId = 1;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Fabric config (JSON); defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of simulated services
    #[arg(short, long, default_value_t = 5)]
    services: u64,

    /// How many of them stop heartbeating partway through
    #[arg(long, default_value_t = 2)]
    silent: u64,

    /// Simulated clock ticks to run
    #[arg(short, long, default_value_t = 40)]
    ticks: u64,

    /// Milliseconds the clock advances per tick
    #[arg(long, default_value_t = 250)]
    tick_ms: u64,

    /// Activity timeout announced by every service
    #[arg(long, default_value_t = 2_000)]
    timeout_ms: u32,
}

/// Hands everything sent towards the monitor flow to the monitor.
fn pump(transport: &MemoryTransport, monitor: &Monitor, peer: SocketAddr) -> Result<usize> {
    let frames = transport.take_frames().context("Failed to drain transport")?;
    let count = frames.len();
    for (flow, frame) in frames {
        let inbound = Inbound::decode(flow, peer, "memory", &frame).context("Failed to decode frame")?;
        monitor.handle(&inbound).context("Monitor rejected sequence")?;
    }
    Ok(count)
}

fn print_table(title: &str, records: &[ServiceRecord]) {
    println!("{title} ({})", records.len());
    println!(
        "  {:<12} {:>6} {:<10} {:>12} {:>10} {:>9} {:>8}",
        "name", "id", "state", "last beat", "checkpoint", "displaced", "inactive"
    );
    for r in records {
        println!(
            "  {:<12} {:>6} {:<10} {:>8}.{:03} {:>10} {:>9} {:>8}",
            r.name,
            r.key.id,
            r.state.as_str(),
            r.received_at.sec,
            r.received_at.usec / 1_000,
            r.smartbeat.checkpoint,
            r.displaced,
            r.inactive
        );
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => FabricConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => FabricConfig::default(),
    };

    let clock = Arc::new(ManualClock::new(1_700_000_000_000_000_000));
    let transport = Arc::new(MemoryTransport::new());
    let local: SocketAddr = "127.0.0.1:7001".parse()?;
    transport.connect(MONITOR_FLOW, local)?;

    let timers = TimerSet::create(clock.clone(), config.timers.max_preallocated, None)?;
    let monitor = Monitor::new(clock.clone(), &config.monitor);
    monitor.start_sweeps(&timers, config.monitor.sweep_interval_ms)?;
    let controller = SmartbeatController::new(transport.clone(), clock.clone(), config.smartbeat.interval_ms);

    info!(
        "Simulating {} services ({} going silent) for {} ticks of {} ms",
        args.services, args.silent, args.ticks, args.tick_ms
    );

    let mut tracked = Vec::new();
    for id in 1..=args.services {
        let mut notification = ServiceNotification::new(NotificationKind::Create);
        notification.instance = Some(ServiceInstance {
            op: ServiceOp::Create,
            id,
            service_type: 1,
            state: ServiceState::Running,
            activity_timeout_ms: args.timeout_ms,
            smartbeat: Smartbeat::now(&*clock, 0),
        });
        notification.name = Some(format!("service-{id}"));
        notification.reporting_addr = Some(local);
        transport.send(MONITOR_FLOW, &notification.to_sequence()?)?;

        let service = TrackedService::new(id, vec![MONITOR_FLOW]);
        controller.add_service(service.clone(), &timers)?;
        tracked.push(service);
    }
    pump(&transport, &monitor, local)?;

    let silence_at = args.ticks / 3;
    for tick in 0..args.ticks {
        if tick == silence_at {
            for service in tracked.iter().rev().take(args.silent as usize) {
                info!("Service {} stops heartbeating", service.id());
                controller.remove_service(service.id())?;
            }
        }
        for service in &tracked {
            service.bump_checkpoint();
        }
        clock.advance_ms(args.tick_ms);
        timers.dispatch(0)?;
        pump(&transport, &monitor, local)?;
    }

    print_table("Active", &monitor.services().active()?);
    print_table("History", &monitor.services().history()?);
    Ok(())
}

// Process entry: open the host link, pick the motor backend, start the
// firmware and serve the host until the link closes or Ctrl-C
//
// With --motor-port the wheels are SimplexMotion motors on an RS-485 bus,
// otherwise simulated motors on an in-process CAN bus.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::bus::{CanBus, ModbusMaster, SerialPortLine, spawn_receive_task};
use crate::comm::{CommandChannel, MessageSender, SerialTransport, Transport};
use crate::config::{DRIVE_PERIOD, FirmwareConfig, HOST_BAUDRATE, HOST_PORT, MOTOR_BAUDRATE, MotorConfig, OUTBOX_DEPTH};
use crate::drive::simplex::{CanRegisters, ModbusRegisters, SimplexConfig, SimplexMotion};
use crate::drive::{Drive, DriveMotor};
use crate::firmware::{Firmware, LogIndicator};
use crate::protocol::Message;
use crate::sim::{SimulatedMotors, WheelOdometry};

// Inter-frame silence on the RS-485 bus
const MODBUS_SILENCE: Duration = Duration::from_millis(2);

type Error = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Parser)]
#[command(version, about = "BILBO balancing robot firmware core")]
pub struct Args {
    /// JSON configuration file, defaults are used for missing fields
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Host serial port
    #[arg(long, default_value = HOST_PORT)]
    pub port: String,

    #[arg(long, default_value_t = HOST_BAUDRATE)]
    pub baud: u32,

    /// RS-485 motor bus; simulated CAN motors if omitted
    #[arg(long)]
    pub motor_port: Option<String>,

    #[arg(long, default_value_t = MOTOR_BAUDRATE)]
    pub motor_baud: u32,

    /// Serve the bulk channel on this TCP address
    #[arg(long)]
    pub bulk: Option<SocketAddr>,
}

fn simplex_configs(motors: &MotorConfig) -> (SimplexConfig, SimplexConfig) {
    (
        SimplexConfig {
            direction: motors.left_direction as f32,
            torque_limit: motors.torque_limit,
        },
        SimplexConfig {
            direction: motors.right_direction as f32,
            torque_limit: motors.torque_limit,
        },
    )
}

pub async fn run(args: Args) -> Result<(), Error> {
    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            FirmwareConfig::load(path)?
        }
        None => FirmwareConfig::default(),
    };

    let (sender, outbox) = MessageSender::channel(OUTBOX_DEPTH);
    let transport = SerialTransport::open(&args.port, args.baud)?;
    let (left_config, right_config) = simplex_configs(&config.motors);

    match &args.motor_port {
        Some(port) => {
            let line = SerialPortLine::open(port, args.motor_baud, MODBUS_SILENCE)?;
            let (master, _poll) = ModbusMaster::spawn(line, config.modbus_timeout());
            let left = SimplexMotion::new(ModbusRegisters::new(master.clone(), config.motors.left_id), left_config);
            let right = SimplexMotion::new(ModbusRegisters::new(master, config.motors.right_id), right_config);
            let drive = Drive::new(left, right, config.drive_period());
            serve(config, args.bulk, drive, transport, sender, outbox).await
        }
        None => {
            info!("No motor port given, using simulated motors");
            let (sim, frames) = SimulatedMotors::new(&[config.motors.left_id, config.motors.right_id]);
            let bus = Arc::new(CanBus::with_timeout(sim.clone(), config.can_timeout()));
            let _receive = spawn_receive_task(Arc::clone(&bus), frames);
            let _dynamics = sim.spawn_dynamics(DRIVE_PERIOD);

            let left = SimplexMotion::new(CanRegisters::new(Arc::clone(&bus), config.motors.left_id), left_config);
            let right = SimplexMotion::new(CanRegisters::new(bus, config.motors.right_id), right_config);
            let drive = Drive::new(left, right, config.drive_period());
            serve(config, args.bulk, drive, transport, sender, outbox).await
        }
    }
}

async fn serve<M: DriveMotor, T: Transport>(
    config: FirmwareConfig,
    bulk: Option<SocketAddr>,
    drive: Drive<M>,
    transport: T,
    sender: MessageSender,
    outbox: tokio::sync::mpsc::Receiver<Message>,
) -> Result<(), Error> {
    let ack_writes = config.ack_writes;
    let estimator = Arc::new(WheelOdometry::new(drive.handle()));
    let firmware = Arc::new(Firmware::new(
        config,
        estimator,
        drive.handle(),
        sender,
        Arc::new(LogIndicator),
        None,
    ));

    let mut channel = CommandChannel::new().with_write_ack(ack_writes);
    channel.add_map(Arc::new(firmware.register_map()?));
    let mut channel_task = tokio::spawn(channel.run(transport, outbox));

    if let Some(addr) = bulk {
        let listener = TcpListener::bind(addr).await?;
        info!("Bulk channel listening on {}", addr);
        let firmware = Arc::clone(&firmware);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        info!("Bulk connection from {}", peer);
                        if let Err(e) = firmware.bulk_channel().run(stream).await {
                            warn!("Bulk connection failed: {}", e);
                        }
                    }
                    Err(e) => {
                        error!("Bulk listener failed: {}", e);
                        return;
                    }
                }
            }
        });
    }

    let tasks = firmware.start(drive).await?;

    let result: Result<(), Error> = tokio::select! {
        joined = &mut channel_task => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(e.into()),
        },
        signal = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            signal.map_err(Into::into)
        }
    };

    firmware.shutdown();
    if let Err(e) = tasks.drive.await {
        warn!("Drive task failed: {}", e);
    }
    tasks.control.abort();
    tasks.supervisor.abort();
    channel_task.abort();
    result
}

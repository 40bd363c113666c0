use std::collections::VecDeque;
use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tether::{
    BitMessage, Connection, PacketLossSimulation, DEFAULT_PROTOCOL_ID, DEFAULT_TIMEOUT_MS,
    MAX_PACKET_SIZE,
};

#[derive(Parser)]
#[command(name = "tether-echo", about = "UDP echo over a tether connection")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Maximum outgoing rate in bytes per second (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    max_rate: u32,

    /// Ticks per second for the send/receive loop
    #[arg(long, default_value_t = 30)]
    tick_rate: u32,

    /// Simulated outgoing packet loss percentage
    #[arg(long, default_value_t = 0.0)]
    loss: f32,
}

#[derive(Subcommand)]
enum Command {
    /// Wait for a client and echo its payloads back
    Server {
        #[arg(long, default_value_t = 27800)]
        port: u16,
    },
    /// Connect to a server and send a payload every tick
    Client {
        #[arg(long)]
        connect: SocketAddr,

        #[arg(long, default_value = "ping")]
        payload: String,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut conn = Connection::new(DEFAULT_PROTOCOL_ID, DEFAULT_TIMEOUT_MS);
    conn.set_max_outgoing_rate(cli.max_rate);
    if cli.loss > 0.0 {
        conn.set_loss_simulation(PacketLossSimulation {
            enabled: true,
            loss_percent: cli.loss,
        });
    }

    let outgoing = match &cli.command {
        Command::Server { port } => {
            conn.start(*port)?;
            conn.listen();
            None
        }
        Command::Client { connect, payload } => {
            conn.start(0)?;
            conn.connect(*connect);
            Some(payload.clone())
        }
    };

    let tick = Duration::from_millis(1000 / cli.tick_rate.max(1) as u64);
    let started = Instant::now();
    let mut last_report = Instant::now();
    let mut incoming = BitMessage::with_capacity(MAX_PACKET_SIZE);
    let mut echo_pending: VecDeque<String> = VecDeque::new();

    loop {
        let now = started.elapsed().as_millis() as u32;

        while let Some(_size) = conn.receive_message(&mut incoming, now)? {
            let text = incoming.read_string(256);
            match &outgoing {
                Some(_) => log::info!("echo: {text}"),
                None => echo_pending.push_back(text),
            }
        }

        if conn.is_connect_fail() {
            anyhow::bail!("connect failed");
        }

        if conn.remote_address().is_some() && conn.ready_to_send(now) {
            let mut msg = BitMessage::with_capacity(512);
            match &outgoing {
                Some(payload) => msg.write_string(payload, 256, true)?,
                None => {
                    if let Some(text) = echo_pending.pop_front() {
                        msg.write_string(&text, 256, true)?;
                    }
                }
            }
            if !msg.is_empty() {
                conn.send_message(&msg, now)?;
            }
        }

        conn.update(tick.as_millis() as u32);

        if last_report.elapsed() >= Duration::from_secs(1) && conn.is_connected() {
            last_report = Instant::now();
            log::info!(
                "rtt {:.1} ms, out {} B/s, in {} B/s, loss {:.1}%",
                conn.round_trip_time(),
                conn.outgoing_rate(),
                conn.incoming_rate(),
                conn.incoming_packet_loss()
            );
        }

        thread::sleep(tick);
    }
}

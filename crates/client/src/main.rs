mod drawer;
mod input;
mod session;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use input::{InputSource, NullInput};
use session::Session;
use tumble::level::{build_world, load_level};
use tumble::net::{Packet, PlayerIntro, connect};

const FRAME_RATE: f64 = 60.0;

#[derive(Parser)]
#[command(name = "tumble-client")]
#[command(about = "Tumble game client")]
struct Args {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run a level offline, no networking.
    Local { level: PathBuf },
    /// Join a server.
    Client {
        host: String,
        port: u16,
        #[arg(long, default_value = "Player")]
        name: String,
        /// Player colour as `r,g,b`.
        #[arg(long, default_value = "200,60,60")]
        colour: String,
    },
}

fn parse_colour(text: &str) -> Result<[u8; 3]> {
    let parts: Vec<&str> = text.split(',').collect();
    if parts.len() != 3 {
        bail!("colour must be r,g,b");
    }
    let channel = |part: &str| part.trim().parse::<u8>().context("bad colour channel");
    Ok([channel(parts[0])?, channel(parts[1])?, channel(parts[2])?])
}

fn pace(next_frame: &mut Instant, frame: Duration) {
    let now = Instant::now();
    if *next_frame > now {
        std::thread::sleep(*next_frame - now);
    }
    *next_frame += frame;
}

fn run_local(level_path: &PathBuf) -> Result<()> {
    let level = load_level(level_path)
        .with_context(|| format!("failed to load level {}", level_path.display()))?;
    let mut world = build_world(&level)?;
    let slot = world.add_player("Player", [200, 60, 60]);
    let mut input = NullInput;

    log::info!("running {} offline", level_path.display());
    let frame = Duration::from_secs_f64(1.0 / FRAME_RATE);
    let mut next_frame = Instant::now() + frame;
    loop {
        world.set_player_action(slot, input.action(0));
        world.update(1.0);
        pace(&mut next_frame, frame);
    }
}

fn run_client(host: &str, port: u16, name: &str, colour: [u8; 3]) -> Result<()> {
    let players = vec![(name.to_string(), colour)];
    let intro = Packet::InitConnectionServer {
        players: players
            .iter()
            .map(|(name, colour)| PlayerIntro {
                name: name.clone(),
                colour: *colour,
            })
            .collect(),
    };

    // A couple of patient retries, then give up.
    let mut connection = None;
    for timeout in [3u64, 5, 5] {
        match connect(
            (host, port),
            Duration::from_secs(timeout),
            Some(&intro),
        ) {
            Ok(established) => {
                connection = Some(established);
                break;
            }
            Err(e) => log::warn!("failed to connect to {}:{}: {}", host, port, e),
        }
    }
    let Some(connection) = connection else {
        bail!("could not reach {}:{}", host, port);
    };
    log::info!("connected to {}:{}", host, port);

    let mut session = Session::new(connection, &players);
    let mut input = NullInput;

    let frame = Duration::from_secs_f64(1.0 / FRAME_RATE);
    let mut next_frame = Instant::now() + frame;
    loop {
        if let Err(e) = session.update(&mut input) {
            log::error!("{}", e);
            break;
        }
        pace(&mut next_frame, frame);
    }

    let _ = session.connection.send(&Packet::Disconnect {
        reason: "Logged Off".to_string(),
    });
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match args.mode {
        Mode::Local { level } => run_local(&level),
        Mode::Client {
            host,
            port,
            name,
            colour,
        } => run_client(&host, port, &name, parse_colour(&colour)?),
    }
}

mod server;
mod sync;

use std::path::PathBuf;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;

use server::Server;
use tumble::level::{build_world, load_level};
use tumble::script::validate;

const TICK_RATE: f64 = 60.0;

#[derive(Parser)]
#[command(name = "tumble-server")]
#[command(about = "Authoritative tumble server")]
struct Args {
    /// Level file to host.
    level: PathBuf,

    #[arg(default_value_t = 7777)]
    port: u16,
}

/// Operator commands arrive on stdin from a helper thread so the tick
/// loop never blocks.
fn stdin_commands() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            let mut line = String::new();
            loop {
                line.clear();
                match std::io::stdin().read_line(&mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if tx.send(line.trim().to_string()).is_err() {
                            break;
                        }
                    }
                }
            }
        })
        .expect("failed to spawn the stdin thread");
    rx
}

fn warn_on_unsafe_script(level: &tumble::level::LevelFile) {
    for (label, script) in [
        ("server", level.server_script.as_deref()),
        ("client", level.client_script.as_deref()),
    ] {
        if let Some(source) = script {
            if let Some(violation) = validate(source) {
                log::warn!(
                    "this level has a potentially dangerous {} script: {}",
                    label,
                    violation
                );
            }
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut level_path = args.level.clone();
    let mut level = load_level(&level_path)
        .with_context(|| format!("failed to load level {}", level_path.display()))?;
    warn_on_unsafe_script(&level);

    let world = build_world(&level)?;
    let mut server = Server::new(world, level.client_script.clone(), args.port)?;
    log::info!("server listening on {}", server.local_addr()?);

    let commands = stdin_commands();
    let tick_duration = Duration::from_secs_f64(1.0 / TICK_RATE);
    let mut next_tick = Instant::now() + tick_duration;

    let mut running = true;
    while running {
        while let Ok(line) = commands.try_recv() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            match parts.as_slice() {
                ["r"] => {
                    log::info!("refreshing level");
                    match build_world(&level) {
                        Ok(world) => server.set_world(world, level.client_script.clone()),
                        Err(e) => log::error!("level reload failed: {}", e),
                    }
                }
                ["l", path] => {
                    let candidate = PathBuf::from(*path);
                    match load_level(&candidate) {
                        Ok(loaded) => {
                            warn_on_unsafe_script(&loaded);
                            match build_world(&loaded) {
                                Ok(world) => {
                                    server.set_world(world, loaded.client_script.clone());
                                    level = loaded;
                                    level_path = candidate;
                                    log::info!("switched to level {}", level_path.display());
                                }
                                Err(e) => log::error!("level build failed: {}", e),
                            }
                        }
                        Err(e) => log::error!("level doesn't exist or is unreadable: {}", e),
                    }
                }
                ["p"] => {
                    server.paused = !server.paused;
                    log::info!(
                        "{} server",
                        if server.paused { "pausing" } else { "unpausing" }
                    );
                }
                ["s"] => {
                    let lines = server.status();
                    if lines.is_empty() {
                        println!("no players");
                    } else {
                        for line in lines {
                            println!("{}", line);
                        }
                    }
                }
                ["q"] => running = false,
                [] => {}
                _ => println!("invalid command (r, l <path>, p, s, q)"),
            }
        }

        server.update();

        let now = Instant::now();
        if next_tick > now {
            std::thread::sleep(next_tick - now);
        }
        next_tick += tick_duration;
    }

    log::info!("stopping server");
    server.stop("Server stopped");
    Ok(())
}

use std::io::Write;
use std::process;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::time::MissedTickBehavior;

use marionette::{Agent, AgentConfig, Host, Sentinel};
use marionette_sim::Scene;
use marionette_sim::logging::init_tracing;

#[derive(Debug, Default)]
struct Args {
    host: Option<String>,
    port: Option<u16>,
    unsafe_mode: bool,
    fps: Option<u32>,
    display: bool,
    frames: Option<u64>,
}

const USAGE: &str = "\
Usage: marionette-sim [options]

Options:
  --host <addr>      Listen address [default: $MARIONETTE_HOST or 127.0.0.1]
  --port <port>      Listen port, 0 picks one [default: $MARIONETTE_PORT or 9080]
  --unsafe           Enable evaluate, wait_for_condition and call_method
  --fps <n>          Frame rate [default: 60]
  --display          Pretend a display exists (enables screenshot)
  --headless         No display [default]
  --frames <n>       Exit after n frames";

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args::default();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                i += 1;
                parsed.host = Some(args.get(i).ok_or("--host requires a value")?.clone());
            }
            "--port" => {
                i += 1;
                let raw = args.get(i).ok_or("--port requires a value")?;
                parsed.port = Some(raw.parse().map_err(|_| format!("invalid port: {raw}"))?);
            }
            "--fps" => {
                i += 1;
                let raw = args.get(i).ok_or("--fps requires a value")?;
                let fps: u32 = raw.parse().map_err(|_| format!("invalid fps: {raw}"))?;
                if fps == 0 {
                    return Err("--fps must be at least 1".to_string());
                }
                parsed.fps = Some(fps);
            }
            "--frames" => {
                i += 1;
                let raw = args.get(i).ok_or("--frames requires a value")?;
                parsed.frames = Some(raw.parse().map_err(|_| format!("invalid frame count: {raw}"))?);
            }
            "--unsafe" => parsed.unsafe_mode = true,
            "--display" => parsed.display = true,
            "--headless" | "--no-display" => parsed.display = false,
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(parsed)
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let argv: Vec<String> = std::env::args().collect();
    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(args).await {
        tracing::error!(error = format!("{e:#}"), "Simulator failed");
        process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = AgentConfig::from_env();
    if let Some(host) = args.host {
        config = config.with_host(host);
    }
    if let Some(port) = args.port {
        config = config.with_port(port);
    }
    if args.unsafe_mode {
        config = config.with_unsafe_mode(true);
    }
    let requested_port = config.port;

    let (mut agent, listener) = match Agent::bind(config).await {
        Ok(bound) => bound,
        Err(e) => {
            announce(&Sentinel::Error {
                port: requested_port,
                reason: e.to_string(),
            })?;
            return Err(e).context("failed to bind automation listener");
        }
    };
    let port = listener.local_addr().port();
    announce(&Sentinel::Ready { port })?;

    let mut scene = Scene::demo().with_display(args.display);
    let fps = args.fps.unwrap_or(60);
    let dt = 1.0 / f64::from(fps);
    tracing::info!(
        port,
        fps,
        display = scene.has_display(),
        unsafe_mode = agent.config().unsafe_mode,
        "Simulator running"
    );

    let mut frames = tokio::time::interval(Duration::from_secs_f64(dt));
    frames.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            _ = frames.tick() => {
                scene.step(dt);
                agent.tick(&mut scene, Instant::now());
                if args.frames.is_some_and(|limit| scene.frame_count() >= limit) {
                    tracing::info!(frames = scene.frame_count(), "Frame limit reached");
                    break;
                }
            }
        }
    }

    agent.shutdown(&mut scene);
    listener.shutdown();
    Ok(())
}

/// Sentinels go to stdout, flushed, so a launcher reading lines sees them at once.
fn announce(sentinel: &Sentinel) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{sentinel}")?;
    stdout.flush()?;
    Ok(())
}

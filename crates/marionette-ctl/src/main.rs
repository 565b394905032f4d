use std::process;

use marionette::ClientError;
use marionette_ctl::error::CtlError;
use marionette_ctl::{parse_args, run};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "\
Usage: marionette-ctl [--host <addr>] [--port <port>] [--timeout <ms>] <method> [params-json]

Arguments:
  <method>         Protocol method, e.g. ping, get_scene_tree, press_action
  [params-json]    Parameters as a JSON object [default: none]

Options:
  --host <addr>    Agent address [default: $MARIONETTE_HOST or 127.0.0.1]
  --port <port>    Agent port [default: $MARIONETTE_PORT or 9080]
  --timeout <ms>   Per-request timeout [default: 30000]";

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("MARIONETTE_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let invocation = match parse_args(&args) {
        Ok(inv) => inv,
        Err(e) => exit_with(e),
    };

    match run(&invocation).await {
        Ok(result) => match serde_json::to_string_pretty(&result) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("error: JSON serialization failed: {e}");
                process::exit(1);
            }
        },
        Err(e) => exit_with(e),
    }
}

fn exit_with(err: CtlError) -> ! {
    match &err {
        CtlError::Usage(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
        }
        CtlError::Client(ClientError::Rpc {
            data: Some(data), ..
        }) => {
            eprintln!("error: {err}");
            eprintln!("{data}");
        }
        other => eprintln!("error: {other}"),
    }
    process::exit(err.exit_code());
}

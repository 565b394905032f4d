pub mod error;

use std::time::Duration;

use serde_json::Value;

use marionette::{Client, ClientConfig, ClientError};

use crate::error::{CtlError, Result};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 9080;

/// One parsed command line.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub host: String,
    pub port: u16,
    pub timeout: Option<Duration>,
    pub method: String,
    pub params: Value,
}

/// Parse `[--host H] [--port P] [--timeout MS] <method> [params-json]`.
///
/// `MARIONETTE_HOST` and `MARIONETTE_PORT` supply the defaults; flags win.
pub fn parse_args(args: &[String]) -> Result<Invocation> {
    parse_args_with_env(args, |key| std::env::var(key).ok())
}

fn parse_args_with_env(args: &[String], env: impl Fn(&str) -> Option<String>) -> Result<Invocation> {
    let usage = CtlError::Usage;
    let mut host = env("MARIONETTE_HOST")
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let mut port = DEFAULT_PORT;
    if let Some(raw) = env("MARIONETTE_PORT") {
        match raw.parse::<u16>() {
            Ok(value) => port = value,
            Err(e) => tracing::warn!(value = %raw, error = %e, "Ignoring invalid MARIONETTE_PORT"),
        }
    }
    let mut timeout = None;
    let mut positional: Vec<&str> = Vec::new();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                i += 1;
                host = args
                    .get(i)
                    .ok_or_else(|| usage("--host requires a value".into()))?
                    .clone();
            }
            "--port" => {
                i += 1;
                let raw = args.get(i).ok_or_else(|| usage("--port requires a value".into()))?;
                port = raw.parse().map_err(|_| usage(format!("invalid port: {raw}")))?;
            }
            "--timeout" => {
                i += 1;
                let raw = args
                    .get(i)
                    .ok_or_else(|| usage("--timeout requires a value".into()))?;
                let ms: u64 = raw.parse().map_err(|_| usage(format!("invalid timeout: {raw}")))?;
                timeout = Some(Duration::from_millis(ms));
            }
            "--help" | "-h" => return Err(usage(String::new())),
            arg if arg.starts_with("--") => return Err(usage(format!("unknown flag: {arg}"))),
            arg => positional.push(arg),
        }
        i += 1;
    }

    let (method, params) = match positional.as_slice() {
        [] => return Err(usage("missing required argument: <method>".into())),
        [method] => (*method, Value::Null),
        [method, params] => {
            let params: Value = serde_json::from_str(params)
                .map_err(|e| CtlError::InvalidParams(e.to_string()))?;
            if !params.is_object() {
                return Err(CtlError::InvalidParams(format!("got {params}")));
            }
            (*method, params)
        }
        [_, _, extra, ..] => return Err(usage(format!("unexpected argument: {extra}"))),
    };

    Ok(Invocation {
        host,
        port,
        timeout,
        method: method.to_string(),
        params,
    })
}

/// Connect, handshake, send one request and disconnect.
pub async fn run(invocation: &Invocation) -> Result<Value> {
    let mut config = ClientConfig::new(invocation.host.clone(), invocation.port);
    if let Some(timeout) = invocation.timeout {
        config = config.with_request_timeout(timeout);
    }
    let client = Client::connect(&config).await?;
    tracing::debug!(
        session = %client.capabilities().session,
        method = %invocation.method,
        "Connected"
    );

    let result: Result<Value> = if invocation.method == "hello" {
        serde_json::to_value(client.capabilities())
            .map_err(|e| ClientError::Protocol(e.to_string()).into())
    } else {
        client
            .request(&invocation.method, invocation.params.clone())
            .await
            .map_err(CtlError::from)
    };
    client.disconnect().await;
    result
}

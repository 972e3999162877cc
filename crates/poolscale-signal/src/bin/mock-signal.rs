//! Mock signal worker for tests.
//!
//! Connects to the socket named by `POOLSCALE_SIGNAL_SOCKET` and speaks the
//! worker protocol. Its behavior comes from the init parameters:
//!
//! - `mode`: `ok` (default), `decline`, `no_ack`, `nack`, `exit_on_init`,
//!   `slow`, `crash`, `garbage`
//! - `cpus`: fixed CPU request to answer with
//! - `metric`: answer with the latest value of this metric instead
//! - `delay_ms`: how long `slow` sleeps before answering (default 60000)

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use serde_json::{json, Value};

fn main() {
    let path = match std::env::var("POOLSCALE_SIGNAL_SOCKET") {
        Ok(path) => path,
        Err(_) => {
            eprintln!("POOLSCALE_SIGNAL_SOCKET is not set");
            std::process::exit(2);
        }
    };
    let stream = match UnixStream::connect(&path) {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("connect {path}: {e}");
            std::process::exit(2);
        }
    };
    if let Err(e) = serve(stream) {
        eprintln!("mock-signal: {e}");
        std::process::exit(1);
    }
}

fn serve(stream: UnixStream) -> std::io::Result<()> {
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);

    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(());
    }
    let init: Value = serde_json::from_str(&line).unwrap_or(Value::Null);
    let params = init.get("parameters").cloned().unwrap_or_else(|| json!({}));
    let mode = params.get("mode").and_then(Value::as_str).unwrap_or("ok").to_string();
    println!(
        "mock-signal ready for pool {} in {}",
        init["pool"].as_str().unwrap_or("?"),
        init["cluster"].as_str().unwrap_or("?")
    );

    match mode.as_str() {
        "no_ack" => {
            std::thread::sleep(Duration::from_secs(600));
            return Ok(());
        }
        "exit_on_init" => std::process::exit(3),
        "nack" => writeln!(writer, "{}", json!({"ack": false}))?,
        _ => writeln!(writer, "{}", json!({"ack": true}))?,
    }

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let request: Value = serde_json::from_str(&line).unwrap_or(Value::Null);
        match mode.as_str() {
            "crash" => {
                eprintln!("mock-signal crashing on purpose");
                std::process::exit(101);
            }
            "garbage" => writeln!(writer, "this is not json")?,
            "slow" => {
                let delay = params.get("delay_ms").and_then(Value::as_u64).unwrap_or(60_000);
                std::thread::sleep(Duration::from_millis(delay));
                writeln!(writer, "{}", answer(&params, &request))?;
            }
            "decline" => writeln!(writer, "{}", json!({"Resources": {"cpus": null}}))?,
            _ => writeln!(writer, "{}", answer(&params, &request))?,
        }
        writer.flush()?;
    }
}

fn answer(params: &Value, request: &Value) -> Value {
    if let Some(metric) = params.get("metric").and_then(Value::as_str) {
        let latest = request["metrics"][metric]
            .as_array()
            .and_then(|series| series.last())
            .and_then(|pair| pair[1].as_f64());
        return json!({"Resources": {"cpus": latest}});
    }
    let cpus = params.get("cpus").and_then(Value::as_f64).unwrap_or(0.0);
    json!({"Resources": {"cpus": cpus}})
}

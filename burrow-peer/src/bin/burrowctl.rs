//! burrowctl: thin command-line client for the peer daemon's control
//! surface. Sends one JSON request line over loopback TCP and prints the
//! reply.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;

use serde_json::json;

const DEFAULT_CONTROL_PORT: u16 = 48450;

const USAGE: &str = "usage: burrowctl [--port N] <command>
commands:
  backup <file-path> <replication>   replicate a file across the group
  restore <file-path>                request a backed-up file back
  delete <file-path>                 drop a file from every holder
  reclaim <target-bytes>             evict chunks down to a space target
  state                              dump the peer's ledger and space use";

fn main() {
    match run() {
        Ok(()) => {}
        Err(err) => {
            eprintln!("burrowctl: {err}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();

    let mut port = DEFAULT_CONTROL_PORT;
    if args.first().map(String::as_str) == Some("--port") {
        if args.len() < 2 {
            return Err(USAGE.into());
        }
        port = args[1].parse()?;
        args.drain(..2);
    }
    if let Ok(s) = std::env::var("BURROW_CONTROL_PORT") {
        if let Ok(p) = s.parse() {
            port = p;
        }
    }

    let request = match args.first().map(String::as_str) {
        Some("backup") if args.len() == 3 => json!({
            "op": "backup",
            "file_path": args[1],
            "replication": args[2].parse::<u32>()?,
        }),
        Some("restore") if args.len() == 2 => json!({
            "op": "restore",
            "file_path": args[1],
        }),
        Some("delete") if args.len() == 2 => json!({
            "op": "delete",
            "file_path": args[1],
        }),
        Some("reclaim") if args.len() == 2 => json!({
            "op": "reclaim",
            "target_bytes": args[1].parse::<u64>()?,
        }),
        Some("state") if args.len() == 1 => json!({ "op": "state" }),
        _ => return Err(USAGE.into()),
    };

    let mut stream = TcpStream::connect(("127.0.0.1", port))
        .map_err(|err| format!("cannot reach daemon on port {port}: {err}"))?;
    let mut line = serde_json::to_string(&request)?;
    line.push('\n');
    stream.write_all(line.as_bytes())?;

    let mut reply = String::new();
    BufReader::new(stream).read_line(&mut reply)?;
    if reply.trim().is_empty() {
        return Err("daemon closed the connection without replying".into());
    }
    let value: serde_json::Value = serde_json::from_str(&reply)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    if value.get("status").and_then(|s| s.as_str()) == Some("error") {
        std::process::exit(2);
    }
    Ok(())
}

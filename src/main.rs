//! STRATUM - LSM-Tree Key-Value Storage Engine
//! Interactive shell that drives the engine through the command dispatcher.
//!
//! Usage: `stratum [STORE_DIR]`

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use stratum::{CommandType, Config, StorageCommand, StorageCommandDispatcher, Stratum};

fn main() {
    env_logger::init();

    println!();
    println!("  ╔═══════════════════════════════════════════╗");
    println!("  ║          STRATUM Storage Engine           ║");
    println!("  ║      LSM-Tree Key-Value Store v1.0.0      ║");
    println!("  ╚═══════════════════════════════════════════╝");
    println!();
    println!("  Commands:");
    println!("    set <key> <value>  - Store a key-value pair");
    println!("    get <key>          - Retrieve a value by key");
    println!("    del <key>          - Delete a key");
    println!("    flush              - Flush the memtable to a segment");
    println!("    compact            - Run one compaction pass");
    println!("    info               - Show engine statistics");
    println!("    exit               - Shutdown engine");
    println!();

    let config = match std::env::args().nth(1) {
        Some(dir) => Config::new(dir),
        None => Config::default(),
    };
    let capacity = config.dispatcher_capacity;

    let engine = match Stratum::open(config) {
        Ok(e) => Arc::new(e),
        Err(err) => {
            eprintln!("[ERROR] Failed to open engine: {}", err);
            std::process::exit(1);
        }
    };
    let dispatcher = match StorageCommandDispatcher::start(Arc::clone(&engine), capacity) {
        Ok(d) => d,
        Err(err) => {
            eprintln!("[ERROR] Failed to start dispatcher: {}", err);
            std::process::exit(1);
        }
    };

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("stratum> ");
        if stdout.flush().is_err() {
            break;
        }

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break, // EOF
            Ok(_) => {}
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }

        let kind = match parts[0].to_lowercase().as_str() {
            "set" | "put" => CommandType::Write,
            "get" => CommandType::Read,
            "del" | "delete" => CommandType::Delete,
            "flush" => {
                match engine.flush() {
                    Ok(Some(id)) => println!("  Flushed to segment {}", id),
                    Ok(None) => println!("  (memtable empty)"),
                    Err(e) => println!("  ERROR: {}", e),
                }
                continue;
            }
            "compact" => {
                match engine.compact_now() {
                    Ok(Some(outcome)) => println!(
                        "  Compacted {:?} -> {:?} ({} entries, {} tombstones dropped)",
                        outcome.inputs, outcome.outputs, outcome.entries_written, outcome.tombstones_dropped
                    ),
                    Ok(None) => println!("  (nothing to compact)"),
                    Err(e) => println!("  ERROR: {}", e),
                }
                continue;
            }
            "info" | "stats" => {
                println!("  Segments:      {}", engine.segment_count());
                println!("  MemTable size: {} bytes", engine.memtable_size());
                println!("{}", engine.metrics().report());
                continue;
            }
            "exit" | "quit" | "q" => {
                println!("  Shutting down STRATUM...");
                break;
            }
            _ => {
                println!("  Unknown command: '{}'. Type 'exit' to quit.", parts[0]);
                continue;
            }
        };

        // Values may contain spaces: everything after the key is the value.
        let mut arguments: Vec<String> = parts[1..].iter().take(1).map(|s| s.to_string()).collect();
        if kind == CommandType::Write && parts.len() > 2 {
            arguments.push(parts[2..].join(" "));
        } else if parts.len() > 2 {
            arguments.extend(parts[2..].iter().map(|s| s.to_string()));
        }

        let command = match StorageCommand::new(kind, arguments) {
            Ok(c) => c,
            Err(e) => {
                println!("  ERROR: {}", e);
                continue;
            }
        };

        match dispatcher.submit(command) {
            Ok(response) => match (response.response(), response.error_message()) {
                (Some(value), _) if kind == CommandType::Read => println!("  \"{}\"", value),
                (Some(value), _) => println!("  {}", value),
                (None, Some(err)) => println!("  ERROR: {}", err),
                (None, None) => println!("  (nil)"),
            },
            Err(e) => println!("  ERROR: {}", e),
        }
    }

    dispatcher.shutdown();
    if let Err(e) = engine.shutdown() {
        eprintln!("[ERROR] Shutdown failed: {}", e);
    }
}

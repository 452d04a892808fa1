use std::io::BufRead;
use std::sync::Arc;
use tokio::runtime::Runtime;

use dht_store::{keys_location, DhtClient, DhtKey, MemoryDht};
use fs_core::PeerFs;

const HELP: &str = "commands:\n\
    \x20 get <path>            print the stored content for a path\n\
    \x20 put <path> <text...>  store text under a path and register it\n\
    \x20 remove <path>         drop a path's content and registration\n\
    \x20 keys                  list every registered path\n\
    \x20 peers                 number of known remote peers\n\
    \x20 stat                  filesystem capacity and usage counters\n\
    \x20 quit                  leave the shell (filesystem stays mounted)";

/// Interactive shell over the raw DHT operations, for poking at the overlay
/// while the filesystem is mounted. Exits on `quit` or EOF.
pub fn run_repl(runtime: &Runtime, dht: Arc<MemoryDht>, fs: Arc<PeerFs>) {
    println!("dhtfs shell; type 'help' for commands");
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        let mut parts = line.split_whitespace();
        let command = match parts.next() {
            Some(command) => command,
            None => continue,
        };
        match command {
            "get" => {
                let Some(path) = parts.next() else {
                    println!("usage: get <path>");
                    continue;
                };
                match runtime.block_on(dht.get(&DhtKey::from_str(path))) {
                    Ok(Some(data)) => {
                        println!("{} bytes: {}", data.len(), String::from_utf8_lossy(&data))
                    }
                    Ok(None) => println!("absent"),
                    Err(e) => println!("error: {}", e),
                }
            }
            "put" => {
                let Some(path) = parts.next() else {
                    println!("usage: put <path> <text...>");
                    continue;
                };
                let text = parts.collect::<Vec<_>>().join(" ");
                let key = DhtKey::from_str(path);
                let result = runtime.block_on(async {
                    dht.put(key, text.clone().into_bytes()).await?;
                    dht.put_under(&keys_location(), key, path.as_bytes().to_vec())
                        .await
                });
                match result {
                    Ok(()) => println!("stored {} bytes at {}", text.len(), path),
                    Err(e) => println!("error: {}", e),
                }
            }
            "remove" => {
                let Some(path) = parts.next() else {
                    println!("usage: remove <path>");
                    continue;
                };
                let key = DhtKey::from_str(path);
                let result = runtime.block_on(async {
                    dht.remove(&key).await?;
                    dht.remove_under(&keys_location(), &key).await
                });
                match result {
                    Ok(()) => println!("removed {}", path),
                    Err(e) => println!("error: {}", e),
                }
            }
            "keys" => match runtime.block_on(dht.get_all_under(&keys_location())) {
                Ok(entries) => {
                    let mut paths: Vec<String> = entries
                        .values()
                        .map(|raw| String::from_utf8_lossy(raw).into_owned())
                        .collect();
                    paths.sort();
                    for path in &paths {
                        println!("{}", path);
                    }
                    println!("{} path(s)", paths.len());
                }
                Err(e) => println!("error: {}", e),
            },
            "peers" => println!("{} remote peer(s)", dht.peer_count()),
            "stat" => {
                let snapshot = fs.statfs();
                println!(
                    "bsize {}  blocks {}  bfree {}  bavail {}  files {}  ffree {}",
                    snapshot.bsize,
                    snapshot.blocks,
                    snapshot.bfree,
                    snapshot.bavail,
                    snapshot.files,
                    snapshot.ffree
                );
            }
            "help" => println!("{}", HELP),
            "quit" | "exit" => break,
            other => println!("unknown command '{}'; type 'help'", other),
        }
    }
}

//! Tiny exerciser for a running storage daemon:
//!
//! ```text
//! devcli <host> <port> <did> topo
//! devcli <host> <port> <did> get <pbid>
//! devcli <host> <port> <did> put <pbid> <byte>
//! ```
//!
//! The SA key is read base64-encoded from `BFS_SA_KEY`.

use std::env;
use std::process::exit;

use device::{Block, BlockDevice, RemoteDevice};
use secomm::SecAssociation;

fn usage() -> ! {
    eprintln!("usage: devcli <host> <port> <did> topo|get|put [pbid] [byte]");
    exit(2);
}

fn main() {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 5 {
        usage();
    }
    let host = &args[1];
    let port: u16 = args[2].parse().unwrap_or_else(|_| usage());
    let did: u32 = args[3].parse().unwrap_or_else(|_| usage());

    let key_b64 = env::var("BFS_SA_KEY").unwrap_or_else(|_| {
        eprintln!("BFS_SA_KEY not set");
        exit(2);
    });
    let sa = SecAssociation::from_base64_key("server", format!("dev{did}"), &key_b64)
        .expect("bad BFS_SA_KEY");

    let dev = RemoteDevice::connect(host, port, did, 1, sa).expect("attach failed");

    match args[4].as_str() {
        "topo" => {
            println!("device {} has {} blocks", dev.device_id(), dev.num_blocks());
        }
        "get" => {
            let pbid: u64 = args.get(5).and_then(|s| s.parse().ok()).unwrap_or_else(|| usage());
            let mut blk = Block::zeroed();
            dev.get_block(pbid, &mut blk).expect("get failed");
            println!(
                "block {pbid}: {:02x} {:02x} {:02x} {:02x} ...",
                blk[0], blk[1], blk[2], blk[3]
            );
        }
        "put" => {
            let pbid: u64 = args.get(5).and_then(|s| s.parse().ok()).unwrap_or_else(|| usage());
            let byte: u8 = args.get(6).and_then(|s| s.parse().ok()).unwrap_or_else(|| usage());
            dev.put_block(pbid, &Block::filled(byte)).expect("put failed");
            println!("block {pbid} filled with {byte:#04x}");
        }
        _ => usage(),
    }
}

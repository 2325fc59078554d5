//! Echo server - simple request/response example.
//!
//! Registers one typed handler that sends every received message straight
//! back to the client, then serves until `exit` arrives on stdin.
//!
//! ```text
//! cargo run --example echo
//! ```

use framewire::{protocol, Module, ModuleRegistry, Options, Packet, Protocol};
use serde::{Deserialize, Serialize};

/// The one message type of the echo protocol.
#[derive(Serialize, Deserialize, Debug)]
struct EchoMessage {
    timestamp: u64,
    payload: String,
}

impl Packet for EchoMessage {
    const NAME: &'static str = "EchoMessage";
}

struct EchoServer;

impl Module for EchoServer {
    fn protocol() -> Protocol {
        protocol![EchoMessage]
    }

    fn register(reg: &mut ModuleRegistry<Self>) {
        reg.on_client_reply(|_m, _ctx, _conn, msg: EchoMessage| msg);
    }
}

fn main() -> framewire::Result<()> {
    let mut options = Options::new();
    options.insert("Port".into(), "4999".into());
    options.insert("Console".into(), "stdin".into());

    framewire::run_server(EchoServer, "echo", &options)?;
    Ok(())
}

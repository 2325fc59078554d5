//! Proxy server - forwards client traffic to an upstream and relays the
//! upstream's answers back.
//!
//! Start the echo demo first, then this proxy, then point a client at the
//! proxy port:
//!
//! ```text
//! cargo run --example echo   # listens on 4999
//! cargo run --example proxy  # listens on 5000, upstream 4999
//! ```

use framewire::{protocol, Connection, Module, ModuleCtx, ModuleRegistry, Options, Packet, Protocol};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug)]
struct EchoMessage {
    timestamp: u64,
    payload: String,
}

impl Packet for EchoMessage {
    const NAME: &'static str = "EchoMessage";
}

#[derive(Default)]
struct Proxy {
    upstream: Option<Connection>,
    last_client: Option<Connection>,
}

impl Module for Proxy {
    fn protocol() -> Protocol {
        protocol![EchoMessage]
    }

    fn register(reg: &mut ModuleRegistry<Self>) {
        // Client traffic goes up; remember who asked.
        reg.on_client(|m: &mut Proxy, _ctx, conn, msg: EchoMessage| {
            m.last_client = Some(conn.clone());
            if let Some(upstream) = &m.upstream {
                let _ = upstream.send(&msg);
            }
        });

        // Upstream answers go back down.
        reg.on_server(|m: &mut Proxy, _ctx, _conn, msg: EchoMessage| {
            if let Some(client) = &m.last_client {
                let _ = client.send(&msg);
            }
        });
    }

    fn on_initialized(&mut self, ctx: &mut ModuleCtx<Self>) {
        match ctx.async_connect("127.0.0.1", 4999) {
            Ok(conn) => self.upstream = Some(conn),
            Err(err) => eprintln!("upstream connect failed: {err}"),
        }
    }
}

fn main() -> framewire::Result<()> {
    let mut options = Options::new();
    options.insert("Port".into(), "5000".into());
    options.insert("Console".into(), "stdin".into());

    framewire::run_server(Proxy::default(), "proxy", &options)?;
    Ok(())
}

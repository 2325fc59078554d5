//! Shared fixtures for the integration tests: the test protocol, a
//! background-thread server runner, and a foreground run helper.

#![allow(dead_code)]

use std::thread::JoinHandle;

use framewire::{protocol, Module, ModuleHost, Options, Packet, Protocol, Server, ServerControl};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SimpleClientMessage {
    pub timestamp: u64,
    pub payload: String,
}
impl Packet for SimpleClientMessage {
    const NAME: &'static str = "SimpleClientMessage";
}

macro_rules! data_message {
    ($name:ident, $($field:ident: $ty:ty),+) => {
        #[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
        pub struct $name {
            $(pub $field: $ty),+
        }
        impl Packet for $name {
            const NAME: &'static str = stringify!($name);
        }
    };
}

data_message!(Type1Message, data: i32);
data_message!(Type2Message, data: i64);
data_message!(Type3Message, data: bool);
data_message!(Type4Message, data: f64);
data_message!(Type5Message, data: f32);
data_message!(Type6Message, data: String);

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Type7Message {
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}
impl Packet for Type7Message {
    const NAME: &'static str = "Type7Message";
}

data_message!(Type8Message, data1: i32, data2: i32);
data_message!(Type9Message, data1: i32, data2: i32, data3: i64);

/// The full ten-type test protocol; ids follow declaration order.
pub fn test_protocol() -> Protocol {
    protocol![
        SimpleClientMessage,
        Type1Message,
        Type2Message,
        Type3Message,
        Type4Message,
        Type5Message,
        Type6Message,
        Type7Message,
        Type8Message,
        Type9Message,
    ]
}

pub fn options_for(port: u16) -> Options {
    let mut options = Options::new();
    options.insert("Port".into(), port.to_string());
    options
}

/// Runs a server on a background thread; the module is built on that
/// thread, so it may hold engine types. Stopped and joined on drop.
pub struct Runner {
    control: ServerControl,
    worker: Option<JoinHandle<()>>,
}

impl Runner {
    pub fn start<M, F>(factory: F, port: u16) -> Runner
    where
        M: Module,
        F: FnOnce() -> M + Send + 'static,
    {
        let server = Server::new();
        let control = server.control();
        let worker = std::thread::spawn(move || {
            let options = options_for(port);
            if let Err(err) = server.run(factory(), "test", &options) {
                panic!("background server failed: {err}");
            }
        });
        Runner {
            control,
            worker: Some(worker),
        }
    }

    /// Stops the server and waits for the run loop to finish.
    pub fn join(&mut self) {
        self.control.set_active(false);
        if let Some(worker) = self.worker.take() {
            worker.join().expect("server thread panicked");
        }
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        self.control.set_active(false);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Runs `module` on the calling thread while `client_thread` exercises it
/// from a worker thread; once the worker returns, the server is stopped and
/// the module host is handed back for inspection.
pub fn run_with_client<M, F>(module: M, port: u16, client_thread: F) -> ModuleHost<M>
where
    M: Module,
    F: FnOnce() + Send + 'static,
{
    let server = Server::new();
    let control = server.control();
    let worker = std::thread::spawn(move || {
        client_thread();
        control.set_active(false);
    });

    let host = server
        .run(module, "test", &options_for(port))
        .expect("server run failed");
    worker.join().expect("client thread panicked");
    host
}

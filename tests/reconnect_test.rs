//! Outbound reconnect cycles, session references outliving disconnects,
//! and the inactivity sweep.

mod common;

use common::*;
use framewire::{Client, Connection, Module, ModuleCtx, ModuleRegistry, Protocol, SessionRef};
use std::time::Duration;

fn ts(timestamp: u64) -> SimpleClientMessage {
    SimpleClientMessage {
        timestamp,
        payload: String::new(),
    }
}

/// Accepts connections and stays quiet; the reconnect target.
struct QuietServer;

impl Module for QuietServer {
    fn protocol() -> Protocol {
        test_protocol()
    }
    fn register(_reg: &mut ModuleRegistry<Self>) {}
}

#[test]
fn reconnect_cycles_pair_up_notifications() {
    #[derive(Default)]
    struct UpstreamWatcher {
        connected: u32,
        disconnected: u32,
    }
    impl Module for UpstreamWatcher {
        fn protocol() -> Protocol {
            test_protocol()
        }
        fn register(_reg: &mut ModuleRegistry<Self>) {}
        fn on_initialized(&mut self, ctx: &mut ModuleCtx<Self>) {
            ctx.async_connect("127.0.0.1", 5999).expect("valid address");
        }
        fn on_connected(&mut self, _ctx: &mut ModuleCtx<Self>, conn: &Connection) {
            if conn.is_server() {
                self.connected += 1;
            }
        }
        fn on_disconnected(&mut self, _ctx: &mut ModuleCtx<Self>, conn: &Connection) {
            if conn.is_server() {
                self.disconnected += 1;
            }
        }
    }

    let host = run_with_client(UpstreamWatcher::default(), 5601, || {
        for _ in 0..3 {
            let mut target = Runner::start(|| QuietServer, 5999);
            std::thread::sleep(Duration::from_secs(1));
            target.join();
            std::thread::sleep(Duration::from_millis(300));
        }
    });

    assert_eq!(host.module().connected, 3);
    assert_eq!(host.module().disconnected, 3);
}

#[test]
fn session_reference_outlives_disconnect() {
    #[derive(Default)]
    struct Server {
        disconnected: u32,
        timer_fired: bool,
        held: Option<SessionRef>,
    }
    impl Module for Server {
        fn protocol() -> Protocol {
            test_protocol()
        }
        fn register(reg: &mut ModuleRegistry<Self>) {
            reg.on_client(|m: &mut Server, ctx, conn, _msg: SimpleClientMessage| {
                let held = conn.take_ownership();
                m.held = Some(conn.take_ownership());
                ctx.async_wait(Duration::from_millis(100), move |m, _ctx| {
                    // The peer is long gone; this must be a harmless no-op.
                    let _ = held.send(&SimpleClientMessage {
                        timestamp: 1,
                        payload: String::new(),
                    });
                    m.timer_fired = true;
                });
            });
        }
        fn on_disconnected(&mut self, _ctx: &mut ModuleCtx<Self>, conn: &Connection) {
            if conn.is_client() {
                self.disconnected += 1;
            }
        }
    }

    let host = run_with_client(Server::default(), 5602, || {
        let mut client = Client::new(test_protocol()).unwrap();
        client.wait_connect(5602).unwrap();
        client.send(&ts(1)).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        client.disconnect();
        std::thread::sleep(Duration::from_millis(300));
    });

    assert_eq!(host.module().disconnected, 1);
    assert!(host.module().timer_fired);
    assert!(!host.module().held.as_ref().unwrap().connected());
}

#[test]
fn inactivity_sweep_disconnects_idle_clients() {
    #[derive(Default)]
    struct Server {
        disconnected: u32,
    }
    impl Module for Server {
        fn protocol() -> Protocol {
            test_protocol()
        }
        fn register(_reg: &mut ModuleRegistry<Self>) {}
        fn on_initialized(&mut self, ctx: &mut ModuleCtx<Self>) {
            ctx.async_wait_period(Duration::from_millis(20), |_m, ctx| {
                ctx.async_disconnect_inactive_clients(Duration::from_millis(50));
            });
        }
        fn on_disconnected(&mut self, _ctx: &mut ModuleCtx<Self>, conn: &Connection) {
            if conn.is_client() {
                self.disconnected += 1;
            }
        }
    }

    let host = run_with_client(Server::default(), 5603, || {
        let mut client = Client::new(test_protocol()).unwrap();
        client.wait_connect(5603).unwrap();
        // Stay silent past the inactivity limit.
        std::thread::sleep(Duration::from_millis(400));
        assert!(client.wait_message::<SimpleClientMessage>().is_err());
    });

    assert_eq!(host.module().disconnected, 1);
}

#[test]
fn active_client_survives_inactivity_sweep() {
    #[derive(Default)]
    struct Server {
        disconnected: u32,
    }
    impl Module for Server {
        fn protocol() -> Protocol {
            test_protocol()
        }
        fn register(reg: &mut ModuleRegistry<Self>) {
            reg.on_client_reply(|_m, _ctx, _conn, msg: SimpleClientMessage| msg);
        }
        fn on_initialized(&mut self, ctx: &mut ModuleCtx<Self>) {
            ctx.async_wait_period(Duration::from_millis(20), |_m, ctx| {
                ctx.async_disconnect_inactive_clients(Duration::from_millis(150));
            });
        }
        fn on_disconnected(&mut self, _ctx: &mut ModuleCtx<Self>, conn: &Connection) {
            if conn.is_client() {
                self.disconnected += 1;
            }
        }
    }

    let host = run_with_client(Server::default(), 5604, || {
        let mut client = Client::new(test_protocol()).unwrap();
        client.wait_connect(5604).unwrap();
        // Keep reading activity flowing well under the limit.
        for i in 0..8 {
            client.send(&ts(i)).unwrap();
            assert_eq!(
                client.wait_message::<SimpleClientMessage>().unwrap().timestamp,
                i
            );
            std::thread::sleep(Duration::from_millis(50));
        }
        client.disconnect();
        std::thread::sleep(Duration::from_millis(100));
    });

    // Only the deliberate disconnect at the end.
    assert_eq!(host.module().disconnected, 1);
}

//! Synchronous client against an echo server: blocking receives, async
//! subscribers, cancellation, and subprotocol clients.

mod common;

use common::*;
use framewire::{Client, Module, ModuleRegistry, Protocol};
use std::cell::RefCell;
use std::rc::Rc;

/// Echoes every protocol type straight back to the sender.
struct Echo;

impl Module for Echo {
    fn protocol() -> Protocol {
        test_protocol()
    }

    fn register(reg: &mut ModuleRegistry<Self>) {
        reg.on_client_reply(|_m, _ctx, _conn, msg: SimpleClientMessage| msg);
        reg.on_client_reply(|_m, _ctx, _conn, msg: Type1Message| msg);
        reg.on_client_reply(|_m, _ctx, _conn, msg: Type2Message| msg);
        reg.on_client_reply(|_m, _ctx, _conn, msg: Type3Message| msg);
        reg.on_client_reply(|_m, _ctx, _conn, msg: Type4Message| msg);
        reg.on_client_reply(|_m, _ctx, _conn, msg: Type5Message| msg);
        reg.on_client_reply(|_m, _ctx, _conn, msg: Type6Message| msg);
        reg.on_client_reply(|_m, _ctx, _conn, msg: Type7Message| msg);
        reg.on_client_reply(|_m, _ctx, _conn, msg: Type8Message| msg);
        reg.on_client_reply(|_m, _ctx, _conn, msg: Type9Message| msg);
    }
}

fn make_message(timestamp: u64) -> SimpleClientMessage {
    SimpleClientMessage {
        timestamp,
        payload: String::new(),
    }
}

#[test]
fn receives_message() {
    let _server = Runner::start(|| Echo, 4999);

    let mut client = Client::new(test_protocol()).unwrap();
    client.wait_connect(4999).unwrap();
    client.send(&make_message(12345)).unwrap();

    let msg = client.wait_message::<SimpleClientMessage>().unwrap();
    assert_eq!(msg.timestamp, 12345);
}

#[test]
fn receives_multiple_messages() {
    let _server = Runner::start(|| Echo, 5101);

    let mut client = Client::new(test_protocol()).unwrap();
    client.wait_connect(5101).unwrap();
    client.send(&make_message(12345)).unwrap();
    client.send(&make_message(67890)).unwrap();

    assert_eq!(
        client.wait_message::<SimpleClientMessage>().unwrap().timestamp,
        12345
    );
    assert_eq!(
        client.wait_message::<SimpleClientMessage>().unwrap().timestamp,
        67890
    );
}

#[test]
fn communicates_in_synchronous_fashion() {
    let _server = Runner::start(|| Echo, 5102);

    let mut client = Client::new(test_protocol()).unwrap();
    client.wait_connect(5102).unwrap();

    client.send(&make_message(12345)).unwrap();
    assert_eq!(
        client.wait_message::<SimpleClientMessage>().unwrap().timestamp,
        12345
    );

    client.send(&make_message(67890)).unwrap();
    assert_eq!(
        client.wait_message::<SimpleClientMessage>().unwrap().timestamp,
        67890
    );
}

#[test]
fn receives_async_message() {
    let _server = Runner::start(|| Echo, 5103);

    let mut client = Client::new(test_protocol()).unwrap();
    client.wait_connect(5103).unwrap();
    client.send(&make_message(12345)).unwrap();

    let timestamp = Rc::new(RefCell::new(0u64));
    let sink = timestamp.clone();
    client.receive(move |msg: framewire::Result<SimpleClientMessage>| {
        if let Ok(msg) = msg {
            *sink.borrow_mut() = msg.timestamp;
        }
    });

    client.run().unwrap();
    assert_eq!(*timestamp.borrow(), 12345);
}

#[test]
fn receives_several_async_messages() {
    let _server = Runner::start(|| Echo, 5104);

    let mut client = Client::new(test_protocol()).unwrap();
    client.wait_connect(5104).unwrap();
    client.send(&make_message(12345)).unwrap();
    client.send(&make_message(67890)).unwrap();

    let first = Rc::new(RefCell::new(0u64));
    let second = Rc::new(RefCell::new(0u64));

    let sink = first.clone();
    client.receive(move |msg: framewire::Result<SimpleClientMessage>| {
        if let Ok(msg) = msg {
            *sink.borrow_mut() = msg.timestamp;
        }
    });
    let sink = second.clone();
    client.receive(move |msg: framewire::Result<SimpleClientMessage>| {
        if let Ok(msg) = msg {
            *sink.borrow_mut() = msg.timestamp;
        }
    });

    client.run().unwrap();
    assert_eq!(*first.borrow(), 12345);
    assert_eq!(*second.borrow(), 67890);
}

#[test]
fn cancels_pending_subscriber_on_disconnect() {
    let _server = Runner::start(|| Echo, 5105);

    let mut client = Client::new(test_protocol()).unwrap();
    client.wait_connect(5105).unwrap();

    let cancelled = Rc::new(RefCell::new(0u32));
    let sink = cancelled.clone();
    client.receive(move |msg: framewire::Result<SimpleClientMessage>| {
        if msg.is_err() {
            *sink.borrow_mut() += 1;
        }
    });

    client.disconnect();
    assert_eq!(*cancelled.borrow(), 1);
}

#[test]
fn resubscription_inside_cancellation_is_not_cancelled_in_same_pass() {
    let _server = Runner::start(|| Echo, 5106);

    let mut client = Client::new(test_protocol()).unwrap();
    client.wait_connect(5106).unwrap();

    let called = Rc::new(RefCell::new(0u32));
    let subscriber = client.subscriber();

    let sink = called.clone();
    client.receive(move |_msg: framewire::Result<SimpleClientMessage>| {
        *sink.borrow_mut() += 1;
        let sink = sink.clone();
        subscriber.receive(move |_msg: framewire::Result<SimpleClientMessage>| {
            *sink.borrow_mut() += 1;
        });
    });

    client.disconnect();
    assert_eq!(*called.borrow(), 1);
}

#[test]
fn cancels_subscribers_when_client_is_dropped() {
    let _server = Runner::start(|| Echo, 5107);

    let cancelled = Rc::new(RefCell::new(false));
    {
        let mut client = Client::new(test_protocol()).unwrap();
        client.wait_connect(5107).unwrap();

        let sink = cancelled.clone();
        client.receive(move |msg: framewire::Result<SimpleClientMessage>| {
            if msg.is_err() {
                *sink.borrow_mut() = true;
            }
        });
    }

    assert!(*cancelled.borrow());
}

#[test]
fn receives_messages_of_different_types() {
    let _server = Runner::start(|| Echo, 5108);

    let mut client = Client::new(test_protocol()).unwrap();
    client.wait_connect(5108).unwrap();

    client.send(&Type1Message { data: 123 }).unwrap();
    client.send(&Type4Message { data: 0.1234 }).unwrap();
    client
        .send(&Type6Message {
            data: "hello world".into(),
        })
        .unwrap();

    assert_eq!(client.wait_message::<Type1Message>().unwrap().data, 123);
    assert!((client.wait_message::<Type4Message>().unwrap().data - 0.1234).abs() < 1e-9);
    assert_eq!(
        client.wait_message::<Type6Message>().unwrap().data,
        "hello world"
    );
}

#[test]
fn handles_subprotocol() {
    let _server = Runner::start(|| Echo, 5109);

    let full = test_protocol();
    let sub = full.subset().message::<Type6Message>().build();

    let mut client = Client::new(sub).unwrap();
    client.wait_connect(5109).unwrap();
    client
        .send(&Type6Message {
            data: "hello world".into(),
        })
        .unwrap();

    assert_eq!(
        client.wait_message::<Type6Message>().unwrap().data,
        "hello world"
    );
}

#[test]
fn handles_subprotocol_asynchronously() {
    let _server = Runner::start(|| Echo, 5110);

    let full = test_protocol();
    let sub = full.subset().message::<Type6Message>().build();

    let mut client = Client::new(sub).unwrap();
    client.wait_connect(5110).unwrap();

    let response = Rc::new(RefCell::new(String::new()));
    let sink = response.clone();
    client.receive(move |msg: framewire::Result<Type6Message>| {
        if let Ok(msg) = msg {
            *sink.borrow_mut() = msg.data;
        }
    });

    client
        .send(&Type6Message {
            data: "hello world".into(),
        })
        .unwrap();
    client.run().unwrap();

    assert_eq!(*response.borrow(), "hello world");
}

#[test]
fn try_receive_is_non_blocking() {
    let _server = Runner::start(|| Echo, 5111);

    let mut client = Client::new(test_protocol()).unwrap();
    client.wait_connect(5111).unwrap();

    // Nothing sent yet: no message, no blocking.
    assert!(client
        .try_receive::<SimpleClientMessage>()
        .unwrap()
        .is_none());

    client.send(&make_message(777)).unwrap();
    let mut found = None;
    for _ in 0..2000 {
        found = client.try_receive::<SimpleClientMessage>().unwrap();
        if found.is_some() {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    assert_eq!(found.map(|m| m.timestamp), Some(777));
}

#[test]
fn send_refuses_oversized_frame() {
    let _server = Runner::start(|| Echo, 5112);

    let mut client = Client::new(test_protocol()).unwrap();
    client.wait_connect(5112).unwrap();

    let huge = SimpleClientMessage {
        timestamp: 1,
        payload: "x".repeat(70_000),
    };
    let err = client.send(&huge).unwrap_err();
    assert!(matches!(err, framewire::FramewireError::FrameTooLarge { .. }));

    // The connection is still usable afterwards.
    client.send(&make_message(5)).unwrap();
    assert_eq!(
        client.wait_message::<SimpleClientMessage>().unwrap().timestamp,
        5
    );
}

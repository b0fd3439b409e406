//! Single-slot echo device: write-then-read round trips.

mod support;

use support::{client_cred, reply_if_wanted, send_reply, Provider, Request};
use userdev_broker::proto::Subcommand;
use userdev_broker::{Broker, ControlChannel, Interrupt};

/// A one-slot echo device: a write stores its payload, a read drains it.
fn echo_handler() -> impl FnMut(&ControlChannel, Request) + Send {
    let mut stored: Option<Vec<u8>> = None;
    move |chan, req| match req.subcmd {
        Subcommand::Open | Subcommand::Close => reply_if_wanted(chan, &req, 0, &[]),
        Subcommand::Write => {
            let n = req.payload.len() as i64;
            stored = Some(req.payload);
            let mut ops = req.ops;
            ops.offset += n as u64;
            send_reply(chan, &ops, Subcommand::Write, n, &[]);
        }
        Subcommand::Read => {
            let data = stored.take().unwrap_or_default();
            let mut ops = req.ops;
            ops.offset += data.len() as u64;
            send_reply(chan, &ops, Subcommand::Read, data.len() as i64, &data);
        }
        Subcommand::PollDiff => {}
        other => panic!("echo provider got unexpected {other:?}"),
    }
}

#[test]
fn write_then_read_echoes_bytes() {
    support::init_logging();
    let broker = Broker::new();
    let _provider = Provider::start(&broker, "echo", echo_handler());

    let cred = client_cred(2000);
    let intr = Interrupt::new();
    let id = broker.lookup("echo").unwrap();
    let handle = broker.open(id, &cred, 0, &intr).unwrap();

    assert_eq!(handle.write(&cred, b"HELLO", &intr).unwrap(), 5);
    assert_eq!(handle.pos(), 5);

    let mut buf = [0u8; 10];
    let n = handle.read(&cred, &mut buf, &intr).unwrap();
    assert_eq!(n, 5);
    assert_eq!(&buf[..5], b"HELLO");

    // The slot is drained; a second read is end-of-file.
    assert_eq!(handle.read(&cred, &mut buf, &intr).unwrap(), 0);

    assert_eq!(handle.close(&cred, &intr).unwrap(), 0);
}

#[test]
fn zero_length_writes_are_legal() {
    support::init_logging();
    let broker = Broker::new();
    let _provider = Provider::start(&broker, "echo-zero", echo_handler());

    let cred = client_cred(2001);
    let intr = Interrupt::new();
    let id = broker.lookup("echo-zero").unwrap();
    let handle = broker.open(id, &cred, 0, &intr).unwrap();

    assert_eq!(handle.write(&cred, b"", &intr).unwrap(), 0);
    let mut buf = [0u8; 4];
    assert_eq!(handle.read(&cred, &mut buf, &intr).unwrap(), 0);
}

#[test]
fn oversized_provider_reads_are_clipped() {
    support::init_logging();
    let broker = Broker::new();

    // A provider that always claims five bytes, whatever was asked.
    let _provider = Provider::start(&broker, "chatty", |chan, req: Request| match req.subcmd {
        Subcommand::Open | Subcommand::Close => reply_if_wanted(chan, &req, 0, &[]),
        Subcommand::Read => send_reply(chan, &req.ops, Subcommand::Read, 5, b"HELLO"),
        Subcommand::PollDiff => {}
        other => panic!("unexpected {other:?}"),
    });

    let cred = client_cred(2002);
    let intr = Interrupt::new();
    let id = broker.lookup("chatty").unwrap();
    let handle = broker.open(id, &cred, 0, &intr).unwrap();

    // The client asked for two bytes; the surplus is dropped.
    let mut buf = [0u8; 2];
    assert_eq!(handle.read(&cred, &mut buf, &intr).unwrap(), 2);
    assert_eq!(&buf, b"HE");
}

#[test]
fn provider_errno_reaches_the_client() {
    support::init_logging();
    let broker = Broker::new();

    let _provider = Provider::start(&broker, "grumpy", |chan, req: Request| match req.subcmd {
        Subcommand::Open | Subcommand::Close => reply_if_wanted(chan, &req, 0, &[]),
        Subcommand::Write => send_reply(chan, &req.ops, Subcommand::Write, -5, &[]),
        Subcommand::PollDiff => {}
        other => panic!("unexpected {other:?}"),
    });

    let cred = client_cred(2003);
    let intr = Interrupt::new();
    let id = broker.lookup("grumpy").unwrap();
    let handle = broker.open(id, &cred, 0, &intr).unwrap();

    assert_eq!(
        handle.write(&cred, b"data", &intr).unwrap_err(),
        userdev_broker::Error::Errno(5)
    );
}

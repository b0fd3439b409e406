//! Device lifecycle: provider death under blocked clients, name rules, the
//! self-open guard, and the status channel's view of it all.

mod support;

use std::thread;

use support::{
    client_cred, provider_cred, reply_if_wanted, try_register, wait_until, Provider, Request,
};
use userdev_broker::proto::constants::STATUS_USE_BINARY;
use userdev_broker::proto::{Readiness, StatusRecord, Subcommand, STATUS_RECORD_SIZE};
use userdev_broker::{Broker, ControlChannel, Error, Interrupt};

fn quiet_handler() -> impl FnMut(&ControlChannel, Request) + Send {
    |chan, req| match req.subcmd {
        Subcommand::Open | Subcommand::Close => reply_if_wanted(chan, &req, 0, &[]),
        Subcommand::Read => {} // never answers
        Subcommand::PollDiff => {}
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn provider_death_unblocks_clients_with_connection_lost() {
    support::init_logging();
    let broker = Broker::new();
    let provider = Provider::start(&broker, "mortal", quiet_handler());

    let cred = client_cred(7000);
    let intr = Interrupt::new();
    let id = broker.lookup("mortal").unwrap();
    let handle = broker.open(id, &cred, 0, &intr).unwrap();

    thread::scope(|s| {
        let blocked = s.spawn(|| {
            let mut buf = [0u8; 8];
            handle.read(&cred, &mut buf, &intr)
        });
        wait_until("the provider to hold the read", || {
            provider.count(Subcommand::Read) == 1
        });

        // The provider's channel closes underneath the blocked client.
        provider.shutdown();

        assert_eq!(blocked.join().unwrap().unwrap_err(), Error::ConnectionLost);
    });

    // The name is gone; every further operation observes the loss.
    assert_eq!(broker.lookup("mortal").unwrap_err(), Error::NotFound);
    assert_eq!(
        handle.write(&cred, b"x", &intr).unwrap_err(),
        Error::ConnectionLost
    );
    assert_eq!(handle.poll(&cred).unwrap(), Readiness::EXCEPTION);

    // Closing the last open file releases the zombie for good.
    let _ = handle.close(&cred, &intr);
}

#[test]
fn self_open_is_refused_with_deadlock_avoided() {
    support::init_logging();
    let broker = Broker::new();
    let _provider = Provider::start(&broker, "narcissus", quiet_handler());

    let intr = Interrupt::new();
    let id = broker.lookup("narcissus").unwrap();
    assert_eq!(
        broker.open(id, &provider_cred(), 0, &intr).unwrap_err(),
        Error::DeadlockAvoided
    );
}

#[test]
fn duplicate_names_are_rejected_while_live() {
    support::init_logging();
    let broker = Broker::new();
    let first = broker.open_control(provider_cred());
    try_register(&first, "unique").unwrap();

    let second = broker.open_control(client_cred(7001));
    assert_eq!(try_register(&second, "unique").unwrap_err(), Error::AlreadyExists);

    // A channel can be promoted at most once.
    assert_eq!(try_register(&first, "other").unwrap_err(), Error::AlreadyExists);

    // Once the owner is gone the name can be taken again.
    drop(first);
    try_register(&second, "unique").unwrap();
}

#[test]
fn status_channel_tracks_registrations() {
    support::init_logging();
    let broker = Broker::new();
    let status = broker.open_status();

    // Fresh handle: the initial registry state is news.
    assert_eq!(status.poll(), Readiness::READABLE);
    let mut text = Vec::new();
    let mut chunk = [0u8; 64];
    loop {
        let n = status.read(&mut chunk).unwrap();
        if n == 0 {
            break;
        }
        text.extend_from_slice(&chunk[..n]);
    }
    let text = String::from_utf8(text).unwrap();
    assert!(text.contains("0 devices used by 0 clients"));
    assert!(status.poll().is_empty());

    // Registration wakes the channel.
    let _provider = Provider::start(&broker, "seen-by-status", quiet_handler());
    assert_eq!(status.poll(), Readiness::READABLE);

    // The binary snapshot carries the same facts as fixed records.
    let binary = broker.open_status();
    binary.control(STATUS_USE_BINARY).unwrap();
    let mut bytes = Vec::new();
    let mut chunk = [0u8; STATUS_RECORD_SIZE];
    loop {
        let n = binary.read(&mut chunk).unwrap();
        if n == 0 {
            break;
        }
        bytes.extend_from_slice(&chunk[..n]);
    }
    assert_eq!(bytes.len(), STATUS_RECORD_SIZE);
    let record: StatusRecord = bytemuck_read(&bytes);
    assert_eq!(record.pid, support::PROVIDER_PID);
    assert_eq!(record.zombie, 0);
    assert_eq!(record.num_open, 0);
}

/// Decode a status record without dragging bytemuck into the test crate.
fn bytemuck_read(bytes: &[u8]) -> StatusRecord {
    let mut name = [0u8; 48];
    name.copy_from_slice(&bytes[..48]);
    let word = |at: usize| u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
    StatusRecord {
        name,
        zombie: word(48),
        pid: word(52),
        num_open: word(56),
        reserved: word(60),
    }
}

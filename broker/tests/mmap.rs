//! Mapping a device: provider-exported shared regions resolved by key.

mod support;

use std::sync::Arc;

use support::{client_cred, reply_if_wanted, send_reply, Provider, Request};
use userdev_broker::proto::{MapFlags, MapProt, Subcommand};
use userdev_broker::{Broker, ControlChannel, Error, Interrupt, SharedRegion};

const REGION_KEY: u64 = 0x5eed;
const REGION_LEN: u64 = 8192;

fn mapping_handler(key: u64) -> impl FnMut(&ControlChannel, Request) + Send {
    move |chan, req| match req.subcmd {
        Subcommand::Open | Subcommand::Close => reply_if_wanted(chan, &req, 0, &[]),
        Subcommand::Mmap => {
            let mut ops = req.ops;
            ops.arg = key;
            ops.length = REGION_LEN;
            send_reply(chan, &ops, Subcommand::Mmap, 0, &[]);
        }
        Subcommand::PollDiff => {}
        other => panic!("unexpected {other:?}"),
    }
}

fn file_region(len: u64) -> Arc<SharedRegion> {
    let file = tempfile::tempfile().unwrap();
    file.set_len(len).unwrap();
    SharedRegion::from_file(&file, len as usize).unwrap()
}

#[test]
fn mapped_reads_resolve_against_the_export() {
    support::init_logging();
    let broker = Broker::new();
    let provider = Provider::start(&broker, "frames", mapping_handler(REGION_KEY));

    let region = file_region(REGION_LEN);
    provider.chan.export_region(REGION_KEY, Arc::clone(&region));
    region.write_at(256, b"frame zero").unwrap();

    let cred = client_cred(8000);
    let intr = Interrupt::new();
    let id = broker.lookup("frames").unwrap();
    let handle = broker.open(id, &cred, 0, &intr).unwrap();

    let map = handle
        .mmap(
            &cred,
            0,
            REGION_LEN,
            MapProt::READ | MapProt::WRITE,
            MapFlags::SHARED,
            &intr,
        )
        .unwrap();
    assert_eq!(map.len(), REGION_LEN);

    let mut buf = [0u8; 10];
    map.read(256, &mut buf).unwrap();
    assert_eq!(&buf, b"frame zero");

    // Writes travel the other way.
    map.write(512, b"from client").unwrap();
    let mut echo = [0u8; 11];
    region.read_at(512, &mut echo).unwrap();
    assert_eq!(&echo, b"from client");

    // Out-of-range accesses fail like a faulting page.
    let mut big = [0u8; 16];
    assert_eq!(map.read(REGION_LEN - 4, &mut big), Err(Error::BadAddress));

    // Clones keep the region alive and are counted.
    let second = map.clone();
    assert_eq!(second.handles(), 2);
    drop(map);
    assert_eq!(second.handles(), 1);
    let mut buf = [0u8; 10];
    second.read(256, &mut buf).unwrap();
}

#[test]
fn unknown_region_keys_are_not_supported() {
    support::init_logging();
    let broker = Broker::new();
    let _provider = Provider::start(&broker, "keyless", mapping_handler(0x7777));

    let cred = client_cred(8001);
    let intr = Interrupt::new();
    let id = broker.lookup("keyless").unwrap();
    let handle = broker.open(id, &cred, 0, &intr).unwrap();

    assert_eq!(
        handle
            .mmap(&cred, 0, REGION_LEN, MapProt::READ, MapFlags::SHARED, &intr)
            .unwrap_err(),
        Error::NotSupported
    );
}

#[test]
fn anonymous_exports_cannot_be_mapped_through() {
    support::init_logging();
    let broker = Broker::new();
    let provider = Provider::start(&broker, "anon", mapping_handler(REGION_KEY));
    provider
        .chan
        .export_region(REGION_KEY, SharedRegion::anonymous(REGION_LEN as usize).unwrap());

    let cred = client_cred(8002);
    let intr = Interrupt::new();
    let id = broker.lookup("anon").unwrap();
    let handle = broker.open(id, &cred, 0, &intr).unwrap();

    // The mapping itself succeeds; resolving pages through it does not.
    let map = handle
        .mmap(&cred, 0, REGION_LEN, MapProt::READ, MapFlags::SHARED, &intr)
        .unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(map.read(0, &mut buf), Err(Error::BadAddress));
}

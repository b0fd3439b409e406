//! In-test provider harness.
//!
//! The real provider library is a separate concern; these tests only need a
//! thread that drains a control channel with two-phase reads and hands each
//! decoded request to a closure. Handlers reply inline, stash the request's
//! operation record to answer later, or stay silent to keep a client
//! blocked.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use userdev_broker::proto::{
    Command, Msg, MsgHeader, OpsParams, Params, RegisterParams, Subcommand, MSG_SIZE,
};
use userdev_broker::{Broker, ClientCred, ControlChannel, Error};

pub const PROVIDER_PID: u32 = 1000;

pub fn init_logging() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        // Keep the logger alive for the whole test binary.
        if let Ok(handle) = flexi_logger::Logger::try_with_env_or_str("info")
            .and_then(|logger| logger.start())
        {
            std::mem::forget(handle);
        }
    });
}

pub fn provider_cred() -> ClientCred {
    ClientCred::new(PROVIDER_PID, 0, 0)
}

pub fn client_cred(pid: u32) -> ClientCred {
    ClientCred::new(pid, 1, 1)
}

/// Register a device name on a control channel.
pub fn try_register(chan: &ControlChannel, name: &str) -> Result<usize, Error> {
    let params = RegisterParams::new(name, "userdev", name, 0o666, 0xc0ffee).unwrap();
    let msg = Msg {
        cmd: Command::Register,
        subcmd: Subcommand::None,
        params: Params::Register(params),
        payload: Vec::new(),
    };
    chan.write(&msg.encode_header())
}

pub fn register(chan: &ControlChannel, name: &str) {
    try_register(chan, name).expect("registration failed");
}

/// Answer an operation request, echoing its record.
pub fn send_reply(
    chan: &ControlChannel,
    request: &OpsParams,
    subcmd: Subcommand,
    retval: i64,
    payload: &[u8],
) {
    let msg = Msg::reply_to(request, subcmd, retval, payload);
    chan.writev(&msg.encode_header(), payload)
        .expect("reply write failed");
}

/// Answer a request unless it was sent drop-reply (the broker synthesizes
/// those for teardown and forged closes and must not see an answer).
pub fn reply_if_wanted(chan: &ControlChannel, req: &Request, retval: i64, payload: &[u8]) {
    if req.cmd == Command::Call {
        send_reply(chan, &req.ops, req.subcmd, retval, payload);
    }
}

/// Answer an outstanding readiness diff with a new state.
pub fn send_poll_reply(chan: &ControlChannel, request: &OpsParams, state: i32) {
    let mut msg = Msg::reply_to(request, Subcommand::PollDiff, state as i64, &[]);
    msg.cmd = Command::NonblockReply;
    chan.write(&msg.encode_header()).expect("diff reply failed");
}

/// One decoded provider-bound request.
pub struct Request {
    pub cmd: Command,
    pub subcmd: Subcommand,
    pub ops: OpsParams,
    pub payload: Vec<u8>,
}

/// Drain one message from the channel (two-phase), if one is queued.
pub fn read_message(chan: &ControlChannel) -> Option<Request> {
    let mut header = [0u8; MSG_SIZE];
    match chan.read(&mut header) {
        Ok(_) => {}
        Err(Error::WouldBlock) | Err(Error::ConnectionLost) => return None,
        Err(err) => panic!("provider read failed: {err}"),
    }

    let parsed = MsgHeader::parse(&header).expect("broker wrote a bad header");
    let mut payload = vec![0u8; parsed.payload_len as usize];
    if !payload.is_empty() {
        chan.read(&mut payload).expect("payload read failed");
    }

    let msg = Msg::decode(&header, &payload).expect("broker wrote an undecodable message");
    let ops = *msg.ops().expect("request without ops params");
    Some(Request {
        cmd: msg.cmd,
        subcmd: msg.subcmd,
        ops,
        payload: msg.payload,
    })
}

pub type Handler = Box<dyn FnMut(&ControlChannel, Request) + Send>;

/// A provider running on its own thread.
pub struct Provider {
    pub chan: Arc<ControlChannel>,
    /// Subcommands of every request the provider has consumed, in order.
    pub seen: Arc<Mutex<Vec<Subcommand>>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Provider {
    pub fn start(
        broker: &Broker,
        name: &str,
        mut handler: impl FnMut(&ControlChannel, Request) + Send + 'static,
    ) -> Provider {
        let chan = Arc::new(broker.open_control(provider_cred()));
        register(&chan, name);
        chan.set_nonblocking(true);

        let stop = Arc::new(AtomicBool::new(false));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let thread_chan = Arc::clone(&chan);
        let thread_stop = Arc::clone(&stop);
        let thread_seen = Arc::clone(&seen);
        let thread = thread::Builder::new()
            .name(format!("provider-{name}"))
            .spawn(move || {
                while !thread_stop.load(Ordering::SeqCst) {
                    match read_message(&thread_chan) {
                        Some(request) => {
                            thread_seen.lock().unwrap().push(request.subcmd);
                            handler(&thread_chan, request);
                        }
                        None => thread::sleep(Duration::from_millis(2)),
                    }
                }
            })
            .expect("failed to spawn provider thread");

        Provider {
            chan,
            seen,
            stop,
            thread: Some(thread),
        }
    }

    /// How many requests with this subcommand the provider has consumed.
    pub fn count(&self, subcmd: Subcommand) -> usize {
        self.seen.lock().unwrap().iter().filter(|s| **s == subcmd).count()
    }

    /// Stop the service thread and close the channel, zombifying the device.
    pub fn shutdown(mut self) {
        self.stop_thread();
    }

    fn stop_thread(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            thread.join().expect("provider thread panicked");
        }
    }
}

impl Drop for Provider {
    fn drop(&mut self) {
        self.stop_thread();
    }
}

/// Spin until `pred` holds, or fail the test after five seconds.
pub fn wait_until(what: &str, mut pred: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !pred() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

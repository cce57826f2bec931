//! CONTEXT: End-to-end RPC over host loopback endpoints and shared memory
//! OWNERS: @runtime
//! STATUS: Functional
//! TEST_COVERAGE: 7 integration tests
//!
//! TEST_SCENARIOS:
//!   - default_interfaces_roundtrip(): initiate handshake, then every typed call against a threaded server
//!   - strings_cross_in_both_directions(): lazy buffer page setup for Str arguments and returns
//!   - wide_binding_is_rejected(): 4 words + 2 caps fail registration without touching the registry
//!   - foreign_message_before_reply_is_detected(): unexpected reply, call guard, late reply cleanup
//!   - handler_errors_do_not_stall_dispatch(): a failing request leaves the channel serving
//!   - transient_receive_is_retried(): busy endpoints on either side do not fail calls or dispatch
//!   - shared_memory_calls_carry_strings_inline(): typed calls over a UMP pair, caps refused
//!
//! ADR: docs/adr/0003-ipc-runtime-architecture.md

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use nexus_abi::{
    CapEndpoint, CapRef, ChanError, FrameAlloc, MappedFrame, RecvMsg, SendFlags, CAP_MSG_WORDS,
};
use nexus_ipc::rpc::interfaces::{
    install_default_bindings, GETCHAR, GET_PROC_LIST, GET_PROC_NAME, PROC_SPAWN, PUTCHAR,
    REQUEST_RAM, ROUNDTRIP, SEND_NUMBER, SEND_STRING,
};
use nexus_ipc::{
    Arg, ArgKind, Binding, Dispatch, HostKernel, IpcError, LoopbackEndpoint, MsgType, Rpc,
    SpinYield, UmpChannel,
};
use parking_lot::Mutex;

type Log = Arc<Mutex<Vec<String>>>;

struct Server<E> {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<Rpc<E>>,
}

impl<E: CapEndpoint + Send + 'static> Server<E> {
    fn spawn(mut rpc: Rpc<E>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::spawn(move || {
            while !flag.load(Ordering::Acquire) {
                match rpc.dispatch_pending() {
                    Ok(Dispatch::Idle) | Err(_) => thread::yield_now(),
                    Ok(_) => {}
                }
            }
            rpc
        });
        Self { stop, handle }
    }

    fn shutdown(self) -> Rpc<E> {
        self.stop.store(true, Ordering::Release);
        self.handle.join().unwrap()
    }
}

/// Server endpoint starts unbound; the client knows the server and initiates.
fn connect(kernel: &HostKernel) -> (Rpc<LoopbackEndpoint>, Rpc<LoopbackEndpoint>) {
    let server_ep = kernel.endpoint().unwrap();
    let mut client_ep = kernel.endpoint().unwrap();
    client_ep.set_remote(server_ep.local());
    let mut server = Rpc::new(server_ep, kernel.clone()).unwrap();
    let mut client = Rpc::new(client_ep, kernel.clone()).unwrap();
    install_default_bindings(&mut server).unwrap();
    install_default_bindings(&mut client).unwrap();
    (server, client)
}

/// Endpoint whose every receive fails once with a transient error first.
struct Flaky {
    inner: LoopbackEndpoint,
    fail_next: bool,
    failures: usize,
}

impl Flaky {
    fn new(inner: LoopbackEndpoint) -> Self {
        Self { inner, fail_next: true, failures: 0 }
    }
}

impl CapEndpoint for Flaky {
    fn local(&self) -> CapRef {
        self.inner.local()
    }

    fn remote(&self) -> Option<CapRef> {
        self.inner.remote()
    }

    fn set_remote(&mut self, remote: CapRef) {
        self.inner.set_remote(remote);
    }

    fn send(
        &mut self,
        flags: SendFlags,
        cap: Option<CapRef>,
        words: &[u64; CAP_MSG_WORDS],
    ) -> nexus_abi::Result<()> {
        self.inner.send(flags, cap, words)
    }

    fn can_recv(&self) -> bool {
        self.inner.can_recv()
    }

    fn recv(&mut self) -> nexus_abi::Result<RecvMsg> {
        if self.fail_next {
            self.fail_next = false;
            self.failures += 1;
            return Err(ChanError::Transient);
        }
        let msg = self.inner.recv()?;
        self.fail_next = true;
        Ok(msg)
    }

    fn alloc_recv_slot(&mut self) -> nexus_abi::Result<()> {
        self.inner.alloc_recv_slot()
    }

    fn register_recv(&mut self) -> nexus_abi::Result<()> {
        self.inner.register_recv()
    }

    fn take_event(&mut self) -> bool {
        self.inner.take_event()
    }
}

fn serve_defaults<E: CapEndpoint>(server: &mut Rpc<E>, kernel: &HostKernel, log: &Log) {
    let seen = log.clone();
    server.register_fn(SEND_NUMBER, move |args| {
        seen.lock().push(format!("number {}", args[0].as_word().unwrap_or(0)));
        Ok(vec![])
    });
    let seen = log.clone();
    server.register_fn(SEND_STRING, move |args| {
        seen.lock().push(format!("string {}", args[0].as_str().unwrap_or("")));
        Ok(vec![])
    });
    let frames = kernel.clone();
    server.register_fn(REQUEST_RAM, move |args| {
        let bytes = args[0].as_word().unwrap_or(0);
        let ram = frames.frame_alloc(bytes as usize)?;
        Ok(vec![Arg::Cap(ram), Arg::Word(bytes)])
    });
    let seen = log.clone();
    server.register_fn(PROC_SPAWN, move |args| {
        let cmdline = args[0].as_str().unwrap_or("").to_owned();
        let core = args[1].as_word().unwrap_or(0);
        seen.lock().push(format!("spawn {cmdline} on {core}"));
        Ok(vec![Arg::Word(42)])
    });
    server.register_fn(GET_PROC_NAME, |args| match args[0].as_word() {
        Some(42) => Ok(vec![Arg::from("hello")]),
        _ => Ok(vec![Arg::from("unknown")]),
    });
    let seen = log.clone();
    server.register_fn(PUTCHAR, move |args| {
        let c = args[0].as_word().unwrap_or(0) as u8 as char;
        seen.lock().push(format!("putchar {c}"));
        Ok(vec![])
    });
    let mut input = b"ls -l\rignored".iter().copied().cycle();
    server.register_fn(GETCHAR, move |_| Ok(vec![Arg::Word(u64::from(input.next().unwrap_or(0)))]));
    server.register_fn(ROUNDTRIP, |_| Ok(vec![]));
    server.register_fn(GET_PROC_LIST, |_| Ok(vec![Arg::Word(3), Arg::from("1,7,42,")]));
}

/// Points both capability endpoints at each other without the initiate call.
fn bind<A: CapEndpoint, B: CapEndpoint>(client: &mut Rpc<A>, server: &mut Rpc<B>) {
    let (Some(client_ep), Some(server_ep)) = (client.endpoint_mut(), server.endpoint_mut()) else {
        panic!("capability endpoints expected");
    };
    client_ep.set_remote(server_ep.local());
    server_ep.set_remote(client_ep.local());
}

#[test]
fn default_interfaces_roundtrip() {
    let kernel = HostKernel::new();
    let log: Log = Arc::default();
    let (mut server, mut client) = connect(&kernel);
    serve_defaults(&mut server, &kernel, &log);
    let server = Server::spawn(server);

    client.initiate().unwrap();
    client.send_number(7).unwrap();
    client.send_string("over the page").unwrap();
    let (ram, bytes) = client.get_ram_cap(8192, 4096).unwrap();
    assert_eq!(bytes, 8192);
    assert_eq!(kernel.map_frame(ram).unwrap().len(), 8192);
    assert_eq!(client.process_spawn("hello world", 1).unwrap(), 42);
    assert_eq!(client.process_get_name(42).unwrap(), "hello");
    client.serial_putchar(b'x').unwrap();
    assert_eq!(client.get_terminal_input(16).unwrap(), "ls -l");
    assert_eq!(client.process_get_all_pids().unwrap(), [1, 7, 42]);
    client.roundtrip().unwrap();
    assert!(!client.is_call_outstanding());

    let server = server.shutdown();
    let client_cap = client.endpoint().unwrap().local();
    assert_eq!(server.endpoint().unwrap().remote(), Some(client_cap));
    assert_eq!(
        *log.lock(),
        vec![
            "number 7".to_owned(),
            "string over the page".to_owned(),
            "spawn hello world on 1".to_owned(),
            "putchar x".to_owned(),
        ]
    );
}

#[test]
fn strings_cross_in_both_directions() {
    const CONCAT: MsgType = MsgType(64);
    let kernel = HostKernel::new();
    let (mut server, mut client) = connect(&kernel);
    let binding = Binding::new(CONCAT, &[ArgKind::Str, ArgKind::Str], &[ArgKind::Str]);
    server.register_binding(binding.clone()).unwrap();
    client.register_binding(binding).unwrap();
    server.register_fn(CONCAT, |args| {
        let joined = format!("{}{}", args[0].as_str().unwrap_or(""), args[1].as_str().unwrap_or(""));
        Ok(vec![Arg::Str(joined)])
    });
    let server = Server::spawn(server);

    client.initiate().unwrap();
    for (a, b) in [("buffer ", "page"), ("", "x"), ("second call reuses ", "the page")] {
        let rets = client.call(CONCAT, &[Arg::from(a), Arg::from(b)]).unwrap();
        assert_eq!(rets, vec![Arg::Str(format!("{a}{b}"))]);
    }
    server.shutdown();
}

#[test]
fn wide_binding_is_rejected() {
    const WIDE: MsgType = MsgType(65);
    let kernel = HostKernel::new();
    let (mut server, _client) = connect(&kernel);
    let before: Vec<Option<Binding>> =
        [SEND_NUMBER, REQUEST_RAM, GET_PROC_NAME].map(|t| server.binding(t).cloned()).to_vec();

    let wide = Binding::new(
        WIDE,
        &[ArgKind::Word, ArgKind::Word, ArgKind::Word, ArgKind::Word, ArgKind::Cap, ArgKind::Cap],
        &[],
    );
    assert_eq!(server.register_binding(wide), Err(IpcError::NotImplemented));
    assert!(server.binding(WIDE).is_none());
    let after: Vec<Option<Binding>> =
        [SEND_NUMBER, REQUEST_RAM, GET_PROC_NAME].map(|t| server.binding(t).cloned()).to_vec();
    assert_eq!(before, after);
}

#[test]
fn foreign_message_before_reply_is_detected() {
    let kernel = HostKernel::new();
    let (mut server, mut client) = connect(&kernel);
    server.register_fn(ROUNDTRIP, |_| Ok(vec![]));
    bind(&mut client, &mut server);

    let stray = RecvMsg { words: [SEND_NUMBER.response_tag(), 0, 0, 0], cap: None };
    kernel.inject(client.endpoint().unwrap().local(), stray).unwrap();

    assert_eq!(
        client.roundtrip(),
        Err(IpcError::UnexpectedReply {
            expected: ROUNDTRIP.response_tag(),
            got: SEND_NUMBER.response_tag(),
        })
    );
    assert!(client.is_call_outstanding());
    assert_eq!(client.send_number(1), Err(IpcError::CallInProgress));

    // the real request is still queued for the server; its reply is now late
    assert_eq!(server.dispatch_pending(), Ok(Dispatch::Handled(ROUNDTRIP)));
    assert_eq!(client.on_message(), Ok(Dispatch::StrayResponse(ROUNDTRIP.response_tag())));
    assert!(!client.is_call_outstanding());

    let server = Server::spawn(server);
    client.roundtrip().unwrap();
    server.shutdown();
}

#[test]
fn handler_errors_do_not_stall_dispatch() {
    let kernel = HostKernel::new();
    let (mut server, mut client) = connect(&kernel);
    server.register_fn(SEND_NUMBER, |args| match args[0].as_word() {
        Some(0) => Err(IpcError::InvalidSize),
        _ => Ok(vec![]),
    });
    bind(&mut client, &mut server);
    let server_cap = server.endpoint().unwrap().local();

    // a request nobody answers: the handler fails, so no reply is sent
    let request = RecvMsg { words: [SEND_NUMBER.0, 0, 0, 0], cap: None };
    kernel.inject(server_cap, request).unwrap();
    assert_eq!(server.dispatch_pending(), Err(IpcError::InvalidSize));

    let unknown = RecvMsg { words: [99, 0, 0, 0], cap: None };
    kernel.inject(server_cap, unknown).unwrap();
    assert_eq!(server.dispatch_pending(), Err(IpcError::UnknownBinding(MsgType(99))));

    let cap_without_handler = RecvMsg { words: [GETCHAR.0, 0, 0, 0], cap: Some(CapRef::new(1)) };
    kernel.inject(server_cap, cap_without_handler).unwrap();
    assert_eq!(server.dispatch_pending(), Err(IpcError::NoHandler(GETCHAR)));

    let server = Server::spawn(server);
    client.send_number(5).unwrap();
    server.shutdown();
}

#[test]
fn transient_receive_is_retried() {
    let kernel = HostKernel::new();
    let log: Log = Arc::default();
    let (server_ep, client_ep) = kernel.channel().unwrap();
    let mut server = Rpc::new(Flaky::new(server_ep), kernel.clone()).unwrap();
    let mut client = Rpc::new(Flaky::new(client_ep), kernel.clone()).unwrap().with_yield(SpinYield);
    install_default_bindings(&mut server).unwrap();
    install_default_bindings(&mut client).unwrap();
    serve_defaults(&mut server, &kernel, &log);
    let server = Server::spawn(server);

    for _ in 0..3 {
        client.roundtrip().unwrap();
    }
    client.send_string("through a busy endpoint").unwrap();
    assert!(!client.is_call_outstanding());

    let server = server.shutdown();
    // every reply and every request hit one transient failure before arriving
    assert!(client.endpoint().unwrap().failures >= 5);
    assert!(server.endpoint().unwrap().failures >= 5);
    assert_eq!(*log.lock(), vec!["string through a busy endpoint".to_owned()]);
}

#[test]
fn shared_memory_calls_carry_strings_inline() {
    let kernel = HostKernel::new();
    let log: Log = Arc::default();
    let frame = MappedFrame::zeroed(1024);
    let server_chan = UmpChannel::over_frame(&frame, 128, true).unwrap();
    let client_chan = UmpChannel::over_frame(&frame, 128, false).unwrap();
    let mut server = Rpc::<LoopbackEndpoint>::over_ump(server_chan).unwrap();
    let mut client = Rpc::<LoopbackEndpoint>::over_ump(client_chan).unwrap();
    install_default_bindings(&mut server).unwrap();
    install_default_bindings(&mut client).unwrap();
    serve_defaults(&mut server, &kernel, &log);
    let server = Server::spawn(server);

    assert_eq!(client.initiate(), Err(IpcError::NotImplemented));
    client.send_number(11).unwrap();
    client.send_string("inline, no buffer page").unwrap();
    assert_eq!(client.process_spawn("hello world", 2).unwrap(), 42);
    assert_eq!(client.process_get_name(42).unwrap(), "hello");
    assert_eq!(client.process_get_all_pids().unwrap(), [1, 7, 42]);
    assert_eq!(client.get_ram_cap(4096, 4096), Err(IpcError::NotImplemented));
    assert_eq!(client.send_string(&"x".repeat(200)), Err(IpcError::StringTooLong));
    client.roundtrip().unwrap();
    assert!(!client.is_call_outstanding());

    server.shutdown();
    assert_eq!(
        *log.lock(),
        vec![
            "number 11".to_owned(),
            "string inline, no buffer page".to_owned(),
            "spawn hello world on 2".to_owned(),
        ]
    );
}

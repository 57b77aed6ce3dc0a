//! RPC integration tests: client → pool → session → registry → handler → reply.

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use shmrpc::transport::memory::{MemoryNetwork, MemoryPool, MemorySessions};
use shmrpc::transport::tcp::{TcpConnector, TcpPool, TcpSessions, TcpStreamListener};
use shmrpc::transport::{BufferReader, BufferWriter, StreamPool};
use shmrpc::{
    Client, ClientConfig, Decode, Encode, Error, FrameLimits, Registry, Server, ServerConfig,
    ServiceBuilder,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Test services
// =============================================================================

#[derive(Debug, Default)]
struct Echo;

#[derive(Debug, Default)]
struct Arith;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Operands {
    a: i64,
    b: i64,
}

impl Encode for Operands {
    fn encode_to(&self, writer: &mut dyn BufferWriter) -> std::io::Result<()> {
        writer.write_bytes(&self.a.to_be_bytes())?;
        writer.write_bytes(&self.b.to_be_bytes())
    }
}

#[async_trait]
impl Decode for Operands {
    async fn decode_from(reader: &mut dyn BufferReader) -> std::io::Result<Self> {
        let raw = reader.read_bytes(16).await?;
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        a.copy_from_slice(&raw[..8]);
        b.copy_from_slice(&raw[8..]);
        Ok(Operands {
            a: i64::from_be_bytes(a),
            b: i64::from_be_bytes(b),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Quotient(i64);

impl Encode for Quotient {
    fn encode_to(&self, writer: &mut dyn BufferWriter) -> std::io::Result<()> {
        writer.write_bytes(&self.0.to_be_bytes())
    }
}

#[async_trait]
impl Decode for Quotient {
    async fn decode_from(reader: &mut dyn BufferReader) -> std::io::Result<Self> {
        let raw = reader.read_bytes(8).await?;
        let mut value = [0u8; 8];
        value.copy_from_slice(&raw);
        Ok(Quotient(i64::from_be_bytes(value)))
    }
}

/// Argument whose length prefix promises more than any peer will read,
/// followed by the actual bytes.
struct OversizedClaim(Bytes);

impl Encode for OversizedClaim {
    fn encode_to(&self, writer: &mut dyn BufferWriter) -> std::io::Result<()> {
        writer.write_bytes(&u64::MAX.to_be_bytes())?;
        writer.write_bytes(&self.0)
    }
}

fn echo_service() -> ServiceBuilder<Echo> {
    ServiceBuilder::new(Echo)
        .method("Ping", |_: Arc<Echo>, data: Bytes| async move {
            Ok::<_, String>(data)
        })
        .method("Discard", |_: Arc<Echo>, _: ()| async move { Ok::<_, String>(()) })
}

fn arith_service() -> ServiceBuilder<Arith> {
    ServiceBuilder::new(Arith).method("Div", |_: Arc<Arith>, ops: Operands| async move {
        if ops.b == 0 {
            Err("divide by zero".to_string())
        } else {
            Ok(Quotient(ops.a / ops.b))
        }
    })
}

// =============================================================================
// Helpers
// =============================================================================

const PAYLOAD_SIZES: [usize; 5] = [0, 1, 4096, 1024 * 1024, 32 * 1024 * 1024];

fn client_config(address: &str) -> ClientConfig {
    ClientConfig {
        address: address.to_string(),
        session_num: 2,
        acquire_timeout: Duration::from_secs(5),
        ..ClientConfig::default()
    }
}

/// Helper: register the test services and start a server on an in-process
/// address. Returns the network, the server and its accept task.
async fn start_memory_server(
    address: &str,
    server_config: ServerConfig,
) -> (
    MemoryNetwork,
    Server<MemorySessions>,
    tokio::task::JoinHandle<shmrpc::Result<()>>,
) {
    let registry = Arc::new(Registry::new());
    registry.register(echo_service()).await.unwrap();
    registry.register(arith_service()).await.unwrap();

    let network = MemoryNetwork::new();
    let listener = network.bind(address).await.unwrap();
    let server = Server::new(
        registry,
        MemorySessions::default(),
        server_config,
        FrameLimits::default(),
    );
    let handle = tokio::spawn({
        let server = server.clone();
        async move { server.accept(listener).await }
    });
    (network, server, handle)
}

/// Helper: register the test services and start a server on an ephemeral
/// loopback port. Returns the server and its address.
async fn start_tcp_server() -> (Server<TcpSessions>, std::net::SocketAddr) {
    let registry = Arc::new(Registry::new());
    registry.register(echo_service()).await.unwrap();
    registry.register(arith_service()).await.unwrap();

    let listener = TcpStreamListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(
        registry,
        TcpSessions::new(FrameLimits::default()),
        ServerConfig::default(),
        FrameLimits::default(),
    );
    tokio::spawn({
        let server = server.clone();
        async move { server.accept(listener).await }
    });
    (server, addr)
}

async fn tcp_client(addr: std::net::SocketAddr) -> Client<TcpPool> {
    Client::connect(
        &TcpConnector,
        &client_config(&addr.to_string()),
        FrameLimits::default(),
    )
    .await
    .unwrap()
}

/// Every lookup and decode failure comes back as the remote error text, and
/// the connection keeps serving, whatever the size of the unread argument.
async fn assert_error_frames_for_any_argument_size<P: StreamPool>(client: &Client<P>) {
    for size in PAYLOAD_SIZES {
        let arg = Bytes::from(vec![1u8; size]);

        let err = client.call::<_, Bytes>("Nope.Ping", &arg).await.unwrap_err();
        assert!(err.is_remote(), "{size} bytes: {err}");
        assert_eq!(err.to_string(), "rpc: can't find service Nope.Ping");

        let err = client.call::<_, Bytes>("Echo.Pong", &arg).await.unwrap_err();
        assert!(err.is_remote(), "{size} bytes: {err}");
        assert_eq!(err.to_string(), "rpc: can't find method Echo.Pong");

        let err = client.call::<_, Bytes>("EchoPing", &arg).await.unwrap_err();
        assert!(err.is_remote(), "{size} bytes: {err}");
        assert_eq!(
            err.to_string(),
            "rpc: service/method request ill-formed: EchoPing"
        );

        let err = client
            .call::<_, Bytes>("Echo.Ping", &OversizedClaim(arg.clone()))
            .await
            .unwrap_err();
        assert!(err.is_remote(), "{size} bytes: {err}");
        assert!(err.to_string().starts_with("rpc: can't read from shared memory:"));

        // Handler that never looks at its argument.
        client.call::<_, ()>("Echo.Discard", &arg).await.unwrap();
    }

    let reply: Bytes = client.call("Echo.Ping", &Bytes::from_static(b"still up")).await.unwrap();
    assert_eq!(&reply[..], b"still up");
}

async fn memory_client(network: &MemoryNetwork, address: &str) -> Client<MemoryPool> {
    Client::connect(network, &client_config(address), FrameLimits::default())
        .await
        .unwrap()
}

/// Pool wrapper counting lease and close traffic.
#[derive(Debug)]
struct CountingPool<P> {
    inner: P,
    acquired: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl<P: StreamPool> StreamPool for CountingPool<P> {
    type Stream = P::Stream;

    async fn acquire_stream(&self) -> std::io::Result<Self::Stream> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        self.inner.acquire_stream().await
    }

    fn release_stream(&self, stream: Self::Stream) {
        self.inner.release_stream(stream);
    }

    async fn close(&self) -> std::io::Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.inner.close().await
    }
}

// =============================================================================
// Round trips
// =============================================================================

#[tokio::test]
async fn test_pass_through_across_payload_sizes() {
    let (network, _server, _handle) = start_memory_server("echo", ServerConfig::default()).await;
    let client = memory_client(&network, "echo").await;

    for size in PAYLOAD_SIZES {
        let payload: Bytes = (0..size).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into();
        let reply: Bytes = client.call("Echo.Ping", &payload).await.unwrap();
        assert!(reply == payload, "payload mismatch at {size} bytes");
    }
}

#[tokio::test]
async fn test_typed_arguments_and_replies() {
    let (network, _server, _handle) = start_memory_server("arith", ServerConfig::default()).await;
    let client = memory_client(&network, "arith").await;

    let reply: Quotient = client
        .call("Arith.Div", &Operands { a: 84, b: 2 })
        .await
        .unwrap();
    assert_eq!(reply, Quotient(42));
}

#[tokio::test]
async fn test_handler_error_surfaces_verbatim() {
    let (network, _server, _handle) = start_memory_server("arith", ServerConfig::default()).await;
    let client = memory_client(&network, "arith").await;

    let err = client
        .call::<_, Quotient>("Arith.Div", &Operands { a: 1, b: 0 })
        .await
        .unwrap_err();
    assert!(matches!(&err, Error::Remote(text) if text == "divide by zero"));

    // Connection stays usable after a remote error.
    let reply: Quotient = client
        .call("Arith.Div", &Operands { a: 9, b: 3 })
        .await
        .unwrap();
    assert_eq!(reply, Quotient(3));
}

#[tokio::test]
async fn test_error_frames_for_any_argument_size() {
    let (network, _server, _handle) = start_memory_server("svc", ServerConfig::default()).await;
    let client = memory_client(&network, "svc").await;

    assert_error_frames_for_any_argument_size(&client).await;
}

#[tokio::test]
async fn test_tcp_error_frames_for_any_argument_size() {
    let (server, addr) = start_tcp_server().await;
    let client = tcp_client(addr).await;

    assert_error_frames_for_any_argument_size(&client).await;

    client.close().await.unwrap();
    server.shutdown();
}

#[tokio::test]
async fn test_argument_type_mismatch_is_remote_protocol_error() {
    let (network, _server, _handle) = start_memory_server("svc", ServerConfig::default()).await;
    let client = memory_client(&network, "svc").await;

    // Arith.Div wants 16 bytes; a one-byte payload (8-byte prefix + 1) is 9.
    let err = client
        .call::<_, Quotient>("Arith.Div", &Bytes::from_static(b"x"))
        .await
        .unwrap_err();
    assert!(err.is_remote());
    assert!(err.to_string().starts_with("rpc: can't read from shared memory:"));
}

#[tokio::test]
async fn test_concurrent_callers_with_random_payloads() {
    let (network, _server, _handle) = start_memory_server("echo", ServerConfig::default()).await;
    let client = Arc::new(memory_client(&network, "echo").await);

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let client = Arc::clone(&client);
        tasks.push(tokio::spawn(async move {
            for _ in 0..20 {
                let payload: Bytes = {
                    let mut rng = rand::thread_rng();
                    let mut buf = vec![0u8; rng.gen_range(0..16 * 1024)];
                    rng.fill(&mut buf[..]);
                    buf.into()
                };
                let reply: Bytes = client.call("Echo.Ping", &payload).await.unwrap();
                assert_eq!(reply, payload);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}

// =============================================================================
// Client lifecycle
// =============================================================================

#[tokio::test]
async fn test_call_after_close_never_touches_pool() {
    let (network, _server, _handle) = start_memory_server("echo", ServerConfig::default()).await;
    let acquired = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicUsize::new(0));
    let pool = CountingPool {
        inner: shmrpc::transport::Connector::connect(
            &network,
            &client_config("echo"),
            FrameLimits::default(),
        )
        .await
        .unwrap(),
        acquired: Arc::clone(&acquired),
        closed: Arc::clone(&closed),
    };
    let client = Client::new(pool, FrameLimits::default());

    let _: Bytes = client.call("Echo.Ping", &Bytes::new()).await.unwrap();
    assert_eq!(acquired.load(Ordering::SeqCst), 1);

    client.close().await.unwrap();
    let err = client.call::<_, Bytes>("Echo.Ping", &Bytes::new()).await.unwrap_err();
    assert!(matches!(err, Error::Shutdown));
    assert_eq!(err.to_string(), "connection is shut down");
    assert_eq!(acquired.load(Ordering::SeqCst), 1);

    assert!(matches!(client.close().await, Err(Error::Shutdown)));
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_connect_without_listener_fails() {
    let network = MemoryNetwork::new();
    let err = Client::connect(&network, &client_config("nowhere"), FrameLimits::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "TRANSPORT");
    assert!(err.to_string().starts_with("rpc: can't create client"));
}

// =============================================================================
// Registry through the server
// =============================================================================

#[tokio::test]
async fn test_duplicate_registration_keeps_first_service() {
    let (network, server, _handle) = start_memory_server("echo", ServerConfig::default()).await;

    let err = server
        .registry()
        .register(
            ServiceBuilder::named("Echo", Arith).method("Ping", |_: Arc<Arith>, _: Bytes| async move {
                Ok::<_, String>(Bytes::from_static(b"impostor"))
            }),
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "rpc: service already defined: Echo");

    let client = memory_client(&network, "echo").await;
    let reply: Bytes = client
        .call("Echo.Ping", &Bytes::from_static(b"original"))
        .await
        .unwrap();
    assert_eq!(&reply[..], b"original");
}

#[tokio::test]
async fn test_services_registered_after_start_are_callable() {
    let (network, server, _handle) = start_memory_server("late", ServerConfig::default()).await;
    let client = memory_client(&network, "late").await;

    let err = client.call::<_, String>("Greeter.Hello", "bob").await.unwrap_err();
    assert_eq!(err.to_string(), "rpc: can't find service Greeter.Hello");

    #[derive(Debug)]
    struct Greeter;
    server
        .registry()
        .register(ServiceBuilder::new(Greeter).method(
            "Hello",
            |_: Arc<Greeter>, name: String| async move { Ok::<_, String>(format!("hello {name}")) },
        ))
        .await
        .unwrap();

    let reply: String = client.call("Greeter.Hello", "bob").await.unwrap();
    assert_eq!(reply, "hello bob");
}

// =============================================================================
// Server behaviour
// =============================================================================

#[tokio::test]
async fn test_stream_dispatch_is_bounded() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    #[derive(Debug)]
    struct Slow {
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    let registry = Arc::new(Registry::new());
    registry
        .register(
            ServiceBuilder::new(Slow {
                in_flight: Arc::clone(&in_flight),
                peak: Arc::clone(&peak),
            })
            .method("Work", |slow: Arc<Slow>, _: ()| async move {
                let now = slow.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                slow.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                slow.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, String>(())
            }),
        )
        .await
        .unwrap();

    let network = MemoryNetwork::new();
    let listener = network.bind("slow").await.unwrap();
    let server = Server::new(
        registry,
        MemorySessions::default(),
        ServerConfig {
            max_concurrent_streams: 2,
            ..ServerConfig::default()
        },
        FrameLimits::default(),
    );
    tokio::spawn({
        let server = server.clone();
        async move { server.accept(listener).await }
    });

    let client = Arc::new(memory_client(&network, "slow").await);
    let calls: Vec<_> = (0..8)
        .map(|_| {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.call::<_, ()>("Slow.Work", &()).await })
        })
        .collect();
    for call in calls {
        call.await.unwrap().unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 2, "peak was {}", peak.load(Ordering::SeqCst));
    assert_eq!(in_flight.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_accept_loop_ends_on_listener_error() {
    let (network, _server, handle) = start_memory_server("gone", ServerConfig::default()).await;

    assert!(network.unbind("gone").await);
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.unwrap_err().code(), "IO");
}

#[tokio::test]
async fn test_shutdown_stops_accept_loop() {
    let (_network, server, handle) = start_memory_server("stop", ServerConfig::default()).await;

    server.shutdown();
    assert!(server.is_shutdown());
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_connections_over_limit_are_rejected() {
    let config = ServerConfig {
        max_connections: 1,
        ..ServerConfig::default()
    };
    let (network, _server, _handle) = start_memory_server("one", config).await;
    let single_session = ClientConfig {
        session_num: 1,
        ..client_config("one")
    };

    let first = Client::connect(&network, &single_session, FrameLimits::default())
        .await
        .unwrap();
    let reply: Bytes = first.call("Echo.Ping", &Bytes::from_static(b"a")).await.unwrap();
    assert_eq!(&reply[..], b"a");

    let second = Client::connect(&network, &single_session, FrameLimits::default())
        .await
        .unwrap();
    let err = tokio::time::timeout(
        Duration::from_secs(5),
        second.call::<_, Bytes>("Echo.Ping", &Bytes::from_static(b"b")),
    )
    .await
    .expect("call on a rejected connection must fail, not hang")
    .unwrap_err();
    assert_eq!(err.code(), "TRANSPORT", "{err}");

    // The slot frees up once the first client goes away.
    first.close().await.unwrap();
    let served = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let third = Client::connect(&network, &single_session, FrameLimits::default())
                .await
                .unwrap();
            match third.call::<_, Bytes>("Echo.Ping", &Bytes::from_static(b"c")).await {
                Ok(reply) => break reply,
                Err(e) => {
                    assert_eq!(e.code(), "TRANSPORT", "{e}");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(&served[..], b"c");
}

#[tokio::test]
async fn test_tcp_end_to_end() {
    let (server, addr) = start_tcp_server().await;
    let client = tcp_client(addr).await;

    let payload = Bytes::from(vec![7u8; 256 * 1024]);
    let reply: Bytes = client.call("Echo.Ping", &payload).await.unwrap();
    assert_eq!(reply, payload);

    let err = client
        .call::<_, Quotient>("Arith.Div", &Operands { a: 1, b: 0 })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "divide by zero");

    client.close().await.unwrap();
    server.shutdown();
}

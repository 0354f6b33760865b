//! Integration tests for trpc.
//!
//! These tests run a real server and client against each other over TCP,
//! Unix sockets, the HTTP tunnel and in-memory pipes.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use trpc::protocol::{write_options, FrameReader, FrameWriter, Header};
use trpc::{completion_queue, Client, CodecType, Options, RpcError, Server, ServiceBuilder};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct Args {
    num1: i64,
    num2: i64,
}

struct Foo;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();
}

fn foo_server() -> Server {
    init_logging();
    let foo = ServiceBuilder::new("Foo", Foo)
        .method("Sum", |_: Arc<Foo>, args: Args| async move {
            Ok::<_, String>(args.num1 + args.num2)
        })
        .method("DelayedSum", |_: Arc<Foo>, args: Args| async move {
            let delay = (args.num1 % 7) as u64;
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok::<_, String>(args.num1 + args.num2)
        })
        .method("Sleep", |_: Arc<Foo>, ms: u64| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, String>(ms)
        })
        .method("Words", |_: Arc<Foo>, text: String| async move {
            let mut counts = BTreeMap::new();
            for word in text.split_whitespace() {
                *counts.entry(word.to_string()).or_insert(0u32) += 1;
            }
            Ok::<_, String>(counts)
        })
        .build()
        .unwrap();

    Server::builder().register(foo).unwrap().build()
}

async fn start_server() -> (Server, SocketAddr) {
    let server = foo_server();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let accepting = server.clone();
    tokio::spawn(async move { accepting.accept(listener).await });
    (server, addr)
}

async fn start_http_server() -> (Server, SocketAddr) {
    let server = foo_server();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let accepting = server.clone();
    tokio::spawn(async move { accepting.accept_http(listener).await });
    (server, addr)
}

/// Registering `Foo.Sum` and calling it with 2 and 3 yields 5.
#[tokio::test]
async fn test_sum_round_trip() {
    let (server, addr) = start_server().await;
    let client = Client::dial(addr, Options::default()).await.unwrap();

    let sum: i64 = client.call("Foo.Sum", &Args { num1: 2, num2: 3 }).await.unwrap();
    assert_eq!(sum, 5);
    assert_eq!(server.num_calls("Foo.Sum"), Some(1));
    assert_eq!(server.num_calls("Foo.Missing"), None);

    client.close().await.unwrap();
}

/// An unregistered service is reported, not timed out.
#[tokio::test]
async fn test_unknown_service() {
    let (_server, addr) = start_server().await;
    let client = Client::dial(addr, Options::default()).await.unwrap();

    let result = client.call::<_, i64>("Bar.Sum", &Args { num1: 1, num2: 1 }).await;
    match result {
        Err(RpcError::Remote(text)) => assert!(text.contains("unknown service")),
        other => panic!("expected remote error, got {:?}", other),
    }

    let result = client.call::<_, i64>("Foo.Product", &Args { num1: 1, num2: 1 }).await;
    assert!(matches!(result, Err(RpcError::Remote(ref t)) if t.contains("unknown method")));

    // The connection is still usable.
    let sum: i64 = client.call("Foo.Sum", &Args { num1: 1, num2: 1 }).await.unwrap();
    assert_eq!(sum, 2);
}

/// Concurrent calls each get their own reply, never another call's.
#[tokio::test]
async fn test_concurrent_calls_no_cross_talk() {
    let (_server, addr) = start_server().await;
    let client = Arc::new(Client::dial(addr, Options::default()).await.unwrap());

    let mut calls = Vec::new();
    for i in 0..100i64 {
        let client = client.clone();
        calls.push(tokio::spawn(async move {
            let args = Args { num1: i, num2: i * 1000 };
            let sum: i64 = client.call("Foo.DelayedSum", &args).await.unwrap();
            (i, sum)
        }));
    }

    for call in calls {
        let (i, sum) = call.await.unwrap();
        assert_eq!(sum, i + i * 1000);
    }
}

/// Sequence numbers are strictly increasing.
#[tokio::test]
async fn test_sequence_numbers_increase() {
    let (_server, addr) = start_server().await;
    let client = Client::dial(addr, Options::default()).await.unwrap();

    let (tx, mut rx) = completion_queue::<i64>(32).unwrap();
    let mut seqs = Vec::new();
    for i in 0..20i64 {
        let call = client
            .go("Foo.DelayedSum", &Args { num1: i, num2: 1 }, Some(tx.clone()))
            .await;
        seqs.push(call.seq());
    }
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(seqs[0], 1);

    let mut by_seq = BTreeMap::new();
    for _ in 0..20 {
        let call = rx.recv().await.unwrap();
        let seq = call.seq;
        assert!(by_seq.insert(seq, call.into_result().unwrap()).is_none());
    }
    for (i, seq) in seqs.iter().enumerate() {
        assert_eq!(by_seq[seq], i as i64 + 1);
    }
}

/// A peer that drops the connection fails every pending call.
#[tokio::test]
async fn test_server_close_fails_pending_calls() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // Reads the handshake and some request bytes, then hangs up.
    let peer = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 256];
        let _ = stream.read(&mut buf).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    });

    let client = Arc::new(Client::dial(addr, Options::default()).await.unwrap());
    let mut calls = Vec::new();
    for i in 0..8u64 {
        let client = client.clone();
        calls.push(tokio::spawn(async move {
            client.call::<_, u64>("Foo.Sleep", &i).await
        }));
    }

    for call in calls {
        let result = tokio::time::timeout(Duration::from_secs(5), call)
            .await
            .expect("pending call hung")
            .unwrap();
        assert!(result.is_err());
    }
    assert!(!client.is_available());
    peer.await.unwrap();
}

/// A handler slower than the handle timeout gets a timeout response on time.
#[tokio::test]
async fn test_handle_timeout() {
    let (_server, addr) = start_server().await;
    let options = Options::default().handle_timeout(Duration::from_millis(100));
    let client = Client::dial(addr, options).await.unwrap();

    let start = Instant::now();
    let result = client.call::<_, u64>("Foo.Sleep", &2000u64).await;
    let elapsed = start.elapsed();

    match result {
        Err(RpcError::Remote(text)) => {
            assert!(text.contains("handle timeout"));
            assert!(!text.contains("unknown"));
        }
        other => panic!("expected timeout error, got {:?}", other),
    }
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(1000));

    // Fast calls on the same connection are unaffected.
    let slept: u64 = client.call("Foo.Sleep", &1u64).await.unwrap();
    assert_eq!(slept, 1);
}

/// Raw bytes written by concurrent handlers re-parse as strict frames.
#[tokio::test]
async fn test_concurrent_responses_never_interleave() {
    let server = foo_server();
    let (client_end, server_end) = tokio::io::duplex(1024);
    let serving = tokio::spawn(async move { server.serve_conn(server_end).await });

    let (mut read_half, write_half) = tokio::io::split(client_end);
    let requests = tokio::spawn(async move {
        let mut write_half = write_half;
        write_options(&mut write_half, &Options::default()).await.unwrap();
        let mut writer = FrameWriter::new(write_half, CodecType::MsgPack);
        for seq in 1..=50u64 {
            let args = Args { num1: seq as i64, num2: 0 };
            writer
                .write(&Header::request("Foo.DelayedSum", seq), &args)
                .await
                .unwrap();
        }
        writer.shutdown().await.unwrap();
    });

    let mut captured = Vec::new();
    read_half.read_to_end(&mut captured).await.unwrap();
    requests.await.unwrap();
    serving.await.unwrap();

    let mut reader = FrameReader::new(&captured[..], CodecType::MsgPack);
    let mut seen = Vec::new();
    while let Some(header) = reader.read_header().await.unwrap() {
        assert!(!header.is_error());
        let sum: i64 = reader.read_body_as().await.unwrap();
        assert_eq!(sum, header.seq as i64);
        seen.push(header.seq);
    }
    seen.sort_unstable();
    assert_eq!(seen, (1..=50).collect::<Vec<_>>());
}

/// A wrong magic number closes the connection before any frame.
#[tokio::test]
async fn test_magic_number_mismatch() {
    let (_server, addr) = start_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let options = Options {
        magic_number: 0x123456,
        ..Options::default()
    };
    write_options(&mut stream, &options).await.unwrap();

    let mut received = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut received)).await;
    assert!(read.is_ok());
    assert!(received.is_empty());
}

/// The same through the client: the call fails, nothing hangs.
#[tokio::test]
async fn test_magic_number_mismatch_client() {
    let (_server, addr) = start_server().await;
    let options = Options {
        magic_number: 0x123456,
        ..Options::default()
    };
    let client = Client::dial(addr, options).await.unwrap();

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        client.call::<_, i64>("Foo.Sum", &Args { num1: 2, num2: 3 }),
    )
    .await
    .expect("call hung");
    assert!(result.is_err());
}

/// JSON codec end to end, including a map reply built fresh per call.
#[tokio::test]
async fn test_json_codec() {
    let (_server, addr) = start_server().await;
    let client = Client::dial(addr, Options::default().codec(CodecType::Json))
        .await
        .unwrap();
    assert_eq!(client.codec(), CodecType::Json);

    let counts: BTreeMap<String, u32> = client.call("Foo.Words", &"a b a").await.unwrap();
    assert_eq!(counts.get("a"), Some(&2));
    assert_eq!(counts.get("b"), Some(&1));

    let counts: BTreeMap<String, u32> = client.call("Foo.Words", &"").await.unwrap();
    assert!(counts.is_empty());
}

/// HTTP `CONNECT` tunnel, via `dial_http` and `xdial`.
#[tokio::test]
async fn test_http_tunnel() {
    let (_server, addr) = start_http_server().await;

    let client = Client::dial_http(addr, Options::default()).await.unwrap();
    let sum: i64 = client.call("Foo.Sum", &Args { num1: 2, num2: 3 }).await.unwrap();
    assert_eq!(sum, 5);

    let client = Client::xdial(&format!("http@{}", addr), Options::default())
        .await
        .unwrap();
    let sum: i64 = client.call("Foo.Sum", &Args { num1: 4, num2: 5 }).await.unwrap();
    assert_eq!(sum, 9);
}

/// Any method other than `CONNECT` gets a 405.
#[tokio::test]
async fn test_http_non_connect_rejected() {
    let (_server, addr) = start_http_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream
        .write_all(b"GET /_trpc_ HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.0 405"));
}

#[tokio::test]
async fn test_xdial_tcp() {
    let (_server, addr) = start_server().await;

    let client = Client::xdial(&format!("tcp@{}", addr), Options::default())
        .await
        .unwrap();
    let sum: i64 = client.call("Foo.Sum", &Args { num1: 1, num2: 2 }).await.unwrap();
    assert_eq!(sum, 3);
}

#[cfg(unix)]
#[tokio::test]
async fn test_unix_socket() {
    use trpc::transport::{temp_socket_path, UnixSocketListener};

    let server = foo_server();
    let path = temp_socket_path();
    let listener = UnixSocketListener::bind(&path).unwrap();
    tokio::spawn(async move { server.accept(listener).await });

    let client = Client::dial_unix(&path, Options::default()).await.unwrap();
    let sum: i64 = client.call("Foo.Sum", &Args { num1: 2, num2: 3 }).await.unwrap();
    assert_eq!(sum, 5);

    let address = format!("unix@{}", path.display());
    let client = Client::xdial(&address, Options::default()).await.unwrap();
    let sum: i64 = client.call("Foo.Sum", &Args { num1: 3, num2: 3 }).await.unwrap();
    assert_eq!(sum, 6);
}

#[tokio::test]
async fn test_call_timeout_against_server() {
    let (_server, addr) = start_server().await;
    let client = Client::dial(addr, Options::default()).await.unwrap();

    let result = client
        .call_timeout::<_, u64>("Foo.Sleep", &500u64, Duration::from_millis(50))
        .await;
    assert!(matches!(result, Err(RpcError::CallTimeout(_))));

    let sum: i64 = client
        .call_timeout("Foo.Sum", &Args { num1: 2, num2: 3 }, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(sum, 5);
}

#[tokio::test]
async fn test_close_is_not_repeatable() {
    let (_server, addr) = start_server().await;
    let client = Client::dial(addr, Options::default()).await.unwrap();
    assert!(client.is_available());

    client.close().await.unwrap();
    assert!(!client.is_available());
    assert!(matches!(client.close().await, Err(RpcError::Shutdown)));

    let result = client.call::<_, i64>("Foo.Sum", &Args { num1: 2, num2: 3 }).await;
    assert!(matches!(result, Err(RpcError::Shutdown)));
}

#[tokio::test]
async fn test_close_fails_in_flight_calls_with_shutdown() {
    let (_server, addr) = start_server().await;
    let client = Arc::new(Client::dial(addr, Options::default()).await.unwrap());

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.call::<_, u64>("Foo.Sleep", &1000u64).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.close().await.unwrap();
    let result = pending.await.unwrap();
    assert!(matches!(result, Err(RpcError::Shutdown)));
}

#[test]
fn test_zero_capacity_completion_queue_refused() {
    assert!(matches!(
        completion_queue::<i64>(0),
        Err(RpcError::UnbufferedCompletion)
    ));
}

#[tokio::test]
async fn test_connect_refused_is_error() {
    // Bind then drop to get a port nothing listens on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = Client::dial(addr, Options::default()).await;
    assert!(matches!(result, Err(RpcError::Io(_))));
}

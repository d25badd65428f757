use std::{net::SocketAddr, time::Duration};

use futures::future::BoxFuture;
use tokio::time::timeout;
use udpipe::{
    BoxError, Buffer, Datagram, Fault, LinkOptions, Middleware, Next, Pipeline, PipelinedChannel, Received, RecvError,
};

const WAIT: Duration = Duration::from_secs(2);

async fn keep_even(n: u64, next: Next<u64>) -> Result<(), BoxError> {
    if n % 2 == 0 {
        next.send(n).await?;
    }
    Ok(())
}

async fn square(n: u64, next: Next<u64>) -> Result<(), BoxError> {
    next.send(n * n).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stages_in_series() {
    let filter = udpipe::stage(keep_even).build();
    let squares = udpipe::stage(square).parallelism(4).build();
    let sink = Buffer::bounded(64);
    filter.link_to(squares.clone(), LinkOptions::BIDIRECTIONAL);
    squares.link_to(sink.clone(), LinkOptions::BIDIRECTIONAL);

    for n in 0..20 {
        filter.offer(n).await.unwrap();
    }
    filter.complete();

    let mut got = Vec::new();
    while let Ok(n) = timeout(WAIT, sink.recv()).await.unwrap() {
        got.push(n);
    }
    got.sort_unstable();
    assert_eq!(got, (0..20).filter(|n| n % 2 == 0).map(|n| n * n).collect::<Vec<_>>());
    timeout(WAIT, squares.completion().wait()).await.unwrap().unwrap();
}

#[tokio::test]
async fn fault_reaches_head() {
    let filter = udpipe::stage(keep_even).build();
    let sink = Buffer::bounded(4);
    filter.link_to(sink.clone(), LinkOptions::BIDIRECTIONAL);

    sink.fault(Fault::Cancelled);
    let res = timeout(WAIT, filter.completion().wait()).await.unwrap();
    assert!(res.unwrap_err().is_cancelled());
    assert!(filter.offer(2).await.is_err());
}

/// Adds a one byte marker on the way out and strips it on the way in.
struct Header;

impl Middleware for Header {
    fn send(&self, datagram: Datagram, next: Next<Datagram>) -> BoxFuture<'_, Result<(), BoxError>> {
        Box::pin(async move {
            let mut payload = vec![0xaa];
            payload.extend_from_slice(datagram.payload());
            next.send(datagram.with_payload(payload)).await?;
            Ok::<_, BoxError>(())
        })
    }

    fn receive(&self, received: Received, next: Next<Received>) -> BoxFuture<'_, Result<(), BoxError>> {
        Box::pin(async move {
            let datagram = received?;
            if datagram.payload().first() != Some(&0xaa) {
                return Err(BoxError::from("missing header"));
            }
            next.send(Ok(datagram.with_payload(datagram.payload().slice(1..)))).await?;
            Ok::<_, BoxError>(())
        })
    }
}

/// Drops datagrams whose payload starts with `#`.
struct DropComments;

impl Middleware for DropComments {
    fn receive(&self, received: Received, next: Next<Received>) -> BoxFuture<'_, Result<(), BoxError>> {
        Box::pin(async move {
            if !matches!(&received, Ok(datagram) if datagram.payload().starts_with(b"#")) {
                next.send(received).await?;
            }
            Ok::<_, BoxError>(())
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pipelined_peers() {
    let pipeline = Pipeline::new().use_after(Header).use_before(DropComments);
    let loopback: SocketAddr = "127.0.0.1:0".parse().unwrap();

    let a = PipelinedChannel::new(udpipe::channel(loopback).build(), &pipeline);
    let b = PipelinedChannel::new(udpipe::channel(loopback).build(), &pipeline);
    a.start().unwrap();
    b.start().unwrap();
    let b_addr = b.channel().local_addr().unwrap();

    for payload in ["one", "# skipped", "two"] {
        a.send(Datagram::new(payload.as_bytes().to_vec(), b_addr)).await.unwrap();
    }

    let mut got = Vec::new();
    for _ in 0..2 {
        let datagram = timeout(WAIT, b.recv()).await.unwrap().unwrap().unwrap();
        got.push(datagram.payload().to_vec());
    }
    assert_eq!(got, vec![b"one".to_vec(), b"two".to_vec()]);

    a.complete();
    b.complete();
    timeout(WAIT, a.completion().wait()).await.unwrap().unwrap();
    timeout(WAIT, b.completion().wait()).await.unwrap().unwrap();
    assert!(matches!(timeout(WAIT, b.recv()).await.unwrap(), Err(RecvError::Closed)));
}

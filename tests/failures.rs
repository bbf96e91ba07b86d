//! Wire-level tests of the failure response protocol, driven with a raw
//! framed client so the exact frames can be asserted.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use curvemq::{Access, Allow, AuthLevel, Config, Handle, Node, PubKey};

use common::{TestClient, frames};

fn any_addr() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

async fn ready_client(handle: &Handle) -> TestClient {
    let mut client = TestClient::connect(handle.local_addrs()[0]).await;
    client.handshake().await;
    client
}

#[tokio::test]
async fn unknown_command() {
    let mut node = Node::new(Config::default());
    node.listen_plain(any_addr(), None);
    let handle = node.start().await.unwrap();

    let mut client = ready_client(&handle).await;
    client.send(&[b"a.a"]).await;
    assert_eq!(client.recv().await, frames(&[b"UNKNOWNCOMMAND", b"a.a"]));

    handle.shutdown().unwrap();
}

#[tokio::test]
async fn no_reply_tag() {
    let mut node = Node::new(Config::default());
    node.add_category("x", AuthLevel::None)
        .unwrap()
        .add_request_command("r", |message| {
            message.send_reply([Bytes::from_static(b"a")]);
        })
        .unwrap();
    node.listen_plain(any_addr(), None);
    let handle = node.start().await.unwrap();

    let mut client = ready_client(&handle).await;

    // A request command without its reply tag frame.
    client.send(&[b"x.r"]).await;
    assert_eq!(client.recv().await, frames(&[b"NO_REPLY_TAG", b"x.r"]));

    // With the tag supplied the request goes through.
    client.send(&[b"x.r", b"foo"]).await;
    assert_eq!(client.recv().await, frames(&[b"REPLY", b"foo", b"a"]));

    handle.shutdown().unwrap();
}

#[tokio::test]
async fn authorization_ladder() {
    let mut node = Node::new(Config::default());
    node.add_category("x", AuthLevel::Basic)
        .unwrap()
        .add_command("x", |message| {
            message.send_back([Bytes::from_static(b"a")]);
        })
        .unwrap();
    node.add_category("y", AuthLevel::Admin)
        .unwrap()
        .add_command("x", |message| {
            message.send_back([Bytes::from_static(b"b")]);
        })
        .unwrap();

    // First connection gets none, second basic, third admin.
    let count = Arc::new(AtomicUsize::new(0));
    node.listen_plain(
        any_addr(),
        Some(Arc::new(move |_addr: &SocketAddr, _pubkey: Option<&PubKey>| {
            let level = match count.fetch_add(1, Ordering::SeqCst) {
                0 => AuthLevel::None,
                1 => AuthLevel::Basic,
                _ => AuthLevel::Admin,
            };
            Allow {
                level,
                service_node: false,
            }
        })),
    );
    let handle = node.start().await.unwrap();

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(ready_client(&handle).await);
    }

    for client in &mut clients {
        client.send(&[b"x.x"]).await;
    }

    assert_eq!(clients[0].recv().await, frames(&[b"FORBIDDEN", b"x.x"]));
    assert_eq!(clients[1].recv().await, frames(&[b"a"]));
    assert_eq!(clients[2].recv().await, frames(&[b"a"]));

    for client in &mut clients {
        client.send(&[b"y.x"]).await;
    }

    assert_eq!(clients[0].recv().await, frames(&[b"FORBIDDEN", b"y.x"]));
    assert_eq!(clients[1].recv().await, frames(&[b"FORBIDDEN", b"y.x"]));
    assert_eq!(clients[2].recv().await, frames(&[b"b"]));

    handle.shutdown().unwrap();
}

#[tokio::test]
async fn local_service_node_gate() {
    // The node is not configured as a service node, but the category is only
    // served by one.
    let access = Access {
        level: AuthLevel::None,
        remote_sn_only: false,
        local_sn_only: true,
    };

    let mut node = Node::new(Config::default());
    node.add_category("x", access)
        .unwrap()
        .add_command("x", |_| {})
        .unwrap()
        .add_request_command("r", |message| message.send_reply([]))
        .unwrap();
    node.listen_plain(any_addr(), None);
    let handle = node.start().await.unwrap();

    let mut client = ready_client(&handle).await;

    client.send(&[b"x.x"]).await;
    assert_eq!(
        client.recv().await,
        frames(&[b"NOT_A_SERVICE_NODE", b"x.x"])
    );

    // The request variant reports through the reply channel so the caller's
    // correlation table is notified instead of timing out.
    client.send(&[b"x.r", b"xyz123"]).await;
    assert_eq!(
        client.recv().await,
        frames(&[b"NOT_A_SERVICE_NODE", b"REPLY", b"xyz123"])
    );

    handle.shutdown().unwrap();
}

#[tokio::test]
async fn remote_service_node_gate() {
    // The peer must be a recognised service node, and is not.
    let access = Access {
        level: AuthLevel::None,
        remote_sn_only: true,
        local_sn_only: false,
    };

    let mut node = Node::new(Config::default());
    node.add_category("x", access)
        .unwrap()
        .add_command("x", |_| {})
        .unwrap()
        .add_request_command("r", |message| message.send_reply([]))
        .unwrap();
    node.listen_plain(any_addr(), None);
    let handle = node.start().await.unwrap();

    let mut client = ready_client(&handle).await;

    client.send(&[b"x.x"]).await;
    assert_eq!(client.recv().await, frames(&[b"FORBIDDEN_SN", b"x.x"]));

    client.send(&[b"x.r", b"xyz123"]).await;
    assert_eq!(
        client.recv().await,
        frames(&[b"FORBIDDEN_SN", b"REPLY", b"xyz123"])
    );

    handle.shutdown().unwrap();
}

#[tokio::test]
async fn local_service_node_gate_opens_when_configured() {
    let access = Access {
        level: AuthLevel::None,
        remote_sn_only: false,
        local_sn_only: true,
    };

    let mut node = Node::new(Config {
        service_node: true,
        ..Config::default()
    });
    node.add_category("x", access)
        .unwrap()
        .add_request_command("r", |message| {
            message.send_reply([Bytes::from_static(b"served")]);
        })
        .unwrap();
    node.listen_plain(any_addr(), None);
    let handle = node.start().await.unwrap();

    let mut client = ready_client(&handle).await;
    client.send(&[b"x.r", b"tag1"]).await;
    assert_eq!(
        client.recv().await,
        frames(&[b"REPLY", b"tag1", b"served"])
    );

    handle.shutdown().unwrap();
}

#[tokio::test]
async fn panicking_handler_reports_failure() {
    let mut node = Node::new(Config::default());
    node.add_category("x", AuthLevel::None)
        .unwrap()
        .add_request_command("boom", |_| panic!("handler fault"))
        .unwrap()
        .add_request_command("r", |message| {
            message.send_reply([Bytes::from_static(b"alive")]);
        })
        .unwrap();
    node.listen_plain(any_addr(), None);
    let handle = node.start().await.unwrap();

    let mut client = ready_client(&handle).await;
    client.send(&[b"x.boom", b"tag-b"]).await;
    assert_eq!(
        client.recv().await,
        frames(&[b"HANDLER_FAILURE", b"REPLY", b"tag-b"])
    );

    // The worker slot went back to the pool; the node keeps serving.
    client.send(&[b"x.r", b"tag-r"]).await;
    assert_eq!(client.recv().await, frames(&[b"REPLY", b"tag-r", b"alive"]));

    handle.shutdown().unwrap();
}

#[tokio::test]
async fn bad_handshake_is_discarded_without_reply() {
    let mut node = Node::new(Config::default());
    node.listen_plain(any_addr(), None);
    let handle = node.start().await.unwrap();

    let mut client = TestClient::connect(handle.local_addrs()[0]).await;
    client.send(&[b"HELLO THERE"]).await;
    client.expect_close().await;

    handle.shutdown().unwrap();
}

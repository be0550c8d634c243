//! TCP RPC happy path and the client-side error contract.

mod common;

use anyhow::Result;
use common::{BoolMsg, EchoBoolService};

use cmsg::{Client, ClientError, InvokeReply, Server, ServiceDescriptor};

static TEST_DESCRIPTOR: ServiceDescriptor = ServiceDescriptor {
    name: "cmsg-test",
    methods: &["simple_rpc_test", "simple_oneway_test"],
};

const ADDR: &str = "127.0.0.1";

#[tokio::test]
async fn tcp_rpc_round_trip() -> Result<()> {
    let service = EchoBoolService::new(&TEST_DESCRIPTOR);
    let server = Server::tcp(ADDR.parse()?, 18888, None, service.clone())?;
    server.start().await?;

    let client = Client::tcp(ADDR.parse()?, 18888, None, &TEST_DESCRIPTOR)?;
    let reply: InvokeReply<BoolMsg> = client
        .invoke("simple_rpc_test", &BoolMsg { value: true })
        .await?;

    assert_eq!(reply, InvokeReply::Ok(Some(BoolMsg { value: true })));
    assert_eq!(service.calls(), 1);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn unknown_method_reports_not_found() -> Result<()> {
    let service = EchoBoolService::new(&TEST_DESCRIPTOR);
    let server = Server::tcp(ADDR.parse()?, 18889, None, service.clone())?;
    server.start().await?;

    // A descriptor whose extra method the server does not know.
    static WIDE_DESCRIPTOR: ServiceDescriptor = ServiceDescriptor {
        name: "cmsg-test",
        methods: &["simple_rpc_test", "simple_oneway_test", "missing_method"],
    };
    let client = Client::tcp(ADDR.parse()?, 18889, None, &WIDE_DESCRIPTOR)?;
    let result: Result<InvokeReply<BoolMsg>, _> = client
        .invoke("missing_method", &BoolMsg { value: true })
        .await;

    assert!(matches!(result, Err(ClientError::MethodNotFound)));
    assert_eq!(service.calls(), 0);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn client_drop_filter_short_circuits() -> Result<()> {
    let service = EchoBoolService::new(&TEST_DESCRIPTOR);
    let server = Server::tcp(ADDR.parse()?, 18890, None, service.clone())?;
    server.start().await?;

    let client = Client::tcp(ADDR.parse()?, 18890, None, &TEST_DESCRIPTOR)?;
    client
        .filter()
        .set("simple_rpc_test", cmsg::FilterPolicy::Drop)?;

    let reply: InvokeReply<BoolMsg> = client
        .invoke("simple_rpc_test", &BoolMsg { value: true })
        .await?;
    assert_eq!(reply, InvokeReply::Dropped);
    // Nothing reached the wire, so the implementation never ran.
    assert_eq!(service.calls(), 0);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn echo_protocol_round_trips() -> Result<()> {
    let service = EchoBoolService::new(&TEST_DESCRIPTOR);
    let server = Server::tcp(ADDR.parse()?, 18891, None, service)?;
    server.start().await?;

    let client = Client::tcp(ADDR.parse()?, 18891, None, &TEST_DESCRIPTOR)?;
    client.send_echo_request().await?;
    client.recv_echo_reply().await?;

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn oneway_invoke_expects_no_reply() -> Result<()> {
    let service = EchoBoolService::new(&TEST_DESCRIPTOR);
    let server = Server::tcp_oneway(ADDR.parse()?, 18892, None, service.clone())?;
    server.start().await?;

    let client = Client::tcp_oneway(ADDR.parse()?, 18892, None, &TEST_DESCRIPTOR)?;
    let reply = client
        .invoke_oneway("simple_oneway_test", &BoolMsg { value: true })
        .await?;
    assert_eq!(reply, InvokeReply::Ok(None));

    // Delivery is asynchronous for oneway; give the server a moment.
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while service.calls() == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await?;

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn invoke_reconnects_after_server_restart() -> Result<()> {
    let service = EchoBoolService::new(&TEST_DESCRIPTOR);
    let server = Server::tcp(ADDR.parse()?, 18893, None, service.clone())?;
    server.start().await?;

    let client = Client::tcp(ADDR.parse()?, 18893, None, &TEST_DESCRIPTOR)?;
    let reply: InvokeReply<BoolMsg> = client
        .invoke("simple_rpc_test", &BoolMsg { value: true })
        .await?;
    assert_eq!(reply, InvokeReply::Ok(Some(BoolMsg { value: true })));

    server.stop().await;

    // The next call fails against the stopped server and closes the
    // socket; a fresh server on the same port is then reachable again.
    let second = Server::tcp(ADDR.parse()?, 18893, None, service.clone())?;
    second.start().await?;

    let reply: InvokeReply<BoolMsg> = match client
        .invoke("simple_rpc_test", &BoolMsg { value: false })
        .await
    {
        Ok(reply) => reply,
        Err(ClientError::Closed) => {
            client
                .invoke("simple_rpc_test", &BoolMsg { value: false })
                .await?
        }
        Err(e) => return Err(e.into()),
    };
    assert_eq!(reply, InvokeReply::Ok(Some(BoolMsg { value: false })));

    second.stop().await;
    Ok(())
}

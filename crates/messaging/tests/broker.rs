use std::sync::Arc;

use courier_messaging::config::{BrokerUrls, ConnectionOptions};
use courier_messaging::{
    ActionRegistrar, Broker, BrokerConfig, ConnectionEvent, ConnectionState, Error,
    EventScope, GatherOutcome, HandlerError, Initializable, Request, Response,
};
use courier_transport::TransportEvent;
use courier_transport_memory::MemoryTransport;

async fn echo(request: Request) -> Result<Response, HandlerError> {
    Ok(Response::from_value(request.data().clone()))
}

async fn knows_everything(request: Request) -> Result<GatherOutcome, HandlerError> {
    Ok(GatherOutcome::Found(Response::from_value(request.data().clone())))
}

fn config(urls: &[&str]) -> BrokerConfig {
    BrokerConfig {
        connection: ConnectionOptions {
            url: BrokerUrls::Many(urls.iter().map(ToString::to_string).collect()),
            ..ConnectionOptions::default()
        },
        ..BrokerConfig::default()
    }
}

#[tokio::test]
async fn fails_over_to_the_next_endpoint() {
    let transport = MemoryTransport::new();
    transport.refuse("amqp://primary");
    let broker = Broker::new(
        Arc::new(transport.clone()),
        config(&["amqp://primary", "amqp://secondary"]),
    );
    let mut events = broker.manager().subscribe();

    let server = broker.rpc_server("echo");
    server.consume(Arc::new(echo));
    server.initialize().await.unwrap();

    let reply: String = broker.rpc_client("echo").call("hello").await.unwrap();
    assert_eq!(reply, "hello");

    assert_eq!(
        transport.dial_attempts(),
        vec!["amqp://primary".to_string(), "amqp://secondary".to_string()]
    );
    let active = broker.manager().active_endpoint().unwrap();
    assert_eq!(active.host, "secondary");
    assert!(matches!(
        events.recv().await.unwrap(),
        ConnectionEvent::Connected(endpoint) if endpoint.host == "secondary"
    ));
}

#[tokio::test]
async fn every_endpoint_failing_is_reported_per_endpoint() {
    let transport = MemoryTransport::new();
    transport.refuse("amqp://a");
    transport.refuse("amqp://b");
    let broker = Broker::new(Arc::new(transport.clone()), config(&["amqp://a", "amqp://b"]));

    let error = broker
        .rpc_client("echo")
        .call::<_, String>("hello")
        .await
        .unwrap_err();

    let Error::Connection(courier_messaging::ConnectionError::AllEndpointsFailed(failures)) = error
    else {
        panic!("expected an aggregate connection failure, got {error:?}");
    };
    assert_eq!(failures.len(), 2);
    assert_eq!(broker.manager().state(), ConnectionState::Disconnected);

    transport.accept("amqp://b");
    assert!(broker.manager().connect().await.is_ok());
}

#[tokio::test]
async fn components_share_one_connection() {
    let transport = MemoryTransport::new();
    let broker = Broker::new(Arc::new(transport.clone()), BrokerConfig::default());

    let rpc = broker.rpc_server("a");
    rpc.consume(Arc::new(echo));
    rpc.initialize().await.unwrap();

    let gathering = broker.gathering_server("b");
    gathering.consume(Arc::new(knows_everything));
    gathering.initialize().await.unwrap();

    let answer: Option<u32> = broker.gathering_client("b").gather(&7).await.unwrap();
    assert_eq!(answer, Some(7));
    let echoed: u32 = broker.rpc_client("a").call(&8).await.unwrap();
    assert_eq!(echoed, 8);

    assert_eq!(transport.dial_attempts().len(), 1);
}

#[tokio::test]
async fn close_releases_pending_calls_and_the_connection() {
    let transport = MemoryTransport::new();
    let broker = Broker::new(Arc::new(transport.clone()), BrokerConfig::default());
    let client = broker.rpc_client("nobody-listens");

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.call::<_, String>("anyone?").await }
    });
    while client.pending() == 0 {
        tokio::task::yield_now().await;
    }

    broker.close().await.unwrap();

    assert!(matches!(pending.await.unwrap(), Err(Error::Closed(name)) if name == "nobody-listens"));
    assert_eq!(broker.manager().state(), ConnectionState::Disconnected);
    broker.close().await.unwrap();
}

#[tokio::test]
async fn broker_side_close_is_forwarded_and_reconnects() {
    let transport = MemoryTransport::new();
    let broker = Broker::new(Arc::new(transport.clone()), BrokerConfig::default());
    let mut events = broker.manager().subscribe();

    broker.manager().channel().await.unwrap();
    assert!(matches!(
        events.recv().await.unwrap(),
        ConnectionEvent::Connected(_)
    ));

    transport.sever();
    let mut saw_error = false;
    loop {
        match events.recv().await.unwrap() {
            ConnectionEvent::Transport {
                event: TransportEvent::Error(_),
                ..
            } => saw_error = true,
            ConnectionEvent::Transport {
                scope: EventScope::Connection,
                event: TransportEvent::Close,
            } => break,
            _ => {}
        }
    }
    assert!(saw_error);

    while broker.manager().state() != ConnectionState::Disconnected {
        tokio::task::yield_now().await;
    }
    broker.manager().channel().await.unwrap();
    assert_eq!(transport.dial_attempts().len(), 2);
}
